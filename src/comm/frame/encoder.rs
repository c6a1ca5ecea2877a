// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module implements the wire envelope encoder.

use super::{FLAG_BASE, FLAG_FORWARDED, FLAG_REPLY, MAX_BODY_LEN};
use crate::comm::{packet::MAX_MSG_ID_LEN, route::RoutePacket};
use anyhow::{bail, ensure};

/// Encode a route packet into a full frame: 4-byte little-endian body length
/// followed by the body.
pub fn encode(packet: &RoutePacket) -> anyhow::Result<Vec<u8>> {
    let header = &packet.header;
    ensure!(
        header.msg_id.len() <= MAX_MSG_ID_LEN,
        "msg id exceeds {} bytes: {}",
        MAX_MSG_ID_LEN,
        header.msg_id.len()
    );
    let body_len = 1
        + header.msg_id.len()
        + 2 // msg_seq
        + 8 // stage_id
        + 2 // service_id
        + 2 // error_code
        + 2 + header.from.len()
        + 2 + header.to.len()
        + 2 + header.account_id.len()
        + 1 // flags
        + 8 // sid
        + packet.payload.len();
    if body_len > MAX_BODY_LEN {
        bail!("frame body of {} bytes exceeds the {} limit", body_len, MAX_BODY_LEN);
    }

    let mut buffer = Vec::with_capacity(4 + body_len);
    buffer.extend(&(body_len as u32).to_le_bytes());
    buffer.push(header.msg_id.len() as u8);
    buffer.extend(header.msg_id.as_bytes());
    buffer.extend(&header.msg_seq.to_le_bytes());
    buffer.extend(&header.stage_id.to_le_bytes());
    buffer.extend(&header.service_id.to_le_bytes());
    buffer.extend(&header.error_code.to_le_bytes());
    encode_str(&mut buffer, &header.from)?;
    encode_str(&mut buffer, &header.to)?;
    encode_str(&mut buffer, &header.account_id)?;
    let mut flags = 0u8;
    if header.is_base {
        flags |= FLAG_BASE;
    }
    if header.is_reply {
        flags |= FLAG_REPLY;
    }
    if header.is_forwarded {
        flags |= FLAG_FORWARDED;
    }
    buffer.push(flags);
    buffer.extend(&header.sid.to_le_bytes());
    buffer.extend(packet.payload.view());
    Ok(buffer)
}

fn encode_str(buffer: &mut Vec<u8>, value: &str) -> anyhow::Result<()> {
    ensure!(value.len() <= u16::MAX as usize, "string field exceeds u16 length");
    buffer.extend(&(value.len() as u16).to_le_bytes());
    buffer.extend(value.as_bytes());
    Ok(())
}
