// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module implements the wire envelope decoder.

use super::{FLAG_BASE, FLAG_FORWARDED, FLAG_REPLY, MAX_BODY_LEN};
use crate::comm::{
    payload::{BufferPool, Payload},
    route::{RouteHeader, RoutePacket},
};
use anyhow::{anyhow, bail, ensure};
use std::convert::TryInto;

/// Decode one frame body (length prefix already stripped) into a route packet.
/// The payload is copied into a buffer rented from `pool`.
pub fn decode(body: &[u8], pool: &std::sync::Arc<BufferPool>) -> anyhow::Result<RoutePacket> {
    if body.len() > MAX_BODY_LEN {
        bail!("frame body of {} bytes exceeds the {} limit", body.len(), MAX_BODY_LEN);
    }
    let mut reader = Reader { body, at: 0 };
    let msg_id_len = reader.u8()? as usize;
    let msg_id = reader.str(msg_id_len)?;
    let msg_seq = reader.u16()?;
    let stage_id = reader.i64()?;
    let service_id = reader.u16()?;
    let error_code = reader.u16()?;
    let from = reader.prefixed_str()?;
    let to = reader.prefixed_str()?;
    let account_id = reader.prefixed_str()?;
    let flags = reader.u8()?;
    let sid = reader.u64()?;
    let payload = Payload::from_pool(pool, reader.rest());
    Ok(RoutePacket::new(
        RouteHeader {
            service_id,
            msg_id,
            msg_seq,
            stage_id,
            sid,
            from,
            to,
            account_id,
            error_code,
            is_base: flags & FLAG_BASE != 0,
            is_reply: flags & FLAG_REPLY != 0,
            is_forwarded: flags & FLAG_FORWARDED != 0,
        },
        payload,
    ))
}

struct Reader<'a> {
    body: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        ensure!(
            self.at + n <= self.body.len(),
            "truncated frame: need {} bytes at offset {}, body is {}",
            n,
            self.at,
            self.body.len()
        );
        let slice = &self.body[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }

    fn u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> anyhow::Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into()?))
    }

    fn u64(&mut self) -> anyhow::Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into()?))
    }

    fn i64(&mut self) -> anyhow::Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into()?))
    }

    fn str(&mut self, len: usize) -> anyhow::Result<String> {
        let bytes = self.take(len)?;
        Ok(std::str::from_utf8(bytes)
            .map_err(|e| anyhow!("invalid UTF-8 in string field: {}", e))?
            .to_owned())
    }

    fn prefixed_str(&mut self) -> anyhow::Result<String> {
        let len = self.u16()? as usize;
        self.str(len)
    }

    fn rest(&self) -> &'a [u8] {
        &self.body[self.at..]
    }
}
