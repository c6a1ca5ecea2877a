// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The packet value handed to and produced by user handlers.

use super::{
    error::{ContentsError, ContentsResult, ErrorCode},
    payload::Payload,
};

/// Maximum length of a message id in UTF-8 bytes; the wire encodes it with a
/// single length byte.
pub const MAX_MSG_ID_LEN: usize = 255;

/// One message: id, payload and the addressing fields that survive the hop to
/// user code. `msg_seq == 0` is a notification, `msg_seq > 0` expects a reply
/// carrying the same sequence. A packet owns one payload reference; dropping
/// the packet releases it.
#[derive(Debug, Clone)]
pub struct Packet {
    msg_id: String,
    msg_seq: u16,
    stage_id: i64,
    error_code: u16,
    payload: Payload,
}

impl Packet {
    /// Create a notification packet. The payload bytes are final here; there
    /// is no deferred serialization.
    pub fn new(msg_id: impl Into<String>, payload: Payload) -> ContentsResult<Self> {
        let msg_id = msg_id.into();
        if msg_id.len() > MAX_MSG_ID_LEN {
            return Err(ContentsError::new(
                ErrorCode::InvalidMessage,
                format!("msg id exceeds {} bytes: {}", MAX_MSG_ID_LEN, msg_id.len()),
            ));
        }
        if payload.len() > super::frame::MAX_BODY_LEN {
            return Err(ContentsError::new(
                ErrorCode::InvalidMessage,
                format!("payload of {} bytes exceeds the frame limit", payload.len()),
            ));
        }
        Ok(Self {
            msg_id,
            msg_seq: 0,
            stage_id: 0,
            error_code: 0,
            payload,
        })
    }

    /// Create a packet for a framework message id, which is known to be valid.
    pub(crate) fn base(msg_id: &str, payload: Payload) -> Self {
        debug_assert!(msg_id.len() <= MAX_MSG_ID_LEN);
        Self {
            msg_id: msg_id.to_owned(),
            msg_seq: 0,
            stage_id: 0,
            error_code: 0,
            payload,
        }
    }

    /// Mark the packet as a request carrying `msg_seq`; the session edge uses
    /// this when handing client requests to the core.
    pub fn with_seq(mut self, msg_seq: u16) -> Self {
        self.msg_seq = msg_seq;
        self
    }

    /// Address the packet at a stage.
    pub fn to_stage(mut self, stage_id: i64) -> Self {
        self.stage_id = stage_id;
        self
    }

    /// The message id.
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    /// The request sequence; 0 for notifications.
    pub fn msg_seq(&self) -> u16 {
        self.msg_seq
    }

    /// The stage this packet targets, when routed to a Play service.
    pub fn stage_id(&self) -> i64 {
        self.stage_id
    }

    /// The error code carried on replies; 0 is success.
    pub fn error_code(&self) -> u16 {
        self.error_code
    }

    /// Whether a reply with the same sequence is expected.
    pub fn is_request(&self) -> bool {
        self.msg_seq > 0
    }

    /// A read-only view of the payload bytes.
    pub fn view(&self) -> &[u8] {
        self.payload.view()
    }

    /// Borrow the payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Consume the packet, keeping its payload reference.
    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub(crate) fn set_msg_seq(&mut self, msg_seq: u16) {
        self.msg_seq = msg_seq;
    }

    pub(crate) fn set_stage_id(&mut self, stage_id: i64) {
        self.stage_id = stage_id;
    }

    pub(crate) fn set_error_code(&mut self, error_code: u16) {
        self.error_code = error_code;
    }
}
