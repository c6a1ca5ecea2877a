// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The addressing envelope carried with inter-server traffic.

use super::{packet::Packet, payload::Payload};

/// Routing envelope for one hop across the mesh.
#[derive(Debug, Clone, Default)]
pub struct RouteHeader {
    /// Numeric id of the originating service.
    pub service_id: u16,
    /// The message id, at most 255 UTF-8 bytes.
    pub msg_id: String,
    /// Request sequence; 0 for notifications.
    pub msg_seq: u16,
    /// Target stage, when routed to a Play service.
    pub stage_id: i64,
    /// Session id of the originating client connection, 0 if none.
    pub sid: u64,
    /// Server id of the sender.
    pub from: String,
    /// Server id of the receiver; empty means broadcast eligible.
    pub to: String,
    /// Account bound to the originating session, empty if unauthenticated.
    pub account_id: String,
    /// Error code on replies; 0 is success.
    pub error_code: u16,
    /// Framework message rather than user content.
    pub is_base: bool,
    /// Reply correlated by `(from, msg_seq)`.
    pub is_reply: bool,
    /// Set the first time the header leaves its origin server; forwarded
    /// packets are never routed onward again.
    pub is_forwarded: bool,
}

impl RouteHeader {
    /// Header for the reply to this message, swapping direction and carrying
    /// the sequence back.
    pub fn reply_header(&self, error_code: u16) -> RouteHeader {
        RouteHeader {
            service_id: self.service_id,
            msg_id: self.msg_id.clone(),
            msg_seq: self.msg_seq,
            stage_id: self.stage_id,
            sid: self.sid,
            from: self.to.clone(),
            to: self.from.clone(),
            account_id: self.account_id.clone(),
            error_code,
            is_base: self.is_base,
            is_reply: true,
            is_forwarded: false,
        }
    }
}

/// A route header plus one payload reference: the unit moving across the mesh.
#[derive(Debug, Clone)]
pub struct RoutePacket {
    /// The addressing envelope.
    pub header: RouteHeader,
    /// The carried bytes.
    pub payload: Payload,
}

impl RoutePacket {
    /// Construct from a header and an owned payload reference.
    pub fn new(header: RouteHeader, payload: Payload) -> Self {
        Self { header, payload }
    }

    /// Wrap an existing packet without copying: the route packet acquires its
    /// own reference on the packet's payload.
    pub fn of(header: RouteHeader, packet: &Packet) -> Self {
        Self {
            header,
            payload: packet.payload().clone(),
        }
    }

    /// Convert into the packet form handed to user handlers, moving the
    /// payload reference.
    pub fn into_packet(self) -> Packet {
        let mut packet = Packet::base(&self.header.msg_id, self.payload);
        packet.set_msg_seq(self.header.msg_seq);
        packet.set_stage_id(self.header.stage_id);
        packet.set_error_code(self.header.error_code);
        packet
    }
}
