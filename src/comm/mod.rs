// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The protocol layer: packets, payloads, routing envelopes and their wire
//! codec. No runtime machinery lives here.

/// Framework error codes and the contents error type.
pub mod error;
/// The wire envelope encoder/decoder.
pub mod frame;
/// The packet value handed to user handlers.
pub mod packet;
/// Reference counted payload buffers and their pool.
pub mod payload;
/// The inter-server addressing envelope.
pub mod route;

pub use error::{ContentsError, ContentsResult, ErrorCode, APPLICATION_ERROR_BASE};
pub use packet::{Packet, MAX_MSG_ID_LEN};
pub use payload::{BufferPool, Payload};
pub use route::{RouteHeader, RoutePacket};

/// Keepalive, no reply expected.
pub const HEARTBEAT_MSG_ID: &str = "@Heart@Beat@";
/// Diagnostic echo.
pub const DEBUG_MSG_ID: &str = "@Debug@";
/// Synthetic reply produced by the request cache on deadline.
pub const TIMEOUT_MSG_ID: &str = "@Timeout@";
/// Service discovery fanout body.
pub const SERVER_INFO_MSG_ID: &str = "@ServerInfo@";
/// Stage lifecycle: create a stage on a Play server.
pub const CREATE_STAGE_MSG_ID: &str = "@CreateStage@";
/// Stage lifecycle: join an actor to a stage.
pub const JOIN_STAGE_MSG_ID: &str = "@JoinStage@";
/// Stage lifecycle: remove an actor from a stage.
pub const LEAVE_STAGE_MSG_ID: &str = "@LeaveStage@";
/// Stage lifecycle: destroy a stage.
pub const DESTROY_STAGE_MSG_ID: &str = "@DestroyStage@";
/// Session loss propagated from the edge.
pub const DISCONNECT_MSG_ID: &str = "@Disconnect@";

/// Whether a message id belongs to the framework-reserved set.
pub fn is_base_msg_id(msg_id: &str) -> bool {
    matches!(
        msg_id,
        HEARTBEAT_MSG_ID
            | DEBUG_MSG_ID
            | TIMEOUT_MSG_ID
            | SERVER_INFO_MSG_ID
            | CREATE_STAGE_MSG_ID
            | JOIN_STAGE_MSG_ID
            | LEAVE_STAGE_MSG_ID
            | DESTROY_STAGE_MSG_ID
            | DISCONNECT_MSG_ID
    )
}
