// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The contract the TCP/WebSocket edge implements for the core.

use crate::comm::Packet;

/// Implemented by the session edge. Both calls are enqueue-only: they must
/// never block the dispatch path that invokes them.
pub trait SessionEdge: Send + Sync + 'static {
    /// Deliver a packet to the client connected as `sid`.
    fn send_client_reply(&self, sid: u64, packet: Packet);

    /// Close the client connection `sid`, surfacing `error_code` if the
    /// protocol allows.
    fn disconnect(&self, sid: u64, error_code: u16);
}
