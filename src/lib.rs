// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! PlayHouse: a distributed realtime game server framework.
//!
//! Application content lives in [`Stage`]s (long lived room-like entities
//! holding per-session [`Actor`]s) on Play servers, and in stateless
//! [`ApiController`]s on Api servers. The runtime routes every packet,
//! whether it came from a client, a peer server, a timer, or a deferred
//! blocking task, to exactly the right entity, and each stage processes its
//! messages one at a time.

/// The runtime layer: dispatchers, mesh, pool, timers, servers.
pub mod app;
/// The protocol layer: packets, payloads, envelopes, wire codec.
pub mod comm;

pub use app::{
    Actor, ActorSender, ApiContext, ApiController, ApiMiddleware, ApiSender, ApiServer, BaseActor,
    HandlerRegister, PlayServer, ServerConfig, ServerInfo, ServerRegistry, ServerState, ServiceType,
    SessionEdge, Stage, StageSender, SystemSender, TimerKind,
};
pub use comm::{
    BufferPool, ContentsError, ContentsResult, ErrorCode, Packet, Payload, RouteHeader, RoutePacket,
};
