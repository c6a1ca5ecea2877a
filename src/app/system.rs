// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Server-to-server control messages: discovery fanout, keepalive, debug echo.

use crate::{
    app::{
        config::ServerConfig,
        mesh::{discovery::epoch_ms, Communicator},
    },
    comm::{Payload, RouteHeader, RoutePacket, DEBUG_MSG_ID, HEARTBEAT_MSG_ID, SERVER_INFO_MSG_ID},
};
use log::*;
use std::sync::{Arc, Weak};

/// Handles the framework's server-to-server control messages.
pub(crate) struct SystemHandler {
    communicator: Weak<Communicator>,
}

impl SystemHandler {
    pub fn new(communicator: &Arc<Communicator>) -> Arc<Self> {
        Arc::new(Self {
            communicator: Arc::downgrade(communicator),
        })
    }

    /// Whether `msg_id` is one of the registered system messages.
    pub fn handles(msg_id: &str) -> bool {
        matches!(msg_id, SERVER_INFO_MSG_ID | HEARTBEAT_MSG_ID | DEBUG_MSG_ID)
    }

    /// Build a discovery fanout envelope carrying a serialized `ServerInfo`.
    pub fn server_info_packet(config: &ServerConfig, body: Vec<u8>, is_reply: bool) -> RoutePacket {
        RoutePacket::new(
            RouteHeader {
                service_id: config.service_id,
                msg_id: SERVER_INFO_MSG_ID.into(),
                from: config.server_id.clone(),
                is_base: true,
                is_reply,
                ..Default::default()
            },
            Payload::from_vec(body),
        )
    }

    pub async fn handle(&self, packet: RoutePacket) {
        let communicator = match self.communicator.upgrade() {
            Some(communicator) => communicator,
            None => return,
        };
        match packet.header.msg_id.as_str() {
            SERVER_INFO_MSG_ID => {
                let mut info: crate::app::mesh::discovery::ServerInfo =
                    match serde_json::from_slice(packet.payload.view()) {
                        Ok(info) => info,
                        Err(e) => {
                            warn!("undecodable server info from {}: {}", packet.header.from, e);
                            return;
                        }
                    };
                if info.server_id == communicator.server_id() {
                    return;
                }
                // liveness is judged on the local clock
                info.last_heartbeat_at = epoch_ms();
                let endpoint = info.bind_endpoint.clone();
                communicator.registry().upsert(info);
                if !packet.header.is_reply {
                    // answer the push with our own identity
                    if let Ok(body) = serde_json::to_vec(&communicator.own_info()) {
                        let reply = Self::server_info_packet(&communicator.config(), body, true);
                        communicator.send_to_endpoint(&endpoint, reply).await.ok();
                    }
                }
            }
            HEARTBEAT_MSG_ID => {
                debug!("keepalive from {}", packet.header.from);
            }
            DEBUG_MSG_ID => {
                if packet.header.msg_seq > 0 && !packet.header.from.is_empty() {
                    let header = packet.header.reply_header(0);
                    communicator.send(RoutePacket::new(header, packet.payload.clone())).await.ok();
                }
            }
            other => {
                warn!("unhandled system message {}, dropped", other);
            }
        }
    }
}
