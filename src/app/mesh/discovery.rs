// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Best-effort service discovery: a heartbeat-fed registry of peer servers.

use crate::app::config::ServiceType;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::RwLock,
    time::{SystemTime, UNIX_EPOCH},
};

/// Liveness state of a discovered server.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerState {
    /// Accepting routes.
    Running,
    /// Alive but not accepting new work.
    Paused,
    /// Missed heartbeats; routes to it are rejected.
    Disabled,
}

/// One server's advertised identity, refreshed by heartbeats.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Unique id within the cluster.
    pub server_id: String,
    /// Numeric id of the hosted service.
    pub service_id: u16,
    /// The class of the server.
    pub service_type: ServiceType,
    /// Server-to-server endpoint peers connect to.
    pub bind_endpoint: String,
    /// Last heartbeat, epoch milliseconds.
    pub last_heartbeat_at: u64,
    /// Current liveness state.
    pub state: ServerState,
}

/// Current epoch milliseconds.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The process-local view of the cluster, keyed by server id. Heartbeats
/// upsert monotonically; the sweeper disables peers that went quiet.
pub struct ServerRegistry {
    servers: RwLock<HashMap<String, ServerInfo>>,
}

impl ServerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
        }
    }

    /// Merge one advertised info; stale heartbeats lose. Returns whether the
    /// entry was created or refreshed.
    pub fn upsert(&self, info: ServerInfo) -> bool {
        let mut servers = self.servers.write().expect("server registry poisoned");
        match servers.get_mut(&info.server_id) {
            Some(existing) => {
                if info.last_heartbeat_at < existing.last_heartbeat_at {
                    return false;
                }
                *existing = info;
            }
            None => {
                servers.insert(info.server_id.clone(), info);
            }
        }
        true
    }

    /// Look up one server.
    pub fn get(&self, server_id: &str) -> Option<ServerInfo> {
        self.servers.read().expect("server registry poisoned").get(server_id).cloned()
    }

    /// The endpoint of a server that is currently accepting routes.
    pub fn running_endpoint(&self, server_id: &str) -> Option<String> {
        let servers = self.servers.read().expect("server registry poisoned");
        servers
            .get(server_id)
            .filter(|info| info.state == ServerState::Running)
            .map(|info| info.bind_endpoint.clone())
    }

    /// Every known server of one service type, running or not.
    pub fn servers_of(&self, service_type: ServiceType) -> Vec<ServerInfo> {
        let servers = self.servers.read().expect("server registry poisoned");
        let mut found: Vec<ServerInfo> = servers
            .values()
            .filter(|info| info.service_type == service_type)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        found
    }

    /// The first running server of one service type, by server id order.
    pub fn first_running(&self, service_type: ServiceType) -> Option<ServerInfo> {
        self.servers_of(service_type)
            .into_iter()
            .find(|info| info.state == ServerState::Running)
    }

    /// Every known peer endpoint; the heartbeat loop fans out to these.
    pub fn known_endpoints(&self) -> Vec<String> {
        let servers = self.servers.read().expect("server registry poisoned");
        servers.values().map(|info| info.bind_endpoint.clone()).collect()
    }

    /// Disable peers whose last heartbeat is older than `timeout_ms`.
    /// Returns the endpoints of the peers disabled by this sweep.
    pub fn sweep(&self, now_ms: u64, timeout_ms: u64) -> Vec<String> {
        let mut servers = self.servers.write().expect("server registry poisoned");
        let mut dropped = Vec::new();
        for info in servers.values_mut() {
            if info.state != ServerState::Disabled && now_ms.saturating_sub(info.last_heartbeat_at) > timeout_ms {
                info.state = ServerState::Disabled;
                dropped.push(info.bind_endpoint.clone());
            }
        }
        dropped
    }
}
