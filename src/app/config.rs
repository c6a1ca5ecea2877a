// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Server configuration and its chained builder.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The class of a server process.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    /// Hosts stages and actors.
    Play,
    /// Stateless request/reply handlers.
    Api,
    /// Client edge; never built by this crate, but discovered over the mesh.
    Session,
}

/// Configuration of one server process. `new` fills in the defaults; the
/// chained setters override them.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Unique id of this server within the cluster.
    pub server_id: String,
    /// Numeric id of the hosted service.
    pub service_id: u16,
    /// Which dispatcher this server runs.
    pub service_type: ServiceType,
    /// Server-to-server listen endpoint, `host:port`.
    pub bind_endpoint: String,
    /// Client listen endpoint, Play servers only.
    pub client_endpoint: Option<String>,
    /// Bootstrap peer endpoints contacted by the first heartbeat.
    pub seeds: Vec<String>,
    /// Deadline applied to outbound requests unless overridden per call.
    pub request_timeout: Duration,
    /// Interval between heartbeat publishes.
    pub heartbeat_interval: Duration,
    /// A peer missing heartbeats for this long is disabled.
    pub heartbeat_timeout: Duration,
    /// Upper bound on one wire frame body.
    pub max_packet_bytes: usize,
    /// Worker pool floor.
    pub worker_min: usize,
    /// Worker pool ceiling.
    pub worker_max: usize,
    /// Idle time after which a worker above the floor retires.
    pub pool_idle_timeout: Duration,
    /// Outbound link queue depth at which sends turn blocking.
    pub link_high_water: usize,
    /// Outbound link queue depth at which sends are dropped.
    pub link_hard_cap: usize,
}

impl ServerConfig {
    /// Create a configuration with defaults for everything but the identity.
    pub fn new(
        server_id: impl Into<String>,
        service_id: u16,
        service_type: ServiceType,
        bind_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            service_id,
            service_type,
            bind_endpoint: bind_endpoint.into(),
            client_endpoint: None,
            seeds: Vec::new(),
            request_timeout: Duration::from_millis(30_000),
            heartbeat_interval: Duration::from_millis(5_000),
            heartbeat_timeout: Duration::from_millis(15_000),
            max_packet_bytes: 2 * 1024 * 1024,
            worker_min: num_cpus::get(),
            worker_max: 1024,
            pool_idle_timeout: Duration::from_millis(30_000),
            link_high_water: 1024,
            link_hard_cap: 8192,
        }
    }

    /// Set the client listen endpoint; meaningful for Play servers.
    pub fn client_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.client_endpoint.replace(endpoint.into());
        self
    }

    /// Add one bootstrap peer endpoint.
    pub fn seed(mut self, endpoint: impl Into<String>) -> Self {
        self.seeds.push(endpoint.into());
        self
    }

    /// Set the default request deadline.
    pub fn request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout = Duration::from_millis(ms);
        self
    }

    /// Set the heartbeat publish interval; the disable timeout follows at
    /// three intervals unless set explicitly.
    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval = Duration::from_millis(ms);
        self.heartbeat_timeout = Duration::from_millis(ms * 3);
        self
    }

    /// Set the heartbeat disable timeout.
    pub fn heartbeat_timeout_ms(mut self, ms: u64) -> Self {
        self.heartbeat_timeout = Duration::from_millis(ms);
        self
    }

    /// Set the frame body limit.
    pub fn max_packet_bytes(mut self, bytes: usize) -> Self {
        self.max_packet_bytes = bytes;
        self
    }

    /// Set the worker pool bounds.
    pub fn workers(mut self, min: usize, max: usize) -> Self {
        self.worker_min = min.max(1);
        self.worker_max = max.max(self.worker_min);
        self
    }

    /// Set the idle time after which a worker above the floor retires.
    pub fn pool_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.pool_idle_timeout = Duration::from_millis(ms);
        self
    }

    /// Set the outbound link watermarks.
    pub fn link_watermarks(mut self, high_water: usize, hard_cap: usize) -> Self {
        self.link_high_water = high_water.max(1);
        self.link_hard_cap = hard_cap.max(self.link_high_water);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = ServerConfig::new("play-1", 2, ServiceType::Play, "127.0.0.1:0");
        assert_eq!(config.request_timeout, Duration::from_millis(30_000));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(5_000));
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(15_000));
        assert_eq!(config.max_packet_bytes, 2 * 1024 * 1024);
        assert!(config.worker_min >= 1);
    }

    #[test]
    fn heartbeat_timeout_follows_interval() {
        let config = ServerConfig::new("api-1", 1, ServiceType::Api, "127.0.0.1:0").heartbeat_interval_ms(100);
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(300));
    }
}
