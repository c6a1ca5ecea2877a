// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The inter-server mesh: one outbound link per peer, one inbound listener,
//! and the demultiplexer that turns envelopes into dispatcher work.

use crate::{
    app::{
        api::ApiDispatcher,
        config::{ServerConfig, ServiceType},
        play::PlayDispatcher,
        request::RequestCache,
        system::SystemHandler,
    },
    comm::{BufferPool, ContentsError, ContentsResult, ErrorCode, Payload, RoutePacket},
};
use discovery::{epoch_ms, ServerInfo, ServerRegistry, ServerState};
use link::Link;
use log::*;
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Mutex, RwLock},
    sync::Arc,
};

/// Service discovery registry and heartbeat bookkeeping.
pub mod discovery;
pub(crate) mod link;
pub(crate) mod listener;

/// Dispatch targets, installed once the server wires its dispatchers.
#[derive(Default)]
pub(crate) struct Targets {
    pub play: Option<Arc<PlayDispatcher>>,
    pub api: Option<Arc<ApiDispatcher>>,
    pub system: Option<Arc<SystemHandler>>,
}

/// The mesh communicator: owns the peer link table and routes every inbound
/// envelope to the request cache, the system handler, or a dispatcher.
pub(crate) struct Communicator {
    config: Arc<ServerConfig>,
    registry: Arc<ServerRegistry>,
    request_cache: Arc<RequestCache>,
    buffer_pool: Arc<BufferPool>,
    links: Mutex<HashMap<String, Arc<Link>>>,
    targets: RwLock<Targets>,
    advertised: RwLock<String>,
}

impl Communicator {
    pub fn new(
        config: Arc<ServerConfig>,
        registry: Arc<ServerRegistry>,
        request_cache: Arc<RequestCache>,
        buffer_pool: Arc<BufferPool>,
    ) -> Arc<Self> {
        let advertised = RwLock::new(config.bind_endpoint.clone());
        Arc::new(Self {
            config,
            registry,
            request_cache,
            buffer_pool,
            links: Mutex::new(HashMap::new()),
            targets: RwLock::new(Targets::default()),
            advertised,
        })
    }

    pub fn install(&self, targets: Targets) {
        *self.targets.write().expect("communicator targets poisoned") = targets;
    }

    /// Record the actually bound mesh endpoint (relevant with port 0).
    pub fn set_advertised(&self, endpoint: String) {
        *self.advertised.write().expect("communicator state poisoned") = endpoint;
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    pub fn max_packet_bytes(&self) -> usize {
        self.config.max_packet_bytes
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    /// This server's identity as advertised to peers.
    pub fn own_info(&self) -> ServerInfo {
        ServerInfo {
            server_id: self.config.server_id.clone(),
            service_id: self.config.service_id,
            service_type: self.config.service_type,
            bind_endpoint: self.advertised.read().expect("communicator state poisoned").clone(),
            last_heartbeat_at: epoch_ms(),
            state: ServerState::Running,
        }
    }

    /// Send one envelope to the server named in its header. Sends to self
    /// short-circuit into the local demultiplexer, still correlated through
    /// the request cache.
    pub async fn send(self: &Arc<Self>, mut packet: RoutePacket) -> ContentsResult<()> {
        if packet.header.to == self.config.server_id {
            let communicator = self.clone();
            tokio::spawn(async move { communicator.demux(packet).await });
            return Ok(());
        }
        if packet.header.is_forwarded && packet.header.from != self.config.server_id {
            warn!(
                "routing loop: {} already forwarded by {}, dropped",
                packet.header.msg_id, packet.header.from
            );
            return Err(ContentsError::new(ErrorCode::SystemError, "routing loop"));
        }
        if packet.header.from == self.config.server_id {
            packet.header.is_forwarded = true;
        }
        let endpoint = self
            .registry
            .running_endpoint(&packet.header.to)
            .ok_or_else(|| ContentsError::new(ErrorCode::ServerNotFound, format!("no server {}", packet.header.to)))?;
        self.send_to_endpoint(&endpoint, packet).await
    }

    /// Send one envelope straight to an endpoint; used by discovery before a
    /// peer's id is known.
    pub async fn send_to_endpoint(&self, endpoint: &str, packet: RoutePacket) -> ContentsResult<()> {
        let link = self.resolve_link(endpoint);
        link.push(packet)
            .await
            .map_err(|e| ContentsError::new(ErrorCode::SystemError, e.to_string()))
    }

    fn resolve_link(&self, endpoint: &str) -> Arc<Link> {
        let mut links = self.links.lock().expect("link table poisoned");
        links
            .entry(endpoint.to_owned())
            .or_insert_with(|| Link::open(endpoint.to_owned(), self.config.link_high_water, self.config.link_hard_cap))
            .clone()
    }

    /// Tear down every link; used at shutdown.
    pub fn close_links(&self) {
        let mut links = self.links.lock().expect("link table poisoned");
        for (_, link) in links.drain() {
            link.close();
        }
    }

    /// Tear down the link to one endpoint; a later send reopens it.
    pub fn drop_link(&self, endpoint: &str) {
        let link = self.links.lock().expect("link table poisoned").remove(endpoint);
        if let Some(link) = link {
            info!("dropping link to {}", link.endpoint());
            link.close();
        }
    }

    /// Route one inbound envelope: replies to the request cache, system
    /// messages to the system handler, everything else to the dispatcher this
    /// server runs.
    pub fn demux(self: &Arc<Self>, packet: RoutePacket) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let this = self.clone();
        Box::pin(async move {
            let header = &packet.header;
            if header.is_reply && header.msg_seq > 0 {
                let msg_seq = header.msg_seq;
                if !this.request_cache.try_complete(msg_seq, packet) {
                    debug!("late reply for seq {} dropped", msg_seq);
                }
                return;
            }
            if header.is_base && SystemHandler::handles(&header.msg_id) {
                let system = this.targets.read().expect("communicator targets poisoned").system.clone();
                match system {
                    Some(system) => system.handle(packet).await,
                    None => warn!("system message {} before wiring, dropped", header.msg_id),
                }
                return;
            }
            match this.config.service_type {
                ServiceType::Play => {
                    let play = this.targets.read().expect("communicator targets poisoned").play.clone();
                    match play {
                        Some(play) => play.dispatch(packet).await,
                        None => this.reject(packet).await,
                    }
                }
                ServiceType::Api => {
                    let api = this.targets.read().expect("communicator targets poisoned").api.clone();
                    match api {
                        Some(api) => api.dispatch(packet),
                        None => this.reject(packet).await,
                    }
                }
                ServiceType::Session => this.reject(packet).await,
            }
        })
    }

    /// Error-reply a request that reached a server with no dispatcher for it;
    /// notifications are dropped.
    async fn reject(self: &Arc<Self>, packet: RoutePacket) {
        warn!("no dispatcher for inbound {} on {}", packet.header.msg_id, self.config.server_id);
        if packet.header.msg_seq > 0 && !packet.header.from.is_empty() {
            let header = packet.header.reply_header(ErrorCode::SystemError.into());
            self.send(RoutePacket::new(header, Payload::empty())).await.ok();
        }
    }
}

/// Spawn the heartbeat publisher and the liveness sweeper.
pub(crate) fn spawn_discovery(communicator: &Arc<Communicator>) -> Vec<tokio::task::JoinHandle<()>> {
    let publisher = {
        let communicator = communicator.clone();
        tokio::spawn(async move {
            loop {
                publish_heartbeat(&communicator).await;
                tokio::time::sleep(communicator.config.heartbeat_interval).await;
            }
        })
    };
    let sweeper = {
        let communicator = communicator.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(communicator.config.heartbeat_interval).await;
                let timeout_ms = communicator.config.heartbeat_timeout.as_millis() as u64;
                for endpoint in communicator.registry.sweep(epoch_ms(), timeout_ms) {
                    info!("peer at {} went quiet, disabling", endpoint);
                    communicator.drop_link(&endpoint);
                }
            }
        })
    };
    vec![publisher, sweeper]
}

async fn publish_heartbeat(communicator: &Arc<Communicator>) {
    let own = communicator.own_info();
    // keep ourselves fresh in the registry so the sweeper never disables us
    communicator.registry.upsert(own.clone());
    let body = match serde_json::to_vec(&own) {
        Ok(body) => body,
        Err(e) => {
            error!("failed to serialize server info: {}", e);
            return;
        }
    };
    let mut endpoints = communicator.registry.known_endpoints();
    endpoints.extend(communicator.config.seeds.iter().cloned());
    endpoints.sort();
    endpoints.dedup();
    for endpoint in endpoints {
        if endpoint == own.bind_endpoint {
            continue;
        }
        let packet = SystemHandler::server_info_packet(&communicator.config, body.clone(), false);
        communicator.send_to_endpoint(&endpoint, packet).await.ok();
    }
}
