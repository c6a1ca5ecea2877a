// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The runtime layer: dispatchers, mesh, pool, timers and the two server
//! front doors.

/// The API dispatcher and its registration surface.
pub mod api;
/// Server configuration.
pub mod config;
/// The inter-server mesh and service discovery.
pub mod mesh;
/// Stages, actors and the Play dispatcher.
pub mod play;
/// The elastic worker pool.
pub mod pool;
/// Request/reply correlation.
pub mod request;
/// Sender façades' shared core.
pub mod sender;
/// The session edge contract.
pub mod session;
pub(crate) mod system;
/// The process-wide timer service.
pub mod timer;

pub use api::{ApiContext, ApiController, ApiMiddleware, ApiSender, HandlerRegister};
pub use config::{ServerConfig, ServiceType};
pub use mesh::discovery::{ServerInfo, ServerRegistry, ServerState};
pub use play::{Actor, ActorSender, BaseActor, Stage, StageSender};
pub use sender::SystemSender;
pub use session::SessionEdge;
pub use timer::TimerKind;

use crate::comm::{BufferPool, Packet};
use anyhow::ensure;
use api::ApiDispatcher;
use log::*;
use mesh::{Communicator, Targets};
use play::PlayDispatcher;
use pool::WorkerPool;
use request::RequestCache;
use sender::SenderCore;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use system::SystemHandler;
use tokio::{sync::mpsc, task::JoinHandle};

struct Wiring {
    config: Arc<ServerConfig>,
    communicator: Arc<Communicator>,
    pool: Arc<WorkerPool>,
    request_cache: Arc<RequestCache>,
    core: Arc<SenderCore>,
}

/// Everything both server kinds share: pool, cache, mesh, sender core.
fn wire(config: ServerConfig) -> Wiring {
    let config = Arc::new(config);
    let buffer_pool = BufferPool::new(config.max_packet_bytes);
    let request_cache = RequestCache::new();
    let registry = Arc::new(mesh::discovery::ServerRegistry::new());
    let communicator = Communicator::new(config.clone(), registry, request_cache.clone(), buffer_pool);
    let pool = WorkerPool::new(config.worker_min, config.worker_max, config.pool_idle_timeout);
    let core = SenderCore::new(config.clone(), communicator.clone(), request_cache.clone());
    Wiring {
        config,
        communicator,
        pool,
        request_cache,
        core,
    }
}

/// Bind the mesh listener and start discovery; returns the spawned tasks.
async fn open_mesh(wiring: &Wiring) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let (local_addr, listener) =
        mesh::listener::start(&wiring.config.bind_endpoint, wiring.communicator.clone()).await?;
    let advertised = if wiring.config.bind_endpoint.ends_with(":0") {
        local_addr.to_string()
    } else {
        wiring.config.bind_endpoint.clone()
    };
    info!("{} listening on {}", wiring.config.server_id, advertised);
    wiring.communicator.set_advertised(advertised);
    let mut tasks = mesh::spawn_discovery(&wiring.communicator);
    tasks.push(listener);
    Ok(tasks)
}

enum Ingest {
    Packet(u64, Packet),
    Disconnect(u64),
}

/// Builds a Play server: stage types, the session edge, then `start`.
pub struct PlayServerBuilder {
    config: ServerConfig,
    stages: Vec<(
        String,
        Arc<dyn Fn() -> Box<dyn Stage> + Send + Sync>,
        Arc<dyn Fn() -> Box<dyn play::Actor> + Send + Sync>,
    )>,
    edge: Option<Arc<dyn SessionEdge>>,
}

impl PlayServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            stages: Vec::new(),
            edge: None,
        }
    }

    /// Register a stage type with its stage and actor factories.
    pub fn stage<SF, S, AF, A>(mut self, stage_type: impl Into<String>, stage_factory: SF, actor_factory: AF) -> Self
    where
        SF: Fn() -> S + Send + Sync + 'static,
        S: Stage,
        AF: Fn() -> A + Send + Sync + 'static,
        A: play::Actor,
    {
        self.stages.push((
            stage_type.into(),
            Arc::new(move || Box::new(stage_factory()) as Box<dyn Stage>),
            Arc::new(move || Box::new(actor_factory()) as Box<dyn play::Actor>),
        ));
        self
    }

    /// Attach the session edge implementation.
    pub fn session_edge(mut self, edge: Arc<dyn SessionEdge>) -> Self {
        self.edge.replace(edge);
        self
    }

    /// Wire everything and open the mesh.
    pub async fn start(self) -> anyhow::Result<PlayServer> {
        ensure!(
            self.config.service_type == ServiceType::Play,
            "play server requires a Play service type"
        );
        ensure!(!self.stages.is_empty(), "play server without stage types");
        let wiring = wire(self.config);
        let play = PlayDispatcher::new(wiring.config.clone(), wiring.core.clone(), wiring.pool.clone());
        for (stage_type, stage_factory, actor_factory) in self.stages {
            play.register_stage_type(stage_type, stage_factory, actor_factory);
        }
        if let Some(edge) = self.edge {
            wiring.core.set_edge(edge);
        }
        let system = SystemHandler::new(&wiring.communicator);
        wiring.communicator.install(Targets {
            play: Some(play.clone()),
            api: None,
            system: Some(system),
        });
        let mut tasks = open_mesh(&wiring).await?;

        // one ordered intake lane keeps per-session arrival order intact
        let (ingest, mut intake) = mpsc::unbounded_channel::<Ingest>();
        {
            let play = play.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(item) = intake.recv().await {
                    match item {
                        Ingest::Packet(sid, packet) => play.handle_client_packet(sid, packet).await,
                        Ingest::Disconnect(sid) => play.handle_session_disconnect(sid),
                    }
                }
            }));
        }

        let endpoint = wiring.communicator.own_info().bind_endpoint;
        Ok(PlayServer {
            config: wiring.config,
            communicator: wiring.communicator,
            pool: wiring.pool,
            request_cache: wiring.request_cache,
            core: wiring.core,
            play,
            ingest,
            endpoint,
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
        })
    }
}

/// A running Play server.
pub struct PlayServer {
    config: Arc<ServerConfig>,
    communicator: Arc<Communicator>,
    pool: Arc<WorkerPool>,
    request_cache: Arc<RequestCache>,
    core: Arc<SenderCore>,
    play: Arc<PlayDispatcher>,
    ingest: mpsc::UnboundedSender<Ingest>,
    endpoint: String,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl PlayServer {
    /// Start building a Play server from its configuration.
    pub fn builder(config: ServerConfig) -> PlayServerBuilder {
        PlayServerBuilder::new(config)
    }

    /// This server's id.
    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    /// The mesh endpoint peers reach this server on.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The discovery read view.
    pub fn registry(&self) -> Arc<ServerRegistry> {
        self.communicator.registry().clone()
    }

    /// A server-level sender for bootstrap and system work.
    pub fn sender(&self) -> SystemSender {
        SystemSender::new(self.core.clone())
    }

    /// Number of live stages.
    pub fn stage_count(&self) -> usize {
        self.play.stage_count()
    }

    /// The session edge hands an inbound client packet to the core; the core
    /// owns it from here.
    pub fn handle_packet(&self, sid: u64, packet: Packet) {
        if self.stopped.load(Ordering::SeqCst) {
            debug!("client packet after shutdown dropped");
            return;
        }
        self.ingest.send(Ingest::Packet(sid, packet)).ok();
    }

    /// The session edge reports a lost client connection.
    pub fn handle_disconnect(&self, sid: u64) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        self.ingest.send(Ingest::Disconnect(sid)).ok();
    }

    /// Graceful, idempotent shutdown: stop intake, stop the mesh, destroy
    /// stages, cancel outstanding requests, drain the pool, drop the links.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{} shutting down", self.config.server_id);
        for task in self.tasks.lock().expect("server tasks poisoned").drain(..) {
            task.abort();
        }
        self.play.destroy_all();
        self.request_cache.cancel_all();
        self.pool.shutdown();
        self.communicator.close_links();
    }
}

/// Builds an Api server: controllers, middleware, then `start`.
pub struct ApiServerBuilder {
    config: ServerConfig,
    controllers: Vec<Arc<dyn ApiController>>,
    middlewares: Vec<Arc<dyn ApiMiddleware>>,
}

impl ApiServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            controllers: Vec::new(),
            middlewares: Vec::new(),
        }
    }

    /// Register a controller; its handlers bind at start.
    pub fn controller(mut self, controller: Arc<dyn ApiController>) -> Self {
        self.controllers.push(controller);
        self
    }

    /// Append a middleware; they run in registration order.
    pub fn middleware(mut self, middleware: Arc<dyn ApiMiddleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Wire everything and open the mesh.
    pub async fn start(self) -> anyhow::Result<ApiServer> {
        ensure!(
            self.config.service_type == ServiceType::Api,
            "api server requires an Api service type"
        );
        let wiring = wire(self.config);
        let api = ApiDispatcher::new(wiring.core.clone(), &self.controllers, self.middlewares);
        let system = SystemHandler::new(&wiring.communicator);
        wiring.communicator.install(Targets {
            play: None,
            api: Some(api),
            system: Some(system),
        });
        let tasks = open_mesh(&wiring).await?;
        let endpoint = wiring.communicator.own_info().bind_endpoint;
        Ok(ApiServer {
            config: wiring.config,
            communicator: wiring.communicator,
            pool: wiring.pool,
            request_cache: wiring.request_cache,
            core: wiring.core,
            endpoint,
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
        })
    }
}

/// A running Api server.
pub struct ApiServer {
    config: Arc<ServerConfig>,
    communicator: Arc<Communicator>,
    pool: Arc<WorkerPool>,
    request_cache: Arc<RequestCache>,
    core: Arc<SenderCore>,
    endpoint: String,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl ApiServer {
    /// Start building an Api server from its configuration.
    pub fn builder(config: ServerConfig) -> ApiServerBuilder {
        ApiServerBuilder::new(config)
    }

    /// This server's id.
    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    /// The mesh endpoint peers reach this server on.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The discovery read view.
    pub fn registry(&self) -> Arc<ServerRegistry> {
        self.communicator.registry().clone()
    }

    /// A server-level sender for bootstrap and system work.
    pub fn sender(&self) -> SystemSender {
        SystemSender::new(self.core.clone())
    }

    /// Graceful, idempotent shutdown, same order as the Play server.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{} shutting down", self.config.server_id);
        for task in self.tasks.lock().expect("server tasks poisoned").drain(..) {
            task.abort();
        }
        self.request_cache.cancel_all();
        self.pool.shutdown();
        self.communicator.close_links();
    }
}
