// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The API dispatcher: a handler registry with a middleware chain, one
//! spawned task per inbound route, no per-entity serialization.

use crate::{
    app::sender::SenderCore,
    comm::{ContentsResult, ErrorCode, Packet, Payload, RouteHeader, RoutePacket},
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use log::*;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// The sender façade handed to API handlers; replies read the route header of
/// the request being handled.
pub struct ApiSender {
    core: Arc<SenderCore>,
    header: RouteHeader,
    replied: Arc<AtomicBool>,
}

impl ApiSender {
    fn new(core: Arc<SenderCore>, header: RouteHeader, replied: Arc<AtomicBool>) -> Self {
        Self { core, header, replied }
    }

    /// The id of this server.
    pub fn server_id(&self) -> &str {
        self.core.server_id()
    }

    /// The account bound to the inbound route, empty if none.
    pub fn account_id(&self) -> &str {
        &self.header.account_id
    }

    /// Reply to the request being handled. Replying twice, or to a
    /// notification, is a logged no-op.
    pub fn reply(&self, packet: Packet) {
        if self.header.msg_seq == 0 {
            warn!("reply to notification {}, dropped", self.header.msg_id);
            return;
        }
        if self.replied.swap(true, Ordering::SeqCst) {
            warn!("second reply to {}, dropped", self.header.msg_id);
            return;
        }
        self.core.reply_to(&self.header, packet);
    }

    /// Reply with an empty body carrying only an error code.
    pub fn reply_error(&self, error_code: u16) {
        let mut packet = Packet::base(&self.header.msg_id, Payload::empty());
        packet.set_error_code(error_code);
        self.reply(packet);
    }

    /// Fire a notification at another Api server, or this one.
    pub fn send_to_api(&self, server_id: &str, packet: Packet) -> ContentsResult<()> {
        self.core.send_packet(server_id, 0, "", false, packet)
    }

    /// Request/reply against an Api server; requests to this server's own id
    /// short-circuit locally but correlate the same way.
    pub async fn request_to_api(&self, server_id: &str, packet: Packet) -> ContentsResult<Packet> {
        self.core.request_packet(server_id, 0, "", false, packet).await
    }

    /// Fire a notification at a stage on a Play server.
    pub fn send_to_stage(
        &self,
        play_server_id: &str,
        stage_id: i64,
        account_id: &str,
        packet: Packet,
    ) -> ContentsResult<()> {
        self.core.send_packet(play_server_id, stage_id, account_id, false, packet)
    }

    /// Request/reply against a stage on a Play server.
    pub async fn request_to_stage(
        &self,
        play_server_id: &str,
        stage_id: i64,
        account_id: &str,
        packet: Packet,
    ) -> ContentsResult<Packet> {
        self.core
            .request_packet(play_server_id, stage_id, account_id, false, packet)
            .await
    }

    /// Ask a Play server to create a stage.
    pub async fn create_stage(
        &self,
        play_server_id: &str,
        stage_type: &str,
        stage_id: i64,
        packet: Packet,
    ) -> ContentsResult<Packet> {
        self.core.create_stage(play_server_id, stage_type, stage_id, packet).await
    }

    /// Fire a framework-level notification at another server.
    pub fn send_to_system(&self, server_id: &str, packet: Packet) -> ContentsResult<()> {
        self.core.send_packet(server_id, 0, "", true, packet)
    }

    /// Push a packet to the client behind the inbound route.
    pub fn send_to_client(&self, packet: Packet) -> ContentsResult<()> {
        self.core.send_to_client(&self.header.from, self.header.sid, packet)
    }
}

/// The context a handler runs with.
pub struct ApiContext {
    /// The sender façade scoped to the inbound route.
    pub sender: ApiSender,
}

type ApiHandler = Arc<dyn Fn(ApiContext, Packet) -> BoxFuture<'static, ContentsResult<()>> + Send + Sync>;

/// Collects `msg_id → handler` bindings at startup.
#[derive(Default)]
pub struct HandlerRegister {
    handlers: HashMap<String, ApiHandler>,
}

impl HandlerRegister {
    /// Bind a handler to a message id. Later bindings win, with a log.
    pub fn add<F, Fut>(&mut self, msg_id: impl Into<String>, handler: F)
    where
        F: Fn(ApiContext, Packet) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ContentsResult<()>> + Send + 'static,
    {
        let msg_id = msg_id.into();
        let wrapped: ApiHandler = Arc::new(move |ctx, packet| Box::pin(handler(ctx, packet)));
        if self.handlers.insert(msg_id.clone(), wrapped).is_some() {
            warn!("handler for {} re-registered", msg_id);
        }
    }
}

/// A unit of API content; registers its handlers once at startup.
pub trait ApiController: Send + Sync + 'static {
    /// Bind this controller's handlers.
    fn register_handlers(&self, register: &mut HandlerRegister);
}

/// Runs around every handler invocation, in registration order.
#[async_trait]
pub trait ApiMiddleware: Send + Sync + 'static {
    /// Before the handler; an error short-circuits the chain and becomes the
    /// reply code.
    async fn before(&self, header: &RouteHeader, packet: &Packet) -> ContentsResult<()>;

    /// After the handler, with its result.
    async fn after(&self, header: &RouteHeader, packet: &Packet, result: &ContentsResult<()>);
}

/// Dispatches inbound routes to registered handlers, each on its own task.
pub(crate) struct ApiDispatcher {
    core: Arc<SenderCore>,
    handlers: HashMap<String, ApiHandler>,
    middlewares: Vec<Arc<dyn ApiMiddleware>>,
}

impl ApiDispatcher {
    pub fn new(
        core: Arc<SenderCore>,
        controllers: &[Arc<dyn ApiController>],
        middlewares: Vec<Arc<dyn ApiMiddleware>>,
    ) -> Arc<Self> {
        let mut register = HandlerRegister::default();
        for controller in controllers {
            controller.register_handlers(&mut register);
        }
        Arc::new(Self {
            core,
            handlers: register.handlers,
            middlewares,
        })
    }

    /// Route one inbound envelope. Unknown ids error-reply requests and drop
    /// notifications; everything else runs concurrently.
    pub fn dispatch(self: &Arc<Self>, packet: RoutePacket) {
        let handler = match self.handlers.get(&packet.header.msg_id) {
            Some(handler) => handler.clone(),
            None => {
                if packet.header.msg_seq > 0 && !packet.header.is_reply {
                    self.core
                        .reply_error_to(&packet.header, ErrorCode::HandlerNotFound.into());
                } else {
                    warn!("no handler for {} and nobody waiting, dropped", packet.header.msg_id);
                }
                return;
            }
        };
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let header = packet.header.clone();
            let replied = Arc::new(AtomicBool::new(false));
            let content = packet.into_packet();
            let mut result = Ok(());
            for middleware in &dispatcher.middlewares {
                if let Err(e) = middleware.before(&header, &content).await {
                    result = Err(e);
                    break;
                }
            }
            if result.is_ok() {
                let ctx = ApiContext {
                    sender: ApiSender::new(dispatcher.core.clone(), header.clone(), replied.clone()),
                };
                result = handler(ctx, content.clone()).await;
            }
            for middleware in &dispatcher.middlewares {
                middleware.after(&header, &content, &result).await;
            }
            if let Err(e) = result {
                error!("handler {} failed: {}", header.msg_id, e);
                if header.msg_seq > 0 && !replied.swap(true, Ordering::SeqCst) {
                    let code = if e.code == 0 {
                        ErrorCode::UncheckedContentsError.into()
                    } else {
                        e.code
                    };
                    dispatcher.core.reply_error_to(&header, code);
                }
            }
        });
    }
}
