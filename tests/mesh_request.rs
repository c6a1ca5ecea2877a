// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Inter-server behavior over real TCP: discovery, request/reply, timeouts,
//! peer loss, self connection, middleware.

mod common;

use async_trait::async_trait;
use common::{bytes_payload, EchoActor, EchoStage};
use playhouse::{
    ApiContext, ApiController, ApiMiddleware, ApiServer, ContentsResult, ErrorCode, HandlerRegister,
    Packet, Payload, PlayServer, RouteHeader, ServerInfo, ServerState, ServiceType,
};
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

struct PingController;

impl ApiController for PingController {
    fn register_handlers(&self, register: &mut HandlerRegister) {
        register.add("Ping", |ctx: ApiContext, packet: Packet| async move {
            ctx.sender.reply(Packet::new("Pong", packet.payload().clone())?);
            Ok(())
        });
        register.add("Loop", |ctx: ApiContext, packet: Packet| async move {
            // calls an endpoint this server itself hosts
            let own = ctx.sender.server_id().to_owned();
            let pong = ctx
                .sender
                .request_to_api(&own, Packet::new("Ping", packet.payload().clone())?)
                .await?;
            ctx.sender.reply(pong);
            Ok(())
        });
        register.add("Explode", |_ctx: ApiContext, _packet: Packet| async move {
            Err(playhouse::ContentsError::code(3_000, "no thanks"))
        });
    }
}

#[derive(Default)]
struct CountingMiddleware {
    before: AtomicU32,
    after: AtomicU32,
}

#[async_trait]
impl ApiMiddleware for CountingMiddleware {
    async fn before(&self, _header: &RouteHeader, _packet: &Packet) -> ContentsResult<()> {
        self.before.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn after(&self, _header: &RouteHeader, _packet: &Packet, _result: &ContentsResult<()>) {
        self.after.fetch_add(1, Ordering::SeqCst);
    }
}

async fn start_pair() -> (ApiServer, PlayServer, Arc<CountingMiddleware>) {
    common::init_logs();
    let play = PlayServer::builder(common::play_config("play-1"))
        .stage("echo", EchoStage::default, || EchoActor)
        .start()
        .await
        .unwrap();
    let middleware = Arc::new(CountingMiddleware::default());
    let api = ApiServer::builder(common::api_config("api-1").seed(play.endpoint()))
        .controller(Arc::new(PingController))
        .middleware(middleware.clone())
        .start()
        .await
        .unwrap();
    let api_registry = api.registry();
    let play_registry = play.registry();
    common::wait_until(
        || api_registry.get("play-1").is_some() && play_registry.get("api-1").is_some(),
        Duration::from_secs(3),
        "mutual discovery",
    )
    .await;
    (api, play, middleware)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn create_and_echo_across_the_mesh() {
    let (api, play, _middleware) = start_pair().await;
    let sender = api.sender();
    sender
        .create_stage("play-1", "echo", 7, Packet::new("Setup", Payload::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(play.stage_count(), 1);
    let reply = sender
        .request_to_stage("play-1", 7, "", Packet::new("Echo", bytes_payload(b"over the wire")).unwrap())
        .await
        .unwrap();
    assert_eq!(reply.msg_id(), "EchoReply");
    assert_eq!(reply.view(), b"over the wire");
    api.shutdown().await;
    play.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn api_round_trip_runs_the_middleware_chain() {
    let (api, play, middleware) = start_pair().await;
    let reply = play
        .sender()
        .request_to_api("api-1", Packet::new("Ping", bytes_payload(b"x")).unwrap())
        .await
        .unwrap();
    assert_eq!(reply.msg_id(), "Pong");
    assert_eq!(middleware.before.load(Ordering::SeqCst), 1);
    assert_eq!(middleware.after.load(Ordering::SeqCst), 1);
    api.shutdown().await;
    play.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_api_handler_replies_handler_not_found() {
    let (api, play, _middleware) = start_pair().await;
    let err = play
        .sender()
        .request_to_api("api-1", Packet::new("NoSuch", Payload::empty()).unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::HandlerNotFound as u16);
    api.shutdown().await;
    play.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handler_error_travels_back_as_its_code() {
    let (api, play, _middleware) = start_pair().await;
    let err = play
        .sender()
        .request_to_api("api-1", Packet::new("Explode", Payload::empty()).unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.code, 3_000);
    api.shutdown().await;
    play.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn self_connection_short_circuits_but_still_correlates() {
    let (api, play, _middleware) = start_pair().await;
    let reply = play
        .sender()
        .request_to_api("api-1", Packet::new("Loop", bytes_payload(b"inner")).unwrap())
        .await
        .unwrap();
    assert_eq!(reply.msg_id(), "Pong");
    assert_eq!(reply.view(), b"inner");
    api.shutdown().await;
    play.shutdown().await;
}

fn epoch_ms_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn silent_peer_times_out_then_gets_disabled() {
    common::init_logs();
    // a listener that accepts and never answers
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            match silent.accept().await {
                // keep the socket open, read nothing back
                Ok((stream, _)) => held.push(stream),
                Err(_) => return,
            }
        }
    });

    let api = ApiServer::builder(common::api_config("api-1").request_timeout_ms(200))
        .controller(Arc::new(PingController))
        .start()
        .await
        .unwrap();
    api.registry().upsert(ServerInfo {
        server_id: "ghost".into(),
        service_id: 1,
        service_type: ServiceType::Api,
        bind_endpoint: silent_addr,
        last_heartbeat_at: epoch_ms_now(),
        state: ServerState::Running,
    });

    let started = Instant::now();
    let err = api
        .sender()
        .request_to_api("ghost", Packet::new("Ping", Payload::empty()).unwrap())
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert_eq!(err.code, ErrorCode::RequestTimeout as u16);
    assert!(elapsed >= Duration::from_millis(200), "early at {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(400), "late at {:?}", elapsed);

    // never heartbeats, so the sweeper disables it
    let registry = api.registry();
    common::wait_until(
        || registry.get("ghost").map(|info| info.state == ServerState::Disabled).unwrap_or(false),
        Duration::from_secs(3),
        "ghost peer disabled",
    )
    .await;
    let err = api
        .sender()
        .request_to_api("ghost", Packet::new("Ping", Payload::empty()).unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::ServerNotFound as u16);
    api.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn discovery_read_view_lists_peers_by_service() {
    let (api, play, _middleware) = start_pair().await;
    let plays = api.registry().servers_of(ServiceType::Play);
    assert_eq!(plays.len(), 1);
    assert_eq!(plays[0].server_id, "play-1");
    assert_eq!(plays[0].state, ServerState::Running);
    let first = api.registry().first_running(ServiceType::Play).unwrap();
    assert_eq!(first.server_id, "play-1");
    api.shutdown().await;
    play.shutdown().await;
}
