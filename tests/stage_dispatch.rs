// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Stage dispatch behavior through the client edge: request/reply, per-stage
//! ordering, async blocks, the authentication gate.

mod common;

use async_trait::async_trait;
use common::{bytes_payload, u32_of, EchoActor, EchoStage, RecordingEdge};
use playhouse::{
    comm::JOIN_STAGE_MSG_ID, BaseActor, ContentsResult, ErrorCode, Packet, Payload, PlayServer,
    StageSender,
};
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

async fn start_echo_server(create_msg: &str) -> (PlayServer, Arc<RecordingEdge>) {
    common::init_logs();
    let edge = RecordingEdge::new();
    let server = PlayServer::builder(common::play_config("play-1"))
        .stage("echo", EchoStage::default, || EchoActor)
        .session_edge(edge.clone())
        .start()
        .await
        .unwrap();
    server
        .sender()
        .create_stage("play-1", "echo", 1, Packet::new(create_msg, Payload::empty()).unwrap())
        .await
        .unwrap();
    (server, edge)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echo_round_trip() {
    let (server, edge) = start_echo_server("Setup").await;
    let packet = Packet::new("Echo", bytes_payload(b"hi")).unwrap().with_seq(7).to_stage(1);
    server.handle_packet(7, packet);
    let replies = edge.wait_replies(1, Duration::from_secs(2)).await;
    let (sid, reply) = &replies[0];
    assert_eq!(*sid, 7);
    assert_eq!(reply.msg_id(), "EchoReply");
    assert_eq!(reply.msg_seq(), 7);
    assert_eq!(reply.error_code(), 0);
    assert_eq!(reply.view(), b"hi");
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_msg_id_gets_handler_not_found() {
    let (server, edge) = start_echo_server("Setup").await;
    let started = Instant::now();
    let packet = Packet::new("NoSuch", Payload::empty()).unwrap().with_seq(11).to_stage(1);
    server.handle_packet(3, packet);
    let replies = edge.wait_replies(1, Duration::from_secs(2)).await;
    let (_, reply) = &replies[0];
    assert_eq!(reply.msg_seq(), 11);
    assert_eq!(reply.error_code(), ErrorCode::HandlerNotFound as u16);
    assert!(started.elapsed() < Duration::from_millis(100));
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_stage_gets_stage_not_found() {
    let (server, edge) = start_echo_server("Setup").await;
    let packet = Packet::new("Echo", Payload::empty()).unwrap().with_seq(5).to_stage(999);
    server.handle_packet(3, packet);
    let replies = edge.wait_replies(1, Duration::from_secs(2)).await;
    assert_eq!(replies[0].1.error_code(), ErrorCode::StageNotFound as u16);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn thousand_appends_stay_serialized_and_ordered() {
    let (server, edge) = start_echo_server("Setup").await;
    for i in 1..=1_000u32 {
        let packet = Packet::new("Append", bytes_payload(&i.to_le_bytes()))
            .unwrap()
            .with_seq(i as u16)
            .to_stage(1);
        server.handle_packet(42, packet);
    }
    let replies = edge.wait_replies(1_000, Duration::from_secs(10)).await;
    for (i, (_, reply)) in replies.iter().enumerate() {
        assert_eq!(reply.msg_id(), "AppendReply");
        // the list length observed by request i proves handlers ran in
        // submission order with no overlap
        assert_eq!(u32_of(reply) as usize, i + 1);
    }
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_block_defers_but_holds_the_line() {
    let (server, edge) = start_echo_server("Setup").await;
    let started = Instant::now();
    server.handle_packet(9, Packet::new("Slow", Payload::empty()).unwrap().with_seq(1).to_stage(1));
    tokio::time::sleep(Duration::from_millis(10)).await;
    server.handle_packet(9, Packet::new("Append", bytes_payload(&7u32.to_le_bytes())).unwrap().with_seq(2).to_stage(1));
    let replies = edge.wait_replies(2, Duration::from_secs(2)).await;
    // the queued append only ran after the deferred reply went out
    assert_eq!(replies[0].1.msg_id(), "SlowReply");
    assert_eq!(u32_of(&replies[0].1), 42);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(replies[1].1.msg_id(), "AppendReply");
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handler_error_becomes_error_reply() {
    let (server, edge) = start_echo_server("Setup").await;
    server.handle_packet(4, Packet::new("Fail", Payload::empty()).unwrap().with_seq(9).to_stage(1));
    let replies = edge.wait_replies(1, Duration::from_secs(2)).await;
    assert_eq!(replies[0].1.error_code(), 2_000);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejected_creation_reports_and_removes_the_stage() {
    common::init_logs();
    let edge = RecordingEdge::new();
    let server = PlayServer::builder(common::play_config("play-1"))
        .stage("echo", EchoStage::default, || EchoActor)
        .session_edge(edge.clone())
        .start()
        .await
        .unwrap();
    let err = server
        .sender()
        .create_stage("play-1", "echo", 1, Packet::new("RejectMe", Payload::empty()).unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::StageCreationFailed as u16);
    assert_eq!(server.stage_count(), 0);
    // unregistered types are refused outright
    let err = server
        .sender()
        .create_stage("play-1", "lobby", 2, Packet::new("Setup", Payload::empty()).unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidStageType as u16);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_stage_id_is_refused() {
    let (server, _edge) = start_echo_server("Setup").await;
    let err = server
        .sender()
        .create_stage("play-1", "echo", 1, Packet::new("Setup", Payload::empty()).unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::StageAlreadyExists as u16);
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stage_timer_ticks_under_serialization() {
    let (server, edge) = start_echo_server("StartTicking").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    server.handle_packet(2, Packet::new("Ticks", Payload::empty()).unwrap().with_seq(1).to_stage(1));
    let replies = edge.wait_replies(1, Duration::from_secs(2)).await;
    let ticks = u32_of(&replies[0].1);
    assert!(ticks >= 3, "only {} ticks in 200ms", ticks);
    server.shutdown().await;
}

/// Records which dispatch shape ran, with a per-test recorder injected into
/// the factory.
struct ProbeStage {
    events: Arc<Mutex<Vec<String>>>,
    authenticate: bool,
}

#[async_trait]
impl playhouse::Stage for ProbeStage {
    async fn on_create(&mut self, _sender: &mut StageSender, _packet: Packet) -> ContentsResult<bool> {
        Ok(true)
    }

    async fn on_authenticate(
        &mut self,
        _sender: &mut StageSender,
        actor: &mut BaseActor,
        _packet: Packet,
    ) -> ContentsResult<()> {
        self.events.lock().unwrap().push("authenticate".into());
        if self.authenticate {
            let sid = actor.sender().sid();
            actor.sender().set_account_id(format!("acct-{}", sid));
        }
        Ok(())
    }

    async fn on_post_authenticate(
        &mut self,
        _sender: &mut StageSender,
        actor: &mut BaseActor,
    ) -> ContentsResult<()> {
        self.events.lock().unwrap().push(format!("post-auth:{}", actor.account_id()));
        Ok(())
    }

    async fn on_dispatch(
        &mut self,
        sender: &mut StageSender,
        actor: Option<&mut BaseActor>,
        packet: Packet,
    ) -> ContentsResult<()> {
        let shape = match actor {
            Some(actor) => format!("dispatch:{}", actor.account_id()),
            None => "dispatch:none".into(),
        };
        self.events.lock().unwrap().push(shape);
        if packet.is_request() {
            sender.reply(Packet::new("ProbeReply", Payload::empty())?);
        }
        Ok(())
    }

    async fn on_disconnect(&mut self, _sender: &mut StageSender, actor: &mut BaseActor) -> ContentsResult<()> {
        self.events.lock().unwrap().push(format!("disconnect:{}", actor.account_id()));
        Ok(())
    }
}

async fn start_probe_server(authenticate: bool) -> (PlayServer, Arc<RecordingEdge>, Arc<Mutex<Vec<String>>>) {
    common::init_logs();
    let edge = RecordingEdge::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let factory_events = events.clone();
    let server = PlayServer::builder(common::play_config("play-1"))
        .stage(
            "probe",
            move || ProbeStage {
                events: factory_events.clone(),
                authenticate,
            },
            || EchoActor,
        )
        .session_edge(edge.clone())
        .start()
        .await
        .unwrap();
    server
        .sender()
        .create_stage("play-1", "probe", 1, Packet::new("Setup", Payload::empty()).unwrap())
        .await
        .unwrap();
    (server, edge, events)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn join_binds_the_actor_and_disconnect_removes_it() {
    let (server, edge, events) = start_probe_server(true).await;
    server.handle_packet(5, Packet::new(JOIN_STAGE_MSG_ID, Payload::empty()).unwrap().with_seq(1).to_stage(1));
    let replies = edge.wait_replies(1, Duration::from_secs(2)).await;
    assert_eq!(replies[0].1.error_code(), 0);

    server.handle_packet(5, Packet::new("Poke", Payload::empty()).unwrap().with_seq(2).to_stage(1));
    edge.wait_replies(2, Duration::from_secs(2)).await;

    server.handle_disconnect(5);
    common::wait_until(
        || events.lock().unwrap().iter().any(|e| e == "disconnect:acct-5"),
        Duration::from_secs(2),
        "disconnect event",
    )
    .await;

    // with the actor gone the same session is back to the server form
    server.handle_packet(5, Packet::new("Poke", Payload::empty()).unwrap().with_seq(3).to_stage(1));
    edge.wait_replies(3, Duration::from_secs(2)).await;

    let events = events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "authenticate",
            "post-auth:acct-5",
            "dispatch:acct-5",
            "disconnect:acct-5",
            "dispatch:none",
        ]
    );
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_account_after_authentication_closes_the_session() {
    let (server, edge, events) = start_probe_server(false).await;
    server.handle_packet(6, Packet::new(JOIN_STAGE_MSG_ID, Payload::empty()).unwrap().with_seq(1).to_stage(1));
    let (sid, code) = edge.wait_disconnect(Duration::from_secs(2)).await;
    assert_eq!(sid, 6);
    assert_eq!(code, ErrorCode::InvalidAccountId as u16);
    let replies = edge.wait_replies(1, Duration::from_secs(2)).await;
    assert_eq!(replies[0].1.error_code(), ErrorCode::InvalidAccountId as u16);

    // the session never produced an authenticated actor
    let seen = events.lock().unwrap().clone();
    assert_eq!(seen, vec!["authenticate"]);
    server.shutdown().await;
}
