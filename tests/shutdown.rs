// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Graceful shutdown: ordered teardown, idempotence, nothing runs afterwards.

mod common;

use common::{EchoActor, EchoStage, RecordingEdge};
use playhouse::{ErrorCode, Packet, Payload, PlayServer};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_destroys_stages_and_is_idempotent() {
    common::init_logs();
    let edge = RecordingEdge::new();
    let server = PlayServer::builder(common::play_config("play-1"))
        .stage("echo", EchoStage::default, || EchoActor)
        .session_edge(edge.clone())
        .start()
        .await
        .unwrap();
    for stage_id in 1..=5 {
        server
            .sender()
            .create_stage("play-1", "echo", stage_id, Packet::new("Setup", Payload::empty()).unwrap())
            .await
            .unwrap();
    }
    assert_eq!(server.stage_count(), 5);

    server.shutdown().await;
    server.shutdown().await;

    common::wait_until(|| server.stage_count() == 0, Duration::from_secs(3), "stages destroyed").await;

    // requests after shutdown resolve immediately instead of hanging
    let err = server
        .sender()
        .create_stage("play-1", "echo", 99, Packet::new("Setup", Payload::empty()).unwrap())
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::SystemError as u16);

    // client packets after shutdown are dropped on the floor
    let before = edge.reply_count();
    server.handle_packet(1, Packet::new("Echo", Payload::empty()).unwrap().with_seq(1).to_stage(1));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(edge.reply_count(), before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn outstanding_requests_resolve_at_shutdown() {
    common::init_logs();
    let server = PlayServer::builder(common::play_config("play-1"))
        .stage("echo", EchoStage::default, || EchoActor)
        .start()
        .await
        .unwrap();
    server
        .sender()
        .create_stage("play-1", "echo", 1, Packet::new("Setup", Payload::empty()).unwrap())
        .await
        .unwrap();
    // the stage accepts this request and never replies, so it parks in the
    // cache until cancel_all resolves it
    let sender = server.sender();
    let pending = tokio::spawn(async move {
        sender
            .request_to_stage("play-1", 1, "", Packet::new("Hold", Payload::empty()).unwrap())
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.shutdown().await;
    let outcome = tokio::time::timeout(Duration::from_secs(1), pending).await.unwrap().unwrap();
    let err = outcome.unwrap_err();
    assert_eq!(err.code, ErrorCode::SystemError as u16);
}
