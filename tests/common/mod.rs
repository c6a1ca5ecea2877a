// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use async_trait::async_trait;
use playhouse::{
    Actor, ActorSender, BaseActor, ContentsError, ContentsResult, ErrorCode, Packet, Payload,
    ServerConfig, ServiceType, SessionEdge, Stage, StageSender,
};
use std::{
    convert::TryInto,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll until `cond` holds or panic after `timeout`.
pub async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration, what: &str) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A session edge that records everything the core pushes out.
pub struct RecordingEdge {
    pub replies: Mutex<Vec<(u64, Packet)>>,
    pub disconnects: Mutex<Vec<(u64, u16)>>,
}

impl RecordingEdge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
        })
    }

    pub fn reply_count(&self) -> usize {
        self.replies.lock().unwrap().len()
    }

    pub async fn wait_replies(&self, n: usize, timeout: Duration) -> Vec<(u64, Packet)> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let replies = self.replies.lock().unwrap();
                if replies.len() >= n {
                    return replies.clone();
                }
            }
            if Instant::now() > deadline {
                panic!("timed out waiting for {} replies, have {}", n, self.reply_count());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_disconnect(&self, timeout: Duration) -> (u64, u16) {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let disconnects = self.disconnects.lock().unwrap();
                if let Some(first) = disconnects.first() {
                    return *first;
                }
            }
            if Instant::now() > deadline {
                panic!("timed out waiting for a disconnect");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl SessionEdge for RecordingEdge {
    fn send_client_reply(&self, sid: u64, packet: Packet) {
        self.replies.lock().unwrap().push((sid, packet));
    }

    fn disconnect(&self, sid: u64, error_code: u16) {
        self.disconnects.lock().unwrap().push((sid, error_code));
    }
}

pub fn play_config(server_id: &str) -> ServerConfig {
    ServerConfig::new(server_id, 2, ServiceType::Play, "127.0.0.1:0")
        .heartbeat_interval_ms(100)
        .request_timeout_ms(2_000)
        .pool_idle_timeout_ms(200)
}

pub fn api_config(server_id: &str) -> ServerConfig {
    ServerConfig::new(server_id, 1, ServiceType::Api, "127.0.0.1:0")
        .heartbeat_interval_ms(100)
        .request_timeout_ms(2_000)
        .pool_idle_timeout_ms(200)
}

pub fn bytes_payload(bytes: &[u8]) -> Payload {
    Payload::from_vec(bytes.to_vec())
}

pub fn u32_of(packet: &Packet) -> u32 {
    u32::from_le_bytes(packet.view()[..4].try_into().unwrap())
}

/// The all-purpose test stage: echoes, appends to an ordered list, defers
/// through async blocks, ticks a timer, and fails on demand.
#[derive(Default)]
pub struct EchoStage {
    items: Vec<u32>,
    ticks: Arc<Mutex<u32>>,
}

pub struct EchoActor;

#[async_trait]
impl Actor for EchoActor {
    async fn on_create(&mut self, _sender: &mut ActorSender) {}
    async fn on_destroy(&mut self, _sender: &mut ActorSender) {}
}

#[async_trait]
impl Stage for EchoStage {
    async fn on_create(&mut self, sender: &mut StageSender, packet: Packet) -> ContentsResult<bool> {
        if packet.msg_id() == "RejectMe" {
            return Ok(false);
        }
        if packet.msg_id() == "StartTicking" {
            let ticks = self.ticks.clone();
            sender.add_repeat_timer(Duration::from_millis(30), Duration::from_millis(30), move |_sender| {
                *ticks.lock().unwrap() += 1;
            });
        }
        Ok(true)
    }

    async fn on_authenticate(
        &mut self,
        _sender: &mut StageSender,
        actor: &mut BaseActor,
        _packet: Packet,
    ) -> ContentsResult<()> {
        let sid = actor.sender().sid();
        actor.sender().set_account_id(format!("acct-{}", sid));
        Ok(())
    }

    async fn on_dispatch(
        &mut self,
        sender: &mut StageSender,
        _actor: Option<&mut BaseActor>,
        packet: Packet,
    ) -> ContentsResult<()> {
        match packet.msg_id() {
            "Echo" => {
                sender.reply(Packet::new("EchoReply", packet.payload().clone())?);
                Ok(())
            }
            "Append" => {
                self.items.push(u32_of(&packet));
                let len = self.items.len() as u32;
                sender.reply(Packet::new("AppendReply", Payload::from_vec(len.to_le_bytes().to_vec()))?);
                Ok(())
            }
            "Slow" => {
                sender.async_block(
                    async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        42u32
                    },
                    |value, sender| {
                        let packet =
                            Packet::new("SlowReply", Payload::from_vec(value.to_le_bytes().to_vec())).unwrap();
                        sender.reply(packet);
                    },
                );
                Ok(())
            }
            "Ticks" => {
                let ticks = *self.ticks.lock().unwrap();
                sender.reply(Packet::new("TicksReply", Payload::from_vec(ticks.to_le_bytes().to_vec()))?);
                Ok(())
            }
            // accepts the request and deliberately never replies
            "Hold" => Ok(()),
            "Fail" => Err(ContentsError::code(2_000, "asked to fail")),
            other => Err(ContentsError::new(
                ErrorCode::HandlerNotFound,
                format!("no handler for {}", other),
            )),
        }
    }
}
