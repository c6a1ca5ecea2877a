// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The Play dispatcher: owns the stage table and routes inbound traffic into
//! per-stage queues.

use crate::{
    app::{
        config::ServerConfig,
        pool::WorkerPool,
        sender::{decode_create_body, SenderCore},
        timer::{TimerFired, TimerService},
    },
    comm::{ErrorCode, Packet, RouteHeader, RoutePacket, CREATE_STAGE_MSG_ID, DISCONNECT_MSG_ID},
};
use log::*;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, RwLock},
};
use stage::{StageCell, StageMessage};
use tokio::sync::mpsc;

/// Actors and their sender façade.
pub mod actor;
/// The stage runtime and its pump.
pub mod stage;

pub use actor::{Actor, ActorSender, BaseActor};
pub use stage::{Stage, StageSender, TimerCallback};

struct StageFactory {
    stage: Arc<dyn Fn() -> Box<dyn Stage> + Send + Sync>,
    actor: Arc<dyn Fn() -> Box<dyn Actor> + Send + Sync>,
}

/// Owns every stage hosted by this server and feeds their queues.
pub(crate) struct PlayDispatcher {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) core: Arc<SenderCore>,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) timer: Arc<TimerService>,
    stages: RwLock<HashMap<i64, Arc<StageCell>>>,
    factories: RwLock<HashMap<String, StageFactory>>,
    sid_index: Mutex<HashMap<u64, HashSet<i64>>>,
}

impl PlayDispatcher {
    pub fn new(config: Arc<ServerConfig>, core: Arc<SenderCore>, pool: Arc<WorkerPool>) -> Arc<Self> {
        let (sink, mut ticks) = mpsc::unbounded_channel::<TimerFired>();
        let timer = TimerService::start(sink);
        let play = Arc::new(Self {
            config,
            core,
            pool,
            timer,
            stages: RwLock::new(HashMap::new()),
            factories: RwLock::new(HashMap::new()),
            sid_index: Mutex::new(HashMap::new()),
        });
        {
            let play = Arc::downgrade(&play);
            tokio::spawn(async move {
                while let Some(fired) = ticks.recv().await {
                    match play.upgrade() {
                        Some(play) => play.on_timer(fired),
                        None => break,
                    }
                }
            });
        }
        play
    }

    /// Register a stage type with its factories; done before the server
    /// starts, the explicit counterpart of reflective discovery.
    pub fn register_stage_type(
        &self,
        stage_type: impl Into<String>,
        stage_factory: Arc<dyn Fn() -> Box<dyn Stage> + Send + Sync>,
        actor_factory: Arc<dyn Fn() -> Box<dyn Actor> + Send + Sync>,
    ) {
        self.factories.write().expect("factory table poisoned").insert(
            stage_type.into(),
            StageFactory {
                stage: stage_factory,
                actor: actor_factory,
            },
        );
    }

    fn stage(&self, stage_id: i64) -> Option<Arc<StageCell>> {
        self.stages.read().expect("stage table poisoned").get(&stage_id).cloned()
    }

    /// A wheel tick for one of our stages; dropped if the stage is gone.
    fn on_timer(&self, fired: TimerFired) {
        if let Some(cell) = self.stage(fired.stage_id) {
            cell.submit(StageMessage::Timer {
                timer_id: fired.timer_id,
            });
        }
    }

    /// Number of live stages; the read view exposed on the server.
    pub fn stage_count(&self) -> usize {
        self.stages.read().expect("stage table poisoned").len()
    }

    /// Route one inbound envelope to its stage queue.
    pub async fn dispatch(self: &Arc<Self>, packet: RoutePacket) {
        let header = &packet.header;
        if header.is_base && header.msg_id == DISCONNECT_MSG_ID {
            self.handle_session_disconnect(header.sid);
            return;
        }
        if header.is_base && header.msg_id == CREATE_STAGE_MSG_ID {
            self.handle_create_route(packet);
            return;
        }
        match self.stage(packet.header.stage_id) {
            Some(cell) => cell.submit(StageMessage::Route(packet)),
            None => {
                if packet.header.msg_seq > 0 && !packet.header.is_reply {
                    self.core
                        .reply_error_to(&packet.header, ErrorCode::StageNotFound.into());
                } else {
                    debug!(
                        "{} for unknown stage {} dropped",
                        packet.header.msg_id, packet.header.stage_id
                    );
                }
            }
        }
    }

    fn handle_create_route(self: &Arc<Self>, packet: RoutePacket) {
        let stage_id = packet.header.stage_id;
        let stage_type = match decode_create_body(packet.payload.view()) {
            Ok((stage_type, _, _)) => stage_type,
            Err(e) => {
                warn!("malformed create request for stage {}: {}", stage_id, e);
                self.core.reply_error_to(&packet.header, ErrorCode::InvalidMessage.into());
                return;
            }
        };
        let factory = {
            let factories = self.factories.read().expect("factory table poisoned");
            match factories.get(&stage_type) {
                Some(factory) => (factory.stage.clone(), factory.actor.clone()),
                None => {
                    warn!("create request for unregistered stage type {}", stage_type);
                    self.core
                        .reply_error_to(&packet.header, ErrorCode::InvalidStageType.into());
                    return;
                }
            }
        };
        let cell = {
            let mut stages = self.stages.write().expect("stage table poisoned");
            if stages.contains_key(&stage_id) {
                drop(stages);
                self.core
                    .reply_error_to(&packet.header, ErrorCode::StageAlreadyExists.into());
                return;
            }
            let cell = StageCell::new(stage_id, stage_type, (factory.0)(), factory.1, self);
            stages.insert(stage_id, cell.clone());
            cell
        };
        cell.submit(StageMessage::Route(packet));
    }

    /// Client packet handed in by the session edge; the core owns it now.
    pub async fn handle_client_packet(self: &Arc<Self>, sid: u64, packet: Packet) {
        let header = RouteHeader {
            service_id: self.config.service_id,
            msg_id: packet.msg_id().to_owned(),
            msg_seq: packet.msg_seq(),
            stage_id: packet.stage_id(),
            sid,
            ..Default::default()
        };
        self.dispatch(RoutePacket::new(header, packet.into_payload())).await;
    }

    /// Session loss propagated to every stage the session has an actor in.
    pub fn handle_session_disconnect(&self, sid: u64) {
        let stage_ids = {
            let mut index = self.sid_index.lock().expect("sid index poisoned");
            index.remove(&sid).unwrap_or_default()
        };
        for stage_id in stage_ids {
            if let Some(cell) = self.stage(stage_id) {
                cell.submit(StageMessage::Disconnect { sid });
            }
        }
    }

    /// Submit a final destroy to every stage; used at shutdown.
    pub fn destroy_all(&self) {
        let cells: Vec<Arc<StageCell>> = {
            let stages = self.stages.read().expect("stage table poisoned");
            stages.values().cloned().collect()
        };
        for cell in cells {
            cell.submit(StageMessage::Destroy);
        }
    }

    pub(crate) fn remove_stage(&self, stage_id: i64) {
        self.stages.write().expect("stage table poisoned").remove(&stage_id);
    }

    pub(crate) fn bind_sid(&self, sid: u64, stage_id: i64) {
        self.sid_index
            .lock()
            .expect("sid index poisoned")
            .entry(sid)
            .or_insert_with(HashSet::new)
            .insert(stage_id);
    }

    pub(crate) fn unbind_sid(&self, sid: u64, stage_id: i64) {
        let mut index = self.sid_index.lock().expect("sid index poisoned");
        if let Some(stages) = index.get_mut(&sid) {
            stages.remove(&stage_id);
            if stages.is_empty() {
                index.remove(&sid);
            }
        }
    }
}
