// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The stage runtime: a queue and an in-flight flag per stage, pumped one
//! message at a time on the shared worker pool.

use super::{
    actor::{Actor, ActorSender, ActorState, BaseActor},
    PlayDispatcher,
};
use crate::{
    app::{
        pool::WorkerPool,
        sender::{decode_create_body, SenderCore},
        timer::{TimerKind, TimerService},
    },
    comm::{
        ContentsResult, ErrorCode, Packet, Payload, RouteHeader, RoutePacket, CREATE_STAGE_MSG_ID,
        DESTROY_STAGE_MSG_ID, JOIN_STAGE_MSG_ID, LEAVE_STAGE_MSG_ID,
    },
};
use async_trait::async_trait;
use log::*;
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

/// User-side stage content: a room, a match, a world partition.
#[async_trait]
pub trait Stage: Send + 'static {
    /// Runs once when the stage is created. Returning `Ok(false)` or an error
    /// rejects the creation and tears the stage down again.
    async fn on_create(&mut self, sender: &mut StageSender, packet: Packet) -> ContentsResult<bool>;

    /// Runs after a successful creation reply went out.
    async fn on_post_create(&mut self, _sender: &mut StageSender) -> ContentsResult<()> {
        Ok(())
    }

    /// Runs the first time a session joins. Bind the account with
    /// `actor.sender().set_account_id(..)`; leaving it empty closes the
    /// session with `InvalidAccountId`.
    async fn on_authenticate(
        &mut self,
        sender: &mut StageSender,
        actor: &mut BaseActor,
        packet: Packet,
    ) -> ContentsResult<()>;

    /// Runs once the actor is registered under its account.
    async fn on_post_authenticate(&mut self, _sender: &mut StageSender, _actor: &mut BaseActor) -> ContentsResult<()> {
        Ok(())
    }

    /// Every content message lands here; `actor` is present when the message
    /// belongs to an authenticated session.
    async fn on_dispatch(
        &mut self,
        sender: &mut StageSender,
        actor: Option<&mut BaseActor>,
        packet: Packet,
    ) -> ContentsResult<()>;

    /// The session behind `actor` dropped; the actor is removed afterwards.
    async fn on_disconnect(&mut self, _sender: &mut StageSender, _actor: &mut BaseActor) -> ContentsResult<()> {
        Ok(())
    }

    /// The stage is going away; timers are already cancelled.
    async fn on_destroy(&mut self, _sender: &mut StageSender) {}
}

/// Callback invoked on timer ticks, under the stage's serialization.
pub type TimerCallback = Box<dyn FnMut(&mut StageSender) + Send>;

type AsyncBlockPost = Box<dyn FnOnce(&mut StageSender) + Send>;

/// One unit in a stage's queue.
pub(crate) enum StageMessage {
    Route(RoutePacket),
    Timer { timer_id: i64 },
    AsyncBlockResult {
        header: Option<RouteHeader>,
        replied: bool,
        post: AsyncBlockPost,
    },
    Disconnect { sid: u64 },
    Destroy,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum StageState {
    Creating,
    Active,
    Destroying,
    Dead,
}

struct TimerEntry {
    callback: TimerCallback,
    remaining: Option<u32>,
}

/// The sender façade handed to every stage handler. Carries the route header
/// of the message currently being processed; replies read it, so no handler
/// ever consults shared mutable call state.
pub struct StageSender {
    core: Arc<SenderCore>,
    stage_id: i64,
    stage_type: String,
    timer_service: Arc<TimerService>,
    pool: Arc<WorkerPool>,
    cell: Weak<StageCell>,
    header: Option<RouteHeader>,
    replied: bool,
    close_requested: bool,
    pending_blocks: usize,
    timers: HashMap<i64, TimerEntry>,
    firing_timer: Option<i64>,
    firing_cancelled: bool,
}

impl StageSender {
    fn new(
        core: Arc<SenderCore>,
        stage_id: i64,
        stage_type: String,
        timer_service: Arc<TimerService>,
        pool: Arc<WorkerPool>,
        cell: Weak<StageCell>,
    ) -> Self {
        Self {
            core,
            stage_id,
            stage_type,
            timer_service,
            pool,
            cell,
            header: None,
            replied: false,
            close_requested: false,
            pending_blocks: 0,
            timers: HashMap::new(),
            firing_timer: None,
            firing_cancelled: false,
        }
    }

    /// The id of the stage this sender belongs to.
    pub fn stage_id(&self) -> i64 {
        self.stage_id
    }

    /// The registered type of the stage.
    pub fn stage_type(&self) -> &str {
        &self.stage_type
    }

    /// The id of this server.
    pub fn server_id(&self) -> &str {
        self.core.server_id()
    }

    fn begin(&mut self, header: Option<RouteHeader>, replied: bool) {
        self.header = header;
        self.replied = replied;
    }

    fn end(&mut self) {
        self.header = None;
        self.replied = true;
    }

    fn has_replied(&self) -> bool {
        self.replied
    }

    fn take_close_requested(&mut self) -> bool {
        std::mem::take(&mut self.close_requested)
    }

    /// Reply to the message currently being processed. A second reply to the
    /// same request is a logged no-op, as is replying to a notification.
    pub fn reply(&mut self, packet: Packet) {
        let header = match self.header.as_ref() {
            Some(header) => header,
            None => {
                warn!("reply outside a routed handler on stage {}, dropped", self.stage_id);
                return;
            }
        };
        if header.msg_seq == 0 {
            warn!("reply to notification {} on stage {}, dropped", header.msg_id, self.stage_id);
            return;
        }
        if self.replied {
            warn!("second reply to {} on stage {}, dropped", header.msg_id, self.stage_id);
            return;
        }
        self.replied = true;
        self.core.reply_to(header, packet);
    }

    /// Reply with an empty body carrying only an error code.
    pub fn reply_error(&mut self, error_code: u16) {
        let mut packet = match self.header.as_ref() {
            Some(header) => Packet::base(&header.msg_id, Payload::empty()),
            None => return,
        };
        packet.set_error_code(error_code);
        self.reply(packet);
    }

    /// Fire a notification at an Api server.
    pub fn send_to_api(&self, server_id: &str, packet: Packet) -> ContentsResult<()> {
        self.core.send_packet(server_id, 0, "", false, packet)
    }

    /// Request/reply against an Api server.
    pub async fn request_to_api(&self, server_id: &str, packet: Packet) -> ContentsResult<Packet> {
        self.core.request_packet(server_id, 0, "", false, packet).await
    }

    /// Fire a notification at a stage, possibly on another Play server.
    pub fn send_to_stage(
        &self,
        play_server_id: &str,
        stage_id: i64,
        account_id: &str,
        packet: Packet,
    ) -> ContentsResult<()> {
        self.core.send_packet(play_server_id, stage_id, account_id, false, packet)
    }

    /// Request/reply against a stage, possibly on another Play server.
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

    /// Fire a framework-level notification at another server.
    pub fn send_to_system(&self, server_id: &str, packet: Packet) -> ContentsResult<()> {
        self.core.send_packet(server_id, 0, "", true, packet)
    }

    /// Push a packet to a client on the local session edge.
    pub fn send_to_client(&self, sid: u64, packet: Packet) -> ContentsResult<()> {
        self.core.send_to_client("", sid, packet)
    }

    /// Schedule a repeating timer; the callback runs under this stage's
    /// serialization until the timer is cancelled.
    pub fn add_repeat_timer(
        &mut self,
        initial_delay: Duration,
        period: Duration,
        callback: impl FnMut(&mut StageSender) + Send + 'static,
    ) -> i64 {
        let timer_id = self
            .timer_service
            .register(self.stage_id, initial_delay, period, TimerKind::Repeat);
        self.timers.insert(
            timer_id,
            TimerEntry {
                callback: Box::new(callback),
                remaining: None,
            },
        );
        timer_id
    }

    /// Schedule a timer firing exactly `count` times.
    pub fn add_count_timer(
        &mut self,
        initial_delay: Duration,
        count: u32,
        period: Duration,
        callback: impl FnMut(&mut StageSender) + Send + 'static,
    ) -> i64 {
        let timer_id = self
            .timer_service
            .register(self.stage_id, initial_delay, period, TimerKind::Count(count));
        if count > 0 {
            self.timers.insert(
                timer_id,
                TimerEntry {
                    callback: Box::new(callback),
                    remaining: Some(count),
                },
            );
        }
        timer_id
    }

    /// Cancel a timer created on this stage.
    pub fn cancel_timer(&mut self, timer_id: i64) {
        self.timer_service.cancel(timer_id);
        self.timers.remove(&timer_id);
        if self.firing_timer == Some(timer_id) {
            self.firing_cancelled = true;
        }
    }

    /// Run `pre` on the worker pool without tying up this stage's worker,
    /// then run `post` with its result back under the stage's serialization.
    /// `post` is a continuation of the current message: queued messages wait
    /// for it, and it may reply to the request that was current when
    /// `async_block` was called. The one sanctioned way to do blocking work
    /// from a handler.
    pub fn async_block<T, Pre, Post>(&mut self, pre: Pre, post: Post)
    where
        T: Send + 'static,
        Pre: Future<Output = T> + Send + 'static,
        Post: FnOnce(T, &mut StageSender) + Send + 'static,
    {
        let cell = match self.cell.upgrade() {
            Some(cell) => cell,
            None => return,
        };
        // capture the routed context now, before the handler returns
        let header = self.header.clone();
        let replied = self.replied;
        self.pending_blocks += 1;
        self.pool.submit(async move {
            let value = pre.await;
            cell.submit(StageMessage::AsyncBlockResult {
                header,
                replied,
                post: Box::new(move |sender| post(value, sender)),
            });
        });
    }

    /// Destroy this stage once the current handler returns.
    pub fn close_stage(&mut self) {
        self.close_requested = true;
    }
}

/// The shared half of a stage: the submit state every producer touches, and
/// the inner state only the pump may enter.
pub(crate) struct StageCell {
    pub(crate) stage_id: i64,
    queue: Mutex<VecDeque<StageMessage>>,
    // async block completions and internal destroys jump the line: while a
    // message waits on its continuation, only this lane may be drained
    results: Mutex<VecDeque<StageMessage>>,
    in_flight: AtomicBool,
    closed: AtomicBool,
    pool: Arc<WorkerPool>,
    play: Weak<PlayDispatcher>,
    inner: tokio::sync::Mutex<StageInner>,
}

struct StageInner {
    state: StageState,
    user: Box<dyn Stage>,
    sender: StageSender,
    actor_factory: Arc<dyn Fn() -> Box<dyn Actor> + Send + Sync>,
    actors: HashMap<String, BaseActor>,
    sids: HashMap<u64, String>,
}

impl StageCell {
    pub fn new(
        stage_id: i64,
        stage_type: String,
        user: Box<dyn Stage>,
        actor_factory: Arc<dyn Fn() -> Box<dyn Actor> + Send + Sync>,
        play: &Arc<PlayDispatcher>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<StageCell>| {
            let sender = StageSender::new(
                play.core.clone(),
                stage_id,
                stage_type,
                play.timer.clone(),
                play.pool.clone(),
                weak.clone(),
            );
            StageCell {
                stage_id,
                queue: Mutex::new(VecDeque::new()),
                results: Mutex::new(VecDeque::new()),
                in_flight: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                pool: play.pool.clone(),
                play: Arc::downgrade(play),
                inner: tokio::sync::Mutex::new(StageInner {
                    state: StageState::Creating,
                    user,
                    sender,
                    actor_factory,
                    actors: HashMap::new(),
                    sids: HashMap::new(),
                }),
            }
        })
    }

    /// Enqueue one message and make sure a pump is scheduled. Messages for a
    /// closed stage are rejected; requests among them get a `StageNotFound`
    /// reply so their callers do not hang.
    pub fn submit(self: &Arc<Self>, message: StageMessage) {
        if self.closed.load(Ordering::SeqCst) {
            self.reject(message);
            return;
        }
        match message {
            StageMessage::AsyncBlockResult { .. } | StageMessage::Destroy => {
                self.results.lock().expect("stage queue poisoned").push_back(message);
            }
            _ => {
                self.queue.lock().expect("stage queue poisoned").push_back(message);
            }
        }
        if !self.in_flight.swap(true, Ordering::SeqCst) {
            let cell = self.clone();
            self.pool.submit(async move { pump(cell).await });
        }
    }

    fn next_message(&self, inner: &StageInner) -> Option<StageMessage> {
        if let Some(message) = self.results.lock().expect("stage queue poisoned").pop_front() {
            return Some(message);
        }
        if inner.sender.pending_blocks > 0 {
            // suspended on a continuation: regular messages have to wait
            return None;
        }
        self.queue.lock().expect("stage queue poisoned").pop_front()
    }

    fn has_processable(&self, inner: &StageInner) -> bool {
        if !self.results.lock().expect("stage queue poisoned").is_empty() {
            return true;
        }
        inner.sender.pending_blocks == 0 && !self.queue.lock().expect("stage queue poisoned").is_empty()
    }

    fn reject(&self, message: StageMessage) {
        match message {
            StageMessage::Route(packet) => {
                if packet.header.msg_seq > 0 && !packet.header.is_reply {
                    if let Some(play) = self.play.upgrade() {
                        play.core.reply_error_to(&packet.header, ErrorCode::StageNotFound.into());
                    }
                }
            }
            StageMessage::AsyncBlockResult { .. } => {
                debug!("async block completion for closed stage {}, dropped", self.stage_id);
            }
            _ => {}
        }
    }
}

/// Drain the stage queue until empty. At most one pump runs per stage; the
/// swap/re-check on `in_flight` closes the race with producers that enqueued
/// while the pump was winding down.
async fn pump(cell: Arc<StageCell>) {
    let mut guard = cell.inner.lock().await;
    loop {
        let message = cell.next_message(&guard);
        match message {
            Some(message) => {
                process(&cell, &mut guard, message).await;
                if guard.sender.take_close_requested() && guard.state == StageState::Active {
                    destroy(&cell, &mut guard, None).await;
                }
            }
            None => {
                cell.in_flight.store(false, Ordering::SeqCst);
                if cell.has_processable(&guard) && !cell.in_flight.swap(true, Ordering::SeqCst) {
                    continue;
                }
                break;
            }
        }
    }
}

async fn process(cell: &Arc<StageCell>, inner: &mut StageInner, message: StageMessage) {
    match message {
        StageMessage::Route(packet) => {
            let msg_id = packet.header.msg_id.clone();
            match msg_id.as_str() {
                CREATE_STAGE_MSG_ID => handle_create(cell, inner, packet).await,
                JOIN_STAGE_MSG_ID => handle_join(cell, inner, packet).await,
                LEAVE_STAGE_MSG_ID => handle_leave(cell, inner, packet).await,
                DESTROY_STAGE_MSG_ID => {
                    destroy(cell, inner, Some(packet.header)).await;
                }
                _ => handle_dispatch(cell, inner, packet).await,
            }
        }
        StageMessage::Timer { timer_id } => handle_timer(inner, timer_id),
        StageMessage::AsyncBlockResult { header, replied, post } => {
            inner.sender.pending_blocks = inner.sender.pending_blocks.saturating_sub(1);
            if inner.state != StageState::Active {
                return;
            }
            inner.sender.begin(header, replied);
            post(&mut inner.sender);
            inner.sender.end();
        }
        StageMessage::Disconnect { sid } => handle_disconnect(cell, inner, sid).await,
        StageMessage::Destroy => destroy(cell, inner, None).await,
    }
}

async fn handle_create(cell: &Arc<StageCell>, inner: &mut StageInner, packet: RoutePacket) {
    let header = packet.header.clone();
    if inner.state != StageState::Creating {
        if header.msg_seq > 0 {
            reply_out_of_band(cell, &header, ErrorCode::StageAlreadyExists.into());
        }
        return;
    }
    let content = match decode_create_body(packet.payload.view()) {
        Ok((_, msg_id, content)) => Packet::base(&msg_id, Payload::from_vec(content)),
        Err(e) => {
            warn!("malformed create body for stage {}: {}", cell.stage_id, e);
            reply_out_of_band(cell, &header, ErrorCode::InvalidMessage.into());
            teardown(cell, inner).await;
            return;
        }
    };
    let StageInner { user, sender, .. } = inner;
    sender.begin(Some(header.clone()), false);
    let created = user.on_create(sender, content).await;
    match created {
        Ok(true) => {
            inner.state = StageState::Active;
            if !inner.sender.has_replied() && header.msg_seq > 0 {
                inner.sender.reply(Packet::base(&header.msg_id, Payload::empty()));
            }
            inner.sender.end();
            let StageInner { user, sender, .. } = inner;
            sender.begin(None, true);
            if let Err(e) = user.on_post_create(sender).await {
                error!("stage {} post create failed: {}", cell.stage_id, e);
            }
            sender.end();
        }
        Ok(false) => {
            if !inner.sender.has_replied() {
                inner.sender.reply_error(ErrorCode::StageCreationFailed.into());
            }
            inner.sender.end();
            teardown(cell, inner).await;
        }
        Err(e) => {
            error!("stage {} creation failed: {}", cell.stage_id, e);
            if !inner.sender.has_replied() {
                inner.sender.reply_error(error_code_of(&e));
            }
            inner.sender.end();
            teardown(cell, inner).await;
        }
    }
}

async fn handle_join(cell: &Arc<StageCell>, inner: &mut StageInner, packet: RoutePacket) {
    let header = packet.header.clone();
    if inner.state != StageState::Active {
        if header.msg_seq > 0 {
            reply_out_of_band(cell, &header, ErrorCode::StageNotFound.into());
        }
        return;
    }
    let sid = header.sid;
    if let Some(account) = inner.sids.get(&sid) {
        debug!("sid {} already joined stage {} as {}", sid, cell.stage_id, account);
        if header.msg_seq > 0 {
            reply_out_of_band(cell, &header, 0);
        }
        return;
    }
    let mut actor = BaseActor::new(
        (inner.actor_factory)(),
        ActorSender::new(inner.sender.core.clone(), cell.stage_id, sid, header.from.clone()),
    );
    actor.state = ActorState::Authenticating;
    {
        let BaseActor { user, sender, .. } = &mut actor;
        user.on_create(sender).await;
    }
    let StageInner { user, sender, .. } = inner;
    sender.begin(Some(header.clone()), false);
    let authenticated = user.on_authenticate(sender, &mut actor, packet.into_packet()).await;
    match authenticated {
        Err(e) => {
            warn!("authentication on stage {} for sid {} failed: {}", cell.stage_id, sid, e);
            if !inner.sender.has_replied() {
                inner.sender.reply_error(error_code_of(&e));
            }
            inner.sender.end();
            drop_actor(actor).await;
        }
        Ok(()) if actor.sender.account_id().is_empty() => {
            // authenticated without an account: fatal for the session
            warn!("empty account id after authentication on stage {}, closing sid {}", cell.stage_id, sid);
            if !inner.sender.has_replied() {
                inner.sender.reply_error(ErrorCode::InvalidAccountId.into());
            }
            inner.sender.end();
            disconnect_session(cell, &header, sid);
            drop_actor(actor).await;
        }
        Ok(()) => {
            let account = actor.sender.account_id().to_owned();
            actor.state = ActorState::Authenticated;
            if let Some(previous) = inner.actors.remove(&account) {
                // the account rebinds to the newer session
                let old_sid = previous.sender.sid();
                inner.sids.remove(&old_sid);
                if let Some(play) = cell.play.upgrade() {
                    play.unbind_sid(old_sid, cell.stage_id);
                }
                drop_actor(previous).await;
            }
            inner.sids.insert(sid, account.clone());
            inner.actors.insert(account.clone(), actor);
            if let Some(play) = cell.play.upgrade() {
                play.bind_sid(sid, cell.stage_id);
            }
            if !inner.sender.has_replied() && header.msg_seq > 0 {
                inner.sender.reply(Packet::base(&header.msg_id, Payload::empty()));
            }
            let StageInner { user, sender, actors, .. } = inner;
            if let Some(actor) = actors.get_mut(&account) {
                if let Err(e) = user.on_post_authenticate(sender, actor).await {
                    error!("post authenticate on stage {} failed: {}", cell.stage_id, e);
                }
            }
            inner.sender.end();
        }
    }
}

async fn handle_leave(cell: &Arc<StageCell>, inner: &mut StageInner, packet: RoutePacket) {
    let header = packet.header;
    let account = resolve_account(inner, &header);
    let removed = account.as_ref().and_then(|account| inner.actors.remove(account));
    match removed {
        Some(mut actor) => {
            actor.state = ActorState::Leaving;
            let sid = actor.sender.sid();
            inner.sids.remove(&sid);
            if let Some(play) = cell.play.upgrade() {
                play.unbind_sid(sid, cell.stage_id);
            }
            drop_actor(actor).await;
            if header.msg_seq > 0 {
                reply_out_of_band(cell, &header, 0);
            }
        }
        None => {
            if header.msg_seq > 0 {
                reply_out_of_band(cell, &header, ErrorCode::ActorNotFound.into());
            }
        }
    }
}

async fn handle_dispatch(cell: &Arc<StageCell>, inner: &mut StageInner, packet: RoutePacket) {
    let header = packet.header.clone();
    if inner.state != StageState::Active {
        if header.msg_seq > 0 && !header.is_reply {
            reply_out_of_band(cell, &header, ErrorCode::StageNotFound.into());
        }
        return;
    }
    let account = resolve_account(inner, &header);
    let StageInner { user, sender, actors, .. } = inner;
    sender.begin(Some(header.clone()), false);
    let result = match account.as_ref() {
        Some(account) => match actors.get_mut(account) {
            Some(actor) if actor.state == ActorState::Authenticated => {
                user.on_dispatch(sender, Some(actor), packet.into_packet()).await
            }
            _ => {
                if header.msg_seq > 0 {
                    sender.reply_error(ErrorCode::ActorNotFound.into());
                }
                sender.end();
                return;
            }
        },
        // server-to-server form, no actor attached
        None => user.on_dispatch(sender, None, packet.into_packet()).await,
    };
    if let Err(e) = result {
        error!(
            "handler {} on stage {} (account {}) failed: {}",
            header.msg_id,
            cell.stage_id,
            account.as_deref().unwrap_or("-"),
            e
        );
        if header.msg_seq > 0 && !inner.sender.has_replied() {
            let code = error_code_of(&e);
            inner.sender.reply_error(code);
        }
    }
    inner.sender.end();
    if let Some(account) = account {
        let leaving = inner
            .actors
            .get(&account)
            .map(|actor| actor.sender.is_leaving())
            .unwrap_or(false);
        if leaving {
            if let Some(mut actor) = inner.actors.remove(&account) {
                actor.state = ActorState::Leaving;
                let sid = actor.sender.sid();
                inner.sids.remove(&sid);
                if let Some(play) = cell.play.upgrade() {
                    play.unbind_sid(sid, cell.stage_id);
                }
                drop_actor(actor).await;
            }
        }
    }
}

fn handle_timer(inner: &mut StageInner, timer_id: i64) {
    if inner.state != StageState::Active {
        return;
    }
    let entry = inner.sender.timers.remove(&timer_id);
    let mut entry = match entry {
        Some(entry) => entry,
        None => return, // cancelled after the tick was queued
    };
    inner.sender.begin(None, true);
    inner.sender.firing_timer = Some(timer_id);
    // the callback is detached from the table while it runs, so it may
    // freely add or cancel timers, including itself
    let sender = &mut inner.sender;
    (entry.callback)(sender);
    let cancelled = std::mem::take(&mut inner.sender.firing_cancelled);
    inner.sender.firing_timer = None;
    inner.sender.end();
    if cancelled {
        return;
    }
    match entry.remaining.as_mut() {
        Some(remaining) => {
            *remaining -= 1;
            if *remaining > 0 {
                inner.sender.timers.insert(timer_id, entry);
            }
        }
        None => {
            inner.sender.timers.insert(timer_id, entry);
        }
    }
}

async fn handle_disconnect(cell: &Arc<StageCell>, inner: &mut StageInner, sid: u64) {
    let account = match inner.sids.remove(&sid) {
        Some(account) => account,
        None => return,
    };
    if let Some(play) = cell.play.upgrade() {
        play.unbind_sid(sid, cell.stage_id);
    }
    let StageInner { user, sender, actors, .. } = inner;
    if let Some(actor) = actors.get_mut(&account) {
        sender.begin(None, true);
        if let Err(e) = user.on_disconnect(sender, actor).await {
            error!("disconnect handler on stage {} failed: {}", cell.stage_id, e);
        }
        sender.end();
    }
    if let Some(actor) = inner.actors.remove(&account) {
        drop_actor(actor).await;
    }
}

/// Tear the stage down: timers cancelled, actors destroyed, user notified,
/// queue closed and drained so no request hangs on a dead stage.
async fn destroy(cell: &Arc<StageCell>, inner: &mut StageInner, reply: Option<RouteHeader>) {
    if inner.state == StageState::Dead || inner.state == StageState::Destroying {
        if let Some(header) = reply {
            if header.msg_seq > 0 {
                reply_out_of_band(cell, &header, 0);
            }
        }
        return;
    }
    inner.state = StageState::Destroying;
    cell.closed.store(true, Ordering::SeqCst);
    let timer_ids: Vec<i64> = inner.sender.timers.keys().copied().collect();
    for timer_id in timer_ids {
        inner.sender.timer_service.cancel(timer_id);
    }
    inner.sender.timers.clear();
    let play = cell.play.upgrade();
    for (_, mut actor) in inner.actors.drain() {
        let sid = actor.sender.sid();
        if let Some(play) = play.as_ref() {
            play.unbind_sid(sid, cell.stage_id);
        }
        actor.state = ActorState::Leaving;
        drop_actor(actor).await;
    }
    inner.sids.clear();
    let StageInner { user, sender, .. } = inner;
    sender.begin(None, true);
    user.on_destroy(sender).await;
    sender.end();
    inner.state = StageState::Dead;
    inner.sender.pending_blocks = 0;
    if let Some(play) = play.as_ref() {
        play.remove_stage(cell.stage_id);
    }
    // whatever raced into the queues is answered or dropped now
    let leftover: Vec<StageMessage> = {
        let mut queue = cell.queue.lock().expect("stage queue poisoned");
        let mut drained: Vec<StageMessage> = queue.drain(..).collect();
        drop(queue);
        let mut results = cell.results.lock().expect("stage queue poisoned");
        drained.extend(results.drain(..));
        drained
    };
    for message in leftover {
        cell.reject(message);
    }
    if let Some(header) = reply {
        if header.msg_seq > 0 {
            reply_out_of_band(cell, &header, 0);
        }
    }
}

async fn teardown(cell: &Arc<StageCell>, inner: &mut StageInner) {
    inner.state = StageState::Dead;
    cell.closed.store(true, Ordering::SeqCst);
    if let Some(play) = cell.play.upgrade() {
        play.remove_stage(cell.stage_id);
    }
}

async fn drop_actor(mut actor: BaseActor) {
    let BaseActor { user, sender, .. } = &mut actor;
    user.on_destroy(sender).await;
    actor.state = ActorState::Gone;
}

fn resolve_account(inner: &StageInner, header: &RouteHeader) -> Option<String> {
    if !header.account_id.is_empty() {
        return Some(header.account_id.clone());
    }
    if header.sid > 0 {
        return inner.sids.get(&header.sid).cloned();
    }
    None
}

fn reply_out_of_band(cell: &Arc<StageCell>, header: &RouteHeader, error_code: u16) {
    if let Some(play) = cell.play.upgrade() {
        play.core.reply_error_to(header, error_code);
    }
}

fn disconnect_session(cell: &Arc<StageCell>, header: &RouteHeader, sid: u64) {
    let play = match cell.play.upgrade() {
        Some(play) => play,
        None => return,
    };
    if header.from.is_empty() {
        match play.core.edge() {
            Some(edge) => edge.disconnect(sid, ErrorCode::InvalidAccountId.into()),
            None => warn!("no session edge to close sid {}", sid),
        }
    } else {
        // the owning session server closes it
        let mut packet = Packet::base(crate::comm::DISCONNECT_MSG_ID, Payload::empty());
        packet.set_error_code(ErrorCode::InvalidAccountId.into());
        play.core.send_packet(&header.from, 0, "", true, packet).ok();
    }
}

fn error_code_of(error: &crate::comm::ContentsError) -> u16 {
    if error.code == 0 {
        ErrorCode::UncheckedContentsError.into()
    } else {
        error.code
    }
}
