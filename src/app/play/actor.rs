// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The per-session actor bound to a stage.

use crate::{
    app::sender::SenderCore,
    comm::{ContentsResult, Packet},
};
use async_trait::async_trait;
use std::{any::Any, sync::Arc};

/// User-side actor state, created per session joining a stage.
#[async_trait]
pub trait Actor: Any + Send + 'static {
    /// Invoked once the actor object exists, before authentication.
    async fn on_create(&mut self, sender: &mut ActorSender);

    /// Invoked when the actor leaves its stage or the stage is destroyed.
    async fn on_destroy(&mut self, sender: &mut ActorSender);
}

/// Lifecycle of an actor within its stage.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ActorState {
    New,
    Authenticating,
    Authenticated,
    Leaving,
    Gone,
}

/// The framework half of an actor: user state plus its sender façade.
pub struct BaseActor {
    pub(crate) user: Box<dyn Actor>,
    pub(crate) sender: ActorSender,
    pub(crate) state: ActorState,
}

impl BaseActor {
    pub(crate) fn new(user: Box<dyn Actor>, sender: ActorSender) -> Self {
        Self {
            user,
            sender,
            state: ActorState::New,
        }
    }

    /// The actor's sender façade.
    pub fn sender(&mut self) -> &mut ActorSender {
        &mut self.sender
    }

    /// The account bound to this actor; empty until authenticated.
    pub fn account_id(&self) -> &str {
        self.sender.account_id()
    }

    /// Borrow the user state as its concrete type.
    pub fn downcast_mut<T: Actor>(&mut self) -> Option<&mut T> {
        (self.user.as_mut() as &mut dyn Any).downcast_mut::<T>()
    }
}

/// The sender façade scoped to one actor.
pub struct ActorSender {
    core: Arc<SenderCore>,
    stage_id: i64,
    sid: u64,
    session_server_id: String,
    account_id: String,
    leaving: bool,
}

impl ActorSender {
    pub(crate) fn new(core: Arc<SenderCore>, stage_id: i64, sid: u64, session_server_id: String) -> Self {
        Self {
            core,
            stage_id,
            sid,
            session_server_id,
            account_id: String::new(),
            leaving: false,
        }
    }

    /// The account bound to this actor; empty until authentication sets it.
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Bind the account; called from `on_authenticate`. Leaving it empty
    /// there closes the session.
    pub fn set_account_id(&mut self, account_id: impl Into<String>) {
        self.account_id = account_id.into();
    }

    /// The session this actor proxies.
    pub fn sid(&self) -> u64 {
        self.sid
    }

    /// The stage this actor belongs to.
    pub fn stage_id(&self) -> i64 {
        self.stage_id
    }

    /// Ask to leave the stage once the current handler returns.
    pub fn leave_stage(&mut self) {
        self.leaving = true;
    }

    pub(crate) fn is_leaving(&self) -> bool {
        self.leaving
    }

    /// Push an unsolicited packet to this actor's client.
    pub fn send_to_client(&self, packet: Packet) -> ContentsResult<()> {
        self.core.send_to_client(&self.session_server_id, self.sid, packet)
    }
}
