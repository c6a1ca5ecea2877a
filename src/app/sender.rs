// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The shared core behind every sender façade: header construction, the
//! ordered outbound queue, request registration and reply routing.

use crate::{
    app::{
        config::ServerConfig,
        mesh::Communicator,
        request::RequestCache,
        session::SessionEdge,
    },
    comm::{
        ContentsError, ContentsResult, ErrorCode, Packet, Payload, RouteHeader, RoutePacket,
        CREATE_STAGE_MSG_ID,
    },
};
use log::*;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Encode the create-stage body: stage type, content msg id, content payload.
pub(crate) fn encode_create_body(stage_type: &str, msg_id: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + stage_type.len() + msg_id.len() + payload.len());
    body.extend(&(stage_type.len() as u16).to_le_bytes());
    body.extend(stage_type.as_bytes());
    body.extend(&(msg_id.len() as u16).to_le_bytes());
    body.extend(msg_id.as_bytes());
    body.extend(payload);
    body
}

/// Decode a create-stage body into `(stage_type, content_msg_id, content)`.
pub(crate) fn decode_create_body(body: &[u8]) -> anyhow::Result<(String, String, Vec<u8>)> {
    use std::convert::TryInto;
    anyhow::ensure!(body.len() >= 2, "truncated create body");
    let type_len = u16::from_le_bytes(body[..2].try_into()?) as usize;
    anyhow::ensure!(body.len() >= 2 + type_len + 2, "truncated create body");
    let stage_type = std::str::from_utf8(&body[2..2 + type_len])?.to_owned();
    let at = 2 + type_len;
    let id_len = u16::from_le_bytes(body[at..at + 2].try_into()?) as usize;
    anyhow::ensure!(body.len() >= at + 2 + id_len, "truncated create body");
    let msg_id = std::str::from_utf8(&body[at + 2..at + 2 + id_len])?.to_owned();
    Ok((stage_type, msg_id, body[at + 2 + id_len..].to_vec()))
}

/// The sender core. Notifications and replies go out synchronously onto one
/// ordered queue drained by a forwarding task; requests additionally park a
/// slot in the request cache and the caller awaits it.
pub(crate) struct SenderCore {
    config: Arc<ServerConfig>,
    communicator: Arc<Communicator>,
    request_cache: Arc<RequestCache>,
    edge: RwLock<Option<Arc<dyn SessionEdge>>>,
    outbound: mpsc::UnboundedSender<RoutePacket>,
}

impl SenderCore {
    pub fn new(
        config: Arc<ServerConfig>,
        communicator: Arc<Communicator>,
        request_cache: Arc<RequestCache>,
    ) -> Arc<Self> {
        let (outbound, mut rx) = mpsc::unbounded_channel::<RoutePacket>();
        {
            // the forwarder preserves submit order and surfaces send failures
            // to the request slots that would otherwise hang until timeout
            let communicator = communicator.clone();
            let request_cache = request_cache.clone();
            tokio::spawn(async move {
                while let Some(packet) = rx.recv().await {
                    let msg_seq = packet.header.msg_seq;
                    let is_reply = packet.header.is_reply;
                    let msg_id = packet.header.msg_id.clone();
                    if let Err(e) = communicator.send(packet).await {
                        if msg_seq > 0 && !is_reply {
                            request_cache.fail(msg_seq, e);
                        } else {
                            warn!("outbound {} dropped: {}", msg_id, e);
                        }
                    }
                }
            });
        }
        Arc::new(Self {
            config,
            communicator,
            request_cache,
            edge: RwLock::new(None),
            outbound,
        })
    }

    pub fn set_edge(&self, edge: Arc<dyn SessionEdge>) {
        self.edge.write().expect("sender core poisoned").replace(edge);
    }

    pub fn edge(&self) -> Option<Arc<dyn SessionEdge>> {
        self.edge.read().expect("sender core poisoned").clone()
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    fn header_to(&self, to: &str, msg_id: &str, stage_id: i64, account_id: &str, is_base: bool) -> RouteHeader {
        RouteHeader {
            service_id: self.config.service_id,
            msg_id: msg_id.to_owned(),
            msg_seq: 0,
            stage_id,
            sid: 0,
            from: self.config.server_id.clone(),
            to: to.to_owned(),
            account_id: account_id.to_owned(),
            error_code: 0,
            is_base,
            is_reply: false,
            is_forwarded: false,
        }
    }

    fn check_target(&self, to: &str) -> ContentsResult<()> {
        if to == self.config.server_id {
            return Ok(());
        }
        match self.communicator.registry().running_endpoint(to) {
            Some(_) => Ok(()),
            None => Err(ContentsError::new(
                ErrorCode::ServerNotFound,
                format!("no running server {}", to),
            )),
        }
    }

    fn route(&self, packet: RoutePacket) {
        self.outbound.send(packet).ok();
    }

    /// Fire a notification at another server.
    pub fn send_packet(
        &self,
        to: &str,
        stage_id: i64,
        account_id: &str,
        is_base: bool,
        packet: Packet,
    ) -> ContentsResult<()> {
        self.check_target(to)?;
        let header = self.header_to(to, packet.msg_id(), stage_id, account_id, is_base);
        self.route(RoutePacket::new(header, packet.into_payload()));
        Ok(())
    }

    /// Send a request at another server and await its single outcome.
    pub async fn request_packet(
        &self,
        to: &str,
        stage_id: i64,
        account_id: &str,
        is_base: bool,
        packet: Packet,
    ) -> ContentsResult<Packet> {
        self.check_target(to)?;
        let (msg_seq, waiter) = self.request_cache.register(self.config.request_timeout);
        let mut header = self.header_to(to, packet.msg_id(), stage_id, account_id, is_base);
        header.msg_seq = msg_seq;
        self.route(RoutePacket::new(header, packet.into_payload()));
        let reply = waiter.wait().await?;
        if reply.header.error_code != 0 {
            return Err(ContentsError::code(
                reply.header.error_code,
                format!("{} rejected by {}", reply.header.msg_id, to),
            ));
        }
        Ok(reply.into_packet())
    }

    /// Ask a Play server to create a stage; resolves with the creation reply.
    pub async fn create_stage(
        &self,
        play_server_id: &str,
        stage_type: &str,
        stage_id: i64,
        packet: Packet,
    ) -> ContentsResult<Packet> {
        let body = encode_create_body(stage_type, packet.msg_id(), packet.view());
        let request = Packet::base(CREATE_STAGE_MSG_ID, Payload::from_vec(body));
        self.request_packet(play_server_id, stage_id, "", true, request).await
    }

    /// Route a reply for `header` back to its origin: the mesh when it came
    /// from a server, the session edge when it came from a local client.
    pub fn reply_to(&self, header: &RouteHeader, mut packet: Packet) {
        if header.msg_seq == 0 {
            warn!("reply to notification {}, dropped", header.msg_id);
            return;
        }
        if !header.from.is_empty() {
            let mut reply_header = header.reply_header(packet.error_code());
            reply_header.msg_id = packet.msg_id().to_owned();
            reply_header.from = self.config.server_id.clone();
            self.route(RoutePacket::new(reply_header, packet.into_payload()));
        } else if header.sid > 0 {
            packet.set_msg_seq(header.msg_seq);
            match self.edge() {
                Some(edge) => edge.send_client_reply(header.sid, packet),
                None => warn!("reply for sid {} without a session edge, dropped", header.sid),
            }
        } else {
            warn!("reply for {} has no route back", header.msg_id);
        }
    }

    /// Reply with an empty body carrying only an error code.
    pub fn reply_error_to(&self, header: &RouteHeader, error_code: u16) {
        let mut packet = Packet::base(&header.msg_id, Payload::empty());
        packet.set_error_code(error_code);
        self.reply_to(header, packet);
    }

    /// Push a packet to a client: straight through the local edge when it owns
    /// `sid`, otherwise one inter-server send to the owning session server.
    pub fn send_to_client(&self, session_server_id: &str, sid: u64, packet: Packet) -> ContentsResult<()> {
        if session_server_id.is_empty() || session_server_id == self.config.server_id {
            match self.edge() {
                Some(edge) => {
                    edge.send_client_reply(sid, packet);
                    Ok(())
                }
                None => Err(ContentsError::new(
                    ErrorCode::SystemError,
                    format!("no session edge owns sid {}", sid),
                )),
            }
        } else {
            self.check_target(session_server_id)?;
            let mut header = self.header_to(session_server_id, packet.msg_id(), packet.stage_id(), "", false);
            header.sid = sid;
            self.route(RoutePacket::new(header, packet.into_payload()));
            Ok(())
        }
    }
}

/// A server-level sender: the `SendTo*`/`RequestTo*` surface without a current
/// route header, for bootstrap and system work outside any handler.
#[derive(Clone)]
pub struct SystemSender {
    core: Arc<SenderCore>,
}

impl SystemSender {
    pub(crate) fn new(core: Arc<SenderCore>) -> Self {
        Self { core }
    }

    /// The id of the server this sender belongs to.
    pub fn server_id(&self) -> &str {
        self.core.server_id()
    }

    /// Fire a notification at an Api server.
    pub fn send_to_api(&self, server_id: &str, packet: Packet) -> ContentsResult<()> {
        self.core.send_packet(server_id, 0, "", false, packet)
    }

    /// Request/reply against an Api server.
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
}
