// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The server-to-server listener: one acceptor, one frame-reassembling reader
//! loop per inbound connection.

use super::Communicator;
use crate::comm::frame::{self, FRAME_PREFIX_LEN};
use log::*;
use std::{net::SocketAddr, sync::Arc};
use tokio::{io::AsyncReadExt, net::{TcpListener, TcpStream}, task::JoinHandle};

/// Bind the mesh endpoint and spawn the accept loop. Returns the bound
/// address (useful with port 0) and the acceptor handle.
pub(crate) async fn start(
    bind_endpoint: &str,
    communicator: Arc<Communicator>,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(bind_endpoint).await?;
    let local_addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("inbound mesh connection from {}", peer);
                    let communicator = communicator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = read_loop(stream, communicator).await {
                            debug!("mesh connection from {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("mesh accept failed: {}", e);
                }
            }
        }
    });
    Ok((local_addr, handle))
}

/// Reassemble length-prefixed frames from the stream and hand each decoded
/// envelope to the demultiplexer.
async fn read_loop(mut stream: TcpStream, communicator: Arc<Communicator>) -> anyhow::Result<()> {
    let max_body = communicator.max_packet_bytes();
    let mut acc: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; 16 * 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        acc.extend_from_slice(&chunk[..n]);
        while acc.len() >= FRAME_PREFIX_LEN {
            let mut prefix = [0u8; FRAME_PREFIX_LEN];
            prefix.copy_from_slice(&acc[..FRAME_PREFIX_LEN]);
            let body_len = u32::from_le_bytes(prefix) as usize;
            if body_len > max_body {
                anyhow::bail!("frame body of {} bytes exceeds the {} limit", body_len, max_body);
            }
            if acc.len() < FRAME_PREFIX_LEN + body_len {
                break;
            }
            match frame::decode(&acc[FRAME_PREFIX_LEN..FRAME_PREFIX_LEN + body_len], communicator.buffer_pool()) {
                Ok(packet) => communicator.demux(packet).await,
                Err(e) => {
                    // malformed body: the framing is still intact, drop and go on
                    warn!("dropping undecodable frame: {}", e);
                }
            }
            acc.drain(..FRAME_PREFIX_LEN + body_len);
        }
    }
}
