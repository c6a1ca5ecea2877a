// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The outbound side of one peer connection: a writer event loop with
//! reconnect and queue watermarks.

use crate::comm::{frame, RoutePacket};
use anyhow::bail;
use log::*;
use rand::Rng;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{io::AsyncWriteExt, net::TcpStream, sync::mpsc};

const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_millis(5_000);

/// One outbound link. Packets are queued here and written by a dedicated
/// event loop; the TCP connection is opened lazily on first use and reopened
/// with bounded exponential backoff after a loss.
pub(crate) struct Link {
    endpoint: String,
    tx: mpsc::Sender<RoutePacket>,
    pending: Arc<AtomicUsize>,
    high_water: usize,
    hard_cap: usize,
    closed: Arc<AtomicBool>,
}

impl Link {
    /// Open the link to `endpoint` and spawn its writer loop.
    pub fn open(endpoint: String, high_water: usize, hard_cap: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(hard_cap);
        let pending = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(writer_loop(endpoint.clone(), rx, pending.clone(), closed.clone()));
        Arc::new(Self {
            endpoint,
            tx,
            pending,
            high_water,
            hard_cap,
            closed,
        })
    }

    /// Queue one packet for the peer. Below the high watermark this never
    /// waits; between the watermarks the caller blocks on queue space; at the
    /// hard cap the packet is dropped and the error surfaces to the sender.
    pub async fn push(&self, packet: RoutePacket) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("link to {} is closed", self.endpoint);
        }
        let depth = self.pending.fetch_add(1, Ordering::SeqCst);
        if depth >= self.hard_cap {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            bail!("outbound queue to {} at hard cap ({})", self.endpoint, self.hard_cap);
        }
        let result = if depth >= self.high_water {
            self.tx.send(packet).await
        } else {
            match self.tx.try_send(packet) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(packet)) => self.tx.send(packet).await,
                Err(mpsc::error::TrySendError::Closed(packet)) => Err(mpsc::error::SendError(packet)),
            }
        };
        if result.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            bail!("link to {} is gone", self.endpoint);
        }
        Ok(())
    }

    /// Stop the writer loop. Queued packets are abandoned; outstanding
    /// requests time out through the request cache.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// The peer endpoint this link writes to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

async fn writer_loop(
    endpoint: String,
    mut rx: mpsc::Receiver<RoutePacket>,
    pending: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
) {
    let mut backoff = BACKOFF_INITIAL;
    'reconnect: loop {
        if closed.load(Ordering::SeqCst) {
            return;
        }
        let mut stream = match TcpStream::connect(&endpoint).await {
            Ok(stream) => {
                debug!("link to {} connected", endpoint);
                backoff = BACKOFF_INITIAL;
                stream
            }
            Err(e) => {
                debug!("link to {} unreachable: {}, retrying in {:?}", endpoint, e, backoff);
                tokio::time::sleep(jittered(backoff)).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
                continue;
            }
        };
        while let Some(packet) = rx.recv().await {
            pending.fetch_sub(1, Ordering::SeqCst);
            if closed.load(Ordering::SeqCst) {
                return;
            }
            let frame = match frame::encode(&packet) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("dropping unencodable packet for {}: {}", endpoint, e);
                    continue;
                }
            };
            if let Err(e) = stream.write_all(&frame).await {
                warn!("link to {} lost while writing {}: {}", endpoint, packet.header.msg_id, e);
                continue 'reconnect;
            }
        }
        // all senders dropped: the link was removed from the table
        return;
    }
}

fn jittered(backoff: Duration) -> Duration {
    let base = backoff.as_millis() as u64;
    backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=base / 4 + 1))
}
