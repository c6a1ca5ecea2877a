// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Correlates outgoing requests with their future replies.

use crate::comm::{ContentsError, ContentsResult, ErrorCode, RoutePacket};
use log::*;
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

/// One-shot handle resolving with the reply, a timeout, or cancellation.
pub struct ReplyWaiter {
    rx: oneshot::Receiver<ContentsResult<RoutePacket>>,
}

impl ReplyWaiter {
    /// Wait for the single outcome of the request.
    pub async fn wait(self) -> ContentsResult<RoutePacket> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ContentsError::new(
                ErrorCode::InternalError,
                "reply slot dropped without an outcome",
            )),
        }
    }
}

struct Entry {
    tx: oneshot::Sender<ContentsResult<RoutePacket>>,
    deadline: Instant,
}

struct CacheInner {
    entries: Mutex<HashMap<u16, Entry>>,
    seq: AtomicU16,
    closed: AtomicBool,
}

impl CacheInner {
    fn expire(&self, msg_seq: u16, now: Instant) {
        let entry = {
            let mut entries = self.entries.lock().expect("request cache poisoned");
            match entries.get(&msg_seq) {
                // a wrapped sequence may have been reissued; only the entry
                // this deadline belongs to expires
                Some(entry) if entry.deadline <= now => entries.remove(&msg_seq),
                _ => None,
            }
        };
        if let Some(entry) = entry {
            entry
                .tx
                .send(Err(ContentsError::new(ErrorCode::RequestTimeout, "request timed out")))
                .ok();
        }
    }
}

/// The request cache: issues sequences, parks reply slots, and resolves each
/// exactly once with a reply, a `RequestTimeout`, or cancellation at shutdown.
/// Expiry runs on a single task over a deadline heap; a timed-out request
/// surfaces to its waiter the way a synthetic `@Timeout@` reply would.
pub struct RequestCache {
    inner: Arc<CacheInner>,
    expiry_tx: mpsc::UnboundedSender<(Instant, u16)>,
}

impl RequestCache {
    /// Create the cache and spawn its expiry loop. Must be called from within
    /// a tokio runtime.
    pub fn new() -> Arc<Self> {
        let inner = Arc::new(CacheInner {
            entries: Mutex::new(HashMap::new()),
            seq: AtomicU16::new(0),
            closed: AtomicBool::new(false),
        });
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        tokio::spawn(expiry_loop(Arc::downgrade(&inner), expiry_rx));
        Arc::new(Self { inner, expiry_tx })
    }

    /// Allocate a fresh sequence and park a reply slot for it. The returned
    /// waiter resolves within `timeout` one way or another.
    pub fn register(&self, timeout: Duration) -> (u16, ReplyWaiter) {
        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        if self.inner.closed.load(Ordering::SeqCst) {
            tx.send(Err(ContentsError::new(
                ErrorCode::SystemError,
                "request cancelled at shutdown",
            )))
            .ok();
            return (0, ReplyWaiter { rx });
        }
        let msg_seq = {
            let mut entries = self.inner.entries.lock().expect("request cache poisoned");
            loop {
                let candidate = self.inner.seq.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
                // 0 means notification; occupied sequences are still inside
                // their TTL window
                if candidate != 0 && !entries.contains_key(&candidate) {
                    entries.insert(candidate, Entry { tx, deadline });
                    break candidate;
                }
            }
        };
        self.expiry_tx.send((deadline, msg_seq)).ok();
        (msg_seq, ReplyWaiter { rx })
    }

    /// Resolve the slot for `msg_seq` with an inbound reply. Returns false for
    /// late or unknown replies, which the caller drops.
    pub fn try_complete(&self, msg_seq: u16, packet: RoutePacket) -> bool {
        let entry = {
            let mut entries = self.inner.entries.lock().expect("request cache poisoned");
            entries.remove(&msg_seq)
        };
        match entry {
            Some(entry) => {
                entry.tx.send(Ok(packet)).ok();
                true
            }
            None => false,
        }
    }

    /// Resolve the slot for `msg_seq` with a send-side failure, so the waiter
    /// does not sit out the full deadline.
    pub fn fail(&self, msg_seq: u16, error: ContentsError) -> bool {
        let entry = {
            let mut entries = self.inner.entries.lock().expect("request cache poisoned");
            entries.remove(&msg_seq)
        };
        match entry {
            Some(entry) => {
                entry.tx.send(Err(error)).ok();
                true
            }
            None => false,
        }
    }

    /// Resolve every outstanding slot with cancellation and refuse further
    /// registrations. Idempotent.
    pub fn cancel_all(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<Entry> = {
            let mut entries = self.inner.entries.lock().expect("request cache poisoned");
            entries.drain().map(|(_, entry)| entry).collect()
        };
        if !drained.is_empty() {
            info!("cancelling {} outstanding requests", drained.len());
        }
        for entry in drained {
            entry
                .tx
                .send(Err(ContentsError::new(
                    ErrorCode::SystemError,
                    "request cancelled at shutdown",
                )))
                .ok();
        }
    }

    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.inner.entries.lock().unwrap().len()
    }
}

async fn expiry_loop(cache: Weak<CacheInner>, mut rx: mpsc::UnboundedReceiver<(Instant, u16)>) {
    let mut heap: BinaryHeap<Reverse<(Instant, u16)>> = BinaryHeap::new();
    loop {
        let next = heap.peek().map(|Reverse((deadline, _))| *deadline);
        tokio::select! {
            registered = rx.recv() => match registered {
                Some(pair) => heap.push(Reverse(pair)),
                None => break,
            },
            _ = deadline_sleep(next) => {
                let now = Instant::now();
                while let Some(Reverse((deadline, msg_seq))) = heap.peek().copied() {
                    if deadline > now {
                        break;
                    }
                    heap.pop();
                    match cache.upgrade() {
                        Some(inner) => inner.expire(msg_seq, now),
                        None => return,
                    }
                }
            }
        }
    }
}

async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{Payload, RouteHeader};

    fn reply(msg_seq: u16) -> RoutePacket {
        RoutePacket::new(
            RouteHeader {
                msg_id: "EchoReply".into(),
                msg_seq,
                is_reply: true,
                ..Default::default()
            },
            Payload::empty(),
        )
    }

    #[tokio::test]
    async fn reply_resolves_the_waiter() {
        let cache = RequestCache::new();
        let (msg_seq, waiter) = cache.register(Duration::from_secs(5));
        assert!(cache.try_complete(msg_seq, reply(msg_seq)));
        let packet = waiter.wait().await.unwrap();
        assert_eq!(packet.header.msg_seq, msg_seq);
        assert_eq!(cache.outstanding(), 0);
    }

    #[tokio::test]
    async fn late_reply_is_dropped() {
        let cache = RequestCache::new();
        let (msg_seq, waiter) = cache.register(Duration::from_secs(5));
        assert!(cache.try_complete(msg_seq, reply(msg_seq)));
        assert!(!cache.try_complete(msg_seq, reply(msg_seq)));
        waiter.wait().await.unwrap();
    }

    #[tokio::test]
    async fn deadline_resolves_with_request_timeout_inside_the_window() {
        let cache = RequestCache::new();
        let started = std::time::Instant::now();
        let (_, waiter) = cache.register(Duration::from_millis(200));
        let err = waiter.wait().await.unwrap_err();
        let elapsed = started.elapsed();
        assert_eq!(err.code, ErrorCode::RequestTimeout as u16);
        assert!(elapsed >= Duration::from_millis(200), "fired early at {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(400), "fired late at {:?}", elapsed);
        assert_eq!(cache.outstanding(), 0);
    }

    #[tokio::test]
    async fn cancel_all_resolves_everything_and_blocks_new_registrations() {
        let cache = RequestCache::new();
        let (_, first) = cache.register(Duration::from_secs(30));
        let (_, second) = cache.register(Duration::from_secs(30));
        cache.cancel_all();
        cache.cancel_all();
        assert_eq!(first.wait().await.unwrap_err().code, ErrorCode::SystemError as u16);
        assert_eq!(second.wait().await.unwrap_err().code, ErrorCode::SystemError as u16);
        let (_, late) = cache.register(Duration::from_secs(30));
        assert_eq!(late.wait().await.unwrap_err().code, ErrorCode::SystemError as u16);
    }

    #[tokio::test]
    async fn sequences_skip_zero_and_occupied_slots() {
        let cache = RequestCache::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            let (msg_seq, _waiter) = cache.register(Duration::from_secs(30));
            assert_ne!(msg_seq, 0);
            assert!(seen.insert(msg_seq));
        }
    }
}
