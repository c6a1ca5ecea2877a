// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The process-wide timer service feeding tick messages into stage queues.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};

/// How a timer repeats.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires until cancelled.
    Repeat,
    /// Fires exactly `n` times, then is forgotten.
    Count(u32),
}

/// A tick produced by the wheel, to be enqueued into the owning stage.
#[derive(Debug, Copy, Clone)]
pub(crate) struct TimerFired {
    pub stage_id: i64,
    pub timer_id: i64,
}

enum Command {
    Register {
        timer_id: i64,
        stage_id: i64,
        initial_delay: Duration,
        period: Duration,
        kind: TimerKind,
    },
    Cancel {
        timer_id: i64,
    },
}

/// One wheel per process: a deadline heap driven by a single task. Fires are
/// delivered to the sink channel; the Play dispatcher forwards them into the
/// owning stage's queue, so callbacks run under stage serialization.
pub(crate) struct TimerService {
    tx: mpsc::UnboundedSender<Command>,
    next_id: AtomicI64,
}

impl TimerService {
    /// Spawn the wheel task. Must be called from within a tokio runtime.
    pub fn start(sink: mpsc::UnboundedSender<TimerFired>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(wheel_loop(rx, sink));
        Arc::new(Self {
            tx,
            next_id: AtomicI64::new(1),
        })
    }

    /// Schedule a timer for `stage_id`; returns the process-unique timer id.
    pub fn register(&self, stage_id: i64, initial_delay: Duration, period: Duration, kind: TimerKind) -> i64 {
        let timer_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(Command::Register {
                timer_id,
                stage_id,
                initial_delay,
                period,
                kind,
            })
            .ok();
        timer_id
    }

    /// Cancel a timer; pending ticks for it are discarded by the stage.
    pub fn cancel(&self, timer_id: i64) {
        self.tx.send(Command::Cancel { timer_id }).ok();
    }
}

struct Scheduled {
    stage_id: i64,
    period: Duration,
    remaining: Option<u32>,
}

async fn wheel_loop(mut rx: mpsc::UnboundedReceiver<Command>, sink: mpsc::UnboundedSender<TimerFired>) {
    let mut heap: BinaryHeap<Reverse<(Instant, i64)>> = BinaryHeap::new();
    let mut table: HashMap<i64, Scheduled> = HashMap::new();
    loop {
        let next = heap.peek().map(|Reverse((at, _))| *at);
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Register { timer_id, stage_id, initial_delay, period, kind }) => {
                    let remaining = match kind {
                        TimerKind::Repeat => None,
                        TimerKind::Count(n) => Some(n),
                    };
                    if remaining == Some(0) {
                        continue;
                    }
                    table.insert(timer_id, Scheduled { stage_id, period, remaining });
                    heap.push(Reverse((Instant::now() + initial_delay, timer_id)));
                }
                Some(Command::Cancel { timer_id }) => {
                    table.remove(&timer_id);
                }
                None => break,
            },
            _ = fire_sleep(next) => {
                let now = Instant::now();
                while let Some(Reverse((at, timer_id))) = heap.peek().copied() {
                    if at > now {
                        break;
                    }
                    heap.pop();
                    let entry = match table.get_mut(&timer_id) {
                        Some(entry) => entry,
                        None => continue, // cancelled
                    };
                    if sink.send(TimerFired { stage_id: entry.stage_id, timer_id }).is_err() {
                        return;
                    }
                    match entry.remaining.as_mut() {
                        Some(remaining) => {
                            *remaining -= 1;
                            if *remaining == 0 {
                                table.remove(&timer_id);
                            } else {
                                heap.push(Reverse((at + entry.period, timer_id)));
                            }
                        }
                        None => {
                            heap.push(Reverse((at + entry.period, timer_id)));
                        }
                    }
                }
            }
        }
    }
}

async fn fire_sleep(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeat_timer_keeps_firing() {
        let (sink, mut ticks) = mpsc::unbounded_channel();
        let service = TimerService::start(sink);
        let started = std::time::Instant::now();
        let timer_id = service.register(5, Duration::from_millis(50), Duration::from_millis(50), TimerKind::Repeat);
        for _ in 0..3 {
            let fired = ticks.recv().await.unwrap();
            assert_eq!(fired.stage_id, 5);
            assert_eq!(fired.timer_id, timer_id);
        }
        // three fires take at least three periods minus scheduling slack
        assert!(started.elapsed() >= Duration::from_millis(140));
        service.cancel(timer_id);
    }

    #[tokio::test]
    async fn count_timer_fires_exactly_n_times() {
        let (sink, mut ticks) = mpsc::unbounded_channel();
        let service = TimerService::start(sink);
        service.register(9, Duration::from_millis(10), Duration::from_millis(10), TimerKind::Count(3));
        let mut fired = 0;
        while let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(300), ticks.recv()).await {
            fired += 1;
        }
        assert_eq!(fired, 3);
    }

    #[tokio::test]
    async fn cancelled_timer_stops_ticking() {
        let (sink, mut ticks) = mpsc::unbounded_channel();
        let service = TimerService::start(sink);
        let timer_id = service.register(1, Duration::from_millis(30), Duration::from_millis(30), TimerKind::Repeat);
        ticks.recv().await.unwrap();
        service.cancel(timer_id);
        assert!(
            tokio::time::timeout(Duration::from_millis(150), ticks.recv()).await.is_err(),
            "tick after cancel"
        );
    }
}
