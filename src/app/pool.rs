// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The elastic worker pool shared by every stage on a server.

use futures::future::BoxFuture;
use log::*;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

type Job = BoxFuture<'static, ()>;

/// A shared task executor: one multi-producer multi-consumer queue of work
/// items drained by a variable number of workers. The pool grows up to `max`
/// when a job arrives and nobody is idle, and shrinks back to `min` as workers
/// sit idle past the timeout. A stage pump is one work item at a time, so
/// effective parallelism is `min(active stages, pool size)`.
pub struct WorkerPool {
    tx: Mutex<Option<flume::Sender<Job>>>,
    rx: flume::Receiver<Job>,
    min: usize,
    max: usize,
    idle_timeout: Duration,
    size: AtomicUsize,
    idle: AtomicUsize,
}

impl WorkerPool {
    /// Create the pool and spawn the minimum worker set. Must be called from
    /// within a tokio runtime.
    pub fn new(min: usize, max: usize, idle_timeout: Duration) -> Arc<Self> {
        let (tx, rx) = flume::unbounded();
        let min = min.max(1);
        let pool = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            rx,
            min,
            max: max.max(min),
            idle_timeout,
            size: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
        });
        for _ in 0..min {
            pool.spawn_worker();
        }
        pool
    }

    /// Submit one work item. After shutdown the job is dropped with a log.
    pub fn submit<F>(self: &Arc<Self>, job: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.idle.load(Ordering::SeqCst) == 0 && self.size.load(Ordering::SeqCst) < self.max {
            self.spawn_worker();
        }
        let tx = self.tx.lock().expect("worker pool poisoned");
        match tx.as_ref() {
            Some(tx) => {
                tx.send(Box::pin(job)).ok();
            }
            None => {
                warn!("work item submitted after pool shutdown, dropped");
            }
        }
    }

    /// Current worker count.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    /// Close the queue. Workers finish the jobs already queued, then exit.
    /// Calling this twice is a no-op.
    pub fn shutdown(&self) {
        self.tx.lock().expect("worker pool poisoned").take();
    }

    fn spawn_worker(self: &Arc<Self>) {
        self.size.fetch_add(1, Ordering::SeqCst);
        let pool = self.clone();
        tokio::spawn(async move {
            loop {
                pool.idle.fetch_add(1, Ordering::SeqCst);
                let received = tokio::time::timeout(pool.idle_timeout, pool.rx.recv_async()).await;
                pool.idle.fetch_sub(1, Ordering::SeqCst);
                match received {
                    Ok(Ok(job)) => job.await,
                    Ok(Err(_)) => break,
                    Err(_) => {
                        // idle past the timeout: retire if still above the floor
                        let current = pool.size.load(Ordering::SeqCst);
                        if current > pool.min
                            && pool
                                .size
                                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                                .is_ok()
                        {
                            return;
                        }
                    }
                }
            }
            pool.size.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn all_submitted_jobs_run() {
        let pool = WorkerPool::new(2, 8, Duration::from_millis(100));
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_expands_under_blocking_load_and_contracts_after_idle() {
        let pool = WorkerPool::new(1, 8, Duration::from_millis(50));
        let (release_tx, _) = tokio::sync::broadcast::channel::<()>(1);
        for _ in 0..4 {
            let mut release = release_tx.subscribe();
            pool.submit(async move {
                release.recv().await.ok();
            });
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pool.size() >= 4, "pool stayed at {}", pool.size());
        release_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn queued_jobs_still_run_after_shutdown_and_later_submits_are_dropped() {
        let pool = WorkerPool::new(1, 2, Duration::from_millis(50));
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        pool.shutdown();
        let late = counter.clone();
        pool.submit(async move {
            late.fetch_add(100, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
