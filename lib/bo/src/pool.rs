// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Two-priority worker pool for organizer tasks.
//!
//! A fixed number of worker tasks drain two bounded FIFO queues. Dequeue
//! policy: if the high queue is non-empty, take from it; otherwise block on
//! both queues with high winning races. Fairness within a class is FIFO.
//!
//! Submission is non-blocking and fails with [`PoolError::QueueFull`] when
//! the class queue is at capacity. Shutdown is cooperative: workers finish
//! the task in hand and exit; queued-but-unstarted work is dropped.

use std::future::Future;
use std::pin::Pin;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A queued unit of work.
pub type BoJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Submission errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("task queue is full")]
    QueueFull,

    #[error("worker pool is shut down")]
    ShutDown,
}

/// Fixed-size pool draining a high- and a low-priority queue.
pub struct TaskPool {
    high_tx: flume::Sender<BoJob>,
    low_tx: flume::Sender<BoJob>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskPool {
    /// Spawn `num_workers` worker tasks on `runtime`, each queue bounded at
    /// `queue_capacity`.
    pub fn new(num_workers: usize, queue_capacity: usize, runtime: tokio::runtime::Handle) -> Self {
        let (high_tx, high_rx) = flume::bounded::<BoJob>(queue_capacity);
        let (low_tx, low_rx) = flume::bounded::<BoJob>(queue_capacity);
        let cancel = CancellationToken::new();

        let mut workers = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let high_rx = high_rx.clone();
            let low_rx = low_rx.clone();
            let cancel = cancel.clone();
            workers.push(runtime.spawn(worker_loop(worker_id, high_rx, low_rx, cancel)));
        }

        Self {
            high_tx,
            low_tx,
            cancel,
            workers: Mutex::new(workers),
        }
    }

    /// Submit a job. `high_priority` selects the queue.
    pub fn run<F>(&self, job: F, high_priority: bool) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = if high_priority {
            &self.high_tx
        } else {
            &self.low_tx
        };

        match tx.try_send(Box::pin(job)) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => Err(PoolError::QueueFull),
            Err(flume::TrySendError::Disconnected(_)) => Err(PoolError::ShutDown),
        }
    }

    /// Jobs currently queued at high priority.
    pub fn high_len(&self) -> usize {
        self.high_tx.len()
    }

    /// Jobs currently queued at low priority.
    pub fn low_len(&self) -> usize {
        self.low_tx.len()
    }

    /// Stop the workers and wait for them to exit. Tasks already dequeued
    /// finish; queued tasks are dropped.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock();
            guard.drain(..).collect()
        };
        for handle in workers {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    high_rx: flume::Receiver<BoJob>,
    low_rx: flume::Receiver<BoJob>,
    cancel: CancellationToken,
) {
    loop {
        // High preempts low for dequeue: never touch the low queue while a
        // high-priority task is waiting.
        match high_rx.try_recv() {
            Ok(job) => {
                job.await;
                continue;
            }
            Err(flume::TryRecvError::Empty) => {}
            Err(flume::TryRecvError::Disconnected) => break,
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = high_rx.recv_async() => match job {
                Ok(job) => job.await,
                Err(_) => break,
            },
            job = low_rx.recv_async() => match job {
                Ok(job) => job.await,
                Err(_) => break,
            },
        }
    }
    tracing::debug!(worker_id, "organizer worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_executes_submitted_jobs() {
        let pool = TaskPool::new(2, 64, tokio::runtime::Handle::current());
        let (tx, rx) = oneshot::channel();

        pool.run(
            async move {
                tx.send(42u32).unwrap();
            },
            false,
        )
        .unwrap();

        assert_eq!(rx.await.unwrap(), 42);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_queue_full_error() {
        let pool = TaskPool::new(1, 2, tokio::runtime::Handle::current());

        // Park the only worker so submissions stay queued.
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        pool.run(
            async move {
                let _ = started_tx.send(());
                let _ = gate_rx.await;
            },
            false,
        )
        .unwrap();
        started_rx.await.unwrap();

        pool.run(async {}, false).unwrap();
        pool.run(async {}, false).unwrap();
        assert_eq!(pool.run(async {}, false), Err(PoolError::QueueFull));

        // The high queue has its own bound.
        pool.run(async {}, true).unwrap();

        gate_tx.send(()).unwrap();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_high_priority_preempts_queued_low() {
        let pool = TaskPool::new(1, 256, tokio::runtime::Handle::current());
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        // Occupy the single worker until both queues are loaded.
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        pool.run(
            async move {
                let _ = gate_rx.await;
            },
            false,
        )
        .unwrap();

        for _ in 0..100 {
            let order = order.clone();
            pool.run(
                async move {
                    order.lock().push("low");
                },
                false,
            )
            .unwrap();
        }

        let (done_tx, done_rx) = oneshot::channel::<()>();
        {
            let order = order.clone();
            pool.run(
                async move {
                    order.lock().push("high");
                    let _ = done_tx.send(());
                },
                true,
            )
            .unwrap();
        }

        gate_tx.send(()).unwrap();
        done_rx.await.unwrap();

        // With one worker, the high task must start no later than the second
        // dequeued task overall.
        let executed = order.lock().clone();
        assert_eq!(executed.first(), Some(&"high"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drops_queued_work() {
        let pool = TaskPool::new(1, 64, tokio::runtime::Handle::current());
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        pool.run(
            async move {
                let _ = gate_rx.await;
            },
            false,
        )
        .unwrap();
        pool.run(async {}, false).unwrap();

        gate_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
            .await
            .expect("shutdown should not hang");
        assert_eq!(pool.run(async {}, false), Err(PoolError::ShutDown));
    }
}
