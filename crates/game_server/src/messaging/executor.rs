//! The business worker pool.
//!
//! Every worker is a task draining its own queue one job at a time. Jobs for
//! the same non-zero identity always land on the same worker, so they run in
//! the order they were submitted; jobs without an identity are spread
//! round-robin.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, error};

type Job = BoxFuture<'static, ()>;

/// Fixed-size pool of identity-pinned workers.
///
/// Workers stop once the pool is dropped and their queues are drained.
#[derive(Debug)]
pub struct ExecutorPool {
    workers: Vec<mpsc::UnboundedSender<Job>>,
    next_worker: AtomicUsize,
}

impl ExecutorPool {
    /// Spawns `size` workers on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let workers = (0..size)
            .map(|index| {
                let (sender, receiver) = mpsc::unbounded_channel();
                tokio::spawn(run_worker(index, receiver));
                sender
            })
            .collect();
        debug!("🧵 Started {} business workers", size);

        Self {
            workers,
            next_worker: AtomicUsize::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Worker that runs jobs for `identity`.
    pub fn worker_for(&self, identity: i64) -> usize {
        if identity > 0 {
            (identity as u64 % self.workers.len() as u64) as usize
        } else {
            self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len()
        }
    }

    /// Queues `job` on the worker owning `identity`.
    pub fn execute<F>(&self, identity: i64, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let worker = self.worker_for(identity);
        if self.workers[worker].send(job.boxed()).is_err() {
            error!("Business worker {} has stopped; dropping job", worker);
        }
    }
}

async fn run_worker(index: usize, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
            error!("💥 Job on worker {} panicked: {}", index, panic_message(&*panic));
        }
    }
    debug!("Business worker {} stopped", index);
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_identity_runs_in_arrival_order() {
        let pool = ExecutorPool::new(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();
        let mut done_tx = Some(done_tx);

        for i in 0..200u64 {
            let seen = seen.clone();
            let done = if i == 199 { done_tx.take() } else { None };
            pool.execute(42, async move {
                // Uneven work so a reordering would show up.
                if i % 7 == 0 {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                seen.lock().unwrap().push(i);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            });
        }

        tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .expect("Jobs should finish")
            .expect("Last job should signal");
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..200).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_worker_selection() {
        let pool = ExecutorPool::new(4);
        assert_eq!(pool.worker_for(42), pool.worker_for(42));
        assert_eq!(pool.worker_for(5), 1);

        let anonymous: Vec<_> = (0..4).map(|_| pool.worker_for(0)).collect();
        let mut sorted = anonymous.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2, 3], "round robin should visit every worker");
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_worker() {
        let pool = ExecutorPool::new(1);
        pool.execute(1, async { panic!("handler exploded") });

        let (tx, rx) = oneshot::channel();
        pool.execute(1, async move {
            let _ = tx.send("still alive");
        });
        let result = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("Worker should keep running")
            .unwrap();
        assert_eq!(result, "still alive");
    }
}
