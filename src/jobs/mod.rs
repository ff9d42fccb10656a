//! Bounded worker pool running backup, restore and cleanup jobs off the
//! request path.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type Job = BoxFuture<'static, ()>;

/// How a submitted job was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Queued,
    /// The queue was full (or closed) and the job ran on the caller.
    Inline,
}

pub struct WorkerPool {
    workers: usize,
    sender: mpsc::Sender<Job>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    started: AtomicBool,
}

impl WorkerPool {
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        WorkerPool {
            workers: workers.max(1),
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the worker loops. Calling it again is a no-op.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        (0..self.workers)
            .map(|id| {
                let receiver = Arc::clone(&self.receiver);
                tokio::spawn(worker_loop(id, receiver))
            })
            .collect()
    }

    /// Enqueues `task` without waiting for queue space. When the queue is
    /// full the task runs to completion on the caller instead of being dropped.
    pub async fn submit<F>(&self, task: F) -> Submission
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.sender.try_send(task.boxed()) {
            Ok(()) => Submission::Queued,
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!("Task queue is full, executing synchronously");
                run_guarded("inline", job).await;
                Submission::Inline
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                warn!("Task queue is closed, executing synchronously");
                run_guarded("inline", job).await;
                Submission::Inline
            }
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

async fn worker_loop(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) {
    info!(worker = id, "Worker started");
    loop {
        let job = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };
        match job {
            Some(job) => run_guarded(&format!("worker {}", id), job).await,
            None => break,
        }
    }
    debug!(worker = id, "Worker stopped, queue closed");
}

async fn run_guarded(runner: &str, job: Job) {
    if let Err(payload) = AssertUnwindSafe(job).catch_unwind().await {
        error!(runner, "Task panicked: {}", panic_message(payload.as_ref()));
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
