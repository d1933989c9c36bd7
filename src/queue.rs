use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, oneshot};

pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Type-erased task; resolves to `true` when the wrapped work succeeded.
pub type BoxedTask = Pin<Box<dyn Future<Output = bool> + Send + 'static>>;

pub struct QueuedTask {
    pub id: u64,
    pub(crate) run: BoxedTask,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queued task {0} was aborted before delivering a result")]
    TaskAborted(u64),
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub max_concurrent: usize,
    pub running: usize,
    pub queued: usize,
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Bounded-concurrency admission control in front of the container runtime.
///
/// Tasks wait in an unbounded FIFO backlog that is drained by exactly
/// `max_concurrent` workers (see [`crate::worker`]), so at most that many
/// tasks run at once and they start in arrival order. Excess load is queued,
/// never rejected.
pub struct ExecutionQueue {
    max_concurrent: usize,
    backlog: Mutex<VecDeque<QueuedTask>>,
    notify: Notify,
    running: AtomicUsize,
    next_id: AtomicU64,
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl ExecutionQueue {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        log::info!("Execution queue initialized with max_concurrent={max_concurrent}");

        Self {
            max_concurrent,
            backlog: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            running: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            total: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Appends `task` to the backlog immediately and returns a future that
    /// resolves to the task's own output.
    ///
    /// The task runs to completion even if the returned future is dropped.
    pub fn submit<F, T, E>(&self, task: F) -> impl Future<Output = Result<T, E>> + Send + 'static
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<QueueError> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let run: BoxedTask = Box::pin(async move {
            let output = task.await;
            let ok = output.is_ok();
            if tx.send(output).is_err() {
                log::debug!("Caller of queued task {id} went away before completion");
            }
            ok
        });

        self.total.fetch_add(1, Ordering::Relaxed);
        {
            let mut backlog = self.backlog.lock();
            let running = self.running.load(Ordering::Acquire);
            if running >= self.max_concurrent {
                log::info!(
                    "Execution {id} queued at position {} (running={running}, max={})",
                    backlog.len() + 1,
                    self.max_concurrent
                );
            }
            backlog.push_back(QueuedTask { id, run });
        }
        self.notify.notify_one();

        async move {
            match rx.await {
                Ok(output) => output,
                Err(_) => Err(E::from(QueueError::TaskAborted(id))),
            }
        }
    }

    /// Runs `task` once a slot frees up, strictly in arrival order.
    pub async fn enqueue<F, T, E>(&self, task: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<QueueError> + Send + 'static,
    {
        self.submit(task).await
    }

    /// Waits for the next task. Claims a running slot atomically with the
    /// removal from the backlog so `running + queued` never drops a task.
    pub async fn pop(&self) -> QueuedTask {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut backlog = self.backlog.lock();
                if let Some(task) = backlog.pop_front() {
                    self.running.fetch_add(1, Ordering::AcqRel);
                    if !backlog.is_empty() {
                        self.notify.notify_one();
                    }
                    return task;
                }
            }

            notified.await;
        }
    }

    /// Executes a popped task and releases its slot, whatever the outcome.
    pub async fn run_task(&self, worker_id: usize, task: QueuedTask) {
        let QueuedTask { id, run } = task;
        log::info!(
            "Execution {id} started on worker {worker_id} (running={}, queued={})",
            self.running.load(Ordering::Acquire),
            self.backlog.lock().len()
        );

        // A panicking task must not take the worker down with it.
        match tokio::spawn(run).await {
            Ok(true) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::error!("Execution {id} aborted on worker {worker_id}: {e}");
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.running.fetch_sub(1, Ordering::AcqRel);
        log::debug!("Execution {id} finished on worker {worker_id}");
    }

    pub fn stats(&self) -> QueueStats {
        let queued = self.backlog.lock().len();
        QueueStats {
            max_concurrent: self.max_concurrent,
            running: self.running.load(Ordering::Acquire),
            queued,
            total: self.total.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Tasks waiting plus tasks running.
    pub fn size(&self) -> usize {
        let stats = self.stats();
        stats.queued + stats.running
    }
}
