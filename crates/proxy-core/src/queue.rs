use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    pulse::{Pulse, PulseListener},
    task::FetchTask,
};

/// Errors returned by fetch-queue operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The consumer side of the queue is gone.
    #[error("fetch task queue is closed")]
    Closed,
}

/// Producer side of the unbounded backfill work queue.
///
/// Pushing never blocks. The queue does not deduplicate: callers enforce the
/// one-task-per-room invariant against the task store before enqueueing.
#[derive(Debug, Clone)]
pub struct FetchTaskQueue {
    tx: mpsc::UnboundedSender<FetchTask>,
    new_task: Pulse,
}

/// Consumer side of the queue, held by the single history fetcher.
#[derive(Debug)]
pub struct FetchTaskReceiver {
    rx: mpsc::UnboundedReceiver<FetchTask>,
}

impl FetchTaskQueue {
    /// Create a queue and return it with its single consumer.
    pub fn new() -> (Self, FetchTaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                new_task: Pulse::new(),
            },
            FetchTaskReceiver { rx },
        )
    }

    /// Enqueue one task and raise the `new_fetch_task` pulse.
    ///
    /// The pulse fires for every enqueue, whether the task came from gap
    /// detection, a continuation, or a queue rebuild on startup.
    pub fn push(&self, task: FetchTask) -> Result<(), QueueError> {
        self.tx.send(task).map_err(|_| QueueError::Closed)?;
        self.new_task.emit();
        Ok(())
    }

    /// Subscribe to enqueue notifications.
    pub fn subscribe_new_task(&self) -> PulseListener {
        self.new_task.subscribe()
    }
}

impl FetchTaskReceiver {
    /// Receive the next task in FIFO order.
    ///
    /// Returns `None` once every producer handle has been dropped and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<FetchTask> {
        self.rx.recv().await
    }
}
