//! Worker pool for concurrent step execution.
//!
//! The `WorkerPool` runs step invocations on tokio tasks, enforcing the
//! concurrency limit. Each worker reports back exactly once through the event
//! channel, either with the step's result or as cancelled.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::mlog_debug;
use crate::orchestration::step::{ExternalStep, Invocation, StepStatus};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What a worker ended with.
#[derive(Debug)]
pub enum WorkerOutcome {
    /// The step returned.
    Finished(Result<StepStatus>),
    /// The run was cancelled while the step was in flight.
    Cancelled,
}

/// Events emitted by workers.
#[derive(Debug)]
pub enum WorkerEvent {
    Finished {
        task_id: TaskId,
        attempt: u32,
        outcome: WorkerOutcome,
    },
}

/// Manages the set of running workers.
pub struct WorkerPool {
    /// Running workers by task.
    active: HashMap<TaskId, JoinHandle<()>>,
    max_concurrent: usize,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Create a pool running at most `max_concurrent` steps at once.
    pub fn new(max_concurrent: usize, event_tx: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Self {
            active: HashMap::new(),
            max_concurrent,
            event_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Start a worker for one attempt of a task.
    ///
    /// # Errors
    ///
    /// Returns `WorkerPoolFull` if the pool is at capacity.
    pub fn spawn(&mut self, step: Arc<dyn ExternalStep>, invocation: Invocation) -> Result<()> {
        if !self.has_capacity() {
            return Err(Error::WorkerPoolFull {
                max: self.max_concurrent,
            });
        }

        let task_id = invocation.task.clone();
        let attempt = invocation.attempt;
        let cancel = self.cancel.child_token();
        let event_tx = self.event_tx.clone();

        mlog_debug!("WorkerPool::spawn {} attempt {}", task_id, attempt);

        let reported_id = task_id.clone();
        let handle = tokio::spawn(async move {
            // A panicking step must still report, or its slot is never released.
            let execution = AssertUnwindSafe(async { step.execute(&invocation).await })
                .catch_unwind()
                .map(|caught| {
                    caught.unwrap_or_else(|payload| {
                        Err(Error::TaskJoin(format!(
                            "step {} panicked: {}",
                            step.describe(),
                            panic_message(payload.as_ref())
                        )))
                    })
                });
            let outcome = tokio::select! {
                _ = cancel.cancelled() => WorkerOutcome::Cancelled,
                result = execution => WorkerOutcome::Finished(result),
            };
            let _ = event_tx.send(WorkerEvent::Finished {
                task_id: reported_id,
                attempt,
                outcome,
            });
        });
        self.active.insert(task_id, handle);
        Ok(())
    }

    /// Release the slot held by a task whose event has been received.
    pub fn finish(&mut self, task_id: &TaskId) {
        self.active.remove(task_id);
    }

    /// Cancel every running worker. Each still reports `Cancelled`.
    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_running(&self, task_id: &TaskId) -> bool {
        self.active.contains_key(task_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.max_concurrent
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for handle in self.active.values() {
            handle.abort();
        }
    }
}
