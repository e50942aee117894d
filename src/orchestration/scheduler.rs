//! Scheduler for parallel task execution.
//!
//! The Scheduler drives a sealed `TaskGraph` to completion: it promotes tasks
//! whose upstream work is done, skips those whose outputs are already fresh,
//! dispatches the rest to the worker pool under the concurrency limit, and
//! decides after each attempt whether to retry with escalated resources, fail
//! permanently and poison the downstream tasks, or cancel the whole run.

use crate::core::dag::TaskGraph;
use crate::core::task::{TaskId, TaskStatus};
use crate::core::template::Resources;
use crate::error::{Error, Result};
use crate::orchestration::freshness;
use crate::orchestration::pool::{WorkerEvent, WorkerOutcome, WorkerPool};
use crate::orchestration::step::{Invocation, StepStatus};
use crate::{mlog, mlog_debug, mlog_error, mlog_warn};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Events emitted by the scheduler for task lifecycle changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    TaskStarted {
        task_id: TaskId,
        attempt: u32,
        resources: Resources,
    },
    /// Outputs were fresh; nothing was dispatched.
    TaskUpToDate { task_id: TaskId },
    TaskSucceeded { task_id: TaskId },
    /// An attempt failed and the task goes back to the ready set.
    TaskRetrying {
        task_id: TaskId,
        attempt: u32,
        error: String,
    },
    /// The task failed permanently.
    TaskFailed { task_id: TaskId, error: String },
    TaskPoisoned { task_id: TaskId, ancestor: TaskId },
    RunCancelled { reason: String },
    AllTasksComplete,
}

/// A task that failed permanently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedTask {
    pub task: TaskId,
    pub attempts: u32,
    pub error: String,
}

/// A task skipped because of a failed ancestor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoisonedTask {
    pub task: TaskId,
    pub ancestor: TaskId,
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Tasks that ran and succeeded.
    pub succeeded: Vec<TaskId>,
    /// Tasks skipped because their outputs were fresh.
    pub up_to_date: Vec<TaskId>,
    pub failed: Vec<FailedTask>,
    pub poisoned: Vec<PoisonedTask>,
    pub cancelled: Vec<TaskId>,
    /// Step invocations, retries included.
    pub invocations: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.poisoned.is_empty() && self.cancelled.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut summary = format!(
            "{} succeeded, {} up to date, {} failed, {} skipped, {} cancelled ({} invocations)",
            self.succeeded.len(),
            self.up_to_date.len(),
            self.failed.len(),
            self.poisoned.len(),
            self.cancelled.len(),
            self.invocations
        );
        for failed in &self.failed {
            summary.push_str(&format!(
                "\n  {} failed after {} attempt(s): {}",
                failed.task, failed.attempts, failed.error
            ));
        }
        summary
    }
}

/// Scheduler for parallel task execution.
///
/// # Example
///
/// ```ignore
/// let graph = GraphBuilder::new(&out).build(&templates, &samples)?;
/// let mut scheduler = Scheduler::new(graph, &out, 4);
/// let report = scheduler.run().await?;
/// ```
pub struct Scheduler {
    graph: TaskGraph,
    workdir: PathBuf,
    workers: usize,
    event_tx: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    cancel: CancellationToken,
    invocations: usize,
}

impl Scheduler {
    /// Create a scheduler over a sealed graph.
    ///
    /// Steps run with `workdir` as their working directory; at most
    /// `workers` run at once.
    pub fn new(graph: TaskGraph, workdir: impl Into<PathBuf>, workers: usize) -> Self {
        Self {
            graph,
            workdir: workdir.into(),
            workers: workers.max(1),
            event_tx: None,
            cancel: CancellationToken::new(),
            invocations: 0,
        }
    }

    /// Send lifecycle events to an observer.
    pub fn with_events(mut self, event_tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Use an external token to cancel the run (e.g. on Ctrl-C).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn into_graph(self) -> TaskGraph {
        self.graph
    }

    /// Tasks that a run would dispatch, in dependency order.
    ///
    /// A task is scheduled when its outputs are stale or when anything
    /// upstream of it is scheduled.
    pub fn planned(&self) -> Vec<TaskId> {
        let mut scheduled: Vec<TaskId> = Vec::new();
        for task in self.graph.topological_order() {
            let upstream_runs = self
                .graph
                .dependencies(&task.id)
                .iter()
                .any(|dep| scheduled.contains(&dep.id));
            if upstream_runs || !freshness::is_up_to_date(task) {
                scheduled.push(task.id.clone());
            }
        }
        scheduled
    }

    /// Run until every task is terminal.
    ///
    /// Task failures are reported in the `RunReport`, not as `Err`. An `Err`
    /// means the scheduler itself could not proceed.
    pub async fn run(&mut self) -> Result<RunReport> {
        if !self.graph.is_sealed() {
            return Err(Error::Validation(
                "task graph must be sealed before scheduling".to_string(),
            ));
        }

        let started_at = Utc::now();
        let (worker_tx, mut worker_rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::new(self.workers, worker_tx);
        let cancel = self.cancel.clone();

        mlog!(
            "Scheduling {} tasks with {} worker(s)",
            self.graph.task_count(),
            self.workers
        );

        loop {
            if !cancel.is_cancelled() {
                self.promote();
                self.dispatch(&mut pool)?;
            }

            if pool.active_count() == 0 {
                break;
            }

            tokio::select! {
                Some(event) = worker_rx.recv() => self.handle_event(event, &mut pool),
                _ = cancel.cancelled(), if !pool.is_cancelled() => {
                    mlog_warn!("Run cancelled; stopping {} running task(s)", pool.active_count());
                    pool.cancel_all();
                    self.emit(SchedulerEvent::RunCancelled {
                        reason: "cancellation requested".to_string(),
                    });
                }
                else => break,
            }
        }

        for id in self.graph.topological_ids() {
            if let Some(task) = self.graph.get_task_mut(&id) {
                if !task.status.is_terminal() {
                    task.cancel();
                }
            }
        }

        self.emit(SchedulerEvent::AllTasksComplete);
        let report = self.report(started_at);
        mlog!("Run finished: {}", report.summary());
        Ok(report)
    }

    /// Move pending tasks forward once their upstream tasks have succeeded.
    fn promote(&mut self) {
        for id in self.graph.topological_ids() {
            let Some(task) = self.graph.get_task(&id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }

            let deps = self.graph.dependencies(&id);
            if !deps.iter().all(|d| d.status.is_succeeded()) {
                continue;
            }
            let upstream_ran = deps
                .iter()
                .any(|d| d.status == TaskStatus::Succeeded { up_to_date: false });
            let fresh = !upstream_ran && freshness::is_up_to_date(task);

            if let Some(task) = self.graph.get_task_mut(&id) {
                if fresh {
                    mlog_debug!("{} is up to date", id);
                    task.succeed(true);
                    self.emit(SchedulerEvent::TaskUpToDate { task_id: id });
                } else {
                    task.mark_ready();
                }
            }
        }
    }

    /// Start ready tasks while workers are free.
    fn dispatch(&mut self, pool: &mut WorkerPool) -> Result<()> {
        for id in self.graph.topological_ids() {
            if !pool.has_capacity() {
                break;
            }
            let Some(task) = self.graph.get_task_mut(&id) else {
                continue;
            };
            if task.status != TaskStatus::Ready {
                continue;
            }

            let attempt = task.attempts + 1;
            let wanted = task
                .template()
                .resources
                .request(freshness::total_input_bytes(task), attempt);

            if let Err(e) = freshness::prepare_outputs(task) {
                task.start(wanted);
                self.on_failure(&id, e.to_string(), false, pool);
                continue;
            }

            let resources = task.start(wanted);
            let step = task.template().step.clone();
            let invocation = Invocation {
                task: id.clone(),
                sample: task.sample().map(String::from),
                inputs: task.inputs.clone(),
                outputs: task.outputs.clone(),
                resources,
                workdir: self.workdir.clone(),
                attempt,
            };

            mlog!("Starting {} (attempt {}, {})", id, attempt, resources);
            pool.spawn(step, invocation)?;
            self.invocations += 1;
            self.emit(SchedulerEvent::TaskStarted {
                task_id: id,
                attempt,
                resources,
            });
        }
        Ok(())
    }

    fn handle_event(&mut self, event: WorkerEvent, pool: &mut WorkerPool) {
        let WorkerEvent::Finished {
            task_id,
            attempt,
            outcome,
        } = event;
        pool.finish(&task_id);

        match outcome {
            WorkerOutcome::Cancelled => {
                if let Some(task) = self.graph.get_task_mut(&task_id) {
                    if let Err(e) = freshness::remove_outputs(task) {
                        mlog_warn!("Could not clean outputs of {}: {}", task_id, e);
                    }
                    task.cancel();
                }
            }
            WorkerOutcome::Finished(Ok(StepStatus::Success)) => {
                let verified = match self.graph.get_task(&task_id) {
                    Some(task) => freshness::verify_outputs(task),
                    None => return,
                };
                match verified {
                    Ok(()) => {
                        if let Some(task) = self.graph.get_task_mut(&task_id) {
                            task.succeed(false);
                        }
                        mlog!("{} succeeded on attempt {}", task_id, attempt);
                        self.emit(SchedulerEvent::TaskSucceeded { task_id });
                    }
                    Err(e) => self.on_failure(&task_id, e.to_string(), true, pool),
                }
            }
            WorkerOutcome::Finished(Ok(StepStatus::Failed { message, retryable })) => {
                self.on_failure(&task_id, message, retryable, pool);
            }
            WorkerOutcome::Finished(Err(e)) => {
                let retryable = !matches!(
                    e,
                    Error::InsufficientSamples { .. }
                        | Error::MalformedInput(_)
                        | Error::ToolNotFound(_)
                        | Error::Validation(_)
                );
                self.on_failure(&task_id, e.to_string(), retryable, pool);
            }
        }
    }

    fn on_failure(&mut self, id: &TaskId, message: String, retryable: bool, pool: &WorkerPool) {
        let cancelled = pool.is_cancelled() || self.cancel.is_cancelled();
        let Some(task) = self.graph.get_task_mut(id) else {
            return;
        };
        if let Err(e) = freshness::remove_outputs(task) {
            mlog_warn!("Could not clean outputs of {}: {}", id, e);
        }

        if cancelled {
            task.cancel();
            return;
        }

        if retryable && task.can_retry() {
            let attempt = task.attempts;
            mlog_warn!(
                "{} failed on attempt {}/{}; retrying: {}",
                id,
                attempt,
                task.max_attempts(),
                message
            );
            task.mark_ready();
            self.emit(SchedulerEvent::TaskRetrying {
                task_id: id.clone(),
                attempt,
                error: message,
            });
            return;
        }

        task.fail(&message);
        let fatal = task.is_fatal();
        mlog_error!("{} failed after {} attempt(s): {}", id, task.attempts, message);
        self.emit(SchedulerEvent::TaskFailed {
            task_id: id.clone(),
            error: message,
        });

        for descendant in self.graph.descendants(id) {
            if let Some(task) = self.graph.get_task_mut(&descendant) {
                if !task.status.is_terminal() {
                    task.poison(id);
                    self.emit(SchedulerEvent::TaskPoisoned {
                        task_id: descendant,
                        ancestor: id.clone(),
                    });
                }
            }
        }

        if fatal {
            mlog_error!("{} is fatal; cancelling the run", id);
            self.cancel.cancel();
            pool.cancel_all();
            self.emit(SchedulerEvent::RunCancelled {
                reason: format!("{} failed", id),
            });
        }
    }

    fn report(&self, started_at: DateTime<Utc>) -> RunReport {
        let mut report = RunReport {
            succeeded: Vec::new(),
            up_to_date: Vec::new(),
            failed: Vec::new(),
            poisoned: Vec::new(),
            cancelled: Vec::new(),
            invocations: self.invocations,
            started_at,
            finished_at: Utc::now(),
        };
        for task in self.graph.topological_order() {
            match &task.status {
                TaskStatus::Succeeded { up_to_date: true } => report.up_to_date.push(task.id.clone()),
                TaskStatus::Succeeded { up_to_date: false } => {
                    report.succeeded.push(task.id.clone())
                }
                TaskStatus::Failed { error, attempts } => report.failed.push(FailedTask {
                    task: task.id.clone(),
                    attempts: *attempts,
                    error: error.clone(),
                }),
                TaskStatus::Poisoned { ancestor } => report.poisoned.push(PoisonedTask {
                    task: task.id.clone(),
                    ancestor: ancestor.clone(),
                }),
                _ => report.cancelled.push(task.id.clone()),
            }
        }
        report
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}
