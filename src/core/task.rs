//! Task data model for the execution DAG.
//!
//! A task is a rule template bound to one sample (or to the whole sample set)
//! with every path resolved. It tracks its lifecycle state, attempt count and
//! the last resource request it was dispatched with.

use crate::core::template::{Resources, RuleTemplate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The binding key of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    /// Bound to one sample.
    Sample(String),
    /// Bound to the full ordered sample list.
    All,
}

impl Binding {
    pub fn sample(&self) -> Option<&str> {
        match self {
            Binding::Sample(id) => Some(id),
            Binding::All => None,
        }
    }
}

impl std::fmt::Display for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Binding::Sample(id) => write!(f, "{}", id),
            Binding::All => write!(f, "*"),
        }
    }
}

/// Identity of a task: (rule name, binding key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub rule: String,
    pub binding: Binding,
}

impl TaskId {
    pub fn new(rule: impl Into<String>, binding: Binding) -> Self {
        Self {
            rule: rule.into(),
            binding,
        }
    }

    pub fn for_sample(rule: impl Into<String>, sample: impl Into<String>) -> Self {
        Self::new(rule, Binding::Sample(sample.into()))
    }

    pub fn aggregate(rule: impl Into<String>) -> Self {
        Self::new(rule, Binding::All)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.rule, self.binding)
    }
}

/// Task status in its lifecycle.
///
/// `Pending -> Ready -> Running -> Succeeded | Failed`, with `Failed -> Ready`
/// while attempts remain. `Poisoned` and `Cancelled` are terminal states for
/// tasks that never got to run to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting on upstream tasks.
    Pending,
    /// Upstream satisfied; waiting for a worker.
    Ready,
    Running,
    Succeeded {
        /// Outputs were already fresh; nothing was dispatched.
        up_to_date: bool,
    },
    Failed {
        error: String,
        attempts: u32,
    },
    /// Skipped because an upstream task failed permanently.
    Poisoned { ancestor: TaskId },
    /// Stopped or never started because the run was cancelled.
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded { .. }
                | TaskStatus::Failed { .. }
                | TaskStatus::Poisoned { .. }
                | TaskStatus::Cancelled
        )
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, TaskStatus::Succeeded { .. })
    }

    /// Failed, either directly or through a failed ancestor.
    pub fn is_failed(&self) -> bool {
        matches!(self, TaskStatus::Failed { .. } | TaskStatus::Poisoned { .. })
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded { up_to_date: true } => write!(f, "up to date"),
            TaskStatus::Succeeded { up_to_date: false } => write!(f, "succeeded"),
            TaskStatus::Failed { error, attempts } => {
                write!(f, "failed after {} attempt(s): {}", attempts, error)
            }
            TaskStatus::Poisoned { ancestor } => {
                write!(f, "skipped because {} failed", ancestor)
            }
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A resolved path attached to a named port.
///
/// Aggregate tasks carry several paths under the same port name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamedPath {
    pub name: String,
    pub path: String,
}

impl NamedPath {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// A single task in the execution DAG.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub inputs: Vec<NamedPath>,
    pub outputs: Vec<NamedPath>,
    pub status: TaskStatus,
    /// Dispatches so far.
    pub attempts: u32,
    pub last_request: Option<Resources>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    template: Arc<RuleTemplate>,
}

impl Task {
    pub fn new(
        id: TaskId,
        template: Arc<RuleTemplate>,
        inputs: Vec<NamedPath>,
        outputs: Vec<NamedPath>,
    ) -> Self {
        Self {
            id,
            inputs,
            outputs,
            status: TaskStatus::Pending,
            attempts: 0,
            last_request: None,
            started_at: None,
            finished_at: None,
            template,
        }
    }

    pub fn template(&self) -> &Arc<RuleTemplate> {
        &self.template
    }

    pub fn sample(&self) -> Option<&str> {
        self.id.binding.sample()
    }

    pub fn max_attempts(&self) -> u32 {
        self.template.max_attempts
    }

    pub fn is_fatal(&self) -> bool {
        self.template.fatal
    }

    /// First path bound to an input port.
    pub fn input(&self, name: &str) -> Option<&str> {
        self.inputs
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.path.as_str())
    }

    /// Every path bound to an input port, in sample order.
    pub fn inputs_named(&self, name: &str) -> Vec<&str> {
        self.inputs
            .iter()
            .filter(|p| p.name == name)
            .map(|p| p.path.as_str())
            .collect()
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.path.as_str())
    }

    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    /// Start an attempt with the given request.
    ///
    /// The recorded request never shrinks between attempts.
    pub fn start(&mut self, request: Resources) -> Resources {
        let request = match self.last_request {
            Some(previous) => request.max(previous),
            None => request,
        };
        self.attempts += 1;
        self.last_request = Some(request);
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        request
    }

    pub fn succeed(&mut self, up_to_date: bool) {
        self.status = TaskStatus::Succeeded { up_to_date };
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
            attempts: self.attempts,
        };
        self.finished_at = Some(Utc::now());
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts()
    }

    pub fn poison(&mut self, ancestor: &TaskId) {
        self.status = TaskStatus::Poisoned {
            ancestor: ancestor.clone(),
        };
    }

    pub fn cancel(&mut self) {
        self.status = TaskStatus::Cancelled;
        self.finished_at = Some(Utc::now());
    }
}
