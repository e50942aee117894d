//! Orchestration layer: executes a bound task graph.
//!
//! The scheduler owns the graph and hands attempts to the worker pool; steps
//! do the actual work and the freshness helpers decide what can be skipped.

pub mod freshness;
mod pool;
mod scheduler;
pub mod step;

pub use pool::{WorkerEvent, WorkerOutcome, WorkerPool};
pub use scheduler::{FailedTask, PoisonedTask, RunReport, Scheduler, SchedulerEvent};
pub use step::{Argv, CommandStep, ExternalStep, Invocation, NoopStep, StepStatus};
