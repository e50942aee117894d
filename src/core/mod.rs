//! Core domain models for the pipeline engine.
//!
//! Samples and rule templates go in; the builder binds them into a task DAG
//! that the scheduler executes.

pub mod builder;
pub mod dag;
pub mod sample;
pub mod task;
pub mod template;

pub use builder::GraphBuilder;
pub use dag::{DataDependency, TaskGraph};
pub use sample::{Sample, SampleRegistry, ThresholdSummary, FORWARD, REVERSE};
pub use task::{Binding, NamedPath, Task, TaskId, TaskStatus};
pub use template::{
    Escalation, PathSpec, Port, ResourcePolicy, Resources, RuleTemplate, Scope,
};
