//! Integration test suite for mgscreen.
//!
//! These tests drive the public API end to end: a sample map is loaded, rule
//! templates are bound into a task graph, and the scheduler runs it against a
//! temporary output root. External tools are replaced by recording steps, so
//! nothing here needs fastp, mash or friends on `PATH`.
//!
//! # Test Categories
//!
//! - `graph_build`: binding, single/paired variants, build-time errors
//! - `resume`: skip-if-up-to-date and partial re-runs
//! - `failure`: retries, escalation, poisoning and fatal cancellation
//! - `cluster_selection`: cluster count selection on matrix files and inside a run

mod fixtures;

mod cluster_selection;
mod failure;
mod graph_build;
mod resume;
