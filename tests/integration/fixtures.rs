//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating an output root with FASTQ inputs and a sample map
//! - A recording step that writes its outputs or fails on demand
//! - A small two-level template set (per-sample QC feeding an aggregate merge)

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tempfile::TempDir;

use mgscreen::core::{
    GraphBuilder, PathSpec, ResourcePolicy, Resources, RuleTemplate, SampleRegistry, TaskGraph,
    TaskId, FORWARD, REVERSE,
};
use mgscreen::orchestration::{ExternalStep, Invocation, RunReport, Scheduler, StepStatus};
use mgscreen::Result;

/// Four reads of FASTQ.
pub const FASTQ: &str = "@r1\nACGT\n+\nIIII\n@r2\nACGT\n+\nIIII\n@r3\nACGT\n+\nIIII\n@r4\nACGT\n+\nIIII\n";

/// A temporary workspace: input reads under `reads/`, outputs under `out/`.
pub struct Workspace {
    pub temp_dir: TempDir,
    pub reads: PathBuf,
    pub out: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let reads = temp_dir.path().join("reads");
        let out = temp_dir.path().join("out");
        std::fs::create_dir_all(&reads).expect("Failed to create reads dir");
        std::fs::create_dir_all(&out).expect("Failed to create output root");
        Self {
            temp_dir,
            reads,
            out,
        }
    }

    /// Write a FASTQ file under `reads/` and return its path.
    pub fn fastq(&self, name: &str) -> PathBuf {
        let path = self.reads.join(name);
        std::fs::write(&path, FASTQ).expect("Failed to write FASTQ");
        path
    }

    /// Write FASTQ files for each (id, paired) and return the registry.
    pub fn samples(&self, samples: &[(&str, bool)]) -> SampleRegistry {
        let mut map = serde_json::Map::new();
        for (id, paired) in samples {
            let mut entry = serde_json::Map::new();
            entry.insert(
                FORWARD.to_string(),
                self.fastq(&format!("{}_1.fq", id)).to_string_lossy().into(),
            );
            if *paired {
                entry.insert(
                    REVERSE.to_string(),
                    self.fastq(&format!("{}_2.fq", id)).to_string_lossy().into(),
                );
            }
            map.insert(id.to_string(), entry.into());
        }
        SampleRegistry::from_value(&map.into()).expect("valid sample map")
    }

    pub fn build(&self, templates: &[RuleTemplate], samples: &SampleRegistry) -> Result<TaskGraph> {
        GraphBuilder::new(&self.out).build(templates, samples)
    }

    pub fn output(&self, relative: &str) -> PathBuf {
        self.out.join(relative)
    }
}

/// One recorded attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub task: TaskId,
    pub attempt: u32,
    pub resources: Resources,
    pub inputs: usize,
}

/// A step that records every attempt and writes its declared outputs.
///
/// `.json` outputs get `{}` so output verification passes.
#[derive(Default)]
pub struct RecordingStep {
    /// Samples whose attempts always fail.
    always_fail: HashSet<String>,
    /// Attempts that fail before any succeeds.
    transient_failures: AtomicU32,
    /// Succeed without writing outputs.
    skip_outputs: bool,
    calls: Mutex<Vec<Call>>,
}

impl RecordingStep {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_for(samples: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            always_fail: samples.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    pub fn failing_first(attempts: u32) -> Arc<Self> {
        Arc::new(Self {
            transient_failures: AtomicU32::new(attempts),
            ..Default::default()
        })
    }

    pub fn without_outputs() -> Arc<Self> {
        Arc::new(Self {
            skip_outputs: true,
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, task: &TaskId) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| &c.task == task)
            .collect()
    }
}

impl ExternalStep for RecordingStep {
    fn execute<'a>(&'a self, inv: &'a Invocation) -> BoxFuture<'a, Result<StepStatus>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(Call {
                task: inv.task.clone(),
                attempt: inv.attempt,
                resources: inv.resources,
                inputs: inv.inputs.len(),
            });

            if inv
                .sample
                .as_ref()
                .is_some_and(|s| self.always_fail.contains(s))
            {
                return Ok(StepStatus::failed("exit status 1"));
            }
            let left = self.transient_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.transient_failures.store(left - 1, Ordering::SeqCst);
                return Ok(StepStatus::failed("killed: out of memory"));
            }
            if self.skip_outputs {
                return Ok(StepStatus::Success);
            }

            for output in &inv.outputs {
                let content = if output.path.ends_with(".json") {
                    "{}".to_string()
                } else {
                    inv.task.to_string()
                };
                std::fs::write(&output.path, content)?;
            }
            Ok(StepStatus::Success)
        })
    }

    fn describe(&self) -> String {
        "recording".to_string()
    }
}

/// Per-sample `qc` over the forward reads (plus the reverse when present),
/// feeding an aggregate `merge`.
pub fn qc_and_merge(qc: Arc<RecordingStep>, merge: Arc<RecordingStep>) -> Vec<RuleTemplate> {
    vec![
        RuleTemplate::per_sample("qc", qc)
            .input("forward", PathSpec::sample_input(FORWARD))
            .input_when("reverse", PathSpec::sample_input(REVERSE), REVERSE)
            .output("json", PathSpec::wildcard("qc/{sample}.json"))
            .output_when("r2", PathSpec::wildcard("qc/{sample}_2.fq"), REVERSE)
            .resources(ResourcePolicy::new(
                2,
                |_, attempt| 1000 * attempt as u64,
                |_, attempt| 10 * attempt as u64,
            ))
            .max_attempts(3),
        RuleTemplate::aggregate("merge", merge)
            .input("parts", PathSpec::output_of("qc", "json"))
            .output("json", PathSpec::literal("merged.json")),
    ]
}

pub async fn run(graph: TaskGraph, out: &Path, workers: usize) -> RunReport {
    let mut scheduler = Scheduler::new(graph, out, workers);
    scheduler.run().await.expect("scheduler run")
}
