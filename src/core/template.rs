//! Rule templates: the parameterized task definitions a graph is built from.
//!
//! A template names its input and output ports, how each port's path is
//! derived, how many resources a run asks for, how often it may be retried,
//! and the step that does the work. Templates are plain values fixed before
//! graph construction.

use crate::orchestration::step::ExternalStep;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

static WILDCARD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid wildcard regex"));

/// How a template fans out over the sample set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// One task per sample, with `{sample}` bound to the sample identifier.
    PerSample,
    /// Exactly one task bound to the whole ordered sample list.
    Aggregate,
}

/// Where a port's path comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSpec {
    /// A fixed path. Relative paths live under the output root.
    Literal(String),
    /// A path pattern with `{wildcard}` placeholders. Used as an input of an
    /// aggregate template, `{sample}` expands once per sample.
    Wildcard(String),
    /// The sample's own input file for a role (e.g. `forward`).
    SampleInput(String),
    /// A named output port of another template.
    OutputOf { rule: String, port: String },
}

impl PathSpec {
    pub fn literal(path: impl Into<String>) -> Self {
        Self::Literal(path.into())
    }

    pub fn wildcard(pattern: impl Into<String>) -> Self {
        Self::Wildcard(pattern.into())
    }

    pub fn sample_input(role: impl Into<String>) -> Self {
        Self::SampleInput(role.into())
    }

    pub fn output_of(rule: impl Into<String>, port: impl Into<String>) -> Self {
        Self::OutputOf {
            rule: rule.into(),
            port: port.into(),
        }
    }
}

/// A named input or output of a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Port {
    pub name: String,
    pub spec: PathSpec,
    /// The port only exists for samples that have this input role.
    pub requires_role: Option<String>,
}

impl Port {
    pub fn new(name: impl Into<String>, spec: PathSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            requires_role: None,
        }
    }

    pub fn when_role(mut self, role: impl Into<String>) -> Self {
        self.requires_role = Some(role.into());
        self
    }
}

/// A concrete resource request handed to a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub threads: u32,
    pub mem_mb: u64,
    /// Wall-time budget in minutes. Zero means unbounded.
    pub runtime_min: u64,
}

impl Resources {
    /// Field-wise maximum of two requests.
    pub fn max(self, other: Resources) -> Resources {
        Resources {
            threads: self.threads.max(other.threads),
            mem_mb: self.mem_mb.max(other.mem_mb),
            runtime_min: self.runtime_min.max(other.runtime_min),
        }
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "threads={} mem_mb={} runtime_min={}",
            self.threads, self.mem_mb, self.runtime_min
        )
    }
}

/// A resource amount as a function of (total input bytes, attempt number).
pub type ResourceFn = Arc<dyn Fn(u64, u32) -> u64 + Send + Sync>;

/// Per-template resource policy.
///
/// Attempts are numbered from 1.
#[derive(Clone)]
pub struct ResourcePolicy {
    threads: u32,
    mem_mb: ResourceFn,
    runtime_min: ResourceFn,
}

impl ResourcePolicy {
    pub fn new(
        threads: u32,
        mem_mb: impl Fn(u64, u32) -> u64 + Send + Sync + 'static,
        runtime_min: impl Fn(u64, u32) -> u64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            threads,
            mem_mb: Arc::new(mem_mb),
            runtime_min: Arc::new(runtime_min),
        }
    }

    /// The same request on every attempt.
    pub fn fixed(threads: u32, mem_mb: u64, runtime_min: u64) -> Self {
        Self::new(threads, move |_, _| mem_mb, move |_, _| runtime_min)
    }

    /// `max(floor, input_mb * factor)` doubled on every retry, for both
    /// memory and wall time.
    pub fn escalating(threads: u32, mem: Escalation, runtime: Escalation) -> Self {
        Self::new(
            threads,
            move |bytes, attempt| mem.amount(bytes, attempt),
            move |bytes, attempt| runtime.amount(bytes, attempt),
        )
    }

    pub fn threads(&self) -> u32 {
        self.threads
    }

    /// Compute the request for an attempt.
    pub fn request(&self, input_bytes: u64, attempt: u32) -> Resources {
        let attempt = attempt.max(1);
        Resources {
            threads: self.threads,
            mem_mb: (self.mem_mb)(input_bytes, attempt),
            runtime_min: (self.runtime_min)(input_bytes, attempt),
        }
    }
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self::escalating(1, Escalation::new(1024, 0), Escalation::new(10, 0))
    }
}

impl std::fmt::Debug for ResourcePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePolicy")
            .field("threads", &self.threads)
            .field("first_attempt", &self.request(0, 1))
            .finish()
    }
}

/// Exponential escalation curve with a floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    pub floor: u64,
    /// Amount per MiB of input.
    pub per_mb: u64,
}

impl Escalation {
    pub fn new(floor: u64, per_mb: u64) -> Self {
        Self { floor, per_mb }
    }

    pub fn amount(&self, input_bytes: u64, attempt: u32) -> u64 {
        let input_mb = input_bytes.div_ceil(1024 * 1024);
        let base = self.floor.max(input_mb.saturating_mul(self.per_mb));
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        base.saturating_mul(factor)
    }
}

/// A parameterized task definition.
#[derive(Clone)]
pub struct RuleTemplate {
    pub name: String,
    pub scope: Scope,
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
    pub resources: ResourcePolicy,
    /// Attempts before a failure is permanent.
    pub max_attempts: u32,
    /// A permanent failure of this rule cancels the whole run.
    pub fatal: bool,
    pub step: Arc<dyn ExternalStep>,
}

impl RuleTemplate {
    pub fn per_sample(name: impl Into<String>, step: Arc<dyn ExternalStep>) -> Self {
        Self::with_scope(name, Scope::PerSample, step)
    }

    pub fn aggregate(name: impl Into<String>, step: Arc<dyn ExternalStep>) -> Self {
        Self::with_scope(name, Scope::Aggregate, step)
    }

    fn with_scope(name: impl Into<String>, scope: Scope, step: Arc<dyn ExternalStep>) -> Self {
        Self {
            name: name.into(),
            scope,
            inputs: Vec::new(),
            outputs: Vec::new(),
            resources: ResourcePolicy::default(),
            max_attempts: 1,
            fatal: false,
            step,
        }
    }

    pub fn input(mut self, name: &str, spec: PathSpec) -> Self {
        self.inputs.push(Port::new(name, spec));
        self
    }

    /// An input that only exists for samples with `role`.
    pub fn input_when(mut self, name: &str, spec: PathSpec, role: &str) -> Self {
        self.inputs.push(Port::new(name, spec).when_role(role));
        self
    }

    pub fn output(mut self, name: &str, spec: PathSpec) -> Self {
        self.outputs.push(Port::new(name, spec));
        self
    }

    /// An output that only exists for samples with `role`.
    pub fn output_when(mut self, name: &str, spec: PathSpec, role: &str) -> Self {
        self.outputs.push(Port::new(name, spec).when_role(role));
        self
    }

    pub fn resources(mut self, policy: ResourcePolicy) -> Self {
        self.resources = policy;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn fatal(mut self, fatal: bool) -> Self {
        self.fatal = fatal;
        self
    }

    pub fn output_port(&self, name: &str) -> Option<&Port> {
        self.outputs.iter().find(|p| p.name == name)
    }
}

impl std::fmt::Debug for RuleTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleTemplate")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("max_attempts", &self.max_attempts)
            .field("fatal", &self.fatal)
            .field("step", &self.step.describe())
            .finish()
    }
}

/// Wildcard names referenced by a pattern, in order of appearance.
pub fn wildcards(pattern: &str) -> Vec<&str> {
    WILDCARD
        .captures_iter(pattern)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

/// Substitute every `{name}` in `pattern` from `binding`.
///
/// Returns the first wildcard missing from the binding as the error.
pub fn substitute(
    pattern: &str,
    binding: &BTreeMap<&str, &str>,
) -> std::result::Result<String, String> {
    if let Some(missing) = wildcards(pattern)
        .into_iter()
        .find(|w| !binding.contains_key(w))
    {
        return Err(missing.to_string());
    }
    Ok(WILDCARD
        .replace_all(pattern, |caps: &regex::Captures<'_>| {
            binding.get(&caps[1]).copied().unwrap_or_default().to_string()
        })
        .into_owned())
}
