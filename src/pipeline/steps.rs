//! Builtin steps: the small JSON and table conversions between tools.
//!
//! They run on the blocking pool and report bad input as `MalformedInput`,
//! which the scheduler does not retry.

use crate::cluster::{
    select_clusters_with, ClusterAssignment, ClusterOptions, DistanceMatrix, DistanceSummary,
};
use crate::core::sample::ThresholdSummary;
use crate::error::{Error, Result};
use crate::orchestration::step::{Argv, CommandStep, ExternalStep, Invocation, StepStatus};
use crate::util::{blocking, blocking_with_timeout};
use crate::{mlog, mlog_warn};
use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Run a synchronous builtin on the blocking pool, bounded by the request's
/// runtime when it has one.
async fn run_builtin<F>(invocation: &Invocation, f: F) -> Result<StepStatus>
where
    F: FnOnce() -> Result<StepStatus> + Send + 'static,
{
    match invocation.resources.runtime_min {
        0 => blocking(f).await,
        minutes => blocking_with_timeout(Duration::from_secs(minutes * 60), f).await,
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|e| Error::MalformedInput(format!("{}: {}", path.display(), e)))
}

fn read_json_object(path: &Path) -> Result<Map<String, Value>> {
    match read_json(path)? {
        Value::Object(map) => Ok(map),
        _ => Err(Error::MalformedInput(format!(
            "{} does not hold a JSON object",
            path.display()
        ))),
    }
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Pull the headline metrics out of a full fastp report.
#[derive(Debug, Clone, Copy, Default)]
pub struct FastpSummary;

impl FastpSummary {
    pub fn summarize(report: &Map<String, Value>, sample: &str) -> Value {
        let section = |name: &str| report.get(name).cloned().unwrap_or(Value::Null);
        let summary = section("summary");
        let before = &summary["before_filtering"];
        let after = &summary["after_filtering"];
        let filtering = section("filtering_result");
        let adapter = section("adapter_cutting");
        let duplication = section("duplication");

        let prefer = |key: &str| match &before[key] {
            Value::Null => after[key].clone(),
            v => v.clone(),
        };

        json!({
            "sample": sample,
            "total_reads": prefer("total_reads"),
            "gc_content": prefer("gc_content"),
            "passed_filter_reads": filtering["passed_filter_reads"],
            "low_quality_reads": filtering["low_quality_reads"],
            "too_many_N_reads": filtering["too_many_N_reads"],
            "low_complexity_reads": filtering["low_complexity_reads"],
            "too_short_reads": filtering["too_short_reads"],
            "too_long_reads": filtering["too_long_reads"],
            "adapter_trimmed_reads": adapter["adapter_trimmed_reads"],
            "duplication": duplication["rate"],
        })
    }
}

impl ExternalStep for FastpSummary {
    fn execute<'a>(&'a self, invocation: &'a Invocation) -> BoxFuture<'a, Result<StepStatus>> {
        let inv = invocation.clone();
        Box::pin(async move {
            run_builtin(invocation, move || {
                let report = read_json_object(Path::new(inv.require_input("report")?))?;
                let sample = inv.sample.clone().unwrap_or_default();
                write_json(
                    Path::new(inv.require_output("json")?),
                    &Self::summarize(&report, &sample),
                )?;
                Ok(StepStatus::Success)
            })
            .await
        })
    }

    fn describe(&self) -> String {
        "builtin: fastp summary".to_string()
    }
}

/// Convert a tab-separated table into JSON records.
#[derive(Debug, Clone)]
pub struct TsvToJson {
    input: String,
    output: String,
}

impl TsvToJson {
    pub fn new(input: &str, output: &str) -> Self {
        Self {
            input: input.to_string(),
            output: output.to_string(),
        }
    }

    /// Parse a TSV with a header row. Cells become integers or floats where
    /// they parse, `null` when empty. A trailing `_1` is stripped from the
    /// `sample` column. A single row is returned as an object.
    pub fn convert(text: &str) -> Result<Value> {
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());
        let header: Vec<&str> = lines
            .next()
            .ok_or_else(|| Error::MalformedInput("table is empty".to_string()))?
            .split('\t')
            .collect();

        let mut records = Vec::new();
        for line in lines {
            let mut record = Map::new();
            for (i, column) in header.iter().enumerate() {
                let cell = line.split('\t').nth(i).unwrap_or("").trim();
                let value = if *column == "sample" {
                    Value::String(cell.strip_suffix("_1").unwrap_or(cell).to_string())
                } else {
                    coerce(cell)
                };
                record.insert(column.to_string(), value);
            }
            records.push(Value::Object(record));
        }

        Ok(match records.len() {
            1 => records.remove(0),
            _ => Value::Array(records),
        })
    }
}

fn coerce(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if cell.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(n) = cell.parse::<u64>() {
            return json!(n);
        }
    }
    match cell.parse::<f64>() {
        Ok(f) if f.is_finite() => json!(f),
        _ => Value::String(cell.to_string()),
    }
}

impl ExternalStep for TsvToJson {
    fn execute<'a>(&'a self, invocation: &'a Invocation) -> BoxFuture<'a, Result<StepStatus>> {
        let inv = invocation.clone();
        let (input, output) = (self.input.clone(), self.output.clone());
        Box::pin(async move {
            run_builtin(invocation, move || {
                let text = std::fs::read_to_string(inv.require_input(&input)?)?;
                write_json(Path::new(inv.require_output(&output)?), &Self::convert(&text)?)?;
                Ok(StepStatus::Success)
            })
            .await
        })
    }

    fn describe(&self) -> String {
        format!("builtin: {} table to JSON", self.input)
    }
}

/// Group a sample's per-tool JSON files under one object.
///
/// Groups are written in the order given, after an optional `count` group
/// carrying the read count recorded at staging.
#[derive(Debug, Clone)]
pub struct SampleJson {
    /// (group name, input port)
    groups: Vec<(String, String)>,
    reads: BTreeMap<String, u64>,
}

impl SampleJson {
    pub fn new(groups: &[(&str, &str)], reads: BTreeMap<String, u64>) -> Self {
        Self {
            groups: groups
                .iter()
                .map(|(g, p)| (g.to_string(), p.to_string()))
                .collect(),
            reads,
        }
    }

    fn merge(&self, inv: &Invocation) -> Result<Value> {
        let mut sample = inv.sample.clone();
        let mut first_inner: Option<String> = None;
        let mut merged = Map::new();

        if let Some(reads) = inv.sample.as_ref().and_then(|s| self.reads.get(s)) {
            merged.insert("count".to_string(), json!({ "reads": reads }));
        }

        for (group, port) in &self.groups {
            let Some(path) = inv.input(port) else {
                continue;
            };
            let mut data = read_json_object(Path::new(path))?;
            if let Some(Value::String(inner)) = data.remove("sample") {
                match &first_inner {
                    Some(seen) if *seen != inner => {
                        return Err(Error::MalformedInput(format!(
                            "conflicting sample names {:?} and {:?} (group {})",
                            seen, inner, group
                        )))
                    }
                    Some(_) => {}
                    None => first_inner = Some(inner),
                }
            }
            merged.insert(group.clone(), Value::Object(data));
        }

        if sample.is_none() {
            sample = first_inner;
        }
        let mut out = Map::new();
        if let Some(sample) = sample {
            out.insert("sample".to_string(), Value::String(sample));
        }
        out.extend(merged);
        Ok(Value::Object(out))
    }
}

impl ExternalStep for SampleJson {
    fn execute<'a>(&'a self, invocation: &'a Invocation) -> BoxFuture<'a, Result<StepStatus>> {
        let inv = invocation.clone();
        let this = self.clone();
        Box::pin(async move {
            run_builtin(invocation, move || {
                let value = this.merge(&inv)?;
                write_json(Path::new(inv.require_output("json")?), &value)?;
                Ok(StepStatus::Success)
            })
            .await
        })
    }

    fn describe(&self) -> String {
        let groups: Vec<&str> = self.groups.iter().map(|(g, _)| g.as_str()).collect();
        format!("builtin: sample JSON ({})", groups.join(", "))
    }
}

/// Choose the cluster count from the distance matrix.
#[derive(Debug, Clone, Copy)]
pub struct ClusterSelect {
    pub options: ClusterOptions,
    pub seed: u64,
}

impl ExternalStep for ClusterSelect {
    fn execute<'a>(&'a self, invocation: &'a Invocation) -> BoxFuture<'a, Result<StepStatus>> {
        let inv = invocation.clone();
        let (options, seed) = (self.options, self.seed);
        Box::pin(async move {
            run_builtin(invocation, move || {
                let matrix = DistanceMatrix::from_tsv(Path::new(inv.require_input("distances")?))?;
                let result = match select_clusters_with(&matrix, &options, seed) {
                    Ok(result) => result,
                    Err(e @ Error::InsufficientSamples { .. }) => {
                        mlog_warn!("{}: {}", inv.task, e);
                        return Ok(StepStatus::permanent(e.to_string()));
                    }
                    Err(e) => return Err(e),
                };
                std::fs::write(inv.require_output("silhouettes")?, result.silhouettes_tsv())?;
                std::fs::write(inv.require_output("assignments")?, result.assignments_tsv())?;
                std::fs::write(inv.require_output("medoids")?, result.medoids_tsv())?;
                write_json(
                    Path::new(inv.require_output("json")?),
                    &serde_json::to_value(&result)?,
                )?;
                Ok(StepStatus::Success)
            })
            .await
        })
    }

    fn describe(&self) -> String {
        format!(
            "builtin: PAM k={}..{} seed={}",
            self.options.k_min, self.options.k_max, self.seed
        )
    }
}

/// Summarize pairwise distances within and between the selected clusters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterDistances;

impl ClusterDistances {
    pub fn summarize(distances: &Path, clusters: &Path) -> Result<DistanceSummary> {
        let matrix = DistanceMatrix::from_tsv(distances)?;
        let assignment: ClusterAssignment = serde_json::from_value(read_json(clusters)?)
            .map_err(|e| Error::MalformedInput(format!("{}: {}", clusters.display(), e)))?;
        Ok(DistanceSummary::compute(&matrix, &assignment))
    }
}

impl ExternalStep for ClusterDistances {
    fn execute<'a>(&'a self, invocation: &'a Invocation) -> BoxFuture<'a, Result<StepStatus>> {
        let inv = invocation.clone();
        Box::pin(async move {
            run_builtin(invocation, move || {
                let summary = Self::summarize(
                    Path::new(inv.require_input("distances")?),
                    Path::new(inv.require_input("clusters")?),
                )?;
                write_json(
                    Path::new(inv.require_output("json")?),
                    &serde_json::to_value(&summary)?,
                )?;
                Ok(StepStatus::Success)
            })
            .await
        })
    }

    fn describe(&self) -> String {
        "builtin: cluster distance summary".to_string()
    }
}

/// Merge every sample's JSON into the final report.
#[derive(Debug, Clone, Default)]
pub struct MergeJson {
    pub threshold: Option<ThresholdSummary>,
}

impl MergeJson {
    fn merge(&self, inv: &Invocation) -> Result<Value> {
        let mut samples = Map::new();
        for path in inv.inputs_named("samples") {
            let mut data = read_json_object(Path::new(path))?;
            let name = match data.remove("sample") {
                Some(Value::String(name)) if !name.is_empty() => name,
                _ => {
                    return Err(Error::MalformedInput(format!(
                        "{} has no \"sample\" field",
                        path
                    )))
                }
            };
            if samples.contains_key(&name) {
                return Err(Error::MalformedInput(format!(
                    "duplicate sample {:?} in {}",
                    name, path
                )));
            }
            samples.insert(name, Value::Object(data));
        }

        let mut merged = Map::new();
        merged.insert("n_samples".to_string(), json!(samples.len()));
        merged.insert("samples".to_string(), Value::Object(samples));
        if let Some(path) = inv.input("clusters") {
            merged.insert("clusters".to_string(), read_json(Path::new(path))?);
        }
        if let Some(path) = inv.input("distances") {
            merged.insert("distances".to_string(), read_json(Path::new(path))?);
        }
        if let Some(threshold) = &self.threshold {
            merged.insert("read_threshold".to_string(), serde_json::to_value(threshold)?);
        }
        Ok(Value::Object(merged))
    }
}

impl ExternalStep for MergeJson {
    fn execute<'a>(&'a self, invocation: &'a Invocation) -> BoxFuture<'a, Result<StepStatus>> {
        let inv = invocation.clone();
        let this = self.clone();
        Box::pin(async move {
            run_builtin(invocation, move || {
                let merged = this.merge(&inv)?;
                let out = inv.require_output("json")?;
                write_json(Path::new(out), &merged)?;
                mlog!("Merged {} samples into {}", merged["n_samples"], out);
                Ok(StepStatus::Success)
            })
            .await
        })
    }

    fn describe(&self) -> String {
        "builtin: merge sample JSON".to_string()
    }
}

/// Project sequencing redundancy to the full read count, then tabulate the
/// projection as JSON.
#[derive(Debug, Clone)]
pub struct NonpareilProjection {
    pub program: String,
    /// Reads the redundancy curve was computed on.
    pub subset_reads: u64,
    /// Target coverage in percent.
    pub completeness: u32,
}

impl NonpareilProjection {
    fn total_reads(path: &Path) -> Result<u64> {
        let summary = read_json_object(path)?;
        summary
            .get("total_reads")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                Error::MalformedInput(format!("{} has no total_reads", path.display()))
            })
    }
}

impl ExternalStep for NonpareilProjection {
    fn execute<'a>(&'a self, invocation: &'a Invocation) -> BoxFuture<'a, Result<StepStatus>> {
        Box::pin(async move {
            let total = Self::total_reads(Path::new(invocation.require_input("fastp")?))?;
            let project = CommandStep::single(Argv::new(&self.program).args([
                "{input.npo}".to_string(),
                "--subset-reads".to_string(),
                self.subset_reads.min(total).to_string(),
                "--total-reads".to_string(),
                total.to_string(),
                "--targets".to_string(),
                self.completeness.to_string(),
                "-o".to_string(),
                "{output.tsv}".to_string(),
            ]));
            let status = project.execute(invocation).await?;
            if !status.is_success() {
                return Ok(status);
            }
            TsvToJson::new("tsv", "json")
                .convert_outputs(invocation)
                .await
        })
    }

    fn describe(&self) -> String {
        format!(
            "{} {{input.npo}} --targets {} then table to JSON",
            self.program, self.completeness
        )
    }

    fn programs(&self) -> Vec<String> {
        vec![self.program.clone()]
    }
}

impl TsvToJson {
    /// Convert a table the same task just wrote (both ports are outputs).
    async fn convert_outputs(&self, invocation: &Invocation) -> Result<StepStatus> {
        let inv = invocation.clone();
        let (input, output) = (self.input.clone(), self.output.clone());
        run_builtin(invocation, move || {
            let text = std::fs::read_to_string(inv.require_output(&input)?)?;
            write_json(Path::new(inv.require_output(&output)?), &Self::convert(&text)?)?;
            Ok(StepStatus::Success)
        })
        .await
    }
}
