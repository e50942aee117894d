//! The screening pipeline: the concrete rule set a run builds its graph from.
//!
//! Quality filtering, subsampling, marker-based microbial fraction, sequencing
//! redundancy and MinHash sketching run per sample. Pairwise distances, cluster
//! selection and the merged report run once over the whole sample set.

pub mod steps;

use crate::config::RunConfig;
use crate::core::dag::TaskGraph;
use crate::core::sample::{SampleRegistry, FORWARD, REVERSE};
use crate::core::template::{Escalation, PathSpec, ResourcePolicy, RuleTemplate};
use crate::error::{Error, Result};
use crate::orchestration::freshness;
use crate::orchestration::step::{Argv, CommandStep};
use crate::{mlog, mlog_debug};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use steps::{
    ClusterDistances, ClusterSelect, FastpSummary, MergeJson, NonpareilProjection, SampleJson,
    TsvToJson,
};

/// File name of the merged report, relative to the output root.
pub const REPORT_JSON: &str = "screenm.json";

fn wildcard(pattern: &str) -> PathSpec {
    PathSpec::wildcard(pattern)
}

fn from(rule: &str, port: &str) -> PathSpec {
    PathSpec::output_of(rule, port)
}

/// Build the screening rule set for a run.
///
/// Command lines use the tool names from `[tools]` and the run's depth,
/// k-mer size and seed. Every rule gets `max_attempts` from the config;
/// rules listed in `fatal_rules` cancel the run when they fail for good.
pub fn screening_templates(run: &RunConfig, samples: &SampleRegistry) -> Vec<RuleTemplate> {
    let config = &run.config;
    let tools = &config.tools;
    let reads = config.reads.to_string();
    let kmer = config.kmer.to_string();
    let seed = run.seed.to_string();

    let fastp = CommandStep::new(vec![
        Argv::new(&tools.fastp)
            .args(["-i", "{input.forward}", "-I", "{input.reverse}"])
            .args(["-o", "{output.r1}", "-O", "{output.r2}"])
            .args(["-j", "{output.report}", "-h", "/dev/null", "-w", "{threads}"])
            .when_input(REVERSE),
        Argv::new(&tools.fastp)
            .args(["-i", "{input.forward}", "-o", "{output.r1}"])
            .args(["-j", "{output.report}", "-h", "/dev/null", "-w", "{threads}"])
            .unless_input(REVERSE),
    ]);

    let subsample = CommandStep::new(vec![
        Argv::new(&tools.seqtk)
            .args(["sample", "-s", seed.as_str(), "{input.r1}", reads.as_str()])
            .stdout_to("r1"),
        Argv::new(&tools.seqtk)
            .args(["sample", "-s", seed.as_str(), "{input.r2}", reads.as_str()])
            .stdout_to("r2")
            .when_input("r2"),
    ]);

    let singlem = CommandStep::new(vec![
        Argv::new(&tools.singlem)
            .args(["pipe", "--forward", "{input.r1}", "--reverse", "{input.r2}"])
            .args(["--otu-table", "{output.profile}", "--threads", "{threads}"])
            .when_input("r2"),
        Argv::new(&tools.singlem)
            .args(["pipe", "--forward", "{input.r1}"])
            .args(["--otu-table", "{output.profile}", "--threads", "{threads}"])
            .unless_input("r2"),
        Argv::new(&tools.singlem)
            .args(["microbial_fraction", "--forward", "{input.r1}"])
            .args(["--input-profile", "{output.profile}"])
            .stdout_to("fraction"),
    ]);

    let nonpareil = CommandStep::single(
        Argv::new(&tools.nonpareil)
            .args(["-s", "{input.r1}", "-T", "kmer", "-k", kmer.as_str()])
            .args(["-f", "fastq", "-b", "nonpareil/{sample}", "-t", "{threads}"]),
    );

    let mash_sketch = CommandStep::single(
        Argv::new(&tools.mash)
            .args(["sketch", "-r", "-k", kmer.as_str(), "-I", "{sample}"])
            .args(["-o", "mash/{sample}", "{input.r1}"]),
    );

    let mash_dist = CommandStep::new(vec![
        Argv::new(&tools.mash).args(["paste", "mash/all", "{input.sketches}"]),
        Argv::new(&tools.mash)
            .args(["dist", "-p", "{threads}", "{output.all}", "{output.all}"])
            .stdout_to("distances"),
    ]);

    let reads_by_sample: BTreeMap<String, u64> = samples
        .iter()
        .filter_map(|s| s.reads.map(|r| (s.id.clone(), r)))
        .collect();

    // Memory and wall time scale with the sample's input size and double on
    // every retry.
    let heavy = |threads| {
        ResourcePolicy::escalating(threads, Escalation::new(4096, 4), Escalation::new(60, 1))
    };
    let light = || ResourcePolicy::escalating(1, Escalation::new(1024, 0), Escalation::new(10, 0));

    let templates = vec![
        RuleTemplate::per_sample("fastp", Arc::new(fastp))
            .input("forward", PathSpec::sample_input(FORWARD))
            .input_when("reverse", PathSpec::sample_input(REVERSE), REVERSE)
            .output("r1", wildcard("fastp/{sample}_1.fq.gz"))
            .output_when("r2", wildcard("fastp/{sample}_2.fq.gz"), REVERSE)
            .output("report", wildcard("fastp/{sample}_full.json"))
            .resources(heavy(4)),
        RuleTemplate::per_sample("fastp_json", Arc::new(FastpSummary))
            .input("report", from("fastp", "report"))
            .output("json", wildcard("json/{sample}_fastp.json"))
            .resources(light()),
        RuleTemplate::per_sample("subsample", Arc::new(subsample))
            .input("r1", from("fastp", "r1"))
            .input_when("r2", from("fastp", "r2"), REVERSE)
            .output("r1", wildcard("subsample/{sample}_1.fq"))
            .output_when("r2", wildcard("subsample/{sample}_2.fq"), REVERSE)
            .resources(heavy(1)),
        RuleTemplate::per_sample("singlem", Arc::new(singlem))
            .input("r1", from("subsample", "r1"))
            .input_when("r2", from("subsample", "r2"), REVERSE)
            .output("profile", wildcard("singlem/{sample}_profile.tsv"))
            .output("fraction", wildcard("singlem/{sample}_fraction.tsv"))
            .resources(heavy(4)),
        RuleTemplate::per_sample("singlem_json", Arc::new(TsvToJson::new("fraction", "json")))
            .input("fraction", from("singlem", "fraction"))
            .output("json", wildcard("json/{sample}_singlem.json"))
            .resources(light()),
        RuleTemplate::per_sample("nonpareil", Arc::new(nonpareil))
            .input("r1", from("subsample", "r1"))
            .output("npo", wildcard("nonpareil/{sample}.npo"))
            .resources(heavy(4)),
        RuleTemplate::per_sample(
            "nonpareil_json",
            Arc::new(NonpareilProjection {
                program: tools.nonpareil_project.clone(),
                subset_reads: config.reads,
                completeness: config.completeness,
            }),
        )
        .input("npo", from("nonpareil", "npo"))
        .input("fastp", from("fastp_json", "json"))
        .output("tsv", wildcard("nonpareil/{sample}_projection.tsv"))
        .output("json", wildcard("json/{sample}_nonpareil.json"))
        .resources(light()),
        RuleTemplate::per_sample("mash_sketch", Arc::new(mash_sketch))
            .input("r1", from("subsample", "r1"))
            .output("sketch", wildcard("mash/{sample}.msh"))
            .resources(heavy(1)),
        RuleTemplate::per_sample(
            "sample_json",
            Arc::new(SampleJson::new(
                &[
                    ("fastp", "fastp"),
                    ("singlem", "singlem"),
                    ("nonpareil", "nonpareil"),
                ],
                reads_by_sample,
            )),
        )
        .input("fastp", from("fastp_json", "json"))
        .input("singlem", from("singlem_json", "json"))
        .input("nonpareil", from("nonpareil_json", "json"))
        .output("json", wildcard("json/{sample}.json"))
        .resources(light()),
        RuleTemplate::aggregate("mash_dist", Arc::new(mash_dist))
            .input("sketches", from("mash_sketch", "sketch"))
            .output("all", PathSpec::literal("mash/all.msh"))
            .output("distances", PathSpec::literal("mash/distances.tsv"))
            .resources(heavy(4)),
        RuleTemplate::aggregate(
            "cluster",
            Arc::new(ClusterSelect {
                options: config.cluster_options(),
                seed: run.seed,
            }),
        )
        .input("distances", from("mash_dist", "distances"))
        .output("silhouettes", PathSpec::literal("cluster/silhouettes.tsv"))
        .output("assignments", PathSpec::literal("cluster/assignments.tsv"))
        .output("medoids", PathSpec::literal("cluster/medoids.tsv"))
        .output("json", PathSpec::literal("cluster/clusters.json"))
        .resources(light()),
        RuleTemplate::aggregate("cluster_distances", Arc::new(ClusterDistances))
            .input("distances", from("mash_dist", "distances"))
            .input("clusters", from("cluster", "json"))
            .output("json", PathSpec::literal("cluster/distances.json"))
            .resources(light()),
        RuleTemplate::aggregate(
            "merge_json",
            Arc::new(MergeJson {
                threshold: samples.threshold_summary(),
            }),
        )
        .input("samples", from("sample_json", "json"))
        .input("clusters", from("cluster", "json"))
        .input("distances", from("cluster_distances", "json"))
        .output("json", PathSpec::literal(REPORT_JSON))
        .resources(light()),
    ];

    templates
        .into_iter()
        .map(|t| {
            let fatal = config.fatal_rules.iter().any(|r| *r == t.name);
            t.max_attempts(config.max_attempts).fatal(fatal)
        })
        .collect()
}

/// Resolve every external program the graph still needs to run.
///
/// Programs needed only by tasks whose outputs are already fresh are not
/// checked, so a finished run can be re-planned on a machine without the
/// tools.
pub fn preflight(graph: &TaskGraph) -> Result<()> {
    let mut needed = BTreeSet::new();
    for task in graph.topological_order() {
        if freshness::is_up_to_date(task) {
            continue;
        }
        needed.extend(task.template().step.programs());
    }

    for program in &needed {
        match which::which(program) {
            Ok(path) => mlog_debug!("preflight: {} -> {}", program, path.display()),
            Err(_) => return Err(Error::ToolNotFound(program.clone())),
        }
    }
    mlog!("Preflight: {} external program(s) found", needed.len());
    Ok(())
}
