//! Cluster count selection, from distance files and inside a scheduled run.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::fixtures::{run, RecordingStep, Workspace};

use mgscreen::cluster::{select_clusters, ClusterOptions, DistanceMatrix};
use mgscreen::core::{PathSpec, RuleTemplate, TaskGraph, TaskId, FORWARD};
use mgscreen::orchestration::{ExternalStep, Invocation, StepStatus};
use mgscreen::pipeline::steps::ClusterSelect;
use mgscreen::Result;

const NAMES: [&str; 6] = ["S1", "S2", "S3", "S4", "S5", "S6"];

/// Two tight triples far apart from each other.
const TRIPLES: [[f64; 6]; 6] = [
    [0.0, 0.02, 0.03, 0.8, 0.82, 0.81],
    [0.02, 0.0, 0.02, 0.79, 0.8, 0.83],
    [0.03, 0.02, 0.0, 0.81, 0.8, 0.8],
    [0.8, 0.79, 0.81, 0.0, 0.01, 0.02],
    [0.82, 0.8, 0.8, 0.01, 0.0, 0.02],
    [0.81, 0.83, 0.8, 0.02, 0.02, 0.0],
];

fn square_tsv() -> String {
    let mut text = format!("\t{}\n", NAMES.join("\t"));
    for (name, row) in NAMES.iter().zip(TRIPLES.iter()) {
        let cells: Vec<String> = row.iter().map(|d| d.to_string()).collect();
        text.push_str(&format!("{}\t{}\n", name, cells.join("\t")));
    }
    text
}

/// The same distances as `mash dist` prints them, with sketch file names.
fn mash_pairs() -> String {
    let mut text = String::new();
    for (i, a) in NAMES.iter().enumerate() {
        for (j, b) in NAMES.iter().enumerate() {
            text.push_str(&format!(
                "reads/{}.fq.gz\treads/{}.fq.gz\t{}\t0\t900/1000\n",
                a, b, TRIPLES[i][j]
            ));
        }
    }
    text
}

#[test]
fn test_square_and_pairwise_files_agree() {
    let ws = Workspace::new();
    let square = ws.output("square.tsv");
    let pairs = ws.output("pairs.tsv");
    std::fs::write(&square, square_tsv()).unwrap();
    std::fs::write(&pairs, mash_pairs()).unwrap();

    let from_square = DistanceMatrix::from_tsv(&square).unwrap();
    let from_pairs = DistanceMatrix::from_tsv(&pairs).unwrap();
    assert_eq!(from_square.ids(), from_pairs.ids());
    assert_eq!(from_square, from_pairs);

    let a = select_clusters(&from_square, 2, 15, 42).unwrap();
    let b = select_clusters(&from_pairs, 2, 15, 42).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.k, 2);
    assert_eq!(a.members()[&1], vec!["S1", "S2", "S3"]);
    assert_eq!(a.members()[&2], vec!["S4", "S5", "S6"]);
    assert!(a.silhouette() > 0.9);
}

#[test]
fn test_selection_repeats_for_the_same_seed() {
    let matrix = DistanceMatrix::parse(&square_tsv()).unwrap();
    let first = select_clusters(&matrix, 2, 5, 7).unwrap();
    for _ in 0..3 {
        assert_eq!(select_clusters(&matrix, 2, 5, 7).unwrap(), first);
    }
}

/// Writes a fixed distance table to its `distances` output.
struct MatrixStep(String);

impl ExternalStep for MatrixStep {
    fn execute<'a>(&'a self, inv: &'a Invocation) -> BoxFuture<'a, Result<StepStatus>> {
        Box::pin(async move {
            std::fs::write(inv.require_output("distances")?, &self.0)?;
            Ok(StepStatus::Success)
        })
    }

    fn describe(&self) -> String {
        "matrix".to_string()
    }
}

/// qc per sample, one distance table, cluster selection, then a report
/// over the qc outputs and the clusters.
fn clustering_graph(
    ws: &Workspace,
    ids: &[&str],
    matrix: String,
    report: Arc<RecordingStep>,
) -> TaskGraph {
    let pairs: Vec<(&str, bool)> = ids.iter().map(|id| (*id, false)).collect();
    let samples = ws.samples(&pairs);
    let templates = vec![
        RuleTemplate::per_sample("qc", RecordingStep::new())
            .input("forward", PathSpec::sample_input(FORWARD))
            .output("json", PathSpec::wildcard("qc/{sample}.json")),
        RuleTemplate::aggregate("dist", Arc::new(MatrixStep(matrix)))
            .input("parts", PathSpec::output_of("qc", "json"))
            .output("distances", PathSpec::literal("dist/distances.tsv")),
        RuleTemplate::aggregate(
            "cluster",
            Arc::new(ClusterSelect {
                options: ClusterOptions::default(),
                seed: 1,
            }),
        )
        .input("distances", PathSpec::output_of("dist", "distances"))
        .output("silhouettes", PathSpec::literal("cluster/silhouettes.tsv"))
        .output("assignments", PathSpec::literal("cluster/assignments.tsv"))
        .output("medoids", PathSpec::literal("cluster/medoids.tsv"))
        .output("json", PathSpec::literal("cluster/clusters.json"))
        .max_attempts(3),
        RuleTemplate::aggregate("report", report)
            .input("samples", PathSpec::output_of("qc", "json"))
            .input("clusters", PathSpec::output_of("cluster", "json"))
            .output("json", PathSpec::literal("report.json")),
    ];
    ws.build(&templates, &samples).unwrap()
}

#[tokio::test]
async fn test_cluster_step_writes_tables_inside_a_run() {
    let ws = Workspace::new();
    let report_step = RecordingStep::new();
    let graph = clustering_graph(&ws, &NAMES, square_tsv(), report_step.clone());

    let report = run(graph, &ws.out, 3).await;
    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(report_step.call_count(), 1);

    let clusters: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(ws.output("cluster/clusters.json")).unwrap())
            .unwrap();
    assert_eq!(clusters["k"], 2);
    assert_eq!(clusters["assignments"]["S1"], 1);
    assert_eq!(clusters["assignments"]["S6"], 2);

    let assignments = std::fs::read_to_string(ws.output("cluster/assignments.tsv")).unwrap();
    assert_eq!(assignments.lines().count(), 7);
    assert!(ws.output("cluster/silhouettes.tsv").exists());
}

#[tokio::test]
async fn test_too_few_samples_fail_once_and_poison_the_report() {
    let ws = Workspace::new();
    let report_step = RecordingStep::new();
    let graph = clustering_graph(&ws, &["A"], "\tA\nA\t0\n".to_string(), report_step.clone());

    let report = run(graph, &ws.out, 2).await;
    assert!(!report.is_success());

    assert_eq!(report.failed.len(), 1);
    let failed = &report.failed[0];
    assert_eq!(failed.task, TaskId::aggregate("cluster"));
    assert_eq!(failed.attempts, 1);
    assert!(failed.error.contains("Insufficient samples"));

    assert_eq!(report.poisoned.len(), 1);
    assert_eq!(report.poisoned[0].task, TaskId::aggregate("report"));
    assert_eq!(report_step.call_count(), 0);

    // Per-sample work and the distance table are still kept.
    assert!(report.succeeded.contains(&TaskId::for_sample("qc", "A")));
    assert!(report.succeeded.contains(&TaskId::aggregate("dist")));
    assert!(ws.output("dist/distances.tsv").exists());
    assert!(!ws.output("cluster/clusters.json").exists());
}

#[tokio::test]
async fn test_two_samples_still_cluster_at_k_min() {
    let ws = Workspace::new();
    let report_step = RecordingStep::new();
    let graph = clustering_graph(
        &ws,
        &["A", "B"],
        "\tA\tB\nA\t0\t0.3\nB\t0.3\t0\n".to_string(),
        report_step.clone(),
    );

    let report = run(graph, &ws.out, 2).await;
    assert!(report.is_success(), "{}", report.summary());
    assert_eq!(report_step.call_count(), 1);

    let clusters: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(ws.output("cluster/clusters.json")).unwrap())
            .unwrap();
    assert_eq!(clusters["k"], 2);
}
