//! Graph construction: binding, variants and build-time errors.

use crate::fixtures::{qc_and_merge, RecordingStep, Workspace};

use mgscreen::config::{Config, RunConfig};
use mgscreen::core::{PathSpec, RuleTemplate, SampleRegistry, TaskId, FORWARD};
use mgscreen::pipeline::screening_templates;
use mgscreen::Error;

#[test]
fn test_per_sample_tasks_match_sorted_ids() {
    let ws = Workspace::new();
    let samples = ws.samples(&[("S3", false), ("S1", false), ("S10", true), ("S2", false)]);
    let graph = ws
        .build(&qc_and_merge(RecordingStep::new(), RecordingStep::new()), &samples)
        .unwrap();

    let bound: Vec<String> = graph
        .tasks_for_rule("qc")
        .iter()
        .filter_map(|t| t.sample().map(String::from))
        .collect();
    assert_eq!(bound, vec!["S1", "S10", "S2", "S3"]);
    assert_eq!(graph.tasks_for_rule("merge").len(), 1);
}

#[test]
fn test_single_and_paired_samples_bind_without_wildcard_failure() {
    let ws = Workspace::new();
    let a = ws.fastq("a.fq");
    let b1 = ws.fastq("b_1.fq");
    let b2 = ws.fastq("b_2.fq");
    let samples = SampleRegistry::from_json_str(&format!(
        r#"{{"A": {{"forward": "{}"}}, "B": {{"forward": "{}", "reverse": "{}"}}}}"#,
        a.display(),
        b1.display(),
        b2.display()
    ))
    .unwrap();

    let graph = ws
        .build(&qc_and_merge(RecordingStep::new(), RecordingStep::new()), &samples)
        .unwrap();

    let qc_a = graph.get_task(&TaskId::for_sample("qc", "A")).unwrap();
    let qc_b = graph.get_task(&TaskId::for_sample("qc", "B")).unwrap();
    assert_eq!(qc_a.inputs.len(), 1);
    assert_eq!(qc_b.inputs.len(), 2);
    assert!(qc_a.output("r2").is_none());
    assert!(qc_b.output("r2").is_some());

    let merge = graph.get_task(&TaskId::aggregate("merge")).unwrap();
    assert_eq!(merge.inputs_named("parts").len(), 2);
    assert!(graph.has_dependency(&qc_a.id, &merge.id));
    assert!(graph.has_dependency(&qc_b.id, &merge.id));
}

#[tokio::test]
async fn test_cycle_is_rejected_and_nothing_runs() {
    let ws = Workspace::new();
    let samples = ws.samples(&[("A", false)]);
    let step = RecordingStep::new();
    let templates = vec![
        RuleTemplate::per_sample("first", step.clone())
            .input("reads", PathSpec::sample_input(FORWARD))
            .input("loop", PathSpec::output_of("second", "out"))
            .output("out", PathSpec::wildcard("first/{sample}.txt")),
        RuleTemplate::per_sample("second", step.clone())
            .input("in", PathSpec::output_of("first", "out"))
            .output("out", PathSpec::wildcard("second/{sample}.txt")),
    ];

    let err = ws.build(&templates, &samples).unwrap_err();
    assert!(matches!(err, Error::CyclicGraph { .. }));
    assert!(err.is_build_error());
    assert_eq!(step.call_count(), 0);
}

#[test]
fn test_unresolved_wildcard_and_dangling_input() {
    let ws = Workspace::new();
    let samples = ws.samples(&[("A", false)]);

    let lane = vec![RuleTemplate::per_sample("qc", RecordingStep::new())
        .input("reads", PathSpec::sample_input(FORWARD))
        .output("json", PathSpec::wildcard("qc/{sample}_{lane}.json"))];
    assert!(matches!(
        ws.build(&lane, &samples),
        Err(Error::UnresolvedWildcard { wildcard, .. }) if wildcard == "lane"
    ));

    let dangling = vec![RuleTemplate::per_sample("qc", RecordingStep::new())
        .input("adapters", PathSpec::literal("adapters/{sample}.fa"))
        .output("json", PathSpec::wildcard("qc/{sample}.json"))];
    assert!(matches!(
        ws.build(&dangling, &samples),
        Err(Error::DanglingInput { .. })
    ));
}

#[test]
fn test_duplicate_output_owner() {
    let ws = Workspace::new();
    let samples = ws.samples(&[("A", false)]);
    let templates = vec![
        RuleTemplate::per_sample("one", RecordingStep::new())
            .input("reads", PathSpec::sample_input(FORWARD))
            .output("json", PathSpec::wildcard("shared/{sample}.json")),
        RuleTemplate::per_sample("two", RecordingStep::new())
            .input("reads", PathSpec::sample_input(FORWARD))
            .output("json", PathSpec::wildcard("shared/{sample}.json")),
    ];
    assert!(matches!(
        ws.build(&templates, &samples),
        Err(Error::DuplicateOutput { .. })
    ));
}

#[test]
fn test_screening_pipeline_binds_mixed_samples() {
    let ws = Workspace::new();
    let samples = ws.samples(&[("A", false), ("B", true)]);
    let run = RunConfig::new(ws.out.join("data.json"), ws.out.clone(), Config::default());
    let graph = ws.build(&screening_templates(&run, &samples), &samples).unwrap();

    let fastp_a = graph.get_task(&TaskId::for_sample("fastp", "A")).unwrap();
    let fastp_b = graph.get_task(&TaskId::for_sample("fastp", "B")).unwrap();
    assert!(fastp_a.output("r2").is_none());
    assert!(fastp_b.output("r2").is_some());
    assert!(graph.has_dependency(
        &TaskId::for_sample("fastp", "B"),
        &TaskId::for_sample("subsample", "B")
    ));

    let order = graph.topological_ids();
    let position = |id: &TaskId| order.iter().position(|o| o == id).unwrap();
    assert!(
        position(&TaskId::aggregate("mash_dist")) > position(&TaskId::for_sample("mash_sketch", "B"))
    );
    assert!(position(&TaskId::aggregate("merge_json")) > position(&TaskId::aggregate("cluster")));
    let distances = position(&TaskId::aggregate("cluster_distances"));
    assert!(distances > position(&TaskId::aggregate("cluster")));
    assert!(position(&TaskId::aggregate("merge_json")) > distances);
}
