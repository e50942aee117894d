//! Failure handling: retries, escalation, poisoning and cancellation.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::fixtures::{qc_and_merge, run, RecordingStep, Workspace};

use mgscreen::core::{PathSpec, ResourcePolicy, RuleTemplate, TaskId, FORWARD};
use mgscreen::orchestration::{ExternalStep, Invocation, Scheduler, SchedulerEvent, StepStatus};
use mgscreen::Result;

/// A step whose code panics on every attempt.
struct PanickingStep;

impl ExternalStep for PanickingStep {
    fn execute<'a>(&'a self, inv: &'a Invocation) -> BoxFuture<'a, Result<StepStatus>> {
        Box::pin(async move {
            let parsed: u32 = inv.task.rule.parse().unwrap();
            Ok(StepStatus::failed(format!("parsed {}", parsed)))
        })
    }

    fn describe(&self) -> String {
        "panicking".to_string()
    }
}

#[tokio::test]
async fn test_transient_failures_retry_with_escalated_resources() {
    let ws = Workspace::new();
    let samples = ws.samples(&[("A", false)]);
    let qc = RecordingStep::failing_first(2);
    let graph = ws
        .build(&qc_and_merge(qc.clone(), RecordingStep::new()), &samples)
        .unwrap();

    let report = run(graph, &ws.out, 1).await;
    assert!(report.is_success(), "{}", report.summary());

    let calls = qc.calls_for(&TaskId::for_sample("qc", "A"));
    let attempts: Vec<u32> = calls.iter().map(|c| c.attempt).collect();
    let memory: Vec<u64> = calls.iter().map(|c| c.resources.mem_mb).collect();
    let runtime: Vec<u64> = calls.iter().map(|c| c.resources.runtime_min).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(memory, vec![1000, 2000, 3000]);
    assert_eq!(runtime, vec![10, 20, 30]);
    assert!(calls.iter().all(|c| c.resources.threads == 2));
    // Merge, plus three qc attempts.
    assert_eq!(report.invocations, 4);
}

#[tokio::test]
async fn test_shrinking_policy_never_lowers_a_retry_request() {
    let ws = Workspace::new();
    let samples = ws.samples(&[("A", false)]);
    let step = RecordingStep::failing_first(2);
    let templates = vec![RuleTemplate::per_sample("qc", step.clone())
        .input("forward", PathSpec::sample_input(FORWARD))
        .output("json", PathSpec::wildcard("qc/{sample}.json"))
        .resources(ResourcePolicy::new(
            1,
            |_, attempt| 6000 / attempt as u64,
            |_, _| 5,
        ))
        .max_attempts(3)];
    let graph = ws.build(&templates, &samples).unwrap();

    let report = run(graph, &ws.out, 1).await;
    assert!(report.is_success());
    let memory: Vec<u64> = step.calls().iter().map(|c| c.resources.mem_mb).collect();
    assert_eq!(memory, vec![6000, 6000, 6000]);
}

#[tokio::test]
async fn test_exhausted_retries_poison_dependents_only() {
    let ws = Workspace::new();
    let samples = ws.samples(&[("A", false), ("B", true)]);
    let (qc, merge) = (RecordingStep::failing_for(&["A"]), RecordingStep::new());
    let graph = ws
        .build(&qc_and_merge(qc.clone(), merge.clone()), &samples)
        .unwrap();

    let report = run(graph, &ws.out, 2).await;
    assert!(!report.is_success());

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].task, TaskId::for_sample("qc", "A"));
    assert_eq!(report.failed[0].attempts, 3);
    assert_eq!(report.failed[0].error, "exit status 1");

    assert_eq!(report.poisoned.len(), 1);
    assert_eq!(report.poisoned[0].task, TaskId::aggregate("merge"));
    assert_eq!(report.poisoned[0].ancestor, TaskId::for_sample("qc", "A"));

    assert_eq!(report.succeeded, vec![TaskId::for_sample("qc", "B")]);
    assert!(report.cancelled.is_empty());
    assert_eq!(merge.call_count(), 0);
    assert!(ws.output("qc/B.json").exists());
    assert!(!ws.output("qc/A.json").exists());
    assert!(report.summary().contains("1 failed, 1 skipped"));
}

#[tokio::test]
async fn test_missing_declared_output_counts_as_failure() {
    let ws = Workspace::new();
    let samples = ws.samples(&[("A", false)]);
    let qc = RecordingStep::without_outputs();
    let graph = ws
        .build(&qc_and_merge(qc.clone(), RecordingStep::new()), &samples)
        .unwrap();

    let report = run(graph, &ws.out, 1).await;
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].attempts, 3);
    assert!(report.failed[0].error.contains("did not produce"));
    assert_eq!(qc.call_count(), 3);
    assert_eq!(report.poisoned.len(), 1);
}

#[tokio::test]
async fn test_fatal_rule_cancels_the_run() {
    let ws = Workspace::new();
    let samples = ws.samples(&[("A", false), ("B", false), ("C", false)]);
    let qc = RecordingStep::failing_for(&["A"]);
    let templates = vec![
        RuleTemplate::per_sample("qc", qc.clone())
            .input("forward", PathSpec::sample_input(FORWARD))
            .output("json", PathSpec::wildcard("qc/{sample}.json"))
            .max_attempts(1)
            .fatal(true),
        RuleTemplate::aggregate("merge", RecordingStep::new())
            .input("parts", PathSpec::output_of("qc", "json"))
            .output("json", PathSpec::literal("merged.json")),
    ];
    let graph = ws.build(&templates, &samples).unwrap();

    let token = CancellationToken::new();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut scheduler = Scheduler::new(graph, &ws.out, 1)
        .with_events(tx)
        .with_cancellation(token.clone());
    let report = scheduler.run().await.unwrap();

    assert!(token.is_cancelled());
    assert!(!report.is_success());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].task, TaskId::for_sample("qc", "A"));
    assert_eq!(report.poisoned[0].task, TaskId::aggregate("merge"));
    // Every per-sample task is accounted for, whichever order the workers took.
    assert_eq!(
        report.failed.len() + report.succeeded.len() + report.cancelled.len(),
        3
    );

    let mut saw_cancel = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, SchedulerEvent::RunCancelled { .. }) {
            saw_cancel = true;
        }
    }
    assert!(saw_cancel);
}

#[tokio::test]
async fn test_cancelled_before_start_dispatches_nothing() {
    let ws = Workspace::new();
    let samples = ws.samples(&[("A", false), ("B", false)]);
    let qc = RecordingStep::new();
    let graph = ws
        .build(&qc_and_merge(qc.clone(), RecordingStep::new()), &samples)
        .unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let mut scheduler = Scheduler::new(graph, &ws.out, 2).with_cancellation(token);
    let report = scheduler.run().await.unwrap();

    assert_eq!(report.invocations, 0);
    assert_eq!(qc.call_count(), 0);
    assert_eq!(report.cancelled.len(), 3);
    assert!(!report.is_success());
}

#[tokio::test]
async fn test_events_follow_a_retry() {
    let ws = Workspace::new();
    let samples = ws.samples(&[("A", false)]);
    let graph = ws
        .build(
            &qc_and_merge(RecordingStep::failing_first(1), RecordingStep::new()),
            &samples,
        )
        .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut scheduler = Scheduler::new(graph, &ws.out, 1).with_events(tx);
    let report = scheduler.run().await.unwrap();
    assert!(report.is_success());

    let qc = TaskId::for_sample("qc", "A");
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let retrying = events
        .iter()
        .position(|e| matches!(e, SchedulerEvent::TaskRetrying { task_id, attempt: 1, .. } if *task_id == qc))
        .unwrap();
    let succeeded = events
        .iter()
        .position(|e| matches!(e, SchedulerEvent::TaskSucceeded { task_id } if *task_id == qc))
        .unwrap();
    assert!(retrying < succeeded);
    assert_eq!(events.last(), Some(&SchedulerEvent::AllTasksComplete));
}

#[tokio::test]
async fn test_panicking_step_fails_instead_of_hanging() {
    let ws = Workspace::new();
    let samples = ws.samples(&[("A", false), ("B", false)]);
    let merge = RecordingStep::new();
    let templates = vec![
        RuleTemplate::per_sample("qc", Arc::new(PanickingStep))
            .input("forward", PathSpec::sample_input(FORWARD))
            .output("json", PathSpec::wildcard("qc/{sample}.json"))
            .max_attempts(2),
        RuleTemplate::aggregate("merge", merge.clone())
            .input("parts", PathSpec::output_of("qc", "json"))
            .output("json", PathSpec::literal("merged.json")),
    ];
    let graph = ws.build(&templates, &samples).unwrap();

    let mut scheduler = Scheduler::new(graph, &ws.out, 2);
    let report = tokio::time::timeout(Duration::from_secs(10), scheduler.run())
        .await
        .expect("run finishes")
        .unwrap();

    assert_eq!(report.failed.len(), 2);
    for failed in &report.failed {
        assert_eq!(failed.attempts, 2);
        assert!(failed.error.contains("panicked"), "{}", failed.error);
    }
    assert_eq!(report.poisoned[0].task, TaskId::aggregate("merge"));
    assert_eq!(merge.call_count(), 0);
}
