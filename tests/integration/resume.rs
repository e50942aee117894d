//! Resume: on-disk outputs are the only memory of completed work.

use std::fs::File;
use std::time::{Duration, SystemTime};

use crate::fixtures::{qc_and_merge, run, RecordingStep, Workspace};

use mgscreen::core::TaskId;
use mgscreen::orchestration::Scheduler;

#[tokio::test]
async fn test_rerun_of_complete_root_invokes_nothing() {
    let ws = Workspace::new();
    let samples = ws.samples(&[("A", false), ("B", true), ("C", false)]);

    let (qc, merge) = (RecordingStep::new(), RecordingStep::new());
    let graph = ws
        .build(&qc_and_merge(qc.clone(), merge.clone()), &samples)
        .unwrap();
    let first = run(graph, &ws.out, 2).await;
    assert!(first.is_success(), "{}", first.summary());
    assert_eq!(first.succeeded.len(), 4);
    assert_eq!(qc.call_count(), 3);
    assert_eq!(merge.call_count(), 1);
    assert!(ws.output("merged.json").exists());

    let (qc2, merge2) = (RecordingStep::new(), RecordingStep::new());
    let graph = ws
        .build(&qc_and_merge(qc2.clone(), merge2.clone()), &samples)
        .unwrap();
    let second = run(graph, &ws.out, 2).await;
    assert!(second.is_success());
    assert_eq!(second.invocations, 0);
    assert_eq!(second.up_to_date.len(), 4);
    assert_eq!(qc2.call_count() + merge2.call_count(), 0);
}

#[tokio::test]
async fn test_touched_input_reruns_its_branch_and_the_aggregate() {
    let ws = Workspace::new();
    let samples = ws.samples(&[("A", false), ("B", false)]);
    let graph = ws
        .build(&qc_and_merge(RecordingStep::new(), RecordingStep::new()), &samples)
        .unwrap();
    assert!(run(graph, &ws.out, 1).await.is_success());

    // A's reads are now newer than every output.
    let later = SystemTime::now() + Duration::from_secs(60);
    File::options()
        .write(true)
        .open(ws.reads.join("A_1.fq"))
        .unwrap()
        .set_modified(later)
        .unwrap();

    let (qc, merge) = (RecordingStep::new(), RecordingStep::new());
    let graph = ws
        .build(&qc_and_merge(qc.clone(), merge.clone()), &samples)
        .unwrap();

    let scheduler = Scheduler::new(graph, &ws.out, 1);
    assert_eq!(
        scheduler.planned(),
        vec![TaskId::for_sample("qc", "A"), TaskId::aggregate("merge")]
    );

    let graph = scheduler.into_graph();
    let report = run(graph, &ws.out, 1).await;
    assert!(report.is_success());
    assert_eq!(qc.call_count(), 1);
    assert_eq!(qc.calls()[0].task, TaskId::for_sample("qc", "A"));
    assert_eq!(merge.call_count(), 1);
    assert_eq!(report.up_to_date, vec![TaskId::for_sample("qc", "B")]);
}

#[tokio::test]
async fn test_deleted_output_is_rebuilt() {
    let ws = Workspace::new();
    let samples = ws.samples(&[("A", false)]);
    let graph = ws
        .build(&qc_and_merge(RecordingStep::new(), RecordingStep::new()), &samples)
        .unwrap();
    assert!(run(graph, &ws.out, 1).await.is_success());

    std::fs::remove_file(ws.output("merged.json")).unwrap();

    let (qc, merge) = (RecordingStep::new(), RecordingStep::new());
    let graph = ws
        .build(&qc_and_merge(qc.clone(), merge.clone()), &samples)
        .unwrap();
    let report = run(graph, &ws.out, 1).await;
    assert!(report.is_success());
    assert_eq!(qc.call_count(), 0);
    assert_eq!(merge.call_count(), 1);
    assert!(ws.output("merged.json").exists());
}
