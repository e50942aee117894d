//! Output freshness and housekeeping around a task attempt.

use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::mlog_trace;
use std::path::Path;
use std::time::SystemTime;

/// A task is up to date when it has outputs, all of them exist, and the
/// oldest output is no older than the newest input.
pub fn is_up_to_date(task: &Task) -> bool {
    if task.outputs.is_empty() {
        return false;
    }

    let mut oldest_output: Option<SystemTime> = None;
    for output in &task.outputs {
        match modified(Path::new(&output.path)) {
            Some(time) => {
                oldest_output = Some(oldest_output.map_or(time, |o| o.min(time)));
            }
            None => return false,
        }
    }

    let mut newest_input: Option<SystemTime> = None;
    for input in &task.inputs {
        match modified(Path::new(&input.path)) {
            Some(time) => {
                newest_input = Some(newest_input.map_or(time, |n| n.max(time)));
            }
            None => return false,
        }
    }

    let fresh = match (oldest_output, newest_input) {
        (Some(output), Some(input)) => output >= input,
        (Some(_), None) => true,
        (None, _) => false,
    };
    mlog_trace!(
        "freshness {}: oldest output {:?}, newest input {:?} -> {}",
        task.id,
        oldest_output,
        newest_input,
        fresh
    );
    fresh
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Check that a finished attempt left every declared output behind.
///
/// JSON outputs must also parse, so a truncated write is caught here rather
/// than by a downstream consumer.
pub fn verify_outputs(task: &Task) -> Result<()> {
    for output in &task.outputs {
        let path = Path::new(&output.path);
        if !path.exists() {
            return Err(Error::Validation(format!(
                "task {} did not produce {}",
                task.id, output.path
            )));
        }
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            let text = std::fs::read_to_string(path)?;
            serde_json::from_str::<serde_json::Value>(&text).map_err(|e| {
                Error::Validation(format!(
                    "task {} wrote invalid JSON to {}: {}",
                    task.id, output.path, e
                ))
            })?;
        }
    }
    Ok(())
}

/// Remove whatever outputs a task left behind. Missing files are ignored.
pub fn remove_outputs(task: &Task) -> Result<()> {
    for output in &task.outputs {
        match std::fs::remove_file(&output.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) if Path::new(&output.path).is_dir() => {
                std::fs::remove_dir_all(&output.path).map_err(|_| Error::Io(e))?;
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(())
}

/// Create output parent directories and clear stale outputs before a run.
pub fn prepare_outputs(task: &Task) -> Result<()> {
    remove_outputs(task)?;
    for output in &task.outputs {
        if let Some(parent) = Path::new(&output.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }
    Ok(())
}

/// Sum of the sizes of every existing input file.
pub fn total_input_bytes(task: &Task) -> u64 {
    task.inputs
        .iter()
        .filter_map(|p| std::fs::metadata(&p.path).ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{NamedPath, TaskId};
    use crate::core::template::RuleTemplate;
    use crate::orchestration::step::NoopStep;
    use std::fs::{File, FileTimes};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    fn task(inputs: &[PathBuf], outputs: &[PathBuf]) -> Task {
        let template = Arc::new(RuleTemplate::per_sample("t", Arc::new(NoopStep)));
        Task::new(
            TaskId::for_sample("t", "S1"),
            template,
            inputs
                .iter()
                .map(|p| NamedPath::new("in", p.to_string_lossy()))
                .collect(),
            outputs
                .iter()
                .map(|p| NamedPath::new("out", p.to_string_lossy()))
                .collect(),
        )
    }

    fn touch(path: &Path, age_secs: u64) {
        std::fs::write(path, b"x").unwrap();
        let time = SystemTime::now() - Duration::from_secs(age_secs);
        let file = File::options().write(true).open(path).unwrap();
        file.set_times(FileTimes::new().set_modified(time)).unwrap();
    }

    #[test]
    fn test_fresh_when_outputs_newer() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.fq");
        let output = dir.path().join("out.txt");
        touch(&input, 100);
        touch(&output, 10);
        assert!(is_up_to_date(&task(&[input], &[output])));
    }

    #[test]
    fn test_stale_when_input_newer() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.fq");
        let output = dir.path().join("out.txt");
        touch(&output, 100);
        touch(&input, 10);
        assert!(!is_up_to_date(&task(&[input], &[output])));
    }

    #[test]
    fn test_stale_when_output_missing_or_none_declared() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.fq");
        touch(&input, 100);
        assert!(!is_up_to_date(&task(&[input.clone()], &[dir.path().join("nope")])));
        assert!(!is_up_to_date(&task(&[input], &[])));
    }

    #[test]
    fn test_verify_outputs_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("summary.json");
        std::fs::write(&output, "{\"truncated\": ").unwrap();
        let t = task(&[], &[output.clone()]);
        assert!(verify_outputs(&t).is_err());
        std::fs::write(&output, "{\"ok\": 1}").unwrap();
        assert!(verify_outputs(&t).is_ok());
    }

    #[test]
    fn test_prepare_creates_parents_and_clears_stale() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("a/stale.txt");
        let nested = dir.path().join("b/c/new.txt");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, "old").unwrap();

        prepare_outputs(&task(&[], &[stale.clone(), nested.clone()])).unwrap();
        assert!(!stale.exists());
        assert!(nested.parent().unwrap().is_dir());
    }

    #[test]
    fn test_total_input_bytes_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        std::fs::write(&a, vec![0u8; 1500]).unwrap();
        assert_eq!(total_input_bytes(&task(&[a, dir.path().join("b")], &[])), 1500);
    }
}
