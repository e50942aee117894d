//! Step invocation: the boundary between the scheduler and the work itself.
//!
//! A step receives one `Invocation` per attempt and reports success or a
//! failure that may or may not be worth retrying. `CommandStep` runs external
//! programs; builtin steps live in `pipeline::steps`.

use crate::core::task::{NamedPath, TaskId};
use crate::core::template::Resources;
use crate::error::{Error, Result};
use crate::{mlog_debug, mlog_trace};
use futures::future::BoxFuture;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([a-z_]+(?:\.[A-Za-z0-9_]+)?)\}").expect("valid placeholder regex")
});

/// Lines of stderr kept in a failure message.
const STDERR_TAIL_LINES: usize = 20;

/// Everything a step needs for one attempt of one task.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub task: TaskId,
    pub sample: Option<String>,
    pub inputs: Vec<NamedPath>,
    pub outputs: Vec<NamedPath>,
    pub resources: Resources,
    /// Steps run with the output root as their working directory.
    pub workdir: PathBuf,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl Invocation {
    pub fn input(&self, name: &str) -> Option<&str> {
        first_named(&self.inputs, name)
    }

    pub fn inputs_named(&self, name: &str) -> Vec<&str> {
        all_named(&self.inputs, name)
    }

    pub fn has_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&str> {
        first_named(&self.outputs, name)
    }

    /// The first path of a required input port.
    pub fn require_input(&self, name: &str) -> Result<&str> {
        self.input(name).ok_or_else(|| {
            Error::Validation(format!("task {} has no input \"{}\"", self.task, name))
        })
    }

    /// The path of a required output port.
    pub fn require_output(&self, name: &str) -> Result<&str> {
        self.output(name).ok_or_else(|| {
            Error::Validation(format!("task {} has no output \"{}\"", self.task, name))
        })
    }
}

fn first_named<'a>(paths: &'a [NamedPath], name: &str) -> Option<&'a str> {
    paths
        .iter()
        .find(|p| p.name == name)
        .map(|p| p.path.as_str())
}

fn all_named<'a>(paths: &'a [NamedPath], name: &str) -> Vec<&'a str> {
    paths
        .iter()
        .filter(|p| p.name == name)
        .map(|p| p.path.as_str())
        .collect()
}

/// Outcome of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Success,
    Failed { message: String, retryable: bool },
}

impl StepStatus {
    pub fn failed(message: impl Into<String>) -> Self {
        StepStatus::Failed {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that no amount of retrying or extra memory will fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        StepStatus::Failed {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepStatus::Success)
    }
}

/// The work behind a rule template.
///
/// `Err` is reserved for problems outside the step's own failure modes
/// (I/O on the engine side, bad bindings); a step that ran and failed returns
/// `Ok(StepStatus::Failed)`.
pub trait ExternalStep: Send + Sync {
    fn execute<'a>(&'a self, invocation: &'a Invocation) -> BoxFuture<'a, Result<StepStatus>>;

    /// Short human-readable description for logs and dry runs.
    fn describe(&self) -> String;

    /// External programs this step needs on `PATH`.
    fn programs(&self) -> Vec<String> {
        Vec::new()
    }
}

/// A step that does nothing and succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStep;

impl ExternalStep for NoopStep {
    fn execute<'a>(&'a self, _invocation: &'a Invocation) -> BoxFuture<'a, Result<StepStatus>> {
        Box::pin(async { Ok(StepStatus::Success) })
    }

    fn describe(&self) -> String {
        "noop".to_string()
    }
}

/// One program invocation inside a `CommandStep`.
///
/// Arguments may contain `{input.NAME}`, `{output.NAME}`, `{sample}`,
/// `{threads}`, `{mem_mb}` and `{runtime_min}`. An argument that is exactly
/// one multi-path placeholder expands to one argument per path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argv {
    pub program: String,
    pub args: Vec<String>,
    /// Output port that receives the program's stdout.
    pub stdout: Option<String>,
    /// Only run when the task has this input port bound.
    pub when_input: Option<String>,
    /// Only run when the task does not have this input port bound.
    pub unless_input: Option<String>,
}

impl Argv {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdout: None,
            when_input: None,
            unless_input: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdout_to(mut self, output: impl Into<String>) -> Self {
        self.stdout = Some(output.into());
        self
    }

    pub fn when_input(mut self, input: impl Into<String>) -> Self {
        self.when_input = Some(input.into());
        self
    }

    pub fn unless_input(mut self, input: impl Into<String>) -> Self {
        self.unless_input = Some(input.into());
        self
    }

    /// Whether this argv applies to the invocation's bound inputs.
    pub fn applies_to(&self, invocation: &Invocation) -> bool {
        let wanted = self
            .when_input
            .as_ref()
            .is_none_or(|name| invocation.has_input(name));
        let unwanted = self
            .unless_input
            .as_ref()
            .is_some_and(|name| invocation.has_input(name));
        wanted && !unwanted
    }

    /// Resolve every placeholder against an invocation.
    pub fn render(&self, invocation: &Invocation) -> Result<Vec<String>> {
        let mut rendered = Vec::with_capacity(self.args.len());
        for arg in &self.args {
            if let Some(caps) = PLACEHOLDER.captures(arg) {
                if caps.get(0).map(|m| m.as_str().len()) == Some(arg.len()) {
                    rendered.extend(resolve(&caps[1], invocation)?);
                    continue;
                }
            }
            let mut failure = None;
            let replaced = PLACEHOLDER.replace_all(arg, |caps: &regex::Captures<'_>| {
                match resolve(&caps[1], invocation) {
                    Ok(values) => values.join(" "),
                    Err(e) => {
                        failure.get_or_insert(e);
                        String::new()
                    }
                }
            });
            if let Some(e) = failure {
                return Err(e);
            }
            rendered.push(replaced.into_owned());
        }
        Ok(rendered)
    }
}

fn resolve(key: &str, invocation: &Invocation) -> Result<Vec<String>> {
    let unknown = || {
        Error::Validation(format!(
            "task {}: cannot resolve placeholder {{{}}}",
            invocation.task, key
        ))
    };
    let values: Vec<String> = match key.split_once('.') {
        Some(("input", name)) => invocation
            .inputs_named(name)
            .into_iter()
            .map(String::from)
            .collect(),
        Some(("output", name)) => all_named(&invocation.outputs, name)
            .into_iter()
            .map(String::from)
            .collect(),
        Some(_) => return Err(unknown()),
        None => match key {
            "sample" => invocation.sample.iter().cloned().collect(),
            "threads" => vec![invocation.resources.threads.to_string()],
            "mem_mb" => vec![invocation.resources.mem_mb.to_string()],
            "runtime_min" => vec![invocation.resources.runtime_min.to_string()],
            _ => return Err(unknown()),
        },
    };
    if values.is_empty() {
        return Err(unknown());
    }
    Ok(values)
}

/// Runs a sequence of external programs; the first failure stops the step.
#[derive(Debug, Clone)]
pub struct CommandStep {
    commands: Vec<Argv>,
}

impl CommandStep {
    pub fn new(commands: Vec<Argv>) -> Self {
        Self { commands }
    }

    pub fn single(argv: Argv) -> Self {
        Self::new(vec![argv])
    }

    pub fn commands(&self) -> &[Argv] {
        &self.commands
    }

    async fn run_one(&self, argv: &Argv, invocation: &Invocation) -> Result<StepStatus> {
        let args = argv.render(invocation)?;
        mlog_trace!(
            "{} attempt {}: {} {}",
            invocation.task,
            invocation.attempt,
            argv.program,
            args.join(" ")
        );

        let mut command = Command::new(&argv.program);
        command
            .args(&args)
            .current_dir(&invocation.workdir)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match &argv.stdout {
            Some(port) => {
                let path = invocation.output(port).ok_or_else(|| {
                    Error::Validation(format!(
                        "task {}: stdout target {} is not an output",
                        invocation.task, port
                    ))
                })?;
                let file = std::fs::File::create(in_workdir(&invocation.workdir, path))?;
                command.stdout(Stdio::from(file));
            }
            None => {
                command.stdout(Stdio::null());
            }
        }

        let child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::ToolNotFound(argv.program.clone()),
            _ => Error::Io(e),
        })?;

        let output = match runtime_limit(invocation.resources.runtime_min) {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output?,
                Err(_) => {
                    return Ok(StepStatus::failed(format!(
                        "{} exceeded its runtime of {} min",
                        argv.program, invocation.resources.runtime_min
                    )))
                }
            },
            None => child.wait_with_output().await?,
        };

        if output.status.success() {
            return Ok(StepStatus::Success);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail = stderr_tail(&stderr);
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        mlog_debug!("{} exited with {}: {}", argv.program, code, tail);
        Ok(StepStatus::failed(if tail.is_empty() {
            format!("{} exited with status {}", argv.program, code)
        } else {
            format!("{} exited with status {}: {}", argv.program, code, tail)
        }))
    }
}

impl ExternalStep for CommandStep {
    fn execute<'a>(&'a self, invocation: &'a Invocation) -> BoxFuture<'a, Result<StepStatus>> {
        Box::pin(async move {
            for argv in self.commands.iter().filter(|a| a.applies_to(invocation)) {
                let status = self.run_one(argv, invocation).await?;
                if !status.is_success() {
                    return Ok(status);
                }
            }
            Ok(StepStatus::Success)
        })
    }

    fn describe(&self) -> String {
        self.commands
            .iter()
            .map(|c| format!("{} {}", c.program, c.args.join(" ")))
            .collect::<Vec<_>>()
            .join(" && ")
    }

    fn programs(&self) -> Vec<String> {
        let mut programs: Vec<String> = self.commands.iter().map(|c| c.program.clone()).collect();
        programs.sort();
        programs.dedup();
        programs
    }
}

fn runtime_limit(runtime_min: u64) -> Option<Duration> {
    (runtime_min > 0).then(|| Duration::from_secs(runtime_min.saturating_mul(60)))
}

fn in_workdir(workdir: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        workdir.join(p)
    }
}

fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim().lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}
