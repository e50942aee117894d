use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Unresolved wildcard {{{wildcard}}} in rule {rule}: {pattern}")]
    UnresolvedWildcard {
        rule: String,
        wildcard: String,
        pattern: String,
    },

    #[error("Dangling input {path} of task {task}: no rule produces it and it is not supplied")]
    DanglingInput { task: String, path: String },

    #[error("Output {path} is declared by both {first} and {second}")]
    DuplicateOutput {
        path: String,
        first: String,
        second: String,
    },

    #[error("Cyclic graph: task {task} depends on its own output")]
    CyclicGraph { task: String },

    #[error("Task {task} failed after {attempts} attempt(s): {message}")]
    TaskExecution {
        task: String,
        attempts: u32,
        message: String,
    },

    #[error("Insufficient samples: {samples} sample(s) cannot support k in [{k_min}, {k_max}]")]
    InsufficientSamples {
        samples: usize,
        k_min: usize,
        k_max: usize,
    },

    #[error("Worker pool is full (max {max} concurrent tasks)")]
    WorkerPoolFull { max: usize },

    #[error("External tool not found: {0}")]
    ToolNotFound(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Errors raised while building the task graph.
    ///
    /// These always abort before anything is scheduled.
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            Error::MalformedInput(_)
                | Error::UnresolvedWildcard { .. }
                | Error::DanglingInput { .. }
                | Error::DuplicateOutput { .. }
                | Error::CyclicGraph { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
