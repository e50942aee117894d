use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::cluster::ClusterOptions;
use crate::stage::ReadCountMode;
use crate::{mlog_debug, Error, Result};

/// Names (or paths) of the external programs the screening rules invoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub fastp: String,
    pub seqtk: String,
    pub singlem: String,
    pub nonpareil: String,
    pub nonpareil_project: String,
    pub mash: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            fastp: "fastp".to_string(),
            seqtk: "seqtk".to_string(),
            singlem: "singlem".to_string(),
            nonpareil: "nonpareil".to_string(),
            nonpareil_project: "nonpareil_project".to_string(),
            mash: "mash".to_string(),
        }
    }
}

/// Engine configuration, read from `~/.mgscreen/mgscreen.toml` or `--config`.
///
/// Every field has a default, so a partial (or missing) file is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of tasks allowed to run at once.
    pub workers: usize,
    /// Attempts per task before it is permanently failed.
    pub max_attempts: u32,
    /// Subsampling depth (reads per sample).
    pub reads: u64,
    pub kmer: u32,
    /// Seed for every stochastic stage. Drawn at random when unset.
    pub seed: Option<u64>,
    /// Completeness target passed to the redundancy projection.
    pub completeness: u32,
    /// Staging threshold; defaults to `reads`.
    pub min_reads: Option<u64>,
    pub k_min: usize,
    pub k_max: usize,
    pub n_init: usize,
    pub max_iter: usize,
    /// Count only forward files when staging and assume the reverse matches.
    pub approximate_reverse_reads: bool,
    /// Rules whose permanent failure aborts the whole run.
    pub fatal_rules: Vec<String>,
    pub tools: ToolPaths,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 1,
            max_attempts: 3,
            reads: 1_000_000,
            kmer: 21,
            seed: None,
            completeness: 95,
            min_reads: None,
            k_min: 2,
            k_max: 15,
            n_init: 5,
            max_iter: 100,
            approximate_reverse_reads: false,
            fatal_rules: Vec::new(),
            tools: ToolPaths::default(),
        }
    }
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".mgscreen"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("mgscreen.toml"))
    }

    /// Load the user config, falling back to defaults when the file is absent.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            mlog_debug!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load a config file at an explicit path. The file must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let path = expand_tilde(&path.to_string_lossy());
        mlog_debug!("Config::load_from path={}", path.display());
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        mlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Validation("workers must be at least 1".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.k_min < 2 {
            return Err(Error::Validation("k_min must be at least 2".to_string()));
        }
        if self.completeness == 0 || self.completeness > 100 {
            return Err(Error::Validation(format!(
                "completeness must be between 1 and 100, got {}",
                self.completeness
            )));
        }
        Ok(())
    }

    pub fn effective_min_reads(&self) -> u64 {
        self.min_reads.unwrap_or(self.reads)
    }

    pub fn read_count_mode(&self) -> ReadCountMode {
        if self.approximate_reverse_reads {
            ReadCountMode::AssumePairedEqual
        } else {
            ReadCountMode::Exact
        }
    }

    pub fn cluster_options(&self) -> ClusterOptions {
        ClusterOptions {
            k_min: self.k_min,
            k_max: self.k_max,
            n_init: self.n_init,
            max_iter: self.max_iter,
        }
    }
}

/// Everything a single run needs: the merged config plus the run's paths.
///
/// Built once in `main` and passed by reference to the pipeline, builder and
/// scheduler.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Sample map JSON.
    pub sample_map: PathBuf,
    /// Root of every declared output; also the working directory of steps.
    pub output_root: PathBuf,
    pub seed: u64,
    pub config: Config,
}

impl RunConfig {
    pub fn new(sample_map: PathBuf, output_root: PathBuf, config: Config) -> Self {
        let seed = config.seed.unwrap_or_else(rand::random);
        Self {
            sample_map,
            output_root,
            seed,
            config,
        }
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
