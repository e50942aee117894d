//! Cluster count selection over a pairwise distance matrix.
//!
//! For every k in range, PAM partitions the samples around k medoids and the
//! mean silhouette scores the partition. The k with the highest silhouette
//! wins, ties going to the smaller k.

pub mod kmedoids;
pub mod matrix;
pub mod summary;

pub use matrix::DistanceMatrix;
pub use summary::DistanceSummary;

use crate::error::{Error, Result};
use crate::{mlog, mlog_debug};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

/// Search bounds and effort for cluster selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterOptions {
    pub k_min: usize,
    pub k_max: usize,
    /// Random restarts per k.
    pub n_init: usize,
    /// Swap iterations per restart.
    pub max_iter: usize,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            k_min: 2,
            k_max: 15,
            n_init: 5,
            max_iter: 100,
        }
    }
}

/// Mean silhouette of the best partition for one k.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SilhouetteScore {
    pub k: usize,
    pub silhouette: f64,
}

/// The selected clustering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterAssignment {
    /// Chosen number of clusters.
    pub k: usize,
    /// Sample id to 1-based cluster label.
    pub assignments: BTreeMap<String, usize>,
    /// Medoid sample of cluster `i + 1`.
    pub medoids: Vec<String>,
    /// Every k tried, ascending.
    pub silhouettes: Vec<SilhouetteScore>,
}

impl ClusterAssignment {
    pub fn silhouette(&self) -> f64 {
        self.silhouettes
            .iter()
            .find(|s| s.k == self.k)
            .map(|s| s.silhouette)
            .unwrap_or(0.0)
    }

    /// Samples per cluster, by label.
    pub fn members(&self) -> BTreeMap<usize, Vec<&str>> {
        let mut members: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
        for (sample, &label) in &self.assignments {
            members.entry(label).or_default().push(sample);
        }
        members
    }

    pub fn silhouettes_tsv(&self) -> String {
        let mut out = String::from("k\tsilhouette\n");
        for s in &self.silhouettes {
            let _ = writeln!(out, "{}\t{:.6}", s.k, s.silhouette);
        }
        out
    }

    pub fn assignments_tsv(&self) -> String {
        let mut out = String::from("sample\tcluster\n");
        for (sample, label) in &self.assignments {
            let _ = writeln!(out, "{}\t{}", sample, label);
        }
        out
    }

    pub fn medoids_tsv(&self) -> String {
        let mut out = String::from("cluster\tmedoid\n");
        for (i, medoid) in self.medoids.iter().enumerate() {
            let _ = writeln!(out, "{}\t{}", i + 1, medoid);
        }
        out
    }

    /// Write the three tables as `<prefix>_silhouettes.tsv`,
    /// `<prefix>_assignments.tsv` and `<prefix>_medoids.tsv`.
    pub fn write_tables(&self, prefix: &Path) -> Result<()> {
        let with_suffix = |suffix: &str| {
            let mut name = prefix.as_os_str().to_owned();
            name.push(suffix);
            std::path::PathBuf::from(name)
        };
        if let Some(parent) = prefix.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(with_suffix("_silhouettes.tsv"), self.silhouettes_tsv())?;
        std::fs::write(with_suffix("_assignments.tsv"), self.assignments_tsv())?;
        std::fs::write(with_suffix("_medoids.tsv"), self.medoids_tsv())?;
        Ok(())
    }
}

/// Select a cluster count in `[k_min, k_max]` with default effort.
pub fn select_clusters(
    matrix: &DistanceMatrix,
    k_min: usize,
    k_max: usize,
    seed: u64,
) -> Result<ClusterAssignment> {
    let options = ClusterOptions {
        k_min,
        k_max,
        ..ClusterOptions::default()
    };
    select_clusters_with(matrix, &options, seed)
}

/// Select a cluster count.
///
/// The upper bound is clamped to `n - 1`, since at `k = n` every cluster is
/// a singleton and scores 0, but never below `k_min`.
///
/// # Errors
///
/// `InsufficientSamples` when `k_max < k_min` or `k_min` exceeds the sample
/// count, `Validation` when `k_min < 2`.
pub fn select_clusters_with(
    matrix: &DistanceMatrix,
    options: &ClusterOptions,
    seed: u64,
) -> Result<ClusterAssignment> {
    if options.k_min < 2 {
        return Err(Error::Validation(format!(
            "k_min must be at least 2, got {}",
            options.k_min
        )));
    }
    let n = matrix.len();
    if options.k_max < options.k_min || options.k_min > n {
        return Err(Error::InsufficientSamples {
            samples: n,
            k_min: options.k_min,
            k_max: options.k_max,
        });
    }
    // k = n leaves only singletons, so stop at n - 1 unless k_min asks for more.
    let k_max = options.k_min.max(options.k_max.min(n.saturating_sub(1)));

    mlog!(
        "Testing k={}..{} on {} samples (seed {})",
        options.k_min,
        k_max,
        n,
        seed
    );

    let d = matrix.distances();
    let mut silhouettes = Vec::new();
    let mut best: Option<(f64, kmedoids::Partition)> = None;
    for k in options.k_min..=k_max {
        let partition = kmedoids::pam(d, k, options.n_init, options.max_iter, seed);
        let score = kmedoids::silhouette(d, &partition.labels);
        mlog_debug!(
            "k={} silhouette={:.4} cost={:.4}",
            k,
            score,
            partition.cost
        );
        silhouettes.push(SilhouetteScore {
            k,
            silhouette: score,
        });
        if best.as_ref().is_none_or(|(s, _)| score > *s) {
            best = Some((score, partition));
        }
    }

    let (score, partition) = best.ok_or_else(|| {
        Error::Validation("no clustering was evaluated".to_string())
    })?;
    let ids = matrix.ids();
    let assignment = ClusterAssignment {
        k: partition.k(),
        assignments: ids
            .iter()
            .zip(&partition.labels)
            .map(|(id, &label)| (id.clone(), label + 1))
            .collect(),
        medoids: partition.medoids.iter().map(|&m| ids[m].clone()).collect(),
        silhouettes,
    };
    mlog!(
        "Selected k={} (silhouette {:.4})",
        assignment.k,
        score
    );
    Ok(assignment)
}
