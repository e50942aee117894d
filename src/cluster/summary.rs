//! Within- and between-cluster distance structure of a selected clustering.

use super::{ClusterAssignment, DistanceMatrix};
use serde::Serialize;
use std::collections::BTreeMap;

/// Count, mean and median of a set of pairwise distances.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistanceStats {
    pub n_pairs: usize,
    pub mean_distance: Option<f64>,
    pub median_distance: Option<f64>,
}

impl DistanceStats {
    pub fn of(distances: &[f64]) -> Self {
        Self {
            n_pairs: distances.len(),
            mean_distance: mean(distances),
            median_distance: median(distances),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSpread {
    pub members: Vec<String>,
    pub n_members: usize,
    #[serde(flatten)]
    pub stats: DistanceStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterPair {
    pub clusters: [usize; 2],
    #[serde(flatten)]
    pub stats: DistanceStats,
}

/// How far apart clusters sit relative to how spread out they are.
///
/// Singleton clusters have no within distance and drop out of the within
/// statistics and of every pair ratio.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Separation {
    pub n_clusters: usize,
    pub n_between_pairs: usize,
    pub mean_within_distance: Option<f64>,
    pub sd_within_distance: Option<f64>,
    pub mean_between_distance: Option<f64>,
    pub sd_between_distance: Option<f64>,
    pub ratio_between_over_within: Option<f64>,
    /// Per cluster pair: between mean over the mean of the two within means.
    pub pair_ratio_mean: Option<f64>,
    pub pair_ratio_sd: Option<f64>,
}

/// Distance summary written next to the cluster tables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistanceSummary {
    pub overall: DistanceStats,
    /// Keyed by cluster label.
    pub clusters: BTreeMap<usize, ClusterSpread>,
    /// Keyed `<a>__vs__<b>` with `a < b`.
    pub between_clusters: BTreeMap<String, ClusterPair>,
    pub structure: Separation,
}

impl DistanceSummary {
    /// Summarize every unordered sample pair of `matrix` under `assignment`.
    /// Samples the assignment does not label count toward `overall` only.
    pub fn compute(matrix: &DistanceMatrix, assignment: &ClusterAssignment) -> Self {
        let ids = matrix.ids();
        let labels: Vec<Option<usize>> = ids
            .iter()
            .map(|id| assignment.assignments.get(id).copied())
            .collect();

        let mut all = Vec::new();
        let mut within: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
        let mut between: BTreeMap<(usize, usize), Vec<f64>> = BTreeMap::new();
        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                let d = matrix.get(i, j);
                all.push(d);
                match (labels[i], labels[j]) {
                    (Some(a), Some(b)) if a == b => within.entry(a).or_default().push(d),
                    (Some(a), Some(b)) => between.entry((a.min(b), a.max(b))).or_default().push(d),
                    _ => {}
                }
            }
        }

        let clusters: BTreeMap<usize, ClusterSpread> = assignment
            .members()
            .into_iter()
            .map(|(label, members)| {
                let stats = DistanceStats::of(within.get(&label).map_or(&[][..], Vec::as_slice));
                let spread = ClusterSpread {
                    n_members: members.len(),
                    members: members.into_iter().map(String::from).collect(),
                    stats,
                };
                (label, spread)
            })
            .collect();

        let pairs: Vec<ClusterPair> = between
            .iter()
            .map(|(&(a, b), distances)| ClusterPair {
                clusters: [a, b],
                stats: DistanceStats::of(distances),
            })
            .collect();

        let structure = separation(&clusters, &pairs);
        Self {
            overall: DistanceStats::of(&all),
            clusters,
            between_clusters: pairs
                .into_iter()
                .map(|p| (format!("{}__vs__{}", p.clusters[0], p.clusters[1]), p))
                .collect(),
            structure,
        }
    }
}

fn separation(clusters: &BTreeMap<usize, ClusterSpread>, pairs: &[ClusterPair]) -> Separation {
    let within_by_cluster: BTreeMap<usize, f64> = clusters
        .iter()
        .filter_map(|(&label, spread)| spread.stats.mean_distance.map(|m| (label, m)))
        .collect();
    let within: Vec<f64> = within_by_cluster.values().copied().collect();
    let between: Vec<f64> = pairs.iter().filter_map(|p| p.stats.mean_distance).collect();

    let ratios: Vec<f64> = pairs
        .iter()
        .filter_map(|p| {
            let m = p.stats.mean_distance?;
            let w1 = *within_by_cluster.get(&p.clusters[0])?;
            let w2 = *within_by_cluster.get(&p.clusters[1])?;
            (w1 > 0.0 && w2 > 0.0).then(|| m / (0.5 * (w1 + w2)))
        })
        .collect();

    let mean_within = mean(&within);
    let mean_between = mean(&between);
    let ratio = match (mean_within, mean_between) {
        (Some(w), Some(b)) if w > 0.0 => Some(b / w),
        _ => None,
    };

    Separation {
        n_clusters: within.len(),
        n_between_pairs: between.len(),
        mean_within_distance: mean_within,
        sd_within_distance: pstdev(&within),
        mean_between_distance: mean_between,
        sd_between_distance: pstdev(&between),
        ratio_between_over_within: ratio,
        pair_ratio_mean: mean(&ratios),
        pair_ratio_sd: pstdev(&ratios),
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

/// Population standard deviation; 0 for a single value.
fn pstdev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}
