//! Partitioning Around Medoids over a precomputed distance matrix.

use ndarray::Array2;
use rand::{RngExt, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Swaps must lower the total cost by more than this.
const MIN_IMPROVEMENT: f64 = 1e-12;

/// One k-medoids solution.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    /// Sample index of each medoid.
    pub medoids: Vec<usize>,
    /// Position in `medoids` of each sample's nearest medoid.
    pub labels: Vec<usize>,
    /// Sum of distances to the nearest medoid.
    pub cost: f64,
}

impl Partition {
    fn assign(d: &Array2<f64>, medoids: Vec<usize>) -> Self {
        let n = d.nrows();
        let mut labels = Vec::with_capacity(n);
        let mut cost = 0.0;
        for i in 0..n {
            let (label, dist) = nearest(d, i, &medoids);
            labels.push(label);
            cost += dist;
        }
        Self {
            medoids,
            labels,
            cost,
        }
    }

    pub fn k(&self) -> usize {
        self.medoids.len()
    }

    /// Renumber clusters by first appearance in sample order.
    pub fn canonical(self) -> Self {
        let mut order: Vec<usize> = Vec::with_capacity(self.k());
        for &label in &self.labels {
            if !order.contains(&label) {
                order.push(label);
            }
        }
        for label in 0..self.k() {
            if !order.contains(&label) {
                order.push(label);
            }
        }
        let medoids = order.iter().map(|&old| self.medoids[old]).collect();
        let labels = self
            .labels
            .iter()
            .map(|l| order.iter().position(|o| o == l).unwrap_or(0))
            .collect();
        Self {
            medoids,
            labels,
            cost: self.cost,
        }
    }
}

/// Index into `medoids` of the nearest medoid to `i`, first on ties.
fn nearest(d: &Array2<f64>, i: usize, medoids: &[usize]) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (pos, &m) in medoids.iter().enumerate() {
        let dist = d[[i, m]];
        if dist < best.1 {
            best = (pos, dist);
        }
    }
    best
}

/// Best of `n_init` PAM runs for one k, all drawing from a single generator
/// seeded with `seed`.
pub fn pam(d: &Array2<f64>, k: usize, n_init: usize, max_iter: usize, seed: u64) -> Partition {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut best: Option<Partition> = None;
    for _ in 0..n_init.max(1) {
        let candidate = pam_once(d, k, max_iter, &mut rng);
        if best.as_ref().is_none_or(|b| candidate.cost < b.cost) {
            best = Some(candidate);
        }
    }
    best.unwrap_or_else(|| Partition::assign(d, (0..k).collect()))
        .canonical()
}

fn pam_once(d: &Array2<f64>, k: usize, max_iter: usize, rng: &mut ChaCha8Rng) -> Partition {
    let n = d.nrows();
    let mut partition = Partition::assign(d, init_medoids(d, k, rng));
    let mut dmin: Vec<f64> = (0..n)
        .map(|i| d[[i, partition.medoids[partition.labels[i]]]])
        .collect();

    for _ in 0..max_iter {
        let mut best_swap: Option<(usize, usize)> = None;
        let mut best_delta = -MIN_IMPROVEMENT;

        for pos in 0..k {
            let others: Vec<usize> = partition
                .medoids
                .iter()
                .enumerate()
                .filter(|&(p, _)| p != pos)
                .map(|(_, &m)| m)
                .collect();
            let second: Vec<f64> = (0..n).map(|i| nearest(d, i, &others).1).collect();

            for h in 0..n {
                if partition.medoids.contains(&h) {
                    continue;
                }
                let mut new_cost = 0.0;
                for i in 0..n {
                    new_cost += if partition.labels[i] == pos {
                        d[[i, h]].min(second[i])
                    } else {
                        d[[i, h]].min(dmin[i])
                    };
                }
                let delta = new_cost - partition.cost;
                if delta < best_delta {
                    best_delta = delta;
                    best_swap = Some((pos, h));
                }
            }
        }

        let Some((pos, h)) = best_swap else {
            break;
        };
        let mut medoids = partition.medoids;
        medoids[pos] = h;
        partition = Partition::assign(d, medoids);
        dmin = (0..n)
            .map(|i| d[[i, partition.medoids[partition.labels[i]]]])
            .collect();
    }
    partition
}

/// k-medoids++ seeding: the first medoid uniformly, each further one with
/// probability proportional to its distance from the nearest chosen medoid.
fn init_medoids(d: &Array2<f64>, k: usize, rng: &mut ChaCha8Rng) -> Vec<usize> {
    let n = d.nrows();
    let mut medoids = vec![rng.random_range(0..n)];
    let mut closest: Vec<f64> = (0..n).map(|i| d[[i, medoids[0]]]).collect();

    while medoids.len() < k {
        let candidates: Vec<usize> = (0..n).filter(|i| !medoids.contains(i)).collect();
        let total: f64 = candidates.iter().map(|&i| closest[i]).sum();

        let next = if total > 0.0 {
            let roll = rng.random_range(0.0..total);
            let mut acc = 0.0;
            let mut pick = None;
            for &i in &candidates {
                acc += closest[i];
                if closest[i] > 0.0 && roll < acc {
                    pick = Some(i);
                    break;
                }
            }
            pick.or_else(|| candidates.iter().rev().find(|&&i| closest[i] > 0.0).copied())
        } else {
            None
        };
        // All remaining points coincide with a medoid.
        let next = match next {
            Some(i) => i,
            None => candidates[rng.random_range(0..candidates.len())],
        };

        medoids.push(next);
        for (i, c) in closest.iter_mut().enumerate() {
            *c = c.min(d[[i, next]]);
        }
    }
    medoids
}

/// Mean silhouette of a labelling.
///
/// Members of singleton clusters score 0, as does a point with `a == b == 0`.
/// Fewer than two clusters scores 0 overall.
pub fn silhouette(d: &Array2<f64>, labels: &[usize]) -> f64 {
    let n = labels.len();
    let mut clusters: Vec<usize> = labels.to_vec();
    clusters.sort_unstable();
    clusters.dedup();
    if n == 0 || clusters.len() < 2 {
        return 0.0;
    }

    let mut total = 0.0;
    for i in 0..n {
        let own = labels[i];
        let own_size = labels.iter().filter(|&&l| l == own).count();
        if own_size <= 1 {
            continue;
        }
        let a = (0..n)
            .filter(|&j| labels[j] == own)
            .map(|j| d[[i, j]])
            .sum::<f64>()
            / (own_size - 1) as f64;

        let b = clusters
            .iter()
            .filter(|&&c| c != own)
            .map(|&c| {
                let members: Vec<usize> = (0..n).filter(|&j| labels[j] == c).collect();
                members.iter().map(|&j| d[[i, j]]).sum::<f64>() / members.len() as f64
            })
            .fold(f64::INFINITY, f64::min);

        if a == 0.0 && b == 0.0 {
            continue;
        }
        total += (b - a) / a.max(b);
    }
    total / n as f64
}
