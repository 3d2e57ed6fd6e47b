//! ## K-means clustering
//!
//! A small, deterministic k-means for low-dimensional customer profiles.
//!
//! - Initialisation: k-means++ (each new centre drawn with probability proportional to its
//!   squared distance from the closest centre already chosen).
//! - Iteration: Lloyd's algorithm until the total squared centroid shift falls to
//!   `tolerance · mean per-dimension variance` or `max_iter` is reached.
//! - Restarts: `n_init` independent initialisations; the run with the lowest inertia wins
//!   (the earliest run on ties).
//! - Empty clusters are re-seeded with the point farthest from its current centroid.
//!
//! All randomness comes from a `Pcg64Mcg` stream derived from the seed and the restart index,
//! so the same seed and input always give the same partition. Point assignment runs on the
//! `rayon` pool; results are collected in input order, so parallelism never changes the output.

use crate::exceptions::{CreditRiskError, CreditRiskResult};
use crate::settings::RfmSettings;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use rayon::prelude::*;
use tracing::debug;

/// Squared Euclidean distance.
fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Index of (and squared distance to) the closest centroid. Ties go to the lowest index.
fn nearest(point: &[f64], centroids: &[Vec<f64>]) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (i, c) in centroids.iter().enumerate() {
        let d = squared_distance(point, c);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

/// Result of a k-means fit.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansFit {
    pub centroids: Vec<Vec<f64>>,
    /// Cluster id of every input point, in input order.
    pub labels: Vec<usize>,
    /// Sum of squared distances of points to their centroid.
    pub inertia: f64,
    pub iterations: usize,
}

/// K-means configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeans {
    pub n_clusters: usize,
    pub max_iter: usize,
    pub tolerance: f64,
    pub n_init: usize,
    pub seed: u64,
}

impl KMeans {
    pub fn new(n_clusters: usize) -> Self {
        Self {
            n_clusters,
            max_iter: 300,
            tolerance: 1e-4,
            n_init: 10,
            seed: 42,
        }
    }

    pub fn from_settings(settings: &RfmSettings) -> Self {
        Self {
            n_clusters: settings.n_clusters,
            max_iter: settings.max_iter,
            tolerance: settings.tolerance,
            n_init: settings.n_init,
            seed: settings.seed,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn validate(&self, points: &[Vec<f64>]) -> CreditRiskResult<usize> {
        if self.n_clusters == 0 || self.max_iter == 0 || self.n_init == 0 {
            return Err(CreditRiskError::InvalidParameter(
                "n_clusters, max_iter and n_init must be at least 1".to_string(),
            ));
        }
        if points.len() < self.n_clusters {
            return Err(CreditRiskError::InsufficientCustomers {
                customers: points.len(),
                clusters: self.n_clusters,
            });
        }
        let dims = points[0].len();
        if dims == 0 {
            return Err(CreditRiskError::InvalidParameter(
                "Points must have at least one dimension".to_string(),
            ));
        }
        for (i, p) in points.iter().enumerate() {
            if p.len() != dims {
                return Err(CreditRiskError::InvalidParameter(format!(
                    "Point {} has {} dimensions, expected {}",
                    i,
                    p.len(),
                    dims
                )));
            }
            if p.iter().any(|v| !v.is_finite()) {
                return Err(CreditRiskError::InvalidParameter(format!(
                    "Point {} has a non-finite coordinate",
                    i
                )));
            }
        }
        Ok(dims)
    }

    /// Partitions `points` into `n_clusters` clusters.
    pub fn fit(&self, points: &[Vec<f64>]) -> CreditRiskResult<KMeansFit> {
        let dims = self.validate(points)?;
        let threshold = self.tolerance * mean_variance(points, dims);

        let mut best: Option<KMeansFit> = None;
        for run in 0..self.n_init as u64 {
            let mut rng =
                Pcg64Mcg::seed_from_u64(self.seed ^ run.wrapping_mul(0x9e37_79b9_7f4a_7c15));
            let fit = self.lloyd(points, self.init_plus_plus(points, &mut rng), threshold);
            debug!(
                "k-means run {}: inertia {:.6} after {} iterations",
                run, fit.inertia, fit.iterations
            );
            if best.as_ref().is_none_or(|b| fit.inertia < b.inertia) {
                best = Some(fit);
            }
        }
        best.ok_or_else(|| {
            CreditRiskError::InvalidParameter("n_init must be at least 1".to_string())
        })
    }

    /// k-means++ seeding.
    fn init_plus_plus(&self, points: &[Vec<f64>], rng: &mut Pcg64Mcg) -> Vec<Vec<f64>> {
        let n = points.len();
        let mut chosen = vec![rng.gen_range(0..n)];
        let mut min_dist: Vec<f64> = points
            .iter()
            .map(|p| squared_distance(p, &points[chosen[0]]))
            .collect();

        while chosen.len() < self.n_clusters {
            let total: f64 = min_dist.iter().sum();
            let next = if total > 0.0 {
                let r = rng.gen::<f64>() * total;
                let mut cumulative = 0.0;
                let mut pick = None;
                for (i, d) in min_dist.iter().enumerate() {
                    cumulative += d;
                    if cumulative > r {
                        pick = Some(i);
                        break;
                    }
                }
                // Rounding can leave r at or above the final sum.
                pick.or_else(|| min_dist.iter().rposition(|d| *d > 0.0))
            } else {
                None
            };
            // Fewer distinct points than clusters: take the next unused index.
            let next = next
                .or_else(|| (0..n).find(|i| !chosen.contains(i)))
                .unwrap_or(0);
            chosen.push(next);
            for (d, p) in min_dist.iter_mut().zip(points) {
                *d = d.min(squared_distance(p, &points[next]));
            }
        }
        chosen.into_iter().map(|i| points[i].clone()).collect()
    }

    /// Lloyd iterations from the given initial centroids.
    fn lloyd(
        &self,
        points: &[Vec<f64>],
        mut centroids: Vec<Vec<f64>>,
        threshold: f64,
    ) -> KMeansFit {
        let dims = centroids[0].len();
        let mut iterations = 0;
        let mut assignment = assign(points, &centroids);

        while iterations < self.max_iter {
            iterations += 1;
            let mut sums = vec![vec![0.0; dims]; self.n_clusters];
            let mut counts = vec![0usize; self.n_clusters];
            for (p, &(label, _)) in points.iter().zip(&assignment) {
                counts[label] += 1;
                for (s, v) in sums[label].iter_mut().zip(p) {
                    *s += v;
                }
            }

            let mut new_centroids: Vec<Vec<f64>> = sums
                .into_iter()
                .zip(&counts)
                .map(|(s, &c)| {
                    if c == 0 {
                        s
                    } else {
                        s.into_iter().map(|v| v / c as f64).collect()
                    }
                })
                .collect();
            relocate_empty(points, &assignment, &counts, &mut new_centroids);

            let shift: f64 = centroids
                .iter()
                .zip(&new_centroids)
                .map(|(a, b)| squared_distance(a, b))
                .sum();
            centroids = new_centroids;
            assignment = assign(points, &centroids);
            if shift <= threshold {
                break;
            }
        }

        KMeansFit {
            labels: assignment.iter().map(|(l, _)| *l).collect(),
            inertia: assignment.iter().map(|(_, d)| d).sum(),
            centroids,
            iterations,
        }
    }
}

/// Nearest-centroid assignment of every point, in input order.
fn assign(points: &[Vec<f64>], centroids: &[Vec<f64>]) -> Vec<(usize, f64)> {
    points.par_iter().map(|p| nearest(p, centroids)).collect()
}

/// Moves every empty cluster onto the point farthest from its assigned centroid.
fn relocate_empty(
    points: &[Vec<f64>],
    assignment: &[(usize, f64)],
    counts: &[usize],
    centroids: &mut [Vec<f64>],
) {
    let empty: Vec<usize> = (0..counts.len()).filter(|&c| counts[c] == 0).collect();
    if empty.is_empty() {
        return;
    }
    let mut order: Vec<usize> = (0..points.len()).collect();
    order.sort_by(|&a, &b| assignment[b].1.total_cmp(&assignment[a].1).then(a.cmp(&b)));
    for (cluster, point) in empty.into_iter().zip(order) {
        centroids[cluster] = points[point].clone();
    }
}

/// Mean over dimensions of the per-dimension population variance.
fn mean_variance(points: &[Vec<f64>], dims: usize) -> f64 {
    let n = points.len() as f64;
    let mut total = 0.0;
    for d in 0..dims {
        let mean = points.iter().map(|p| p[d]).sum::<f64>() / n;
        total += points.iter().map(|p| (p[d] - mean).powi(2)).sum::<f64>() / n;
    }
    total / dims as f64
}
