//! Topic clusters over the embedding matrix.
//!
//! [`KMeans`] partitions the corpus with seeded k-means++ initialisation and
//! Lloyd iterations; [`ClusterModel`] holds the resulting partition together
//! with one popularity score per cluster.

use crate::config::{ClusterConfig, PopularityConfig};
use crate::simd::squared_l2;
use crate::vector::EmbeddingMatrix;
use crate::{Error, Result};
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::debug;

/// Cluster count actually used for `n` vectors: `max(1, min(k, n / 2))`,
/// or 0 for an empty corpus.
pub fn effective_k(k_requested: usize, n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    k_requested.min(n / 2).max(1)
}

/// Seeded k-means. The same matrix, config and seed always yield the same
/// assignment.
#[derive(Debug, Clone)]
pub struct KMeans {
    config: ClusterConfig,
}

struct Run {
    assignments: Vec<u32>,
    centroids: EmbeddingMatrix,
    inertia: f64,
}

impl KMeans {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    pub fn fit(&self, vectors: &EmbeddingMatrix) -> ClusterModel {
        let n = vectors.rows();
        let k = effective_k(self.config.k, n);
        if k == 0 {
            return ClusterModel::empty(vectors.dim());
        }

        let mut best: Option<Run> = None;
        for run in 0..self.config.n_init.max(1) {
            let seed = self.config.seed.wrapping_add(run as u64);
            let candidate = self.run_once(vectors, k, seed);
            debug!("k-means run {} (seed {}): inertia {:.4}", run, seed, candidate.inertia);
            if best.as_ref().map_or(true, |b| candidate.inertia < b.inertia) {
                best = Some(candidate);
            }
        }

        // n_init >= 1 guarantees a run
        let best = best.unwrap_or_else(|| self.run_once(vectors, k, self.config.seed));
        let popularity = vec![0.0; k];
        ClusterModel::assemble(best.assignments, best.centroids, popularity)
    }

    fn run_once(&self, vectors: &EmbeddingMatrix, k: usize, seed: u64) -> Run {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut centroids = kmeans_plus_plus(vectors, k, &mut rng);
        let mut assignments = assign_all(vectors, &centroids);

        for iteration in 0..self.config.max_iterations {
            let mut updated = recompute_centroids(vectors, &assignments, k);
            reseed_empty_clusters(vectors, &mut assignments, &mut updated, k);

            let shift = (0..k)
                .map(|c| squared_l2(centroids.row(c), updated.row(c)))
                .fold(0.0f32, f32::max);
            centroids = updated;
            assignments = assign_all(vectors, &centroids);

            if shift <= self.config.tolerance {
                debug!("k-means converged after {} iterations", iteration + 1);
                break;
            }
        }

        // final repair so every cluster id owns at least one member
        let mut final_centroids = recompute_centroids(vectors, &assignments, k);
        if reseed_empty_clusters(vectors, &mut assignments, &mut final_centroids, k) {
            final_centroids = recompute_centroids(vectors, &assignments, k);
        }

        let inertia = vectors
            .iter_rows()
            .zip(&assignments)
            .map(|(row, &c)| squared_l2(row, final_centroids.row(c as usize)) as f64)
            .sum();

        Run {
            assignments,
            centroids: final_centroids,
            inertia,
        }
    }
}

/// k-means++ seeding: each next centroid is drawn with probability
/// proportional to its squared distance from the nearest chosen one.
fn kmeans_plus_plus(vectors: &EmbeddingMatrix, k: usize, rng: &mut StdRng) -> EmbeddingMatrix {
    let n = vectors.rows();
    let mut chosen: Vec<usize> = Vec::with_capacity(k);
    chosen.push(rng.random_range(0..n));

    let mut nearest: Vec<f32> = vectors
        .iter_rows()
        .map(|row| squared_l2(row, vectors.row(chosen[0])))
        .collect();

    while chosen.len() < k {
        let total: f64 = nearest.iter().map(|&d| d as f64).sum();
        let next = if total > 0.0 {
            let target = rng.random::<f64>() * total;
            let mut acc = 0.0f64;
            let mut pick = n - 1;
            for (idx, &d) in nearest.iter().enumerate() {
                acc += d as f64;
                if acc >= target && d > 0.0 {
                    pick = idx;
                    break;
                }
            }
            pick
        } else {
            // every remaining point duplicates a centroid
            (0..n).find(|i| !chosen.contains(i)).unwrap_or(0)
        };
        chosen.push(next);
        for (idx, row) in vectors.iter_rows().enumerate() {
            let d = squared_l2(row, vectors.row(next));
            if d < nearest[idx] {
                nearest[idx] = d;
            }
        }
    }

    let mut centroids = EmbeddingMatrix::with_capacity(vectors.dim(), k);
    for idx in chosen {
        // rows of one matrix always share its dimension
        let _ = centroids.push_row(vectors.row(idx));
    }
    centroids
}

/// Nearest centroid per row; ties go to the lowest cluster id.
fn nearest_centroid(row: &[f32], centroids: &EmbeddingMatrix) -> (u32, f32) {
    let mut best = (0u32, f32::INFINITY);
    for (c, centroid) in centroids.iter_rows().enumerate() {
        let d = squared_l2(row, centroid);
        if d < best.1 {
            best = (c as u32, d);
        }
    }
    best
}

fn assign_all(vectors: &EmbeddingMatrix, centroids: &EmbeddingMatrix) -> Vec<u32> {
    (0..vectors.rows())
        .into_par_iter()
        .map(|i| nearest_centroid(vectors.row(i), centroids).0)
        .collect()
}

fn recompute_centroids(vectors: &EmbeddingMatrix, assignments: &[u32], k: usize) -> EmbeddingMatrix {
    let dim = vectors.dim();
    let mut sums = vec![0.0f64; k * dim];
    let mut counts = vec![0usize; k];
    for (row, &c) in vectors.iter_rows().zip(assignments) {
        let c = c as usize;
        counts[c] += 1;
        for (acc, x) in sums[c * dim..(c + 1) * dim].iter_mut().zip(row) {
            *acc += *x as f64;
        }
    }
    let data: Vec<f32> = sums
        .chunks_exact(dim.max(1))
        .zip(&counts)
        .flat_map(|(sum, &count)| {
            let denom = count.max(1) as f64;
            sum.iter().map(move |s| (s / denom) as f32)
        })
        .collect();
    EmbeddingMatrix::from_flat(dim, data).unwrap_or_else(|_| EmbeddingMatrix::new(dim))
}

/// Move the worst-fitting point of a multi-member cluster into each empty
/// cluster. Returns true if anything moved.
fn reseed_empty_clusters(
    vectors: &EmbeddingMatrix,
    assignments: &mut [u32],
    centroids: &mut EmbeddingMatrix,
    k: usize,
) -> bool {
    let mut counts = vec![0usize; k];
    for &c in assignments.iter() {
        counts[c as usize] += 1;
    }
    let mut moved = false;
    for empty in 0..k {
        if counts[empty] > 0 {
            continue;
        }
        let donor = (0..assignments.len())
            .filter(|&i| counts[assignments[i] as usize] > 1)
            .max_by_key(|&i| {
                let d = squared_l2(vectors.row(i), centroids.row(assignments[i] as usize));
                (OrderedFloat(d), std::cmp::Reverse(i))
            });
        let Some(point) = donor else {
            break;
        };
        counts[assignments[point] as usize] -= 1;
        counts[empty] += 1;
        assignments[point] = empty as u32;

        let dim = centroids.dim();
        let mut flat = centroids.as_flat().to_vec();
        flat[empty * dim..(empty + 1) * dim].copy_from_slice(vectors.row(point));
        if let Ok(m) = EmbeddingMatrix::from_flat(dim, flat) {
            *centroids = m;
        }
        moved = true;
    }
    moved
}

/// A fitted partition: one cluster id per slot, centroids, popularity.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterModel {
    assignments: Vec<u32>,
    centroids: EmbeddingMatrix,
    popularity: Vec<f32>,
    members: Vec<Vec<usize>>,
}

impl ClusterModel {
    pub fn empty(dim: usize) -> Self {
        Self {
            assignments: Vec::new(),
            centroids: EmbeddingMatrix::new(dim),
            popularity: Vec::new(),
            members: Vec::new(),
        }
    }

    fn assemble(assignments: Vec<u32>, centroids: EmbeddingMatrix, popularity: Vec<f32>) -> Self {
        let mut members = vec![Vec::new(); centroids.rows()];
        for (slot, &c) in assignments.iter().enumerate() {
            members[c as usize].push(slot);
        }
        Self {
            assignments,
            centroids,
            popularity,
            members,
        }
    }

    /// Rebuild a model from persisted parts, validating them.
    pub fn from_parts(assignments: Vec<u32>, centroids: EmbeddingMatrix, popularity: Vec<f32>) -> Result<Self> {
        let k = centroids.rows();
        if popularity.len() != k {
            return Err(Error::CacheCorrupt(format!(
                "{} popularity scores for {} clusters",
                popularity.len(),
                k
            )));
        }
        if let Some(bad) = assignments.iter().find(|&&c| c as usize >= k) {
            return Err(Error::CacheCorrupt(format!("cluster id {} out of range 0..{}", bad, k)));
        }
        if popularity.iter().any(|p| !(0.0..=1.0).contains(p)) {
            return Err(Error::CacheCorrupt("popularity outside [0, 1]".into()));
        }
        Ok(Self::assemble(assignments, centroids, popularity))
    }

    /// Partition with explicit ids; centroids are the member means.
    pub fn from_assignments(vectors: &EmbeddingMatrix, assignments: Vec<u32>) -> Result<Self> {
        if assignments.len() != vectors.rows() {
            return Err(Error::InvalidDimension {
                expected: vectors.rows(),
                actual: assignments.len(),
            });
        }
        let k = assignments.iter().map(|&c| c as usize + 1).max().unwrap_or(0);
        let centroids = recompute_centroids(vectors, &assignments, k);
        Ok(Self::assemble(assignments, centroids, vec![0.0; k]))
    }

    /// Score every cluster from per-slot recency scores.
    pub fn compute_popularity(&mut self, recency: &[f32], config: &PopularityConfig) {
        self.popularity = self
            .members
            .iter()
            .map(|slots| {
                let scores: Vec<f32> = slots.iter().filter_map(|&s| recency.get(s).copied()).collect();
                config.score(&scores)
            })
            .collect();
    }

    pub fn cluster_count(&self) -> usize {
        self.centroids.rows()
    }

    pub fn assignments(&self) -> &[u32] {
        &self.assignments
    }

    pub fn centroids(&self) -> &EmbeddingMatrix {
        &self.centroids
    }

    pub fn popularity_scores(&self) -> &[f32] {
        &self.popularity
    }

    pub fn cluster_of(&self, slot: usize) -> Option<u32> {
        self.assignments.get(slot).copied()
    }

    pub fn members(&self, cluster: u32) -> &[usize] {
        self.members.get(cluster as usize).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn popularity(&self, cluster: u32) -> Option<f32> {
        self.popularity.get(cluster as usize).copied()
    }

    /// Cluster whose centroid is closest to `vector`.
    pub fn nearest_cluster(&self, vector: &[f32]) -> Option<u32> {
        if self.cluster_count() == 0 || vector.len() != self.centroids.dim() {
            return None;
        }
        Some(nearest_centroid(vector, &self.centroids).0)
    }

    /// Assign a new trailing slot to its nearest existing cluster.
    /// Centroids are left as they are until the next full fit.
    pub fn assign(&mut self, vector: &[f32]) -> Result<u32> {
        let cluster = self.nearest_cluster(vector).ok_or(Error::InvalidDimension {
            expected: self.centroids.dim(),
            actual: vector.len(),
        })?;
        self.push_assignment(cluster)?;
        Ok(cluster)
    }

    /// Append the next slot to `cluster`.
    pub fn push_assignment(&mut self, cluster: u32) -> Result<()> {
        let Some(members) = self.members.get_mut(cluster as usize) else {
            return Err(Error::InvalidDimension {
                expected: self.centroids.rows(),
                actual: cluster as usize,
            });
        };
        members.push(self.assignments.len());
        self.assignments.push(cluster);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs() -> EmbeddingMatrix {
        // three well separated groups of four points
        let mut rows = Vec::new();
        for (cx, cy) in [(10.0f32, 0.0f32), (0.0, 10.0), (-10.0, -10.0)] {
            for (dx, dy) in [(0.1, 0.0), (-0.1, 0.0), (0.0, 0.1), (0.0, -0.1)] {
                rows.push(vec![cx + dx, cy + dy]);
            }
        }
        EmbeddingMatrix::from_rows(2, &rows).unwrap()
    }

    fn config(k: usize) -> ClusterConfig {
        ClusterConfig {
            k,
            ..ClusterConfig::default()
        }
    }

    #[test]
    fn test_effective_k() {
        assert_eq!(effective_k(20, 0), 0);
        assert_eq!(effective_k(20, 1), 1);
        assert_eq!(effective_k(20, 3), 1);
        assert_eq!(effective_k(20, 10), 5);
        assert_eq!(effective_k(3, 100), 3);
        assert_eq!(effective_k(0, 100), 1);
    }

    #[test]
    fn test_recovers_separated_groups() {
        let model = KMeans::new(config(3)).fit(&blobs());
        assert_eq!(model.cluster_count(), 3);
        for group in 0..3 {
            let first = model.cluster_of(group * 4).unwrap();
            for offset in 1..4 {
                assert_eq!(model.cluster_of(group * 4 + offset), Some(first));
            }
        }
    }

    #[test]
    fn test_fit_is_deterministic() {
        let a = KMeans::new(config(4)).fit(&blobs());
        let b = KMeans::new(config(4)).fit(&blobs());
        assert_eq!(a.assignments(), b.assignments());
        assert_eq!(a.centroids(), b.centroids());
    }

    #[test]
    fn test_partition_covers_every_slot_once() {
        let data = blobs();
        let model = KMeans::new(config(5)).fit(&data);
        let total: usize = (0..model.cluster_count() as u32).map(|c| model.members(c).len()).sum();
        assert_eq!(total, data.rows());
        for c in 0..model.cluster_count() as u32 {
            assert!(!model.members(c).is_empty(), "cluster {} empty", c);
        }
    }

    #[test]
    fn test_identical_points_still_fill_every_cluster() {
        let data = EmbeddingMatrix::from_rows(2, &vec![vec![1.0, 1.0]; 8]).unwrap();
        let model = KMeans::new(config(4)).fit(&data);
        assert_eq!(model.cluster_count(), 4);
        for c in 0..4 {
            assert!(!model.members(c).is_empty());
        }
    }

    #[test]
    fn test_empty_and_single_vector() {
        let empty = KMeans::new(config(3)).fit(&EmbeddingMatrix::new(2));
        assert_eq!(empty.cluster_count(), 0);

        let single = EmbeddingMatrix::from_rows(2, &[vec![1.0, 0.0]]).unwrap();
        let mut model = KMeans::new(config(3)).fit(&single);
        assert_eq!(model.cluster_count(), 1);
        model.compute_popularity(&[0.1], &PopularityConfig::default());
        let p = model.popularity(0).unwrap();
        assert!((0.0..=1.0).contains(&p));
    }

    #[test]
    fn test_from_parts_validation() {
        let centroids = EmbeddingMatrix::from_rows(2, &[vec![0.0, 1.0]]).unwrap();
        assert!(ClusterModel::from_parts(vec![0, 1], centroids.clone(), vec![0.5]).is_err());
        assert!(ClusterModel::from_parts(vec![0], centroids.clone(), vec![]).is_err());
        assert!(ClusterModel::from_parts(vec![0], centroids.clone(), vec![1.5]).is_err());
        let model = ClusterModel::from_parts(vec![0, 0], centroids, vec![0.5]).unwrap();
        assert_eq!(model.members(0), &[0, 1]);
    }

    #[test]
    fn test_nearest_cluster_and_push() {
        let mut model = KMeans::new(config(3)).fit(&blobs());
        let c = model.nearest_cluster(&[9.5, 0.2]).unwrap();
        assert_eq!(Some(c), model.cluster_of(0));
        model.push_assignment(c).unwrap();
        assert_eq!(model.cluster_of(12), Some(c));
        assert!(model.members(c).contains(&12));
        assert!(model.push_assignment(99).is_err());

        let assigned = model.assign(&[-9.8, -10.1]).unwrap();
        assert_eq!(Some(assigned), model.cluster_of(8));
        assert_eq!(model.assignments().len(), 14);
        assert!(model.assign(&[1.0, 2.0, 3.0]).is_err());
    }
}
