//! Nearest-neighbor indexes over normalized embeddings.
//!
//! Similarity is the inner product, which equals cosine similarity on
//! L2-normalized rows. Every index keeps an explicit slot table
//! (`slot -> paper id`) built from the id list it was given, so a result
//! can never be attributed by iteration order of some other map.

use crate::config::{IndexConfig, IndexKind};
use crate::hnsw::HnswIndex;
use crate::vector::EmbeddingMatrix;
use crate::{Error, Result};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::warn;

/// Exact scoring switches to rayon above this many rows.
const PARALLEL_SCAN_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub slot: usize,
    pub paper_id: String,
    pub similarity: f32,
}

/// Query side of a vector index.
pub trait NearestNeighbors {
    /// Up to `k` neighbors, similarity descending, ties by ascending paper id.
    fn search(&self, query: &[f32], k: usize) -> Vec<Neighbor>;

    fn size(&self) -> usize;

    fn dimension(&self) -> usize;
}

/// Descending score, then ascending id.
#[inline]
pub fn by_score_then_id(a_score: f32, a_id: &str, b_score: f32, b_id: &str) -> Ordering {
    OrderedFloat(b_score)
        .cmp(&OrderedFloat(a_score))
        .then_with(|| a_id.cmp(b_id))
}

/// Sort `(slot, score)` candidates and keep the best `k`.
pub(crate) fn top_k(mut scored: Vec<(usize, f32)>, ids: &[String], k: usize) -> Vec<Neighbor> {
    let k = k.min(scored.len());
    if k == 0 {
        return Vec::new();
    }
    let cmp = |a: &(usize, f32), b: &(usize, f32)| by_score_then_id(a.1, &ids[a.0], b.1, &ids[b.0]);
    if k < scored.len() {
        scored.select_nth_unstable_by(k - 1, cmp);
        scored.truncate(k);
    }
    scored.sort_unstable_by(cmp);
    scored
        .into_iter()
        .map(|(slot, similarity)| Neighbor {
            slot,
            paper_id: ids[slot].clone(),
            similarity,
        })
        .collect()
}

/// Brute-force inner-product index. Recall is always 100%.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FlatIndex {
    ids: Vec<String>,
    vectors: EmbeddingMatrix,
}

impl FlatIndex {
    pub fn build(ids: Vec<String>, vectors: EmbeddingMatrix) -> Result<Self> {
        if ids.len() != vectors.rows() {
            return Err(Error::InvalidDimension {
                expected: ids.len(),
                actual: vectors.rows(),
            });
        }
        Ok(Self { ids, vectors })
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }
}

impl NearestNeighbors for FlatIndex {
    fn search(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        if self.ids.is_empty() || k == 0 {
            return Vec::new();
        }
        if query.len() != self.vectors.dim() {
            warn!(
                "Query dimension {} does not match index dimension {}",
                query.len(),
                self.vectors.dim()
            );
            return Vec::new();
        }

        let score = |slot: usize| (slot, crate::simd::dot_product_simd(query, self.vectors.row(slot)));
        let scored: Vec<(usize, f32)> = if self.ids.len() >= PARALLEL_SCAN_THRESHOLD {
            (0..self.ids.len()).into_par_iter().map(score).collect()
        } else {
            (0..self.ids.len()).map(score).collect()
        };
        top_k(scored, &self.ids, k)
    }

    fn size(&self) -> usize {
        self.ids.len()
    }

    fn dimension(&self) -> usize {
        self.vectors.dim()
    }
}

/// The index variant selected by [`IndexConfig::kind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VectorIndex {
    Flat(FlatIndex),
    Hnsw(HnswIndex),
}

impl Default for VectorIndex {
    fn default() -> Self {
        VectorIndex::Flat(FlatIndex::default())
    }
}

impl VectorIndex {
    /// Build a complete new index; nothing existing is touched on failure.
    pub fn build(config: &IndexConfig, ids: Vec<String>, vectors: &EmbeddingMatrix) -> Result<Self> {
        match config.kind {
            IndexKind::Flat => Ok(VectorIndex::Flat(FlatIndex::build(ids, vectors.clone())?)),
            IndexKind::Hnsw => Ok(VectorIndex::Hnsw(HnswIndex::build(
                &config.hnsw,
                config.seed,
                ids,
                vectors,
            )?)),
        }
    }

    /// Replace `self` with a freshly built index, only if the build succeeds.
    pub fn rebuild(&mut self, config: &IndexConfig, ids: Vec<String>, vectors: &EmbeddingMatrix) -> Result<()> {
        *self = Self::build(config, ids, vectors)?;
        Ok(())
    }

    pub fn kind(&self) -> IndexKind {
        match self {
            VectorIndex::Flat(_) => IndexKind::Flat,
            VectorIndex::Hnsw(_) => IndexKind::Hnsw,
        }
    }

    /// Slot table: `ids()[slot]` is the paper stored in `slot`.
    pub fn ids(&self) -> &[String] {
        match self {
            VectorIndex::Flat(index) => index.ids(),
            VectorIndex::Hnsw(index) => index.ids(),
        }
    }
}

impl NearestNeighbors for VectorIndex {
    fn search(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        match self {
            VectorIndex::Flat(index) => index.search(query, k),
            VectorIndex::Hnsw(index) => index.search(query, k),
        }
    }

    fn size(&self) -> usize {
        match self {
            VectorIndex::Flat(index) => index.size(),
            VectorIndex::Hnsw(index) => index.size(),
        }
    }

    fn dimension(&self) -> usize {
        match self {
            VectorIndex::Flat(index) => index.dimension(),
            VectorIndex::Hnsw(index) => index.dimension(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_rows() -> (Vec<String>, EmbeddingMatrix) {
        let ids = vec!["c".to_string(), "a".to_string(), "b".to_string()];
        let matrix = EmbeddingMatrix::from_rows(
            2,
            &[vec![1.0, 0.0], vec![0.0, 1.0], vec![0.6, 0.8]],
        )
        .unwrap();
        (ids, matrix)
    }

    #[test]
    fn test_flat_self_match_is_top() {
        let (ids, matrix) = unit_rows();
        let index = FlatIndex::build(ids.clone(), matrix.clone()).unwrap();
        for (slot, id) in ids.iter().enumerate() {
            let hits = index.search(matrix.row(slot), 1);
            assert_eq!(&hits[0].paper_id, id);
            assert!((hits[0].similarity - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_k_is_clamped_and_empty_index_is_empty() {
        let (ids, matrix) = unit_rows();
        let index = FlatIndex::build(ids, matrix).unwrap();
        assert_eq!(index.search(&[1.0, 0.0], 10).len(), 3);
        assert!(index.search(&[1.0, 0.0], 0).is_empty());

        let empty = FlatIndex::default();
        assert!(empty.search(&[1.0, 0.0], 5).is_empty());
    }

    #[test]
    fn test_ties_break_by_ascending_id() {
        let ids = vec!["z".to_string(), "m".to_string(), "a".to_string()];
        let matrix = EmbeddingMatrix::from_rows(2, &[vec![1.0, 0.0], vec![1.0, 0.0], vec![1.0, 0.0]]).unwrap();
        let index = FlatIndex::build(ids, matrix).unwrap();
        let order: Vec<_> = index.search(&[1.0, 0.0], 3).into_iter().map(|n| n.paper_id).collect();
        assert_eq!(order, vec!["a", "m", "z"]);
    }

    #[test]
    fn test_build_rejects_mismatched_slot_table() {
        let (_, matrix) = unit_rows();
        assert!(FlatIndex::build(vec!["only".into()], matrix).is_err());
    }

    #[test]
    fn test_rebuild_keeps_old_index_on_failure() {
        let (ids, matrix) = unit_rows();
        let config = IndexConfig::default();
        let mut index = VectorIndex::build(&config, ids, &matrix).unwrap();
        assert!(index.rebuild(&config, vec!["x".into()], &matrix).is_err());
        assert_eq!(index.size(), 3);
        assert_eq!(index.ids(), &["c", "a", "b"]);
    }
}
