use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// A single embedding row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vector {
    data: Vec<f32>,
}

impl Vector {
    #[inline]
    #[must_use]
    pub fn new(data: Vec<f32>) -> Self {
        Self { data }
    }

    #[inline]
    #[must_use]
    pub fn dim(&self) -> usize {
        self.data.len()
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    #[must_use]
    pub fn into_inner(self) -> Vec<f32> {
        self.data
    }

    #[inline]
    pub fn dot(&self, other: &Vector) -> f32 {
        crate::simd::dot_product_simd(&self.data, &other.data)
    }

    /// Cosine similarity, 0.0 when either side has zero length or the
    /// dimensions differ.
    #[inline]
    pub fn cosine_similarity(&self, other: &Vector) -> f32 {
        if self.dim() != other.dim() {
            return 0.0;
        }
        let norm_a = crate::simd::norm_simd(&self.data);
        let norm_b = crate::simd::norm_simd(&other.data);
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        self.dot(other) / (norm_a * norm_b)
    }

    /// Scale to unit length. Zero vectors stay zero.
    #[inline]
    pub fn normalize(&mut self) {
        normalize_in_place(&mut self.data);
    }

    #[inline]
    #[must_use]
    pub fn normalized(&self) -> Self {
        let mut v = self.clone();
        v.normalize();
        v
    }
}

pub(crate) fn normalize_in_place(data: &mut [f32]) {
    let norm = crate::simd::norm_simd(data);
    if norm > f32::EPSILON {
        let inv_norm = 1.0 / norm;
        for x in data.iter_mut() {
            *x *= inv_norm;
        }
    }
}

/// Row-major matrix of embeddings sharing one dimension.
///
/// Row `i` belongs to the paper in slot `i` of whatever slot table the
/// matrix travels with; the matrix itself never stores identifiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingMatrix {
    dim: usize,
    data: Vec<f32>,
}

impl EmbeddingMatrix {
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self { dim, data: Vec::new() }
    }

    pub fn with_capacity(dim: usize, rows: usize) -> Self {
        Self {
            dim,
            data: Vec::with_capacity(dim * rows),
        }
    }

    /// Build from flat row-major storage.
    pub fn from_flat(dim: usize, data: Vec<f32>) -> Result<Self> {
        if dim == 0 && !data.is_empty() {
            return Err(Error::InvalidDimension { expected: 1, actual: 0 });
        }
        if dim > 0 && data.len() % dim != 0 {
            return Err(Error::InvalidDimension {
                expected: dim,
                actual: data.len() % dim,
            });
        }
        Ok(Self { dim, data })
    }

    pub fn from_rows(dim: usize, rows: &[Vec<f32>]) -> Result<Self> {
        let mut matrix = Self::with_capacity(dim, rows.len());
        for row in rows {
            matrix.push_row(row)?;
        }
        Ok(matrix)
    }

    #[inline]
    #[must_use]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    #[must_use]
    pub fn rows(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn row(&self, idx: usize) -> &[f32] {
        let start = idx * self.dim;
        &self.data[start..start + self.dim]
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[f32]> {
        // chunks_exact panics on zero, and a zero-dim matrix has no rows anyway
        self.data.chunks_exact(self.dim.max(1))
    }

    pub fn push_row(&mut self, row: &[f32]) -> Result<()> {
        if self.dim == 0 && self.data.is_empty() {
            self.dim = row.len();
        }
        if row.len() != self.dim {
            return Err(Error::InvalidDimension {
                expected: self.dim,
                actual: row.len(),
            });
        }
        self.data.extend_from_slice(row);
        Ok(())
    }

    /// Append every row of `other`, which must share this matrix's dimension.
    pub fn append(&mut self, other: &EmbeddingMatrix) -> Result<()> {
        if other.is_empty() {
            return Ok(());
        }
        if self.is_empty() {
            self.dim = other.dim;
        }
        if other.dim != self.dim {
            return Err(Error::InvalidDimension {
                expected: self.dim,
                actual: other.dim,
            });
        }
        self.data.extend_from_slice(&other.data);
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn as_flat(&self) -> &[f32] {
        &self.data
    }
}
