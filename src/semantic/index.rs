//! Exact inner-product index over unit-length embeddings.
//!
//! Rows are append-only and position-stable: the i-th row corresponds to the
//! i-th comment id held by the caller. Search is a brute-force scan, which is
//! exact and fast enough at per-author scale; callers only see ranked
//! `(position, score)` hits, so a smarter structure can be swapped in behind
//! the same surface.

/// Norm below this is treated as a zero vector.
pub const ZERO_NORM_EPS: f32 = 1e-8;

/// A single ranked hit: row position plus inner-product score.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub position: usize,
    pub score: f32,
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Flat row-major storage of fixed-dimension vectors.
pub struct FlatIndex {
    dim: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dim: usize) -> Self {
        Self { dim, data: Vec::new() }
    }

    /// Rebuild an index from raw row-major data, as read from disk.
    pub fn from_raw(dim: usize, data: Vec<f32>) -> Result<Self, IndexError> {
        if dim == 0 || data.len() % dim != 0 {
            return Err(IndexError::DimensionMismatch {
                expected: dim,
                got: data.len(),
            });
        }
        Ok(Self { dim, data })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append one row.
    pub fn push(&mut self, row: &[f32]) -> Result<(), IndexError> {
        if row.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                got: row.len(),
            });
        }
        self.data.extend_from_slice(row);
        Ok(())
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dim)
    }

    /// Raw row-major data, for serialization.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Rank all rows against `query` by inner product, best first.
    ///
    /// Returns at most `min(top_k, len)` hits. The sort is stable, so rows
    /// with equal scores keep their insertion order.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<Hit>, IndexError> {
        if query.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                got: query.len(),
            });
        }

        let mut hits: Vec<Hit> = self
            .rows()
            .enumerate()
            .map(|(position, row)| Hit {
                position,
                score: dot(query, row),
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k.min(self.len()));

        Ok(hits)
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale `v` to unit length. Returns `None` when the norm is numerically zero.
pub fn normalize(mut v: Vec<f32>) -> Option<Vec<f32>> {
    let norm = l2_norm(&v);
    if norm < ZERO_NORM_EPS {
        return None;
    }
    for x in v.iter_mut() {
        *x /= norm;
    }
    Some(v)
}
