//! Flat squared-L2 index with a parallel identity mapping.
//!
//! Linear scan over all stored vectors — O(n·D) per query, which is the
//! right trade-off while the catalogue stays in the thousands. Positions are
//! assigned by insertion order and never move: there is no delete, update,
//! or compaction, so a position handed out by [`FlatIndex::search`] stays
//! valid until the whole index is replaced.

use thiserror::Error;

/// Sentinel position returned for search slots with no stored vector.
pub const NO_POSITION: i64 = -1;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IndexError {
    #[error("dimension mismatch: index is {expected}-dimensional, vector has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Result of a k-nearest-neighbor query: parallel arrays of length exactly k.
///
/// Slots beyond the number of stored vectors hold [`NO_POSITION`] and an
/// infinite distance.
#[derive(Debug, Clone)]
pub struct SearchHits {
    /// Squared Euclidean distances, ascending.
    pub distances: Vec<f32>,
    /// Insertion-order positions, parallel to `distances`.
    pub positions: Vec<i64>,
}

impl SearchHits {
    /// The single best hit, or `None` when the index held no vectors.
    pub fn nearest(&self) -> Option<(i64, f32)> {
        match self.positions.first() {
            Some(&pos) if pos != NO_POSITION => Some((pos, self.distances[0])),
            _ => None,
        }
    }
}

/// Append-only flat index over fixed-dimension embeddings.
///
/// Invariant: `vectors.len() == identities.len()` at every point observable
/// by a caller — the two are only ever appended together.
pub struct FlatIndex {
    dim: usize,
    /// Stored vectors, flattened row-major: position p occupies
    /// `[p * dim, (p + 1) * dim)`.
    vectors: Vec<f32>,
    /// Identity id stored at each position.
    identities: Vec<i64>,
}

impl FlatIndex {
    /// Create an empty index for `dim`-dimensional vectors.
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            vectors: Vec::new(),
            identities: Vec::new(),
        }
    }

    /// Append a vector and its identity id at the next position.
    ///
    /// No deduplication; the caller owns any validation beyond the
    /// dimension check.
    pub fn add(&mut self, vector: &[f32], identity_id: i64) -> Result<(), IndexError> {
        if vector.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        self.vectors.extend_from_slice(vector);
        self.identities.push(identity_id);
        Ok(())
    }

    /// Find the `k` nearest stored vectors to `query` by squared Euclidean
    /// distance.
    ///
    /// Pure in-memory computation; never blocks on I/O. With fewer than `k`
    /// stored vectors every real hit is returned and the remaining slots are
    /// sentinel-padded.
    pub fn search(&self, query: &[f32], k: usize) -> Result<SearchHits, IndexError> {
        if query.len() != self.dim {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }

        let mut scored: Vec<(f32, i64)> = self
            .vectors
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(pos, stored)| (squared_l2(query, stored), pos as i64))
            .collect();

        scored.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        let mut distances: Vec<f32> = scored.iter().map(|&(d, _)| d).collect();
        let mut positions: Vec<i64> = scored.iter().map(|&(_, p)| p).collect();
        distances.resize(k, f32::INFINITY);
        positions.resize(k, NO_POSITION);

        Ok(SearchHits { distances, positions })
    }

    /// Identity id stored at `position`, or `None` for the sentinel and
    /// out-of-range positions.
    pub fn identity_of(&self, position: i64) -> Option<i64> {
        if position < 0 {
            return None;
        }
        self.identities.get(position as usize).copied()
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Configured vector dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }
}

/// Squared Euclidean distance between two equal-length slices.
fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}
