//! Full index reconstruction from catalogue records.
//!
//! The only way stale entries (deleted identities, amended embeddings) leave
//! the in-memory index. Records that do not match the configured dimension
//! are skipped and counted, never aborting the rebuild.

use crate::flat::FlatIndex;

/// Outcome of a rebuild: the fresh index plus load/skip counts.
pub struct Rebuild {
    pub index: FlatIndex,
    /// Records appended to the index.
    pub loaded: usize,
    /// Records skipped for dimension mismatch.
    pub skipped: usize,
}

/// Build a fresh index from `(identity_id, vector)` records.
///
/// The caller is responsible for atomically swapping the returned index in
/// place of the previous one.
pub fn rebuild<I>(dim: usize, records: I) -> Rebuild
where
    I: IntoIterator<Item = (i64, Vec<f32>)>,
{
    let mut index = FlatIndex::new(dim);
    let mut skipped = 0usize;

    for (identity_id, vector) in records {
        if vector.len() != dim {
            tracing::debug!(
                identity_id,
                expected = dim,
                actual = vector.len(),
                "skipping record with mismatched dimension"
            );
            skipped += 1;
            continue;
        }
        // Length was just checked; add cannot fail here.
        let _ = index.add(&vector, identity_id);
    }

    let loaded = index.len();
    Rebuild { index, loaded, skipped }
}
