//! Index loader: catalogue → fresh index → atomic swap.

use crate::store::{Store, StoreError};
use mien_index::{rebuild, FlatIndex};
use serde::Serialize;
use tokio::sync::RwLock;

/// Counts from one rebuild pass.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RebuildOutcome {
    pub size: usize,
    pub loaded: usize,
    pub skipped: usize,
}

/// Read every embedding from the catalogue and build a fresh index.
///
/// Rows with a malformed BLOB or a mismatched dimension are skipped and
/// counted, never aborting the rebuild.
pub async fn rebuild_index(
    store: &Store,
    dim: usize,
) -> Result<(FlatIndex, RebuildOutcome), StoreError> {
    let (rows, corrupt) = store.all_embeddings().await?;
    if corrupt > 0 {
        tracing::warn!(corrupt, "skipped unreadable embedding rows during rebuild");
    }

    let rebuilt = rebuild(dim, rows);
    let outcome = RebuildOutcome {
        size: rebuilt.index.len(),
        loaded: rebuilt.loaded,
        skipped: rebuilt.skipped + corrupt,
    };
    Ok((rebuilt.index, outcome))
}

/// Rebuild from the catalogue and swap the shared index.
///
/// The fresh index is fully built before the write lock is taken, so
/// concurrent searches complete against either the old snapshot or the
/// new one, never a mix.
pub async fn rebuild_and_swap(
    store: &Store,
    shared: &RwLock<FlatIndex>,
    dim: usize,
) -> Result<RebuildOutcome, StoreError> {
    let (fresh, outcome) = rebuild_index(store, dim).await?;
    *shared.write().await = fresh;
    tracing::info!(
        size = outcome.size,
        loaded = outcome.loaded,
        skipped = outcome.skipped,
        "index rebuilt from catalogue"
    );
    Ok(outcome)
}
