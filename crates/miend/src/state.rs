use crate::extractor::ExtractorHandle;
use crate::store::Store;
use mien_index::FlatIndex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared application state.
///
/// The index is the only cross-session mutable state. Sessions take the
/// read side; enrollment appends and rebuild swaps take the write side,
/// so a search in progress always sees one consistent snapshot.
pub struct AppState {
    pub index: RwLock<FlatIndex>,
    pub store: Store,
    pub extractor: ExtractorHandle,
    pub match_threshold: f32,
    pub embedding_dim: usize,
    pub upload_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(
        index: FlatIndex,
        store: Store,
        extractor: ExtractorHandle,
        match_threshold: f32,
        embedding_dim: usize,
        upload_dir: Option<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            index: RwLock::new(index),
            store,
            extractor,
            match_threshold,
            embedding_dim,
            upload_dir,
        })
    }
}
