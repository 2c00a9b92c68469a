//! Enrollment pipeline: image → embedding → catalogue → index, in that order.

use crate::extractor::ExtractError;
use crate::state::AppState;
use crate::store::{Identity, StoreError};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("image could not be decoded")]
    InvalidImage,
    #[error("no face detected in image")]
    NoFaceDetected,
    #[error("identity name or contact already enrolled")]
    DuplicateIdentity,
    #[error("embedding has dimension {actual}, catalogue expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("extraction unavailable: {0}")]
    Extraction(String),
    #[error("storage failure: {0}")]
    Storage(#[source] StoreError),
}

impl From<StoreError> for EnrollError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateIdentity => EnrollError::DuplicateIdentity,
            StoreError::DimensionMismatch { expected, actual } => {
                EnrollError::DimensionMismatch { expected, actual }
            }
            other => EnrollError::Storage(other),
        }
    }
}

/// Enroll one identity from one image.
///
/// The catalogue write is transactional and happens before the index
/// append; a failed append leaves the record durable but unsearchable
/// until the next rebuild, which is logged and deliberately not surfaced.
pub async fn enroll(
    state: &AppState,
    name: &str,
    contact: &str,
    image_bytes: &[u8],
) -> Result<Identity, EnrollError> {
    let frame = image::load_from_memory(image_bytes)
        .map_err(|_| EnrollError::InvalidImage)?
        .to_rgb8();

    let faces = state
        .extractor
        .extract_faces(frame)
        .await
        .map_err(|e| match e {
            ExtractError::ChannelClosed => EnrollError::Extraction("extractor thread exited".into()),
            ExtractError::Extractor(inner) => EnrollError::Extraction(inner.to_string()),
        })?;

    let Some(face) = faces.first() else {
        return Err(EnrollError::NoFaceDetected);
    };
    if faces.len() > 1 {
        tracing::debug!(
            count = faces.len(),
            "multiple faces in enrollment image, using the first"
        );
    }

    let embedding = &face.embedding;
    if embedding.dim() != state.embedding_dim {
        return Err(EnrollError::DimensionMismatch {
            expected: state.embedding_dim,
            actual: embedding.dim(),
        });
    }

    let image_ref = retain_image(state.upload_dir.as_deref(), image_bytes).await;

    let identity = state
        .store
        .create_identity_with_embedding(
            name,
            contact,
            &embedding.values,
            embedding.model_version.as_deref(),
            image_ref.as_deref(),
        )
        .await?;

    // The durable write has succeeded; an append failure here only delays
    // searchability until the next rebuild.
    if let Err(err) = state.index.write().await.add(&embedding.values, identity.id) {
        tracing::warn!(
            identity_id = identity.id,
            error = %err,
            "embedding persisted but index append failed; rebuild to make it searchable"
        );
    }

    tracing::info!(identity_id = identity.id, name, "identity enrolled");
    Ok(identity)
}

/// Best-effort retention of the source image. Failure to write the file
/// downgrades to an un-referenced enrollment, never an error.
async fn retain_image(upload_dir: Option<&Path>, image_bytes: &[u8]) -> Option<String> {
    let dir = upload_dir?;
    let ext = image::guess_format(image_bytes)
        .ok()
        .and_then(|f| f.extensions_str().first().copied())
        .unwrap_or("img");
    let path = dir.join(format!("{}.{ext}", uuid::Uuid::new_v4()));

    match tokio::fs::write(&path, image_bytes).await {
        Ok(()) => Some(path.to_string_lossy().into_owned()),
        Err(err) => {
            tracing::warn!(
                error = %err,
                path = %path.display(),
                "could not retain enrollment image"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::spawn_extractor;
    use crate::state::AppState;
    use crate::store::Store;
    use crate::testutil::{face_with_embedding, png_frame, state_with, StubExtractor};
    use mien_index::FlatIndex;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_enroll_success_grows_catalogue_then_index() {
        let stub = StubExtractor::always(4, vec![face_with_embedding(0.0, vec![1.0, 0.0, 0.0, 0.0])]);
        let (_tmp, state) = state_with(4, 1.0, stub).await;

        let identity = enroll(&state, "ada", "ada@example.com", &png_frame())
            .await
            .unwrap();

        assert_eq!(identity.name, "ada");
        assert_eq!(state.store.count_identities().await.unwrap(), 1);
        assert_eq!(state.store.count_embeddings().await.unwrap(), 1);

        let index = state.index.read().await;
        assert_eq!(index.len(), 1);
        let hits = index.search(&[1.0, 0.0, 0.0, 0.0], 1).unwrap();
        let (pos, _) = hits.nearest().unwrap();
        assert_eq!(index.identity_of(pos), Some(identity.id));
    }

    #[tokio::test]
    async fn test_no_face_leaves_state_unchanged() {
        let stub = StubExtractor::always(4, vec![]);
        let (_tmp, state) = state_with(4, 1.0, stub).await;

        let err = enroll(&state, "ada", "ada@example.com", &png_frame())
            .await
            .unwrap_err();
        assert!(matches!(err, EnrollError::NoFaceDetected));

        assert_eq!(state.store.count_identities().await.unwrap(), 0);
        assert_eq!(state.store.count_embeddings().await.unwrap(), 0);
        assert_eq!(state.index.read().await.len(), 0);
    }

    #[tokio::test]
    async fn test_invalid_image_rejected_before_extraction() {
        // An exhausted script panics if consulted; decode must fail first.
        let stub = StubExtractor::scripted(4, vec![]);
        let (_tmp, state) = state_with(4, 1.0, stub).await;

        let err = enroll(&state, "ada", "ada@example.com", b"definitely not an image")
            .await
            .unwrap_err();
        assert!(matches!(err, EnrollError::InvalidImage));
        assert_eq!(state.store.count_identities().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let stub = StubExtractor::always(4, vec![face_with_embedding(0.0, vec![1.0, 0.0, 0.0, 0.0])]);
        let (_tmp, state) = state_with(4, 1.0, stub).await;

        enroll(&state, "ada", "ada@example.com", &png_frame())
            .await
            .unwrap();
        let err = enroll(&state, "ada", "other@example.com", &png_frame())
            .await
            .unwrap_err();
        assert!(matches!(err, EnrollError::DuplicateIdentity));

        assert_eq!(state.store.count_identities().await.unwrap(), 1);
        assert_eq!(state.index.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_multi_face_uses_first() {
        let stub = StubExtractor::always(
            4,
            vec![
                face_with_embedding(10.0, vec![1.0, 0.0, 0.0, 0.0]),
                face_with_embedding(200.0, vec![0.0, 1.0, 0.0, 0.0]),
            ],
        );
        let (_tmp, state) = state_with(4, 1.0, stub).await;

        enroll(&state, "ada", "ada@example.com", &png_frame())
            .await
            .unwrap();

        let (rows, _) = state.store.all_embeddings().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, vec![1.0, 0.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_index_append_failure_is_swallowed() {
        // Index configured narrower than the catalogue: the append fails
        // after the durable write, which must still count as success.
        let tmp = TempDir::new().unwrap();
        let store = Store::open(&tmp.path().join("catalogue.db"), 4).await.unwrap();
        let handle = spawn_extractor(StubExtractor::always(
            4,
            vec![face_with_embedding(0.0, vec![1.0, 0.0, 0.0, 0.0])],
        ));
        let state = AppState::new(FlatIndex::new(3), store, handle, 1.0, 4, None);

        let identity = enroll(&state, "ada", "ada@example.com", &png_frame())
            .await
            .unwrap();

        assert!(identity.id > 0);
        assert_eq!(state.store.count_embeddings().await.unwrap(), 1);
        assert_eq!(state.index.read().await.len(), 0);
    }

    #[tokio::test]
    async fn test_image_retention_when_configured() {
        let tmp = TempDir::new().unwrap();
        let uploads = tmp.path().join("uploads");
        std::fs::create_dir_all(&uploads).unwrap();

        let store = Store::open(&tmp.path().join("catalogue.db"), 4).await.unwrap();
        let handle = spawn_extractor(StubExtractor::always(
            4,
            vec![face_with_embedding(0.0, vec![1.0, 0.0, 0.0, 0.0])],
        ));
        let state = AppState::new(
            FlatIndex::new(4),
            store,
            handle,
            1.0,
            4,
            Some(uploads.clone()),
        );

        enroll(&state, "ada", "ada@example.com", &png_frame())
            .await
            .unwrap();

        let retained: Vec<_> = std::fs::read_dir(&uploads).unwrap().collect();
        assert_eq!(retained.len(), 1);
        let name = retained[0].as_ref().unwrap().file_name();
        assert!(name.to_string_lossy().ends_with(".png"));
    }
}
