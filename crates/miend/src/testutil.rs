//! Shared test fixtures: a scriptable extractor and state builders.

use crate::state::AppState;
use image::RgbImage;
use mien_core::detector::DetectorError;
use mien_core::{BoundingBox, DetectedFace, Embedding, ExtractorError, FaceExtractor};
use mien_index::FlatIndex;
use std::collections::VecDeque;
use std::sync::Arc;
use tempfile::TempDir;

/// A detected face at horizontal position `x` carrying the given embedding.
pub fn face_with_embedding(x: f32, values: Vec<f32>) -> DetectedFace {
    DetectedFace {
        bounding_box: BoundingBox {
            x,
            y: 0.0,
            width: 32.0,
            height: 32.0,
            confidence: 0.9,
            landmarks: None,
        },
        embedding: Embedding {
            values,
            model_version: Some("stub".to_string()),
        },
    }
}

pub fn extraction_failure() -> ExtractorError {
    ExtractorError::Detector(DetectorError::InferenceFailed("scripted failure".into()))
}

/// Extractor double that replays scripted replies.
pub struct StubExtractor {
    dim: usize,
    script: VecDeque<Result<Vec<DetectedFace>, ExtractorError>>,
    repeat: Option<Vec<DetectedFace>>,
    always_fail: bool,
}

impl StubExtractor {
    /// Replies with the same faces for every frame.
    pub fn always(dim: usize, faces: Vec<DetectedFace>) -> Self {
        Self {
            dim,
            script: VecDeque::new(),
            repeat: Some(faces),
            always_fail: false,
        }
    }

    /// Replies per the script, in order; panics if a frame arrives after
    /// the script is exhausted.
    pub fn scripted(dim: usize, script: Vec<Result<Vec<DetectedFace>, ExtractorError>>) -> Self {
        Self {
            dim,
            script: script.into(),
            repeat: None,
            always_fail: false,
        }
    }

    /// Fails every frame with a detector-internal error.
    pub fn failing(dim: usize) -> Self {
        Self {
            dim,
            script: VecDeque::new(),
            repeat: None,
            always_fail: true,
        }
    }
}

impl FaceExtractor for StubExtractor {
    fn extract_faces(&mut self, _frame: &RgbImage) -> Result<Vec<DetectedFace>, ExtractorError> {
        if self.always_fail {
            return Err(extraction_failure());
        }
        if let Some(reply) = self.script.pop_front() {
            return reply;
        }
        match &self.repeat {
            Some(faces) => Ok(faces.clone()),
            None => panic!("stub extractor script exhausted"),
        }
    }

    fn embedding_dim(&self) -> usize {
        self.dim
    }
}

/// PNG-encoded 8×8 gray frame, decodable by the enrollment and session paths.
pub fn png_frame() -> Vec<u8> {
    let img = RgbImage::from_pixel(8, 8, image::Rgb([64, 64, 64]));
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

/// Fresh state over a temp catalogue, an empty index, and the given stub.
pub async fn state_with(
    dim: usize,
    threshold: f32,
    extractor: StubExtractor,
) -> (TempDir, Arc<AppState>) {
    let tmp = TempDir::new().unwrap();
    let store = crate::store::Store::open(&tmp.path().join("catalogue.db"), dim)
        .await
        .unwrap();
    let handle = crate::extractor::spawn_extractor(extractor);
    let state = AppState::new(FlatIndex::new(dim), store, handle, threshold, dim, None);
    (tmp, state)
}
