//! mien-core — Face detection and embedding extraction engine.
//!
//! Uses SCRFD for face detection and ArcFace for embedding extraction, both
//! running via ONNX Runtime for CPU inference on decoded RGB frames. The
//! [`FaceExtractor`] trait is the seam consumed by the daemon; [`FacePipeline`]
//! is the ONNX-backed implementation.

pub mod alignment;
pub mod detector;
pub mod extractor;
pub mod recognizer;
pub mod types;

pub use detector::FaceDetector;
pub use extractor::{ExtractorError, FaceExtractor, FacePipeline};
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, DetectedFace, Embedding};

use std::path::PathBuf;

/// Default directory for the ONNX model files.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("mien/models")
}
