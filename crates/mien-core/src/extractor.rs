//! Full-frame face extraction: detect every face, embed each one.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::DetectedFace;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Turns a decoded frame into per-face embeddings.
///
/// Implementations run real models; callers that only need the contract
/// (session handling, enrollment) depend on the trait.
pub trait FaceExtractor: Send {
    /// Detect every face in the frame and extract one embedding per face.
    ///
    /// Faces are returned in detector order (highest confidence first).
    fn extract_faces(&mut self, frame: &RgbImage) -> Result<Vec<DetectedFace>, ExtractorError>;

    /// Dimensionality of embeddings this extractor produces.
    fn embedding_dim(&self) -> usize;
}

/// SCRFD + ArcFace pipeline over ONNX Runtime.
pub struct FacePipeline {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl FacePipeline {
    /// Load both models from a directory containing `det_10g.onnx` and
    /// `w600k_r50.onnx`.
    pub fn load(model_dir: &Path) -> Result<Self, ExtractorError> {
        let scrfd = model_dir.join("det_10g.onnx");
        let arcface = model_dir.join("w600k_r50.onnx");

        let detector = FaceDetector::load(&scrfd.to_string_lossy())?;
        let recognizer = FaceRecognizer::load(&arcface.to_string_lossy())?;

        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceExtractor for FacePipeline {
    fn extract_faces(&mut self, frame: &RgbImage) -> Result<Vec<DetectedFace>, ExtractorError> {
        let faces = self.detector.detect(frame)?;

        let mut out = Vec::with_capacity(faces.len());
        for face in faces {
            // SCRFD always emits landmarks; a detection without them cannot
            // be aligned, so it is dropped rather than failing the frame.
            if face.landmarks.is_none() {
                tracing::warn!(
                    confidence = face.confidence,
                    "face without landmarks, skipping"
                );
                continue;
            }
            let embedding = self.recognizer.extract(frame, &face)?;
            out.push(DetectedFace {
                bounding_box: face,
                embedding,
            });
        }

        Ok(out)
    }

    fn embedding_dim(&self) -> usize {
        self.recognizer.embedding_dim()
    }
}
