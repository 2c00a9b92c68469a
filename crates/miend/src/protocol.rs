//! Wire types for the HTTP and WebSocket surfaces.

use mien_core::BoundingBox;
use serde::{Deserialize, Serialize};

/// Face rectangle in original-frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl From<&BoundingBox> for FaceBox {
    fn from(b: &BoundingBox) -> Self {
        Self {
            x: b.x,
            y: b.y,
            width: b.width,
            height: b.height,
        }
    }
}

/// One recognition entry for one detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceReport {
    #[serde(rename = "box")]
    pub bounding_box: FaceBox,
    /// Matched identity, null for an unknown face.
    pub identity_id: Option<i64>,
    /// `exp(−d)` against the nearest neighbor; null when none existed.
    pub score: Option<f32>,
}

/// Server→client session messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SessionMessage {
    /// Handshake, sent once before any frame is processed.
    #[serde(rename = "ready")]
    Ready { index_size: usize },
    /// One reply per processed frame, faces in detection order.
    #[serde(rename = "result")]
    Frame { faces: Vec<FaceReport> },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub identity_id: i64,
    pub name: String,
    pub contact: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: i64,
    /// Index entries for the deleted identity keep matching until the next
    /// rebuild.
    pub stale_until_rebuild: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub embedding_dim: usize,
    pub index_size: usize,
    pub identities: i64,
    pub embeddings: i64,
    pub match_threshold: f32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
