//! Dedicated inference thread.
//!
//! ONNX inference is CPU-bound and must not run on the async runtime's
//! workers. One OS thread owns the models; sessions and enrollment talk
//! to it through a channel and suspend while waiting for the reply.

use image::RgbImage;
use mien_core::{DetectedFace, ExtractorError, FaceExtractor};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("extraction failed: {0}")]
    Extractor(#[from] ExtractorError),
    #[error("extractor thread exited")]
    ChannelClosed,
}

struct ExtractRequest {
    frame: RgbImage,
    reply: oneshot::Sender<Result<Vec<DetectedFace>, ExtractorError>>,
}

/// Clone-safe handle to the inference thread.
#[derive(Clone)]
pub struct ExtractorHandle {
    tx: mpsc::Sender<ExtractRequest>,
    dim: usize,
}

impl ExtractorHandle {
    /// Extract every face in the frame, in detector order.
    pub async fn extract_faces(&self, frame: RgbImage) -> Result<Vec<DetectedFace>, ExtractError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ExtractRequest {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ExtractError::ChannelClosed)?;
        let faces = reply_rx.await.map_err(|_| ExtractError::ChannelClosed)??;
        Ok(faces)
    }

    pub fn embedding_dim(&self) -> usize {
        self.dim
    }
}

/// Spawn the extractor on a dedicated OS thread.
///
/// The thread owns the extractor and serves requests until every handle
/// is dropped.
pub fn spawn_extractor<E>(mut extractor: E) -> ExtractorHandle
where
    E: FaceExtractor + 'static,
{
    let dim = extractor.embedding_dim();
    let (tx, mut rx) = mpsc::channel::<ExtractRequest>(4);

    std::thread::Builder::new()
        .name("mien-extractor".into())
        .spawn(move || {
            tracing::info!("extractor thread started");
            while let Some(req) = rx.blocking_recv() {
                let result = extractor.extract_faces(&req.frame);
                let _ = req.reply.send(result);
            }
            tracing::info!("extractor thread exiting");
        })
        .expect("failed to spawn extractor thread");

    ExtractorHandle { tx, dim }
}
