//! Recognition session: one streaming connection, frames in, results out.
//!
//! Each connection runs one session on its own task. Frames are processed
//! strictly in arrival order; a slow peer simply waits on its own replies
//! and never stalls other sessions. The session is generic over the
//! message stream and sink so tests drive it with in-memory channels.

use crate::extractor::ExtractError;
use crate::protocol::{FaceBox, FaceReport, SessionMessage};
use crate::state::AppState;
use axum::extract::ws::Message;
use base64::Engine as _;
use futures::{Sink, SinkExt, Stream, StreamExt};
use mien_core::DetectedFace;
use mien_index::FlatIndex;
use std::sync::Arc;

/// Connection lifecycle. `Processing` carries the payload being worked on;
/// the machine never leaves `Closed`.
enum SessionState {
    AwaitingFrame,
    Processing(FramePayload),
    Closed,
}

enum FramePayload {
    /// Base64 text, optionally prefixed with a `data:…;base64,` header.
    Text(String),
    /// A raw encoded image.
    Binary(Vec<u8>),
}

enum FrameOutcome {
    Reply(SessionMessage),
    /// Transient per-frame failure; the session stays open.
    Skip(&'static str),
    /// The session cannot continue.
    Fatal(String),
}

/// Counters reported when a session ends.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionSummary {
    pub frames: usize,
    pub skipped: usize,
}

/// Drive one connection to completion.
///
/// Sends the `ready` handshake, then loops: await frame, process, reply.
/// Undecodable frames and extraction-internal errors are skipped; transport
/// failures close the session. The final close is graceful and tolerates a
/// peer that is already gone.
pub async fn run_session<In, Out>(
    state: Arc<AppState>,
    mut incoming: In,
    mut outgoing: Out,
) -> SessionSummary
where
    In: Stream<Item = Result<Message, axum::Error>> + Unpin,
    Out: Sink<Message> + Unpin,
    Out::Error: std::fmt::Display,
{
    let mut summary = SessionSummary::default();

    // Handshake first: clients block on it before streaming.
    let index_size = state.index.read().await.len();
    let ready = SessionMessage::Ready { index_size };
    let mut machine = match send_message(&mut outgoing, &ready).await {
        Ok(()) => {
            tracing::info!(index_size, "session opened");
            SessionState::AwaitingFrame
        }
        Err(err) => {
            tracing::debug!(error = %err, "peer gone before handshake");
            SessionState::Closed
        }
    };

    loop {
        machine = match machine {
            SessionState::AwaitingFrame => match incoming.next().await {
                None => SessionState::Closed,
                Some(Err(err)) => {
                    tracing::debug!(error = %err, "transport error, closing session");
                    SessionState::Closed
                }
                Some(Ok(Message::Close(_))) => SessionState::Closed,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => SessionState::AwaitingFrame,
                Some(Ok(Message::Text(text))) => {
                    SessionState::Processing(FramePayload::Text(text.to_string()))
                }
                Some(Ok(Message::Binary(bytes))) => {
                    SessionState::Processing(FramePayload::Binary(bytes.to_vec()))
                }
            },
            SessionState::Processing(payload) => match process_frame(&state, payload).await {
                FrameOutcome::Reply(msg) => {
                    summary.frames += 1;
                    match send_message(&mut outgoing, &msg).await {
                        Ok(()) => SessionState::AwaitingFrame,
                        Err(err) => {
                            tracing::debug!(error = %err, "send failed, closing session");
                            SessionState::Closed
                        }
                    }
                }
                FrameOutcome::Skip(reason) => {
                    summary.skipped += 1;
                    tracing::debug!(reason, "frame skipped");
                    SessionState::AwaitingFrame
                }
                FrameOutcome::Fatal(reason) => {
                    tracing::warn!(reason, "closing session");
                    SessionState::Closed
                }
            },
            SessionState::Closed => break,
        };
    }

    // The peer may already have closed; double-close errors are expected
    // and suppressed.
    let _ = outgoing.send(Message::Close(None)).await;
    let _ = outgoing.close().await;

    tracing::info!(
        frames = summary.frames,
        skipped = summary.skipped,
        "session closed"
    );
    summary
}

/// Decode, extract, and match one frame.
async fn process_frame(state: &AppState, payload: FramePayload) -> FrameOutcome {
    let encoded = match payload {
        FramePayload::Text(text) => {
            let trimmed = strip_data_url_header(text.trim());
            match base64::engine::general_purpose::STANDARD.decode(trimmed) {
                Ok(bytes) => bytes,
                Err(_) => return FrameOutcome::Skip("invalid base64 payload"),
            }
        }
        FramePayload::Binary(bytes) => bytes,
    };

    let frame = match image::load_from_memory(&encoded) {
        Ok(img) => img.to_rgb8(),
        Err(_) => return FrameOutcome::Skip("undecodable frame"),
    };

    let faces = match state.extractor.extract_faces(frame).await {
        Ok(faces) => faces,
        Err(ExtractError::Extractor(err)) => {
            tracing::debug!(error = %err, "extraction failed for frame");
            return FrameOutcome::Skip("extraction failed");
        }
        Err(ExtractError::ChannelClosed) => {
            return FrameOutcome::Fatal("extractor thread exited".into());
        }
    };

    // One consistent index snapshot for the whole frame.
    let index = state.index.read().await;
    let reports = faces
        .iter()
        .map(|face| match_face(&index, state.match_threshold, face))
        .collect();

    FrameOutcome::Reply(SessionMessage::Frame { faces: reports })
}

/// Match one face against the index.
///
/// `score = exp(−d)` is reported whenever a nearest neighbor existed, even
/// above the threshold; only the identity is withheld then. An empty index
/// or sentinel position yields null for both.
fn match_face(index: &FlatIndex, threshold: f32, face: &DetectedFace) -> FaceReport {
    let bounding_box = FaceBox::from(&face.bounding_box);

    if index.is_empty() {
        return FaceReport {
            bounding_box,
            identity_id: None,
            score: None,
        };
    }

    let nearest = match index.search(&face.embedding.values, 1) {
        Ok(hits) => hits.nearest(),
        Err(err) => {
            tracing::warn!(error = %err, "index query failed for face");
            None
        }
    };

    match nearest {
        Some((position, distance)) => {
            let identity_id = if distance < threshold {
                index.identity_of(position)
            } else {
                None
            };
            FaceReport {
                bounding_box,
                identity_id,
                score: Some((-distance).exp()),
            }
        }
        None => FaceReport {
            bounding_box,
            identity_id: None,
            score: None,
        },
    }
}

fn strip_data_url_header(payload: &str) -> &str {
    if payload.starts_with("data:") {
        match payload.split_once(',') {
            Some((_, rest)) => rest,
            None => payload,
        }
    } else {
        payload
    }
}

async fn send_message<Out>(outgoing: &mut Out, message: &SessionMessage) -> Result<(), String>
where
    Out: Sink<Message> + Unpin,
    Out::Error: std::fmt::Display,
{
    let json = serde_json::to_string(message).map_err(|e| e.to_string())?;
    outgoing
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        extraction_failure, face_with_embedding, png_frame, state_with, StubExtractor,
    };
    use base64::engine::general_purpose::STANDARD;
    use futures::channel::mpsc;

    async fn drive(
        state: Arc<AppState>,
        inbound: Vec<Result<Message, axum::Error>>,
    ) -> (Vec<Message>, SessionSummary) {
        let (in_tx, in_rx) = mpsc::unbounded();
        let (out_tx, mut out_rx) = mpsc::unbounded::<Message>();
        for msg in inbound {
            in_tx.unbounded_send(msg).unwrap();
        }
        drop(in_tx);

        let summary = run_session(state, in_rx, out_tx).await;

        let mut outputs = Vec::new();
        while let Ok(Some(msg)) = out_rx.try_next() {
            outputs.push(msg);
        }
        (outputs, summary)
    }

    fn replies(messages: &[Message]) -> Vec<SessionMessage> {
        messages
            .iter()
            .filter_map(|m| match m {
                Message::Text(text) => serde_json::from_str(text.as_str()).ok(),
                _ => None,
            })
            .collect()
    }

    fn binary_frame() -> Message {
        Message::Binary(png_frame().into())
    }

    #[tokio::test]
    async fn test_handshake_is_first_message() {
        let stub = StubExtractor::always(4, vec![]);
        let (_tmp, state) = state_with(4, 1.0, stub).await;
        state
            .index
            .write()
            .await
            .add(&[1.0, 0.0, 0.0, 0.0], 1)
            .unwrap();

        let (outputs, summary) = drive(state, vec![]).await;

        let msgs = replies(&outputs);
        assert_eq!(msgs[0], SessionMessage::Ready { index_size: 1 });
        assert_eq!(summary.frames, 0);
        assert!(matches!(outputs.last(), Some(Message::Close(_))));
    }

    #[tokio::test]
    async fn test_two_faces_reported_in_detection_order() {
        let stub = StubExtractor::always(
            4,
            vec![
                face_with_embedding(10.0, vec![1.0, 0.0, 0.0, 0.0]),
                face_with_embedding(200.0, vec![0.0, 1.0, 0.0, 0.0]),
            ],
        );
        let (_tmp, state) = state_with(4, 1.0, stub).await;
        state
            .index
            .write()
            .await
            .add(&[1.0, 0.0, 0.0, 0.0], 7)
            .unwrap();

        let (outputs, summary) = drive(state, vec![Ok(binary_frame())]).await;

        let msgs = replies(&outputs);
        assert_eq!(summary.frames, 1);
        let SessionMessage::Frame { faces } = &msgs[1] else {
            panic!("expected a result message, got {:?}", msgs[1]);
        };
        assert_eq!(faces.len(), 2);

        // Detection order preserved, never sorted by score
        assert_eq!(faces[0].bounding_box.x, 10.0);
        assert_eq!(faces[1].bounding_box.x, 200.0);

        // First face: exact match, d = 0
        assert_eq!(faces[0].identity_id, Some(7));
        assert!((faces[0].score.unwrap() - 1.0).abs() < 1e-6);

        // Second face: d = 2 ≥ threshold, neighbor exists so score present
        assert_eq!(faces[1].identity_id, None);
        assert!((faces[1].score.unwrap() - (-2.0f32).exp()).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_bad_base64_skipped_session_survives() {
        let stub =
            StubExtractor::always(4, vec![face_with_embedding(0.0, vec![1.0, 0.0, 0.0, 0.0])]);
        let (_tmp, state) = state_with(4, 1.0, stub).await;

        let inbound = vec![
            Ok(Message::Text("!!!not-base64!!!".to_string().into())),
            Ok(binary_frame()),
        ];
        let (outputs, summary) = drive(state, inbound).await;

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.frames, 1);
        // ready + exactly one result
        assert_eq!(replies(&outputs).len(), 2);
    }

    #[tokio::test]
    async fn test_undecodable_binary_skipped() {
        let stub = StubExtractor::always(4, vec![]);
        let (_tmp, state) = state_with(4, 1.0, stub).await;

        let inbound = vec![
            Ok(Message::Binary(b"junk".to_vec().into())),
            Ok(binary_frame()),
        ];
        let (_, summary) = drive(state, inbound).await;

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.frames, 1);
    }

    #[tokio::test]
    async fn test_data_url_text_frame() {
        let stub =
            StubExtractor::always(4, vec![face_with_embedding(0.0, vec![1.0, 0.0, 0.0, 0.0])]);
        let (_tmp, state) = state_with(4, 1.0, stub).await;

        let text = format!("data:image/png;base64,{}", STANDARD.encode(png_frame()));
        let (outputs, summary) = drive(state, vec![Ok(Message::Text(text.into()))]).await;

        assert_eq!(summary.frames, 1);
        assert!(matches!(replies(&outputs)[1], SessionMessage::Frame { .. }));
    }

    #[tokio::test]
    async fn test_plain_base64_text_frame() {
        let stub =
            StubExtractor::always(4, vec![face_with_embedding(0.0, vec![1.0, 0.0, 0.0, 0.0])]);
        let (_tmp, state) = state_with(4, 1.0, stub).await;

        let text = STANDARD.encode(png_frame());
        let (_, summary) = drive(state, vec![Ok(Message::Text(text.into()))]).await;
        assert_eq!(summary.frames, 1);
    }

    #[tokio::test]
    async fn test_empty_index_reports_null_score() {
        let stub =
            StubExtractor::always(4, vec![face_with_embedding(0.0, vec![1.0, 0.0, 0.0, 0.0])]);
        let (_tmp, state) = state_with(4, 1.0, stub).await;

        let (outputs, _) = drive(state, vec![Ok(binary_frame())]).await;

        let msgs = replies(&outputs);
        let SessionMessage::Frame { faces } = &msgs[1] else {
            panic!("expected a result message");
        };
        assert_eq!(faces[0].identity_id, None);
        assert_eq!(faces[0].score, None);
    }

    #[tokio::test]
    async fn test_distance_equal_to_threshold_is_unmatched() {
        let stub =
            StubExtractor::always(4, vec![face_with_embedding(0.0, vec![0.0, 1.0, 0.0, 0.0])]);
        let (_tmp, state) = state_with(4, 2.0, stub).await;
        state
            .index
            .write()
            .await
            .add(&[1.0, 0.0, 0.0, 0.0], 1)
            .unwrap();

        let (outputs, _) = drive(state, vec![Ok(binary_frame())]).await;

        let msgs = replies(&outputs);
        let SessionMessage::Frame { faces } = &msgs[1] else {
            panic!("expected a result message");
        };
        // d == 2.0 exactly: at the threshold means unmatched
        assert_eq!(faces[0].identity_id, None);
        assert!(faces[0].score.is_some());
    }

    #[tokio::test]
    async fn test_extraction_failure_skips_frame() {
        let stub = StubExtractor::scripted(
            4,
            vec![
                Err(extraction_failure()),
                Ok(vec![face_with_embedding(0.0, vec![1.0, 0.0, 0.0, 0.0])]),
            ],
        );
        let (_tmp, state) = state_with(4, 1.0, stub).await;

        let inbound = vec![Ok(binary_frame()), Ok(binary_frame())];
        let (_, summary) = drive(state, inbound).await;

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.frames, 1);
    }

    #[tokio::test]
    async fn test_close_frame_ends_session_before_later_frames() {
        // Exhausted script panics if consulted: nothing after the close
        // frame may be processed.
        let stub = StubExtractor::scripted(4, vec![]);
        let (_tmp, state) = state_with(4, 1.0, stub).await;

        let inbound = vec![Ok(Message::Close(None)), Ok(binary_frame())];
        let (outputs, summary) = drive(state, inbound).await;

        assert_eq!(summary.frames, 0);
        assert_eq!(replies(&outputs).len(), 1); // ready only
        assert!(matches!(outputs.last(), Some(Message::Close(_))));
    }

    #[tokio::test]
    async fn test_transport_error_ends_session() {
        let stub = StubExtractor::scripted(4, vec![]);
        let (_tmp, state) = state_with(4, 1.0, stub).await;

        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let inbound = vec![Err(axum::Error::new(io_err)), Ok(binary_frame())];
        let (_, summary) = drive(state, inbound).await;

        assert_eq!(summary.frames, 0);
    }

    #[tokio::test]
    async fn test_ping_does_not_disturb_session() {
        let stub =
            StubExtractor::always(4, vec![face_with_embedding(0.0, vec![1.0, 0.0, 0.0, 0.0])]);
        let (_tmp, state) = state_with(4, 1.0, stub).await;

        let inbound = vec![
            Ok(Message::Ping(vec![].into())),
            Ok(binary_frame()),
            Ok(Message::Pong(vec![].into())),
        ];
        let (_, summary) = drive(state, inbound).await;

        assert_eq!(summary.frames, 1);
        assert_eq!(summary.skipped, 0);
    }

    #[tokio::test]
    async fn test_vanished_peer_tolerated() {
        // Both directions gone before the handshake: every send fails and
        // every failure is suppressed.
        let stub = StubExtractor::scripted(4, vec![]);
        let (_tmp, state) = state_with(4, 1.0, stub).await;

        let (in_tx, in_rx) = mpsc::unbounded::<Result<Message, axum::Error>>();
        let (out_tx, out_rx) = mpsc::unbounded::<Message>();
        drop(in_tx);
        drop(out_rx);

        let summary = run_session(state, in_rx, out_tx).await;
        assert_eq!(summary.frames, 0);
    }

    #[test]
    fn test_strip_data_url_header() {
        assert_eq!(strip_data_url_header("data:image/png;base64,abcd"), "abcd");
        assert_eq!(strip_data_url_header("abcd"), "abcd");
        assert_eq!(strip_data_url_header("data:no-comma"), "data:no-comma");
    }
}
