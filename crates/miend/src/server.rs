//! HTTP and WebSocket surface.

use crate::enroll::{self, EnrollError};
use crate::index::{self, RebuildOutcome};
use crate::protocol::{DeleteResponse, EnrollResponse, ErrorBody, StatusResponse};
use crate::session;
use crate::state::AppState;
use crate::store::{Identity, StoreError};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::StreamExt;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Browser clients post camera captures; leave generous room.
const BODY_LIMIT_BYTES: usize = 16 * 1024 * 1024;

pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/enroll", post(enroll_handler))
        .route("/recognize", get(recognize_handler))
        .route("/index/rebuild", post(rebuild_handler))
        .route("/identities", get(list_identities_handler))
        .route("/identities/{id}", delete(delete_identity_handler))
        .route("/status", get(status_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(self) -> String {
        match self {
            ApiError::BadRequest(m)
            | ApiError::NotFound(m)
            | ApiError::Conflict(m)
            | ApiError::Internal(m) => m,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = self.message();
        if status.is_server_error() {
            tracing::error!(%error, "request failed");
        }
        (status, Json(ErrorBody { error })).into_response()
    }
}

impl From<EnrollError> for ApiError {
    fn from(err: EnrollError) -> Self {
        match &err {
            EnrollError::InvalidImage
            | EnrollError::NoFaceDetected
            | EnrollError::DimensionMismatch { .. } => ApiError::BadRequest(err.to_string()),
            EnrollError::DuplicateIdentity => ApiError::Conflict(err.to_string()),
            EnrollError::Extraction(_) | EnrollError::Storage(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::IdentityNotFound(_) => ApiError::NotFound(err.to_string()),
            StoreError::DuplicateIdentity => ApiError::Conflict(err.to_string()),
            StoreError::DimensionMismatch { .. } => ApiError::BadRequest(err.to_string()),
            StoreError::Io(_) | StoreError::Db(_) => ApiError::Internal(err.to_string()),
        }
    }
}

async fn enroll_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<EnrollResponse>), ApiError> {
    let mut name = None;
    let mut contact = None;
    let mut file = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("name") => name = Some(field.text().await.map_err(unreadable_field)?),
            Some("contact") => contact = Some(field.text().await.map_err(unreadable_field)?),
            Some("file") => file = Some(field.bytes().await.map_err(unreadable_field)?),
            _ => {}
        }
    }

    let name = name.ok_or_else(|| missing_field("name"))?;
    let contact = contact.ok_or_else(|| missing_field("contact"))?;
    let file = file.ok_or_else(|| missing_field("file"))?;

    let identity = enroll::enroll(&state, &name, &contact, &file).await?;

    Ok((
        StatusCode::CREATED,
        Json(EnrollResponse {
            identity_id: identity.id,
            name: identity.name,
            contact: identity.contact,
        }),
    ))
}

fn unreadable_field(err: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::BadRequest(format!("unreadable multipart field: {err}"))
}

fn missing_field(field: &str) -> ApiError {
    ApiError::BadRequest(format!("missing multipart field: {field}"))
}

/// Upgrade into a recognition session; one session per connection.
async fn recognize_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        session::run_session(state, stream, sink).await;
    })
}

async fn rebuild_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RebuildOutcome>, ApiError> {
    let outcome =
        index::rebuild_and_swap(&state.store, &state.index, state.embedding_dim).await?;
    Ok(Json(outcome))
}

async fn list_identities_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Identity>>, ApiError> {
    let identities = state.store.list_identities().await?;
    Ok(Json(identities))
}

async fn delete_identity_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<DeleteResponse>, ApiError> {
    state.store.delete_identity(id).await?;
    tracing::info!(
        identity_id = id,
        "identity deleted; index entries stale until next rebuild"
    );
    Ok(Json(DeleteResponse {
        deleted: id,
        stale_until_rebuild: true,
    }))
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, ApiError> {
    let index_size = state.index.read().await.len();
    let identities = state.store.count_identities().await?;
    let embeddings = state.store.count_embeddings().await?;

    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        embedding_dim: state.embedding_dim,
        index_size,
        identities,
        embeddings,
        match_threshold: state.match_threshold,
    }))
}
