//! HTTP API for the Keel node.
//!
//! Implements the git smart HTTP endpoints. Request bodies are streamed into
//! the protocol engine on a blocking thread, and its output is streamed back
//! as the response body.

use crate::observability::request_id_middleware;
use crate::repos::{RegistryError, RepoRegistry};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use keel_git::{advertise_refs, GitError, ServeOptions, Service, SessionOutcome};
use keel_storage::Repository;
use serde::{Deserialize, Serialize};
use std::io::{self, BufWriter, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tower_http::trace::TraceLayer;

/// Buffered bytes between the engine and the response body.
const RESPONSE_BUFFER: usize = 64 * 1024;
/// Chunks in flight between the engine thread and the response body.
const RESPONSE_CHANNEL_DEPTH: usize = 16;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Repository registry.
    pub repos: Arc<RepoRegistry>,
    /// Engine settings for each request.
    pub options: ServeOptions,
    /// Create repositories on first push.
    pub auto_create: bool,
    /// How long a request body may stall.
    pub idle_timeout: Duration,
}

impl AppState {
    /// State with default engine settings over `repos`.
    pub fn new(repos: Arc<RepoRegistry>) -> Self {
        Self {
            repos,
            options: ServeOptions::http(),
            auto_create: true,
            idle_timeout: Duration::from_secs(60),
        }
    }

    fn repo_for(&self, name: &str, service: Service) -> Result<Arc<Repository>, ApiError> {
        let repo = match service {
            Service::ReceivePack if self.auto_create => self.repos.get_or_create(name)?,
            _ => self.repos.get(name)?,
        };
        Ok(repo)
    }
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("repository not found: {0}")]
    RepoNotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("storage error: {0}")]
    Storage(#[from] keel_storage::StorageError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(name) => ApiError::RepoNotFound(name),
            RegistryError::InvalidName(_) => ApiError::BadRequest(e.to_string()),
            RegistryError::Storage(e) => ApiError::Storage(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::RepoNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Git(_) | ApiError::Storage(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Query of `GET info/refs`.
#[derive(Debug, Deserialize)]
pub struct InfoRefsQuery {
    /// `git-upload-pack` or `git-receive-pack`.
    pub service: Option<String>,
}

/// Creates the API router.
///
/// Repository paths may be written with or without the `.git` suffix.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/{repo}/info/refs", get(git_info_refs))
        .route("/{repo}/git-upload-pack", post(git_upload_pack))
        .route("/{repo}/git-receive-pack", post(git_receive_pack))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "repositories": state.repos.len(),
    }))
}

/// Adds the headers git expects on every smart HTTP response.
fn git_response(content_type: String, body: Body) -> Result<Response, ApiError> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache, max-age=0, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .header(header::EXPIRES, "Fri, 01 Jan 1980 00:00:00 GMT")
        .body(body)
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Git info/refs endpoint - advertises references.
async fn git_info_refs(
    State(state): State<AppState>,
    Path(repo): Path<String>,
    Query(query): Query<InfoRefsQuery>,
) -> Result<Response, ApiError> {
    let service = query
        .service
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("dumb HTTP protocol is not supported".to_string()))?
        .parse::<Service>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let repo = state.repo_for(&repo, service)?;

    let output = tokio::task::spawn_blocking(move || {
        let mut output = Vec::new();
        advertise_refs(&mut output, &repo, service, true).map(|()| output)
    })
    .await
    .map_err(|e| ApiError::Internal(e.to_string()))??;

    git_response(
        format!("application/x-{}-advertisement", service),
        Body::from(output),
    )
}

/// Git upload-pack endpoint - handles fetch/clone.
async fn git_upload_pack(
    State(state): State<AppState>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    run_service(state, Service::UploadPack, &repo, &headers, body)
}

/// Git receive-pack endpoint - handles push.
async fn git_receive_pack(
    State(state): State<AppState>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    run_service(state, Service::ReceivePack, &repo, &headers, body)
}

/// Starts `service` on a blocking thread and streams its output back.
fn run_service(
    state: AppState,
    service: Service,
    name: &str,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let repo = state.repo_for(name, service)?;
    let reader = request_reader(headers, body, state.idle_timeout)?;

    let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_DEPTH);
    let options = state.options.clone();
    tokio::task::spawn_blocking(move || {
        let mut writer = BufWriter::with_capacity(RESPONSE_BUFFER, ChannelWriter { tx });
        let result = keel_git::serve(service, reader, &mut writer, &repo, &options);
        let _ = writer.flush();
        match result {
            Ok(SessionOutcome::Fetch(outcome)) => tracing::debug!(
                repo = %repo.name,
                wants = outcome.wants,
                sent_pack = outcome.pack.is_some(),
                "Upload-pack request finished"
            ),
            Ok(SessionOutcome::Push(outcome)) => tracing::debug!(
                repo = %repo.name,
                commands = outcome.results.len(),
                "Receive-pack request finished"
            ),
            Err(e) if e.is_transport() => tracing::debug!(
                repo = %repo.name,
                service = %service,
                error = %e,
                "Client went away"
            ),
            Err(e) => {
                tracing::warn!(repo = %repo.name, service = %service, error = %e, "Session failed")
            }
        }
    });

    git_response(
        format!("application/x-{}-result", service),
        Body::from_stream(response_stream(rx)),
    )
}

/// Turns the request body into a blocking reader, decompressing gzip
/// bodies and failing with `TimedOut` if the client stalls.
fn request_reader(
    headers: &HeaderMap,
    body: Body,
    idle_timeout: Duration,
) -> Result<Box<dyn Read + Send>, ApiError> {
    let stream = Box::pin(idle_stream(body, idle_timeout));
    let bridge = SyncIoBridge::new(StreamReader::new(stream));

    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .map(|v| v.to_str().unwrap_or_default().to_ascii_lowercase());
    match encoding.as_deref() {
        None | Some("identity") => Ok(Box::new(bridge)),
        Some("gzip") | Some("x-gzip") => Ok(Box::new(flate2::read::GzDecoder::new(bridge))),
        Some(other) => Err(ApiError::BadRequest(format!(
            "unsupported content encoding: {}",
            other
        ))),
    }
}

/// Body chunks as I/O results, with a deadline on each chunk.
fn idle_stream(body: Body, idle_timeout: Duration) -> impl Stream<Item = io::Result<Bytes>> + Send {
    futures::stream::unfold(
        Some(body.into_data_stream()),
        move |state| async move {
            let mut stream = state?;
            match tokio::time::timeout(idle_timeout, stream.next()).await {
                Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(stream))),
                Ok(Some(Err(e))) => Some((Err(io::Error::other(e)), None)),
                Ok(None) => None,
                Err(_) => Some((
                    Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "request body stalled",
                    )),
                    None,
                )),
            }
        },
    )
}

/// Response body fed by the engine thread.
fn response_stream(
    rx: mpsc::Receiver<io::Result<Bytes>>,
) -> impl Stream<Item = io::Result<Bytes>> + Send {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    })
}

/// `Write` adapter that forwards bytes to the response body.
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response body dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
