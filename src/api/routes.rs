//! HTTP routes.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::error::MailboxError;
use crate::pipeline::{DocumentClassifier, PipelineDriver};
use crate::security::{is_safe_path, sanitize_filename};
use crate::storage::StorageService;

/// Largest accepted upload.
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Room for multipart framing on top of the file itself.
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

const SERVICE_NAME: &str = "invoice-agent";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub driver: Arc<PipelineDriver>,
    pub storage: Arc<StorageService>,
    /// Used by the classify-only route; no file is moved.
    pub classifier: Arc<dyn DocumentClassifier>,
}

/// Build the router.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/v1/health", get(health))
        .route("/api/v1/check-emails", post(check_emails))
        .route("/api/v1/classify", post(classify))
        .route("/api/v1/upload-and-classify", post(upload_and_classify))
        .route("/api/v1/stats", get(stats))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES + MULTIPART_OVERHEAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

// ── Info ────────────────────────────────────────────────────────────────

async fn root() -> impl IntoResponse {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "health": "GET /api/v1/health",
            "check_emails": "POST /api/v1/check-emails",
            "classify": "POST /api/v1/classify",
            "upload_and_classify": "POST /api/v1/upload-and-classify",
            "stats": "GET /api/v1/stats"
        }
    }))
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "service": SERVICE_NAME
    }))
}

async fn stats(State(state): State<AppState>) -> Response {
    match state.storage.stats().await {
        Ok(stats) => Json(json!({
            "invoices": stats.invoices,
            "others": stats.others,
            "temp": stats.temp,
            "total_processed": stats.total_processed,
            "timestamp": Utc::now()
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to collect storage stats");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(default)]
struct EmailCheckRequest {
    max_emails: usize,
    unread_only: bool,
}

impl Default for EmailCheckRequest {
    fn default() -> Self {
        Self {
            max_emails: 10,
            unread_only: true,
        }
    }
}

async fn check_emails(State(state): State<AppState>, body: Bytes) -> Response {
    let request: EmailCheckRequest = if body.iter().all(u8::is_ascii_whitespace) {
        EmailCheckRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return error_response(StatusCode::BAD_REQUEST, format!("Invalid request body: {e}"));
            }
        }
    };

    if !state.driver.has_mailbox() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Mailbox is not configured");
    }

    info!(
        max_emails = request.max_emails,
        unread_only = request.unread_only,
        "Email check requested"
    );
    match state
        .driver
        .check_emails(request.max_emails, request.unread_only)
        .await
    {
        Ok(report) => Json(report).into_response(),
        Err(MailboxError::NotConfigured) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Mailbox is not configured")
        }
        Err(e) => {
            error!(error = %e, "Email check failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ── Classification ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ClassifyRequest {
    file_path: String,
    file_name: Option<String>,
}

async fn classify(State(state): State<AppState>, Json(body): Json<ClassifyRequest>) -> Response {
    let path = PathBuf::from(&body.file_path);

    if !is_safe_path(&path, state.storage.base_path()) {
        warn!(path = %body.file_path, "Rejected classify request outside storage");
        return error_response(StatusCode::BAD_REQUEST, "Invalid file path");
    }
    if !tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()) {
        return error_response(
            StatusCode::NOT_FOUND,
            format!("File not found: {}", body.file_path),
        );
    }

    let file_name = body.file_name.unwrap_or_else(|| {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    });

    match state.classifier.classify(&path, &file_name).await {
        Ok(classification) => Json(json!({
            "file_name": file_name,
            "classification": classification,
            "timestamp": Utc::now()
        }))
        .into_response(),
        Err(e) => {
            error!(path = %body.file_path, error = %e, "Classification failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn upload_and_classify(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut upload = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return error_response(e.status(), e.body_text()),
        };
        if field.name() != Some("file") {
            continue;
        }

        let file_name = sanitize_filename(field.file_name().unwrap_or("upload"));
        match field.bytes().await {
            Ok(bytes) => upload = Some((file_name, bytes)),
            Err(e) => return error_response(e.status(), e.body_text()),
        }
        break;
    }

    let Some((file_name, bytes)) = upload else {
        return error_response(StatusCode::BAD_REQUEST, "Missing multipart field 'file'");
    };
    if bytes.len() > MAX_UPLOAD_BYTES {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("File too large (max {} MB)", MAX_UPLOAD_BYTES / (1024 * 1024)),
        );
    }

    info!(file_name = %file_name, size = bytes.len(), "Upload received");
    let result = state.driver.process_upload(&file_name, bytes.to_vec()).await;

    if result.success() {
        Json(json!({
            "file_name": file_name,
            "classification": result.classification(),
            "destination_path": result.destination_path(),
            "timestamp": Utc::now()
        }))
        .into_response()
    } else {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            result.error_message().unwrap_or("Processing failed"),
        )
    }
}
