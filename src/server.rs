//! HTTP boundary: request parsing, auth, CORS, and wiring of the validator,
//! materializer, queue, and cache into responses.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;

use crate::backend::ConvexBackend;
use crate::compiler::{CompileOutcome, Engine};
use crate::config::{Config, DEFAULT_TIMEOUT_SECS, MAX_TIMEOUT_SECS, MAX_UPLOAD_SIZE};
use crate::error::ServiceError;
use crate::project;
use crate::queue::{Job, QueueManager};
use crate::zipsafe;

pub struct AppState {
    pub config: Config,
    pub queue: Arc<QueueManager>,
    pub backend: Option<ConvexBackend>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let origin = HeaderValue::from_str(&state.config.allowed_origin).unwrap_or_else(|_| {
        tracing::warn!(
            origin = %state.config.allowed_origin,
            "ALLOWED_ORIGIN is not a valid header value, CORS disabled"
        );
        HeaderValue::from_static("null")
    });
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/compile", post(compile))
        .route("/compile-project", post(compile_project))
        // Multipart overhead on top of the archive cap; the explicit 50 MiB
        // check below owns the boundary.
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_SIZE + 4 * 1024 * 1024))
        .layer(cors)
        .layer(axum::middleware::from_fn(log_requests))
        .with_state(state)
}

async fn log_requests(request: axum::extract::Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    tracing::info!(%method, path, "incoming request");
    let response = next.run(request).await;
    tracing::info!(%method, path, status = response.status().as_u16(), "request complete");
    response
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, error) = match &self {
            ServiceError::ZipSafety(_) => (StatusCode::BAD_REQUEST, "zip_safety_violation"),
            ServiceError::QueueFull => (StatusCode::SERVICE_UNAVAILABLE, "queue_full"),
            ServiceError::ProjectFetch(_) => (StatusCode::BAD_REQUEST, "project_fetch_failed"),
            ServiceError::Materialize(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "file_materialization_failed")
            }
            ServiceError::WorkerLost => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        (status, Json(json!({"error": error, "detail": self.to_string()}))).into_response()
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Bearer-token check. Comparison goes through SHA-256 digests so timing is
/// independent of where the provided value diverges from the secret.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let expected = format!("Bearer {}", state.config.api_secret);
    if !constant_time_eq(provided, &expected) {
        return Err(
            (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response(),
        );
    }
    Ok(())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    use sha2::{Digest, Sha256};
    Sha256::digest(a.as_bytes()) == Sha256::digest(b.as_bytes())
}

pub fn clamp_timeout(requested: i64) -> u64 {
    requested.clamp(1, MAX_TIMEOUT_SECS as i64) as u64
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "on" | "yes"
    )
}

fn pdf_response(pdf: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/pdf"),
            (header::CONTENT_DISPOSITION, "inline; filename=output.pdf"),
        ],
        pdf,
    )
        .into_response()
}

fn bad_request(error: &str, detail: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": error, "detail": detail}))).into_response()
}

/// Create the per-job scratch directory. The caller owns it until the job is
/// submitted; the scheduler owns it afterwards.
fn create_work_dir() -> Result<PathBuf, Response> {
    match tempfile::Builder::new().prefix("latex-").tempdir() {
        Ok(dir) => Ok(dir.keep()),
        Err(e) => {
            tracing::error!("cannot create work dir: {e}");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal_error", "detail": "cannot create work dir"})),
            )
                .into_response())
        }
    }
}

async fn remove_work_dir(work_dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(work_dir).await {
        tracing::debug!("work dir cleanup: {e}");
    }
}

async fn submit_and_await(
    state: &AppState,
    client_id: String,
    work_dir: PathBuf,
    entrypoint: String,
    timeout_secs: u64,
    engine: Engine,
    halt_on_error: bool,
) -> Result<CompileOutcome, Response> {
    let (done, result) = oneshot::channel();
    let job = Job {
        work_dir: work_dir.clone(),
        entrypoint,
        timeout_secs,
        engine,
        halt_on_error,
        done,
    };
    if let Err(e) = state.queue.submit(&client_id, job) {
        remove_work_dir(&work_dir).await;
        return Err(e.into_response());
    }
    tracing::info!(client = %client_id, work_dir = %work_dir.display(), "job submitted");

    // An abandoned handle means the worker died without a result; its
    // finalization already removed the working directory.
    result.await.map_err(|_| ServiceError::WorkerLost.into_response())
}

fn outcome_response(outcome: CompileOutcome) -> Response {
    match outcome {
        CompileOutcome::Success { pdf } => {
            tracing::info!(pdf_size = pdf.len(), "compilation succeeded");
            pdf_response(pdf)
        }
        CompileOutcome::Failure { log_tail } => {
            tracing::info!("compilation failed");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"error": "compilation_failed", "log": log_tail})),
            )
                .into_response()
        }
    }
}

async fn compile(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }

    let mut zip_bytes: Option<Vec<u8>> = None;
    let mut entrypoint: Option<String> = None;
    let mut timeout_secs = DEFAULT_TIMEOUT_SECS;
    let mut engine = Engine::Pdflatex;
    let mut halt_on_error = false;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                // Oversized bodies surface here once the limit layer cuts
                // the stream off.
                return (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    Json(json!({"error": "upload_too_large", "detail": e.to_string()})),
                )
                    .into_response();
            }
        };
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => match field.bytes().await {
                Ok(bytes) => zip_bytes = Some(bytes.to_vec()),
                Err(e) => {
                    return (
                        StatusCode::PAYLOAD_TOO_LARGE,
                        Json(json!({"error": "upload_too_large", "detail": e.to_string()})),
                    )
                        .into_response();
                }
            },
            "entrypoint" => entrypoint = field.text().await.ok(),
            "timeout" => {
                if let Ok(text) = field.text().await {
                    timeout_secs =
                        clamp_timeout(text.trim().parse().unwrap_or(DEFAULT_TIMEOUT_SECS as i64));
                }
            }
            "compiler" => {
                if let Ok(text) = field.text().await {
                    engine = Engine::from_name(text.trim());
                }
            }
            "halt_on_error" => {
                if let Ok(text) = field.text().await {
                    halt_on_error = parse_bool(&text);
                }
            }
            _ => {}
        }
    }

    let Some(zip_bytes) = zip_bytes else {
        return bad_request("missing_field", "file part is required".to_string());
    };
    let Some(entrypoint) = entrypoint else {
        return bad_request("missing_field", "entrypoint part is required".to_string());
    };
    if zip_bytes.len() > MAX_UPLOAD_SIZE {
        return (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({"error": "upload_too_large", "detail": "max upload size is 50MB"})),
        )
            .into_response();
    }

    tracing::info!(
        entrypoint = %entrypoint,
        timeout_secs,
        engine = engine.name(),
        halt_on_error,
        zip_size = zip_bytes.len(),
        "compile request"
    );

    let work_dir = match create_work_dir() {
        Ok(dir) => dir,
        Err(response) => return response,
    };

    // Validation decompresses on the blocking pool; the request task stays
    // responsive.
    let dest = work_dir.clone();
    let validated =
        tokio::task::spawn_blocking(move || zipsafe::validate_and_extract(&zip_bytes, &dest)).await;
    match validated {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            remove_work_dir(&work_dir).await;
            return ServiceError::ZipSafety(e).into_response();
        }
        Err(e) => {
            tracing::error!("extraction task failed: {e}");
            remove_work_dir(&work_dir).await;
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal_error", "detail": "extraction failed"})),
            )
                .into_response();
        }
    }

    match submit_and_await(
        &state,
        peer.ip().to_string(),
        work_dir,
        entrypoint,
        timeout_secs,
        engine,
        halt_on_error,
    )
    .await
    {
        Ok(outcome) => outcome_response(outcome),
        Err(response) => response,
    }
}

#[derive(Debug, Deserialize)]
struct CompileProjectForm {
    project_id: String,
    #[serde(default)]
    timeout: Option<i64>,
}

async fn compile_project(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Form(form): Form<CompileProjectForm>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let Some(backend) = state.backend.as_ref() else {
        return ServiceError::ProjectFetch("metadata backend not configured".to_string())
            .into_response();
    };
    let timeout_secs = clamp_timeout(form.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS as i64));

    let project = match backend.get_project_with_files(&form.project_id).await {
        Ok(project) => project,
        Err(e) => {
            tracing::warn!(project_id = %form.project_id, "project fetch failed: {e}");
            return ServiceError::ProjectFetch(e.to_string()).into_response();
        }
    };
    let zip_hash = project::fingerprint(&project.files);
    tracing::info!(
        project_id = %form.project_id,
        zip_hash = %zip_hash,
        files = project.files.len(),
        "project resolved"
    );

    // Cache consultation happens before any file touches disk; every cache
    // problem downgrades to a miss.
    match backend
        .get_compilation_by_hash(&form.project_id, &zip_hash)
        .await
    {
        Ok(Some(pdf_url)) => match backend.fetch_pdf(&pdf_url).await {
            Ok(pdf) => {
                tracing::info!(project_id = %form.project_id, "compilation cache hit");
                return pdf_response(pdf);
            }
            Err(e) => tracing::warn!("cached pdf fetch failed, recompiling: {e}"),
        },
        Ok(None) => {}
        Err(e) => tracing::warn!("cache lookup failed, treating as miss: {e}"),
    }

    let work_dir = match create_work_dir() {
        Ok(dir) => dir,
        Err(response) => return response,
    };
    if let Err(e) = project::materialize(backend.http_client(), &project.files, &work_dir).await {
        remove_work_dir(&work_dir).await;
        return e.into_response();
    }

    let outcome = match submit_and_await(
        &state,
        peer.ip().to_string(),
        work_dir,
        project.entrypoint.clone(),
        timeout_secs,
        Engine::from_name(&project.compiler),
        project.halt_on_error,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(response) => return response,
    };

    if let CompileOutcome::Success { pdf } = &outcome {
        spawn_cache_population(
            Arc::clone(&state),
            form.project_id.clone(),
            zip_hash,
            pdf.clone(),
        );
    }
    outcome_response(outcome)
}

/// Populate the cache after the response is already on its way. Failures are
/// an expected transient class and never log above WARN.
fn spawn_cache_population(
    state: Arc<AppState>,
    project_id: String,
    zip_hash: String,
    pdf: Vec<u8>,
) {
    tokio::spawn(async move {
        let Some(backend) = state.backend.as_ref() else {
            return;
        };
        match backend.store_compilation(&project_id, &zip_hash, &pdf).await {
            Ok(()) => tracing::info!(project_id = %project_id, "compilation cached"),
            Err(e) => tracing::warn!(project_id = %project_id, "cache population failed: {e}"),
        }
    });
}
