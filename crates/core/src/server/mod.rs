//! HTTP front end for generation jobs.
//!
//! Thin boundary over the executor: parse and validate, claim the identity,
//! run the job, map outcomes to JSON responses. Validation happens before
//! any claim is taken, so a rejected request can never leak a claim.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{error, warn};

use crate::admission::{AdmissionCheck, AdmissionController, AdmissionPolicy, ClaimOutcome};
use crate::config::AppConfig;
use crate::engine::WorkerSampler;
use crate::executor::{parse_generation_request, JobExecutor};
use crate::store::ClaimStore;

const TEST_ENDPOINT_DELAY: Duration = Duration::from_secs(2);

const MSG_INVALID_JSON: &str = "Request body must be valid JSON";
const MSG_TOKEN_REQUIRED: &str = "Token is required";
const MSG_TASK_IN_PROGRESS: &str =
    "You already have a video generation task in progress, please try again later";
const MSG_STORE_UNAVAILABLE: &str =
    "Service is temporarily unable to accept new tasks, please try again later";
const MSG_GENERATION_FAILED: &str = "Video generation failed, check server logs for details";
const MSG_VIDEO_NOT_FOUND: &str = "Video file not found";
const MSG_VIDEO_SERVE_FAILED: &str = "Error serving video";
const MSG_HEALTH_FAILED: &str = "Health check failed";
const MSG_TEST_SUCCESS: &str = "Test request successful";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    executor: JobExecutor,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(executor: JobExecutor) -> Self {
        Self {
            inner: Arc::new(AppStateInner { executor }),
        }
    }

    /// Wire the full production state from configuration: Redis-backed
    /// claim store and the worker-backed sampler. Fails when the model
    /// directory is missing, making a bad model path fatal at startup.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let store = ClaimStore::connect(&config.store)?;
        let admission = Arc::new(AdmissionController::new(
            store,
            AdmissionPolicy::from_config(&config.store),
        ));
        let sampler = Arc::new(WorkerSampler::new(&config.engine)?);
        let executor = JobExecutor::new(admission, sampler, config.paths.results_dir.clone());
        Ok(Self::new(executor))
    }

    fn executor(&self) -> &JobExecutor {
        &self.inner.executor
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/generate", post(generate))
        .route("/api/v1/video/{name}", get(serve_video))
        .route("/api/v1/health", get(health))
        .route("/api/v1/test", post(test_inference))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub enum ApiError {
    BadRequest(String),
    Busy(String),
    Unavailable(String),
    NotFound(String),
    Internal {
        message: String,
        task_id: Option<String>,
    },
}

#[derive(Serialize)]
struct ErrorBody {
    status: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_id: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, task_id) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            ApiError::Busy(msg) => (StatusCode::TOO_MANY_REQUESTS, msg, None),
            ApiError::Unavailable(msg) => (StatusCode::TOO_MANY_REQUESTS, msg, None),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            ApiError::Internal { message, task_id } => {
                (StatusCode::INTERNAL_SERVER_ERROR, message, task_id)
            }
        };

        let body = Json(ErrorBody {
            status: "error",
            message,
            task_id,
        });
        (status, body).into_response()
    }
}

fn require_token(body: &Value) -> Result<String, ApiError> {
    match body.get("token") {
        Some(Value::String(token)) if !token.trim().is_empty() => Ok(token.clone()),
        _ => Err(ApiError::BadRequest(MSG_TOKEN_REQUIRED.to_string())),
    }
}

async fn generate(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body.map_err(|_| ApiError::BadRequest(MSG_INVALID_JSON.to_string()))?;
    let token = require_token(&body)?;
    let params = parse_generation_request(&body)
        .map_err(|err| ApiError::BadRequest(err.message().to_string()))?;

    let ticket = match state.executor().admission().try_claim(&token).await {
        ClaimOutcome::Granted(ticket) => ticket,
        ClaimOutcome::InFlight => {
            return Err(ApiError::Busy(MSG_TASK_IN_PROGRESS.to_string()));
        }
        ClaimOutcome::Unavailable => {
            return Err(ApiError::Unavailable(MSG_STORE_UNAVAILABLE.to_string()));
        }
    };

    match state.executor().execute(&token, &ticket, &params).await {
        Ok(job) => Ok(Json(json!({
            "status": "success",
            "video_path": job.video_path.to_string_lossy(),
            "seed": job.seed,
            "prompt": job.prompt,
        }))),
        // Raw failure detail is already logged with this task id; the
        // caller only gets the correlation handle.
        Err(_) => Err(ApiError::Internal {
            message: MSG_GENERATION_FAILED.to_string(),
            task_id: Some(ticket.task_id),
        }),
    }
}

async fn serve_video(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    if !is_safe_video_name(&name) {
        return Err(ApiError::NotFound(MSG_VIDEO_NOT_FOUND.to_string()));
    }

    let file_path = state.executor().results_dir().join(&name);
    if !file_path.is_file() {
        return Err(ApiError::NotFound(MSG_VIDEO_NOT_FOUND.to_string()));
    }

    let bytes = tokio::fs::read(&file_path).await.map_err(|err| {
        error!(video = %name, error = %err, "failed to read video artifact");
        ApiError::Internal {
            message: MSG_VIDEO_SERVE_FAILED.to_string(),
            task_id: None,
        }
    })?;

    let mime = mime_guess::from_path(&file_path).first_or_octet_stream();
    Ok((StatusCode::OK, [("content-type", mime.essence_str())], bytes).into_response())
}

/// Names come straight from the URL; anything that could escape the
/// results directory is treated as absent.
fn is_safe_video_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

async fn health(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let store_connected = state.executor().admission().store().ping().await;
    if !store_connected {
        warn!("health probe failed: claim store unreachable");
        return Err(ApiError::Internal {
            message: MSG_HEALTH_FAILED.to_string(),
            task_id: None,
        });
    }

    Ok(Json(json!({
        "status": "success",
        "store_connected": true,
        "model_loaded": state.executor().sampler().is_loaded(),
        "server_time": chrono::Local::now().to_rfc3339(),
    })))
}

async fn test_inference(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = body.map_err(|_| ApiError::BadRequest(MSG_INVALID_JSON.to_string()))?;
    let token = require_token(&body)?;

    match state.executor().admission().check(&token).await {
        AdmissionCheck::InFlight => {
            return Err(ApiError::Busy(MSG_TASK_IN_PROGRESS.to_string()));
        }
        AdmissionCheck::Unavailable => {
            return Err(ApiError::Unavailable(MSG_STORE_UNAVAILABLE.to_string()));
        }
        AdmissionCheck::Clear => {}
    }

    tokio::time::sleep(TEST_ENDPOINT_DELAY).await;

    Ok(Json(json!({
        "status": "success",
        "test_data": body,
        "message": MSG_TEST_SUCCESS,
        "server_time": chrono::Local::now().to_rfc3339(),
    })))
}
