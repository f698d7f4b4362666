//! Trigger-layer HTTP surface
//!
//! Thin translation between HTTP and the coordinator/pipeline: start and
//! end signals for lessons, the provider's recording-finished webhook, and
//! read-only status endpoints. All real work happens on the worker lanes;
//! handlers only enqueue and wait.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::db::{Db, DynError};
use crate::ingest::{self, IngestPipeline};
use crate::lifecycle::{Coordinator, StartError};
use crate::pool::AccountPool;
use crate::provider::RecordingPart;
use crate::workers::{LifecycleJob, WorkerHandles};

pub struct AppState {
    pub db: Arc<Db>,
    pub pool: Arc<AccountPool>,
    pub coordinator: Arc<Coordinator>,
    pub pipeline: Arc<IngestPipeline>,
    pub workers: Arc<WorkerHandles>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

#[derive(Deserialize)]
struct RegisterLessonRequest {
    id: String,
    scheduled_start_ms: i64,
    scheduled_end_ms: i64,
}

#[derive(Serialize)]
struct StartLessonResponse {
    meeting_id: String,
    join_url: String,
    host_url: String,
    access_secret: Option<String>,
}

#[derive(Deserialize)]
struct WebhookPart {
    id: String,
    start_timestamp_ms: i64,
    end_timestamp_ms: i64,
    byte_size: u64,
    download_url: String,
}

#[derive(Deserialize)]
struct RecordingFinishedWebhook {
    meeting_id: String,
    #[serde(default)]
    parts: Vec<WebhookPart>,
}

async fn register_lesson_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterLessonRequest>,
) -> axum::response::Response {
    if req.scheduled_end_ms <= req.scheduled_start_ms {
        return error_response(
            StatusCode::BAD_REQUEST,
            "scheduled_end_ms must be after scheduled_start_ms",
        );
    }

    let coordinator = state.coordinator.clone();
    let result = tokio::task::spawn_blocking(move || {
        coordinator.register_lesson(&req.id, req.scheduled_start_ms, req.scheduled_end_ms)
    })
    .await;

    match result {
        Ok(Ok(())) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(e)) => {
            error!("[serve] Lesson registration failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => {
            error!("[serve] Registration task panicked: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

async fn start_lesson_handler(
    State(state): State<Arc<AppState>>,
    Path(lesson_id): Path<String>,
) -> axum::response::Response {
    let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
    let job = LifecycleJob::Start {
        lesson_id: lesson_id.clone(),
        reply: reply_tx,
    };
    if state.workers.lifecycle_sender().send(job).is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "service shutting down");
    }

    let result = tokio::task::spawn_blocking(move || reply_rx.recv()).await;
    match result {
        Ok(Ok(Ok(meeting))) => Json(StartLessonResponse {
            meeting_id: meeting.meeting_id,
            join_url: meeting.join_url,
            host_url: meeting.host_url,
            access_secret: meeting.access_secret,
        })
        .into_response(),
        // Pool exhaustion is the one recoverable outcome: the client is told
        // to try again shortly, never left hanging
        Ok(Ok(Err(StartError::AllBusy))) => {
            warn!("[serve] Start of lesson {} rejected: pool exhausted", lesson_id);
            error_response(StatusCode::SERVICE_UNAVAILABLE, StartError::AllBusy.to_string())
        }
        Ok(Ok(Err(StartError::Provider(e)))) => {
            error!("[serve] Start of lesson {} failed at provider: {}", lesson_id, e);
            error_response(StatusCode::BAD_GATEWAY, e.to_string())
        }
        Ok(Ok(Err(StartError::Internal(e)))) => {
            error!("[serve] Start of lesson {} failed: {}", lesson_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        _ => error_response(StatusCode::INTERNAL_SERVER_ERROR, "worker reply lost"),
    }
}

async fn end_lesson_handler(
    State(state): State<Arc<AppState>>,
    Path(lesson_id): Path<String>,
) -> axum::response::Response {
    let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
    let job = LifecycleJob::End {
        lesson_id,
        reply: reply_tx,
    };
    if state.workers.lifecycle_sender().send(job).is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "service shutting down");
    }

    let result = tokio::task::spawn_blocking(move || reply_rx.recv()).await;
    match result {
        Ok(Ok(Ok(()))) => StatusCode::NO_CONTENT.into_response(),
        Ok(Ok(Err(message))) => {
            error!("[serve] End signal failed: {}", message);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, message)
        }
        _ => error_response(StatusCode::INTERNAL_SERVER_ERROR, "worker reply lost"),
    }
}

async fn recording_finished_handler(
    State(state): State<Arc<AppState>>,
    Json(webhook): Json<RecordingFinishedWebhook>,
) -> axum::response::Response {
    let pipeline = state.pipeline.clone();
    let meeting_id = webhook.meeting_id.clone();
    let parts: Vec<RecordingPart> = webhook
        .parts
        .into_iter()
        .map(|p| RecordingPart {
            id: p.id,
            start_timestamp_ms: p.start_timestamp_ms,
            end_timestamp_ms: p.end_timestamp_ms,
            byte_size: p.byte_size,
            download_url: p.download_url,
        })
        .collect();

    let result = tokio::task::spawn_blocking(move || {
        pipeline.register_finished_recording(&meeting_id, &parts)
    })
    .await;

    match result {
        Ok(Ok(Some(recording_id))) => {
            state.workers.enqueue_recording(&recording_id);
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "recording_id": recording_id })),
            )
                .into_response()
        }
        // Unknown meeting: acknowledge so the provider stops redelivering
        Ok(Ok(None)) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(e)) => {
            error!("[serve] Webhook handling failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
        Err(e) => {
            error!("[serve] Webhook task panicked: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

async fn accounts_handler(State(state): State<Arc<AppState>>) -> axum::response::Response {
    let pool = state.pool.clone();
    let result = tokio::task::spawn_blocking(move || pool.list_accounts()).await;
    match result {
        Ok(Ok(accounts)) => {
            let body: Vec<_> = accounts
                .into_iter()
                .map(|a| {
                    serde_json::json!({
                        "id": a.id,
                        "max_concurrent": a.max_concurrent,
                        "current_load": a.current_load,
                        "active": a.active,
                    })
                })
                .collect();
            Json(body).into_response()
        }
        Ok(Err(e)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
    }
}

async fn recording_status_handler(
    State(state): State<Arc<AppState>>,
    Path(recording_id): Path<String>,
) -> axum::response::Response {
    let db = state.db.clone();
    let result =
        tokio::task::spawn_blocking(move || ingest::load_recording(&db, &recording_id)).await;
    match result {
        Ok(Ok(Some(recording))) => Json(serde_json::json!({
            "id": recording.id,
            "lesson_id": recording.lesson_id,
            "status": recording.status.as_str(),
            "attempts": recording.attempts,
            "storage_ref": recording.storage_ref,
            "total_bytes": recording.total_bytes,
        }))
        .into_response(),
        Ok(Ok(None)) => error_response(StatusCode::NOT_FOUND, "unknown recording"),
        Ok(Err(e)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/lessons", post(register_lesson_handler))
        .route("/api/lessons/{id}/start", post(start_lesson_handler))
        .route("/api/lessons/{id}/end", post(end_lesson_handler))
        .route(
            "/api/webhooks/recording-finished",
            post(recording_finished_handler),
        )
        .route("/api/accounts", get(accounts_handler))
        .route("/api/recordings/{id}", get(recording_status_handler))
        .layer(cors)
        .with_state(state)
}

/// Run the HTTP server until the process is stopped. Uses its own runtime;
/// the caller's worker lanes keep running on their threads.
pub fn serve_api(state: Arc<AppState>, port: u16) -> Result<(), DynError> {
    println!("Listening on: http://[::]:{} (IPv4 + IPv6)", port);
    println!("Available endpoints:");
    println!("  POST /api/lessons                        - Register a lesson");
    println!("  POST /api/lessons/{{id}}/start             - Start a lesson");
    println!("  POST /api/lessons/{{id}}/end               - End a lesson");
    println!("  POST /api/webhooks/recording-finished    - Provider recording webhook");
    println!("  GET  /api/accounts                       - Account pool status");
    println!("  GET  /api/recordings/{{id}}                - Recording pipeline status");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let app = build_router(state);
        let listener = tokio::net::TcpListener::bind(format!("[::]:{}", port))
            .await
            .map_err(|e| format!("Failed to bind to port {}: {}", port, e))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| format!("Server error: {}", e))?;
        Ok::<(), DynError>(())
    })
}
