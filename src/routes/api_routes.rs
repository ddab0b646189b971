use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::errors::AppError;
use crate::models::ChatRequest;
use crate::service::chat_service::ChatService;

// ── Handlers ─────────────────────────────────────────────────────────────────

/// POST `/api/chat`: runs a whole turn and returns the messages it appended
pub async fn chat_handler(
    State(svc): State<ChatService>,
    Json(request): Json<ChatRequest>,
) -> Response {
    match svc.chat(request).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_response(&err),
    }
}

/// GET `/api/sessions`: sessions, most recently active first
pub async fn list_sessions_handler(State(svc): State<ChatService>) -> Response {
    match svc.get_sessions().await {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/sessions/{id}/messages`: full history of one session
pub async fn list_messages_handler(
    Path(id): Path<String>,
    State(svc): State<ChatService>,
) -> Response {
    match svc.get_messages(&id).await {
        Ok(msgs) => Json(msgs).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Helper ────────────────────────────────────────────────────────────────────

pub fn status_for(err: &AppError) -> StatusCode {
    if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.is_conflict() {
        StatusCode::CONFLICT
    } else if err.is_agent_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn error_response(err: &AppError) -> Response {
    (status_for(err), Json(json!({ "error": err.to_string() }))).into_response()
}
