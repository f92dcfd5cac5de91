use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::{error_response, UserId};
use crate::models::{EditMessageRequest, RegenerateMessageRequest, SendMessageRequest};
use crate::service::chat_service::ChatService;

/// POST `/api/messages` — new message (and thread, when none is given) plus a streaming reply
pub async fn send_message_handler(
    State(svc): State<ChatService>,
    UserId(user_id): UserId,
    Json(request): Json<SendMessageRequest>,
) -> Response {
    match svc.send_message(&user_id, request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e),
    }
}

/// PATCH `/api/messages/{id}` — edit a user message as a new branch
pub async fn edit_message_handler(
    Path(message_id): Path<String>,
    State(svc): State<ChatService>,
    UserId(user_id): UserId,
    Json(request): Json<EditMessageRequest>,
) -> Response {
    match svc.edit_message(&user_id, &message_id, request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/threads/{thread_id}/messages/{id}/regenerate`
pub async fn regenerate_message_handler(
    Path((thread_id, message_id)): Path<(String, String)>,
    State(svc): State<ChatService>,
    UserId(user_id): UserId,
    Json(request): Json<RegenerateMessageRequest>,
) -> Response {
    match svc.regenerate_message(&user_id, &thread_id, &message_id, request).await {
        Ok(message) => Json(message).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/messages/{id}/stop` — cancel a live generation
pub async fn stop_message_handler(
    Path(message_id): Path<String>,
    State(svc): State<ChatService>,
    UserId(user_id): UserId,
) -> Response {
    match svc.stop(&user_id, &message_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}
