//! Chatbot HTTP handlers.

use std::convert::Infallible;

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderName, HeaderValue, Uri},
    response::{
        IntoResponse,
        sse::{Event, Sse},
    },
};
use futures::StreamExt;
use petchat_protocol::{HistoryEntry, StreamEvent};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::bridge::{ChatReply, ChatRequest};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Success envelope shared by all chatbot endpoints.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub status: &'static str,
    pub message: String,
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(message: impl Into<String>, data: T) -> Json<Self> {
        Json(Self {
            status: "success",
            message: message.into(),
            data: Some(data),
        })
    }
}

impl ApiResponse<()> {
    pub fn message(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            status: "success",
            message: message.into(),
            data: None,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub history: Vec<HistoryEntry>,
    pub total_messages: usize,
}

#[derive(Debug, Serialize)]
pub struct ConversationsResponse {
    pub conversations: Vec<String>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatbotHealthResponse {
    pub status: &'static str,
    pub active_conversations: usize,
    pub max_conversations: usize,
    pub worker_command: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn parse_body(body: Result<Json<ChatRequest>, JsonRejection>) -> ApiResult<ChatRequest> {
    body.map(|Json(request)| request)
        .map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

/// Send a message and wait for the full answer.
#[instrument(skip(state, body))]
pub async fn chat(
    State(state): State<AppState>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<ChatReply>>> {
    let request = parse_body(body)?;
    let reply = state.bridge.chat(request).await?;
    info!(conversation_id = %reply.conversation_id, "Chat message answered");
    Ok(ApiResponse::success("Message processed", reply))
}

/// Send a message and stream the answer as server-sent events.
#[instrument(skip(state, body))]
pub async fn chat_stream(
    State(state): State<AppState>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let request = parse_body(body)?;
    let stream = state.bridge.stream_chat(request)?;
    info!(conversation_id = %stream.conversation_id, "Chat stream opened");

    let events = stream.events.map(|event: StreamEvent| {
        let data = match serde_json::to_string(&event) {
            Ok(data) => data,
            Err(err) => {
                warn!("Failed to serialize stream event: {:?}", err);
                r#"{"type":"error","error":"serialization failed"}"#.to_string()
            }
        };
        Ok::<_, Infallible>(Event::default().data(data))
    });

    Ok((
        [(
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        )],
        Sse::new(events),
    ))
}

/// Forget what the worker remembers about a conversation.
#[instrument(skip(state))]
pub async fn clear_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<ApiResponse<()>>> {
    state.bridge.clear(&conversation_id).await?;
    Ok(ApiResponse::message("Conversation cleared"))
}

#[instrument(skip(state))]
pub async fn conversation_history(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<ApiResponse<HistoryResponse>>> {
    let history = state.bridge.history(&conversation_id).await?;
    let total_messages = history.len();
    Ok(ApiResponse::success(
        "History retrieved",
        HistoryResponse {
            history,
            total_messages,
        },
    ))
}

/// End a conversation. Succeeds whether or not it was live.
#[instrument(skip(state))]
pub async fn end_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> ApiResult<Json<ApiResponse<()>>> {
    if state.bridge.end(&conversation_id).await {
        info!(conversation_id = %conversation_id, "Conversation ended");
    }
    Ok(ApiResponse::message("Conversation ended"))
}

pub async fn list_conversations(
    State(state): State<AppState>,
) -> Json<ApiResponse<ConversationsResponse>> {
    let conversations = state.bridge.conversations().await;
    let total = conversations.len();
    ApiResponse::success(
        "Active conversations",
        ConversationsResponse {
            conversations,
            total,
        },
    )
}

pub async fn chatbot_health(
    State(state): State<AppState>,
) -> Json<ApiResponse<ChatbotHealthResponse>> {
    let registry = state.bridge.registry();
    ApiResponse::success(
        "Chatbot is running",
        ChatbotHealthResponse {
            status: "healthy",
            active_conversations: registry.len().await,
            max_conversations: registry.max_sessions(),
            worker_command: registry.worker_description(),
        },
    )
}

pub async fn not_found(uri: Uri) -> ApiError {
    ApiError::not_found(format!("no route for {}", uri.path()))
}
