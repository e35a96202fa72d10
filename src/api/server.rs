use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRef, Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use crate::{
    auth::{Authenticator, Caller},
    chat::{self, MessageRecord, NewMessage, ThreadMessages, ThreadSummary},
    error::{AppError, AppResult},
    messaging::Messenger,
    store::Store,
};

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

// -----------------------------------------------------------------------------
// Server State
// -----------------------------------------------------------------------------

pub struct ApiState {
    pub store: Store,
    pub authenticator: Authenticator,
    pub messenger: Messenger,
}

impl FromRef<Arc<ApiState>> for Authenticator {
    fn from_ref(state: &Arc<ApiState>) -> Self {
        state.authenticator.clone()
    }
}

#[derive(Debug, Deserialize)]
pub struct ThreadMessagesQuery {
    pub limit: Option<String>,
}

// -----------------------------------------------------------------------------
// Implementation
// -----------------------------------------------------------------------------

pub struct ApiServer {
    store: Store,
    max_content_chars: usize,
}

impl ApiServer {
    pub fn new(store: Store, max_content_chars: usize) -> Self {
        Self {
            store,
            max_content_chars,
        }
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(ApiState {
            store: self.store.clone(),
            authenticator: Authenticator::new(self.store.clone()),
            messenger: Messenger::new(self.store.clone(), self.max_content_chars),
        });

        Router::new()
            .route("/health", get(health_handler))
            .route("/messages", post(create_message_handler))
            .route("/messages/threads", get(list_threads_handler))
            .route("/messages/threads/:other_user_id", get(list_thread_messages_handler))
            .with_state(state)
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }
}

async fn health_handler(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => {
            error!("Health check failed: {:#}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable" })),
            )
        }
    }
}

async fn create_message_handler(
    State(state): State<Arc<ApiState>>,
    caller: Caller,
    headers: HeaderMap,
    body: Result<Json<NewMessage>, JsonRejection>,
) -> AppResult<(StatusCode, Json<MessageRecord>)> {
    let Json(body) = body.map_err(|rejection| {
        AppError::validation(format!("invalid request body: {}", rejection.body_text()))
    })?;

    let idempotency_key = match headers.get(IDEMPOTENCY_KEY_HEADER) {
        Some(value) => {
            let raw = value.to_str().map_err(|_| {
                AppError::validation("Idempotency-Key must be visible ASCII characters")
            })?;
            Some(chat::parse_idempotency_key(raw)?)
        }
        None => None,
    };

    let record = state
        .messenger
        .create_message(caller, body, idempotency_key)
        .await?;

    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_threads_handler(
    State(state): State<Arc<ApiState>>,
    caller: Caller,
) -> AppResult<Json<Vec<ThreadSummary>>> {
    let threads = state.messenger.list_threads(caller).await?;
    Ok(Json(threads))
}

async fn list_thread_messages_handler(
    State(state): State<Arc<ApiState>>,
    caller: Caller,
    Path(other_user_id): Path<String>,
    query: Result<Query<ThreadMessagesQuery>, QueryRejection>,
) -> AppResult<Json<ThreadMessages>> {
    let other_user_id = chat::parse_user_id("otherUserId", Some(&other_user_id))?;

    let Query(query) = query.map_err(|rejection| {
        AppError::validation(format!("invalid query string: {}", rejection.body_text()))
    })?;
    let limit = chat::parse_limit(query.limit.as_deref())?;

    let page = state
        .messenger
        .list_thread_messages(caller, other_user_id, limit)
        .await?;

    Ok(Json(page))
}
