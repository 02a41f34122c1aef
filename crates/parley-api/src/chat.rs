use std::collections::HashMap;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{error, warn};
use uuid::Uuid;

use parley_db::models::NewMessage;
use parley_types::api::{Claims, SendMessageRequest, SendMessageResponse, SendReadReceiptRequest};
use parley_types::models::TypingNotification;

use crate::AppState;

/// Typing events age out of the served view after this many seconds.
pub const TYPING_EVENT_TTL_SECS: i64 = 8;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    100
}

// ── Typing registry ─────────────────────────────────────────────────────

struct TypingEntry {
    arrived: DateTime<Utc>,
    version: i64,
}

/// In-memory typing state: thread → sender → latest event. Typing is
/// ephemeral, so nothing here touches the database; entries expire on read.
#[derive(Default)]
pub struct TypingRegistry {
    inner: Mutex<HashMap<Uuid, HashMap<Uuid, TypingEntry>>>,
}

impl TypingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a typing event, overwriting the sender's previous one and
    /// bumping its version.
    pub fn record(&self, thread_id: Uuid, sender: Uuid, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        let thread = inner.entry(thread_id).or_default();
        let version = thread.get(&sender).map_or(1, |e| e.version + 1);
        thread.insert(sender, TypingEntry { arrived: now, version });
    }

    /// Fresh typing events for a thread, excluding the recipient's own.
    /// Expired entries are dropped as a side effect.
    pub fn recent(
        &self,
        thread_id: Uuid,
        recipient: Uuid,
        now: DateTime<Utc>,
    ) -> Vec<TypingNotification> {
        let ttl = chrono::Duration::seconds(TYPING_EVENT_TTL_SECS);
        let mut inner = self.inner.lock();
        let Some(thread) = inner.get_mut(&thread_id) else {
            return Vec::new();
        };
        thread.retain(|_, entry| now - entry.arrived <= ttl);
        thread
            .iter()
            .filter(|(sender, _)| **sender != recipient)
            .map(|(sender, entry)| TypingNotification {
                from_user_id: *sender,
                original_arrival_time: entry.arrived,
                recipient_id: recipient,
                thread_id,
                version: entry.version,
            })
            .collect()
    }
}

// ── Handlers ────────────────────────────────────────────────────────────

/// POST /threads/{threadId}/messages
///
/// Success is 201 with the assigned id. 429 when the sender is over the
/// send budget, 412 when the request's `If-Match` version no longer
/// matches the thread (membership changed concurrently) — both are
/// transient from the client's perspective and drive its retry policy.
pub async fn send_message(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    headers: HeaderMap,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    require_thread_member(&state, thread_id, claims.sub).await?;

    if !state.limiter.try_acquire(claims.sub) {
        warn!("sender {} over send budget on thread {}", claims.sub, thread_id);
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    let st = state.clone();
    let thread = tokio::task::spawn_blocking(move || st.db.get_thread(thread_id))
        .await
        .map_err(join_error)?
        .map_err(db_error)?
        .ok_or(StatusCode::NOT_FOUND)?;

    if let Some(expected) = if_match_version(&headers)? {
        if expected != thread.version {
            return Err(StatusCode::PRECONDITION_FAILED);
        }
    }

    if req.content.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let message_id = Uuid::new_v4();
    let created_on = Utc::now();
    let st = state.clone();
    tokio::task::spawn_blocking(move || {
        st.db.insert_message(&NewMessage {
            id: message_id,
            thread_id,
            sender_id: claims.sub,
            sender_display_name: &req.sender_display_name,
            message_type: req.message_type,
            content: &req.content,
            created_on,
        })
    })
    .await
    .map_err(join_error)?
    .map_err(db_error)?;

    Ok((StatusCode::CREATED, Json(SendMessageResponse { id: message_id })))
}

/// GET /threads/{threadId}/messages/{messageId}
pub async fn get_message(
    State(state): State<AppState>,
    Path((thread_id, message_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    require_thread_member(&state, thread_id, claims.sub).await?;

    let st = state.clone();
    let row = tokio::task::spawn_blocking(move || st.db.get_message(thread_id, message_id))
        .await
        .map_err(join_error)?
        .map_err(db_error)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let message = row.into_message().map_err(|e| {
        error!("corrupt message {}: {}", message_id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(message))
}

/// GET /threads/{threadId}/messages — newest-first page.
pub async fn list_messages(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    require_thread_member(&state, thread_id, claims.sub).await?;

    let limit = query.limit.min(200);
    let st = state.clone();
    let rows = tokio::task::spawn_blocking(move || st.db.list_messages(thread_id, limit))
        .await
        .map_err(join_error)?
        .map_err(db_error)?;

    let messages: Vec<_> = rows
        .into_iter()
        .filter_map(|row| match row.into_message() {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!("skipping corrupt message row: {}", e);
                None
            }
        })
        .collect();

    Ok(Json(messages))
}

/// POST /threads/{threadId}/typing
pub async fn post_typing(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<StatusCode, StatusCode> {
    require_thread_member(&state, thread_id, claims.sub).await?;
    state.typing.record(thread_id, claims.sub, Utc::now());
    Ok(StatusCode::ACCEPTED)
}

/// GET /threads/{threadId}/typing
pub async fn get_typing(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    require_thread_member(&state, thread_id, claims.sub).await?;
    Ok(Json(state.typing.recent(thread_id, claims.sub, Utc::now())))
}

/// POST /threads/{threadId}/readReceipts
pub async fn post_read_receipt(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendReadReceiptRequest>,
) -> Result<StatusCode, StatusCode> {
    require_thread_member(&state, thread_id, claims.sub).await?;

    let st = state.clone();
    tokio::task::spawn_blocking(move || {
        st.db
            .upsert_read_receipt(thread_id, claims.sub, req.message_id, Utc::now())
    })
    .await
    .map_err(join_error)?
    .map_err(db_error)?;

    Ok(StatusCode::CREATED)
}

/// GET /threads/{threadId}/readReceipts — latest receipt per reader.
pub async fn list_read_receipts(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    require_thread_member(&state, thread_id, claims.sub).await?;

    let st = state.clone();
    let rows = tokio::task::spawn_blocking(move || st.db.list_read_receipts(thread_id))
        .await
        .map_err(join_error)?
        .map_err(db_error)?;

    let receipts: Vec<_> = rows
        .into_iter()
        .filter_map(|row| match row.into_receipt() {
            Ok(receipt) => Some(receipt),
            Err(e) => {
                warn!("skipping corrupt read receipt row: {}", e);
                None
            }
        })
        .collect();

    Ok(Json(receipts))
}

/// GET /threads/{threadId}
pub async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    require_thread_member(&state, thread_id, claims.sub).await?;

    let st = state.clone();
    let row = tokio::task::spawn_blocking(move || st.db.get_thread(thread_id))
        .await
        .map_err(join_error)?
        .map_err(db_error)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let thread = row.into_thread().map_err(|e| {
        error!("corrupt thread {}: {}", thread_id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(thread))
}

/// GET /threads/{threadId}/members
pub async fn get_members(
    State(state): State<AppState>,
    Path(thread_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    require_thread_member(&state, thread_id, claims.sub).await?;

    let st = state.clone();
    let rows = tokio::task::spawn_blocking(move || st.db.list_thread_members(thread_id))
        .await
        .map_err(join_error)?
        .map_err(db_error)?;

    let members: Vec<_> = rows
        .into_iter()
        .filter_map(|row| match row.into_member() {
            Ok(member) => Some(member),
            Err(e) => {
                warn!("skipping corrupt member row: {}", e);
                None
            }
        })
        .collect();

    Ok(Json(members))
}

// ── Helpers ─────────────────────────────────────────────────────────────

async fn require_thread_member(
    state: &AppState,
    thread_id: Uuid,
    chat_user_id: Uuid,
) -> Result<(), StatusCode> {
    let st = state.clone();
    let is_member =
        tokio::task::spawn_blocking(move || st.db.is_thread_member(thread_id, chat_user_id))
            .await
            .map_err(join_error)?
            .map_err(db_error)?;

    if is_member {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

fn if_match_version(headers: &HeaderMap) -> Result<Option<i64>, StatusCode> {
    match headers.get(header::IF_MATCH) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .map(Some)
            .ok_or(StatusCode::BAD_REQUEST),
    }
}

fn join_error(e: tokio::task::JoinError) -> StatusCode {
    error!("spawn_blocking join error: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

fn db_error(e: anyhow::Error) -> StatusCode {
    error!("database error: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}
