use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// A persisted direct message between two users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Inbox row: the latest activity with one counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub other_user_id: Uuid,
    pub other_user_name: String,
    pub other_user_avatar: Option<String>,
    pub last_message: String,
    pub last_message_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMessages {
    pub messages: Vec<MessageRecord>,
    pub total: i64,
}

/// Request body for `POST /messages`.
///
/// Fields are optional strings so that a missing or malformed value can be
/// reported against the field name instead of as a generic decode failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewMessage {
    pub receiver_id: Option<String>,
    pub content: Option<String>,
}

/// A message that passed validation and is ready to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
}

impl NewMessage {
    pub fn validate(self, sender_id: Uuid, max_content_chars: usize) -> AppResult<OutgoingMessage> {
        let receiver_id = parse_user_id("receiver_id", self.receiver_id.as_deref())?;
        if receiver_id == sender_id {
            return Err(AppError::validation("receiver_id must differ from the sender"));
        }

        let content = self
            .content
            .ok_or_else(|| AppError::validation("content is required"))?;
        if content.trim().is_empty() {
            return Err(AppError::validation("content must not be empty"));
        }
        if content.chars().count() > max_content_chars {
            return Err(AppError::validation(format!(
                "content must be at most {} characters",
                max_content_chars
            )));
        }

        Ok(OutgoingMessage {
            sender_id,
            receiver_id,
            content,
        })
    }
}

/// Parse a user identifier supplied by the client, naming the field on failure.
pub fn parse_user_id(field: &str, raw: Option<&str>) -> AppResult<Uuid> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::validation(format!("{} is required", field)))?;

    Uuid::parse_str(raw).map_err(|_| AppError::validation(format!("{} must be a UUID", field)))
}

/// Parse the optional `limit` query parameter. Only positive integers pass.
pub fn parse_limit(raw: Option<&str>) -> AppResult<Option<u32>> {
    let Some(raw) = raw else {
        return Ok(None);
    };

    match raw.trim().parse::<u32>() {
        Ok(0) | Err(_) => Err(AppError::validation("limit must be a positive integer")),
        Ok(n) => Ok(Some(n)),
    }
}

pub fn parse_idempotency_key(raw: &str) -> AppResult<String> {
    let valid = !raw.is_empty()
        && raw.len() <= MAX_IDEMPOTENCY_KEY_LEN
        && raw.bytes().all(|b| b.is_ascii_graphic());

    if valid {
        Ok(raw.to_string())
    } else {
        Err(AppError::validation(format!(
            "Idempotency-Key must be 1-{} visible ASCII characters",
            MAX_IDEMPOTENCY_KEY_LEN
        )))
    }
}
