use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::MessageType;

// -- JWT Claims --

/// Claims carried by the service-issued chat token. Canonical definition
/// lives here so the API middleware and the client agree on the format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Chat-service user id.
    pub sub: Uuid,
    /// Display name baked into the token at issuance.
    pub name: String,
    /// "moderator" or "user".
    pub role: String,
    pub exp: usize,
}

// -- Tokens --

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_on: DateTime<Utc>,
    pub user_id: Uuid,
}

// -- Threads --

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatThreadResponse {
    pub thread_id: Uuid,
}

// -- Messages --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
    pub sender_display_name: String,
    #[serde(default = "default_message_type")]
    pub message_type: MessageType,
}

fn default_message_type() -> MessageType {
    MessageType::Text
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub id: Uuid,
}

// -- Read receipts --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendReadReceiptRequest {
    pub message_id: Uuid,
}

// -- Files --

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadFileResponse {
    pub id: Uuid,
    pub name: String,
    pub upload_date_time: DateTime<Utc>,
}

/// JSON payload of the `event` chat message posted after a file upload.
#[derive(Debug, Serialize, Deserialize)]
pub struct FileUploadedEvent {
    pub event: String,
    pub file_id: Uuid,
    pub file_name: String,
}

impl FileUploadedEvent {
    pub const EVENT_NAME: &'static str = "fileUploaded";

    pub fn new(file_id: Uuid, file_name: impl Into<String>) -> Self {
        Self {
            event: Self::EVENT_NAME.to_string(),
            file_id,
            file_name: file_name.into(),
        }
    }
}
