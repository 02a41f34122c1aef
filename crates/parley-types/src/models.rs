use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Mapping from an external identity (whatever the caller authenticates
/// with) to the chat-service identity issued on first token request.
/// Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub chat_user_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A group's durable chat-thread binding. Created at most once per group;
/// the moderator identity owns the thread and manages its membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub appointment_id: String,
    pub chat_thread_id: Uuid,
    pub moderator_user_id: Uuid,
}

/// Join record gating group-scoped file and chat operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppointmentUser {
    pub user_id: String,
    pub appointment_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: Uuid,
    pub name: String,
    pub upload_date_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Moderator,
    User,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Moderator => "moderator",
            Self::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "moderator" => Some(Self::Moderator),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMember {
    pub chat_user_id: Uuid,
    pub display_name: String,
    pub role: MemberRole,
}

/// `version` bumps on every membership change and backs the optimistic
/// concurrency check on message sends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatThread {
    pub id: Uuid,
    pub topic: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    /// Structured system messages (e.g. a file-upload announcement); the
    /// content field carries a JSON payload.
    Event,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "event" => Some(Self::Event),
            _ => None,
        }
    }
}

/// A server-confirmed chat message as stored in a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub sender_id: Uuid,
    pub sender_display_name: String,
    pub message_type: MessageType,
    pub content: String,
    pub created_on: DateTime<Utc>,
}

/// Ephemeral typing event. Keyed by sender; each new event overwrites the
/// previous one and ages out of the "currently typing" view after a fixed
/// interval from `original_arrival_time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingNotification {
    pub from_user_id: Uuid,
    pub original_arrival_time: DateTime<Utc>,
    pub recipient_id: Uuid,
    pub thread_id: Uuid,
    pub version: i64,
}

/// Latest read position per reader in a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub reader_id: Uuid,
    pub message_id: Uuid,
    pub read_on: DateTime<Utc>,
}
