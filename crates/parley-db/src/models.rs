//! Database row types — these map directly to SQLite rows.
//! Distinct from parley-types API models to keep the DB layer independent.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use parley_types::models::{
    Appointment, ChatMessage, ChatThread, FileMetadata, MemberRole, MessageType, ReadReceipt,
    ThreadMember, User,
};
use uuid::Uuid;

pub struct UserRow {
    pub user_id: String,
    pub chat_user_id: String,
    pub created_at: String,
}

pub struct AppointmentRow {
    pub appointment_id: String,
    pub chat_thread_id: String,
    pub moderator_user_id: String,
}

pub struct ThreadRow {
    pub id: String,
    pub topic: String,
    pub version: i64,
    pub created_at: String,
}

pub struct ThreadMemberRow {
    pub chat_user_id: String,
    pub display_name: String,
    pub role: String,
}

pub struct MessageRow {
    pub id: String,
    pub thread_id: String,
    pub sender_id: String,
    pub sender_display_name: String,
    pub message_type: String,
    pub content: String,
    pub created_on: String,
}

pub struct ReadReceiptRow {
    pub reader_id: String,
    pub message_id: String,
    pub read_on: String,
}

pub struct FileRow {
    pub id: String,
    pub group_id: String,
    pub name: String,
    pub upload_date_time: String,
}

/// SQLite stores timestamps either as RFC 3339 (written by us) or as
/// "YYYY-MM-DD HH:MM:SS" (written by datetime('now') defaults). Accept both.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>()
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .map_err(|e| anyhow!("corrupt timestamp '{}': {}", s, e))
}

impl UserRow {
    pub fn into_user(self) -> Result<User> {
        Ok(User {
            chat_user_id: self.chat_user_id.parse().context("corrupt chat_user_id")?,
            created_at: parse_timestamp(&self.created_at)?,
            user_id: self.user_id,
        })
    }
}

impl AppointmentRow {
    pub fn into_appointment(self) -> Result<Appointment> {
        Ok(Appointment {
            chat_thread_id: self.chat_thread_id.parse().context("corrupt chat_thread_id")?,
            moderator_user_id: self
                .moderator_user_id
                .parse()
                .context("corrupt moderator_user_id")?,
            appointment_id: self.appointment_id,
        })
    }
}

impl ThreadRow {
    pub fn into_thread(self) -> Result<ChatThread> {
        Ok(ChatThread {
            id: self.id.parse().context("corrupt thread id")?,
            topic: self.topic,
            version: self.version,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

impl ThreadMemberRow {
    pub fn into_member(self) -> Result<ThreadMember> {
        Ok(ThreadMember {
            chat_user_id: self.chat_user_id.parse().context("corrupt chat_user_id")?,
            role: MemberRole::parse(&self.role)
                .ok_or_else(|| anyhow!("unknown member role '{}'", self.role))?,
            display_name: self.display_name,
        })
    }
}

impl MessageRow {
    pub fn into_message(self) -> Result<ChatMessage> {
        Ok(ChatMessage {
            id: self.id.parse().context("corrupt message id")?,
            thread_id: self.thread_id.parse().context("corrupt thread_id")?,
            sender_id: self.sender_id.parse().context("corrupt sender_id")?,
            message_type: MessageType::parse(&self.message_type)
                .ok_or_else(|| anyhow!("unknown message type '{}'", self.message_type))?,
            created_on: parse_timestamp(&self.created_on)?,
            sender_display_name: self.sender_display_name,
            content: self.content,
        })
    }
}

impl ReadReceiptRow {
    pub fn into_receipt(self) -> Result<ReadReceipt> {
        Ok(ReadReceipt {
            reader_id: self.reader_id.parse().context("corrupt reader_id")?,
            message_id: self.message_id.parse().context("corrupt message_id")?,
            read_on: parse_timestamp(&self.read_on)?,
        })
    }
}

impl FileRow {
    pub fn into_metadata(self) -> Result<FileMetadata> {
        Ok(FileMetadata {
            id: self.id.parse().context("corrupt file id")?,
            upload_date_time: parse_timestamp(&self.upload_date_time)?,
            name: self.name,
        })
    }
}

/// New message ready for insertion. Ids are generated by the caller so the
/// HTTP layer can echo them back without a read-after-write.
pub struct NewMessage<'a> {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub sender_id: Uuid,
    pub sender_display_name: &'a str,
    pub message_type: MessageType,
    pub content: &'a str,
    pub created_on: DateTime<Utc>,
}
