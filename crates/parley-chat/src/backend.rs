use async_trait::async_trait;
use parley_types::models::{ChatMessage, ReadReceipt, ThreadMember, TypingNotification};
use thiserror::Error;
use uuid::Uuid;

/// Failure taxonomy for chat-service calls. Only `RateLimited` and
/// `PreconditionFailed` are transient from the delivery manager's point of
/// view; everything else is terminal for the message being sent.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("rate limited by the chat service")]
    RateLimited,
    #[error("precondition failed")]
    PreconditionFailed,
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("chat service error: {0}")]
    Unexpected(String),
}

/// Seam to the chat service. The delivery manager, typing aggregator, and
/// session are all written against this trait so they can run against the
/// HTTP implementation in production and a scripted mock in tests.
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    /// Posts a message and returns the server-assigned id.
    async fn send_message(
        &self,
        thread_id: Uuid,
        content: &str,
        sender_display_name: &str,
    ) -> Result<Uuid, ChatError>;

    /// Fetches the canonical record for a message the server confirmed.
    async fn get_message(&self, thread_id: Uuid, message_id: Uuid)
    -> Result<ChatMessage, ChatError>;

    /// Newest-first page of messages.
    async fn list_messages(&self, thread_id: Uuid, limit: u32)
    -> Result<Vec<ChatMessage>, ChatError>;

    async fn send_typing(&self, thread_id: Uuid) -> Result<(), ChatError>;

    async fn list_typing(&self, thread_id: Uuid) -> Result<Vec<TypingNotification>, ChatError>;

    async fn send_read_receipt(&self, thread_id: Uuid, message_id: Uuid)
    -> Result<(), ChatError>;

    async fn list_read_receipts(&self, thread_id: Uuid) -> Result<Vec<ReadReceipt>, ChatError>;

    async fn list_members(&self, thread_id: Uuid) -> Result<Vec<ThreadMember>, ChatError>;
}
