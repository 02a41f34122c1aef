use async_trait::async_trait;
use parking_lot::Mutex;
use parley_types::api::{SendMessageRequest, SendMessageResponse, SendReadReceiptRequest};
use parley_types::models::{
    ChatMessage, ChatThread, MessageType, ReadReceipt, ThreadMember, TypingNotification,
};
use reqwest::StatusCode;
use tracing::debug;
use uuid::Uuid;

use crate::backend::{ChatBackend, ChatError};

/// `ChatBackend` over the chat service's REST surface, authenticated with
/// the service-issued bearer token.
///
/// Sends carry an `If-Match` header with the last observed thread version;
/// the service answers 412 when membership changed underneath us, in which
/// case the cached version is refreshed so the delivery manager's retry
/// uses a current one.
pub struct HttpChatBackend {
    http: reqwest::Client,
    base_url: String,
    token: String,
    thread_version: Mutex<Option<i64>>,
}

impl HttpChatBackend {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
            token: token.into(),
            thread_version: Mutex::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn fetch_thread(&self, thread_id: Uuid) -> Result<ChatThread, ChatError> {
        let resp = self
            .http
            .get(self.url(&format!("/threads/{}", thread_id)))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;

        if !resp.status().is_success() {
            return Err(error_for_status(resp.status()));
        }
        let thread: ChatThread = resp.json().await.map_err(transport)?;
        *self.thread_version.lock() = Some(thread.version);
        Ok(thread)
    }

    async fn current_version(&self, thread_id: Uuid) -> Result<i64, ChatError> {
        if let Some(version) = *self.thread_version.lock() {
            return Ok(version);
        }
        Ok(self.fetch_thread(thread_id).await?.version)
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn send_message(
        &self,
        thread_id: Uuid,
        content: &str,
        sender_display_name: &str,
    ) -> Result<Uuid, ChatError> {
        let version = self.current_version(thread_id).await?;

        let resp = self
            .http
            .post(self.url(&format!("/threads/{}/messages", thread_id)))
            .bearer_auth(&self.token)
            .header(reqwest::header::IF_MATCH, version.to_string())
            .json(&SendMessageRequest {
                content: content.to_string(),
                sender_display_name: sender_display_name.to_string(),
                message_type: MessageType::Text,
            })
            .send()
            .await
            .map_err(transport)?;

        match resp.status() {
            StatusCode::CREATED => {
                let body: SendMessageResponse = resp.json().await.map_err(transport)?;
                Ok(body.id)
            }
            StatusCode::PRECONDITION_FAILED => {
                // Membership moved the version; pick up the current one so
                // the next retry has a fresh precondition.
                debug!("thread {} version {} is stale, refreshing", thread_id, version);
                *self.thread_version.lock() = None;
                if let Err(e) = self.fetch_thread(thread_id).await {
                    debug!("thread version refresh failed: {}", e);
                }
                Err(ChatError::PreconditionFailed)
            }
            status => Err(error_for_status(status)),
        }
    }

    async fn get_message(
        &self,
        thread_id: Uuid,
        message_id: Uuid,
    ) -> Result<ChatMessage, ChatError> {
        let resp = self
            .http
            .get(self.url(&format!("/threads/{}/messages/{}", thread_id, message_id)))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;

        if !resp.status().is_success() {
            return Err(error_for_status(resp.status()));
        }
        resp.json().await.map_err(transport)
    }

    async fn list_messages(
        &self,
        thread_id: Uuid,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let resp = self
            .http
            .get(self.url(&format!("/threads/{}/messages", thread_id)))
            .query(&[("limit", limit)])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;

        if !resp.status().is_success() {
            return Err(error_for_status(resp.status()));
        }
        resp.json().await.map_err(transport)
    }

    async fn send_typing(&self, thread_id: Uuid) -> Result<(), ChatError> {
        let resp = self
            .http
            .post(self.url(&format!("/threads/{}/typing", thread_id)))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;

        if !resp.status().is_success() {
            return Err(error_for_status(resp.status()));
        }
        Ok(())
    }

    async fn list_typing(&self, thread_id: Uuid) -> Result<Vec<TypingNotification>, ChatError> {
        let resp = self
            .http
            .get(self.url(&format!("/threads/{}/typing", thread_id)))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;

        if !resp.status().is_success() {
            return Err(error_for_status(resp.status()));
        }
        resp.json().await.map_err(transport)
    }

    async fn send_read_receipt(
        &self,
        thread_id: Uuid,
        message_id: Uuid,
    ) -> Result<(), ChatError> {
        let resp = self
            .http
            .post(self.url(&format!("/threads/{}/readReceipts", thread_id)))
            .bearer_auth(&self.token)
            .json(&SendReadReceiptRequest { message_id })
            .send()
            .await
            .map_err(transport)?;

        if !resp.status().is_success() {
            return Err(error_for_status(resp.status()));
        }
        Ok(())
    }

    async fn list_read_receipts(&self, thread_id: Uuid) -> Result<Vec<ReadReceipt>, ChatError> {
        let resp = self
            .http
            .get(self.url(&format!("/threads/{}/readReceipts", thread_id)))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;

        if !resp.status().is_success() {
            return Err(error_for_status(resp.status()));
        }
        resp.json().await.map_err(transport)
    }

    async fn list_members(&self, thread_id: Uuid) -> Result<Vec<ThreadMember>, ChatError> {
        let resp = self
            .http
            .get(self.url(&format!("/threads/{}/members", thread_id)))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport)?;

        if !resp.status().is_success() {
            return Err(error_for_status(resp.status()));
        }
        resp.json().await.map_err(transport)
    }
}

fn error_for_status(status: StatusCode) -> ChatError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ChatError::RateLimited,
        StatusCode::PRECONDITION_FAILED => ChatError::PreconditionFailed,
        StatusCode::NOT_FOUND => ChatError::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ChatError::Unauthorized,
        status => ChatError::Unexpected(format!("unexpected status {}", status)),
    }
}

fn transport(e: reqwest::Error) -> ChatError {
    ChatError::Unexpected(e.to_string())
}
