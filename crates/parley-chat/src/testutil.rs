//! Scripted chat backend used by the delivery and session tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use parley_types::models::{
    ChatMessage, MessageType, ReadReceipt, ThreadMember, TypingNotification,
};
use uuid::Uuid;

use crate::backend::{ChatBackend, ChatError};

#[derive(Debug, Clone, Copy)]
pub enum SendStep {
    Created,
    RateLimited,
    PreconditionFailed,
    Unexpected,
}

/// A finite prefix of scripted responses followed by a repeating tail.
pub struct SendScript {
    steps: VecDeque<SendStep>,
    tail: SendStep,
}

impl SendScript {
    pub fn always_created() -> Self {
        Self {
            steps: VecDeque::new(),
            tail: SendStep::Created,
        }
    }

    pub fn always_rate_limited() -> Self {
        Self {
            steps: VecDeque::new(),
            tail: SendStep::RateLimited,
        }
    }

    pub fn always_precondition_failed() -> Self {
        Self {
            steps: VecDeque::new(),
            tail: SendStep::PreconditionFailed,
        }
    }

    pub fn always_unexpected() -> Self {
        Self {
            steps: VecDeque::new(),
            tail: SendStep::Unexpected,
        }
    }

    pub fn rate_limited_then_created(throttled: usize) -> Self {
        Self {
            steps: std::iter::repeat(SendStep::RateLimited).take(throttled).collect(),
            tail: SendStep::Created,
        }
    }

    fn next(&mut self) -> SendStep {
        self.steps.pop_front().unwrap_or(self.tail)
    }
}

pub struct MockBackend {
    pub thread_id: Uuid,
    script: Mutex<SendScript>,
    send_calls: AtomicU32,
    typing_calls: AtomicU32,
    /// When set, confirmed sends get a canonical record with this
    /// timestamp; when unset, get_message returns NotFound.
    canonical_time: Mutex<Option<DateTime<Utc>>>,
    confirmed: Mutex<Vec<ChatMessage>>,
    remote_messages: Mutex<Vec<ChatMessage>>,
    members: Mutex<Vec<ThreadMember>>,
    typing_events: Mutex<Vec<TypingNotification>>,
}

impl MockBackend {
    pub fn new(script: SendScript) -> Self {
        Self {
            thread_id: Uuid::new_v4(),
            script: Mutex::new(script),
            send_calls: AtomicU32::new(0),
            typing_calls: AtomicU32::new(0),
            canonical_time: Mutex::new(None),
            confirmed: Mutex::new(Vec::new()),
            remote_messages: Mutex::new(Vec::new()),
            members: Mutex::new(Vec::new()),
            typing_events: Mutex::new(Vec::new()),
        }
    }

    pub fn set_canonical_time(&self, at: DateTime<Utc>) {
        *self.canonical_time.lock() = Some(at);
    }

    pub fn send_calls(&self) -> u32 {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub fn typing_calls(&self) -> u32 {
        self.typing_calls.load(Ordering::SeqCst)
    }

    pub fn push_remote_message(&self, msg: ChatMessage) {
        self.remote_messages.lock().push(msg);
    }

    pub fn set_members(&self, members: Vec<ThreadMember>) {
        *self.members.lock() = members;
    }

    pub fn push_typing_event(&self, event: TypingNotification) {
        self.typing_events.lock().push(event);
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn send_message(
        &self,
        thread_id: Uuid,
        content: &str,
        sender_display_name: &str,
    ) -> Result<Uuid, ChatError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().next() {
            SendStep::Created => {
                let id = Uuid::new_v4();
                if let Some(at) = *self.canonical_time.lock() {
                    self.confirmed.lock().push(ChatMessage {
                        id,
                        thread_id,
                        sender_id: Uuid::new_v4(),
                        sender_display_name: sender_display_name.to_string(),
                        message_type: MessageType::Text,
                        content: content.to_string(),
                        created_on: at,
                    });
                }
                Ok(id)
            }
            SendStep::RateLimited => Err(ChatError::RateLimited),
            SendStep::PreconditionFailed => Err(ChatError::PreconditionFailed),
            SendStep::Unexpected => Err(ChatError::Unexpected("boom".into())),
        }
    }

    async fn get_message(
        &self,
        _thread_id: Uuid,
        message_id: Uuid,
    ) -> Result<ChatMessage, ChatError> {
        self.confirmed
            .lock()
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
            .ok_or(ChatError::NotFound)
    }

    async fn list_messages(
        &self,
        _thread_id: Uuid,
        _limit: u32,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let mut msgs = self.remote_messages.lock().clone();
        msgs.extend(self.confirmed.lock().iter().cloned());
        Ok(msgs)
    }

    async fn send_typing(&self, _thread_id: Uuid) -> Result<(), ChatError> {
        self.typing_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_typing(&self, _thread_id: Uuid) -> Result<Vec<TypingNotification>, ChatError> {
        Ok(self.typing_events.lock().clone())
    }

    async fn send_read_receipt(
        &self,
        _thread_id: Uuid,
        _message_id: Uuid,
    ) -> Result<(), ChatError> {
        Ok(())
    }

    async fn list_read_receipts(&self, _thread_id: Uuid) -> Result<Vec<ReadReceipt>, ChatError> {
        Ok(Vec::new())
    }

    async fn list_members(&self, _thread_id: Uuid) -> Result<Vec<ThreadMember>, ChatError> {
        Ok(self.members.lock().clone())
    }
}

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// Polls a predicate under the paused test clock until it holds.
pub async fn wait_until(mut pred: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}
