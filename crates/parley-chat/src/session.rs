use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use parley_types::models::{ReadReceipt, ThreadMember};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::backend::{ChatBackend, ChatError};
use crate::delivery::{DeliveryManager, MessageRoster, TrackedMessage};
use crate::typing::TypingTracker;

/// How many messages to pull when seeding and refreshing the list.
pub const INITIAL_MESSAGES_SIZE: u32 = 100;
/// Cadence of the message refresh loop.
pub const MESSAGE_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Cadence of the typing/member/receipt refresh loop.
pub const TYPING_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Outgoing typing notifications are sent at most this often.
pub const TYPING_SEND_COOLDOWN: Duration = Duration::from_millis(500);

/// A connected view of one chat thread: the delivery manager for outgoing
/// messages, the typing aggregator, and the polling loops that keep both
/// fed. Dropping the session cancels its loops.
pub struct ChatSession<B: ChatBackend> {
    backend: Arc<B>,
    thread_id: Uuid,
    delivery: DeliveryManager<B>,
    roster: Arc<Mutex<MessageRoster>>,
    typing: Arc<Mutex<TypingTracker>>,
    members: Arc<Mutex<Vec<ThreadMember>>>,
    receipts: Arc<Mutex<Vec<ReadReceipt>>>,
    last_typing_sent: Mutex<Option<Instant>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<B: ChatBackend> ChatSession<B> {
    /// Seeds the message list and member roster, then starts the refresh
    /// loops.
    pub async fn connect(
        backend: Arc<B>,
        thread_id: Uuid,
        sender_display_name: impl Into<String>,
    ) -> Result<Self, ChatError> {
        let delivery = DeliveryManager::new(backend.clone(), thread_id, sender_display_name);
        let roster = delivery.roster();

        let initial = backend.list_messages(thread_id, INITIAL_MESSAGES_SIZE).await?;
        roster.lock().merge_remote(initial);

        let members = Arc::new(Mutex::new(backend.list_members(thread_id).await?));
        let typing = Arc::new(Mutex::new(TypingTracker::new()));
        let receipts = Arc::new(Mutex::new(Vec::new()));

        let tasks = vec![
            tokio::spawn(message_poll_loop(backend.clone(), roster.clone(), thread_id)),
            tokio::spawn(typing_poll_loop(
                backend.clone(),
                typing.clone(),
                members.clone(),
                receipts.clone(),
                thread_id,
            )),
        ];

        Ok(Self {
            backend,
            thread_id,
            delivery,
            roster,
            typing,
            members,
            receipts,
            last_typing_sent: Mutex::new(None),
            tasks,
        })
    }

    /// Submits a message for delivery and returns its correlation id.
    pub fn send_message(&self, content: &str) -> u64 {
        self.delivery.submit(content)
    }

    /// Sends a typing notification, debounced so a burst of keystrokes
    /// produces at most one notification per cooldown window.
    pub async fn notify_typing(&self) -> Result<(), ChatError> {
        {
            let mut last = self.last_typing_sent.lock();
            if let Some(at) = *last {
                if at.elapsed() < TYPING_SEND_COOLDOWN {
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }
        self.backend.send_typing(self.thread_id).await
    }

    pub async fn mark_read(&self, message_id: Uuid) -> Result<(), ChatError> {
        self.backend
            .send_read_receipt(self.thread_id, message_id)
            .await
    }

    /// Current message list in display order.
    pub fn messages(&self) -> Vec<TrackedMessage> {
        self.roster.lock().snapshot()
    }

    /// Members currently typing, resolved against the latest member list.
    pub fn typing_users(&self) -> Vec<ThreadMember> {
        self.typing
            .lock()
            .active_typists(Utc::now(), &self.members.lock())
    }

    pub fn members(&self) -> Vec<ThreadMember> {
        self.members.lock().clone()
    }

    pub fn read_receipts(&self) -> Vec<ReadReceipt> {
        self.receipts.lock().clone()
    }

    pub fn cooldown_started(&self) -> Option<chrono::DateTime<Utc>> {
        self.delivery.cooldown_started()
    }
}

impl<B: ChatBackend> Drop for ChatSession<B> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn message_poll_loop<B: ChatBackend>(
    backend: Arc<B>,
    roster: Arc<Mutex<MessageRoster>>,
    thread_id: Uuid,
) {
    let mut interval = tokio::time::interval(MESSAGE_POLL_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        match backend.list_messages(thread_id, INITIAL_MESSAGES_SIZE).await {
            Ok(msgs) => roster.lock().merge_remote(msgs),
            Err(e) => warn!("message refresh failed: {}", e),
        }
    }
}

async fn typing_poll_loop<B: ChatBackend>(
    backend: Arc<B>,
    typing: Arc<Mutex<TypingTracker>>,
    members: Arc<Mutex<Vec<ThreadMember>>>,
    receipts: Arc<Mutex<Vec<ReadReceipt>>>,
    thread_id: Uuid,
) {
    let mut interval = tokio::time::interval(TYPING_POLL_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;

        match backend.list_typing(thread_id).await {
            Ok(events) => {
                let mut tracker = typing.lock();
                for event in events {
                    tracker.record(event);
                }
                tracker.prune(Utc::now());
            }
            Err(e) => warn!("typing refresh failed: {}", e),
        }

        match backend.list_members(thread_id).await {
            Ok(current) => *members.lock() = current,
            Err(e) => warn!("member refresh failed: {}", e),
        }

        match backend.list_read_receipts(thread_id).await {
            Ok(current) => *receipts.lock() = current,
            Err(e) => warn!("read receipt refresh failed: {}", e),
        }
    }
}
