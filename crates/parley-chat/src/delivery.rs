use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use parley_types::models::ChatMessage;
use tracing::{debug, error};
use uuid::Uuid;

use crate::backend::{ChatBackend, ChatError};

/// Bounded retry budget for conflict responses.
pub const MAXIMUM_RETRY_COUNT: u32 = 3;
/// Pause before retrying after the service throttles a send. Rate-limit
/// retries never count against the retry budget.
pub const RATE_LIMIT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Pause before retrying a conflicted send.
pub const CONFLICT_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Sent,
    Failed,
}

/// One entry in the message list. Locally submitted messages carry a
/// `client_message_id` correlating the optimistic entry with the server's
/// eventual confirmation; messages learned from the server carry none.
#[derive(Debug, Clone)]
pub struct TrackedMessage {
    pub client_message_id: Option<u64>,
    pub server_message_id: Option<Uuid>,
    pub thread_id: Uuid,
    pub sender_display_name: String,
    pub content: String,
    pub created_on: Option<DateTime<Utc>>,
    pub state: DeliveryState,
}

/// Chronological ordering: ascending `created_on`, with unconfirmed
/// messages (no timestamp yet) comparing greater so they float to the end.
pub fn compare_messages(a: &TrackedMessage, b: &TrackedMessage) -> Ordering {
    match (a.created_on, b.created_on) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(first), Some(second)) => first.cmp(&second),
    }
}

/// The message list plus the set of correlation ids handed out this
/// session. All mutation happens through these methods under one lock, so
/// a stale retry callback can never demote a message that already reached
/// a terminal state.
#[derive(Default)]
pub struct MessageRoster {
    entries: Vec<TrackedMessage>,
    issued: HashSet<u64>,
}

impl MessageRoster {
    /// Draws a fresh correlation id from the full u64 space. Ids are never
    /// reused within a session; zero is reserved so a default never aliases
    /// a real id.
    fn issue_id(&mut self) -> u64 {
        loop {
            let id = rand::random::<u64>();
            if id != 0 && self.issued.insert(id) {
                return id;
            }
        }
    }

    /// Appends an optimistic Pending entry and returns its correlation id.
    pub fn push_pending(
        &mut self,
        thread_id: Uuid,
        content: &str,
        sender_display_name: &str,
    ) -> u64 {
        let client_message_id = self.issue_id();
        self.entries.push(TrackedMessage {
            client_message_id: Some(client_message_id),
            server_message_id: None,
            thread_id,
            sender_display_name: sender_display_name.to_string(),
            content: content.to_string(),
            created_on: None,
            state: DeliveryState::Pending,
        });
        self.sort();
        client_message_id
    }

    /// Reconciles a Pending entry with the canonical server record.
    /// Returns false when the entry is unknown or already terminal.
    pub fn resolve_sent(&mut self, client_message_id: u64, msg: &ChatMessage) -> bool {
        self.resolve(client_message_id, msg.id, msg.created_on, Some(msg))
    }

    /// Fallback reconciliation when the canonical fetch failed: only the
    /// server id and a locally observed timestamp are known.
    pub fn resolve_sent_local(
        &mut self,
        client_message_id: u64,
        server_message_id: Uuid,
        created_on: DateTime<Utc>,
    ) -> bool {
        self.resolve(client_message_id, server_message_id, created_on, None)
    }

    fn resolve(
        &mut self,
        client_message_id: u64,
        server_message_id: Uuid,
        created_on: DateTime<Utc>,
        canonical: Option<&ChatMessage>,
    ) -> bool {
        // A poll may have pulled the same message down before this
        // confirmation landed; drop that copy in favor of the tracked entry.
        self.entries.retain(|e| {
            e.server_message_id != Some(server_message_id)
                || e.client_message_id == Some(client_message_id)
        });

        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.client_message_id == Some(client_message_id))
        else {
            return false;
        };
        if entry.state != DeliveryState::Pending {
            return false;
        }

        entry.server_message_id = Some(server_message_id);
        entry.created_on = Some(created_on);
        entry.state = DeliveryState::Sent;
        if let Some(msg) = canonical {
            entry.content = msg.content.clone();
            entry.sender_display_name = msg.sender_display_name.clone();
        }
        self.sort();
        true
    }

    /// Marks a Pending entry Failed. Returns false when the entry is
    /// unknown or already terminal.
    pub fn mark_failed(&mut self, client_message_id: u64) -> bool {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.client_message_id == Some(client_message_id))
        else {
            return false;
        };
        if entry.state != DeliveryState::Pending {
            return false;
        }
        entry.state = DeliveryState::Failed;
        true
    }

    /// Folds a server page into the list, skipping messages already
    /// tracked (by server id).
    pub fn merge_remote(&mut self, msgs: Vec<ChatMessage>) {
        let known: HashSet<Uuid> = self
            .entries
            .iter()
            .filter_map(|e| e.server_message_id)
            .collect();
        let mut changed = false;
        for msg in msgs {
            if known.contains(&msg.id) {
                continue;
            }
            self.entries.push(TrackedMessage {
                client_message_id: None,
                server_message_id: Some(msg.id),
                thread_id: msg.thread_id,
                sender_display_name: msg.sender_display_name,
                content: msg.content,
                created_on: Some(msg.created_on),
                state: DeliveryState::Sent,
            });
            changed = true;
        }
        if changed {
            self.sort();
        }
    }

    pub fn get(&self, client_message_id: u64) -> Option<&TrackedMessage> {
        self.entries
            .iter()
            .find(|e| e.client_message_id == Some(client_message_id))
    }

    pub fn snapshot(&self) -> Vec<TrackedMessage> {
        self.entries.clone()
    }

    fn sort(&mut self) {
        // Stable sort keeps submission order among still-pending entries.
        self.entries.sort_by(compare_messages);
    }
}

/// Owns the lifecycle of outgoing messages: optimistic append, async
/// delivery, retry policy, and reconciliation against the server record.
pub struct DeliveryManager<B: ChatBackend> {
    backend: Arc<B>,
    thread_id: Uuid,
    sender_display_name: String,
    roster: Arc<Mutex<MessageRoster>>,
    cooldown: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl<B: ChatBackend> DeliveryManager<B> {
    pub fn new(backend: Arc<B>, thread_id: Uuid, sender_display_name: impl Into<String>) -> Self {
        Self {
            backend,
            thread_id,
            sender_display_name: sender_display_name.into(),
            roster: Arc::new(Mutex::new(MessageRoster::default())),
            cooldown: Arc::new(Mutex::new(None)),
        }
    }

    /// Shared handle to the message list, for callers that fold in polled
    /// server pages.
    pub fn roster(&self) -> Arc<Mutex<MessageRoster>> {
        self.roster.clone()
    }

    /// Appends a Pending entry, kicks off async delivery, and returns the
    /// correlation id immediately. Never blocks on network I/O.
    pub fn submit(&self, content: &str) -> u64 {
        let client_message_id =
            self.roster
                .lock()
                .push_pending(self.thread_id, content, &self.sender_display_name);

        tokio::spawn(deliver(
            self.backend.clone(),
            self.roster.clone(),
            self.cooldown.clone(),
            self.thread_id,
            content.to_string(),
            self.sender_display_name.clone(),
            client_message_id,
        ));

        client_message_id
    }

    /// When the service last throttled us, for a "please wait" indicator.
    pub fn cooldown_started(&self) -> Option<DateTime<Utc>> {
        *self.cooldown.lock()
    }

    pub fn snapshot(&self) -> Vec<TrackedMessage> {
        self.roster.lock().snapshot()
    }
}

/// Delivery loop for a single message. Terminal states are reached by a
/// confirmed send, by exhausting the conflict budget, or by any unexpected
/// error; throttling is paced but never terminal.
async fn deliver<B: ChatBackend>(
    backend: Arc<B>,
    roster: Arc<Mutex<MessageRoster>>,
    cooldown: Arc<Mutex<Option<DateTime<Utc>>>>,
    thread_id: Uuid,
    content: String,
    sender_display_name: String,
    client_message_id: u64,
) {
    let mut attempt: u32 = 0;
    loop {
        match backend
            .send_message(thread_id, &content, &sender_display_name)
            .await
        {
            Ok(server_message_id) => {
                // Best-effort canonical fetch; fall back to what we know
                // locally if it fails.
                match backend.get_message(thread_id, server_message_id).await {
                    Ok(msg) => {
                        roster.lock().resolve_sent(client_message_id, &msg);
                    }
                    Err(e) => {
                        debug!(
                            "canonical fetch for message {} failed, using local record: {}",
                            server_message_id, e
                        );
                        roster.lock().resolve_sent_local(
                            client_message_id,
                            server_message_id,
                            Utc::now(),
                        );
                    }
                }
                return;
            }
            Err(ChatError::RateLimited) => {
                *cooldown.lock() = Some(Utc::now());
                debug!(
                    "send throttled, retrying message {} in {:?}",
                    client_message_id, RATE_LIMIT_RETRY_DELAY
                );
                tokio::time::sleep(RATE_LIMIT_RETRY_DELAY).await;
            }
            Err(ChatError::PreconditionFailed) => {
                if attempt >= MAXIMUM_RETRY_COUNT {
                    error!(
                        "message {} still conflicted after {} retries, giving up",
                        client_message_id, attempt
                    );
                    roster.lock().mark_failed(client_message_id);
                    return;
                }
                attempt += 1;
                tokio::time::sleep(CONFLICT_RETRY_DELAY).await;
            }
            Err(e) => {
                error!("failed to send message {}: {}", client_message_id, e);
                roster.lock().mark_failed(client_message_id);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockBackend, SendScript, ts, wait_until};
    use std::collections::HashSet;

    #[tokio::test(start_paused = true)]
    async fn created_response_reconciles_canonical_record() {
        let backend = Arc::new(MockBackend::new(SendScript::always_created()));
        backend.set_canonical_time(ts(100));

        let manager = DeliveryManager::new(backend.clone(), backend.thread_id, "Alice");
        let id = manager.submit("hello");

        wait_until(|| {
            manager
                .roster()
                .lock()
                .get(id)
                .is_some_and(|m| m.state == DeliveryState::Sent)
        })
        .await;

        let messages = manager.snapshot();
        assert_eq!(messages.len(), 1);
        let msg = &messages[0];
        assert_eq!(msg.content, "hello");
        assert!(msg.server_message_id.is_some());
        assert_eq!(msg.created_on, Some(ts(100)));
        assert_eq!(backend.send_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_exhausts_bounded_retry_budget() {
        let backend = Arc::new(MockBackend::new(SendScript::always_precondition_failed()));
        let manager = DeliveryManager::new(backend.clone(), backend.thread_id, "Alice");
        let id = manager.submit("hello");

        wait_until(|| {
            manager
                .roster()
                .lock()
                .get(id)
                .is_some_and(|m| m.state == DeliveryState::Failed)
        })
        .await;

        // One initial attempt plus the bounded retries, then nothing more.
        assert_eq!(backend.send_calls(), 1 + MAXIMUM_RETRY_COUNT);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.send_calls(), 1 + MAXIMUM_RETRY_COUNT);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiting_is_retried_until_it_clears() {
        let backend = Arc::new(MockBackend::new(SendScript::rate_limited_then_created(6)));
        backend.set_canonical_time(ts(50));

        let manager = DeliveryManager::new(backend.clone(), backend.thread_id, "Alice");
        let id = manager.submit("hello");

        wait_until(|| {
            manager
                .roster()
                .lock()
                .get(id)
                .is_some_and(|m| m.state == DeliveryState::Sent)
        })
        .await;

        assert_eq!(backend.send_calls(), 7);
        assert!(manager.cooldown_started().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiting_alone_never_fails_a_message() {
        let backend = Arc::new(MockBackend::new(SendScript::always_rate_limited()));
        let manager = DeliveryManager::new(backend.clone(), backend.thread_id, "Alice");
        let id = manager.submit("hello");

        tokio::time::sleep(Duration::from_secs(30)).await;

        let roster = manager.roster();
        let roster = roster.lock();
        let msg = roster.get(id).expect("message tracked");
        assert_eq!(msg.state, DeliveryState::Pending);
        assert!(backend.send_calls() > 5);
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_error_is_immediately_terminal() {
        let backend = Arc::new(MockBackend::new(SendScript::always_unexpected()));
        let manager = DeliveryManager::new(backend.clone(), backend.thread_id, "Alice");
        let id = manager.submit("hello");

        wait_until(|| {
            manager
                .roster()
                .lock()
                .get(id)
                .is_some_and(|m| m.state == DeliveryState::Failed)
        })
        .await;

        assert_eq!(backend.send_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn correlation_ids_are_unique_within_a_session() {
        let backend = Arc::new(MockBackend::new(SendScript::always_unexpected()));
        let manager = DeliveryManager::new(backend.clone(), backend.thread_id, "Alice");

        let ids: HashSet<u64> = (0..200).map(|_| manager.submit("x")).collect();
        assert_eq!(ids.len(), 200);
        assert!(!ids.contains(&0));
    }

    #[tokio::test(start_paused = true)]
    async fn canonical_fetch_failure_falls_back_to_local_record() {
        let backend = Arc::new(MockBackend::new(SendScript::always_created()));
        // No canonical time configured: get_message returns NotFound.

        let manager = DeliveryManager::new(backend.clone(), backend.thread_id, "Alice");
        let id = manager.submit("hello");

        wait_until(|| {
            manager
                .roster()
                .lock()
                .get(id)
                .is_some_and(|m| m.state == DeliveryState::Sent)
        })
        .await;

        let roster = manager.roster();
        let roster = roster.lock();
        let msg = roster.get(id).expect("message tracked");
        assert!(msg.server_message_id.is_some());
        assert!(msg.created_on.is_some());
    }

    #[test]
    fn stale_retry_cannot_demote_a_terminal_message() {
        let mut roster = MessageRoster::default();
        let thread_id = Uuid::new_v4();
        let id = roster.push_pending(thread_id, "hello", "Alice");

        assert!(roster.resolve_sent_local(id, Uuid::new_v4(), ts(10)));
        // A retry callback racing the confirmation observes the terminal
        // state and leaves it alone.
        assert!(!roster.mark_failed(id));
        assert_eq!(roster.get(id).unwrap().state, DeliveryState::Sent);

        let failed = roster.push_pending(thread_id, "second", "Alice");
        assert!(roster.mark_failed(failed));
        assert!(!roster.resolve_sent_local(failed, Uuid::new_v4(), ts(20)));
        assert_eq!(roster.get(failed).unwrap().state, DeliveryState::Failed);
    }

    #[test]
    fn unconfirmed_messages_sort_after_confirmed() {
        let mut roster = MessageRoster::default();
        let thread_id = Uuid::new_v4();

        let pending = roster.push_pending(thread_id, "pending", "Alice");
        let confirmed = roster.push_pending(thread_id, "confirmed", "Alice");
        assert!(roster.resolve_sent_local(confirmed, Uuid::new_v4(), ts(50)));

        let order: Vec<_> = roster.snapshot().iter().map(|m| m.content.clone()).collect();
        assert_eq!(order, vec!["confirmed", "pending"]);
        // and the pending entry still holds its place at the end
        assert_eq!(roster.get(pending).unwrap().state, DeliveryState::Pending);
    }

    #[test]
    fn merge_remote_skips_already_tracked_messages() {
        let mut roster = MessageRoster::default();
        let thread_id = Uuid::new_v4();
        let id = roster.push_pending(thread_id, "hello", "Alice");
        let server_id = Uuid::new_v4();
        assert!(roster.resolve_sent_local(id, server_id, ts(10)));

        roster.merge_remote(vec![parley_types::models::ChatMessage {
            id: server_id,
            thread_id,
            sender_id: Uuid::new_v4(),
            sender_display_name: "Alice".into(),
            message_type: parley_types::models::MessageType::Text,
            content: "hello".into(),
            created_on: ts(10),
        }]);

        assert_eq!(roster.snapshot().len(), 1);
    }
}
