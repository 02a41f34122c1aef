use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parley_types::models::{ThreadMember, TypingNotification};
use uuid::Uuid;

/// How long a typing event keeps its sender in the "currently typing"
/// view, measured from the event's original arrival time.
pub const MINIMUM_TYPING_INTERVAL_SECS: i64 = 8;

/// Maintains the "who is currently typing" view from a stream of typing
/// events. Events are keyed by sender and unconditionally overwritten;
/// expiry is evaluated lazily by the caller's polling cadence, not by an
/// internal timer.
#[derive(Default)]
pub struct TypingTracker {
    notifications: HashMap<Uuid, TypingNotification>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts the sender's latest typing event.
    pub fn record(&mut self, notification: TypingNotification) {
        self.notifications
            .insert(notification.from_user_id, notification);
    }

    /// Senders whose latest event is still fresh, resolved against the
    /// current member list. Senders that are no longer members (left the
    /// group) are dropped.
    pub fn active_typists(
        &self,
        now: DateTime<Utc>,
        members: &[ThreadMember],
    ) -> Vec<ThreadMember> {
        let interval = Duration::seconds(MINIMUM_TYPING_INTERVAL_SECS);
        self.notifications
            .values()
            .filter(|n| now - n.original_arrival_time <= interval)
            .filter_map(|n| {
                members
                    .iter()
                    .find(|m| m.chat_user_id == n.from_user_id)
                    .cloned()
            })
            .collect()
    }

    /// Drops entries that can no longer appear in the active view, keeping
    /// the map bounded by the set of recently active senders.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let interval = Duration::seconds(MINIMUM_TYPING_INTERVAL_SECS);
        self.notifications
            .retain(|_, n| now - n.original_arrival_time <= interval);
    }
}
