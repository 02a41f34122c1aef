use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

struct WindowState {
    started: Instant,
    count: u32,
}

/// Fixed-window send budget per sender. When a sender exceeds the budget
/// the chat routes answer 429 and the client paces itself; the window
/// resets on its own, so throttling is never terminal.
pub struct SendRateLimiter {
    max_per_window: u32,
    window: Duration,
    inner: Mutex<HashMap<Uuid, WindowState>>,
}

impl SendRateLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Counts one send against the sender's current window. Returns false
    /// when the budget is exhausted.
    pub fn try_acquire(&self, sender: Uuid) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let state = inner.entry(sender).or_insert(WindowState {
            started: now,
            count: 0,
        });

        if now.duration_since(state.started) >= self.window {
            state.started = now;
            state.count = 0;
        }

        if state.count >= self.max_per_window {
            return false;
        }
        state.count += 1;
        true
    }
}
