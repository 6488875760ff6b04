// Self-clearing user-facing messages.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Shown {
    text: String,
    expires_at: Instant,
}

/// One transient message channel (authorization denial, action result,
/// side effect). A new message replaces the previous one; a message is
/// invisible once its TTL has elapsed.
#[derive(Debug, Clone)]
pub struct NoticeSlot {
    ttl: Duration,
    shown: Option<Shown>,
}

impl NoticeSlot {
    pub fn new(ttl: Duration) -> Self {
        NoticeSlot { ttl, shown: None }
    }

    pub fn show(&mut self, text: impl Into<String>) {
        self.shown = Some(Shown {
            text: text.into(),
            expires_at: Instant::now() + self.ttl,
        });
    }

    /// The message, if it has not expired yet.
    pub fn current(&self) -> Option<&str> {
        self.shown
            .as_ref()
            .filter(|s| Instant::now() < s.expires_at)
            .map(|s| s.text.as_str())
    }

    /// When the visible message will disappear.
    pub fn expires_at(&self) -> Option<Instant> {
        self.shown.as_ref().map(|s| s.expires_at)
    }

    /// Forget an expired message. Returns whether one was dropped.
    pub fn prune(&mut self) -> bool {
        if self
            .shown
            .as_ref()
            .is_some_and(|s| Instant::now() >= s.expires_at)
        {
            self.shown = None;
            return true;
        }
        false
    }

    pub fn clear(&mut self) {
        self.shown = None;
    }
}
