//! Fixed-window counter record.

use std::time::Duration;
use tokio::time::Instant;

/// A counter tracking requests within one fixed window.
///
/// The expiry is armed when the window opens and is never pushed back by
/// later increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterRecord {
    /// Requests counted in the current window
    count: u64,
    /// When the current window closes
    expires_at: Instant,
}

impl CounterRecord {
    /// Open a new window at `now` holding a single request.
    pub fn open(now: Instant, window: Duration) -> Self {
        Self {
            count: 1,
            expires_at: now + window,
        }
    }

    /// Whether the window is still open at `now`.
    pub fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    /// Count one request, restarting the window if it has expired.
    ///
    /// Returns the count after this request.
    pub fn hit(&mut self, now: Instant, window: Duration) -> u64 {
        if self.is_live(now) {
            self.count += 1;
        } else {
            *self = Self::open(now, window);
        }
        self.count
    }

    /// Get the current count.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Get the instant the current window closes.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Get the duration until the current window resets.
    pub fn duration_until_reset(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}
