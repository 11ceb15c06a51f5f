//! Per-key window counter.

use std::time::Duration;

use tokio::time::Instant;

/// Length of a counting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    /// Counters expire this long after the first consumption in a window.
    Fixed(Duration),
    /// Counters never expire.
    Unbounded,
}

impl Window {
    /// Build a window from a duration in seconds. `0` means never expire.
    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            Window::Unbounded
        } else {
            Window::Fixed(Duration::from_secs(secs))
        }
    }

    /// The window length, or `None` for an unbounded window.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Window::Fixed(duration) => Some(*duration),
            Window::Unbounded => None,
        }
    }

    /// The window length in whole seconds (`0` for unbounded).
    pub fn as_secs(&self) -> u64 {
        self.duration().map_or(0, |d| d.as_secs())
    }
}

/// Points consumed by one tracked key within its current window.
///
/// Not synchronized on its own: callers hold the owning map entry while
/// mutating it, which makes increment-and-check atomic per key.
#[derive(Debug, Clone)]
pub struct WindowCounter {
    /// Points consumed in this window
    consumed: i64,
    /// When the window closes, `None` for unbounded windows
    expires_at: Option<Instant>,
}

impl WindowCounter {
    /// Start a fresh window at `now`.
    pub fn new(window: Window, now: Instant) -> Self {
        Self {
            consumed: 0,
            // A window too long to represent never closes.
            expires_at: window.duration().and_then(|d| now.checked_add(d)),
        }
    }

    /// Whether the window has closed.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Start a new window if the current one has closed.
    pub fn maybe_reset_window(&mut self, window: Window, now: Instant) {
        if self.is_expired(now) {
            *self = Self::new(window, now);
        }
    }

    /// Try to consume `points` against `limit`.
    ///
    /// Returns `false` and leaves the counter untouched when the consumption
    /// would exceed the limit.
    pub fn try_consume(&mut self, points: u64, limit: u64) -> bool {
        let Ok(points) = i64::try_from(points) else {
            return false;
        };
        match self.consumed.checked_add(points) {
            Some(next) if next <= clamp_points(limit) => {
                self.consumed = next;
                true
            }
            _ => false,
        }
    }

    /// Add (or with a negative amount, give back) points unconditionally.
    pub fn add(&mut self, points: i64) {
        self.consumed = self.consumed.saturating_add(points);
    }

    /// Get the current count.
    pub fn consumed(&self) -> i64 {
        self.consumed
    }

    /// Get the remaining quota.
    pub fn remaining(&self, limit: u64) -> u64 {
        clamp_points(limit).saturating_sub(self.consumed).max(0) as u64
    }

    /// Milliseconds until the window resets, `0` for unbounded windows.
    pub fn ms_before_next(&self, now: Instant) -> u64 {
        self.expires_at
            .map_or(0, |expires_at| expires_at.saturating_duration_since(now).as_millis() as u64)
    }
}

/// Convert a point count to the signed counter domain, saturating.
pub(crate) fn clamp_points(points: u64) -> i64 {
    i64::try_from(points).unwrap_or(i64::MAX)
}
