//! Counting backend trait for abstracting in-memory and remote implementations.

use std::fmt;
use std::str::FromStr;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::trace;

use crate::error::TurnstileError;

/// Which counting backend a limiter uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackendKind {
    /// Counters live in this process.
    Memory,
    /// Counters live in a shared [`crate::store::CounterStore`].
    RemoteStore,
}

impl FromStr for BackendKind {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Memory" | "memory" => Ok(BackendKind::Memory),
            "RemoteStore" | "remote_store" | "Redis" | "redis" => Ok(BackendKind::RemoteStore),
            other => Err(TurnstileError::Config(format!(
                "Invalid \"type\" option provided to rate limiter. Value was {}",
                other
            ))),
        }
    }
}

impl TryFrom<String> for BackendKind {
    type Error = TurnstileError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackendKind> for String {
    fn from(kind: BackendKind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Memory => write!(f, "Memory"),
            BackendKind::RemoteStore => write!(f, "RemoteStore"),
        }
    }
}

/// Result of a consumption attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumptionOutcome {
    /// The points were charged and the request may proceed.
    Admitted {
        /// Points left in the current window
        remaining_points: u64,
        /// Milliseconds until the window resets (0 if it never does)
        ms_before_next: u64,
        /// Points consumed in the window, including this call
        consumed_points: u64,
    },
    /// The key is over budget.
    Rejected {
        /// Milliseconds until the key may consume again
        ms_before_next: u64,
        /// Points the key would have consumed with this call
        consumed_points: u64,
    },
}

impl ConsumptionOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, ConsumptionOutcome::Admitted { .. })
    }

    pub fn ms_before_next(&self) -> u64 {
        match self {
            ConsumptionOutcome::Admitted { ms_before_next, .. }
            | ConsumptionOutcome::Rejected { ms_before_next, .. } => *ms_before_next,
        }
    }

    /// Remaining points; always 0 for a rejection.
    pub fn remaining_points(&self) -> u64 {
        match self {
            ConsumptionOutcome::Admitted { remaining_points, .. } => *remaining_points,
            ConsumptionOutcome::Rejected { .. } => 0,
        }
    }

    pub fn consumed_points(&self) -> u64 {
        match self {
            ConsumptionOutcome::Admitted { consumed_points, .. }
            | ConsumptionOutcome::Rejected { consumed_points, .. } => *consumed_points,
        }
    }
}

/// Trait for counting backend implementations.
///
/// All operations are infallible from the caller's point of view: the remote
/// implementation absorbs store failures through its insurance backend.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Consume `points` for `key`.
    async fn consume(&self, key: &str, points: u64) -> ConsumptionOutcome;

    /// Current state of `key` without consuming. `None` if the key has no
    /// live counter.
    async fn get(&self, key: &str) -> Option<ConsumptionOutcome>;

    /// Forget `key`. Returns `true` if a counter was removed.
    async fn delete(&self, key: &str) -> bool;

    /// Charge `points` for `key` even if that takes it over budget.
    async fn penalty(&self, key: &str, points: u64) -> ConsumptionOutcome;

    /// Give `points` back to `key`.
    async fn reward(&self, key: &str, points: u64) -> ConsumptionOutcome;

    /// Points budget per window.
    fn points(&self) -> u64;

    /// Window length in seconds, `0` if counters never expire.
    fn duration(&self) -> u64;

    fn kind(&self) -> BackendKind;

    /// Drop state whose window has closed. Returns how many entries were
    /// removed.
    fn purge_expired(&self) -> usize;
}

/// How often expired state is swept for a window of `duration_secs`.
pub fn sweep_period(duration_secs: u64) -> Duration {
    match duration_secs {
        0 => Duration::from_secs(60),
        secs => Duration::from_secs(secs.clamp(1, 60)),
    }
}

/// Call [`RateLimiterBackend::purge_expired`] every `period` until the
/// limiter is dropped.
///
/// Returns `None` outside a Tokio runtime, where nothing is spawned.
pub fn spawn_sweeper(
    limiter: Weak<dyn RateLimiterBackend>,
    period: Duration,
) -> Option<JoinHandle<()>> {
    let handle = Handle::try_current().ok()?;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    Some(handle.spawn(async move {
        loop {
            ticker.tick().await;
            let Some(limiter) = limiter.upgrade() else {
                break;
            };
            let purged = limiter.purge_expired();
            if purged > 0 {
                trace!(purged = purged, kind = %limiter.kind(), "Purged expired limiter state");
            }
        }
    }))
}

/// Build an outcome from a raw consumed count, as reported after a charge.
pub(crate) fn outcome_from_count(
    consumed: i64,
    limit: u64,
    ms_before_next: u64,
) -> ConsumptionOutcome {
    let consumed_points = consumed.max(0) as u64;
    if consumed_points > limit {
        ConsumptionOutcome::Rejected {
            ms_before_next,
            consumed_points,
        }
    } else {
        ConsumptionOutcome::Admitted {
            remaining_points: limit - consumed_points,
            ms_before_next,
            consumed_points,
        }
    }
}

/// Even-spacing settings shared by both backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvenSpacing {
    /// Smallest delay applied to an admitted call
    pub min_delay_ms: u64,
}

impl EvenSpacing {
    /// How long an admitted call should wait so that the remaining budget is
    /// spread over the rest of the window.
    pub fn delay_for(&self, outcome: &ConsumptionOutcome) -> Duration {
        match *outcome {
            ConsumptionOutcome::Admitted {
                remaining_points,
                ms_before_next,
                ..
            } => {
                let spread = ms_before_next.div_ceil(remaining_points.saturating_add(2));
                Duration::from_millis(spread.max(self.min_delay_ms).min(ms_before_next))
            }
            ConsumptionOutcome::Rejected { .. } => Duration::ZERO,
        }
    }

    /// Suspend the caller before returning an admitted outcome.
    ///
    /// The delay is computed per call from that call's outcome. Concurrent
    /// callers are not queued behind each other, so two admits with the same
    /// remaining budget can be released at the same instant.
    ///
    /// Dropping the returned future cancels the wait; the points stay charged.
    pub async fn pace(&self, key: &str, outcome: ConsumptionOutcome) -> ConsumptionOutcome {
        let delay = self.delay_for(&outcome);
        if !delay.is_zero() {
            trace!(key = %key, delay_ms = delay.as_millis() as u64, "Spacing admitted request");
            tokio::time::sleep(delay).await;
        }
        outcome
    }
}
