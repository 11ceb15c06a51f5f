//! Counting backend over a shared counter store.
//!
//! Counters live in a [`CounterStore`] so that every instance of the service
//! sees the same budget. Two behaviors protect the store: keys that used up
//! their budget are blocked locally for a while, and store failures are
//! served by an in-memory insurance limiter instead of failing the request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::backend::{
    outcome_from_count, BackendKind, ConsumptionOutcome, EvenSpacing, RateLimiterBackend,
};
use super::counter::{clamp_points, Window};
use super::memory::MemoryRateLimiter;
use super::options::{EffectiveOptions, InsuranceOptions};
use crate::store::{CounterStore, StoreError};

/// A rate limiter backed by a remote counter store.
pub struct RemoteRateLimiter {
    /// The shared counter store
    store: Arc<dyn CounterStore>,
    /// Namespace for store keys
    key_prefix: String,
    points: u64,
    window: Window,
    /// Block locally once a key consumed this many points, `0` disables
    in_memory_block_on_consumed: u64,
    /// How long a local block lasts, `0` for the rest of the window
    in_memory_block_duration: Duration,
    /// Locally blocked keys and when their block ends
    blocked: DashMap<String, Instant>,
    /// Serves calls while the store is failing
    insurance: MemoryRateLimiter,
    even_spacing: Option<EvenSpacing>,
}

impl RemoteRateLimiter {
    /// Create a remote limiter with an insurance limiter of the same budget.
    pub fn new(
        store: Arc<dyn CounterStore>,
        key_prefix: impl Into<String>,
        points: u64,
        duration: u64,
    ) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            points,
            window: Window::from_secs(duration),
            in_memory_block_on_consumed: 0,
            in_memory_block_duration: Duration::ZERO,
            blocked: DashMap::new(),
            insurance: MemoryRateLimiter::new(points, duration),
            even_spacing: None,
        }
    }

    /// Block keys locally after `on_consumed` points for `duration_secs`.
    pub fn with_in_memory_block(mut self, on_consumed: u64, duration_secs: u64) -> Self {
        self.in_memory_block_on_consumed = on_consumed;
        self.in_memory_block_duration = Duration::from_secs(duration_secs);
        self
    }

    /// Replace the insurance limiter.
    pub fn with_insurance(mut self, insurance: InsuranceOptions) -> Self {
        self.insurance = MemoryRateLimiter::new(insurance.points, insurance.duration);
        self
    }

    pub fn with_even_spacing(mut self, even_spacing: EvenSpacing) -> Self {
        self.even_spacing = Some(even_spacing);
        self
    }

    pub fn from_options(store: Arc<dyn CounterStore>, opts: &EffectiveOptions) -> Self {
        let mut limiter = Self::new(store, opts.key_prefix.clone(), opts.points, opts.duration)
            .with_in_memory_block(opts.in_memory_block_on_consumed, opts.in_memory_block_duration);
        if let Some(insurance) = opts.insurance {
            limiter = limiter.with_insurance(insurance);
        }
        if let Some(even_spacing) = opts.even_spacing() {
            limiter = limiter.with_even_spacing(even_spacing);
        }
        limiter
    }

    /// The insurance limiter serving calls while the store fails.
    pub fn insurance(&self) -> &MemoryRateLimiter {
        &self.insurance
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    /// Milliseconds left on a local block for `key`, if it is blocked.
    fn blocked_for(&self, key: &str, now: Instant) -> Option<u64> {
        let until = self.blocked.get(key).map(|until| *until)?;
        if until > now {
            return Some(until.saturating_duration_since(now).as_millis() as u64);
        }
        self.blocked.remove_if(key, |_, until| *until <= now);
        None
    }

    fn maybe_block(&self, key: &str, consumed: i64, ms_before_next: u64, now: Instant) {
        if self.in_memory_block_on_consumed == 0
            || consumed < clamp_points(self.in_memory_block_on_consumed)
        {
            return;
        }
        let block_for = if self.in_memory_block_duration.is_zero() {
            Duration::from_millis(ms_before_next)
        } else {
            self.in_memory_block_duration
        };
        if block_for.is_zero() {
            return;
        }
        debug!(
            key = %key,
            consumed = consumed,
            block_ms = block_for.as_millis() as u64,
            "Blocking key in memory"
        );
        let Some(until) = now.checked_add(block_for) else {
            return;
        };
        self.blocked.insert(key.to_string(), until);
    }

    fn log_fallback(&self, key: &str, err: &StoreError) {
        warn!(
            key_prefix = %self.key_prefix,
            key = %key,
            error = %err,
            "Counter store failed, using insurance limiter"
        );
    }

    async fn charge(&self, key: &str, amount: i64) -> Result<ConsumptionOutcome, StoreError> {
        let record = self
            .store
            .increment(&self.store_key(key), amount, self.window.duration())
            .await?;
        let ms_before_next = record.ms_before_expiry.unwrap_or(0);
        self.maybe_block(key, record.consumed, ms_before_next, Instant::now());
        Ok(outcome_from_count(record.consumed, self.points, ms_before_next))
    }

    /// Get the number of keys currently blocked in memory.
    pub fn blocked_count(&self) -> usize {
        let now = Instant::now();
        self.blocked.iter().filter(|entry| *entry.value() > now).count()
    }
}

#[async_trait]
impl RateLimiterBackend for RemoteRateLimiter {
    async fn consume(&self, key: &str, points: u64) -> ConsumptionOutcome {
        if let Some(ms_before_next) = self.blocked_for(key, Instant::now()) {
            trace!(key = %key, ms_before_next = ms_before_next, "Rejected by in-memory block");
            return ConsumptionOutcome::Rejected {
                ms_before_next,
                consumed_points: self
                    .in_memory_block_on_consumed
                    .max(self.points)
                    .saturating_add(points),
            };
        }

        let outcome = match self.charge(key, clamp_points(points)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.log_fallback(key, &err);
                self.insurance.consume(key, points).await
            }
        };

        trace!(
            key_prefix = %self.key_prefix,
            key = %key,
            points = points,
            admitted = outcome.is_admitted(),
            "Consumed from remote limiter"
        );

        match (outcome.is_admitted(), self.even_spacing) {
            (true, Some(even_spacing)) => even_spacing.pace(key, outcome).await,
            (true, None) => outcome,
            (false, _) => {
                debug!(
                    key_prefix = %self.key_prefix,
                    key = %key,
                    consumed = outcome.consumed_points(),
                    limit = self.points,
                    "Rate limit exceeded"
                );
                outcome
            }
        }
    }

    async fn get(&self, key: &str) -> Option<ConsumptionOutcome> {
        match self.store.get(&self.store_key(key)).await {
            Ok(record) => record.map(|record| {
                outcome_from_count(
                    record.consumed,
                    self.points,
                    record.ms_before_expiry.unwrap_or(0),
                )
            }),
            Err(err) => {
                self.log_fallback(key, &err);
                self.insurance.get(key).await
            }
        }
    }

    async fn delete(&self, key: &str) -> bool {
        self.blocked.remove(key);
        match self.store.delete(&self.store_key(key)).await {
            Ok(existed) => existed,
            Err(err) => {
                self.log_fallback(key, &err);
                self.insurance.delete(key).await
            }
        }
    }

    async fn penalty(&self, key: &str, points: u64) -> ConsumptionOutcome {
        match self.charge(key, clamp_points(points)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.log_fallback(key, &err);
                self.insurance.penalty(key, points).await
            }
        }
    }

    async fn reward(&self, key: &str, points: u64) -> ConsumptionOutcome {
        match self.charge(key, -clamp_points(points)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.log_fallback(key, &err);
                self.insurance.reward(key, points).await
            }
        }
    }

    fn points(&self) -> u64 {
        self.points
    }

    fn duration(&self) -> u64 {
        self.window.as_secs()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::RemoteStore
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.blocked.len();
        self.blocked.retain(|_, until| *until > now);
        before.saturating_sub(self.blocked.len()) + self.insurance.purge_expired()
    }
}
