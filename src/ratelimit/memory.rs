//! In-memory counting backend.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backend::{
    outcome_from_count, BackendKind, ConsumptionOutcome, EvenSpacing, RateLimiterBackend,
};
use super::counter::{clamp_points, Window, WindowCounter};
use super::options::EffectiveOptions;

/// Counts consumed points per tracked key inside this process.
///
/// Each key's counter lives in a sharded map entry; increment-and-check runs
/// while that entry is held, so concurrent requests for one key cannot both
/// take the last point. Unrelated keys only contend on shard locks.
pub struct MemoryRateLimiter {
    /// Window counters indexed by tracked key
    counters: DashMap<String, WindowCounter>,
    points: u64,
    window: Window,
    even_spacing: Option<EvenSpacing>,
}

impl MemoryRateLimiter {
    /// Create a limiter allowing `points` per `duration` seconds.
    pub fn new(points: u64, duration: u64) -> Self {
        Self {
            counters: DashMap::new(),
            points,
            window: Window::from_secs(duration),
            even_spacing: None,
        }
    }

    /// Delay admitted requests so they spread over the window.
    pub fn with_even_spacing(mut self, even_spacing: EvenSpacing) -> Self {
        self.even_spacing = Some(even_spacing);
        self
    }

    pub fn from_options(opts: &EffectiveOptions) -> Self {
        let limiter = Self::new(opts.points, opts.duration);
        match opts.even_spacing() {
            Some(even_spacing) => limiter.with_even_spacing(even_spacing),
            None => limiter,
        }
    }

    /// Consume without pacing. The entry guard is released before returning.
    fn consume_now(&self, key: &str, points: u64) -> ConsumptionOutcome {
        let now = Instant::now();
        let mut counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| WindowCounter::new(self.window, now));
        counter.maybe_reset_window(self.window, now);

        let ms_before_next = counter.ms_before_next(now);
        if counter.try_consume(points, self.points) {
            ConsumptionOutcome::Admitted {
                remaining_points: counter.remaining(self.points),
                ms_before_next,
                consumed_points: counter.consumed().max(0) as u64,
            }
        } else {
            ConsumptionOutcome::Rejected {
                ms_before_next,
                consumed_points: (counter.consumed().max(0) as u64).saturating_add(points),
            }
        }
    }

    fn charge(&self, key: &str, amount: i64) -> ConsumptionOutcome {
        let now = Instant::now();
        let mut counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| WindowCounter::new(self.window, now));
        counter.maybe_reset_window(self.window, now);
        counter.add(amount);
        outcome_from_count(counter.consumed(), self.points, counter.ms_before_next(now))
    }

    /// Get the number of tracked keys.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.counters.clear();
    }
}

#[async_trait]
impl RateLimiterBackend for MemoryRateLimiter {
    async fn consume(&self, key: &str, points: u64) -> ConsumptionOutcome {
        let outcome = self.consume_now(key, points);

        trace!(
            key = %key,
            points = points,
            admitted = outcome.is_admitted(),
            remaining = outcome.remaining_points(),
            "Consumed from memory limiter"
        );

        match (outcome.is_admitted(), self.even_spacing) {
            (true, Some(even_spacing)) => even_spacing.pace(key, outcome).await,
            (true, None) => outcome,
            (false, _) => {
                debug!(
                    key = %key,
                    ms_before_next = outcome.ms_before_next(),
                    "Rate limit exceeded"
                );
                outcome
            }
        }
    }

    async fn get(&self, key: &str) -> Option<ConsumptionOutcome> {
        let now = Instant::now();
        let counter = self.counters.get(key)?;
        if counter.is_expired(now) {
            return None;
        }
        Some(outcome_from_count(
            counter.consumed(),
            self.points,
            counter.ms_before_next(now),
        ))
    }

    async fn delete(&self, key: &str) -> bool {
        self.counters.remove(key).is_some()
    }

    async fn penalty(&self, key: &str, points: u64) -> ConsumptionOutcome {
        self.charge(key, clamp_points(points))
    }

    async fn reward(&self, key: &str, points: u64) -> ConsumptionOutcome {
        self.charge(key, -clamp_points(points))
    }

    fn points(&self) -> u64 {
        self.points
    }

    fn duration(&self) -> u64 {
        self.window.as_secs()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_expired(now));
        before.saturating_sub(self.counters.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::backend::spawn_sweeper;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_two_points_per_two_minutes() {
        let limiter = MemoryRateLimiter::new(2, 120);

        let first = limiter.consume("10.0.0.1", 1).await;
        assert_eq!(first.remaining_points(), 1);
        assert!(first.is_admitted());

        let second = limiter.consume("10.0.0.1", 1).await;
        assert!(second.is_admitted());
        assert_eq!(second.remaining_points(), 0);

        let third = limiter.consume("10.0.0.1", 1).await;
        assert!(!third.is_admitted());
        assert_eq!(third.ms_before_next(), 120_000);

        tokio::time::advance(Duration::from_secs(121)).await;

        let fourth = limiter.consume("10.0.0.1", 1).await;
        assert!(fourth.is_admitted());
        assert_eq!(fourth.remaining_points(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_reports_time_left_in_window() {
        let limiter = MemoryRateLimiter::new(1, 10);
        limiter.consume("k", 1).await;

        tokio::time::advance(Duration::from_secs(4)).await;

        match limiter.consume("k", 1).await {
            ConsumptionOutcome::Rejected {
                ms_before_next,
                consumed_points,
            } => {
                assert_eq!(ms_before_next, 6000);
                assert_eq!(consumed_points, 2);
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_duration_never_resets() {
        let limiter = MemoryRateLimiter::new(1, 0);
        assert!(limiter.consume("k", 1).await.is_admitted());

        tokio::time::advance(Duration::from_secs(86400)).await;

        let outcome = limiter.consume("k", 1).await;
        assert!(!outcome.is_admitted());
        assert_eq!(outcome.ms_before_next(), 0);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = MemoryRateLimiter::new(1, 60);

        assert!(limiter.consume("a", 1).await.is_admitted());
        assert!(limiter.consume("b", 1).await.is_admitted());
        assert!(!limiter.consume("a", 1).await.is_admitted());
        assert_eq!(limiter.counter_count(), 2);
    }

    #[tokio::test]
    async fn test_rejected_points_are_not_charged() {
        let limiter = MemoryRateLimiter::new(5, 60);

        assert!(limiter.consume("k", 4).await.is_admitted());
        assert!(!limiter.consume("k", 3).await.is_admitted());

        // The rejected 3 points were not applied, so 1 point still fits
        let outcome = limiter.consume("k", 1).await;
        assert!(outcome.is_admitted());
        assert_eq!(outcome.remaining_points(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_never_exceed_budget() {
        let limiter = Arc::new(MemoryRateLimiter::new(10, 60));

        let tasks = (0..100).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.consume("shared", 1).await })
        });
        let outcomes = futures::future::join_all(tasks).await;

        let admitted = outcomes
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|o| o.is_admitted())
            .count();
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_huge_point_counts_stay_within_budget() {
        let limiter = MemoryRateLimiter::new(5, 60);

        let outcome = limiter.consume("k", u64::MAX).await;
        assert!(!outcome.is_admitted());
        assert_eq!(outcome.remaining_points(), 0);
        assert_eq!(outcome.consumed_points(), u64::MAX);

        // Nothing was charged by the rejected call
        assert_eq!(limiter.get("k").await.map(|o| o.consumed_points()), Some(0));
        let next = limiter.consume("k", 1).await;
        assert!(next.is_admitted());
        assert_eq!(next.remaining_points(), 4);

        let penalized = limiter.penalty("k", u64::MAX).await;
        assert!(!penalized.is_admitted());
        let rewarded = limiter.reward("k", u64::MAX).await;
        assert!(rewarded.is_admitted());
        assert_eq!(rewarded.remaining_points(), 5);
    }

    #[tokio::test]
    async fn test_remaining_decreases_by_points_consumed() {
        let limiter = MemoryRateLimiter::new(6, 60);
        let mut remaining = Vec::new();
        for _ in 0..3 {
            remaining.push(limiter.consume("k", 2).await.remaining_points());
        }
        assert_eq!(remaining, vec![4, 2, 0]);
    }

    #[tokio::test]
    async fn test_get_delete_penalty_reward() {
        let limiter = MemoryRateLimiter::new(3, 60);
        assert!(limiter.get("k").await.is_none());

        limiter.consume("k", 1).await;
        assert_eq!(limiter.get("k").await.map(|o| o.consumed_points()), Some(1));

        let penalized = limiter.penalty("k", 3).await;
        assert!(!penalized.is_admitted());
        assert_eq!(penalized.consumed_points(), 4);

        let rewarded = limiter.reward("k", 2).await;
        assert!(rewarded.is_admitted());
        assert_eq!(rewarded.remaining_points(), 1);

        assert!(limiter.delete("k").await);
        assert!(!limiter.delete("k").await);
        assert!(limiter.consume("k", 3).await.is_admitted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let limiter = MemoryRateLimiter::new(3, 1);
        limiter.consume("a", 1).await;
        limiter.consume("b", 1).await;

        tokio::time::advance(Duration::from_secs(2)).await;
        limiter.consume("c", 1).await;

        assert_eq!(limiter.purge_expired(), 2);
        assert_eq!(limiter.counter_count(), 1);
        assert!(limiter.get("a").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_frees_expired_counters() {
        let limiter = Arc::new(MemoryRateLimiter::new(3, 1));
        let backend: Arc<dyn RateLimiterBackend> = limiter.clone();
        let sweeper = spawn_sweeper(Arc::downgrade(&backend), Duration::from_secs(1)).unwrap();
        drop(backend);

        for i in 0..1000 {
            limiter.consume(&format!("10.0.{}.{}", i / 256, i % 256), 1).await;
        }
        assert_eq!(limiter.counter_count(), 1000);

        tokio::time::advance(Duration::from_secs(3600)).await;
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert_eq!(limiter.counter_count(), 0);

        // The sweep stops once the limiter is gone
        drop(limiter);
        sweeper.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_even_spacing_delays_admission() {
        let limiter =
            MemoryRateLimiter::new(10, 10).with_even_spacing(EvenSpacing { min_delay_ms: 1000 });

        let start = Instant::now();
        let outcome = limiter.consume("k", 1).await;
        assert!(outcome.is_admitted());
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_spacing_keeps_point_charged() {
        let limiter =
            MemoryRateLimiter::new(10, 10).with_even_spacing(EvenSpacing { min_delay_ms: 1000 });

        let result =
            tokio::time::timeout(Duration::from_millis(10), limiter.consume("k", 1)).await;
        assert!(result.is_err());

        assert_eq!(limiter.get("k").await.map(|o| o.consumed_points()), Some(1));
    }
}
