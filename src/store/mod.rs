//! Remote counter store capability.
//!
//! The remote backend only needs an atomic "increment and expire" counter
//! from whatever network store sits behind it. This module defines that
//! contract; concrete clients live in submodules.

#[cfg(feature = "redis")]
mod redis_store;

#[cfg(feature = "redis")]
pub use redis_store::RedisCounterStore;

#[cfg(feature = "redis")]
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur while talking to a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to connect to counter store: {0}")]
    Connection(String),
    #[error("Counter store command failed: {0}")]
    Command(String),
    #[error("Counter store unavailable")]
    Unavailable,
}

/// A counter as reported by the store after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreRecord {
    /// Points consumed in the current window.
    pub consumed: i64,
    /// Time left before the store expires the counter. `None` if the
    /// counter never expires.
    pub ms_before_expiry: Option<u64>,
}

/// An atomic increment-and-expire counter service.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `amount` to the counter at `key` and return the new
    /// value. The expiry is only set when the counter is created; `None`
    /// creates a counter that never expires.
    async fn increment(
        &self,
        key: &str,
        amount: i64,
        ttl: Option<Duration>,
    ) -> Result<StoreRecord, StoreError>;

    /// Read the counter without modifying it.
    async fn get(&self, key: &str) -> Result<Option<StoreRecord>, StoreError>;

    /// Remove the counter. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

/// Connect the Redis counter store at `url`.
#[cfg(feature = "redis")]
pub async fn connect_redis(url: &str) -> crate::error::Result<Arc<dyn CounterStore>> {
    let store = RedisCounterStore::connect(url).await?;
    Ok(Arc::new(store))
}
