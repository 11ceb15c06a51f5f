//! Redis-backed counter store.
//!
//! Counters are plain Redis integers. Increment and expiry are applied in a
//! single Lua script so that the TTL is only set when the counter is first
//! created within a window.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use tracing::info;

use super::{CounterStore, StoreError, StoreRecord};

/// Returns `{consumed, pttl}`. `pttl` is -1 for counters without expiry.
static INCREMENT_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local consumed = redis.call('INCRBY', KEYS[1], ARGV[1])
local ttl = redis.call('PTTL', KEYS[1])
local requested = tonumber(ARGV[2])
if ttl == -1 and requested > 0 then
  redis.call('PEXPIRE', KEYS[1], requested)
  ttl = requested
end
return {consumed, ttl}
"#,
    )
});

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// [`CounterStore`] over a multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore").finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1/`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to Redis counter store");
        Ok(Self { connection })
    }

    fn to_record(consumed: i64, pttl: i64) -> StoreRecord {
        StoreRecord {
            consumed,
            ms_before_expiry: (pttl >= 0).then_some(pttl as u64),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(
        &self,
        key: &str,
        amount: i64,
        ttl: Option<Duration>,
    ) -> Result<StoreRecord, StoreError> {
        let mut conn = self.connection.clone();
        let ttl_ms = ttl.map_or(0, |ttl| ttl.as_millis() as i64);
        let (consumed, pttl): (i64, i64) = INCREMENT_SCRIPT
            .key(key)
            .arg(amount)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(Self::to_record(consumed, pttl))
    }

    async fn get(&self, key: &str) -> Result<Option<StoreRecord>, StoreError> {
        let mut conn = self.connection.clone();
        let (consumed, pttl): (Option<i64>, i64) = redis::pipe()
            .get(key)
            .pttl(key)
            .query_async(&mut conn)
            .await?;
        Ok(consumed.map(|consumed| Self::to_record(consumed, pttl)))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }
}
