//! Cache of limiter instances keyed by their prefix.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use super::backend::{spawn_sweeper, sweep_period, BackendKind, RateLimiterBackend};
use super::memory::MemoryRateLimiter;
use super::options::EffectiveOptions;
use super::remote::RemoteRateLimiter;
use crate::error::{Result, TurnstileError};
use crate::store::CounterStore;

/// Owns one counting backend per key prefix.
///
/// Limiters are created on first use of a prefix and kept for the lifetime
/// of the registry. Options passed for a prefix that already has a limiter
/// are ignored: the first configuration wins.
pub struct LimiterRegistry {
    /// Limiter instances indexed by final key prefix
    limiters: DashMap<String, Arc<dyn RateLimiterBackend>>,
    /// Client for remote-store limiters
    store: Option<Arc<dyn CounterStore>>,
}

impl fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("limiters", &self.limiters.len())
            .field("store", &self.store.is_some())
            .finish()
    }
}

impl LimiterRegistry {
    /// Create a registry that can only build in-memory limiters.
    pub fn new() -> Self {
        Self {
            limiters: DashMap::new(),
            store: None,
        }
    }

    /// Create a registry whose remote-store limiters use `store`.
    pub fn with_store(store: Arc<dyn CounterStore>) -> Self {
        Self {
            limiters: DashMap::new(),
            store: Some(store),
        }
    }

    /// Return the limiter for `opts.key_prefix`, creating it if needed.
    ///
    /// Creation runs while the map entry is held, so concurrent first use of
    /// a prefix installs exactly one limiter.
    pub fn get_or_create(&self, opts: &EffectiveOptions) -> Result<Arc<dyn RateLimiterBackend>> {
        if let Some(limiter) = self.limiters.get(&opts.key_prefix) {
            return Ok(limiter.clone());
        }

        let limiter = self
            .limiters
            .entry(opts.key_prefix.clone())
            .or_try_insert_with(|| self.build(opts))?;
        Ok(limiter.clone())
    }

    fn build(&self, opts: &EffectiveOptions) -> Result<Arc<dyn RateLimiterBackend>> {
        debug!(
            key_prefix = %opts.key_prefix,
            backend = %opts.backend,
            points = opts.points,
            duration = opts.duration,
            "Creating new rate limiter"
        );

        let limiter: Arc<dyn RateLimiterBackend> = match opts.backend {
            BackendKind::Memory => Arc::new(MemoryRateLimiter::from_options(opts)),
            BackendKind::RemoteStore => {
                let store = self.store.clone().ok_or_else(|| {
                    TurnstileError::Config(format!(
                        "Rate limiter \"{}\" uses the RemoteStore backend \
                         but no store client is configured",
                        opts.key_prefix
                    ))
                })?;
                Arc::new(RemoteRateLimiter::from_options(store, opts))
            }
        };

        if spawn_sweeper(Arc::downgrade(&limiter), sweep_period(opts.duration)).is_none() {
            debug!(
                key_prefix = %opts.key_prefix,
                "No runtime available, expired state is only dropped on access"
            );
        }

        if opts.logger {
            info!(
                key_prefix = %opts.key_prefix,
                backend = %opts.backend,
                "Rate limiter started"
            );
        }
        Ok(limiter)
    }

    /// Whether remote-store limiters can be built.
    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Whether a limiter exists for `key_prefix`.
    pub fn contains(&self, key_prefix: &str) -> bool {
        self.limiters.contains_key(key_prefix)
    }

    /// Get the number of limiters.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

impl Default for LimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
