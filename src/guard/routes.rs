//! Per-route limiter configuration.
//!
//! Routes are identified by the path pattern they were registered with
//! (e.g. `/users/{id}`), not by the concrete request path.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ratelimit::RateLimiterOptions;

/// Limiter settings attached to one route.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Exempt the route from rate limiting
    #[serde(default)]
    pub skip: bool,

    /// Options overriding the module-level ones for this route
    #[serde(default, alias = "rateLimit")]
    pub rate_limit: Option<RateLimiterOptions>,
}

impl RouteConfig {
    /// A route that is never rate limited.
    pub fn skipped() -> Self {
        Self {
            skip: true,
            rate_limit: None,
        }
    }

    /// A route limited with its own options.
    pub fn limited(options: RateLimiterOptions) -> Self {
        Self {
            skip: false,
            rate_limit: Some(options),
        }
    }
}

/// Route identifier to [`RouteConfig`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteTable {
    routes: HashMap<String, RouteConfig>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the configuration for `route`.
    pub fn insert(&mut self, route: impl Into<String>, config: RouteConfig) {
        self.routes.insert(route.into(), config);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, route: impl Into<String>, config: RouteConfig) -> Self {
        self.insert(route, config);
        self
    }

    pub fn get(&self, route: &str) -> Option<&RouteConfig> {
        self.routes.get(route)
    }

    /// Whether `route` is exempt from rate limiting.
    pub fn is_skipped(&self, route: &str) -> bool {
        self.get(route).is_some_and(|config| config.skip)
    }

    /// Merge `other` into this table; entries in `other` win.
    pub fn extend(&mut self, other: RouteTable) {
        self.routes.extend(other.routes);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RouteConfig)> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
