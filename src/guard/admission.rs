//! Per-request admission decisions.

use std::future::Future;
use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, trace};

use super::routes::{RouteConfig, RouteTable};
use super::tracker::{IpTracker, Tracker};
use crate::error::{Result, TurnstileError};
use crate::ratelimit::{
    BackendKind, ConsumptionOutcome, EffectiveOptions, LimiterRegistry, RateLimiterOptions,
};
use crate::store::CounterStore;

pub const RETRY_AFTER: &str = "Retry-After";
pub const X_RATELIMIT_LIMIT: &str = "X-RateLimit-Limit";
pub const X_RETRY_REMAINING: &str = "X-Retry-Remaining";
pub const X_RETRY_RESET: &str = "X-Retry-Reset";

/// Status code sent with a rejection.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// What the guard needs to know about an inbound request.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    /// Identifier the route was registered with
    pub route: &'a str,
    /// Client address as reported by the transport
    pub ip: Option<&'a str>,
    pub headers: Option<&'a HeaderMap>,
}

impl<'a> AdmissionRequest<'a> {
    pub fn new(route: &'a str, ip: Option<&'a str>) -> Self {
        Self {
            route,
            ip,
            headers: None,
        }
    }

    pub fn with_headers(mut self, headers: &'a HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// Response header fields produced by a decision, in emission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaders(Vec<(&'static str, String)>);

impl ResponseHeaders {
    fn push(&mut self, name: &'static str, value: impl ToString) {
        self.0.push((name, value.to_string()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.0.iter().map(|(n, v)| (*n, v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Body sent with a rejection.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectionBody {
    Message(String),
    Json(serde_json::Value),
}

/// A request refused for being over budget.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub headers: ResponseHeaders,
    pub body: RejectionBody,
    pub outcome: ConsumptionOutcome,
}

impl Rejection {
    pub fn status(&self) -> u16 {
        TOO_MANY_REQUESTS
    }
}

/// Result of an admission check.
#[derive(Debug, Clone)]
pub enum Verdict {
    Admitted {
        headers: ResponseHeaders,
        /// `None` when no limiter was consulted (skipped route or missing key)
        outcome: Option<ConsumptionOutcome>,
    },
    Rejected(Rejection),
}

impl Verdict {
    fn bypassed() -> Self {
        Verdict::Admitted {
            headers: ResponseHeaders::default(),
            outcome: None,
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Verdict::Admitted { .. })
    }

    pub fn headers(&self) -> &ResponseHeaders {
        match self {
            Verdict::Admitted { headers, .. } => headers,
            Verdict::Rejected(rejection) => &rejection.headers,
        }
    }
}

/// Decides whether requests may proceed.
///
/// Cheap to share behind an `Arc`; limiters are created lazily in the
/// registry and reused by every request hitting the same key prefix.
pub struct AdmissionGuard {
    global: RateLimiterOptions,
    module: RateLimiterOptions,
    routes: RouteTable,
    registry: Arc<LimiterRegistry>,
    tracker: Arc<dyn Tracker>,
}

impl AdmissionGuard {
    pub fn builder() -> GuardBuilder {
        GuardBuilder::default()
    }

    pub fn registry(&self) -> &Arc<LimiterRegistry> {
        &self.registry
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Resolve the options that apply to `route`.
    pub fn options_for(&self, route: &str) -> Result<EffectiveOptions> {
        let override_opts = self.routes.get(route).and_then(|r| r.rate_limit.as_ref());
        EffectiveOptions::resolve(&self.global, &self.module, override_opts)
    }

    /// Run the admission check for one request.
    ///
    /// Only configuration problems are returned as errors; an over-budget
    /// request yields [`Verdict::Rejected`].
    pub async fn check(&self, request: &AdmissionRequest<'_>) -> Result<Verdict> {
        if self.routes.is_skipped(request.route) {
            trace!(route = %request.route, "Route exempt from rate limiting");
            return Ok(Verdict::bypassed());
        }

        let opts = self.options_for(request.route)?;

        let key = match self.tracker.track(request) {
            Some(key) => key,
            None if opts.skip_missing_tracker => {
                trace!(route = %request.route, "No tracking key, admitting");
                return Ok(Verdict::bypassed());
            }
            // Untracked callers share one counter.
            None => String::new(),
        };

        let limiter = self.registry.get_or_create(&opts)?;
        let outcome = limiter.consume(&key, opts.points_consumed).await;
        let limit = limiter.points();

        match outcome {
            ConsumptionOutcome::Admitted { .. } => {
                let headers = if opts.omit_response_headers {
                    ResponseHeaders::default()
                } else {
                    admitted_headers(limit, &outcome)
                };
                Ok(Verdict::Admitted {
                    headers,
                    outcome: Some(outcome),
                })
            }
            ConsumptionOutcome::Rejected { ms_before_next, .. } => {
                debug!(
                    route = %request.route,
                    key_prefix = %opts.key_prefix,
                    key = %key,
                    ms_before_next = ms_before_next,
                    "Request rejected"
                );
                let mut headers = ResponseHeaders::default();
                headers.push(RETRY_AFTER, retry_after_secs(ms_before_next));
                let body = match &opts.custom_response {
                    Some(render) => RejectionBody::Json(render(&outcome)),
                    None => RejectionBody::Message(opts.error_message.clone()),
                };
                Ok(Verdict::Rejected(Rejection {
                    headers,
                    body,
                    outcome,
                }))
            }
        }
    }
}

fn retry_after_secs(ms_before_next: u64) -> u64 {
    ms_before_next.div_ceil(1000)
}

/// Format `now + ms` as an HTTP-date.
fn reset_timestamp(ms_before_next: u64) -> String {
    let reset = i64::try_from(ms_before_next)
        .ok()
        .and_then(ChronoDuration::try_milliseconds)
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    reset.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn admitted_headers(limit: u64, outcome: &ConsumptionOutcome) -> ResponseHeaders {
    let ms_before_next = outcome.ms_before_next();
    let mut headers = ResponseHeaders::default();
    headers.push(RETRY_AFTER, retry_after_secs(ms_before_next));
    headers.push(X_RATELIMIT_LIMIT, limit);
    headers.push(X_RETRY_REMAINING, outcome.remaining_points());
    headers.push(X_RETRY_RESET, reset_timestamp(ms_before_next));
    headers
}

/// Assembles an [`AdmissionGuard`].
#[derive(Default)]
pub struct GuardBuilder {
    global: RateLimiterOptions,
    module: RateLimiterOptions,
    routes: RouteTable,
    registry: Option<Arc<LimiterRegistry>>,
    store: Option<Arc<dyn CounterStore>>,
    tracker: Option<Arc<dyn Tracker>>,
}

impl GuardBuilder {
    /// Options layered directly over the built-in defaults.
    pub fn global_options(mut self, options: RateLimiterOptions) -> Self {
        self.global = options;
        self
    }

    pub fn module_options(mut self, options: RateLimiterOptions) -> Self {
        self.module = options;
        self
    }

    pub fn routes(mut self, routes: RouteTable) -> Self {
        self.routes.extend(routes);
        self
    }

    pub fn route(mut self, route: impl Into<String>, config: RouteConfig) -> Self {
        self.routes.insert(route, config);
        self
    }

    /// Share an existing registry. Takes precedence over [`store`](Self::store).
    pub fn registry(mut self, registry: Arc<LimiterRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Counter store for remote-store limiters.
    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn tracker(mut self, tracker: impl Tracker + 'static) -> Self {
        self.tracker = Some(Arc::new(tracker));
        self
    }

    /// Build the guard, checking that the module options and every route
    /// override resolve to a usable configuration.
    pub fn build(self) -> Result<AdmissionGuard> {
        let has_store =
            self.store.is_some() || self.registry.as_ref().is_some_and(|r| r.has_store());
        let registry = match (self.registry, self.store) {
            (Some(registry), _) => registry,
            (None, Some(store)) => Arc::new(LimiterRegistry::with_store(store)),
            (None, None) => Arc::new(LimiterRegistry::new()),
        };

        let guard = AdmissionGuard {
            global: self.global,
            module: self.module,
            routes: self.routes,
            registry,
            tracker: self
                .tracker
                .unwrap_or_else(|| Arc::new(IpTracker) as Arc<dyn Tracker>),
        };

        let overrides = std::iter::once(None).chain(
            guard
                .routes
                .iter()
                .filter(|(_, config)| !config.skip)
                .map(|(_, config)| config.rate_limit.as_ref()),
        );
        for route_opts in overrides {
            let opts = EffectiveOptions::resolve(&guard.global, &guard.module, route_opts)?;
            if opts.backend == BackendKind::RemoteStore && !has_store {
                return Err(TurnstileError::Config(format!(
                    "Rate limiter \"{}\" uses the RemoteStore backend \
                     but no store client is configured",
                    opts.key_prefix
                )));
            }
        }

        Ok(guard)
    }

    /// Build the guard with module options produced by an async factory,
    /// e.g. one that reads them from a secrets service.
    pub async fn build_with_factory<F>(self, factory: F) -> Result<AdmissionGuard>
    where
        F: Future<Output = Result<RateLimiterOptions>>,
    {
        let module = factory.await?;
        self.module_options(module).build()
    }
}
