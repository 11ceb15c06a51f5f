//! Limiter options and their resolution.
//!
//! Options come in layers: built-in defaults, module-level options and an
//! optional per-route override. Each layer is a [`RateLimiterOptions`] with
//! every field optional; [`EffectiveOptions::resolve`] overlays them (later
//! layers win field by field) and derives the values a limiter needs.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::backend::{BackendKind, ConsumptionOutcome, EvenSpacing};
use crate::error::{Result, TurnstileError};

pub const DEFAULT_POINTS: u64 = 4;
pub const DEFAULT_DURATION_SECS: u64 = 1;
pub const DEFAULT_KEY_PREFIX: &str = "GLOBAL";
pub const DEFAULT_GLOBAL_PREFIX: &str = "RATE_LIMITER";
pub const DEFAULT_ERROR_MESSAGE: &str = "Too many requests";

/// Largest point count a counter can hold.
pub const MAX_POINTS: u64 = i64::MAX as u64;
/// Longest window or block, in seconds (100 years).
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Builds the rejection body from the outcome that caused it.
pub type CustomResponse = Arc<dyn Fn(&ConsumptionOutcome) -> serde_json::Value + Send + Sync>;

/// Budget of the in-memory limiter used when the remote store fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsuranceOptions {
    pub points: u64,
    /// Seconds, `0` for counters that never expire
    pub duration: u64,
}

/// One layer of limiter options.
///
/// Field names are snake_case; the camelCase spellings are accepted too.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct RateLimiterOptions {
    /// Backend kind
    #[serde(default, rename = "type", alias = "backend")]
    pub backend: Option<BackendKind>,

    /// Namespace of this limiter, joined to the global prefix
    #[serde(default, alias = "keyPrefix")]
    pub key_prefix: Option<String>,

    #[serde(default, alias = "globalPrefix")]
    pub global_prefix: Option<String>,

    /// Points budget per window
    #[serde(default)]
    pub points: Option<u64>,

    /// Window length in seconds, `0` means never reset
    #[serde(default)]
    pub duration: Option<u64>,

    /// Points charged per request
    #[serde(default, alias = "pointsConsumed")]
    pub points_consumed: Option<u64>,

    #[serde(default, alias = "omitResponseHeaders")]
    pub omit_response_headers: Option<bool>,

    #[serde(default, alias = "errorMessage")]
    pub error_message: Option<String>,

    /// Log when a limiter is created
    #[serde(default)]
    pub logger: Option<bool>,

    /// Remote backend: block a key locally once it consumed this many points
    #[serde(default, alias = "inMemoryBlockOnConsumed", alias = "inmemoryBlockOnConsumed")]
    pub in_memory_block_on_consumed: Option<u64>,

    /// Remote backend: seconds a locally blocked key stays blocked
    #[serde(default, alias = "inMemoryBlockDuration", alias = "inmemoryBlockDuration")]
    pub in_memory_block_duration: Option<u64>,

    #[serde(default, alias = "insuranceLimiter")]
    pub insurance_limiter: Option<InsuranceOptions>,

    /// Spread admitted requests evenly over the window
    #[serde(default, alias = "execEvenly")]
    pub exec_evenly: Option<bool>,

    #[serde(default, alias = "execEvenlyMinDelayMs")]
    pub exec_evenly_min_delay_ms: Option<u64>,

    /// Admit requests whose tracking key cannot be extracted
    #[serde(default, alias = "skipMissingTracker")]
    pub skip_missing_tracker: Option<bool>,

    #[serde(skip)]
    pub custom_response_schema: Option<CustomResponse>,
}

impl fmt::Debug for RateLimiterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiterOptions")
            .field("backend", &self.backend)
            .field("key_prefix", &self.key_prefix)
            .field("global_prefix", &self.global_prefix)
            .field("points", &self.points)
            .field("duration", &self.duration)
            .field("points_consumed", &self.points_consumed)
            .field("omit_response_headers", &self.omit_response_headers)
            .field("error_message", &self.error_message)
            .field("logger", &self.logger)
            .field("in_memory_block_on_consumed", &self.in_memory_block_on_consumed)
            .field("in_memory_block_duration", &self.in_memory_block_duration)
            .field("insurance_limiter", &self.insurance_limiter)
            .field("exec_evenly", &self.exec_evenly)
            .field("exec_evenly_min_delay_ms", &self.exec_evenly_min_delay_ms)
            .field("skip_missing_tracker", &self.skip_missing_tracker)
            .field(
                "custom_response_schema",
                &self.custom_response_schema.as_ref().map(|_| "<fn>"),
            )
            .finish()
    }
}

impl RateLimiterOptions {
    /// The built-in defaults layer.
    pub fn defaults() -> Self {
        Self {
            backend: Some(BackendKind::Memory),
            key_prefix: Some(DEFAULT_KEY_PREFIX.to_string()),
            global_prefix: Some(DEFAULT_GLOBAL_PREFIX.to_string()),
            points: Some(DEFAULT_POINTS),
            duration: Some(DEFAULT_DURATION_SECS),
            points_consumed: Some(1),
            omit_response_headers: Some(false),
            error_message: Some(DEFAULT_ERROR_MESSAGE.to_string()),
            logger: Some(true),
            ..Default::default()
        }
    }

    /// Set the rejection payload builder.
    pub fn with_custom_response<F>(mut self, f: F) -> Self
    where
        F: Fn(&ConsumptionOutcome) -> serde_json::Value + Send + Sync + 'static,
    {
        self.custom_response_schema = Some(Arc::new(f));
        self
    }

    /// Return a new layer where every field set in `top` replaces ours.
    pub fn overlay(&self, top: &RateLimiterOptions) -> RateLimiterOptions {
        fn pick<T: Clone>(top: &Option<T>, base: &Option<T>) -> Option<T> {
            top.clone().or_else(|| base.clone())
        }

        RateLimiterOptions {
            backend: pick(&top.backend, &self.backend),
            key_prefix: pick(&top.key_prefix, &self.key_prefix),
            global_prefix: pick(&top.global_prefix, &self.global_prefix),
            points: pick(&top.points, &self.points),
            duration: pick(&top.duration, &self.duration),
            points_consumed: pick(&top.points_consumed, &self.points_consumed),
            omit_response_headers: pick(&top.omit_response_headers, &self.omit_response_headers),
            error_message: pick(&top.error_message, &self.error_message),
            logger: pick(&top.logger, &self.logger),
            in_memory_block_on_consumed: pick(
                &top.in_memory_block_on_consumed,
                &self.in_memory_block_on_consumed,
            ),
            in_memory_block_duration: pick(
                &top.in_memory_block_duration,
                &self.in_memory_block_duration,
            ),
            insurance_limiter: pick(&top.insurance_limiter, &self.insurance_limiter),
            exec_evenly: pick(&top.exec_evenly, &self.exec_evenly),
            exec_evenly_min_delay_ms: pick(
                &top.exec_evenly_min_delay_ms,
                &self.exec_evenly_min_delay_ms,
            ),
            skip_missing_tracker: pick(&top.skip_missing_tracker, &self.skip_missing_tracker),
            custom_response_schema: pick(
                &top.custom_response_schema,
                &self.custom_response_schema,
            ),
        }
    }
}

/// Fully resolved options for one admission check.
#[derive(Clone)]
pub struct EffectiveOptions {
    /// Final namespace, `global_prefix:key_prefix`
    pub key_prefix: String,
    pub points: u64,
    /// Seconds, `0` means never reset
    pub duration: u64,
    pub backend: BackendKind,
    pub points_consumed: u64,
    pub omit_response_headers: bool,
    pub error_message: String,
    pub custom_response: Option<CustomResponse>,
    pub logger: bool,
    /// `0` disables local blocking
    pub in_memory_block_on_consumed: u64,
    /// Seconds, `0` blocks for the rest of the window
    pub in_memory_block_duration: u64,
    pub insurance: Option<InsuranceOptions>,
    pub exec_evenly: bool,
    pub exec_evenly_min_delay_ms: u64,
    pub skip_missing_tracker: bool,
}

impl fmt::Debug for EffectiveOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectiveOptions")
            .field("key_prefix", &self.key_prefix)
            .field("points", &self.points)
            .field("duration", &self.duration)
            .field("backend", &self.backend)
            .field("points_consumed", &self.points_consumed)
            .field("omit_response_headers", &self.omit_response_headers)
            .field("in_memory_block_on_consumed", &self.in_memory_block_on_consumed)
            .field("in_memory_block_duration", &self.in_memory_block_duration)
            .field("insurance", &self.insurance)
            .field("exec_evenly", &self.exec_evenly)
            .field("exec_evenly_min_delay_ms", &self.exec_evenly_min_delay_ms)
            .field("skip_missing_tracker", &self.skip_missing_tracker)
            .finish_non_exhaustive()
    }
}

impl EffectiveOptions {
    /// Merge `global`, `module` and an optional `route` layer, in that order
    /// of increasing precedence. Inputs are left untouched.
    pub fn resolve(
        global: &RateLimiterOptions,
        module: &RateLimiterOptions,
        route: Option<&RateLimiterOptions>,
    ) -> Result<Self> {
        let mut merged = RateLimiterOptions::defaults()
            .overlay(global)
            .overlay(module);
        if let Some(route) = route {
            merged = merged.overlay(route);
        }
        Self::from_merged(merged)
    }

    fn from_merged(merged: RateLimiterOptions) -> Result<Self> {
        let points = at_most("points", merged.points.unwrap_or(DEFAULT_POINTS), MAX_POINTS)?;
        if points == 0 {
            return Err(TurnstileError::Config(
                "\"points\" must be greater than zero".to_string(),
            ));
        }
        let points_consumed =
            at_most("pointsConsumed", merged.points_consumed.unwrap_or(1), MAX_POINTS)?;
        if points_consumed == 0 {
            return Err(TurnstileError::Config(
                "\"pointsConsumed\" must be greater than zero".to_string(),
            ));
        }
        let duration = at_most(
            "duration",
            merged.duration.unwrap_or(DEFAULT_DURATION_SECS),
            MAX_DURATION_SECS,
        )?;
        let in_memory_block_duration = at_most(
            "inMemoryBlockDuration",
            merged.in_memory_block_duration.unwrap_or(0),
            MAX_DURATION_SECS,
        )?;
        if let Some(insurance) = merged.insurance_limiter {
            at_most("insuranceLimiter.points", insurance.points, MAX_POINTS)?;
            at_most("insuranceLimiter.duration", insurance.duration, MAX_DURATION_SECS)?;
        }
        let backend = merged.backend.unwrap_or(BackendKind::Memory);

        let key_prefix = prefixed_key(
            merged.global_prefix.as_deref().unwrap_or_default(),
            merged.key_prefix.as_deref().unwrap_or_default(),
        );
        if key_prefix.is_empty() {
            return Err(TurnstileError::Config(
                "\"keyPrefix\" must not be empty when no global prefix is set".to_string(),
            ));
        }

        let (in_memory_block_on_consumed, insurance) = match backend {
            // Once a key has used its whole budget there is no point asking the store again.
            BackendKind::RemoteStore => (
                merged.in_memory_block_on_consumed.unwrap_or(points),
                Some(
                    merged
                        .insurance_limiter
                        .unwrap_or(InsuranceOptions { points, duration }),
                ),
            ),
            BackendKind::Memory => (
                merged.in_memory_block_on_consumed.unwrap_or(0),
                merged.insurance_limiter,
            ),
        };

        let in_memory_block_on_consumed = at_most(
            "inMemoryBlockOnConsumed",
            in_memory_block_on_consumed,
            MAX_POINTS,
        )?;

        Ok(Self {
            key_prefix,
            points,
            duration,
            backend,
            points_consumed,
            omit_response_headers: merged.omit_response_headers.unwrap_or(false),
            error_message: merged
                .error_message
                .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_string()),
            custom_response: merged.custom_response_schema,
            logger: merged.logger.unwrap_or(true),
            in_memory_block_on_consumed,
            in_memory_block_duration,
            insurance,
            exec_evenly: merged.exec_evenly.unwrap_or(false),
            exec_evenly_min_delay_ms: merged
                .exec_evenly_min_delay_ms
                .unwrap_or(duration * 1000 / points),
            skip_missing_tracker: merged.skip_missing_tracker.unwrap_or(false),
        })
    }

    /// Even-spacing settings, if enabled.
    pub fn even_spacing(&self) -> Option<EvenSpacing> {
        self.exec_evenly.then_some(EvenSpacing {
            min_delay_ms: self.exec_evenly_min_delay_ms,
        })
    }
}

fn at_most(name: &str, value: u64, max: u64) -> Result<u64> {
    if value > max {
        return Err(TurnstileError::Config(format!(
            "\"{}\" must be at most {}, got {}",
            name, max, value
        )));
    }
    Ok(value)
}

/// Join a global prefix and a limiter prefix.
pub fn prefixed_key(global_prefix: &str, key_prefix: &str) -> String {
    if global_prefix.is_empty() {
        key_prefix.to_string()
    } else {
        format!("{}:{}", global_prefix, key_prefix)
    }
}
