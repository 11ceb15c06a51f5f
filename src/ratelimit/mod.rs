//! Rate limiting logic and state management.

mod backend;
mod counter;
mod memory;
mod options;
mod registry;
mod remote;

pub use backend::{
    spawn_sweeper, sweep_period, BackendKind, ConsumptionOutcome, EvenSpacing, RateLimiterBackend,
};
pub use counter::{Window, WindowCounter};
pub use memory::MemoryRateLimiter;
pub use options::{
    prefixed_key, CustomResponse, EffectiveOptions, InsuranceOptions, RateLimiterOptions,
    DEFAULT_ERROR_MESSAGE, DEFAULT_GLOBAL_PREFIX, MAX_DURATION_SECS, MAX_POINTS,
};
pub use registry::LimiterRegistry;
pub use remote::RemoteRateLimiter;
