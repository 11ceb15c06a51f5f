//! Admission guard: turns an inbound request into an admit or reject
//! decision with the response metadata that goes with it.

mod admission;
mod routes;
mod tracker;

pub use admission::{
    AdmissionGuard, AdmissionRequest, GuardBuilder, Rejection, RejectionBody, ResponseHeaders,
    Verdict, RETRY_AFTER, TOO_MANY_REQUESTS, X_RATELIMIT_LIMIT, X_RETRY_REMAINING, X_RETRY_RESET,
};
pub use routes::{RouteConfig, RouteTable};
pub use tracker::{HeaderTracker, IpTracker, Tracker};
