//! Turnstile - Per-Key Admission Control
//!
//! This crate decides, for each inbound request, whether the caller is still
//! within its budget. Limiter options are layered (defaults, module options,
//! per-route overrides), limiters are shared per key prefix, and counting
//! happens either in process memory or in a remote store with an in-memory
//! insurance limiter to fall back on.

pub mod config;
pub mod error;
pub mod guard;
pub mod http;
pub mod ratelimit;
pub mod store;
