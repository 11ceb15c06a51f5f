//! HTTP surface: the rate limiting middleware and the server that hosts it.

mod middleware;
mod server;

pub use middleware::enforce_rate_limit;
pub use server::HttpServer;
