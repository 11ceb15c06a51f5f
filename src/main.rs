use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::guard::{AdmissionGuard, RouteConfig, RouteTable};
use turnstile::http::{enforce_rate_limit, HttpServer};
use turnstile::ratelimit::RateLimiterOptions;

/// Demo HTTP service guarded by per-client rate limits.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Address to serve HTTP on, overriding the configuration
    #[arg(long)]
    http_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    info!(http_addr = %config.server.http_addr, "Configuration loaded");

    let mut routes = demo_routes();
    routes.extend(config.rate_limiting.routes.clone());
    let paths: BTreeSet<String> = routes.iter().map(|(path, _)| path.clone()).collect();

    #[allow(unused_mut)]
    let mut builder = AdmissionGuard::builder()
        .module_options(config.rate_limiting.options.clone())
        .routes(routes);

    #[cfg(feature = "redis")]
    if let Some(url) = config.rate_limiting.redis_url.as_deref() {
        builder = builder.store(turnstile::store::connect_redis(url).await?);
    }

    #[cfg(not(feature = "redis"))]
    if config.rate_limiting.redis_url.is_some() {
        warn!("redis_url is set but this build has no Redis support");
    }

    let guard = Arc::new(builder.build()?);
    info!(routes = paths.len(), "Admission guard initialized");

    let mut router = Router::new().route("/", get(hello));
    for path in paths.iter().filter(|path| path.as_str() != "/") {
        if !path.starts_with('/') {
            warn!(route = %path, "Ignoring route that does not start with '/'");
            continue;
        }
        router = router.route(path, get(hello));
    }
    let router = router.route_layer(axum::middleware::from_fn_with_state(
        guard,
        enforce_rate_limit,
    ));

    HttpServer::new(config.server.http_addr, router)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Turnstile stopped");
    Ok(())
}

async fn hello() -> &'static str {
    "Hello World!"
}

/// Routes served by the demo binary.
fn demo_routes() -> RouteTable {
    RouteTable::new()
        .with("/unrestricted", RouteConfig::skipped())
        .with(
            "/rate-limited",
            RouteConfig::limited(RateLimiterOptions {
                key_prefix: Some("rate-limited".to_string()),
                points: Some(2),
                duration: Some(120),
                ..Default::default()
            }),
        )
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
