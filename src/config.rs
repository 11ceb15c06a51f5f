//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::error::{Result, TurnstileError};
use crate::guard::RouteTable;
use crate::ratelimit::RateLimiterOptions;

/// Prefix for environment variable overrides, e.g.
/// `TURNSTILE__SERVER__HTTP_ADDR=0.0.0.0:8080`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Module-level limiter options
    #[serde(default)]
    pub options: RateLimiterOptions,

    /// Redis connection URL for remote-store limiters
    pub redis_url: Option<String>,

    /// Per-route overrides keyed by route path
    #[serde(default)]
    pub routes: RouteTable,
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Load configuration from an optional YAML file layered under
    /// `TURNSTILE__`-prefixed environment variables.
    ///
    /// The file is parsed with serde_yaml so camelCase option names are
    /// accepted; only its snake_case re-serialization reaches the env layer.
    /// Routes always come from the file.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        // Route paths are map keys that the env layer would rewrite.
        let mut layered = file.clone();
        layered.rate_limiting.routes = RouteTable::new();

        let base = config::Config::try_from(&layered).map_err(config_error)?;
        let mut merged: TurnstileConfig = config::Config::builder()
            .add_source(base)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(config_error)?;

        merged.rate_limiting.routes = file.rate_limiting.routes;
        merged.rate_limiting.options.custom_response_schema =
            file.rate_limiting.options.custom_response_schema;
        Ok(merged)
    }
}

fn config_error(err: config::ConfigError) -> TurnstileError {
    TurnstileError::Config(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::BackendKind;

    #[test]
    fn test_default_config() {
        let config = TurnstileConfig::default();
        assert_eq!(config.server.http_addr, "127.0.0.1:3000".parse().unwrap());
        assert!(config.rate_limiting.redis_url.is_none());
        assert!(config.rate_limiting.routes.is_empty());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:8080"
rate_limiting:
  redis_url: "redis://127.0.0.1:6379"
  options:
    type: Redis
    keyPrefix: api
    points: 100
    duration: 60
    inMemoryBlockOnConsumed: 150
  routes:
    /health:
      skip: true
    /login:
      rateLimit:
        keyPrefix: login
        points: 5
        duration: 300
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.http_addr, "0.0.0.0:8080".parse().unwrap());
        let rl = &config.rate_limiting;
        assert_eq!(rl.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(rl.options.backend, Some(BackendKind::RemoteStore));
        assert_eq!(rl.options.points, Some(100));
        assert_eq!(rl.options.in_memory_block_on_consumed, Some(150));
        assert!(rl.routes.is_skipped("/health"));

        let login = rl.routes.get("/login").and_then(|r| r.rate_limit.as_ref()).unwrap();
        assert_eq!(login.key_prefix.as_deref(), Some("login"));
        assert_eq!(login.points, Some(5));
    }

    #[test]
    fn test_from_yaml_rejects_unknown_backend() {
        let yaml = r#"
rate_limiting:
  options:
    type: Memcached
"#;
        let err = TurnstileConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[test]
    fn test_from_missing_file() {
        let err = TurnstileConfig::from_file("/nonexistent/turnstile.yaml").unwrap_err();
        assert!(matches!(err, TurnstileError::Io(_)));
    }

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "turnstile-{}-{}.yaml",
            name,
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_keeps_camel_case_options() {
        let path = write_temp(
            "camel",
            r#"
rate_limiting:
  options:
    type: Redis
    keyPrefix: api
    inMemoryBlockOnConsumed: 7
    omitResponseHeaders: true
    skipMissingTracker: true
  routes:
    /Login:
      rateLimit:
        keyPrefix: login
        points: 5
    /health:
      skip: true
    /v1.0/items:
      skip: true
"#,
        );

        let loaded = TurnstileConfig::load(path.to_str()).unwrap();
        let parsed = TurnstileConfig::from_file(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();

        let opts = &loaded.rate_limiting.options;
        assert_eq!(opts.backend, Some(BackendKind::RemoteStore));
        assert_eq!(opts.key_prefix.as_deref(), Some("api"));
        assert_eq!(opts.in_memory_block_on_consumed, Some(7));
        assert_eq!(opts.omit_response_headers, Some(true));
        assert_eq!(opts.skip_missing_tracker, Some(true));
        assert_eq!(
            opts.key_prefix,
            parsed.rate_limiting.options.key_prefix,
            "load and from_file must agree"
        );

        let routes = &loaded.rate_limiting.routes;
        let login = routes.get("/Login").and_then(|r| r.rate_limit.as_ref()).unwrap();
        assert_eq!(login.key_prefix.as_deref(), Some("login"));
        assert_eq!(login.points, Some(5));
        assert!(routes.is_skipped("/health"));
        assert!(routes.is_skipped("/v1.0/items"));
    }

    #[test]
    fn test_load_env_overrides_file() {
        let path = write_temp("env", "rate_limiting:\n  redis_url: \"redis://file:6379\"\n");
        std::env::set_var("TURNSTILE__RATE_LIMITING__REDIS_URL", "redis://env:6379");

        let loaded = TurnstileConfig::load(path.to_str());
        std::env::remove_var("TURNSTILE__RATE_LIMITING__REDIS_URL");
        std::fs::remove_file(&path).unwrap();

        assert_eq!(
            loaded.unwrap().rate_limiting.redis_url.as_deref(),
            Some("redis://env:6379")
        );
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = TurnstileConfig::load(None).unwrap();
        assert_eq!(config.rate_limiting.options.points, None);
        assert!(config.rate_limiting.routes.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("turnstile-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "server:\n  http_addr: \"127.0.0.1:9000\"\nrate_limiting:\n  options:\n    points: 9\n",
        )
        .unwrap();

        let config = TurnstileConfig::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.server.http_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.rate_limiting.options.points, Some(9));
    }
}
