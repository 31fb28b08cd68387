//! Application configuration
//!
//! Split into focused sub-modules:
//! - `server`: HTTP server settings (bind address, log format, shutdown)
//! - `middleware`: middleware stack settings (timeout, body limit, rate limit)
//! - `size`: human-readable size string parsing for the body limit
//!
//! Values are read once at startup from an optional `config.toml` plus
//! `MIDDLEKIT_*` environment variables; the resulting record is immutable.

mod middleware;
mod server;
mod size;

use serde::{Deserialize, Serialize};

pub use middleware::{
    DEFAULT_BODY_LIMIT, DEFAULT_RATE_LIMIT_REQUESTS, DEFAULT_RATE_LIMIT_WINDOW, DEFAULT_REDIS_ADDR,
    DEFAULT_TIMEOUT, MiddlewareConfig, RateLimitConfig, StoreSelection,
};
pub use server::ServerConfig;
pub use size::{ParseSizeError, parse_size};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Middleware configuration
    #[serde(default)]
    pub middleware: MiddlewareConfig,
}

impl AppConfig {
    /// Load configuration from environment and optional file
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            // Start with defaults
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 3000)?
            // Load from file if exists
            .add_source(config::File::with_name("config").required(false))
            // Override with environment variables (e.g., MIDDLEKIT_SERVER__PORT,
            // MIDDLEKIT_MIDDLEWARE__RATE_LIMIT__STORE)
            .add_source(
                config::Environment::with_prefix("MIDDLEKIT")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
