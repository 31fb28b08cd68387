//! Middleware stack configuration: timeout, body limit, rate limiting.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::size::{ParseSizeError, parse_size};

/// Fallback request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fallback request body limit
pub const DEFAULT_BODY_LIMIT: &str = "2M";

/// Fallback requests allowed per rate limit window
pub const DEFAULT_RATE_LIMIT_REQUESTS: u32 = 100;

/// Fallback rate limit window length
pub const DEFAULT_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Fallback Redis address for the rate limit store
pub const DEFAULT_REDIS_ADDR: &str = "localhost:6379";

/// Middleware configuration
///
/// Zero values (a zero duration, an empty string, a zero count) resolve to
/// the documented defaults through the accessor methods, so an explicit
/// `timeout = 0` behaves the same as leaving the key out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    /// Request timeout in seconds (key: `middleware.timeout`)
    #[serde(default = "default_timeout_secs", rename = "timeout")]
    pub timeout_secs: u64,

    /// Maximum request body size as a human-readable string, e.g. "2M" or
    /// "512K" (key: `middleware.body_limit`)
    #[serde(default = "default_body_limit")]
    pub body_limit: String,

    /// Rate limiting configuration (key: `middleware.rate_limit`)
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

const fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT.as_secs()
}

fn default_body_limit() -> String {
    DEFAULT_BODY_LIMIT.to_string()
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            body_limit: default_body_limit(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl MiddlewareConfig {
    /// Get the request timeout as a Duration, falling back to the default
    /// when the configured value is zero
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        if self.timeout_secs == 0 {
            DEFAULT_TIMEOUT
        } else {
            Duration::from_secs(self.timeout_secs)
        }
    }

    /// Parse the configured body limit into bytes, falling back to the
    /// default when the configured string is empty
    pub fn max_body_bytes(&self) -> Result<usize, ParseSizeError> {
        let limit = if self.body_limit.is_empty() {
            DEFAULT_BODY_LIMIT
        } else {
            &self.body_limit
        };
        parse_size(limit)
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window (key: `middleware.rate_limit.requests`)
    #[serde(default = "default_requests")]
    pub requests: u32,

    /// Window length in seconds (key: `middleware.rate_limit.duration`)
    #[serde(default = "default_window_secs", rename = "duration")]
    pub window_secs: u64,

    /// Backing store selection (key: `middleware.rate_limit.store`)
    #[serde(default)]
    pub store: StoreSelection,

    /// Redis address as `host:port`, used when the store is `redis`
    /// (key: `middleware.rate_limit.redis_addr`)
    #[serde(default = "default_redis_addr")]
    pub redis_addr: String,
}

const fn default_requests() -> u32 {
    DEFAULT_RATE_LIMIT_REQUESTS
}

const fn default_window_secs() -> u64 {
    DEFAULT_RATE_LIMIT_WINDOW.as_secs()
}

fn default_redis_addr() -> String {
    DEFAULT_REDIS_ADDR.to_string()
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: default_requests(),
            window_secs: default_window_secs(),
            store: StoreSelection::default(),
            redis_addr: default_redis_addr(),
        }
    }
}

impl RateLimitConfig {
    /// Requests allowed per window, falling back to the default when the
    /// configured value is zero
    #[must_use]
    pub const fn max_requests(&self) -> u32 {
        if self.requests == 0 {
            DEFAULT_RATE_LIMIT_REQUESTS
        } else {
            self.requests
        }
    }

    /// Window length as a Duration, falling back to the default when the
    /// configured value is zero
    #[must_use]
    pub const fn window(&self) -> Duration {
        if self.window_secs == 0 {
            DEFAULT_RATE_LIMIT_WINDOW
        } else {
            Duration::from_secs(self.window_secs)
        }
    }

    /// Connection URL for the Redis store, falling back to the default
    /// address when the configured one is empty
    #[must_use]
    pub fn redis_url(&self) -> String {
        let addr = if self.redis_addr.is_empty() {
            DEFAULT_REDIS_ADDR
        } else {
            &self.redis_addr
        };
        format!("redis://{addr}")
    }
}

/// Rate limit backing store selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreSelection {
    /// In-process store, counters are lost on restart (default)
    #[default]
    Memory,
    /// Shared Redis store, counters survive restarts and span replicas
    Redis,
}

impl fmt::Display for StoreSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Redis => write!(f, "redis"),
        }
    }
}

impl std::str::FromStr for StoreSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            _ => Err(format!("Invalid store: {s}. Use 'memory' or 'redis'")),
        }
    }
}
