//! Rate limiting middleware
//!
//! Limits requests per client IP over a configured window. The allow/deny
//! decision is delegated to a backing store selected by configuration: an
//! in-process token bucket, or a shared Redis fixed-window counter when
//! several replicas must agree on one budget.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, Request},
    response::{IntoResponse, Response},
};
use middlekit_config::{RateLimitConfig, StoreSelection};
use thiserror::Error;
use tokio::sync::RwLock;
use tower::{Layer, Service};

use crate::error::ApiError;

/// How often stale in-memory buckets are swept
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Errors raised by a rate limit backing store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The Redis store failed to connect or answer
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store is unreachable for another reason
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Backing store deciding whether a client may proceed
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Record a hit for `key` and return whether it is within the limit
    async fn allow(&self, key: &str) -> Result<bool, StoreError>;
}

/// Token bucket entry for a single client
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_tokens: f64) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: Instant::now(),
        }
    }

    /// Try to consume a token, returning true if allowed
    fn try_consume(&mut self, refill_per_second: f64, max_tokens: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();

        self.tokens = elapsed
            .mul_add(refill_per_second, self.tokens)
            .min(max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// In-process store: one token bucket per client key
#[derive(Debug)]
pub struct MemoryStore {
    buckets: RwLock<HashMap<String, TokenBucket>>,
    refill_per_second: f64,
    max_tokens: f64,
}

impl MemoryStore {
    /// Create a store allowing `requests` hits per `window`
    #[must_use]
    pub fn new(requests: u32, window: Duration) -> Self {
        let max_tokens = f64::from(requests.max(1));
        let window_secs = window.as_secs_f64().max(1.0);
        Self {
            buckets: RwLock::new(HashMap::new()),
            refill_per_second: max_tokens / window_secs,
            max_tokens,
        }
    }

    /// Drop buckets that have been idle longer than `older_than`
    pub async fn cleanup(&self, older_than: Duration) {
        let mut buckets = self.buckets.write().await;
        let cutoff = Instant::now()
            .checked_sub(older_than)
            .unwrap_or_else(Instant::now);

        buckets.retain(|_, bucket| bucket.last_refill > cutoff);
    }

    /// Periodically sweep stale buckets until the store is dropped
    fn spawn_cleanup(store: &Arc<Self>, max_age: Duration) {
        let weak: Weak<Self> = Arc::downgrade(store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(store) => store.cleanup(max_age).await,
                    None => break,
                }
            }
        });
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn allow(&self, key: &str) -> Result<bool, StoreError> {
        let mut buckets = self.buckets.write().await;

        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(self.max_tokens));

        Ok(bucket.try_consume(self.refill_per_second, self.max_tokens))
    }
}

/// Shared Redis store: fixed-window counter per client key
pub struct RedisStore {
    connection: redis::aio::ConnectionManager,
    limit: u32,
    window: Duration,
}

impl RedisStore {
    /// Connect to Redis at `url` and allow `requests` hits per `window`
    pub async fn connect(url: &str, requests: u32, window: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        Ok(Self {
            connection,
            limit: requests.max(1),
            window,
        })
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn allow(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let key = format!("ratelimit:{key}");

        let count: u64 = redis::cmd("INCR").arg(&key).query_async(&mut conn).await?;
        if count == 1 {
            let _: i64 = redis::cmd("EXPIRE")
                .arg(&key)
                .arg(self.window.as_secs().max(1))
                .query_async(&mut conn)
                .await?;
        }

        Ok(count <= u64::from(self.limit))
    }
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

/// Layer that applies rate limiting
#[derive(Clone)]
pub struct RateLimitLayer {
    store: Arc<dyn RateLimitStore>,
    excluded_paths: Vec<String>,
}

impl RateLimitLayer {
    /// Create a rate limiter backed by an explicit store
    #[must_use]
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            store,
            excluded_paths: vec!["/health".to_string()],
        }
    }

    /// Build the store named by the configuration and wrap it in a layer
    pub async fn from_config(config: &RateLimitConfig) -> Result<Self, StoreError> {
        let requests = config.max_requests();
        let window = config.window();

        let store: Arc<dyn RateLimitStore> = match config.store {
            StoreSelection::Memory => {
                let store = Arc::new(MemoryStore::new(requests, window));
                MemoryStore::spawn_cleanup(&store, window.saturating_mul(2));
                store
            },
            StoreSelection::Redis => {
                Arc::new(RedisStore::connect(&config.redis_url(), requests, window).await?)
            },
        };

        Ok(Self::new(store))
    }

    /// Add paths that should bypass rate limiting
    #[must_use]
    pub fn exclude_paths(mut self, paths: Vec<String>) -> Self {
        self.excluded_paths.extend(paths);
        self
    }
}

impl fmt::Debug for RateLimitLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer")
            .field("excluded_paths", &self.excluded_paths)
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimit<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimit {
            inner,
            store: Arc::clone(&self.store),
            excluded_paths: self.excluded_paths.clone(),
        }
    }
}

/// Middleware service for rate limiting
#[derive(Clone)]
pub struct RateLimit<S> {
    inner: S,
    store: Arc<dyn RateLimitStore>,
    excluded_paths: Vec<String>,
}

impl<S: fmt::Debug> fmt::Debug for RateLimit<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimit")
            .field("inner", &self.inner)
            .field("excluded_paths", &self.excluded_paths)
            .finish_non_exhaustive()
    }
}

impl<S> Service<Request> for RateLimit<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let store = Arc::clone(&self.store);
        let excluded_paths = self.excluded_paths.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let path = req.uri().path();
            if excluded_paths.iter().any(|p| path.starts_with(p)) {
                return inner.call(req).await;
            }

            let client_ip = extract_client_ip(&req);

            match store.allow(&client_ip.to_string()).await {
                Ok(true) => inner.call(req).await,
                Ok(false) => Ok(ApiError::rate_limited().into_response()),
                Err(err) => {
                    // Fail open when the store is unreachable
                    tracing::warn!(error = %err, "rate limit store unavailable, allowing request");
                    inner.call(req).await
                },
            }
        })
    }
}

fn extract_client_ip(req: &Request) -> IpAddr {
    // X-Forwarded-For first (reverse proxy setups); the first entry in the
    // chain is the original client
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(ip) = forwarded
            .split(',')
            .next()
            .and_then(|s| s.trim().parse::<IpAddr>().ok())
        {
            return ip;
        }
    }

    // Direct connection address when the server was started with connect info
    if let Some(info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return info.0.ip();
    }

    IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
}
