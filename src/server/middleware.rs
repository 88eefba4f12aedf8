//! Request middleware: bearer auth, per-IP rate limiting, CORS, and the
//! request log.
//!
//! Layer order (outermost first) is panic recovery → request log → CORS
//! → rate limit → bearer auth; auth applies to `/api/*` only.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tower_http::cors::{AllowOrigin, CorsLayer};

use super::error::ApiError;
use super::AppState;

/// Sustained request rate per client IP.
const RATE_PER_SEC: f64 = 10.0;
/// Burst capacity per client IP.
const BURST: f64 = 20.0;
/// Buckets idle this long are dropped by the janitor.
const BUCKET_IDLE_EVICT: Duration = Duration::from_secs(600);
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token-bucket rate limiter keyed by client IP.
///
/// Buckets refill continuously at [`RATE_PER_SEC`] up to [`BURST`]. The
/// map is a `DashMap` so concurrent handlers only contend per shard.
pub struct RateLimiter {
    buckets: DashMap<IpAddr, Bucket>,
    rate: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_limits(RATE_PER_SEC, BURST)
    }

    pub fn with_limits(rate: f64, burst: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            rate,
            burst,
        }
    }

    /// Takes one token for `ip`. Returns `false` when the bucket is empty.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(ip).or_insert_with(|| Bucket {
            tokens: self.burst,
            last: now,
        });
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drops buckets that have not been touched within `max_idle`.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.last.elapsed() < max_idle);
        before - self.buckets.len()
    }

    /// Spawns the background janitor that evicts idle buckets.
    pub fn start_janitor(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(JANITOR_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let evicted = limiter.evict_idle(BUCKET_IDLE_EVICT);
                        if evicted > 0 {
                            log::debug!("evicted {evicted} idle rate-limit bucket(s)");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            log::debug!("rate-limit janitor stopped");
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// 429 with the canonical body when the caller's bucket is empty.
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if state.rate_limiter.check(addr.ip()) {
        next.run(request).await
    } else {
        ApiError::RateLimited("rate limit exceeded".to_string()).into_response()
    }
}

/// Bearer-token check for `/api/*`.
///
/// With no token configured (debug mode only) the check is skipped.
/// Token comparison must be constant-time.
pub async fn bearer_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.auth_token else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if constant_time_eq(token, expected) => next.run(request).await,
        _ => ApiError::Unauthorized.into_response(),
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// One log line per request with method, path, status, and latency.
pub async fn request_log(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    log::info!(
        "{method} {path} -> {} ({} ms)",
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}

/// Rewrites successful CORS preflight responses to 204 No Content.
pub async fn preflight_no_content(request: Request, next: Next) -> Response {
    let is_preflight = request.method() == Method::OPTIONS;
    let mut response = next.run(request).await;
    if is_preflight && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

/// Builds the CORS layer from the configured origin allowlist.
///
/// Only listed origins are echoed back; everything else gets no allow
/// header. Wildcards are rejected at config load, never here.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let list: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("ignoring unparsable CORS origin {origin:?}");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(list))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static("x-user-id"),
        ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, last])
    }

    #[test]
    fn test_burst_allows_exactly_burst_requests() {
        let limiter = RateLimiter::with_limits(10.0, 20.0);
        for i in 0..20 {
            assert!(limiter.check(ip(1)), "request {i} within burst must pass");
        }
        // The burst is spent; a back-to-back 21st request is refused
        // (refill over a few microseconds is far below one token).
        assert!(!limiter.check(ip(1)));
    }

    #[test]
    fn test_buckets_are_per_ip() {
        let limiter = RateLimiter::with_limits(10.0, 1.0);
        assert!(limiter.check(ip(1)));
        assert!(!limiter.check(ip(1)));
        assert!(limiter.check(ip(2)));
    }

    #[test]
    fn test_bucket_refills_over_time() {
        let limiter = RateLimiter::with_limits(1000.0, 1.0);
        assert!(limiter.check(ip(1)));
        assert!(!limiter.check(ip(1)));
        std::thread::sleep(Duration::from_millis(10));
        assert!(limiter.check(ip(1)));
    }

    #[test]
    fn test_evict_idle_drops_only_stale_buckets() {
        let limiter = RateLimiter::with_limits(10.0, 20.0);
        limiter.check(ip(1));
        limiter.check(ip(2));
        assert_eq!(limiter.evict_idle(Duration::from_secs(600)), 0);
        assert_eq!(limiter.evict_idle(Duration::ZERO), 2);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secres"));
        assert!(!constant_time_eq("secret", "longer-secret"));
        assert!(!constant_time_eq("", "x"));
    }
}
