//! Fixed-window request rate limiting
//!
//! Process-local and advisory: buckets live in one in-process map with no
//! cross-process coordination, which is acceptable because the limiter is
//! back-pressure for well-behaved clients, not a security boundary.

use axum::http::HeaderMap;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::net::SocketAddr;

/// Stale buckets inspected per call when evicting lazily.
const EVICTION_SCAN_LIMIT: usize = 50;

#[derive(Debug, Clone)]
struct Bucket {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// Outcome of a rate-limit check. A rejection is a value, not an error.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub ok: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Seconds until the window resets; set only on rejection.
    pub retry_after_secs: Option<u64>,
}

#[derive(Default)]
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-and-increment for `bucket_id:client_id` in the current window.
    ///
    /// The first request in a window creates the bucket; while the window is
    /// open each call increments, and calls beyond `limit` are rejected
    /// without incrementing further. An elapsed window resets lazily on the
    /// next access.
    pub fn apply(
        &self,
        bucket_id: &str,
        client_id: &str,
        limit: u32,
        window: Duration,
    ) -> RateLimitDecision {
        let now = Utc::now();
        self.evict_stale(now);

        let key = format!("{bucket_id}:{client_id}");
        let mut entry = self.buckets.entry(key).or_insert_with(|| Bucket {
            count: 0,
            reset_at: now + window,
        });

        if entry.reset_at <= now {
            entry.count = 0;
            entry.reset_at = now + window;
        }

        if entry.count >= limit {
            let retry_after = (entry.reset_at - now).num_seconds().max(0) as u64;
            return RateLimitDecision {
                ok: false,
                limit,
                remaining: 0,
                reset_at: entry.reset_at,
                retry_after_secs: Some(retry_after),
            };
        }

        entry.count += 1;
        RateLimitDecision {
            ok: true,
            limit,
            remaining: limit - entry.count,
            reset_at: entry.reset_at,
            retry_after_secs: None,
        }
    }

    /// Bounded eviction pass: inspect at most `EVICTION_SCAN_LIMIT` buckets
    /// and drop the expired ones, so memory stays bounded without a
    /// background task.
    fn evict_stale(&self, now: DateTime<Utc>) {
        let stale: Vec<String> = self
            .buckets
            .iter()
            .take(EVICTION_SCAN_LIMIT)
            .filter(|entry| entry.value().reset_at <= now)
            .map(|entry| entry.key().clone())
            .collect();

        for key in stale {
            self.buckets.remove(&key);
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Resolve the client id used for rate-limit bucketing: first
/// `x-forwarded-for` entry, else the socket address, else `"unknown"`.
pub fn client_id(headers: &HeaderMap, socket_addr: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    socket_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Emit `X-RateLimit-*` headers, plus `Retry-After` on rejection.
pub fn set_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(
        "x-ratelimit-limit",
        decision.limit.to_string().parse().expect("numeric header"),
    );
    headers.insert(
        "x-ratelimit-remaining",
        decision
            .remaining
            .to_string()
            .parse()
            .expect("numeric header"),
    );
    headers.insert(
        "x-ratelimit-reset",
        decision
            .reset_at
            .timestamp()
            .to_string()
            .parse()
            .expect("numeric header"),
    );
    if let Some(retry_after) = decision.retry_after_secs {
        headers.insert(
            "retry-after",
            retry_after.to_string().parse().expect("numeric header"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_limit_rejects_n_plus_one() {
        let limiter = RateLimiter::new();

        for i in 0..3 {
            let d = limiter.apply("write", "1.2.3.4", 3, Duration::seconds(60));
            assert!(d.ok, "request {i} should pass");
            assert_eq!(d.remaining, 2 - i);
        }

        let rejected = limiter.apply("write", "1.2.3.4", 3, Duration::seconds(60));
        assert!(!rejected.ok);
        assert_eq!(rejected.remaining, 0);
        assert!(rejected.retry_after_secs.is_some());

        // Rejections do not keep incrementing the bucket
        let again = limiter.apply("write", "1.2.3.4", 3, Duration::seconds(60));
        assert!(!again.ok);
    }

    #[test]
    fn test_window_resets_after_elapse() {
        let limiter = RateLimiter::new();
        let window = Duration::milliseconds(30);

        assert!(limiter.apply("read", "c", 1, window).ok);
        assert!(!limiter.apply("read", "c", 1, window).ok);

        std::thread::sleep(std::time::Duration::from_millis(50));
        let fresh = limiter.apply("read", "c", 1, window);
        assert!(fresh.ok);
        assert_eq!(fresh.remaining, 0);
    }

    #[test]
    fn test_buckets_are_keyed_per_client_and_endpoint() {
        let limiter = RateLimiter::new();
        let window = Duration::seconds(60);

        assert!(limiter.apply("write", "a", 1, window).ok);
        assert!(!limiter.apply("write", "a", 1, window).ok);
        assert!(limiter.apply("write", "b", 1, window).ok);
        assert!(limiter.apply("read", "a", 1, window).ok);
    }

    #[test]
    fn test_stale_buckets_are_evicted() {
        let limiter = RateLimiter::new();
        let window = Duration::milliseconds(10);

        for i in 0..10 {
            limiter.apply("write", &format!("client-{i}"), 5, window);
        }
        assert_eq!(limiter.bucket_count(), 10);

        std::thread::sleep(std::time::Duration::from_millis(30));
        limiter.apply("write", "fresh", 5, Duration::seconds(60));
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[test]
    fn test_client_id_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.1, 198.51.100.1"),
        );
        let socket: SocketAddr = "192.168.1.1:443".parse().unwrap();

        assert_eq!(client_id(&headers, Some(socket)), "203.0.113.1");
        assert_eq!(client_id(&HeaderMap::new(), Some(socket)), "192.168.1.1");
        assert_eq!(client_id(&HeaderMap::new(), None), "unknown");
    }
}
