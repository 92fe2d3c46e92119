//! # Rate Limiter: Per-Credential Sliding Window
//!
//! Every mutating request is checked against a sliding window keyed by the
//! credential fingerprint (never the raw token). A key may make at most
//! `max_requests` requests in any `window`-long interval; the next one is
//! rejected with a retry hint equal to the time until the oldest counted
//! request leaves the window.
//!
//! ## Backends
//!
//! - **In-process** (default): a mutex-guarded map of timestamp deques. Correct
//!   for a single coordinator process.
//! - **Redis** (`REDIS_URL`): one sorted set per key, scored by wall-clock
//!   milliseconds, updated in a single `MULTI` pipeline so counters are shared
//!   across processes. A rejected request removes its own entry so it does not
//!   count against the caller. If Redis errors, the check falls back to the
//!   in-process window and logs a warning.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::warn;

/// Outcome of a rate-limit check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    local: Mutex<HashMap<String, VecDeque<Instant>>>,
    redis: Option<redis::aio::ConnectionManager>,
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        RateLimiter {
            window,
            max_requests: max_requests.max(1),
            local: Mutex::new(HashMap::new()),
            redis: None,
        }
    }

    /// Share counters through Redis instead of process memory.
    pub fn with_redis(mut self, conn: redis::aio::ConnectionManager) -> Self {
        self.redis = Some(conn);
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Count one request for `key` and decide whether it may proceed.
    pub async fn check(&self, key: &str) -> RateDecision {
        if let Some(conn) = &self.redis {
            match self.check_redis(conn.clone(), key).await {
                Ok(decision) => return decision,
                Err(e) => warn!(error = %e, "redis rate limiter unavailable, using local window"),
            }
        }
        self.check_local(key, Instant::now())
    }

    /// In-process sliding window check at an explicit instant.
    pub fn check_local(&self, key: &str, now: Instant) -> RateDecision {
        let mut map = lock_or_recover(&self.local);
        let hits = map.entry(key.to_string()).or_default();
        while let Some(&oldest) = hits.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                hits.pop_front();
            } else {
                break;
            }
        }
        if hits.len() >= self.max_requests as usize {
            let oldest = hits.front().copied().unwrap_or(now);
            let retry_after = self
                .window
                .saturating_sub(now.saturating_duration_since(oldest));
            return RateDecision::Limited { retry_after };
        }
        hits.push_back(now);
        RateDecision::Allowed {
            remaining: self.max_requests - hits.len() as u32,
        }
    }

    /// Drop keys whose whole history has aged out of the window.
    pub fn prune(&self, now: Instant) -> usize {
        let mut map = lock_or_recover(&self.local);
        let before = map.len();
        let window = self.window;
        map.retain(|_, hits| {
            hits.back()
                .is_some_and(|&last| now.saturating_duration_since(last) < window)
        });
        before - map.len()
    }

    async fn check_redis(
        &self,
        mut conn: redis::aio::ConnectionManager,
        key: &str,
    ) -> redis::RedisResult<RateDecision> {
        let redis_key = format!("ratelimit:{}", key);
        let now_ms = chrono::Utc::now().timestamp_millis();
        let window_ms = self.window.as_millis().min(i64::MAX as u128) as i64;
        let member = format!("{}:{}", now_ms, uuid::Uuid::new_v4());

        let (count, oldest): (u64, Vec<(String, f64)>) = redis::pipe()
            .atomic()
            .zrembyscore(&redis_key, "-inf", now_ms - window_ms)
            .ignore()
            .zadd(&redis_key, &member, now_ms)
            .ignore()
            .zcard(&redis_key)
            .zrange_withscores(&redis_key, 0, 0)
            .pexpire(&redis_key, window_ms)
            .ignore()
            .query_async(&mut conn)
            .await?;

        if count > self.max_requests as u64 {
            let _: () = redis::cmd("ZREM")
                .arg(&redis_key)
                .arg(&member)
                .query_async(&mut conn)
                .await?;
            let oldest_ms = oldest.first().map(|(_, score)| *score as i64).unwrap_or(now_ms);
            let retry_ms = (oldest_ms + window_ms - now_ms).max(0) as u64;
            return Ok(RateDecision::Limited {
                retry_after: Duration::from_millis(retry_ms),
            });
        }
        Ok(RateDecision::Allowed {
            remaining: self.max_requests - count as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 3);
        let now = Instant::now();
        assert_eq!(
            limiter.check_local("k", now),
            RateDecision::Allowed { remaining: 2 }
        );
        assert_eq!(
            limiter.check_local("k", now),
            RateDecision::Allowed { remaining: 1 }
        );
        assert_eq!(
            limiter.check_local("k", now),
            RateDecision::Allowed { remaining: 0 }
        );
        assert!(!limiter.check_local("k", now).is_allowed());
    }

    #[test]
    fn twice_the_limit_rejects_everything_after_limit() {
        let limit = 5;
        let limiter = RateLimiter::new(Duration::from_secs(60), limit);
        let now = Instant::now();
        let outcomes: Vec<bool> = (0..2 * limit)
            .map(|i| {
                limiter
                    .check_local("caller", now + Duration::from_millis(i as u64))
                    .is_allowed()
            })
            .collect();
        assert!(outcomes[..limit as usize].iter().all(|ok| *ok));
        assert!(outcomes[limit as usize..].iter().all(|ok| !*ok));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        let now = Instant::now();
        assert!(limiter.check_local("a", now).is_allowed());
        assert!(limiter.check_local("b", now).is_allowed());
        assert!(!limiter.check_local("a", now).is_allowed());
    }

    #[test]
    fn window_slides() {
        let limiter = RateLimiter::new(Duration::from_secs(10), 2);
        let t0 = Instant::now();
        assert!(limiter.check_local("k", t0).is_allowed());
        assert!(limiter
            .check_local("k", t0 + Duration::from_secs(4))
            .is_allowed());
        match limiter.check_local("k", t0 + Duration::from_secs(6)) {
            RateDecision::Limited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(4));
            }
            other => panic!("expected limit, got {:?}", other),
        }
        // First hit expires at t0+10.
        assert!(limiter
            .check_local("k", t0 + Duration::from_secs(10))
            .is_allowed());
        assert!(!limiter
            .check_local("k", t0 + Duration::from_secs(11))
            .is_allowed());
    }

    #[test]
    fn rejected_requests_do_not_extend_the_window() {
        let limiter = RateLimiter::new(Duration::from_secs(10), 1);
        let t0 = Instant::now();
        assert!(limiter.check_local("k", t0).is_allowed());
        for s in 1..10 {
            assert!(!limiter
                .check_local("k", t0 + Duration::from_secs(s))
                .is_allowed());
        }
        assert!(limiter
            .check_local("k", t0 + Duration::from_secs(10))
            .is_allowed());
    }

    #[test]
    fn prune_removes_idle_keys() {
        let limiter = RateLimiter::new(Duration::from_secs(10), 5);
        let t0 = Instant::now();
        limiter.check_local("old", t0);
        limiter.check_local("fresh", t0 + Duration::from_secs(8));
        assert_eq!(limiter.prune(t0 + Duration::from_secs(12)), 1);
        assert_eq!(limiter.prune(t0 + Duration::from_secs(12)), 0);
    }

    #[test]
    fn zero_limit_is_clamped_to_one() {
        let limiter = RateLimiter::new(Duration::from_secs(1), 0);
        assert_eq!(limiter.max_requests(), 1);
    }

    #[tokio::test]
    async fn concurrent_checks_never_exceed_limit() {
        let limiter = std::sync::Arc::new(RateLimiter::new(Duration::from_secs(60), 10));
        let mut handles = Vec::new();
        for _ in 0..40 {
            let l = limiter.clone();
            handles.push(tokio::spawn(async move { l.check("shared").await.is_allowed() }));
        }
        let mut allowed = 0;
        for h in handles {
            if h.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }
}
