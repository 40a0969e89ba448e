//! Per-IP sliding-window rate limiter (component H).
//!
//! Each client IP gets a [`RateBucket`] ring of request timestamps; a
//! request is allowed when fewer than `limit` timestamps fall within the
//! trailing 60-second window. `limit == 0` disables the limiter entirely.

use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

use crate::types::RateBucket;

const WINDOW_MS: i64 = 60_000;

pub struct RateLimiter {
    limit: u32,
    buckets: DashMap<IpAddr, RateBucket>,
}

#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after_secs: u64,
}

impl RateLimiter {
    pub fn new(limit: u32) -> Self {
        Self { limit, buckets: DashMap::new() }
    }

    pub fn enabled(&self) -> bool {
        self.limit > 0
    }

    /// Records this request against `ip`'s bucket and decides whether it's
    /// within the limit. Always records the timestamp even when denying,
    /// so a client that keeps hammering the endpoint doesn't get a fresh
    /// window by virtue of being rejected.
    pub fn check(&self, ip: IpAddr) -> Decision {
        if !self.enabled() {
            return Decision { allowed: true, retry_after_secs: 0 };
        }

        let now_ms = now_ms();
        let bucket = self.buckets.entry(ip).or_insert_with(RateBucket::new);
        let mut timestamps = bucket.timestamps_ms.lock();

        while let Some(&front) = timestamps.front() {
            if now_ms - front > WINDOW_MS {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() >= self.limit as usize {
            let oldest = *timestamps.front().unwrap_or(&now_ms);
            let retry_after_ms = (WINDOW_MS - (now_ms - oldest)).max(0);
            return Decision { allowed: false, retry_after_secs: (retry_after_ms as u64).div_ceil(1000) };
        }

        timestamps.push_back(now_ms);
        Decision { allowed: true, retry_after_secs: 0 }
    }
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_limit_then_denies() {
        let limiter = RateLimiter::new(3);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(limiter.check(ip).allowed);
        assert!(limiter.check(ip).allowed);
        assert!(limiter.check(ip).allowed);
        let decision = limiter.check(ip);
        assert!(!decision.allowed);
        assert!(decision.retry_after_secs > 0);
    }

    #[test]
    fn zero_limit_disables_limiting() {
        let limiter = RateLimiter::new(0);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        for _ in 0..1000 {
            assert!(limiter.check(ip).allowed);
        }
    }

    #[test]
    fn buckets_are_independent_per_ip() {
        let limiter = RateLimiter::new(1);
        let a: IpAddr = "1.1.1.1".parse().unwrap();
        let b: IpAddr = "2.2.2.2".parse().unwrap();
        assert!(limiter.check(a).allowed);
        assert!(!limiter.check(a).allowed);
        assert!(limiter.check(b).allowed);
    }
}
