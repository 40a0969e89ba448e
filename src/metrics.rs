//! Request metrics (component H) — per-route counters and a rolling
//! latency histogram, exposed on `/manage/stats`.
//!
//! Latency is tracked as the most recent `SAMPLE_CAP` observations per
//! route rather than a true streaming histogram; percentiles are computed
//! on read by sorting the sample window. That's cheap at this scale (a
//! personal/small-team archive server, not a multi-tenant SaaS) and avoids
//! pulling in a dedicated histogram crate for a stats page nobody polls
//! more than once a minute.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

const SAMPLE_CAP: usize = 500;

struct RouteMetrics {
    count: u64,
    samples_ms: std::collections::VecDeque<u64>,
}

impl RouteMetrics {
    fn new() -> Self {
        Self { count: 0, samples_ms: std::collections::VecDeque::with_capacity(SAMPLE_CAP) }
    }

    fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        if self.samples_ms.len() >= SAMPLE_CAP {
            self.samples_ms.pop_front();
        }
        self.samples_ms.push_back(elapsed.as_millis() as u64);
    }

    fn percentiles(&self) -> Percentiles {
        if self.samples_ms.is_empty() {
            return Percentiles { p50: 0, p90: 0, p99: 0 };
        }
        let mut sorted: Vec<u64> = self.samples_ms.iter().copied().collect();
        sorted.sort_unstable();
        Percentiles {
            p50: percentile(&sorted, 0.50),
            p90: percentile(&sorted, 0.90),
            p99: percentile(&sorted, 0.99),
        }
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Percentiles {
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
}

pub struct Metrics {
    started_at: Instant,
    routes: Mutex<HashMap<String, RouteMetrics>>,
    cache_hits: std::sync::atomic::AtomicU64,
    cache_misses: std::sync::atomic::AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            routes: Mutex::new(HashMap::new()),
            cache_hits: std::sync::atomic::AtomicU64::new(0),
            cache_misses: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn record(&self, route: &str, elapsed: Duration) {
        self.routes.lock().entry(route.to_string()).or_insert_with(RouteMetrics::new).record(elapsed);
    }

    pub fn record_cache(&self, hit: bool) {
        if hit {
            self.cache_hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(std::sync::atomic::Ordering::Relaxed);
        let misses = self.cache_misses.load(std::sync::atomic::Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let routes = self.routes.lock();
        let requests_by_route = routes.iter().map(|(k, v)| (k.clone(), v.count)).collect();
        let latency_ms = routes.iter().map(|(k, v)| (k.clone(), v.percentiles())).collect();
        StatsSnapshot {
            requests_by_route,
            latency_ms,
            uptime_seconds: self.uptime_seconds(),
            cache_hit_rate: self.cache_hit_rate(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub requests_by_route: HashMap<String, u64>,
    pub latency_ms: HashMap<String, Percentiles>,
    pub uptime_seconds: u64,
    pub cache_hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_are_monotonic() {
        let metrics = Metrics::new();
        for ms in [10, 20, 30, 40, 50, 100, 200] {
            metrics.record("/search", Duration::from_millis(ms));
        }
        let snapshot = metrics.snapshot();
        let p = snapshot.latency_ms.get("/search").unwrap();
        assert!(p.p50 <= p.p90);
        assert!(p.p90 <= p.p99);
    }

    #[test]
    fn cache_hit_rate_reflects_recorded_outcomes() {
        let metrics = Metrics::new();
        metrics.record_cache(true);
        metrics.record_cache(true);
        metrics.record_cache(false);
        assert!((metrics.cache_hit_rate() - (2.0 / 3.0)).abs() < 1e-9);
    }
}
