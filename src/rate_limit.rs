use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use dashmap::DashMap;

/// Sliding window in-memory rate limiter (pod local).
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    store: Arc<DashMap<String, VecDeque<Instant>>>,
    pub enabled: bool,
}

impl InMemoryRateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self { store: Arc::new(DashMap::new()), enabled }
    }

    /// Returns true if allowed, false if limited.
    pub fn check(&self, key: &str, limit: usize, window: Duration) -> bool {
        if !self.enabled { return true; }
        let now = Instant::now();
        let mut entry = self.store.entry(key.to_string()).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) >= window { entry.pop_front(); } else { break; }
        }
        if entry.len() < limit {
            entry.push_back(now);
            true
        } else {
            false
        }
    }
}

/// Convenience wrapper holding per-action config derived from env.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub auth_limit: usize,
    pub auth_window: Duration,
    pub listing_limit: usize,
    pub listing_window: Duration,
    pub message_limit: usize,
    pub message_window: Duration,
    pub report_limit: usize,
    pub report_window: Duration,
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        fn usize_env(name: &str, default: usize) -> usize { std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default) }
        fn dur_env(name: &str, default: u64) -> Duration { Duration::from_secs(std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)) }
        Self {
            auth_limit: usize_env("RL_AUTH_LIMIT", 10),
            auth_window: dur_env("RL_AUTH_WINDOW", 300),
            listing_limit: usize_env("RL_LISTING_LIMIT", 5),
            listing_window: dur_env("RL_LISTING_WINDOW", 300),
            message_limit: usize_env("RL_MESSAGE_LIMIT", 30),
            message_window: dur_env("RL_MESSAGE_WINDOW", 60),
            report_limit: usize_env("RL_REPORT_LIMIT", 5),
            report_window: dur_env("RL_REPORT_WINDOW", 3600),
        }
    }
}

/// High level guard used by handlers.
#[derive(Clone)]
pub struct RateLimiterFacade {
    pub limiter: InMemoryRateLimiter,
    pub cfg: RateLimitConfig,
}

impl RateLimiterFacade {
    pub fn new(limiter: InMemoryRateLimiter, cfg: RateLimitConfig) -> Self { Self { limiter, cfg } }
    pub fn allow_auth(&self, ip: &str) -> bool { self.limiter.check(&format!("auth:{ip}"), self.cfg.auth_limit, self.cfg.auth_window) }
    pub fn allow_listing(&self, ip: &str) -> bool { self.limiter.check(&format!("listing:{ip}"), self.cfg.listing_limit, self.cfg.listing_window) }
    pub fn allow_message(&self, ip: &str) -> bool { self.limiter.check(&format!("message:{ip}"), self.cfg.message_limit, self.cfg.message_window) }
    pub fn allow_report(&self, ip: &str) -> bool { self.limiter.check(&format!("report:{ip}"), self.cfg.report_limit, self.cfg.report_window) }
}
