// Fixed-window rate limiting per (route class, caller)

use std::{
    borrow::Cow,
    fmt,
    net::IpAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use crate::{booking::UserId, clock::Clock, config::RateLimitConfig};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteClass(Cow<'static, str>);

impl RouteClass {
    pub const CREATE_BOOKING: RouteClass = RouteClass(Cow::Borrowed("create-booking"));
    pub const UPDATE_BOOKING: RouteClass = RouteClass(Cow::Borrowed("update-booking"));
    pub const CANCEL_BOOKING: RouteClass = RouteClass(Cow::Borrowed("cancel-booking"));
    pub const LIST_BOOKINGS: RouteClass = RouteClass(Cow::Borrowed("list-bookings"));
    pub const CHECK_AVAILABILITY: RouteClass = RouteClass(Cow::Borrowed("check-availability"));

    pub fn new(name: impl Into<String>) -> Self {
        RouteClass(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Authenticated user, or the remote address otherwise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallerId {
    User(UserId),
    Ip(IpAddr),
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallerId::User(id) => write!(f, "user:{id}"),
            CallerId::Ip(ip) => write!(f, "ip:{ip}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey {
    pub route: RouteClass,
    pub caller: CallerId,
}

impl RateKey {
    pub fn new(route: RouteClass, caller: CallerId) -> Self {
        Self { route, caller }
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.route, self.caller)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Rate limit of {limit} requests per {}s exceeded for {route} ({caller})", .window.as_secs())]
pub struct RateLimitExceeded {
    pub route: String,
    pub caller: String,
    pub limit: u32,
    pub window: Duration,
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    window_start: Instant,
    count: u32,
}

impl RateWindow {
    fn starting_at(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    fn is_expired(&self, now: Instant, window: Duration) -> bool {
        now.saturating_duration_since(self.window_start) >= window
    }
}

// expired windows are swept once per this many checks
const SWEEP_EVERY: u64 = 1024;

pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    windows: DashMap<RateKey, RateWindow>,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            windows: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    pub fn allow(&self, key: &RateKey) -> bool {
        self.check(key).is_ok()
    }

    // Rejected requests still count
    pub fn check(&self, key: &RateKey) -> Result<RateDecision, RateLimitExceeded> {
        let rule = self.config.rule_for(&key.route);
        let window = rule.window();
        let now = self.clock.now();

        // the entry guard holds the shard lock, so rollover and increment are one step
        let mut entry = self
            .windows
            .entry(key.clone())
            .or_insert_with(|| RateWindow::starting_at(now));
        if entry.is_expired(now, window) {
            *entry = RateWindow::starting_at(now);
        }
        entry.count = entry.count.saturating_add(1);

        let count = entry.count;
        let reset_after = window.saturating_sub(now.saturating_duration_since(entry.window_start));
        drop(entry);

        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            let purged = self.purge_expired();
            if purged > 0 {
                debug!(purged, "expired rate windows dropped");
            }
        }

        if count > rule.limit {
            debug!(key = %key, count, limit = rule.limit, "rate limit exceeded");
            return Err(RateLimitExceeded {
                route: key.route.to_string(),
                caller: key.caller.to_string(),
                limit: rule.limit,
                window,
                retry_after: reset_after,
            });
        }

        Ok(RateDecision {
            limit: rule.limit,
            remaining: rule.limit - count,
            reset_after,
        })
    }

    pub fn usage(&self, key: &RateKey) -> u32 {
        let window = self.config.rule_for(&key.route).window();
        let now = self.clock.now();
        self.windows
            .get(key)
            .filter(|w| !w.is_expired(now, window))
            .map(|w| w.count)
            .unwrap_or(0)
    }

    pub fn reset(&self, key: &RateKey) -> bool {
        self.windows.remove(key).is_some()
    }

    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows
            .retain(|key, w| !w.is_expired(now, self.config.rule_for(&key.route).window()));
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }
}
