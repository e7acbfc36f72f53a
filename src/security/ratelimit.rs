//! Per-key rate limiting on a rolling-minute quota.
//!
//! Each key (the presented auth token, or `"anonymous"`) gets its own
//! limiter, created lazily on first use. Idle entries are swept periodically
//! so the map cannot grow without bound.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};
use tracing::debug;

type KeyLimiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

struct RateLimitEntry {
    limiter: KeyLimiter,
    last_seen: Instant,
}

/// Duration after which an idle key entry is considered stale.
const STALE_AFTER: Duration = Duration::from_secs(300);

/// Per-key request limiter with a per-minute quota.
///
/// An unconfigured limiter (no quota) allows everything and tracks nothing.
pub struct RateLimiter {
    limiters: DashMap<String, RateLimitEntry>,
    quota: Option<Quota>,
}

impl RateLimiter {
    pub fn new(per_minute: Option<u32>) -> Self {
        let quota = per_minute
            .and_then(NonZeroU32::new)
            .map(Quota::per_minute);
        Self {
            limiters: DashMap::new(),
            quota,
        }
    }

    pub fn configured(&self) -> bool {
        self.quota.is_some()
    }

    /// Check whether a request under `key` is within quota, consuming one
    /// slot if so.
    pub fn allow(&self, key: &str) -> bool {
        let Some(quota) = self.quota else {
            return true;
        };
        let mut entry = self
            .limiters
            .entry(key.to_string())
            .or_insert_with(|| RateLimitEntry {
                limiter: GovernorLimiter::direct(quota),
                last_seen: Instant::now(),
            });
        entry.last_seen = Instant::now();
        entry.limiter.check().is_ok()
    }

    /// Remove entries not seen within the staleness window. Returns the
    /// number removed.
    pub fn sweep_idle(&self) -> usize {
        let cutoff = Instant::now() - STALE_AFTER;
        let before = self.limiters.len();
        self.limiters.retain(|_, entry| entry.last_seen > cutoff);
        let removed = before - self.limiters.len();
        if removed > 0 {
            debug!(removed, remaining = self.limiters.len(), "swept idle rate limit keys");
        }
        removed
    }

    /// Spawn a background task sweeping idle keys until the token fires.
    pub fn spawn_sweep_task(self: &Arc<Self>, shutdown: tokio_util::sync::CancellationToken) {
        if !self.configured() {
            return;
        }
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(STALE_AFTER / 2);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        limiter.sweep_idle();
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }
}
