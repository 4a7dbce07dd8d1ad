//! Per-user fixed-window rate limiting with tier multipliers

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::config::SchedulerConfig;
use crate::error::{AppError, Result};

/// Caller classification that scales rate limits and queue priority
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Supporter,
    Premium,
}

impl Tier {
    /// Default queue priority for callers of this tier
    pub fn priority(&self) -> u8 {
        match self {
            Tier::Free => 0,
            Tier::Supporter => 1,
            Tier::Premium => 2,
        }
    }
}

#[derive(Debug, Clone)]
struct UserRateState {
    count: u32,
    window_start: Instant,
    tier: Tier,
}

/// Rolling request counters keyed by user id
pub struct UserRateLimiter {
    base_limit: u32,
    window: Duration,
    multipliers: HashMap<Tier, f64>,
    users: DashMap<String, UserRateState>,
}

impl UserRateLimiter {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            base_limit: config.user_rate_limit,
            window: config.rate_window(),
            multipliers: config.tier_multipliers.clone(),
            users: DashMap::new(),
        }
    }

    /// `floor(base_limit * multiplier)` for the tier
    pub fn effective_limit(&self, tier: Tier) -> u32 {
        let multiplier = self.multipliers.get(&tier).copied().unwrap_or(1.0).max(0.0);
        (self.base_limit as f64 * multiplier).floor() as u32
    }

    /// Check the owner's budget and take one slot from it.
    ///
    /// The entry lock is held across the check and the increment, so two
    /// concurrent admissions cannot both claim the last slot.
    pub fn try_acquire(&self, owner: &str, tier: Tier) -> Result<()> {
        let limit = self.effective_limit(tier);
        let now = Instant::now();

        let mut state = self
            .users
            .entry(owner.to_string())
            .or_insert_with(|| UserRateState {
                count: 0,
                window_start: now,
                tier,
            });

        if now.duration_since(state.window_start) >= self.window {
            state.count = 0;
            state.window_start = now;
        }
        state.tier = tier;

        if state.count >= limit {
            debug!(owner = %owner, count = state.count, limit, "User rate limit reached");
            return Err(AppError::RateLimited {
                limit,
                window_secs: self.window.as_secs(),
            });
        }

        state.count += 1;
        Ok(())
    }

    /// Give back a slot taken by `try_acquire` for a request that was never queued
    pub fn release(&self, owner: &str) {
        if let Some(mut state) = self.users.get_mut(owner) {
            state.count = state.count.saturating_sub(1);
        }
    }

    /// Slots left in the owner's current window
    pub fn remaining(&self, owner: &str, tier: Tier) -> u32 {
        let limit = self.effective_limit(tier);
        match self.users.get(owner) {
            Some(state) if state.window_start.elapsed() < self.window => {
                limit.saturating_sub(state.count)
            }
            _ => limit,
        }
    }

    /// Drop entries whose window has lapsed; returns how many were removed
    pub fn sweep(&self) -> usize {
        let before = self.users.len();
        let window = self.window;
        self.users.retain(|_, state| state.window_start.elapsed() < window);
        let removed = before.saturating_sub(self.users.len());
        if removed > 0 {
            debug!(removed, "Swept expired rate-limit entries");
        }
        removed
    }

    pub fn tracked_users(&self) -> usize {
        self.users.len()
    }

    /// Tier last seen for an owner
    pub fn tier_of(&self, owner: &str) -> Option<Tier> {
        self.users.get(owner).map(|s| s.tier)
    }

    /// Periodically reclaim expired entries until the limiter is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let limiter: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match limiter.upgrade() {
                    Some(limiter) => {
                        limiter.sweep();
                    }
                    None => break,
                }
            }
        })
    }
}
