use std::time::Duration;

use moka::future::Cache;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum RateMeterError {
    #[error("refill rate must be positive, got {0}")]
    NonPositiveRate(f64),
}

/// The outcome of one admission check.
#[derive(Debug)]
pub struct Admission {
    pub allowed: bool,
    pub remaining: f64,
    /// How long until one token becomes available again; zero when allowed.
    pub reset_after: Duration,
}

#[derive(Debug, Clone)]
pub struct BucketState {
    pub tokens: f64,
    pub capacity: f64,
    pub last_update: Instant,
    last_allowed: bool,
}

/// Token buckets in a bounded in-memory cache. Updates to one key are
/// linearized by the cache's entry-level upsert; idle buckets fall out after
/// `idle_timeout` (the reaper drives the eviction housekeeping).
#[derive(Debug)]
pub struct MeterStorage {
    buckets: Cache<String, BucketState>,
}

impl MeterStorage {
    pub fn new(max_buckets: u64, idle_timeout: Duration) -> Self {
        let buckets = Cache::builder()
            .max_capacity(max_buckets)
            .time_to_idle(idle_timeout)
            .build();

        Self { buckets }
    }

    /// Accrue, then try to deduct `cost` tokens from `key`'s bucket. A missing
    /// bucket starts at full capacity (so its first grant leaves capacity − 1).
    pub async fn check_and_update(
        &self,
        key: &str,
        rate_per_sec: f64,
        capacity: usize,
        cost: u32,
    ) -> Result<Admission, RateMeterError> {
        if rate_per_sec <= 0.0 {
            return Err(RateMeterError::NonPositiveRate(rate_per_sec));
        }

        let now = Instant::now();
        let capacity_f64 = capacity as f64;
        let cost_f64 = cost as f64;

        let new_state = self
            .buckets
            .entry_by_ref(key)
            .and_upsert_with(|entry| {
                let mut state = entry.map(|v| v.into_value()).unwrap_or(BucketState {
                    tokens: capacity_f64,
                    capacity: capacity_f64,
                    last_update: now,
                    last_allowed: false,
                });

                let elapsed = now.duration_since(state.last_update).as_secs_f64();
                let added = elapsed * rate_per_sec;

                state.tokens = (state.tokens + added).min(capacity_f64);

                let allowed = if state.tokens >= cost_f64 {
                    state.tokens -= cost_f64;
                    true
                } else {
                    false
                };

                std::future::ready(BucketState {
                    tokens: state.tokens,
                    capacity: capacity_f64,
                    last_update: now,
                    last_allowed: allowed,
                })
            })
            .await
            .into_value();

        let reset_after = if new_state.last_allowed {
            Duration::ZERO
        } else {
            let needed = cost_f64 - new_state.tokens;
            Duration::from_secs_f64(needed / rate_per_sec)
        };

        Ok(Admission {
            allowed: new_state.last_allowed,
            remaining: new_state.tokens,
            reset_after,
        })
    }

    /// A point-in-time copy of every live bucket.
    pub fn snapshot(&self) -> Vec<(String, BucketState)> {
        self.buckets
            .iter()
            .map(|(key, state)| ((*key).clone(), state))
            .collect()
    }

    /// Run the cache's deferred housekeeping (expiry, eviction).
    pub async fn run_pending_tasks(&self) {
        self.buckets.run_pending_tasks().await;
    }
}
