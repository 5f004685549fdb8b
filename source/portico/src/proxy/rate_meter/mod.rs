//! Per-(referrer, rule) request metering.

use std::sync::Arc;
use std::time::Duration;

use portico_config::rules::{RuleTable, ServiceRule};
use tokio::time::Instant;

pub mod storage;

pub use storage::{Admission, RateMeterError};

use storage::MeterStorage;

/// How often the reaper runs housekeeping over the bucket cache.
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);

const MAX_BUCKETS: u64 = 100_000;

/// One row of the `/status` rate table.
#[derive(Debug)]
pub struct BucketSnapshot {
    pub referrer: String,
    pub rule_index: usize,
    pub tokens: f64,
    pub capacity: f64,
    pub idle: Duration,
}

pub struct RateMeter {
    storage: MeterStorage,
}

impl RateMeter {
    /// Buckets idle for one full rate period (the longest configured one) are
    /// eligible for reaping.
    pub fn for_rules(rules: &RuleTable) -> RateMeter {
        let idle_secs = rules
            .iter()
            .filter(|rule| rule.use_rate_meter)
            .map(|rule| rule.rate_limit_period as u64 * 60)
            .max()
            .unwrap_or(3600)
            .max(60);

        RateMeter {
            storage: MeterStorage::new(MAX_BUCKETS, Duration::from_secs(idle_secs)),
        }
    }

    fn key(referrer: &str, rule_index: usize) -> String {
        format!("{rule_index}|{referrer}")
    }

    /// The single public admission call. Rules without metering admit
    /// unconditionally; errors surface only when internal state is corrupt.
    pub async fn is_under_rate(
        &self,
        referrer: &str,
        rule_index: usize,
        rule: &ServiceRule,
    ) -> Result<Admission, RateMeterError> {
        if !rule.use_rate_meter {
            return Ok(Admission {
                allowed: true,
                remaining: rule.rate_limit.max(0) as f64,
                reset_after: Duration::ZERO,
            });
        }

        self.storage
            .check_and_update(
                &Self::key(referrer, rule_index),
                rule.rate,
                rule.rate_limit as usize,
                1,
            )
            .await
    }

    /// A point-in-time view of every live bucket, for `/status`.
    pub fn dump(&self) -> Vec<BucketSnapshot> {
        let now = Instant::now();
        self.storage
            .snapshot()
            .into_iter()
            .filter_map(|(key, state)| {
                let (index, referrer) = key.split_once('|')?;
                Some(BucketSnapshot {
                    referrer: referrer.to_string(),
                    rule_index: index.parse().ok()?,
                    tokens: state.tokens,
                    capacity: state.capacity,
                    idle: now.duration_since(state.last_update),
                })
            })
            .collect()
    }

    pub async fn maintain(&self) {
        self.storage.run_pending_tasks().await;
    }
}

/// Periodic bucket housekeeping; runs until the process exits.
pub async fn run_reaper(meter: Arc<RateMeter>) {
    let mut ticker = tokio::time::interval(REAP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        meter.maintain().await;
        tracing::trace!("rate meter housekeeping complete");
    }
}
