use serde::Serialize;
use std::{sync::Arc, time::Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::{FailurePolicy, RateLimitConfig, ResetMode, DEFAULT_PREFIX},
    error::{RateLimitError, Result},
    metrics::{Metrics, Outcome},
    store::{Command, SortedSetStore},
    utils::{window_key, Clock, SystemClock},
};

/// Decision returned by [`RateLimiter::check`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    pub success: bool,
    /// Actions still permitted in the current window
    pub remaining: u32,
    /// Unix timestamp (seconds) when the window is expected to have room again
    pub reset: i64,
    /// Rejection message configured for the limiter, set only when `success` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RateLimitResult {
    /// Seconds to put in a `Retry-After` header
    pub fn retry_after(&self, now: i64) -> u64 {
        (self.reset - now).max(0) as u64
    }
}

/// Sliding-window rate limiter over a shared sorted-set store.
///
/// Each identifier's window lives under `{prefix}:{identifier}`, one member per
/// recorded action, scored by the action's Unix second. The limiter keeps no
/// counters of its own, so clones are interchangeable.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn SortedSetStore>,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
    config: RateLimitConfig,
    prefix: String,
}

impl RateLimiter {
    /// Create a limiter namespaced under the default `rate-limit` prefix
    pub fn new(store: Arc<dyn SortedSetStore>, config: RateLimitConfig) -> Result<Self> {
        Self::with_prefix(store, config, DEFAULT_PREFIX)
    }

    pub fn with_prefix(
        store: Arc<dyn SortedSetStore>,
        config: RateLimitConfig,
        prefix: impl Into<String>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            clock: Arc::new(SystemClock),
            metrics: None,
            config,
            prefix: prefix.into(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Current Unix time in seconds, as seen by this limiter
    pub fn now(&self) -> i64 {
        self.clock.unix_now()
    }

    /// Decide whether `identifier` may act now, without recording an action.
    ///
    /// Expired members are pruned from the store as a side effect. Store
    /// failures never escape; the configured failure policy answers instead.
    pub async fn check(&self, identifier: &str) -> RateLimitResult {
        let key = window_key(&self.prefix, identifier);
        let now = self.clock.unix_now();

        match self.window(&key, now).await {
            Ok((count, reset)) => {
                let max = self.config.max_requests as i64;
                let success = count < max;
                let remaining = (max - count).max(0) as u32;
                let outcome = if success {
                    Outcome::Allowed
                } else {
                    Outcome::Rejected
                };
                self.record_decision("check", outcome);
                debug!("check {}: {} of {} used", key, count, max);

                RateLimitResult {
                    success,
                    remaining,
                    reset,
                    message: if success { None } else { self.config.message.clone() },
                }
            }
            Err(e) => {
                warn!("Rate limit check failed for {}: {}", key, e);
                self.record_store_error("check");
                self.failure_result(now)
            }
        }
    }

    /// Record one action for `identifier` and report whether it fit the budget.
    ///
    /// Add, prune, count and TTL refresh go to the store as one atomic batch.
    /// The action is recorded even when it exceeds the budget.
    pub async fn increment(&self, identifier: &str) -> bool {
        let key = window_key(&self.prefix, identifier);
        let now = self.clock.unix_now();
        let member = format!("{}-{}", now, Uuid::new_v4());

        match self.prune_and_count(&key, now, Some(member)).await {
            Ok(count) => {
                let allowed = count <= self.config.max_requests as i64;
                self.record_decision(
                    "increment",
                    if allowed { Outcome::Allowed } else { Outcome::Rejected },
                );
                debug!("increment {}: {} of {}", key, count, self.config.max_requests);
                allowed
            }
            Err(e) => {
                warn!("Rate limit increment failed for {}: {}", key, e);
                self.record_store_error("increment");
                match self.config.failure_policy {
                    FailurePolicy::Open => {
                        self.record_decision("increment", Outcome::FailOpen);
                        true
                    }
                    FailurePolicy::Closed => {
                        self.record_decision("increment", Outcome::FailClosed);
                        false
                    }
                }
            }
        }
    }

    /// Drop the whole window for `identifier`. Returns false if the store failed.
    pub async fn reset(&self, identifier: &str) -> bool {
        let key = window_key(&self.prefix, identifier);
        let ok = match self.store.del(&key).await {
            Ok(_) => true,
            Err(e) => {
                warn!("Rate limit reset failed for {}: {}", key, e);
                self.record_store_error("reset");
                false
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_reset(&self.prefix, ok);
        }
        ok
    }

    /// Prune and count the window, then work out when it has room again
    async fn window(&self, key: &str, now: i64) -> Result<(i64, i64)> {
        let count = self.prune_and_count(key, now, None).await?;
        let window_end = now + self.config.interval_secs();
        let max = self.config.max_requests as i64;

        let reset = match self.config.reset_mode {
            ResetMode::WindowEnd => window_end,
            ResetMode::OldestMember if count >= max => {
                // Room returns once every member up to this rank has aged out
                let rank = (count - max) as usize;
                self.store
                    .zscore_at_rank(key, rank)
                    .await?
                    .map(|score| score + self.config.interval_secs())
                    .unwrap_or(window_end)
            }
            ResetMode::OldestMember => window_end,
        };
        Ok((count, reset))
    }

    /// Shared by `check` and `increment`: optionally add `insert`, drop members
    /// scored at or before `now - interval`, and return the cardinality.
    async fn prune_and_count(&self, key: &str, now: i64, insert: Option<String>) -> Result<i64> {
        let is_write = insert.is_some();
        let mut commands = Vec::with_capacity(4);
        if let Some(member) = insert {
            commands.push(Command::ZAdd {
                key: key.to_string(),
                score: now,
                member,
            });
        }
        commands.push(Command::ZRemRangeByScore {
            key: key.to_string(),
            min: 0,
            max: now - self.config.interval_secs(),
        });
        commands.push(Command::ZCard {
            key: key.to_string(),
        });
        let count_index = commands.len() - 1;
        if is_write {
            commands.push(Command::Expire {
                key: key.to_string(),
                seconds: self.config.interval,
            });
        }
        let expected = commands.len();

        let started = Instant::now();
        let result = self.store.pipeline(commands).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_store_duration("pipeline", started.elapsed().as_secs_f64());
        }

        let replies = result?;
        if replies.len() != expected {
            return Err(RateLimitError::Store(format!(
                "expected {} replies, got {}",
                expected,
                replies.len()
            )));
        }

        let mut count = 0;
        for (index, reply) in replies.into_iter().enumerate() {
            let value = reply?;
            if index == count_index {
                count = value;
            }
        }
        Ok(count)
    }

    fn failure_result(&self, now: i64) -> RateLimitResult {
        let reset = now + self.config.interval_secs();
        match self.config.failure_policy {
            FailurePolicy::Open => {
                self.record_decision("check", Outcome::FailOpen);
                RateLimitResult {
                    success: true,
                    remaining: 1,
                    reset,
                    message: None,
                }
            }
            FailurePolicy::Closed => {
                self.record_decision("check", Outcome::FailClosed);
                RateLimitResult {
                    success: false,
                    remaining: 0,
                    reset,
                    message: self.config.message.clone(),
                }
            }
        }
    }

    fn record_decision(&self, operation: &str, outcome: Outcome) {
        if let Some(metrics) = &self.metrics {
            metrics.record_decision(&self.prefix, operation, outcome);
        }
    }

    fn record_store_error(&self, operation: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_store_error(&self.prefix, operation);
        }
    }
}
