use std::{collections::HashMap, sync::Arc};
use tracing::info;

use crate::{
    config::LimiterRules,
    error::{RateLimitError, Result},
    limiter::RateLimiter,
    metrics::Metrics,
    store::SortedSetStore,
    utils::Clock,
};

/// The application's limiters, keyed by prefix, all sharing one store
#[derive(Clone)]
pub struct LimiterRegistry {
    limiters: HashMap<String, Arc<RateLimiter>>,
    store: Arc<dyn SortedSetStore>,
}

impl LimiterRegistry {
    pub fn new(
        store: Arc<dyn SortedSetStore>,
        rules: &LimiterRules,
        clock: Arc<dyn Clock>,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self> {
        rules.validate()?;

        let mut limiters = HashMap::new();
        for named in &rules.limiters {
            let mut limiter =
                RateLimiter::with_prefix(store.clone(), named.config.clone(), named.prefix.clone())?
                    .with_clock(clock.clone());
            if let Some(metrics) = &metrics {
                limiter = limiter.with_metrics(metrics.clone());
            }
            info!(
                "Registered limiter {} ({} per {}s)",
                named.prefix, named.config.max_requests, named.config.interval
            );
            limiters.insert(named.prefix.clone(), Arc::new(limiter));
        }

        Ok(Self { limiters, store })
    }

    pub fn get(&self, prefix: &str) -> Result<Arc<RateLimiter>> {
        self.limiters
            .get(prefix)
            .cloned()
            .ok_or_else(|| RateLimitError::LimiterNotFound(prefix.to_string()))
    }

    /// Registered prefixes, sorted
    pub fn prefixes(&self) -> Vec<&str> {
        let mut prefixes: Vec<&str> = self.limiters.keys().map(String::as_str).collect();
        prefixes.sort_unstable();
        prefixes
    }

    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }
}
