use async_trait::async_trait;
use sliding_ratelimit::{
    config::{load_rules_from_yaml, FailurePolicy, RateLimitConfig},
    error::{RateLimitError, Result},
    limiter::RateLimiter,
    registry::LimiterRegistry,
    store::{Command, MemoryStore, Reply, SortedSetStore},
    utils::{composite_identifier, ManualClock},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

const T: i64 = 1_700_000_000;

/// Memory store whose availability can be switched off mid-test
struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
}

impl FlakyStore {
    fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            inner: MemoryStore::with_clock(clock),
            down: AtomicBool::new(false),
        }
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn guard(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(RateLimitError::Timeout("store unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SortedSetStore for FlakyStore {
    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<i64> {
        self.guard()?;
        self.inner.zadd(key, score, member).await
    }

    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<i64> {
        self.guard()?;
        self.inner.zremrangebyscore(key, min, max).await
    }

    async fn zcard(&self, key: &str) -> Result<i64> {
        self.guard()?;
        self.inner.zcard(key).await
    }

    async fn zscore_at_rank(&self, key: &str, rank: usize) -> Result<Option<i64>> {
        self.guard()?;
        self.inner.zscore_at_rank(key, rank).await
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool> {
        self.guard()?;
        self.inner.expire(key, seconds).await
    }

    async fn del(&self, key: &str) -> Result<i64> {
        self.guard()?;
        self.inner.del(key).await
    }

    async fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        self.guard()?;
        self.inner.pipeline(commands).await
    }

    async fn health_check(&self) -> Result<()> {
        self.guard()
    }
}

#[tokio::test]
async fn test_login_throttling_scenario() {
    let clock = Arc::new(ManualClock::at_seconds(T));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let limiter = RateLimiter::new(store, RateLimitConfig::new(900, 5))
        .unwrap()
        .with_clock(clock.clone());

    let fresh = limiter.check("test-key").await;
    assert!(fresh.success);
    assert_eq!(fresh.remaining, 5);

    for attempt in 1..=5 {
        assert!(limiter.increment("test-key").await, "attempt {} should pass", attempt);
    }
    assert!(!limiter.increment("test-key").await);

    let blocked = limiter.check("test-key").await;
    assert!(!blocked.success);
    assert_eq!(blocked.remaining, 0);
    assert_eq!(blocked.reset, T + 900);
    assert_eq!(blocked.retry_after(limiter.now()), 900);

    clock.advance_secs(900);
    let recovered = limiter.check("test-key").await;
    assert!(recovered.success);
    assert_eq!(recovered.remaining, 5);
}

#[tokio::test]
async fn test_outage_fails_open_then_recovers() {
    let clock = Arc::new(ManualClock::at_seconds(T));
    let store = Arc::new(FlakyStore::new(clock.clone()));
    let limiter = RateLimiter::with_prefix(store.clone(), RateLimitConfig::new(60, 1), "upload")
        .unwrap()
        .with_clock(clock);

    assert!(limiter.increment("user-1").await);
    assert!(!limiter.increment("user-1").await);

    store.set_down(true);
    assert!(limiter.increment("user-1").await);
    let during = limiter.check("user-1").await;
    assert!(during.success);
    assert_eq!(during.remaining, 1);
    assert!(!limiter.reset("user-1").await);

    // Actions during the outage were never recorded
    store.set_down(false);
    let after = limiter.check("user-1").await;
    assert!(!after.success);
    assert_eq!(after.remaining, 0);
}

#[tokio::test]
async fn test_fail_closed_policy_blocks_during_outage() {
    let clock = Arc::new(ManualClock::at_seconds(T));
    let store = Arc::new(FlakyStore::new(clock.clone()));
    let config = RateLimitConfig::new(3600, 3).with_failure_policy(FailurePolicy::Closed);
    let limiter = RateLimiter::with_prefix(store.clone(), config, "password-reset")
        .unwrap()
        .with_clock(clock);

    store.set_down(true);
    assert!(!limiter.increment("carol@example.com").await);
    assert!(!limiter.check("carol@example.com").await.success);

    store.set_down(false);
    assert!(limiter.increment("carol@example.com").await);
}

#[tokio::test]
async fn test_password_reset_clears_failed_attempts() {
    let clock = Arc::new(ManualClock::at_seconds(T));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let rules = load_rules_from_yaml(
        r#"
limiters:
  - prefix: rate-limit
    interval: 900
    max_requests: 5
  - prefix: password-reset
    interval: 3600
    max_requests: 3
"#,
    )
    .unwrap();
    let registry = LimiterRegistry::new(store, &rules, clock, None).unwrap();

    let login = registry.get("rate-limit").unwrap();
    for _ in 0..6 {
        login.increment("dave").await;
    }
    assert!(!login.check("dave").await.success);

    assert!(registry.get("password-reset").unwrap().increment("dave").await);
    assert!(login.reset("dave").await);
    assert_eq!(login.check("dave").await.remaining, 5);
}

#[tokio::test]
async fn test_composite_identifiers_scope_per_action() {
    let clock = Arc::new(ManualClock::at_seconds(T));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let limiter = RateLimiter::with_prefix(store, RateLimitConfig::new(60, 1), "feedback")
        .unwrap()
        .with_clock(clock);

    let submit = composite_identifier("user-3", "submit");
    let vote = composite_identifier("user-3", "vote");

    assert!(limiter.increment(&submit).await);
    assert!(!limiter.check(&submit).await.success);
    assert!(limiter.check(&vote).await.success);
}

#[tokio::test]
async fn test_concurrent_increments_never_exceed_budget() {
    let clock = Arc::new(ManualClock::at_seconds(T));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let limiter = Arc::new(
        RateLimiter::new(store, RateLimitConfig::new(60, 10))
            .unwrap()
            .with_clock(clock),
    );

    let mut handles = Vec::new();
    for _ in 0..50 {
        let limiter = limiter.clone();
        handles.push(tokio::spawn(async move { limiter.increment("hot-key").await }));
    }

    let mut allowed = 0;
    for handle in handles {
        if handle.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 10);
}
