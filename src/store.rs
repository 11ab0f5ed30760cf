//! Sorted-set key-value store used to hold rate limit windows.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use tokio::sync::Mutex;

use crate::{
    error::Result,
    utils::{Clock, SystemClock},
};

/// One sorted-set command, as queued into a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ZAdd { key: String, score: i64, member: String },
    /// Remove members with `min <= score <= max`
    ZRemRangeByScore { key: String, min: i64, max: i64 },
    ZCard { key: String },
    Expire { key: String, seconds: u64 },
    Del { key: String },
}

impl Command {
    /// Command name, used as a metrics and log label
    pub fn name(&self) -> &'static str {
        match self {
            Command::ZAdd { .. } => "zadd",
            Command::ZRemRangeByScore { .. } => "zremrangebyscore",
            Command::ZCard { .. } => "zcard",
            Command::Expire { .. } => "expire",
            Command::Del { .. } => "del",
        }
    }
}

/// Integer reply of a pipelined command, or that command's own failure
pub type Reply = Result<i64>;

/// Store with sorted-set semantics shared by every limiter instance
#[async_trait]
pub trait SortedSetStore: Send + Sync {
    /// Add `member` with `score`; returns the number of new members
    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<i64>;

    /// Remove members scored in `[min, max]`; returns how many were removed
    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<i64>;

    async fn zcard(&self, key: &str) -> Result<i64>;

    /// Score of the member at `rank` in ascending score order, if any
    async fn zscore_at_rank(&self, key: &str, rank: usize) -> Result<Option<i64>>;

    /// Set the key's TTL; returns whether the key existed
    async fn expire(&self, key: &str, seconds: u64) -> Result<bool>;

    /// Delete the key; returns the number of keys removed
    async fn del(&self, key: &str) -> Result<i64>;

    /// Run `commands` in order as one round trip.
    ///
    /// The outer error means the batch never ran. Replies are in command order.
    async fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Reply>>;

    async fn health_check(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
    expires_at_ms: Option<i64>,
}

impl SortedSet {
    fn add(&mut self, score: i64, member: &str) -> i64 {
        match self.scores.insert(member.to_string(), score) {
            Some(previous) => {
                self.ordered.remove(&(previous, member.to_string()));
                self.ordered.insert((score, member.to_string()));
                0
            }
            None => {
                self.ordered.insert((score, member.to_string()));
                1
            }
        }
    }

    fn remove_range(&mut self, min: i64, max: i64) -> i64 {
        if min > max {
            return 0;
        }
        let doomed: Vec<(i64, String)> = self
            .ordered
            .range((min, String::new())..)
            .take_while(|(score, _)| *score <= max)
            .cloned()
            .collect();
        for (score, member) in &doomed {
            self.ordered.remove(&(*score, member.clone()));
            self.scores.remove(member);
        }
        doomed.len() as i64
    }

    fn len(&self) -> i64 {
        self.ordered.len() as i64
    }

    fn score_at_rank(&self, rank: usize) -> Option<i64> {
        self.ordered.iter().nth(rank).map(|(score, _)| *score)
    }
}

/// How often a pipeline sweeps every expired key out of a [`MemoryStore`]
const SWEEP_INTERVAL_MS: i64 = 60_000;

/// In-process store.
///
/// A whole pipeline runs under one lock, so batches are atomic. Key TTLs are
/// evaluated against the injected clock: a key is dropped when it is next
/// touched, and pipelines sweep all expired keys at most once per minute, so
/// identifiers that never come back do not pile up.
pub struct MemoryStore {
    sets: Mutex<HashMap<String, SortedSet>>,
    clock: Arc<dyn Clock>,
    last_sweep_ms: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let last_sweep_ms = AtomicI64::new(clock.now_millis());
        Self {
            sets: Mutex::new(HashMap::new()),
            clock,
            last_sweep_ms,
        }
    }

    /// Number of live keys
    pub async fn len(&self) -> usize {
        let now = self.clock.now_millis();
        let mut sets = self.sets.lock().await;
        sets.retain(|_, set| !is_expired(set, now));
        sets.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remaining TTL of a key in whole seconds
    pub async fn ttl(&self, key: &str) -> Option<i64> {
        let now = self.clock.now_millis();
        let sets = self.sets.lock().await;
        sets.get(key)
            .filter(|set| !is_expired(set, now))
            .and_then(|set| set.expires_at_ms)
            .map(|at| (at - now).div_euclid(1000))
    }

    fn apply(sets: &mut HashMap<String, SortedSet>, now_ms: i64, command: &Command) -> i64 {
        let key = match command {
            Command::ZAdd { key, .. }
            | Command::ZRemRangeByScore { key, .. }
            | Command::ZCard { key }
            | Command::Expire { key, .. }
            | Command::Del { key } => key,
        };
        if sets.get(key).is_some_and(|set| is_expired(set, now_ms)) {
            sets.remove(key);
        }

        match command {
            Command::ZAdd { key, score, member } => {
                sets.entry(key.clone()).or_default().add(*score, member)
            }
            Command::ZRemRangeByScore { key, min, max } => {
                let removed = sets
                    .get_mut(key)
                    .map(|set| set.remove_range(*min, *max))
                    .unwrap_or(0);
                drop_if_empty(sets, key);
                removed
            }
            Command::ZCard { key } => sets.get(key).map(SortedSet::len).unwrap_or(0),
            Command::Expire { key, seconds } => match sets.get_mut(key) {
                Some(set) => {
                    let ttl_ms = i64::try_from(*seconds).unwrap_or(i64::MAX).saturating_mul(1000);
                    set.expires_at_ms = Some(now_ms.saturating_add(ttl_ms));
                    1
                }
                None => 0,
            },
            Command::Del { key } => sets.remove(key).map(|_| 1).unwrap_or(0),
        }
    }

    /// Drop every expired key if the last sweep is old enough. Caller holds the lock.
    fn sweep_expired(&self, sets: &mut HashMap<String, SortedSet>, now_ms: i64) {
        if now_ms - self.last_sweep_ms.load(Ordering::Relaxed) < SWEEP_INTERVAL_MS {
            return;
        }
        self.last_sweep_ms.store(now_ms, Ordering::Relaxed);
        sets.retain(|_, set| !is_expired(set, now_ms));
    }

    async fn run(&self, command: Command) -> i64 {
        let now = self.clock.now_millis();
        let mut sets = self.sets.lock().await;
        Self::apply(&mut sets, now, &command)
    }
}

fn is_expired(set: &SortedSet, now_ms: i64) -> bool {
    set.expires_at_ms.is_some_and(|at| at <= now_ms)
}

// Redis drops a sorted set once its last member is removed
fn drop_if_empty(sets: &mut HashMap<String, SortedSet>, key: &str) {
    if sets.get(key).is_some_and(|set| set.len() == 0) {
        sets.remove(key);
    }
}

#[async_trait]
impl SortedSetStore for MemoryStore {
    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<i64> {
        Ok(self
            .run(Command::ZAdd {
                key: key.to_string(),
                score,
                member: member.to_string(),
            })
            .await)
    }

    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<i64> {
        Ok(self
            .run(Command::ZRemRangeByScore {
                key: key.to_string(),
                min,
                max,
            })
            .await)
    }

    async fn zcard(&self, key: &str) -> Result<i64> {
        Ok(self.run(Command::ZCard { key: key.to_string() }).await)
    }

    async fn zscore_at_rank(&self, key: &str, rank: usize) -> Result<Option<i64>> {
        let now = self.clock.now_millis();
        let sets = self.sets.lock().await;
        Ok(sets
            .get(key)
            .filter(|set| !is_expired(set, now))
            .and_then(|set| set.score_at_rank(rank)))
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool> {
        Ok(self
            .run(Command::Expire {
                key: key.to_string(),
                seconds,
            })
            .await
            == 1)
    }

    async fn del(&self, key: &str) -> Result<i64> {
        Ok(self.run(Command::Del { key: key.to_string() }).await)
    }

    async fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        let now = self.clock.now_millis();
        let mut sets = self.sets.lock().await;
        self.sweep_expired(&mut sets, now);
        Ok(commands
            .iter()
            .map(|command| Ok(Self::apply(&mut sets, now, command)))
            .collect())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;

    fn store_at(seconds: i64) -> (Arc<ManualClock>, MemoryStore) {
        let clock = Arc::new(ManualClock::at_seconds(seconds));
        let store = MemoryStore::with_clock(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_zadd_and_zcard() {
        let (_clock, store) = store_at(1000);

        assert_eq!(store.zadd("k", 10, "a").await.unwrap(), 1);
        assert_eq!(store.zadd("k", 11, "b").await.unwrap(), 1);
        // Re-adding a member updates its score only
        assert_eq!(store.zadd("k", 12, "a").await.unwrap(), 0);
        assert_eq!(store.zcard("k").await.unwrap(), 2);
        assert_eq!(store.zscore_at_rank("k", 0).await.unwrap(), Some(11));
        assert_eq!(store.zscore_at_rank("k", 1).await.unwrap(), Some(12));
        assert_eq!(store.zscore_at_rank("k", 2).await.unwrap(), None);
        assert_eq!(store.zcard("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zremrangebyscore_is_inclusive() {
        let (_clock, store) = store_at(1000);
        for (score, member) in [(1, "a"), (5, "b"), (5, "c"), (9, "d")] {
            store.zadd("k", score, member).await.unwrap();
        }

        assert_eq!(store.zremrangebyscore("k", 0, 5).await.unwrap(), 3);
        assert_eq!(store.zcard("k").await.unwrap(), 1);
        assert_eq!(store.zscore_at_rank("k", 0).await.unwrap(), Some(9));
        assert_eq!(store.zremrangebyscore("k", 10, 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_emptied_set_is_dropped() {
        let (_clock, store) = store_at(1000);
        store.zadd("k", 1, "a").await.unwrap();
        store.zremrangebyscore("k", 0, 1).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_expire_and_del() {
        let (clock, store) = store_at(1000);
        store.zadd("k", 1000, "a").await.unwrap();

        assert!(store.expire("k", 60).await.unwrap());
        assert!(!store.expire("missing", 60).await.unwrap());
        assert_eq!(store.ttl("k").await, Some(60));

        clock.advance_secs(59);
        assert_eq!(store.zcard("k").await.unwrap(), 1);

        clock.advance_secs(1);
        assert_eq!(store.zcard("k").await.unwrap(), 0);
        assert!(store.is_empty().await);

        store.zadd("k", 1060, "b").await.unwrap();
        assert_eq!(store.del("k").await.unwrap(), 1);
        assert_eq!(store.del("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pipeline_replies_in_order() {
        let (_clock, store) = store_at(1000);
        store.zadd("k", 100, "old").await.unwrap();

        let replies = store
            .pipeline(vec![
                Command::ZAdd {
                    key: "k".to_string(),
                    score: 1000,
                    member: "new".to_string(),
                },
                Command::ZRemRangeByScore {
                    key: "k".to_string(),
                    min: 0,
                    max: 500,
                },
                Command::ZCard { key: "k".to_string() },
                Command::Expire {
                    key: "k".to_string(),
                    seconds: 900,
                },
            ])
            .await
            .unwrap();

        let values: Vec<i64> = replies.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![1, 1, 1, 1]);
        assert_eq!(store.ttl("k").await, Some(900));
    }

    #[tokio::test]
    async fn test_pipeline_sweeps_abandoned_keys() {
        let (clock, store) = store_at(1000);
        for id in ["a", "b", "c"] {
            let key = format!("rate-limit:{}", id);
            store.zadd(&key, 1000, "m").await.unwrap();
            store.expire(&key, 10).await.unwrap();
        }

        clock.advance_secs(30);
        let touch = |key: &str| {
            vec![
                Command::ZAdd {
                    key: key.to_string(),
                    score: 1030,
                    member: "m".to_string(),
                },
                Command::Expire {
                    key: key.to_string(),
                    seconds: 10,
                },
            ]
        };
        // Too soon after the store was created to sweep
        store.pipeline(touch("rate-limit:d")).await.unwrap();
        assert_eq!(store.sets.lock().await.len(), 4);

        clock.advance_secs(60);
        store.pipeline(touch("rate-limit:e")).await.unwrap();
        let sets = store.sets.lock().await;
        assert_eq!(sets.len(), 1);
        assert!(sets.contains_key("rate-limit:e"));
    }

    #[tokio::test]
    async fn test_huge_ttl_saturates() {
        let (_clock, store) = store_at(1000);
        store.zadd("k", 1000, "a").await.unwrap();
        assert!(store.expire("k", u64::MAX).await.unwrap());
        assert_eq!(store.zcard("k").await.unwrap(), 1);
    }

    #[test]
    fn test_command_names() {
        let command = Command::ZCard { key: "k".to_string() };
        assert_eq!(command.name(), "zcard");
        assert_eq!(Command::Del { key: "k".to_string() }.name(), "del");
    }
}
