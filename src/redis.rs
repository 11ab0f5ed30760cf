use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::{future::Future, time::Duration};
use tracing::{info, warn};

use crate::{
    config::RedisSettings,
    error::{RateLimitError, Result},
    store::{Command, Reply, SortedSetStore},
};

/// Redis client configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Duration,
    pub command_timeout: Duration,
    pub enable_pipelining: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
            enable_pipelining: true,
        }
    }
}

impl From<&RedisSettings> for RedisConfig {
    fn from(settings: &RedisSettings) -> Self {
        Self {
            url: settings.url.clone(),
            connection_timeout: settings.connection_timeout(),
            command_timeout: settings.command_timeout(),
            enable_pipelining: settings.enable_pipelining,
        }
    }
}

/// Redis-backed sorted-set store
#[derive(Clone)]
pub struct RedisClient {
    connection: ConnectionManager,
    config: RedisConfig,
}

impl RedisClient {
    /// Connect and verify the server answers PING
    pub async fn new(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis client for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            RateLimitError::Redis(e)
        })?;

        let connection =
            match tokio::time::timeout(config.connection_timeout, client.get_connection_manager())
                .await
            {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    warn!("Failed to create connection manager: {}", e);
                    return Err(RateLimitError::Redis(e));
                }
                Err(_) => {
                    warn!(
                        "Timeout while creating connection manager ({}ms)",
                        config.connection_timeout.as_millis()
                    );
                    return Err(RateLimitError::Timeout(
                        "creating Redis connection manager".to_string(),
                    ));
                }
            };

        let store = Self { connection, config };
        store.health_check().await?;

        info!("Redis client initialized successfully");
        Ok(store)
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Run one Redis future under the command timeout
    async fn timed<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(result) => result.map_err(RateLimitError::Redis),
            Err(_) => Err(RateLimitError::Timeout(format!(
                "{} exceeded {}ms",
                operation,
                self.config.command_timeout.as_millis()
            ))),
        }
    }

    async fn run_sequential(&self, commands: Vec<Command>) -> Vec<Reply> {
        let mut replies = Vec::with_capacity(commands.len());
        for command in commands {
            let reply = match command {
                Command::ZAdd { key, score, member } => {
                    self.zadd(&key, score, &member).await
                }
                Command::ZRemRangeByScore { key, min, max } => {
                    self.zremrangebyscore(&key, min, max).await
                }
                Command::ZCard { key } => self.zcard(&key).await,
                Command::Expire { key, seconds } => {
                    self.expire(&key, seconds).await.map(i64::from)
                }
                Command::Del { key } => self.del(&key).await,
            };
            replies.push(reply);
        }
        replies
    }
}

// A negative EXPIRE deletes the key, so out-of-range TTLs never reach Redis
fn ttl_seconds(seconds: u64) -> Result<i64> {
    i64::try_from(seconds).map_err(|_| {
        RateLimitError::Store(format!("TTL of {} seconds is out of range", seconds))
    })
}

fn int_reply(value: &redis::Value, command: &str) -> Reply {
    match value {
        redis::Value::Int(n) => Ok(*n),
        other => Err(RateLimitError::Store(format!(
            "expected integer reply from {}, got {:?}",
            command, other
        ))),
    }
}

#[async_trait]
impl SortedSetStore for RedisClient {
    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<i64> {
        let mut conn = self.connection.clone();
        self.timed("zadd", conn.zadd(key, member, score)).await
    }

    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<i64> {
        let mut conn = self.connection.clone();
        self.timed("zremrangebyscore", conn.zrembyscore(key, min, max))
            .await
    }

    async fn zcard(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection.clone();
        self.timed("zcard", conn.zcard(key)).await
    }

    async fn zscore_at_rank(&self, key: &str, rank: usize) -> Result<Option<i64>> {
        let mut conn = self.connection.clone();
        let rank = rank as isize;
        let found: Vec<(String, f64)> = self
            .timed("zrange", conn.zrange_withscores(key, rank, rank))
            .await?;
        Ok(found.first().map(|(_, score)| *score as i64))
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool> {
        let mut conn = self.connection.clone();
        let seconds = ttl_seconds(seconds)?;
        self.timed("expire", conn.expire(key, seconds)).await
    }

    async fn del(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection.clone();
        self.timed("del", conn.del(key)).await
    }

    async fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Reply>> {
        if commands.is_empty() {
            return Ok(vec![]);
        }
        if !self.config.enable_pipelining {
            return Ok(self.run_sequential(commands).await);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in &commands {
            match command {
                Command::ZAdd { key, score, member } => {
                    pipe.zadd(key, member, *score);
                }
                Command::ZRemRangeByScore { key, min, max } => {
                    pipe.zrembyscore(key, *min, *max);
                }
                Command::ZCard { key } => {
                    pipe.zcard(key);
                }
                Command::Expire { key, seconds } => {
                    pipe.expire(key, ttl_seconds(*seconds)?);
                }
                Command::Del { key } => {
                    pipe.del(key);
                }
            }
        }

        let mut conn = self.connection.clone();
        let values: Vec<redis::Value> = self
            .timed("pipeline", pipe.query_async(&mut conn))
            .await?;

        if values.len() != commands.len() {
            return Err(RateLimitError::Store(format!(
                "pipeline returned {} replies for {} commands",
                values.len(),
                commands.len()
            )));
        }

        Ok(values
            .iter()
            .zip(&commands)
            .map(|(value, command)| int_reply(value, command.name()))
            .collect())
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        self.timed("ping", redis::cmd("PING").query_async::<_, ()>(&mut conn))
            .await
    }
}
