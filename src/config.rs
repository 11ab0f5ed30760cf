use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{RateLimitError, Result};

/// Prefix used when a limiter is built without an explicit namespace
pub const DEFAULT_PREFIX: &str = "rate-limit";

/// Longest accepted window: one leap year
pub const MAX_INTERVAL_SECS: u64 = 366 * 24 * 60 * 60;

/// What a limiter answers when its store cannot be reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Permit the action
    #[default]
    Open,
    /// Reject the action
    Closed,
}

/// How the `reset` timestamp of a check result is computed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetMode {
    /// Always `now + interval`
    #[default]
    WindowEnd,
    /// When the window is full, the moment its oldest member expires
    OldestMember,
}

/// Window and threshold of one limiter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Window length in seconds
    pub interval: u64,
    pub max_requests: u32,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default)]
    pub reset_mode: ResetMode,
}

impl RateLimitConfig {
    pub fn new(interval: u64, max_requests: u32) -> Self {
        Self {
            interval,
            max_requests,
            message: None,
            failure_policy: FailurePolicy::default(),
            reset_mode: ResetMode::default(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_reset_mode(mut self, mode: ResetMode) -> Self {
        self.reset_mode = mode;
        self
    }

    /// Reject windows that could never admit or never expire anything
    pub fn validate(&self) -> Result<()> {
        if self.interval == 0 {
            return Err(RateLimitError::Config(
                "interval must be at least one second".to_string(),
            ));
        }
        if self.interval > MAX_INTERVAL_SECS {
            return Err(RateLimitError::Config(format!(
                "interval must not exceed {} seconds, got {}",
                MAX_INTERVAL_SECS, self.interval
            )));
        }
        if self.max_requests == 0 {
            return Err(RateLimitError::Config(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Window length as a signed offset, clamped to [`MAX_INTERVAL_SECS`]
    pub fn interval_secs(&self) -> i64 {
        let max = MAX_INTERVAL_SECS as i64;
        i64::try_from(self.interval).map_or(max, |secs| secs.min(max))
    }
}

/// A limiter definition as it appears in the rules file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedLimiter {
    pub prefix: String,
    #[serde(flatten)]
    pub config: RateLimitConfig,
}

impl NamedLimiter {
    pub fn new(prefix: impl Into<String>, config: RateLimitConfig) -> Self {
        Self {
            prefix: prefix.into(),
            config,
        }
    }
}

/// The full set of limiters an application runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterRules {
    pub limiters: Vec<NamedLimiter>,
}

impl LimiterRules {
    /// Limiters guarding the login, 2FA, password reset, feedback and upload endpoints
    pub fn defaults() -> Self {
        let limiters = vec![
            NamedLimiter::new(
                DEFAULT_PREFIX,
                RateLimitConfig::new(900, 5)
                    .with_message("Too many requests, please try again later."),
            ),
            NamedLimiter::new(
                "2fa-verify",
                RateLimitConfig::new(300, 5)
                    .with_message("Too many verification attempts, please try again later."),
            ),
            NamedLimiter::new(
                "2fa-disable",
                RateLimitConfig::new(3600, 3)
                    .with_message("Too many attempts to disable two-factor authentication."),
            ),
            NamedLimiter::new(
                "password-reset",
                RateLimitConfig::new(3600, 3)
                    .with_message("Too many password reset requests, please try again later."),
            ),
            NamedLimiter::new(
                "feedback",
                RateLimitConfig::new(3600, 5)
                    .with_message("You have submitted too much feedback, please try again later."),
            ),
            NamedLimiter::new(
                "upload",
                RateLimitConfig::new(60, 10).with_message("Too many uploads, slow down."),
            ),
        ];
        Self { limiters }
    }

    /// Validate every limiter and reject duplicate prefixes
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for limiter in &self.limiters {
            if limiter.prefix.is_empty() {
                return Err(RateLimitError::Config(
                    "limiter prefix must not be empty".to_string(),
                ));
            }
            if !seen.insert(limiter.prefix.as_str()) {
                return Err(RateLimitError::Config(format!(
                    "duplicate limiter prefix: {}",
                    limiter.prefix
                )));
            }
            limiter.config.validate().map_err(|e| {
                RateLimitError::Config(format!("limiter {}: {}", limiter.prefix, e))
            })?;
        }
        Ok(())
    }

    pub fn get(&self, prefix: &str) -> Option<&NamedLimiter> {
        self.limiters.iter().find(|l| l.prefix == prefix)
    }
}

/// Load limiter rules from a YAML string
pub fn load_rules_from_yaml(yaml: &str) -> Result<LimiterRules> {
    let rules: LimiterRules = serde_yaml::from_str(yaml)?;
    rules.validate()?;
    Ok(rules)
}

/// Load limiter rules from a YAML file
pub fn load_rules_from_file(path: &str) -> Result<LimiterRules> {
    let content = std::fs::read_to_string(path)?;
    load_rules_from_yaml(&content)
}

/// Redis connection settings as read from the environment or a settings file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub enable_pipelining: bool,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            connection_timeout_ms: default_connection_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            enable_pipelining: true,
        }
    }
}

impl RedisSettings {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub redis: RedisSettings,
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// YAML limiter rules; built-in defaults are used when absent
    #[serde(default)]
    pub rules_path: Option<String>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis: RedisSettings::default(),
            http_addr: default_http_addr(),
            rules_path: None,
            log_filter: default_log_filter(),
        }
    }
}

impl Settings {
    /// Read settings from an optional file, then `RATELIMIT__*` environment overrides.
    ///
    /// `RATELIMIT__REDIS__URL=redis://cache:6379` sets `redis.url`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("RATELIMIT").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }

    /// Limiter rules from `rules_path`, or the defaults
    pub fn rules(&self) -> Result<LimiterRules> {
        match &self.rules_path {
            Some(path) => load_rules_from_file(path),
            None => Ok(LimiterRules::defaults()),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_command_timeout_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_filter() -> String {
    "sliding_ratelimit=info,tower_http=info".to_string()
}
