use thiserror::Error;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur in the rate limiter and its store
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store timeout: {0}")]
    Timeout(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Limiter not found: {0}")]
    LimiterNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),
}
