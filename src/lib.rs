//! Sliding-window rate limiting
//!
//! Throttles authentication-sensitive actions (login, 2FA, password reset,
//! feedback, uploads) by keeping one Redis sorted set per identifier, scored by
//! the Unix second of each recorded action. Store outages are answered by a
//! configurable failure policy instead of being propagated.

pub mod config;
pub mod error;
pub mod http;
pub mod limiter;
pub mod metrics;
pub mod redis;
pub mod registry;
pub mod store;
pub mod utils;

// Re-export main types
pub use crate::config::{FailurePolicy, LimiterRules, RateLimitConfig, ResetMode};
pub use crate::error::{RateLimitError, Result};
pub use crate::limiter::{RateLimitResult, RateLimiter};
pub use crate::registry::LimiterRegistry;
pub use crate::store::{MemoryStore, SortedSetStore};
