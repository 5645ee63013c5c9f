//! Request Governor
//!
//! Request governance in front of an API: a sliding-window rate limiter that
//! decides whether each inbound request is admitted, and a JSON response
//! cache with pattern invalidation. Both share one Redis store and both
//! fail open when it is unavailable.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod identity;
pub mod limiter;
pub mod memory;
pub mod metrics;
pub mod redis;
pub mod service;
pub mod store;
pub mod tasks;
pub mod utils;

// Re-export main types
pub use cache::{CacheService, Ttl};
pub use config::GovernorConfig;
pub use error::{GovernorError, Result};
pub use limiter::{Decision, SlidingWindowLimiter};
pub use service::{Admission, GovernanceService};
pub use store::EphemeralStore;
