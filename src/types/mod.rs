//! Core types for the engine host.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (QueryId, CallerId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for engine, supervisor, limiter, and cache

mod config;
mod errors;
mod ids;

pub use config::{
    BackoffConfig, CacheConfig, Config, EngineConfig, ObservabilityConfig, RateLimitConfig,
    SupervisorConfig,
};
pub use errors::{Error, LimitScope, QueryContext, Result};
pub use ids::{CallerId, QueryId, RESERVED_ID_PREFIX};
