//! # KataGo Host - supervised analysis engine control plane
//!
//! Turns one external, stateful analysis-engine subprocess into a
//! concurrency-safe service for many simultaneous callers:
//! - Multiplexes concurrent queries over the process's single stdin/stdout pipe
//! - Restarts the process on crash or health degradation with bounded backoff
//! - Enforces global, per-operation and per-caller admission limits
//! - Serves repeated queries from a content-addressed result cache
//!
//! ## Architecture
//!
//! ```text
//!   caller ─▶ RateLimiter::allow ─▶ Supervisor::engine ─▶ Engine::query
//!                                        │                    │  ▲
//!                                   restart policy      stdin │  │ stdout
//!                                        │                    ▼  │
//!                                   EngineEvent ◀──────── subprocess
//!                                   (exit, probes)
//! ```
//!
//! The adapter layer that exposes these operations to clients lives outside
//! this crate.

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod cache;
pub mod engine;
pub mod ratelimit;
pub mod supervisor;
pub mod types;

// Internal utilities
pub mod observability;

pub use cache::AnalysisCache;
pub use engine::{AnalysisEngine, AnalysisRequest, AnalysisResponse, Engine, EngineState};
pub use ratelimit::{CallerSweeper, RateLimiter, TokenBucket};
pub use supervisor::{Supervisor, SupervisorState};
pub use types::{Config, Error, Result};
