//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Errors that
//! belong to a single query carry a [`QueryContext`] so the adapter layer can
//! build an actionable message without re-deriving who asked for what.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{CallerId, QueryId};

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Who issued a query, for what, and how long it was allowed to take.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryContext {
    pub operation: String,
    pub caller: Option<CallerId>,
    pub query_id: Option<QueryId>,
    #[serde(default, with = "humantime_serde")]
    pub deadline: Option<Duration>,
}

impl QueryContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_caller(mut self, caller: Option<CallerId>) -> Self {
        self.caller = caller;
        self
    }

    pub fn with_query_id(mut self, query_id: QueryId) -> Self {
        self.query_id = Some(query_id);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl fmt::Display for QueryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let operation = if self.operation.is_empty() {
            "unknown"
        } else {
            self.operation.as_str()
        };
        write!(f, "operation={}", operation)?;
        if let Some(caller) = &self.caller {
            write!(f, " caller={}", caller)?;
        }
        if let Some(id) = &self.query_id {
            write!(f, " id={}", id)?;
        }
        if let Some(deadline) = self.deadline {
            write!(f, " deadline={}ms", deadline.as_millis())?;
        }
        Ok(())
    }
}

/// Which tier of the admission chain rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    /// Shared budget across every caller and operation.
    Global,
    /// Budget for one operation name across every caller.
    Operation,
    /// One caller's own budget (caller-global or caller-per-operation).
    Caller,
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitScope::Global => write!(f, "global"),
            LimitScope::Operation => write!(f, "operation"),
            LimitScope::Caller => write!(f, "caller"),
        }
    }
}

/// Main error enum for the engine host.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid paths or limits detected at startup. Fatal.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The engine subprocess could not be spawned. Fatal for that engine.
    #[error("failed to spawn engine process {binary}: {source}")]
    ProcessSpawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// Malformed line on the engine's output stream. Logged and discarded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No response arrived before the query deadline.
    #[error("query timed out after {}ms ({context})", timeout.as_millis())]
    QueryTimeout {
        context: QueryContext,
        timeout: Duration,
    },

    /// Synthetic result for queries outstanding when the engine stopped or crashed,
    /// and for queries issued while it is not running.
    #[error("engine stopped: {reason} ({context})")]
    EngineStopped {
        context: QueryContext,
        reason: String,
    },

    /// The supervisor is between engine instances.
    #[error("engine restart in progress ({context})")]
    EngineRestarting { context: QueryContext },

    /// The engine answered, but with an error object.
    #[error("engine error: {message} ({context})")]
    EngineReported {
        context: QueryContext,
        message: String,
    },

    /// Admission control rejected the request.
    #[error("{scope} rate limit exceeded ({context})")]
    RateLimitExceeded {
        scope: LimitScope,
        context: QueryContext,
    },

    /// The supervisor gave up restarting the engine.
    #[error("engine restart budget exhausted after {failures} consecutive failures")]
    RestartExhausted { failures: u32 },

    /// Invalid lifecycle transition (e.g. starting an engine twice).
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Invalid caller input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable error code for the adapter layer.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "CONFIGURATION",
            Error::ProcessSpawn { .. } => "PROCESS_SPAWN",
            Error::Protocol(_) => "PROTOCOL",
            Error::QueryTimeout { .. } => "QUERY_TIMEOUT",
            Error::EngineStopped { .. } => "ENGINE_STOPPED",
            Error::EngineRestarting { .. } => "ENGINE_RESTARTING",
            Error::EngineReported { .. } => "ENGINE_ERROR",
            Error::RateLimitExceeded { .. } => "RATE_LIMITED",
            Error::RestartExhausted { .. } => "RESTART_EXHAUSTED",
            Error::StateTransition(_) => "FAILED_PRECONDITION",
            Error::Validation(_) => "INVALID_ARGUMENT",
            Error::Serialization(_) => "INTERNAL",
            Error::Io(_) => "INTERNAL",
        }
    }

    /// Whether the caller may retry after applying its own backoff.
    ///
    /// Nothing in this crate retries on the caller's behalf.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::QueryTimeout { .. }
                | Error::EngineStopped { .. }
                | Error::EngineRestarting { .. }
                | Error::RateLimitExceeded { .. }
        )
    }

    /// Whether the process cannot continue without operator intervention.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Configuration(_) | Error::ProcessSpawn { .. } | Error::RestartExhausted { .. }
        )
    }

    /// Query context, if this error belongs to a single query.
    pub fn context(&self) -> Option<&QueryContext> {
        match self {
            Error::QueryTimeout { context, .. }
            | Error::EngineStopped { context, .. }
            | Error::EngineRestarting { context }
            | Error::EngineReported { context, .. }
            | Error::RateLimitExceeded { context, .. } => Some(context),
            _ => None,
        }
    }
}

// Convenience constructors
impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn engine_stopped(context: QueryContext, reason: impl Into<String>) -> Self {
        Self::EngineStopped {
            context,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> QueryContext {
        QueryContext::new("analyzePosition")
            .with_caller(Some(CallerId::must("client-7")))
            .with_query_id(QueryId::must("q12"))
            .with_deadline(Duration::from_secs(20))
    }

    #[test]
    fn test_context_rendered_in_message() {
        let err = Error::QueryTimeout {
            context: ctx(),
            timeout: Duration::from_secs(20),
        };
        let msg = err.to_string();
        assert!(msg.contains("operation=analyzePosition"));
        assert!(msg.contains("caller=client-7"));
        assert!(msg.contains("id=q12"));
        assert!(msg.contains("deadline=20000ms"));
    }

    #[test]
    fn test_empty_operation_renders_unknown() {
        let rendered = QueryContext::default().to_string();
        assert_eq!(rendered, "operation=unknown");
    }

    #[test]
    fn test_codes_and_retryability() {
        let limited = Error::RateLimitExceeded {
            scope: LimitScope::Operation,
            context: ctx(),
        };
        assert_eq!(limited.code(), "RATE_LIMITED");
        assert!(limited.is_retryable());
        assert!(!limited.is_fatal());
        assert!(limited.to_string().starts_with("operation rate limit exceeded"));

        let exhausted = Error::RestartExhausted { failures: 5 };
        assert_eq!(exhausted.code(), "RESTART_EXHAUSTED");
        assert!(!exhausted.is_retryable());
        assert!(exhausted.is_fatal());
        assert!(exhausted.context().is_none());

        let stopped = Error::engine_stopped(ctx(), "engine stopped");
        assert_eq!(stopped.code(), "ENGINE_STOPPED");
        assert!(stopped.is_retryable());
        assert_eq!(stopped.context().map(|c| c.operation.as_str()), Some("analyzePosition"));
    }

    #[test]
    fn test_spawn_error_keeps_source() {
        use std::error::Error as _;
        let err = Error::ProcessSpawn {
            binary: "/opt/katago".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert!(err.source().is_some());
        assert!(err.is_fatal());
        assert_eq!(err.code(), "PROCESS_SPAWN");
    }
}
