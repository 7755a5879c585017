//! Outstanding query table.
//!
//! Every query is registered here before its request line is written and is
//! removed exactly once: by the reader delivering its response, by the caller
//! giving up at its deadline, or by a drain when the engine stops. Removal and
//! the matching send happen under the same lock, so a caller that fails to
//! remove its own entry can rely on the outcome already sitting in its receiver.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use super::protocol::EngineLine;
use crate::types::{Error, QueryContext, QueryId, Result};

/// Outcome delivered to a waiting query.
#[derive(Debug)]
pub enum Delivery {
    /// The engine answered.
    Response(EngineLine),
    /// The engine stopped or crashed before answering.
    Stopped(String),
}

#[derive(Debug)]
struct PendingQuery {
    tx: oneshot::Sender<Delivery>,
    submitted_at: Instant,
    deadline: Instant,
    context: QueryContext,
}

#[derive(Debug, Default)]
struct TableState {
    entries: HashMap<QueryId, PendingQuery>,
    // Set by the first drain; later registrations fail immediately.
    closed: Option<String>,
}

/// Correlation table of in-flight queries.
#[derive(Debug, Default)]
pub struct PendingTable {
    state: Mutex<TableState>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a query and return the receiver its outcome will arrive on.
    ///
    /// Fails with `Validation` if the id is already outstanding and with
    /// `EngineStopped` once the table has been drained.
    pub fn register(
        &self,
        id: QueryId,
        context: QueryContext,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Delivery>> {
        let mut state = self.lock();
        if let Some(reason) = &state.closed {
            return Err(Error::engine_stopped(context, reason.clone()));
        }
        if state.entries.contains_key(&id) {
            return Err(Error::validation(format!("query id {} is already outstanding", id)));
        }

        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        state.entries.insert(
            id,
            PendingQuery {
                tx,
                submitted_at: now,
                deadline: now + timeout,
                context,
            },
        );
        Ok(rx)
    }

    /// Deliver a response to its waiting query.
    ///
    /// Returns false when no query with that id is outstanding (a late answer
    /// for a timed-out query, or an id this host never issued).
    pub fn complete(&self, line: EngineLine) -> bool {
        let mut state = self.lock();
        let Some(entry) = state.entries.remove(&line.id) else {
            return false;
        };

        let now = Instant::now();
        tracing::debug!(
            id = %line.id,
            operation = %entry.context.operation,
            elapsed_ms = now.duration_since(entry.submitted_at).as_millis() as u64,
            past_deadline = now > entry.deadline,
            "query_completed"
        );
        // The receiver is gone only if the caller's future was dropped.
        let _ = entry.tx.send(Delivery::Response(line));
        true
    }

    /// Deregister a query. Returns false if it was already removed.
    pub fn remove(&self, id: &QueryId) -> bool {
        self.lock().entries.remove(id).is_some()
    }

    /// Resolve every outstanding query with `Delivery::Stopped` and refuse new
    /// registrations. Returns how many queries were resolved.
    pub fn drain(&self, reason: &str) -> usize {
        let mut state = self.lock();
        if state.closed.is_none() {
            state.closed = Some(reason.to_string());
        }

        let entries = std::mem::take(&mut state.entries);
        let drained = entries.len();
        for (id, entry) in entries {
            tracing::debug!(id = %id, context = %entry.context, "query_drained");
            let _ = entry.tx.send(Delivery::Stopped(reason.to_string()));
        }
        drained
    }

    /// Refuse new registrations without touching outstanding ones.
    pub fn close(&self, reason: &str) {
        let mut state = self.lock();
        if state.closed.is_none() {
            state.closed = Some(reason.to_string());
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
