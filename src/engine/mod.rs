//! Engine process channel.
//!
//! An [`Engine`] owns one analysis subprocess and multiplexes many concurrent
//! queries over its single stdin/stdout pair:
//!
//! ```text
//!   query ─┐                           ┌──────────────┐
//!   query ─┼─▶ register ─▶ write line ─▶│  subprocess  │
//!   query ─┘   (pending)   (stdin lock) │              │
//!      ▲                                └──────┬───────┘
//!      │                                       │ stdout lines
//!      └──── oneshot ◀── reader task ◀─────────┘
//! ```
//!
//! - Writes are serialized through the stdin lock; the reader task is the only
//!   consumer of stdout and holds the pending-table lock only to remove an entry.
//! - A query waits on its own oneshot receiver until its deadline. Timing out
//!   only deregisters it; the engine is not told, and a late answer is dropped.
//! - When the process stops or crashes every outstanding query is resolved
//!   with `EngineStopped` before the state reaches `Stopped`.
//!
//! An `Engine` runs one process once. Supervisors create a fresh engine per
//! restart.

pub mod pending;
pub mod process;
pub mod protocol;
mod watchdog;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::cache::{content_key, AnalysisCache};
use crate::types::{CallerId, EngineConfig, Error, QueryContext, QueryId, Result};
use pending::{Delivery, PendingTable};
use protocol::EngineLine;

/// Tracing target for lines the subprocess writes to stderr.
pub const STDERR_TARGET: &str = "katago_host::engine::stderr";

// =============================================================================
// Public types
// =============================================================================

/// Engine lifecycle.
///
/// ```text
/// NotStarted ──start──▶ Running ──stop / crash──▶ Stopping ──▶ Stopped
///      └──────────────────stop──────────────────────────────────▲
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::NotStarted => write!(f, "not_started"),
            EngineState::Running => write!(f, "running"),
            EngineState::Stopping => write!(f, "stopping"),
            EngineState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Failure signals an engine reports to whoever supervises it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The process exited or closed its output without being asked to stop.
    Exited { generation: u64, reason: String },
    /// A health probe failed; `consecutive` counts failures since the last success.
    ProbeFailed {
        generation: u64,
        consecutive: u32,
        error: String,
    },
    /// A probe succeeded after one or more failures.
    ProbeRecovered { generation: u64 },
}

impl EngineEvent {
    pub fn generation(&self) -> u64 {
        match self {
            EngineEvent::Exited { generation, .. }
            | EngineEvent::ProbeFailed { generation, .. }
            | EngineEvent::ProbeRecovered { generation } => *generation,
        }
    }
}

/// One analysis query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnalysisRequest {
    /// Correlation id. Assigned by the engine (`q<n>`) when absent.
    pub id: Option<QueryId>,
    /// Operation name, used for admission and error context.
    pub operation: String,
    pub caller: Option<CallerId>,
    /// Request object sent to the engine (any `id` field is overridden).
    pub body: Map<String, Value>,
    /// Whether the response may be served from and stored in the result cache.
    pub cacheable: bool,
}

impl AnalysisRequest {
    pub fn new(operation: impl Into<String>, body: Map<String, Value>) -> Self {
        Self {
            operation: operation.into(),
            body,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: QueryId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_caller(mut self, caller: CallerId) -> Self {
        self.caller = Some(caller);
        self
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }
}

/// Engine answer for one query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResponse {
    pub id: QueryId,
    /// Response object without its `id`.
    pub fields: Map<String, Value>,
    pub from_cache: bool,
}

/// Interface the supervisor and the adapter layer program against.
#[async_trait]
pub trait AnalysisEngine: Send + Sync + fmt::Debug {
    /// Spawn the process and begin reading its output.
    async fn start(&self) -> Result<()>;

    /// Stop the process, resolving every outstanding query with `EngineStopped`.
    async fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Send one query and wait for its correlated response or its deadline.
    async fn query(&self, request: AnalysisRequest) -> Result<AnalysisResponse>;

    /// Lightweight round trip proving the process still answers.
    async fn ping(&self) -> Result<()>;
}

/// Optional wiring for an engine created by a supervisor.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Restart counter of the owning supervisor; tags every event.
    pub generation: u64,
    pub cache: Option<Arc<AnalysisCache>>,
    pub events: Option<mpsc::UnboundedSender<EngineEvent>>,
}

// =============================================================================
// Engine
// =============================================================================

/// Process-backed [`AnalysisEngine`]. Cloning yields another handle to the same process.
#[derive(Debug, Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

#[derive(Debug)]
struct EngineShared {
    config: EngineConfig,
    generation: u64,
    cache: Option<Arc<AnalysisCache>>,
    events: Option<mpsc::UnboundedSender<EngineEvent>>,

    state: watch::Sender<EngineState>,
    started: AtomicBool,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pid: AtomicU32,
    pending: PendingTable,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    next_id: AtomicU64,
    next_probe: AtomicU64,
}

impl Drop for EngineShared {
    fn drop(&mut self) {
        // Background tasks hold weak handles; this ends them. The child is
        // killed when its handle drops.
        self.cancel.cancel();
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_options(config, EngineOptions::default())
    }

    pub fn with_options(config: EngineConfig, options: EngineOptions) -> Self {
        let (state, _) = watch::channel(EngineState::NotStarted);
        Self {
            shared: Arc::new(EngineShared {
                config,
                generation: options.generation,
                cache: options.cache,
                events: options.events,
                state,
                started: AtomicBool::new(false),
                stdin: tokio::sync::Mutex::new(None),
                child: Mutex::new(None),
                pid: AtomicU32::new(0),
                pending: PendingTable::new(),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
                next_probe: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.shared.state.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    /// OS process id while the process is running.
    pub fn pid(&self) -> Option<u32> {
        match self.shared.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Number of queries waiting for a response.
    pub fn pending_queries(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    fn from_shared(shared: Arc<EngineShared>) -> Self {
        Self { shared }
    }
}

#[async_trait]
impl AnalysisEngine for Engine {
    async fn start(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.started.swap(true, Ordering::AcqRel) {
            return Err(Error::state_transition(format!(
                "engine generation {} was already started",
                shared.generation
            )));
        }

        let mut child = match process::spawn(&shared.config) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(generation = shared.generation, error = %e, "engine_spawn_failed");
                shared.pending.close("engine failed to start");
                shared.state.send_replace(EngineState::Stopped);
                return Err(e);
            }
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            shared.pending.close("engine failed to start");
            shared.state.send_replace(EngineState::Stopped);
            process::terminate(child, Duration::ZERO).await;
            return Err(Error::Io(std::io::Error::other(
                "engine standard streams were not captured",
            )));
        };

        let pid = child.id();
        *shared.stdin.lock().await = Some(stdin);
        *shared.lock_child() = Some(child);

        // A stop that raced the spawn has already moved the state to Stopped.
        let became_running = shared.state.send_if_modified(|state| {
            if *state == EngineState::NotStarted {
                *state = EngineState::Running;
                true
            } else {
                false
            }
        });
        if !became_running {
            shared.stdin.lock().await.take();
            if let Some(child) = shared.take_child() {
                process::terminate(child, Duration::ZERO).await;
            }
            return Err(Error::state_transition("engine was stopped while starting"));
        }
        shared.pid.store(pid.unwrap_or(0), Ordering::Release);

        let weak = Arc::downgrade(shared);
        let mut tasks = vec![
            tokio::spawn(read_loop(weak.clone(), stdout, shared.cancel.clone())),
            tokio::spawn(drain_stderr(shared.generation, stderr, shared.cancel.clone())),
        ];
        if !shared.config.probe_interval.is_zero() {
            tasks.push(tokio::spawn(watchdog::run(
                weak,
                shared.config.probe_interval,
                shared.cancel.clone(),
            )));
        }
        shared.lock_tasks().extend(tasks);

        tracing::info!(
            generation = shared.generation,
            pid = pid.unwrap_or(0),
            binary = %shared.config.binary_path.display(),
            "engine_started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let shared = &self.shared;
        let mut previous = EngineState::NotStarted;
        shared.state.send_if_modified(|state| {
            previous = *state;
            match *state {
                EngineState::Running => {
                    *state = EngineState::Stopping;
                    true
                }
                EngineState::NotStarted => {
                    *state = EngineState::Stopped;
                    true
                }
                EngineState::Stopping | EngineState::Stopped => false,
            }
        });

        match previous {
            EngineState::NotStarted => {
                shared.pending.drain("engine stopped");
                return Ok(());
            }
            EngineState::Stopping | EngineState::Stopped => {
                // Another stop, or crash handling, owns the teardown.
                let mut rx = shared.state.subscribe();
                let _ = rx.wait_for(|state| *state == EngineState::Stopped).await;
                return Ok(());
            }
            EngineState::Running => {}
        }

        tracing::info!(generation = shared.generation, "engine_stopping");
        shared.cancel.cancel();

        // Waits for an in-flight write; bounded in case the pipe is full.
        let grace = shared.config.shutdown_grace;
        match tokio::time::timeout(grace, shared.stdin.lock()).await {
            Ok(mut stdin) => drop(stdin.take()),
            Err(_) => tracing::warn!(generation = shared.generation, "engine_stdin_busy_at_stop"),
        }

        let drained = shared.pending.drain("engine stopped");

        if let Some(child) = shared.take_child() {
            process::terminate(child, grace).await;
        }
        shared.pid.store(0, Ordering::Release);

        let tasks: Vec<_> = shared.lock_tasks().drain(..).collect();
        futures::future::join_all(tasks).await;

        shared.state.send_replace(EngineState::Stopped);
        tracing::info!(generation = shared.generation, drained, "engine_stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    async fn query(&self, request: AnalysisRequest) -> Result<AnalysisResponse> {
        let shared = &self.shared;
        let timeout = shared.config.query_timeout();

        let cache_key = match &shared.cache {
            Some(_) if request.cacheable => Some(content_key(&request.body)),
            _ => None,
        };
        if let (Some(cache), Some(key)) = (&shared.cache, &cache_key) {
            if let Some(fields) = cache.get(key) {
                let id = request.id.unwrap_or_else(|| shared.generated_id());
                tracing::debug!(id = %id, operation = %request.operation, "query_served_from_cache");
                return Ok(AnalysisResponse {
                    id,
                    fields,
                    from_cache: true,
                });
            }
        }

        let context = QueryContext::new(request.operation.as_str())
            .with_caller(request.caller.clone())
            .with_deadline(timeout);

        let deadline = Instant::now() + timeout;
        let (id, rx) = match request.id {
            Some(id) => {
                let context = context.clone().with_query_id(id.clone());
                let rx = shared.register(&id, context)?;
                (id, rx)
            }
            None => shared.register_generated(&context)?,
        };
        let context = context.with_query_id(id.clone());
        let body = protocol::with_default_visits(request.body, shared.config.max_visits);

        let line = shared
            .round_trip(&id, &body, rx, context.clone(), timeout, deadline)
            .await?;

        if let Some(message) = line.error() {
            tracing::debug!(id = %id, operation = %context.operation, error = %message, "engine_reported_error");
            return Err(Error::EngineReported { context, message });
        }

        if let (Some(cache), Some(key)) = (&shared.cache, cache_key) {
            cache.insert(key, line.fields.clone());
        }

        Ok(AnalysisResponse {
            id,
            fields: line.fields,
            from_cache: false,
        })
    }

    async fn ping(&self) -> Result<()> {
        let shared = &self.shared;
        let timeout = shared.config.probe_timeout;
        let seq = shared.next_probe.fetch_add(1, Ordering::Relaxed) + 1;
        let id = QueryId::probe(seq);
        let context = QueryContext::new("health_probe")
            .with_query_id(id.clone())
            .with_deadline(timeout);

        let deadline = Instant::now() + timeout;
        let rx = shared.register(&id, context.clone())?;
        let line = shared
            .round_trip(&id, &protocol::probe_body(), rx, context.clone(), timeout, deadline)
            .await?;

        match line.error() {
            Some(message) => Err(Error::EngineReported { context, message }),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Shared internals
// =============================================================================

impl EngineShared {
    fn is_running(&self) -> bool {
        *self.state.borrow() == EngineState::Running
    }

    fn generated_id(&self) -> QueryId {
        QueryId::generated(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn register(
        &self,
        id: &QueryId,
        context: QueryContext,
    ) -> Result<tokio::sync::oneshot::Receiver<Delivery>> {
        if !self.is_running() {
            return Err(Error::engine_stopped(context, "engine is not running"));
        }
        let timeout = context.deadline.unwrap_or(self.config.query_timeout());
        self.pending.register(id.clone(), context, timeout)
    }

    /// Register under a fresh `q<n>` id, skipping any a caller is already using.
    fn register_generated(
        &self,
        context: &QueryContext,
    ) -> Result<(QueryId, tokio::sync::oneshot::Receiver<Delivery>)> {
        loop {
            let id = self.generated_id();
            match self.register(&id, context.clone().with_query_id(id.clone())) {
                Ok(rx) => return Ok((id, rx)),
                Err(Error::Validation(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write a registered query and wait for its outcome.
    ///
    /// One deadline covers taking the stdin lock, the write and the wait for
    /// the answer, so a process that stops reading its input cannot hold a
    /// caller past its deadline.
    async fn round_trip(
        &self,
        id: &QueryId,
        body: &Map<String, Value>,
        mut rx: tokio::sync::oneshot::Receiver<Delivery>,
        context: QueryContext,
        timeout: Duration,
        deadline: Instant,
    ) -> Result<EngineLine> {
        let line = match protocol::encode_request(id, body) {
            Ok(line) => line,
            Err(e) => {
                self.pending.remove(id);
                return Err(e);
            }
        };

        let mut stdin = match timeout_at(deadline, self.stdin.lock()).await {
            Ok(stdin) => stdin,
            Err(_) => {
                self.pending.remove(id);
                tracing::warn!(id = %id, operation = %context.operation, "query_timed_out_waiting_for_stdin");
                return Err(Error::QueryTimeout { context, timeout });
            }
        };

        // Stop flips the state before taking this lock; nothing is written after that.
        let written = match stdin.as_mut() {
            Some(writer) if self.is_running() => {
                timeout_at(deadline, protocol::write_line(writer, &line)).await
            }
            _ => Ok(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "engine is not running",
            ))),
        };
        match written {
            Ok(Ok(())) => drop(stdin),
            Ok(Err(e)) => {
                drop(stdin);
                self.pending.remove(id);
                return Err(Error::engine_stopped(
                    context,
                    format!("failed to send request: {}", e),
                ));
            }
            Err(_) => {
                // Part of the line may already be in the pipe; anything written
                // after it would be garbled, so the input is closed for good.
                stdin.take();
                drop(stdin);
                self.pending.remove(id);
                tracing::warn!(
                    generation = self.generation,
                    id = %id,
                    bytes = line.len(),
                    "engine_stdin_stalled"
                );
                return Err(Error::QueryTimeout { context, timeout });
            }
        }
        tracing::debug!(id = %id, operation = %context.operation, "query_sent");

        let delivery = match timeout_at(deadline, &mut rx).await {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(_)) => return Err(Error::engine_stopped(context, "response channel closed")),
            Err(_) => {
                if self.pending.remove(id) {
                    tracing::warn!(id = %id, operation = %context.operation, timeout_ms = timeout.as_millis() as u64, "query_timed_out");
                    return Err(Error::QueryTimeout { context, timeout });
                }
                // Delivered (or drained) just as the deadline passed; the outcome is already queued.
                match rx.try_recv() {
                    Ok(delivery) => delivery,
                    Err(_) => return Err(Error::QueryTimeout { context, timeout }),
                }
            }
        };

        match delivery {
            Delivery::Response(line) => Ok(line),
            Delivery::Stopped(reason) => Err(Error::engine_stopped(context, reason)),
        }
    }

    /// Route one stdout line to its waiting query.
    fn dispatch(&self, raw: &str) {
        let raw = raw.trim();
        if raw.is_empty() {
            return;
        }

        let line = match protocol::decode_line(raw) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(generation = self.generation, error = %e, "engine_output_discarded");
                return;
            }
        };

        if !line.is_final() {
            if let Some(warning) = line.fields.get("warning") {
                tracing::warn!(id = %line.id, %warning, "engine_warning");
            }
            return;
        }

        let id = line.id.clone();
        if !self.pending.complete(line) {
            tracing::debug!(generation = self.generation, id = %id, "late_or_unknown_response_dropped");
        }
    }

    /// Teardown after the process went away without a stop request.
    async fn handle_unexpected_exit(&self, reason: String) {
        let claimed = self.state.send_if_modified(|state| {
            if *state == EngineState::Running {
                *state = EngineState::Stopping;
                true
            } else {
                false
            }
        });
        if !claimed {
            return;
        }

        tracing::warn!(generation = self.generation, reason = %reason, "engine_exited_unexpectedly");
        self.cancel.cancel();
        self.stdin.lock().await.take();
        let drained = self.pending.drain(&reason);

        if let Some(child) = self.take_child() {
            if let Some(status) = process::terminate(child, self.config.shutdown_grace).await {
                tracing::warn!(generation = self.generation, %status, "engine_exit_status");
            }
        }
        self.pid.store(0, Ordering::Release);

        self.state.send_replace(EngineState::Stopped);
        tracing::info!(generation = self.generation, drained, "engine_stopped");

        self.report(EngineEvent::Exited {
            generation: self.generation,
            reason,
        });
    }

    fn report(&self, event: EngineEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn take_child(&self) -> Option<Child> {
        self.lock_child().take()
    }

    fn lock_child(&self) -> MutexGuard<'_, Option<Child>> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// Background tasks
// =============================================================================

/// Sole consumer of the subprocess's stdout.
async fn read_loop(shared: Weak<EngineShared>, stdout: ChildStdout, cancel: CancellationToken) {
    let mut lines = BufReader::new(stdout).lines();

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            next = lines.next_line() => match next {
                Ok(Some(line)) => match shared.upgrade() {
                    Some(shared) => shared.dispatch(&line),
                    None => return,
                },
                Ok(None) => break "engine process exited".to_string(),
                Err(e) => break format!("failed to read engine output: {}", e),
            }
        }
    };

    if let Some(shared) = shared.upgrade() {
        shared.handle_unexpected_exit(reason).await;
    }
}

/// Forward stderr to the log. Never parsed.
async fn drain_stderr(generation: u64, stderr: ChildStderr, cancel: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = lines.next_line() => match next {
                Ok(Some(line)) => tracing::debug!(target: STDERR_TARGET, generation, "{}", line),
                Ok(None) | Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
    use tracing_test::traced_test;

    fn shell_engine(script: &str) -> EngineConfig {
        EngineConfig {
            binary_path: PathBuf::from("sh"),
            args: Some(vec!["-c".to_string(), script.to_string()]),
            max_analysis_time: Duration::from_millis(500),
            probe_interval: Duration::ZERO,
            probe_timeout: Duration::from_secs(1),
            shutdown_grace: Duration::from_millis(500),
            ..Default::default()
        }
    }

    fn body(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let engine = Engine::new(shell_engine("exec cat"));
        engine.start().await.unwrap();
        assert!(engine.is_running());
        assert!(engine.pid().is_some());

        let response = engine
            .query(AnalysisRequest::new("analyzePosition", body(json!({"moves": [["B", "Q16"]]}))))
            .await
            .unwrap();
        assert_eq!(response.id.as_str(), "q1");
        assert_eq!(response.fields["moves"], json!([["B", "Q16"]]));
        assert!(!response.from_cache);

        engine.ping().await.unwrap();
        engine.stop().await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.pid().is_none());
    }

    #[tokio::test]
    async fn test_default_visit_budget_applied() {
        let mut config = shell_engine("exec cat");
        config.max_visits = 250;
        let engine = Engine::new(config);
        engine.start().await.unwrap();

        let defaulted = engine
            .query(AnalysisRequest::new("analyzePosition", body(json!({"moves": []}))))
            .await
            .unwrap();
        assert_eq!(defaulted.fields["maxVisits"], json!(250));

        let explicit = engine
            .query(AnalysisRequest::new(
                "analyzePosition",
                body(json!({"moves": [], "maxVisits": 16})),
            ))
            .await
            .unwrap();
        assert_eq!(explicit.fields["maxVisits"], json!(16));

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let engine = Engine::new(shell_engine("exec cat"));
        engine.start().await.unwrap();
        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, Error::StateTransition(_)));
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_query_before_start_fails_fast() {
        let engine = Engine::new(shell_engine("exec cat"));
        let err = engine
            .query(AnalysisRequest::new("analyzePosition", Map::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EngineStopped { .. }));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let engine = Engine::new(shell_engine("exec cat"));
        engine.stop().await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.start().await.is_err());
    }

    #[tokio::test]
    async fn test_engine_reported_error() {
        let engine = Engine::new(shell_engine("exec cat"));
        engine.start().await.unwrap();

        let err = engine
            .query(AnalysisRequest::new(
                "analyzePosition",
                body(json!({"error": {"message": "illegal move"}})),
            ))
            .await
            .unwrap_err();
        match err {
            Error::EngineReported { message, context } => {
                assert_eq!(message, "illegal move");
                assert_eq!(context.operation, "analyzePosition");
            }
            other => panic!("unexpected error {other:?}"),
        }
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_hit_skips_engine() {
        let cache = Arc::new(AnalysisCache::new(&crate::types::CacheConfig::default()));
        let engine = Engine::with_options(
            shell_engine("exec cat"),
            EngineOptions {
                cache: Some(cache.clone()),
                ..Default::default()
            },
        );
        engine.start().await.unwrap();

        let request = AnalysisRequest::new("analyzePosition", body(json!({"moves": []}))).cacheable();
        let first = engine.query(request.clone()).await.unwrap();
        assert!(!first.from_cache);

        engine.stop().await.unwrap();

        // The cache answers even though the process is gone.
        let second = engine.query(request).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.fields, first.fields);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_duplicate_caller_id_rejected() {
        let engine = Engine::new(shell_engine("exec sleep 30"));
        engine.start().await.unwrap();

        let id = QueryId::must("dup");
        let first = {
            let engine = engine.clone();
            let id = id.clone();
            tokio::spawn(async move {
                engine
                    .query(AnalysisRequest::new("analyzePosition", Map::new()).with_id(id))
                    .await
            })
        };
        while engine.pending_queries() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = engine
            .query(AnalysisRequest::new("analyzePosition", Map::new()).with_id(id))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        engine.stop().await.unwrap();
        let first = first.await.unwrap().unwrap_err();
        assert!(matches!(first, Error::EngineStopped { .. }));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_malformed_output_logged_and_discarded() {
        let engine = Engine::new(shell_engine("echo not-json; exec cat"));
        engine.start().await.unwrap();

        let response = engine
            .query(AnalysisRequest::new("analyzePosition", body(json!({"rules": "japanese"}))))
            .await
            .unwrap();
        assert_eq!(response.fields["rules"], json!("japanese"));
        assert!(engine.is_running());
        assert!(logs_contain("engine_output_discarded"));

        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_crash_reports_exit_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = Engine::with_options(
            shell_engine("read line; exit 3"),
            EngineOptions {
                generation: 7,
                events: Some(tx),
                ..Default::default()
            },
        );
        engine.start().await.unwrap();

        let err = engine
            .query(AnalysisRequest::new("analyzePosition", Map::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EngineStopped { .. }));

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.generation(), 7);
        assert!(matches!(event, EngineEvent::Exited { .. }));
        assert_eq!(engine.state(), EngineState::Stopped);

        // Stopping an engine that already crashed is a no-op.
        engine.stop().await.unwrap();
    }
}
