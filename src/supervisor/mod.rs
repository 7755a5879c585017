//! Engine supervision.
//!
//! The [`Supervisor`] owns the currently active engine and replaces it when it
//! crashes or stops answering health probes:
//!
//! ```text
//!            start                 launch ok
//! Stopped ─────────▶ Starting ──────────────▶ Running
//!                      ▲   │ launch failed       │ exit / unhealthy / restart()
//!                      │   ▼                     ▼
//!                      └─ Restarting ◀───────────┘
//!                          │ budget exhausted
//!                          ▼
//!                        Failed
//! ```
//!
//! While no engine is running, [`Supervisor::engine`] hands out a placeholder
//! that fails every query immediately, so callers are never left waiting on a
//! process that is being replaced. The failed engine is always stopped (and
//! its outstanding queries drained) before the replacement is launched.

mod backoff;

pub use backoff::{BackoffPolicy, RestartDecision, RestartRecord};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::AnalysisCache;
use crate::engine::{
    AnalysisEngine, AnalysisRequest, AnalysisResponse, Engine, EngineEvent, EngineOptions,
};
use crate::types::{EngineConfig, Error, QueryContext, Result, SupervisorConfig};

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Restarting,
    Failed,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Stopped => write!(f, "stopped"),
            SupervisorState::Starting => write!(f, "starting"),
            SupervisorState::Running => write!(f, "running"),
            SupervisorState::Restarting => write!(f, "restarting"),
            SupervisorState::Failed => write!(f, "failed"),
        }
    }
}

/// Point-in-time supervisor summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub generation: u64,
    pub engine_running: bool,
    pub consecutive_failures: u32,
    #[serde(with = "humantime_serde")]
    pub current_backoff: Duration,
    pub last_restart: Option<DateTime<Utc>>,
}

// =============================================================================
// Engine factory
// =============================================================================

/// Builds a fresh engine for each generation.
pub trait EngineFactory: Send + Sync + fmt::Debug {
    fn create(
        &self,
        generation: u64,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Arc<dyn AnalysisEngine>;
}

/// Factory for process-backed engines sharing one result cache.
#[derive(Debug, Clone)]
pub struct ProcessEngineFactory {
    config: EngineConfig,
    cache: Option<Arc<AnalysisCache>>,
}

impl ProcessEngineFactory {
    pub fn new(config: EngineConfig, cache: Option<Arc<AnalysisCache>>) -> Self {
        Self { config, cache }
    }
}

impl EngineFactory for ProcessEngineFactory {
    fn create(
        &self,
        generation: u64,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Arc<dyn AnalysisEngine> {
        Arc::new(Engine::with_options(
            self.config.clone(),
            EngineOptions {
                generation,
                cache: self.cache.clone(),
                events: Some(events),
            },
        ))
    }
}

// =============================================================================
// Placeholder engine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unavailable {
    Restarting,
    Exhausted(u32),
    Stopped,
}

/// Stand-in returned by [`Supervisor::engine`] while no engine is running.
#[derive(Debug)]
struct UnavailableEngine {
    reason: Unavailable,
}

impl UnavailableEngine {
    fn shared(reason: Unavailable) -> Arc<dyn AnalysisEngine> {
        Arc::new(Self { reason })
    }

    fn error(&self, context: QueryContext) -> Error {
        match self.reason {
            Unavailable::Restarting => Error::EngineRestarting { context },
            Unavailable::Exhausted(failures) => Error::RestartExhausted { failures },
            Unavailable::Stopped => Error::engine_stopped(context, "supervisor is stopped"),
        }
    }
}

#[async_trait]
impl AnalysisEngine for UnavailableEngine {
    async fn start(&self) -> Result<()> {
        Err(Error::state_transition(
            "the supervisor starts engines; start the supervisor instead",
        ))
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn is_running(&self) -> bool {
        false
    }

    async fn query(&self, request: AnalysisRequest) -> Result<AnalysisResponse> {
        let mut context = QueryContext::new(request.operation).with_caller(request.caller);
        if let Some(id) = request.id {
            context = context.with_query_id(id);
        }
        Err(self.error(context))
    }

    async fn ping(&self) -> Result<()> {
        Err(self.error(QueryContext::new("health_probe")))
    }
}

// =============================================================================
// Supervisor
// =============================================================================

#[derive(Debug)]
struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    restart_tx: mpsc::Sender<()>,
}

#[derive(Debug)]
struct SupervisorShared {
    config: SupervisorConfig,
    policy: BackoffPolicy,
    factory: Arc<dyn EngineFactory>,
    current: RwLock<Arc<dyn AnalysisEngine>>,
    state: watch::Sender<SupervisorState>,
    record: Mutex<RestartRecord>,
    last_restart_at: Mutex<Option<DateTime<Utc>>>,
    generation: AtomicU64,
}

/// Crash-detecting, restarting owner of the active engine.
#[derive(Debug)]
pub struct Supervisor {
    shared: Arc<SupervisorShared>,
    run: tokio::sync::Mutex<Option<RunHandle>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, factory: Arc<dyn EngineFactory>) -> Self {
        let (state, _) = watch::channel(SupervisorState::Stopped);
        Self {
            shared: Arc::new(SupervisorShared {
                policy: BackoffPolicy::from(&config.backoff),
                config,
                factory,
                current: RwLock::new(UnavailableEngine::shared(Unavailable::Stopped)),
                state,
                record: Mutex::new(RestartRecord::default()),
                last_restart_at: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
            run: tokio::sync::Mutex::new(None),
        }
    }

    /// Supervisor over process-backed engines.
    pub fn for_process(
        config: SupervisorConfig,
        engine: EngineConfig,
        cache: Option<Arc<AnalysisCache>>,
    ) -> Self {
        Self::new(config, Arc::new(ProcessEngineFactory::new(engine, cache)))
    }

    /// Begin supervising. Returns once the supervision task is running; use
    /// [`Supervisor::wait_until_running`] to wait for the first engine.
    pub async fn start(&self) -> Result<()> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            return Err(Error::state_transition("supervisor already started"));
        }

        *self.shared.lock_record() = RestartRecord::default();
        let cancel = CancellationToken::new();
        let (restart_tx, restart_rx) = mpsc::channel(1);
        self.shared.state.send_replace(SupervisorState::Starting);
        self.shared.install(UnavailableEngine::shared(Unavailable::Restarting));

        let task = tokio::spawn(supervise(self.shared.clone(), cancel.clone(), restart_rx));
        *run = Some(RunHandle {
            cancel,
            task,
            restart_tx,
        });

        tracing::info!("supervisor_started");
        Ok(())
    }

    /// Stop supervising and stop the active engine. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let Some(handle) = self.run.lock().await.take() else {
            return Ok(());
        };

        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            tracing::error!(error = %e, "supervisor_task_failed");
        }

        // Covers a task that already ended in Failed; stopping a stopped engine is a no-op.
        let engine = self.shared.install(UnavailableEngine::shared(Unavailable::Stopped));
        engine.stop().await?;
        self.shared.state.send_replace(SupervisorState::Stopped);
        tracing::info!("supervisor_stopped");
        Ok(())
    }

    /// Request a restart of the active engine. Does not count as a failure.
    /// Returns false if the supervisor is not started or a restart is already pending.
    pub async fn restart(&self) -> bool {
        let run = self.run.lock().await;
        let Some(handle) = run.as_ref() else {
            return false;
        };
        match handle.restart_tx.try_send(()) {
            Ok(()) => {
                tracing::info!("manual_restart_requested");
                true
            }
            Err(_) => false,
        }
    }

    /// The engine to send queries to right now.
    pub fn engine(&self) -> Arc<dyn AnalysisEngine> {
        self.shared.current()
    }

    pub fn state(&self) -> SupervisorState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.shared.state.subscribe()
    }

    pub fn status(&self) -> SupervisorStatus {
        let record = self.shared.lock_record().clone();
        SupervisorStatus {
            state: self.state(),
            generation: self.shared.generation.load(Ordering::Acquire),
            engine_running: self.shared.current().is_running(),
            consecutive_failures: record.consecutive_failures,
            current_backoff: record.current_backoff,
            last_restart: *self.shared.lock_last_restart(),
        }
    }

    /// Wait until an engine is running.
    ///
    /// Fails with `RestartExhausted` if the supervisor gives up first and with
    /// `EngineRestarting` if `timeout` elapses.
    pub async fn wait_until_running(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| {
                matches!(
                    state,
                    SupervisorState::Running | SupervisorState::Failed | SupervisorState::Stopped
                )
            }),
        )
        .await;

        let state = match waited {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => SupervisorState::Stopped,
            Err(_) => {
                return Err(Error::EngineRestarting {
                    context: QueryContext::new("wait_until_running").with_deadline(timeout),
                })
            }
        };

        match state {
            SupervisorState::Running => Ok(()),
            SupervisorState::Failed => Err(Error::RestartExhausted {
                failures: self.shared.lock_record().consecutive_failures,
            }),
            _ => Err(Error::engine_stopped(
                QueryContext::new("wait_until_running"),
                "supervisor is stopped",
            )),
        }
    }
}

impl SupervisorShared {
    fn current(&self) -> Arc<dyn AnalysisEngine> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a new active engine and return the previous one.
    fn install(&self, engine: Arc<dyn AnalysisEngine>) -> Arc<dyn AnalysisEngine> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, engine)
    }

    fn set_state(&self, state: SupervisorState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::debug!(from = %current, to = %state, "supervisor_state_changed");
                *current = state;
                true
            }
        });
    }

    fn record_failure(&self) -> RestartDecision {
        let decision = self
            .lock_record()
            .record_failure(Instant::now(), &self.policy, &self.config);
        if matches!(decision, RestartDecision::Retry(_)) {
            *self.lock_last_restart() = Some(Utc::now());
        }
        decision
    }

    fn lock_record(&self) -> MutexGuard<'_, RestartRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_last_restart(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.last_restart_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Why a running engine is being replaced.
enum Replacement {
    Failure(String),
    Requested,
}

/// Supervision loop. Runs until cancelled or the restart budget is exhausted.
async fn supervise(
    shared: Arc<SupervisorShared>,
    cancel: CancellationToken,
    mut restart_rx: mpsc::Receiver<()>,
) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    loop {
        shared.set_state(SupervisorState::Starting);
        let generation = shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let engine = shared.factory.create(generation, events_tx.clone());

        let launched = tokio::select! {
            _ = cancel.cancelled() => {
                stop_engine(&engine, generation).await;
                return;
            }
            launched = launch(engine.as_ref(), shared.config.startup_timeout) => launched,
        };

        if let Err(e) = launched {
            tracing::error!(generation, error = %e, "engine_launch_failed");
            stop_engine(&engine, generation).await;
            if !back_off(&shared, &cancel).await {
                return;
            }
            continue;
        }

        // Restart requests made while no engine was running are already satisfied.
        while restart_rx.try_recv().is_ok() {}
        shared.install(engine.clone());
        shared.set_state(SupervisorState::Running);
        tracing::info!(generation, "engine_running");

        let healthy_reset = tokio::time::sleep(shared.config.healthy_reset_after);
        tokio::pin!(healthy_reset);
        let mut reset_pending = true;

        let replacement = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    shared.install(UnavailableEngine::shared(Unavailable::Stopped));
                    stop_engine(&engine, generation).await;
                    return;
                }
                Some(()) = restart_rx.recv() => break Replacement::Requested,
                Some(event) = events_rx.recv() => {
                    if event.generation() != generation {
                        tracing::debug!(generation, stale = event.generation(), "stale_engine_event_ignored");
                        continue;
                    }
                    match event {
                        EngineEvent::Exited { reason, .. } => break Replacement::Failure(reason),
                        EngineEvent::ProbeFailed { consecutive, error, .. }
                            if consecutive >= shared.config.unhealthy_probe_threshold =>
                        {
                            break Replacement::Failure(format!(
                                "{} consecutive health probes failed, last: {}",
                                consecutive, error
                            ));
                        }
                        _ => {}
                    }
                }
                _ = &mut healthy_reset, if reset_pending => {
                    reset_pending = false;
                    shared.lock_record().reset();
                    tracing::debug!(generation, "restart_record_reset_after_healthy_run");
                }
            }
        };

        shared.install(UnavailableEngine::shared(Unavailable::Restarting));
        shared.set_state(SupervisorState::Restarting);
        stop_engine(&engine, generation).await;

        match replacement {
            Replacement::Requested => {
                tracing::info!(generation, "engine_restarting_on_request");
            }
            Replacement::Failure(reason) => {
                tracing::warn!(generation, reason = %reason, "engine_failed");
                if !back_off(&shared, &cancel).await {
                    return;
                }
            }
        }
    }
}

/// Start the engine and wait for it to answer a probe.
///
/// Probes are retried until `startup_timeout`; an engine still loading its
/// model queues the probe and answers late.
async fn launch(engine: &dyn AnalysisEngine, startup_timeout: Duration) -> Result<()> {
    engine.start().await?;

    let probe_until_ready = async {
        loop {
            match engine.ping().await {
                Ok(()) => return Ok(()),
                Err(Error::QueryTimeout { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    };

    match tokio::time::timeout(startup_timeout, probe_until_ready).await {
        Ok(result) => result,
        Err(_) => Err(Error::EngineRestarting {
            context: QueryContext::new("startup_probe").with_deadline(startup_timeout),
        }),
    }
}

async fn stop_engine(engine: &Arc<dyn AnalysisEngine>, generation: u64) {
    if let Err(e) = engine.stop().await {
        tracing::warn!(generation, error = %e, "engine_stop_failed");
    }
}

/// Record a failure and sleep its backoff delay. Returns false when supervision
/// should end (budget exhausted or cancelled).
async fn back_off(shared: &SupervisorShared, cancel: &CancellationToken) -> bool {
    match shared.record_failure() {
        RestartDecision::Retry(delay) => {
            shared.install(UnavailableEngine::shared(Unavailable::Restarting));
            shared.set_state(SupervisorState::Restarting);
            tracing::info!(delay_ms = delay.as_millis() as u64, "engine_restart_scheduled");
            tokio::select! {
                _ = cancel.cancelled() => {
                    shared.install(UnavailableEngine::shared(Unavailable::Stopped));
                    false
                }
                _ = tokio::time::sleep(delay) => true,
            }
        }
        RestartDecision::Exhausted(failures) => {
            shared.install(UnavailableEngine::shared(Unavailable::Exhausted(failures)));
            shared.set_state(SupervisorState::Failed);
            tracing::error!(failures, "engine_restart_budget_exhausted");
            false
        }
    }
}
