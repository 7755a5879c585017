//! Periodic health probe.
//!
//! Pings the engine on a fixed interval and reports consecutive failures over
//! the engine's event channel. The watchdog never stops or restarts the
//! engine itself; deciding what a failure means is the supervisor's job.

use std::sync::Weak;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{AnalysisEngine, Engine, EngineEvent, EngineShared};

pub(super) async fn run(shared: Weak<EngineShared>, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick; the engine was just started.
    ticker.tick().await;

    let mut consecutive: u32 = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(strong) = shared.upgrade() else {
            break;
        };
        if !strong.is_running() {
            break;
        }
        let generation = strong.generation;
        let engine = Engine::from_shared(strong);

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = engine.ping() => result,
        };

        match result {
            Ok(()) => {
                if consecutive > 0 {
                    tracing::info!(generation, after_failures = consecutive, "engine_probe_recovered");
                    engine.shared.report(EngineEvent::ProbeRecovered { generation });
                }
                consecutive = 0;
            }
            Err(e) => {
                consecutive = consecutive.saturating_add(1);
                tracing::warn!(generation, consecutive, error = %e, "engine_probe_failed");
                engine.shared.report(EngineEvent::ProbeFailed {
                    generation,
                    consecutive,
                    error: e.to_string(),
                });
            }
        }
    }

    tracing::debug!("engine_watchdog_stopped");
}
