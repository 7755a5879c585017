//! Subprocess spawn and bounded-grace termination.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::types::{EngineConfig, Error, Result};

/// Spawn the engine with all three standard streams piped.
///
/// The child is killed if its handle is dropped, so a leaked engine never
/// outlives the host.
pub fn spawn(config: &EngineConfig) -> Result<Child> {
    let args = config.command_args();
    tracing::debug!(binary = %config.binary_path.display(), ?args, "spawning_engine");

    Command::new(&config.binary_path)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| Error::ProcessSpawn {
            binary: config.binary_path.display().to_string(),
            source,
        })
}

/// Longest wait between SIGTERM and the final kill.
const TERM_WAIT: Duration = Duration::from_secs(5);

/// Wait up to `grace` for the child to exit on its own (its stdin should
/// already be closed), then send SIGTERM and wait a little longer, then kill it.
///
/// Returns the exit status when one could be collected.
pub async fn terminate(mut child: Child, grace: Duration) -> Option<ExitStatus> {
    if let Some(status) = wait_for_exit(&mut child, grace).await {
        return status;
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        tracing::warn!(pid, grace_ms = grace.as_millis() as u64, "engine_sigterm_after_grace");
        match i32::try_from(pid) {
            Ok(raw) => {
                if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                    tracing::warn!(pid, error = %e, "engine_sigterm_failed");
                }
            }
            Err(_) => tracing::warn!(pid, "engine_pid_out_of_range"),
        }
        if let Some(status) = wait_for_exit(&mut child, grace.min(TERM_WAIT)).await {
            return status;
        }
    }

    tracing::warn!("engine_kill");
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "engine_kill_failed");
        return None;
    }
    child.wait().await.ok()
}

/// `Some(outcome)` if the child exited (or waiting failed) within `limit`.
async fn wait_for_exit(child: &mut Child, limit: Duration) -> Option<Option<ExitStatus>> {
    match timeout(limit, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(%status, "engine_exited");
            Some(Some(status))
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "engine_wait_failed");
            Some(None)
        }
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Instant;

    fn shell(script: &str) -> EngineConfig {
        EngineConfig {
            binary_path: PathBuf::from("sh"),
            args: Some(vec!["-c".to_string(), script.to_string()]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let config = EngineConfig {
            binary_path: PathBuf::from("/nonexistent/katago-host-test-binary"),
            ..Default::default()
        };
        let err = spawn(&config).unwrap_err();
        assert!(matches!(err, Error::ProcessSpawn { .. }));
        assert!(err.to_string().contains("katago-host-test-binary"));
    }

    #[tokio::test]
    async fn test_terminate_collects_clean_exit() {
        let child = spawn(&shell("exit 0")).unwrap();
        let status = terminate(child, Duration::from_secs(5)).await.unwrap();
        assert!(status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_sends_sigterm_after_grace() {
        use std::os::unix::process::ExitStatusExt;

        let child = spawn(&shell("exec sleep 30")).unwrap();
        let started = Instant::now();
        let status = terminate(child, Duration::from_millis(100)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(status.signal(), Some(nix::libc::SIGTERM));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_kills_when_sigterm_ignored() {
        use std::os::unix::process::ExitStatusExt;

        let child = spawn(&shell("trap '' TERM; while :; do sleep 0.05; done")).unwrap();
        // Give the shell time to install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        let status = terminate(child, Duration::from_millis(100)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(status.signal(), Some(nix::libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_terminate_kills_after_grace() {
        let child = spawn(&shell("exec sleep 30")).unwrap();
        let started = Instant::now();
        let status = terminate(child, Duration::from_millis(100)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(status.map(|s| !s.success()).unwrap_or(true));
    }
}
