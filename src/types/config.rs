//! Configuration structures.
//!
//! Configuration is built from defaults, an optional JSON file, and
//! environment variable overrides, then validated once at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::errors::{Error, Result};

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "KATAGO_HOST_CONFIG";

/// Global host configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    /// Engine subprocess configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Restart policy.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Admission control.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Content-addressed result cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Engine subprocess configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Executable to spawn. Relative names are resolved through `PATH`.
    pub binary_path: PathBuf,

    /// Neural network model file.
    pub model_path: Option<PathBuf>,

    /// Engine analysis config file.
    pub config_path: Option<PathBuf>,

    /// Search threads passed to the engine.
    pub num_threads: u32,

    /// Visit budget sent with analysis requests that carry no `maxVisits`.
    pub max_visits: u32,

    /// Maximum time the engine spends on one analysis. Queries wait twice this.
    #[serde(with = "humantime_serde")]
    pub max_analysis_time: Duration,

    /// Explicit argument list. When set it replaces the derived analysis arguments.
    pub args: Option<Vec<String>>,

    /// Interval between health probes.
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,

    /// Deadline for a single health probe.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// How long Stop waits for a clean exit before killing the process.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("katago"),
            model_path: None,
            config_path: None,
            num_threads: 4,
            max_visits: 1000,
            max_analysis_time: Duration::from_secs(10),
            args: None,
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Deadline applied to every caller query.
    pub fn query_timeout(&self) -> Duration {
        self.max_analysis_time.saturating_mul(2)
    }

    /// Arguments passed to the engine executable.
    pub fn command_args(&self) -> Vec<String> {
        if let Some(args) = &self.args {
            return args.clone();
        }

        let mut args = vec!["analysis".to_string()];
        if let Some(config_path) = &self.config_path {
            args.push("-config".to_string());
            args.push(config_path.display().to_string());
        }
        if let Some(model_path) = &self.model_path {
            args.push("-model".to_string());
            args.push(model_path.display().to_string());
        }
        args.push("-override-config".to_string());
        args.push(format!("numSearchThreads={}", self.num_threads));
        args
    }
}

/// Exponential restart backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first restart.
    #[serde(with = "humantime_serde")]
    pub initial: Duration,

    /// Upper bound on any delay.
    #[serde(with = "humantime_serde")]
    pub max: Duration,

    /// Growth factor per consecutive failure.
    pub multiplier: f64,

    /// Random spread applied to each delay, as a fraction in `[0, 1]`.
    /// `0.1` spreads a 4s delay over 3.6s..4.4s, still capped at `max`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

/// Supervisor restart policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// How long a freshly spawned engine has to answer its first probe.
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,

    /// Consecutive failed probes that count as an engine failure.
    pub unhealthy_probe_threshold: u32,

    /// Consecutive failures tolerated inside `failure_window` before giving up.
    pub max_consecutive_failures: u32,

    /// Window over which consecutive failures are counted.
    #[serde(with = "humantime_serde")]
    pub failure_window: Duration,

    /// Uninterrupted healthy running time that clears the failure record.
    #[serde(with = "humantime_serde")]
    pub healthy_reset_after: Duration,

    /// Restart delays.
    pub backoff: BackoffConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(60),
            unhealthy_probe_threshold: 2,
            max_consecutive_failures: 5,
            failure_window: Duration::from_secs(600),
            healthy_reset_after: Duration::from_secs(60),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Admission control configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// When false every request is admitted.
    pub enabled: bool,

    /// Sustained global rate (and per-caller rate).
    pub requests_per_minute: u32,

    /// Global bucket capacity (and per-caller capacity).
    pub burst_size: u32,

    /// Operation name → requests per minute.
    pub per_operation_limits: HashMap<String, u32>,

    /// Callers idle longer than this are forgotten.
    #[serde(with = "humantime_serde")]
    pub caller_idle_timeout: Duration,

    /// How often the idle-caller sweep runs.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 60,
            burst_size: 10,
            per_operation_limits: HashMap::new(),
            caller_idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl RateLimitConfig {
    /// Global refill rate in tokens per second.
    pub fn tokens_per_second(&self) -> f64 {
        f64::from(self.requests_per_minute) / 60.0
    }

    /// Bucket capacity for an operation limit, scaled by the global burst ratio
    /// and floored at 1.
    pub fn operation_burst(&self, operation_rpm: u32) -> u32 {
        if self.requests_per_minute == 0 {
            return 1;
        }
        let scaled = u64::from(self.burst_size) * u64::from(operation_rpm)
            / u64::from(self.requests_per_minute);
        u32::try_from(scaled).unwrap_or(u32::MAX).max(1)
    }
}

/// Result cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,

    /// Maximum cached responses (0 = unbounded).
    pub max_items: usize,

    /// Entry lifetime (`None` = no expiry).
    #[serde(with = "humantime_serde")]
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_items: 1000,
            ttl: Some(Duration::from_secs(3600)),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the JSON file (if any), then
    /// environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file. Missing sections take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            Error::configuration(format!("failed to parse config file {}: {}", path.display(), e))
        })
    }

    /// Locate a config file: `KATAGO_HOST_CONFIG`, `./config.json`, then
    /// `~/.katago-host/config.json`.
    pub fn discover_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            return Some(PathBuf::from(path));
        }

        let local = PathBuf::from("config.json");
        if local.is_file() {
            return Some(local);
        }

        let home = std::env::var_os("HOME")?;
        let candidate = PathBuf::from(home).join(".katago-host").join("config.json");
        candidate.is_file().then_some(candidate)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (used by tests).
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let flag = |key: &str| non_empty(key).map(|v| v.eq_ignore_ascii_case("true"));

        if let Some(v) = non_empty("KATAGO_BINARY_PATH") {
            self.engine.binary_path = PathBuf::from(v);
        }
        if let Some(v) = non_empty("KATAGO_MODEL_PATH") {
            self.engine.model_path = Some(PathBuf::from(v));
        }
        if let Some(v) = non_empty("KATAGO_CONFIG_PATH") {
            self.engine.config_path = Some(PathBuf::from(v));
        }
        if let Some(v) = non_empty("KATAGO_HOST_LOG_LEVEL") {
            self.observability.log_level = v;
        }
        if let Some(enabled) = flag("KATAGO_HOST_RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = enabled;
        }
        if let Some(enabled) = flag("KATAGO_HOST_CACHE_ENABLED") {
            self.cache.enabled = enabled;
        }
    }

    /// Reject configurations the host cannot run with.
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        if engine.binary_path.as_os_str().is_empty() {
            return Err(Error::configuration("engine.binary_path is empty"));
        }
        require_existing("engine binary", Some(&engine.binary_path))?;
        require_existing("engine model", engine.model_path.as_deref())?;
        require_existing("engine config", engine.config_path.as_deref())?;

        if engine.num_threads < 1 {
            return Err(Error::configuration("engine.num_threads must be at least 1"));
        }
        if engine.max_visits < 1 {
            return Err(Error::configuration("engine.max_visits must be at least 1"));
        }
        if engine.max_analysis_time < Duration::from_millis(100) {
            return Err(Error::configuration(
                "engine.max_analysis_time must be at least 100ms",
            ));
        }
        if engine.probe_timeout.is_zero() {
            return Err(Error::configuration("engine.probe_timeout must be positive"));
        }

        let supervisor = &self.supervisor;
        if supervisor.max_consecutive_failures < 1 {
            return Err(Error::configuration(
                "supervisor.max_consecutive_failures must be at least 1",
            ));
        }
        if supervisor.unhealthy_probe_threshold < 1 {
            return Err(Error::configuration(
                "supervisor.unhealthy_probe_threshold must be at least 1",
            ));
        }
        if supervisor.backoff.multiplier < 1.0 || !supervisor.backoff.multiplier.is_finite() {
            return Err(Error::configuration(
                "supervisor.backoff.multiplier must be a finite value >= 1",
            ));
        }
        if !(0.0..=1.0).contains(&supervisor.backoff.jitter) {
            return Err(Error::configuration(
                "supervisor.backoff.jitter must be between 0 and 1",
            ));
        }
        if supervisor.backoff.initial > supervisor.backoff.max {
            return Err(Error::configuration(
                "supervisor.backoff.initial must not exceed supervisor.backoff.max",
            ));
        }

        let limits = &self.rate_limit;
        if limits.enabled {
            if limits.requests_per_minute < 1 {
                return Err(Error::configuration(
                    "rate_limit.requests_per_minute must be at least 1",
                ));
            }
            if limits.burst_size < 1 {
                return Err(Error::configuration("rate_limit.burst_size must be at least 1"));
            }
            if let Some((op, _)) = limits.per_operation_limits.iter().find(|(_, rpm)| **rpm < 1) {
                return Err(Error::configuration(format!(
                    "rate_limit.per_operation_limits.{} must be at least 1",
                    op
                )));
            }
        }

        Ok(())
    }
}

/// Absolute paths are checked up front; relative ones are resolved at spawn time.
fn require_existing(what: &str, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) if path.is_absolute() && !path.exists() => Err(Error::configuration(format!(
            "{} not found at {}",
            what,
            path.display()
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.query_timeout(), Duration::from_secs(20));
        assert_eq!(config.rate_limit.burst_size, 10);
    }

    #[test]
    fn test_derived_command_args() {
        let engine = EngineConfig {
            model_path: Some(PathBuf::from("/models/b18.bin.gz")),
            config_path: Some(PathBuf::from("/etc/katago/analysis.cfg")),
            num_threads: 8,
            ..Default::default()
        };
        assert_eq!(
            engine.command_args(),
            vec![
                "analysis",
                "-config",
                "/etc/katago/analysis.cfg",
                "-model",
                "/models/b18.bin.gz",
                "-override-config",
                "numSearchThreads=8",
            ]
        );
    }

    #[test]
    fn test_explicit_args_replace_derived() {
        let engine = EngineConfig {
            args: Some(vec!["-c".to_string(), "cat".to_string()]),
            model_path: Some(PathBuf::from("/models/ignored")),
            ..Default::default()
        };
        assert_eq!(engine.command_args(), vec!["-c", "cat"]);
    }

    #[test]
    fn test_operation_burst_scales_and_floors() {
        let limits = RateLimitConfig {
            requests_per_minute: 60,
            burst_size: 10,
            ..Default::default()
        };
        assert_eq!(limits.operation_burst(30), 5);
        assert_eq!(limits.operation_burst(3), 1);
        assert_eq!(limits.operation_burst(120), 20);
    }

    #[test]
    fn test_load_from_file_with_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "engine": {{ "num_threads": 2, "max_analysis_time": "3s" }},
                "rate_limit": {{ "requests_per_minute": 120, "per_operation_limits": {{ "reviewGame": 6 }} }},
                "cache": {{ "ttl": "10m" }}
            }}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.engine.num_threads, 2);
        assert_eq!(config.engine.max_analysis_time, Duration::from_secs(3));
        assert_eq!(config.engine.binary_path, PathBuf::from("katago"));
        assert_eq!(config.rate_limit.requests_per_minute, 120);
        assert_eq!(config.rate_limit.burst_size, 10);
        assert_eq!(config.rate_limit.per_operation_limits.get("reviewGame"), Some(&6));
        assert_eq!(config.cache.ttl, Some(Duration::from_secs(600)));
        assert_eq!(config.supervisor, SupervisorConfig::default());
    }

    #[test]
    fn test_unparseable_file_is_configuration_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = Config::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        let env: HashMap<&str, &str> = [
            ("KATAGO_BINARY_PATH", "/usr/local/bin/katago"),
            ("KATAGO_MODEL_PATH", "/models/net.bin.gz"),
            ("KATAGO_HOST_LOG_LEVEL", "debug"),
            ("KATAGO_HOST_RATE_LIMIT_ENABLED", "FALSE"),
            ("KATAGO_HOST_CACHE_ENABLED", "true"),
            ("KATAGO_CONFIG_PATH", ""),
        ]
        .into_iter()
        .collect();

        config.apply_overrides_from(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.engine.binary_path, PathBuf::from("/usr/local/bin/katago"));
        assert_eq!(config.engine.model_path, Some(PathBuf::from("/models/net.bin.gz")));
        assert_eq!(config.engine.config_path, None);
        assert_eq!(config.observability.log_level, "debug");
        assert!(!config.rate_limit.enabled);
        assert!(config.cache.enabled);
    }

    #[test]
    fn test_missing_absolute_binary_rejected() {
        let mut config = Config::default();
        config.engine.binary_path = PathBuf::from("/definitely/not/here/katago");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("engine binary not found"));
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let mut config = Config::default();
        config.rate_limit.burst_size = 0;
        assert!(config.validate().is_err());

        // Limits are not checked when rate limiting is off.
        config.rate_limit.enabled = false;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config
            .rate_limit
            .per_operation_limits
            .insert("analyzePosition".to_string(), 0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("analyzePosition"));

        let mut config = Config::default();
        config.engine.max_analysis_time = Duration::from_millis(10);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.supervisor.max_consecutive_failures = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.supervisor.backoff.jitter = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("jitter"));
        config.supervisor.backoff.jitter = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
