//! Harness configuration parsing, validation, and environment overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::profiling::ProfilingMode;
use crate::{AppError, Result};

/// Environment variable that switches every instance to memcheck mode.
pub const VALGRIND_ENV: &str = "WATCHMAN_VALGRIND";
/// Environment variable that enables the attach-a-debugger pause.
pub const DEBUG_WAIT_ENV: &str = "WATCHMAN_DEBUG_WAIT";
/// Environment variable naming a socket owned by another harness.
pub const EXTERNAL_SOCK_ENV: &str = "WATCHMAN_SOCK";

/// Per-operation deadlines and polling cadence, in milliseconds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Deadline for the control channel to accept a connection.
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    /// Read/write deadline applied to every channel operation.
    #[serde(default = "default_io_ms")]
    pub io_ms: u64,
    /// Interval between polls in the connect, confirm and exit loops.
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
    /// Exit wait after each termination step, and suspend/resume confirmation.
    #[serde(default = "default_terminate_ms")]
    pub terminate_ms: u64,
    /// Replaces `terminate_ms` when running under memcheck.
    #[serde(default = "default_instrumented_terminate_ms")]
    pub instrumented_terminate_ms: u64,
    /// Final wait after the forceful kill signal.
    #[serde(default = "default_final_kill_ms")]
    pub final_kill_ms: u64,
}

fn default_connect_ms() -> u64 {
    5_000
}

fn default_io_ms() -> u64 {
    20_000
}

fn default_poll_ms() -> u64 {
    30
}

fn default_terminate_ms() -> u64 {
    5_000
}

fn default_instrumented_terminate_ms() -> u64 {
    20_000
}

fn default_final_kill_ms() -> u64 {
    5_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            io_ms: default_io_ms(),
            poll_ms: default_poll_ms(),
            terminate_ms: default_terminate_ms(),
            instrumented_terminate_ms: default_instrumented_terminate_ms(),
            final_kill_ms: default_final_kill_ms(),
        }
    }
}

fn default_binary_name() -> String {
    "watchman".into()
}

fn default_binary_env_var() -> String {
    "WATCHMAN_BINARY".into()
}

fn default_log_level() -> u8 {
    2
}

fn default_valgrind_binary() -> String {
    "valgrind".into()
}

fn default_server_config() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Configuration for one managed instance, usually parsed from `harness.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct HarnessConfig {
    /// Executable name of the subject server.
    #[serde(default = "default_binary_name")]
    pub binary_name: String,
    /// Repository root; `<repo_root>/<binary_name>` is tried first and the
    /// subject runs with this as its working directory.
    #[serde(default)]
    pub repo_root: Option<PathBuf>,
    /// Environment variable consulted when the repository binary is absent.
    #[serde(default = "default_binary_env_var")]
    pub binary_env_var: String,
    /// Value for the subject's `--log-level` flag.
    #[serde(default = "default_log_level")]
    pub log_level: u8,
    /// Profiling wrapper applied at launch.
    #[serde(default)]
    pub profiling: ProfilingMode,
    /// Wrapper executable used for memcheck and callgrind.
    #[serde(default = "default_valgrind_binary")]
    pub valgrind_binary: String,
    /// Echo requests and dump the subject log at teardown.
    #[serde(default)]
    pub debug: bool,
    /// Pause forever after connecting so a debugger can attach.
    #[serde(default)]
    pub debug_wait: bool,
    /// Directory receiving the aggregate logs; defaults to the temp dir.
    #[serde(default)]
    pub aggregate_log_dir: Option<PathBuf>,
    /// Socket of an instance owned by another harness.
    #[serde(default)]
    pub external_socket: Option<PathBuf>,
    /// JSON configuration written for the subject process.
    #[serde(default = "default_server_config")]
    pub server_config: serde_json::Value,
    /// Deadlines and polling cadence.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            binary_name: default_binary_name(),
            repo_root: None,
            binary_env_var: default_binary_env_var(),
            log_level: default_log_level(),
            profiling: ProfilingMode::default(),
            valgrind_binary: default_valgrind_binary(),
            debug: false,
            debug_wait: false,
            aggregate_log_dir: None,
            external_socket: None,
            server_config: default_server_config(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        if self.binary_name.trim().is_empty() {
            return Err(AppError::Config("binary_name must not be empty".into()));
        }
        if self.binary_env_var.trim().is_empty() {
            return Err(AppError::Config("binary_env_var must not be empty".into()));
        }
        if !self.server_config.is_object() {
            return Err(AppError::Config(
                "server_config must be a JSON object".into(),
            ));
        }
        let t = &self.timeouts;
        if t.poll_ms == 0 {
            return Err(AppError::Config("timeouts.poll_ms must be positive".into()));
        }
        if t.connect_ms < t.poll_ms || t.io_ms == 0 || t.terminate_ms == 0 {
            return Err(AppError::Config(
                "timeouts must be positive and connect_ms must cover at least one poll".into(),
            ));
        }
        Ok(())
    }

    /// Fold the harness environment variables into this configuration.
    ///
    /// `WATCHMAN_VALGRIND` forces memcheck, `WATCHMAN_DEBUG_WAIT` enables
    /// the debugger pause and `WATCHMAN_SOCK` selects an external instance.
    #[must_use]
    pub fn apply_env(mut self) -> Self {
        if env_flag(VALGRIND_ENV) {
            if self.profiling == ProfilingMode::Callgrind {
                warn!("{VALGRIND_ENV} is set; memcheck replaces callgrind");
            }
            self.profiling = ProfilingMode::Memcheck;
        }
        if env_flag(DEBUG_WAIT_ENV) {
            self.debug_wait = true;
        }
        if let Some(sock) = env::var_os(EXTERNAL_SOCK_ENV).filter(|v| !v.is_empty()) {
            self.external_socket = Some(PathBuf::from(sock));
        }
        self
    }

    /// Directory that accumulates logs across instances.
    #[must_use]
    pub fn aggregate_log_dir(&self) -> PathBuf {
        self.aggregate_log_dir
            .clone()
            .unwrap_or_else(env::temp_dir)
    }

    /// Connect deadline.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect_ms)
    }

    /// Channel I/O deadline.
    #[must_use]
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.io_ms)
    }

    /// Poll interval shared by every polling loop.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.timeouts.poll_ms)
    }

    /// Exit and state-confirmation deadline; longer under memcheck.
    #[must_use]
    pub fn lifecycle_timeout(&self) -> Duration {
        if self.profiling == ProfilingMode::Memcheck {
            Duration::from_millis(self.timeouts.instrumented_terminate_ms)
        } else {
            Duration::from_millis(self.timeouts.terminate_ms)
        }
    }

    /// Final wait after SIGKILL.
    #[must_use]
    pub fn final_kill_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.final_kill_ms)
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key).is_ok_and(|v| !v.is_empty() && v != "0")
}
