//! Ephemeral per-instance directory and subject environment.
//!
//! Layout inside the temporary directory:
//!
//! | Path          | Purpose                                        |
//! |---------------|------------------------------------------------|
//! | `config.json` | server configuration (`WATCHMAN_CONFIG_FILE`)  |
//! | `log`         | redirected stdout and stderr                   |
//! | `log.log`     | subject's own `--logfile`                      |
//! | `log.state`   | `--statefile`                                  |
//! | `log.pid`     | `--pidfile`                                    |
//! | `sock`        | control socket (Unix only)                     |

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::profiling::with_suffix;
use crate::{AppError, Result};

/// Variable pointing the subject at its configuration file.
pub const CONFIG_FILE_ENV: &str = "WATCHMAN_CONFIG_FILE";
/// Variable defined with an empty value for the subject's config layer.
pub const EMPTY_ENV_VAR: &str = "WATCHMAN_EMPTY_ENV_VAR";

/// Temporary directory owning every file of one instance.
#[derive(Debug)]
pub struct InstanceDir {
    dir: TempDir,
    socket: PathBuf,
}

impl InstanceDir {
    /// Create the directory and write `server_config` as `config.json`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory or file cannot be created and
    /// `AppError::Config` if the configuration cannot be encoded.
    pub fn create(server_config: &serde_json::Value) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("inst")
            .tempdir()
            .map_err(|err| AppError::Io(format!("failed to create instance dir: {err}")))?;

        let encoded = serde_json::to_string(server_config)
            .map_err(|err| AppError::Config(format!("failed to encode server config: {err}")))?;
        let config_path = dir.path().join("config.json");
        fs::write(&config_path, encoded).map_err(|err| {
            AppError::Io(format!(
                "failed to write {}: {err}",
                config_path.display()
            ))
        })?;

        let socket = socket_path(dir.path());
        Ok(Self { dir, socket })
    }

    /// Root of the instance directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// JSON configuration file handed to the subject.
    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.dir.path().join("config.json")
    }

    /// File receiving the subject's redirected stdout and stderr.
    #[must_use]
    pub fn output_log(&self) -> PathBuf {
        self.dir.path().join("log")
    }

    /// The subject's own log file (`--logfile`).
    #[must_use]
    pub fn server_log(&self) -> PathBuf {
        with_suffix(&self.output_log(), ".log")
    }

    /// `--statefile` path.
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        with_suffix(&self.output_log(), ".state")
    }

    /// `--pidfile` path.
    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        with_suffix(&self.output_log(), ".pid")
    }

    /// Control channel path: a socket file or a named pipe.
    #[must_use]
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Environment variables set on the subject process.
    #[must_use]
    pub fn environment(&self) -> Vec<(&'static str, OsString)> {
        vec![
            (CONFIG_FILE_ENV, self.config_file().into_os_string()),
            (EMPTY_ENV_VAR, OsString::new()),
        ]
    }
}

#[cfg(windows)]
fn socket_path(_dir: &Path) -> PathBuf {
    PathBuf::from(format!(
        r"\\.\pipe\watchman-test-{}",
        uuid::Uuid::new_v4().simple()
    ))
}

#[cfg(not(windows))]
fn socket_path(dir: &Path) -> PathBuf {
    dir.join("sock")
}
