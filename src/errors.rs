//! Error types shared across the harness.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

/// Shared harness result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Harness error enumeration covering every failure mode of an instance.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// The subject binary could not be found or executed.
    Spawn {
        /// The full command line that was attempted.
        command: String,
        /// Underlying OS error text.
        reason: String,
    },
    /// The control channel never became reachable.
    ConnectTimeout {
        /// Socket or pipe path that was polled.
        path: PathBuf,
        /// How long the connector waited before giving up.
        elapsed: Duration,
    },
    /// A frame violated the classification contract.
    Protocol(String),
    /// A request could not be written in full.
    Write {
        /// Bytes flushed before the failure.
        written: usize,
        /// Size of the encoded request.
        total: usize,
        /// Underlying I/O error text.
        reason: String,
    },
    /// A channel read exceeded the per-operation deadline.
    Timeout(String),
    /// The subject process has already exited.
    NotRunning(String),
    /// A suspend or resume was not confirmed before the deadline.
    DidNotTransition(String),
    /// The subject survived every termination escalation.
    Unkillable(String),
    /// The operation is not available on this platform or instance kind.
    Unsupported(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Spawn { command, reason } => {
                write!(f, "spawn: failed to spawn `{command}`: {reason}")
            }
            Self::ConnectTimeout { path, elapsed } => write!(
                f,
                "connect timeout: failed to talk to the instance within {:.1} seconds on {}",
                elapsed.as_secs_f64(),
                path.display()
            ),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Write {
                written,
                total,
                reason,
            } => write!(f, "write: wrote {written}/{total}. {reason}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::NotRunning(msg) => write!(f, "not running: {msg}"),
            Self::DidNotTransition(msg) => write!(f, "did not transition: {msg}"),
            Self::Unkillable(msg) => write!(f, "unkillable: {msg}"),
            Self::Unsupported(msg) => write!(f, "unsupported: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("malformed json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
