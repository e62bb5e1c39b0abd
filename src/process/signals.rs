//! Signal delivery and confirmed suspend/resume.
//!
//! A signal alone proves nothing: the subject may have died, or the kernel
//! may not have applied the stop yet. Every suspend and resume is therefore
//! confirmed by polling the process state through `ps`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::process::Command;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::{AppError, Result};

/// Scheduler state reported by `ps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Any live state other than stopped.
    Running,
    /// Stopped by a job-control signal.
    Stopped,
    /// No such process, or a zombie awaiting reaping.
    Gone,
}

impl ProcState {
    /// Interpret one `ps -o state=` output.
    #[must_use]
    pub fn parse(output: &str) -> Self {
        let state = output.trim();
        if state.is_empty() || state.starts_with('Z') || state.starts_with('X') {
            Self::Gone
        } else if state.contains('T') {
            Self::Stopped
        } else {
            Self::Running
        }
    }
}

/// Lifecycle as tracked by the harness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LifecycleState {
    /// Started and not suspended.
    #[default]
    Running,
    /// Suspended with a confirmed stop.
    Suspended,
    /// Torn down; no further signals are sent.
    Terminated,
}

/// Signals the harness sends to a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// `SIGSTOP`.
    Stop,
    /// `SIGCONT`.
    Continue,
    /// `SIGTERM`.
    Terminate,
    /// `SIGKILL`.
    Kill,
}

/// Cloneable handle that suspends and resumes one subject process.
///
/// Clones share lifecycle state, so a test can suspend from one task while
/// a request is blocked on the instance in another.
#[derive(Debug, Clone)]
pub struct ProcessSignaller {
    pid: u32,
    timeout: Duration,
    poll_interval: Duration,
    lifecycle: Arc<Mutex<LifecycleState>>,
}

impl ProcessSignaller {
    /// Signaller for `pid`, confirming transitions within `timeout`.
    #[must_use]
    pub fn new(pid: u32, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            pid,
            timeout,
            poll_interval,
            lifecycle: Arc::new(Mutex::new(LifecycleState::Running)),
        }
    }

    /// Subject PID.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> LifecycleState {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_lifecycle(&self, state: LifecycleState) {
        *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Stop the subject and wait until `ps` reports it stopped.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotRunning`]: the process is gone or was terminated.
    /// - [`AppError::DidNotTransition`]: no stop observed in time.
    /// - [`AppError::Unsupported`]: not available on this platform.
    pub async fn suspend(&self) -> Result<()> {
        self.ensure_signalable().await?;
        self.send(ProcessSignal::Stop)?;
        self.confirm(ProcState::Stopped).await?;
        self.set_lifecycle(LifecycleState::Suspended);
        info!(pid = self.pid, "subject suspended");
        Ok(())
    }

    /// Continue the subject and wait until `ps` no longer reports it stopped.
    ///
    /// # Errors
    ///
    /// Same as [`ProcessSignaller::suspend`].
    pub async fn resume(&self) -> Result<()> {
        self.ensure_signalable().await?;
        self.send(ProcessSignal::Continue)?;
        self.confirm(ProcState::Running).await?;
        self.set_lifecycle(LifecycleState::Running);
        info!(pid = self.pid, "subject resumed");
        Ok(())
    }

    /// Deliver `signal` to the subject PID.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotRunning`] when no such process exists and
    /// [`AppError::Unsupported`] off Unix.
    #[cfg(unix)]
    pub fn send(&self, signal: ProcessSignal) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let sig = match signal {
            ProcessSignal::Stop => Signal::SIGSTOP,
            ProcessSignal::Continue => Signal::SIGCONT,
            ProcessSignal::Terminate => Signal::SIGTERM,
            ProcessSignal::Kill => Signal::SIGKILL,
        };
        let pid = i32::try_from(self.pid)
            .map_err(|_| AppError::NotRunning(format!("pid {} out of range", self.pid)))?;
        debug!(pid, signal = %sig, "sending signal");
        match kill(Pid::from_raw(pid), sig) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(AppError::NotRunning(format!(
                "process {pid} does not exist"
            ))),
            Err(err) => Err(AppError::Io(format!("failed to send {sig} to {pid}: {err}"))),
        }
    }

    /// Deliver `signal` to the subject PID.
    ///
    /// # Errors
    ///
    /// Always [`AppError::Unsupported`] on this platform.
    #[cfg(not(unix))]
    pub fn send(&self, signal: ProcessSignal) -> Result<()> {
        Err(AppError::Unsupported(format!(
            "cannot deliver {signal:?} to process {} on this platform",
            self.pid
        )))
    }

    /// Query the scheduler state of the subject.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if `ps` cannot be run and
    /// [`AppError::Unsupported`] off Unix.
    pub async fn probe(&self) -> Result<ProcState> {
        if cfg!(not(unix)) {
            return Err(AppError::Unsupported(
                "process state probing requires ps".into(),
            ));
        }
        let column = if cfg!(any(target_os = "solaris", target_os = "illumos")) {
            "s="
        } else {
            "state="
        };
        let output = Command::new("ps")
            .args(["-o", column, "-p", &self.pid.to_string()])
            .output()
            .await
            .map_err(|err| AppError::Io(format!("failed to run ps: {err}")))?;
        let text = String::from_utf8_lossy(&output.stdout);
        // Only the last line carries state on platforms that ignore `=`.
        let last = text.lines().last().unwrap_or_default();
        Ok(ProcState::parse(last))
    }

    async fn ensure_signalable(&self) -> Result<()> {
        if self.lifecycle() == LifecycleState::Terminated {
            return Err(AppError::NotRunning(format!(
                "process {} has been terminated",
                self.pid
            )));
        }
        if self.probe().await? == ProcState::Gone {
            return Err(AppError::NotRunning(format!(
                "process {} has exited",
                self.pid
            )));
        }
        Ok(())
    }

    async fn confirm(&self, target: ProcState) -> Result<()> {
        let started = Instant::now();
        loop {
            match self.probe().await? {
                ProcState::Gone => {
                    return Err(AppError::NotRunning(format!(
                        "process {} exited while waiting for {target:?}",
                        self.pid
                    )));
                }
                state if state == target => return Ok(()),
                _ => {}
            }
            if started.elapsed() >= self.timeout {
                warn!(pid = self.pid, ?target, "state transition not observed");
                return Err(AppError::DidNotTransition(format!(
                    "process {} did not reach {target:?} within {:.1} seconds",
                    self.pid,
                    self.timeout.as_secs_f64()
                )));
            }
            sleep(self.poll_interval).await;
        }
    }
}
