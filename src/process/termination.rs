//! Teardown of a spawned subject: graceful shutdown, escalation, artifact
//! capture and verdicts.
//!
//! Escalation order: `shutdown-server` request, `SIGTERM` (after a stack
//! dump), `SIGKILL`. Each step waits for exit before the next one fires.
//! Artifact capture runs on every path, including an unkillable subject.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::signals::{LifecycleState, ProcessSignal, ProcessSignaller};
use crate::config::HarnessConfig;
use crate::profiling::{ProfileArtifacts, ProfileCollaborator};
use crate::protocol::Session;
use crate::provision::InstanceDir;
use crate::report::ResultRecord;

/// Aggregate file collecting config and output logs.
pub const AGGREGATE_TEST_LOG: &str = "watchman-test.log";
/// Aggregate file collecting memcheck XML reports.
pub const AGGREGATE_VALGRIND_XML: &str = "watchman-valgrind.xml";
/// Aggregate file collecting memcheck text logs.
pub const AGGREGATE_VALGRIND_LOG: &str = "watchman-valgrind.log";
/// Aggregate file collecting callgrind profiles.
pub const AGGREGATE_CALLGRIND: &str = "watchman-callgrind.txt";

/// Name of the health verdict every teardown reports.
pub const HEALTH_CHECK: &str = "instance health";

/// Poll `child` until it exits or `timeout` passes.
pub async fn wait_for_exit(
    child: &mut Child,
    timeout: Duration,
    poll_interval: Duration,
) -> Option<ExitStatus> {
    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(err) => {
                warn!(%err, "failed to poll subject process status");
                return None;
            }
        }
        if started.elapsed() >= timeout {
            return None;
        }
        sleep(poll_interval).await;
    }
}

/// Append `source` to `target` behind a `=== label from source ===` header.
///
/// Returns `false` without touching `target` when `source` does not exist.
///
/// # Errors
///
/// Returns the underlying I/O error if either file cannot be accessed.
pub fn append_log_file(target: &Path, source: &Path, label: &str) -> io::Result<bool> {
    let contents = match fs::read(source) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    let mut dest = OpenOptions::new().create(true).append(true).open(target)?;
    writeln!(
        dest,
        "\n=== {label} from {} ({}) ===",
        source.display(),
        Utc::now().to_rfc3339()
    )?;
    dest.write_all(&contents)?;
    writeln!(dest)?;
    Ok(true)
}

/// Everything one teardown touches.
pub struct Teardown<'a> {
    /// The subject process.
    pub child: &'a mut Child,
    /// Signal handle for the subject.
    pub signaller: &'a ProcessSignaller,
    /// Open channel, if the connection ever succeeded.
    pub session: Option<&'a mut Session>,
    /// Harness configuration.
    pub config: &'a HarnessConfig,
    /// Instance directory holding the logs.
    pub dir: &'a InstanceDir,
    /// Paths the profiling wrapper writes to.
    pub profile: &'a ProfileArtifacts,
    /// Consumer of the profiling output.
    pub collaborator: &'a dyn ProfileCollaborator,
}

/// Result of a teardown.
#[derive(Debug, Clone)]
pub struct TeardownOutcome {
    /// Exit status, when the subject exited.
    pub status: Option<ExitStatus>,
    /// Verdicts for this instance.
    pub records: Vec<ResultRecord>,
    /// Whether the subject survived `SIGKILL`.
    pub unkillable: bool,
}

impl Teardown<'_> {
    /// Run the full sequence.
    pub async fn run(self) -> TeardownOutcome {
        let pid = self.signaller.pid();
        let span = info_span!("terminate", pid);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> TeardownOutcome {
        let Self {
            child,
            signaller,
            session,
            config,
            dir,
            profile,
            collaborator,
        } = self;
        let pid = signaller.pid();
        let timeout = config.lifecycle_timeout();
        let poll = config.poll_interval();

        let exited_early = match child.try_wait() {
            Ok(status) => status,
            Err(err) => {
                warn!(%err, "failed to poll subject process status");
                None
            }
        };
        let answered = session.is_some();

        if exited_early.is_none() && signaller.lifecycle() == LifecycleState::Suspended {
            if let Err(err) = signaller.resume().await {
                warn!(%err, "failed to resume before teardown");
            }
        }
        signaller.set_lifecycle(LifecycleState::Terminated);

        let mut status = exited_early;
        if status.is_none() {
            if let Some(session) = session {
                match session.request(&["shutdown-server"]).await {
                    Ok(reply) => debug!(?reply, "shutdown-server sent"),
                    Err(err) => warn!(%err, "shutdown-server request failed"),
                }
                session.close().await;
            }
            status = wait_for_exit(child, timeout, poll).await;
        }

        if status.is_none() {
            warn!(
                timeout_ms = timeout.as_millis(),
                "subject did not stop after shutdown-server, sending SIGTERM"
            );
            dump_stack(pid).await;
            if let Err(err) = signaller.send(ProcessSignal::Terminate) {
                warn!(%err, "failed to send SIGTERM");
            }
            status = wait_for_exit(child, timeout, poll).await;
        }

        if status.is_none() {
            warn!("subject ignored SIGTERM, sending SIGKILL");
            if let Err(err) = child.start_kill() {
                warn!(%err, "failed to send SIGKILL");
            }
            status = wait_for_exit(child, config.final_kill_timeout(), poll).await;
        }

        let unkillable = status.is_none();
        if unkillable {
            error!("subject survived SIGKILL");
        } else {
            info!(?status, "subject exited");
        }

        capture_artifacts(config, dir, profile);

        let mut records = vec![health_verdict(exited_early, answered, unkillable)];
        if !profile.is_empty() {
            records.extend(collaborator.analyze(profile));
        }

        TeardownOutcome {
            status,
            records,
            unkillable,
        }
    }
}

fn health_verdict(
    exited_early: Option<ExitStatus>,
    answered: bool,
    unkillable: bool,
) -> ResultRecord {
    if let Some(status) = exited_early {
        return ResultRecord::fail(
            HEALTH_CHECK,
            format!("subject exited before teardown: {status}"),
        );
    }
    if !answered {
        return ResultRecord::fail(HEALTH_CHECK, "subject never answered on its channel");
    }
    if unkillable {
        return ResultRecord::fail(HEALTH_CHECK, "subject survived SIGKILL");
    }
    ResultRecord::pass(HEALTH_CHECK)
}

/// Log a stack dump of `pid` when `gstack` is available.
async fn dump_stack(pid: u32) {
    match Command::new("gstack").arg(pid.to_string()).output().await {
        Ok(output) => {
            info!(
                stack = %String::from_utf8_lossy(&output.stdout),
                "stack dump before SIGTERM"
            );
        }
        Err(err) => debug!(%err, "gstack unavailable"),
    }
}

/// Append instance files to the aggregate logs.
///
/// Failures are logged and never abort the capture of remaining files.
pub fn capture_artifacts(config: &HarnessConfig, dir: &InstanceDir, profile: &ProfileArtifacts) {
    let aggregate = config.aggregate_log_dir();

    if config.debug {
        match fs::read(dir.server_log()) {
            Ok(contents) => {
                if let Err(err) = io::stderr().write_all(&contents) {
                    debug!(%err, "failed to echo subject log");
                }
            }
            Err(err) => debug!(%err, "no subject log to echo"),
        }
    }

    let mut copies: Vec<(&str, PathBuf, &str)> = vec![
        ("config", dir.config_file(), AGGREGATE_TEST_LOG),
        ("output", dir.output_log(), AGGREGATE_TEST_LOG),
    ];
    if let Some(xml) = &profile.memcheck_xml {
        copies.push(("valgrind", xml.clone(), AGGREGATE_VALGRIND_XML));
    }
    if let Some(log) = &profile.memcheck_log {
        copies.push(("valgrind", log.clone(), AGGREGATE_VALGRIND_LOG));
    }
    if let Some(out) = &profile.callgrind_out {
        copies.push(("callgrind", out.clone(), AGGREGATE_CALLGRIND));
    }

    for (label, source, target) in copies {
        let target = aggregate.join(target);
        match append_log_file(&target, &source, label) {
            Ok(true) => {
                debug!(source = %source.display(), target = %target.display(), "artifact captured");
            }
            Ok(false) => debug!(source = %source.display(), "artifact absent"),
            Err(err) => warn!(source = %source.display(), %err, "failed to capture artifact"),
        }
    }
}
