//! Subject process launcher.
//!
//! Builds the command line from [`HarnessConfig`] and an [`InstanceDir`],
//! optionally wrapped in a profiler, and spawns it with:
//! - stdin closed and stdout/stderr appended to the instance output log;
//! - the provisioner's environment variables;
//! - its own process group (Unix) and `kill_on_drop(true)` so a leaked
//!   handle never leaves the subject running.

use std::env;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{info, info_span};

use crate::config::HarnessConfig;
use crate::profiling::ProfileArtifacts;
use crate::provision::InstanceDir;
use crate::{AppError, Result};

/// Locate the subject executable.
///
/// Order: `<repo_root>/<binary_name>` when that file exists, then the value
/// of `config.binary_env_var`, then the bare name for `PATH` lookup.
#[must_use]
pub fn resolve_binary(config: &HarnessConfig) -> PathBuf {
    if let Some(root) = &config.repo_root {
        let candidate = root.join(&config.binary_name);
        if candidate.is_file() {
            return candidate;
        }
    }
    if let Some(path) = env::var_os(&config.binary_env_var).filter(|v| !v.is_empty()) {
        return PathBuf::from(path);
    }
    PathBuf::from(&config.binary_name)
}

/// Everything needed to spawn one subject process.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    /// Full argument vector; `argv[0]` is the program.
    pub argv: Vec<OsString>,
    /// Variables added to the inherited environment.
    pub env: Vec<(&'static str, OsString)>,
    /// Working directory, when a repository root is configured.
    pub current_dir: Option<PathBuf>,
    /// File receiving stdout and stderr.
    pub output_log: PathBuf,
    /// Where the profiling wrapper will write its reports.
    pub profile: ProfileArtifacts,
}

impl LaunchPlan {
    /// Assemble the command line for `config` inside `dir`.
    #[must_use]
    pub fn new(config: &HarnessConfig, dir: &InstanceDir) -> Self {
        let profile = ProfileArtifacts::for_mode(config.profiling, dir.path());

        let mut argv: Vec<OsString> = profile
            .wrapper_args(&config.valgrind_binary)
            .into_iter()
            .map(OsString::from)
            .collect();
        argv.push(resolve_binary(config).into_os_string());
        argv.push("--foreground".into());
        argv.push(flag("--sockname=", dir.socket().as_os_str()));
        argv.push(flag("--logfile=", dir.server_log().as_os_str()));
        argv.push(flag("--statefile=", dir.state_file().as_os_str()));
        argv.push(format!("--log-level={}", config.log_level).into());
        argv.push(flag("--pidfile=", dir.pid_file().as_os_str()));

        Self {
            argv,
            env: dir.environment(),
            current_dir: config.repo_root.clone(),
            output_log: dir.output_log(),
            profile,
        }
    }

    /// Human-readable command line, used in logs and spawn errors.
    #[must_use]
    pub fn command_line(&self) -> String {
        self.argv
            .iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Spawn the planned process.
    ///
    /// # Errors
    ///
    /// - `AppError::Io`: the output log cannot be opened.
    /// - `AppError::Spawn`: the executable cannot be found or executed;
    ///   carries [`LaunchPlan::command_line`].
    pub fn spawn(&self) -> Result<Child> {
        let span = info_span!("launch", command = %self.command_line());
        let _guard = span.enter();

        let Some((program, args)) = self.argv.split_first() else {
            return Err(AppError::Spawn {
                command: String::new(),
                reason: "empty command line".into(),
            });
        };

        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_log)
            .map_err(|err| {
                AppError::Io(format!(
                    "failed to open {}: {err}",
                    self.output_log.display()
                ))
            })?;
        let stderr = stdout.try_clone().map_err(|err| {
            AppError::Io(format!(
                "failed to share {}: {err}",
                self.output_log.display()
            ))
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(self.env.iter().map(|(k, v)| (*k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|err| AppError::Spawn {
            command: self.command_line(),
            reason: err.to_string(),
        })?;

        info!(pid = child.id(), "subject process spawned");
        Ok(child)
    }
}

fn flag(prefix: &str, value: &std::ffi::OsStr) -> OsString {
    let mut out = OsString::from(prefix);
    out.push(value);
    out
}
