//! Instance whose subject process this harness launches and owns.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::process::Child;
use tracing::{error, info, warn};

use super::{BoxFuture, InstanceKind, ManagedInstance};
use crate::config::HarnessConfig;
use crate::process::{connect, ConnectOptions, LaunchPlan, ProcessSignaller, Teardown};
use crate::profiling::{ProfileArtifacts, ProfileCollaborator};
use crate::protocol::Session;
use crate::provision::InstanceDir;
use crate::report::ResultRecord;
use crate::{AppError, Result};

/// A subject launched from [`HarnessConfig`], started lazily.
pub struct SpawnedInstance {
    config: HarnessConfig,
    collaborator: Arc<dyn ProfileCollaborator>,
    dir: InstanceDir,
    plan: LaunchPlan,
    child: Option<Child>,
    signaller: Option<ProcessSignaller>,
    session: Option<Session>,
    results: Vec<ResultRecord>,
    terminated: bool,
}

impl std::fmt::Debug for SpawnedInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedInstance")
            .field("dir", &self.dir.path())
            .field("pid", &self.signaller.as_ref().map(ProcessSignaller::pid))
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

impl SpawnedInstance {
    /// Provision the instance directory; nothing is launched yet.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` or `AppError::Config` from provisioning.
    pub fn new(config: HarnessConfig, collaborator: Arc<dyn ProfileCollaborator>) -> Result<Self> {
        let dir = InstanceDir::create(&config.server_config)?;
        let plan = LaunchPlan::new(&config, &dir);
        Ok(Self {
            config,
            collaborator,
            dir,
            plan,
            child: None,
            signaller: None,
            session: None,
            results: Vec::new(),
            terminated: false,
        })
    }

    /// The provisioned directory.
    #[must_use]
    pub fn dir(&self) -> &InstanceDir {
        &self.dir
    }

    /// The planned command line.
    #[must_use]
    pub fn plan(&self) -> &LaunchPlan {
        &self.plan
    }

    async fn launch_and_connect(&mut self) -> Result<()> {
        if self.terminated {
            return Err(AppError::NotRunning("instance has been terminated".into()));
        }
        if self.session.is_some() {
            return Ok(());
        }

        if self.child.is_none() {
            let child = self.plan.spawn()?;
            let pid = child.id().ok_or_else(|| AppError::Spawn {
                command: self.plan.command_line(),
                reason: "process exited before its pid was read".into(),
            })?;
            self.signaller = Some(ProcessSignaller::new(
                pid,
                self.config.lifecycle_timeout(),
                self.config.poll_interval(),
            ));
            self.child = Some(child);
        }

        let options = ConnectOptions::from_config(&self.config);
        match connect(self.dir.socket(), &options).await {
            Ok(session) => self.session = Some(session),
            Err(err) => {
                warn!(%err, "subject never became reachable, tearing down");
                if let Err(teardown_err) = self.teardown().await {
                    warn!(%teardown_err, "teardown after failed start reported an error");
                }
                return Err(err);
            }
        }

        if self.config.debug_wait {
            self.pause_for_debugger().await?;
        }
        Ok(())
    }

    async fn pause_for_debugger(&mut self) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| AppError::NotRunning("no channel to the subject".into()))?;
        let reply = session.request(&["get-pid"]).await?.into_response()?;
        let pid = reply.get("pid").cloned().unwrap_or_default();
        warn!(%pid, "pausing for debugger attach");
        eprintln!("subject pid {pid}: attach a debugger; this harness will not continue");
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn teardown(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;
        let (Some(child), Some(signaller)) = (self.child.as_mut(), self.signaller.as_ref()) else {
            info!("instance was never launched; nothing to tear down");
            return Ok(());
        };

        let outcome = Teardown {
            child,
            signaller,
            session: self.session.as_mut(),
            config: &self.config,
            dir: &self.dir,
            profile: &self.plan.profile,
            collaborator: self.collaborator.as_ref(),
        }
        .run()
        .await;

        self.session = None;
        self.results.extend(outcome.records);
        if outcome.unkillable {
            return Err(AppError::Unkillable(format!(
                "process {} survived SIGKILL",
                signaller.pid()
            )));
        }
        self.child = None;
        Ok(())
    }
}

impl ManagedInstance for SpawnedInstance {
    fn kind(&self) -> InstanceKind {
        InstanceKind::Spawned
    }

    fn start(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.launch_and_connect())
    }

    fn session(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    fn signaller(&self) -> Option<ProcessSignaller> {
        self.signaller.clone()
    }

    fn terminate(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.teardown())
    }

    fn profile_artifacts(&self) -> &ProfileArtifacts {
        &self.plan.profile
    }

    fn results(&self) -> &[ResultRecord] {
        &self.results
    }

    fn server_log(&self) -> Option<PathBuf> {
        Some(self.dir.server_log())
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

impl Drop for SpawnedInstance {
    fn drop(&mut self) {
        if self.terminated {
            return;
        }
        if let Some(child) = self.child.as_mut() {
            error!(
                pid = child.id(),
                "instance dropped without terminate; killing subject"
            );
            if let Err(err) = child.start_kill() {
                warn!(%err, "failed to kill subject on drop");
            }
        }
    }
}
