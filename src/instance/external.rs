//! Instance whose subject is owned by another harness.
//!
//! Only the socket is known up front. The PID comes from `get-pid`, and
//! teardown closes the channel without touching the process.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::{BoxFuture, InstanceKind, ManagedInstance};
use crate::config::HarnessConfig;
use crate::process::{connect, ConnectOptions, LifecycleState, ProcessSignaller};
use crate::profiling::ProfileArtifacts;
use crate::protocol::Session;
use crate::report::ResultRecord;
use crate::{AppError, Result};

/// A subject reached through an externally provided socket.
#[derive(Debug)]
pub struct ExternalInstance {
    socket: PathBuf,
    options: ConnectOptions,
    lifecycle_timeout: std::time::Duration,
    session: Option<Session>,
    signaller: Option<ProcessSignaller>,
    profile: ProfileArtifacts,
    results: Vec<ResultRecord>,
    terminated: bool,
}

impl ExternalInstance {
    /// Prepare a connection to `socket`; nothing is opened yet.
    #[must_use]
    pub fn new(socket: &Path, config: &HarnessConfig) -> Self {
        Self {
            socket: socket.to_path_buf(),
            options: ConnectOptions::from_config(config),
            lifecycle_timeout: config.lifecycle_timeout(),
            session: None,
            signaller: None,
            profile: ProfileArtifacts::default(),
            results: Vec::new(),
            terminated: false,
        }
    }

    /// Socket this instance talks to.
    #[must_use]
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn attach(&mut self) -> Result<()> {
        if self.terminated {
            return Err(AppError::NotRunning("instance has been terminated".into()));
        }
        if self.session.is_some() {
            return Ok(());
        }

        let mut session = connect(&self.socket, &self.options).await?;
        let reply = session.request(&["get-pid"]).await?.into_response()?;
        let pid = reply
            .get("pid")
            .and_then(serde_json::Value::as_u64)
            .and_then(|pid| u32::try_from(pid).ok())
            .ok_or_else(|| AppError::Protocol(format!("get-pid returned no pid: {reply}")))?;

        info!(pid, socket = %self.socket.display(), "attached to external subject");
        self.signaller = Some(ProcessSignaller::new(
            pid,
            self.lifecycle_timeout,
            self.options.poll_interval,
        ));
        self.session = Some(session);
        Ok(())
    }

    async fn detach(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        self.terminated = true;

        if let Some(signaller) = &self.signaller {
            if signaller.lifecycle() == LifecycleState::Suspended {
                if let Err(err) = signaller.resume().await {
                    warn!(%err, "failed to resume external subject before detaching");
                }
            }
            signaller.set_lifecycle(LifecycleState::Terminated);
        }
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        info!(socket = %self.socket.display(), "detached from external subject");
        Ok(())
    }
}

impl ManagedInstance for ExternalInstance {
    fn kind(&self) -> InstanceKind {
        InstanceKind::External
    }

    fn start(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.attach())
    }

    fn session(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    fn signaller(&self) -> Option<ProcessSignaller> {
        self.signaller.clone()
    }

    fn terminate(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(self.detach())
    }

    fn profile_artifacts(&self) -> &ProfileArtifacts {
        &self.profile
    }

    fn results(&self) -> &[ResultRecord] {
        &self.results
    }

    fn server_log(&self) -> Option<PathBuf> {
        None
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}
