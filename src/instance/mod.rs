//! Managed instances and the [`Instance`] façade tests drive.
//!
//! [`ManagedInstance`] is the capability set shared by a subject this
//! harness launches ([`SpawnedInstance`]) and one owned by another harness
//! ([`ExternalInstance`]). [`Instance`] picks one from configuration, starts
//! it lazily on first use and exposes the protocol operations.

pub mod external;
pub mod spawned;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::time::{sleep, Instant};
use tracing::warn;

use crate::config::HarnessConfig;
use crate::process::ProcessSignaller;
use crate::profiling::{ProfileArtifacts, ProfileCollaborator, SkipCollaborator};
use crate::protocol::{LogMatch, PushEvent, Reply, Session, Topic};
use crate::report::ResultRecord;
use crate::{AppError, Result};

pub use external::ExternalInstance;
pub use spawned::SpawnedInstance;

/// Boxed future returned by [`ManagedInstance`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// How the subject process is owned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    /// Launched and torn down by this harness.
    Spawned,
    /// Provided by another harness; only the channel is ours.
    External,
}

/// Capabilities of one managed subject.
pub trait ManagedInstance: Send {
    /// Ownership model of this instance.
    fn kind(&self) -> InstanceKind;

    /// Launch (if owned) and connect. Idempotent once connected.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn`, `AppError::ConnectTimeout` or
    /// `AppError::NotRunning` after termination.
    fn start(&mut self) -> BoxFuture<'_, ()>;

    /// Open channel, once started.
    fn session(&mut self) -> Option<&mut Session>;

    /// Signal handle, once the PID is known.
    fn signaller(&self) -> Option<ProcessSignaller>;

    /// Stop the subject with confirmation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotRunning` before start or after exit, and
    /// `AppError::DidNotTransition` when the stop is not observed.
    fn suspend(&mut self) -> BoxFuture<'_, ()> {
        let signaller = self.signaller();
        Box::pin(async move { signaller.ok_or_else(not_started)?.suspend().await })
    }

    /// Continue the subject with confirmation.
    ///
    /// # Errors
    ///
    /// Same as [`ManagedInstance::suspend`].
    fn resume(&mut self) -> BoxFuture<'_, ()> {
        let signaller = self.signaller();
        Box::pin(async move { signaller.ok_or_else(not_started)?.resume().await })
    }

    /// Tear down. Idempotent; a second call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unkillable` when the subject survives every
    /// escalation step. Artifacts are captured regardless.
    fn terminate(&mut self) -> BoxFuture<'_, ()>;

    /// Paths the profiling wrapper writes to.
    fn profile_artifacts(&self) -> &ProfileArtifacts;

    /// Verdicts gathered at teardown.
    fn results(&self) -> &[ResultRecord];

    /// The subject's own log file, when this harness owns it.
    fn server_log(&self) -> Option<PathBuf>;

    /// Whether teardown has run.
    fn is_terminated(&self) -> bool;
}

fn not_started() -> AppError {
    AppError::NotRunning("instance has not been started".into())
}

/// A managed subject selected by configuration.
pub struct Instance {
    inner: Box<dyn ManagedInstance>,
    poll_interval: Duration,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("kind", &self.inner.kind())
            .field("terminated", &self.inner.is_terminated())
            .finish_non_exhaustive()
    }
}

impl Instance {
    /// Build an instance with the default [`SkipCollaborator`].
    ///
    /// An `external_socket` selects [`ExternalInstance`]; otherwise a
    /// [`SpawnedInstance`] is provisioned. Nothing is launched yet.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for invalid configuration and
    /// `AppError::Io` when provisioning fails.
    pub fn acquire(config: HarnessConfig) -> Result<Self> {
        Self::with_collaborator(config, Arc::new(SkipCollaborator))
    }

    /// Build an instance whose profiling output goes to `collaborator`.
    ///
    /// # Errors
    ///
    /// See [`Instance::acquire`].
    pub fn with_collaborator(
        config: HarnessConfig,
        collaborator: Arc<dyn ProfileCollaborator>,
    ) -> Result<Self> {
        config.validate()?;
        let poll_interval = config.poll_interval();
        let inner: Box<dyn ManagedInstance> = match &config.external_socket {
            Some(socket) => Box::new(ExternalInstance::new(socket, &config)),
            None => Box::new(SpawnedInstance::new(config, collaborator)?),
        };
        Ok(Self {
            inner,
            poll_interval,
        })
    }

    /// Wrap an existing implementation.
    #[must_use]
    pub fn from_managed(inner: Box<dyn ManagedInstance>, poll_interval: Duration) -> Self {
        Self {
            inner,
            poll_interval,
        }
    }

    /// Run `body` against a fresh instance and always terminate it.
    ///
    /// Teardown also runs when `body` fails or panics; a panic is re-raised
    /// once teardown completes. Returns the body's value with the verdicts.
    ///
    /// # Errors
    ///
    /// Returns the body's error, or the teardown error when the body
    /// succeeded.
    pub async fn scoped<F, T>(config: HarnessConfig, body: F) -> Result<(T, Vec<ResultRecord>)>
    where
        F: for<'a> FnOnce(&'a mut Instance) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>,
    {
        let mut instance = Self::acquire(config)?;
        let outcome = AssertUnwindSafe(body(&mut instance)).catch_unwind().await;
        let teardown = instance.terminate().await;
        let results = instance.results().to_vec();

        match outcome {
            Err(panic) => {
                if let Err(err) = teardown {
                    warn!(%err, "teardown failed while unwinding");
                }
                std::panic::resume_unwind(panic)
            }
            Ok(Err(err)) => {
                if let Err(teardown_err) = teardown {
                    warn!(%teardown_err, "teardown failed after body error");
                }
                Err(err)
            }
            Ok(Ok(value)) => {
                teardown?;
                Ok((value, results))
            }
        }
    }

    /// Ownership model.
    #[must_use]
    pub fn kind(&self) -> InstanceKind {
        self.inner.kind()
    }

    /// Launch and connect if not already done.
    ///
    /// # Errors
    ///
    /// See [`ManagedInstance::start`].
    pub async fn start(&mut self) -> Result<()> {
        self.inner.start().await
    }

    /// Send one request, starting the instance first if needed.
    ///
    /// An empty `args` array only starts the instance and returns
    /// [`Reply::Warmup`].
    ///
    /// # Errors
    ///
    /// Start errors, then see [`Session::request`].
    pub async fn request<A>(&mut self, args: &A) -> Result<Reply>
    where
        A: Serialize + ?Sized + Sync,
    {
        self.session().await?.request(args).await
    }

    /// PID reported by the subject's `get-pid` command.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the answer carries no usable pid.
    pub async fn get_pid(&mut self) -> Result<u32> {
        let reply = self.request(&["get-pid"]).await?.into_response()?;
        reply
            .get("pid")
            .and_then(Value::as_u64)
            .and_then(|pid| u32::try_from(pid).ok())
            .ok_or_else(|| AppError::Protocol(format!("get-pid returned no pid: {reply}")))
    }

    /// See [`Session::wait_for_topic`].
    ///
    /// # Errors
    ///
    /// Start errors, then see [`Session::wait_for_topic`].
    pub async fn wait_for_topic<P>(
        &mut self,
        topic: &Topic,
        predicate: P,
        timeout: Duration,
    ) -> Result<Vec<PushEvent>>
    where
        P: FnMut(&[PushEvent]) -> bool + Send,
    {
        self.session()
            .await?
            .wait_for_topic(topic, predicate, timeout)
            .await
    }

    /// See [`Session::wait_for_subscription`].
    ///
    /// # Errors
    ///
    /// Start errors, then see [`Session::wait_for_topic`].
    pub async fn wait_for_subscription<P>(
        &mut self,
        name: &str,
        predicate: P,
        timeout: Duration,
    ) -> Result<Vec<Value>>
    where
        P: FnMut(&[&Value]) -> bool + Send,
    {
        self.session()
            .await?
            .wait_for_subscription(name, predicate, timeout)
            .await
    }

    /// See [`Session::wait_for_log`].
    ///
    /// # Errors
    ///
    /// Start errors, then see [`Session::wait_for_topic`].
    pub async fn wait_for_log(
        &mut self,
        pattern: &Regex,
        timeout: Duration,
    ) -> Result<Option<LogMatch>> {
        self.session().await?.wait_for_log(pattern, timeout).await
    }

    /// Get and clear the data collected for subscription `name`.
    pub fn take_subscription(&mut self, name: &str) -> Vec<Value> {
        self.inner
            .session()
            .map(|session| session.take_subscription(name))
            .unwrap_or_default()
    }

    /// Log lines pushed so far.
    pub fn log_lines(&mut self) -> Vec<String> {
        self.inner
            .session()
            .map(|session| session.log_lines().into_iter().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    /// Scan the subject's own log file until a line matches `pattern`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Unsupported` for an external instance.
    pub async fn wait_for_log_output(
        &mut self,
        pattern: &Regex,
        timeout: Duration,
    ) -> Result<Option<LogMatch>> {
        let Some(path) = self.inner.server_log() else {
            return Err(AppError::Unsupported(
                "the subject's log file belongs to another harness".into(),
            ));
        };
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(text) = tokio::fs::read_to_string(&path).await {
                if let Some(found) = text.lines().find_map(|line| LogMatch::find(pattern, line)) {
                    return Ok(Some(found));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Stop the subject. Requests sent while suspended block until resumed.
    ///
    /// # Errors
    ///
    /// See [`ManagedInstance::suspend`].
    pub async fn suspend(&mut self) -> Result<()> {
        self.inner.suspend().await
    }

    /// Continue a suspended subject.
    ///
    /// # Errors
    ///
    /// See [`ManagedInstance::resume`].
    pub async fn resume(&mut self) -> Result<()> {
        self.inner.resume().await
    }

    /// Cloneable signal handle, usable while a request is in flight.
    #[must_use]
    pub fn signaller(&self) -> Option<ProcessSignaller> {
        self.inner.signaller()
    }

    /// Tear the instance down.
    ///
    /// # Errors
    ///
    /// See [`ManagedInstance::terminate`].
    pub async fn terminate(&mut self) -> Result<()> {
        self.inner.terminate().await
    }

    /// Whether teardown has run.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }

    /// Verdicts gathered at teardown.
    #[must_use]
    pub fn results(&self) -> &[ResultRecord] {
        self.inner.results()
    }

    /// Paths the profiling wrapper writes to.
    #[must_use]
    pub fn profile_artifacts(&self) -> &ProfileArtifacts {
        self.inner.profile_artifacts()
    }

    async fn session(&mut self) -> Result<&mut Session> {
        self.inner.start().await?;
        self.inner
            .session()
            .ok_or_else(|| AppError::NotRunning("no channel to the subject".into()))
    }
}
