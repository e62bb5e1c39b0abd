//! Control channel connector.
//!
//! The subject creates its socket some time after it starts, so the
//! connector polls until a connection succeeds or the deadline passes.

use std::path::Path;
use std::time::Duration;

use interprocess::local_socket::tokio::{prelude::*, Stream};
use interprocess::local_socket::{GenericFilePath, ToFsName};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::config::HarnessConfig;
use crate::protocol::Session;
use crate::{AppError, Result};

/// Deadlines used while opening a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Give up after this long.
    pub connect_timeout: Duration,
    /// Delay between attempts.
    pub poll_interval: Duration,
    /// Per-operation deadline handed to the session.
    pub io_timeout: Duration,
    /// Echo requests at `INFO`.
    pub debug: bool,
}

impl ConnectOptions {
    /// Options derived from a harness configuration.
    #[must_use]
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            poll_interval: config.poll_interval(),
            io_timeout: config.io_timeout(),
            debug: config.debug,
        }
    }
}

/// Connect to the channel at `path`, retrying until it accepts.
///
/// # Errors
///
/// Returns [`AppError::ConnectTimeout`] naming `path` and the elapsed time
/// when no attempt succeeds before `options.connect_timeout`.
pub async fn connect(path: &Path, options: &ConnectOptions) -> Result<Session> {
    let started = Instant::now();
    loop {
        match try_connect(path).await {
            Ok(stream) => {
                info!(
                    socket = %path.display(),
                    elapsed_ms = started.elapsed().as_millis(),
                    "connected to subject"
                );
                let (reader, writer) = stream.split();
                return Ok(Session::new(reader, writer, options.io_timeout)
                    .with_debug(options.debug));
            }
            Err(err) => {
                debug!(socket = %path.display(), %err, "channel not ready");
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= options.connect_timeout {
            return Err(AppError::ConnectTimeout {
                path: path.to_path_buf(),
                elapsed,
            });
        }
        sleep(options.poll_interval).await;
    }
}

async fn try_connect(path: &Path) -> std::io::Result<Stream> {
    let name = path.to_fs_name::<GenericFilePath>()?;
    Stream::connect(name).await
}
