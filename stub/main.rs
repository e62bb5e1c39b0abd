#![forbid(unsafe_code)]

//! `stub-server`: minimal subject server for exercising managed instances.
//!
//! Accepts the subject argv contract, listens on `--sockname` and answers
//! JSON-array requests with one JSON object per line. A few commands push
//! `log` and `subscription` frames so buffering can be observed, and a few
//! misbehave on purpose so teardown escalation can be observed.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use futures_util::StreamExt;
use interprocess::local_socket::tokio::{prelude::*, Stream};
use interprocess::local_socket::{GenericFilePath, ListenerOptions, ToFsName};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::{fmt, EnvFilter};

use managed_instance::protocol::codec::FrameCodec;
use managed_instance::provision::CONFIG_FILE_ENV;
use managed_instance::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "stub-server", about = "Stub subject server for harness tests", version, long_about = None)]
struct Cli {
    /// Stay in the foreground (always the case; accepted for compatibility).
    #[arg(long)]
    foreground: bool,

    /// Socket path or named pipe to listen on.
    #[arg(long)]
    sockname: PathBuf,

    /// File receiving the server's own log lines.
    #[arg(long)]
    logfile: PathBuf,

    /// State file path (unused).
    #[arg(long)]
    statefile: Option<PathBuf>,

    /// Verbosity requested by the harness.
    #[arg(long, default_value_t = 1)]
    log_level: u8,

    /// File receiving this process's pid.
    #[arg(long)]
    pidfile: PathBuf,

    /// Diagnostic output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

/// State shared by every connection.
struct Stub {
    config: Value,
    logfile: PathBuf,
    ignore_shutdown: AtomicBool,
    exit_after_reply: AtomicBool,
    shutdown: CancellationToken,
}

impl Stub {
    fn log_line(&self, line: &str) {
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.logfile)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(err) = written {
            warn!(%err, "failed to append to logfile");
        }
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }
    Ok(())
}

async fn run(args: Cli) -> Result<()> {
    let config = load_config()?;
    let pid = std::process::id();
    info!(pid, log_level = args.log_level, foreground = args.foreground, "stub-server starting");

    if config.get("stub_exit_on_start").and_then(Value::as_bool) == Some(true) {
        error!("stub_exit_on_start is set; exiting before listening");
        std::process::exit(3);
    }

    std::fs::write(&args.pidfile, format!("{pid}\n"))
        .map_err(|err| AppError::Io(format!("failed to write pidfile: {err}")))?;

    let stub = Arc::new(Stub {
        config,
        logfile: args.logfile.clone(),
        ignore_shutdown: AtomicBool::new(false),
        exit_after_reply: AtomicBool::new(false),
        shutdown: CancellationToken::new(),
    });
    stub.log_line(&format!("stub-server {pid} listening on {}", args.sockname.display()));

    let listener = listen(&args.sockname)?;
    spawn_sigterm_handler(Arc::clone(&stub))?;

    loop {
        tokio::select! {
            () = stub.shutdown.cancelled() => {
                info!("stub-server shutting down");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok(stream) => {
                        tokio::spawn(handle_connection(stream, Arc::clone(&stub)));
                    }
                    Err(err) => warn!(%err, "accept failed"),
                }
            }
        }
    }

    stub.log_line("stub-server exiting");
    Ok(())
}

fn load_config() -> Result<Value> {
    let Some(path) = std::env::var_os(CONFIG_FILE_ENV) else {
        return Ok(json!({}));
    };
    let raw = std::fs::read_to_string(&path)
        .map_err(|err| AppError::Config(format!("failed to read server config: {err}")))?;
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    Ok(serde_json::from_str(&raw)?)
}

fn listen(path: &Path) -> Result<interprocess::local_socket::tokio::Listener> {
    let name = path
        .to_fs_name::<GenericFilePath>()
        .map_err(|err| AppError::Config(format!("invalid socket path '{}': {err}", path.display())))?;
    ListenerOptions::new()
        .name(name)
        .create_tokio()
        .map_err(|err| AppError::Io(format!("failed to listen on {}: {err}", path.display())))
}

#[cfg(unix)]
fn spawn_sigterm_handler(stub: Arc<Stub>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|err| AppError::Io(format!("failed to install SIGTERM handler: {err}")))?;
    tokio::spawn(async move {
        while sigterm.recv().await.is_some() {
            if stub.ignore_shutdown.load(Ordering::SeqCst) {
                warn!("ignoring SIGTERM");
                continue;
            }
            info!("SIGTERM received");
            stub.shutdown.cancel();
            break;
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_sigterm_handler(_stub: Arc<Stub>) -> Result<()> {
    Ok(())
}

async fn handle_connection(stream: Stream, stub: Arc<Stub>) {
    let span = info_span!("stub_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut lines = FramedRead::new(reader, FrameCodec::new());

        while let Some(line) = lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!(%err, "read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let frames = match serde_json::from_str::<Vec<Value>>(&line) {
                Ok(args) => dispatch(&args, &stub),
                Err(err) => vec![json!({ "error": format!("invalid request: {err}") })],
            };

            for frame in frames {
                let mut out = frame.to_string();
                out.push('\n');
                if let Err(err) = writer.write_all(out.as_bytes()).await {
                    warn!(%err, "write failed");
                    return;
                }
            }
            if let Err(err) = writer.flush().await {
                warn!(%err, "flush failed");
                return;
            }
            if stub.exit_after_reply.swap(false, Ordering::SeqCst) {
                stub.shutdown.cancel();
            }
        }
        info!("connection closed");
    }
    .instrument(span)
    .await;
}

/// Frames to write for one request, in order.
fn dispatch(args: &[Value], stub: &Stub) -> Vec<Value> {
    let command = args.first().and_then(Value::as_str).unwrap_or_default();
    let arg = |i: usize| args.get(i).and_then(Value::as_str).unwrap_or_default();
    info!(command, "request");

    match command {
        "get-pid" => vec![json!({ "pid": std::process::id() })],
        "version" => vec![json!({ "version": env!("CARGO_PKG_VERSION") })],
        "echo" => vec![json!({ "echo": args.get(1..).unwrap_or_default() })],
        "log" => {
            let (level, text) = (arg(1), arg(2));
            stub.log_line(text);
            vec![
                json!({ "log": text, "level": level, "unilateral": true }),
                json!({ "logged": true }),
            ]
        }
        "subscribe" => {
            let (root, name) = (arg(1), arg(2));
            vec![
                json!({ "subscribe": name, "root": root }),
                json!({
                    "subscription": name,
                    "root": root,
                    "unilateral": true,
                    "is_fresh_instance": true,
                    "files": [],
                }),
            ]
        }
        "push" => {
            let name = arg(1);
            let count = args.get(2).and_then(Value::as_u64).unwrap_or(1);
            let mut frames: Vec<Value> = (0..count)
                .map(|seq| json!({ "subscription": name, "unilateral": true, "seq": seq }))
                .collect();
            frames.push(json!({ "pushed": count }));
            frames
        }
        "get-config" => vec![json!({ "config": stub.config })],
        "ignore-shutdown" => {
            stub.ignore_shutdown.store(true, Ordering::SeqCst);
            vec![json!({ "ignore-shutdown": true })]
        }
        "crash" => {
            error!("crash requested");
            std::process::exit(70);
        }
        "shutdown-server" => {
            if stub.ignore_shutdown.load(Ordering::SeqCst) {
                warn!("ignoring shutdown-server");
                vec![json!({ "shutdown-server": "ignored" })]
            } else {
                stub.exit_after_reply.store(true, Ordering::SeqCst);
                vec![json!({ "shutdown-server": true })]
            }
        }
        "" => vec![json!({ "error": "empty request" })],
        other => vec![json!({ "error": format!("unknown command {other}") })],
    }
}
