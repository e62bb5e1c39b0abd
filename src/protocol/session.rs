//! Request/response session over a duplex line channel.
//!
//! The session writes one JSON array per request and then reads frames
//! until something that is not push traffic arrives. Log and subscription
//! frames read along the way are filed into [`TopicBuffers`] so later
//! waits can consume them. Every operation takes `&mut self`, which is what
//! guarantees that at most one request is ever in flight.

use std::time::Duration;

use futures_util::StreamExt;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, trace, warn};

use super::codec::FrameCodec;
use super::frame::Frame;
use super::topics::{PushEvent, Topic, TopicBuffers};
use crate::{AppError, Result};

/// Boxed read half of a channel.
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
/// Boxed write half of a channel.
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Outcome of [`Session::request`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// The frame answering the request.
    Response(Value),
    /// The channel closed before an answer arrived.
    ConnectionLost,
    /// No command was given; only the lazy start ran.
    Warmup,
}

impl Reply {
    /// The response value, treating anything else as an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotRunning` when the connection was lost and
    /// `AppError::Protocol` when no command was sent.
    pub fn into_response(self) -> Result<Value> {
        match self {
            Self::Response(value) => Ok(value),
            Self::ConnectionLost => Err(AppError::NotRunning(
                "connection lost before a response arrived".into(),
            )),
            Self::Warmup => Err(AppError::Protocol("no command was sent".into())),
        }
    }

    /// Whether the channel closed before an answer.
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost)
    }
}

/// A log line matched by [`Session::wait_for_log`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMatch {
    /// The full matching log line.
    pub line: String,
    /// Capture groups; index 0 is the whole match.
    pub groups: Vec<Option<String>>,
}

impl LogMatch {
    /// Match `pattern` against `line`.
    #[must_use]
    pub fn find(pattern: &Regex, line: &str) -> Option<Self> {
        let caps = pattern.captures(line)?;
        Some(Self {
            line: line.to_owned(),
            groups: caps
                .iter()
                .map(|m| m.map(|m| m.as_str().to_owned()))
                .collect(),
        })
    }
}

enum ReadOutcome {
    Frame(Frame),
    Closed,
    TimedOut,
}

/// One live control channel with its topic buffers.
pub struct Session {
    reader: FramedRead<BoxedReader, FrameCodec>,
    writer: BoxedWriter,
    buffers: TopicBuffers,
    io_timeout: Duration,
    debug: bool,
    closed: bool,
    /// Requests that timed out whose answers may still arrive.
    orphaned: usize,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("io_timeout", &self.io_timeout)
            .field("closed", &self.closed)
            .field("orphaned", &self.orphaned)
            .field("buffers", &self.buffers)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Wrap the two halves of a channel.
    ///
    /// `io_timeout` bounds every individual read and write.
    pub fn new<R, W>(reader: R, writer: W, io_timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        Self {
            reader: FramedRead::new(reader, FrameCodec::new()),
            writer,
            buffers: TopicBuffers::default(),
            io_timeout,
            debug: false,
            closed: false,
            orphaned: 0,
        }
    }

    /// Log every outgoing request at `INFO` instead of `TRACE`.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Per-operation I/O deadline.
    #[must_use]
    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    /// Whether the peer closed the channel.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send `args` (which must serialize to a JSON array) and return the
    /// frame answering it.
    ///
    /// An empty array sends nothing and returns [`Reply::Warmup`].
    ///
    /// # Errors
    ///
    /// - [`AppError::Protocol`]: `args` is not an array, or a frame read
    ///   while waiting violates the classification contract.
    /// - [`AppError::Write`]: the request could not be written in full.
    /// - [`AppError::Timeout`]: no frame arrived within the I/O deadline.
    ///   The request stays pending on the channel, and its late answer is
    ///   discarded instead of being returned to a later request.
    pub async fn request<A>(&mut self, args: &A) -> Result<Reply>
    where
        A: Serialize + ?Sized,
    {
        let value = serde_json::to_value(args)
            .map_err(|err| AppError::Protocol(format!("failed to encode request: {err}")))?;
        let Value::Array(items) = &value else {
            return Err(AppError::Protocol(format!(
                "request must be a json array, got {value}"
            )));
        };
        if items.is_empty() {
            return Ok(Reply::Warmup);
        }

        let encoded = value.to_string();
        if self.debug {
            info!(request = %encoded, "sending request");
        } else {
            trace!(request = %encoded, "sending request");
        }

        let mut buf = encoded.into_bytes();
        buf.push(b'\n');
        self.write_full(&buf).await?;

        loop {
            let deadline = Instant::now() + self.io_timeout;
            match self.read_frame(deadline).await? {
                ReadOutcome::Frame(Frame::Response(value)) => {
                    if self.discard_late_response(&value) {
                        continue;
                    }
                    return Ok(Reply::Response(value));
                }
                ReadOutcome::Frame(frame) => {
                    self.file(frame);
                }
                ReadOutcome::Closed => {
                    debug!("channel closed while waiting for a response");
                    return Ok(Reply::ConnectionLost);
                }
                ReadOutcome::TimedOut => {
                    self.orphaned += 1;
                    return Err(AppError::Timeout(format!(
                        "no response within {:?}",
                        self.io_timeout
                    )));
                }
            }
        }
    }

    /// Wait until `predicate` holds over the events buffered for `topic`.
    ///
    /// When the buffer already satisfies `predicate` no read happens.
    /// Otherwise frames are read, each bounded by the remaining budget, and
    /// filed under their own topics. Returns a copy of the topic's events,
    /// or an empty vector on timeout or channel closure; nothing read while
    /// waiting is lost.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Protocol`] for a malformed frame or for a
    /// response arriving while no request is in flight.
    pub async fn wait_for_topic<P>(
        &mut self,
        topic: &Topic,
        mut predicate: P,
        timeout: Duration,
    ) -> Result<Vec<PushEvent>>
    where
        P: FnMut(&[PushEvent]) -> bool,
    {
        if predicate(self.buffers.get(topic)) {
            return Ok(self.buffers.get(topic).to_vec());
        }

        let deadline = Instant::now() + timeout;
        loop {
            match self.read_frame(deadline).await? {
                ReadOutcome::Frame(Frame::Response(value)) => {
                    if self.discard_late_response(&value) {
                        continue;
                    }
                    return Err(AppError::Protocol(format!(
                        "unsolicited response while waiting for {topic}: {value}"
                    )));
                }
                ReadOutcome::Frame(frame) => {
                    let arrived = self.file(frame);
                    if arrived == *topic && predicate(self.buffers.get(topic)) {
                        return Ok(self.buffers.get(topic).to_vec());
                    }
                }
                ReadOutcome::Closed => {
                    debug!(%topic, "channel closed while waiting for topic");
                    return Ok(Vec::new());
                }
                ReadOutcome::TimedOut => {
                    debug!(%topic, ?timeout, "timed out waiting for topic");
                    return Ok(Vec::new());
                }
            }
        }
    }

    /// Wait for subscription `name` using a predicate over its payloads.
    ///
    /// # Errors
    ///
    /// See [`Session::wait_for_topic`].
    pub async fn wait_for_subscription<P>(
        &mut self,
        name: &str,
        mut predicate: P,
        timeout: Duration,
    ) -> Result<Vec<Value>>
    where
        P: FnMut(&[&Value]) -> bool,
    {
        let topic = Topic::subscription(name);
        let events = self
            .wait_for_topic(
                &topic,
                |events| {
                    let payloads: Vec<&Value> =
                        events.iter().filter_map(PushEvent::as_subscription).collect();
                    predicate(&payloads)
                },
                timeout,
            )
            .await?;
        Ok(events
            .iter()
            .filter_map(PushEvent::as_subscription)
            .cloned()
            .collect())
    }

    /// Wait for a pushed log line matching `pattern`.
    ///
    /// Lines already collected are searched first.
    ///
    /// # Errors
    ///
    /// See [`Session::wait_for_topic`].
    pub async fn wait_for_log(
        &mut self,
        pattern: &Regex,
        timeout: Duration,
    ) -> Result<Option<LogMatch>> {
        let first_match = |events: &[PushEvent]| {
            events
                .iter()
                .filter_map(PushEvent::as_log)
                .find_map(|log| LogMatch::find(pattern, &log.text))
        };
        let events = self
            .wait_for_topic(&Topic::Log, |events| first_match(events).is_some(), timeout)
            .await?;
        Ok(first_match(&events))
    }

    /// Get and clear the data collected for subscription `name`.
    pub fn take_subscription(&mut self, name: &str) -> Vec<Value> {
        self.buffers
            .drain(&Topic::subscription(name))
            .into_iter()
            .filter_map(|event| match event {
                PushEvent::Subscription(sub) => Some(sub.payload),
                _ => None,
            })
            .collect()
    }

    /// Text of every log line collected so far.
    #[must_use]
    pub fn log_lines(&self) -> Vec<&str> {
        self.buffers
            .get(&Topic::Log)
            .iter()
            .filter_map(PushEvent::as_log)
            .map(|log| log.text.as_str())
            .collect()
    }

    /// Events currently buffered for `topic`.
    #[must_use]
    pub fn buffered(&self, topic: &Topic) -> &[PushEvent] {
        self.buffers.get(topic)
    }

    /// Remove and return everything buffered for `topic`.
    pub fn drain(&mut self, topic: &Topic) -> Vec<PushEvent> {
        self.buffers.drain(topic)
    }

    /// Shut down the write half; later reads observe closure.
    pub async fn close(&mut self) {
        if let Err(err) = self.writer.shutdown().await {
            debug!(%err, "channel shutdown failed");
        }
        self.closed = true;
    }

    // ── Private helpers ──────────────────────────────────────────────────

    async fn write_full(&mut self, buf: &[u8]) -> Result<()> {
        let total = buf.len();
        let mut written = 0;
        while written < total {
            match timeout(self.io_timeout, self.writer.write(&buf[written..])).await {
                Ok(Ok(0)) => {
                    return Err(write_error(written, total, "channel accepted no bytes"));
                }
                Ok(Ok(n)) => written += n,
                Ok(Err(err)) => return Err(write_error(written, total, &err.to_string())),
                Err(_elapsed) => {
                    return Err(write_error(
                        written,
                        total,
                        &format!("write timed out after {:?}", self.io_timeout),
                    ));
                }
            }
        }
        match timeout(self.io_timeout, self.writer.flush()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(write_error(written, total, &err.to_string())),
            Err(_elapsed) => Err(write_error(written, total, "flush timed out")),
        }
    }

    async fn read_frame(&mut self, deadline: Instant) -> Result<ReadOutcome> {
        loop {
            if self.closed {
                return Ok(ReadOutcome::Closed);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ReadOutcome::TimedOut);
            }

            match timeout(remaining, self.reader.next()).await {
                Err(_elapsed) => return Ok(ReadOutcome::TimedOut),
                Ok(None) => {
                    self.closed = true;
                }
                Ok(Some(Err(AppError::Io(msg)))) => {
                    debug!(error = %msg, "channel read failed, treating as closed");
                    self.closed = true;
                }
                Ok(Some(Err(err))) => return Err(err),
                Ok(Some(Ok(line))) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Frame::parse(&line).map(ReadOutcome::Frame);
                }
            }
        }
    }

    /// Consume `value` if it answers a request that already timed out.
    fn discard_late_response(&mut self, value: &Value) -> bool {
        if self.orphaned == 0 {
            return false;
        }
        self.orphaned -= 1;
        debug!(frame = %value, pending = self.orphaned, "discarding late response");
        true
    }

    /// File a push frame under its topic and return that topic.
    fn file(&mut self, frame: Frame) -> Topic {
        let event = match frame {
            Frame::Log(log) => PushEvent::Log(log),
            Frame::Subscription(sub) => PushEvent::Subscription(sub),
            Frame::Unilateral(value) => {
                warn!(frame = %value, "unrecognised unilateral frame");
                PushEvent::Unilateral(value)
            }
            Frame::Response(value) => {
                warn!(frame = %value, "response frame filed as unilateral");
                PushEvent::Unilateral(value)
            }
        };
        let topic = event.topic();
        trace!(%topic, "buffered push frame");
        self.buffers.push(event);
        topic
    }
}

fn write_error(written: usize, total: usize, reason: &str) -> AppError {
    warn!(written, total, reason, "failed to send request");
    AppError::Write {
        written,
        total,
        reason: reason.to_owned(),
    }
}
