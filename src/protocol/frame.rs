//! Inbound frame classification.
//!
//! Every line read from the channel is decoded into exactly one [`Frame`]:
//!
//! | Shape                                    | Frame                    |
//! |------------------------------------------|--------------------------|
//! | object with a `log` key                  | [`Frame::Log`]           |
//! | object with a `subscription` key         | [`Frame::Subscription`]  |
//! | `"unilateral": true`, neither key above  | [`Frame::Unilateral`]    |
//! | any other object                         | [`Frame::Response`]      |
//!
//! There is no sequence-number correlation: anything that is not push
//! traffic answers the request in flight.

use serde_json::{Map, Value};

use crate::{AppError, Result};

/// A log line pushed by the subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Optional `level` field sent alongside the text.
    pub level: Option<String>,
    /// The log text.
    pub text: String,
}

/// A subscription notification pushed by the subject.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent {
    /// Subscription name.
    pub name: String,
    /// The whole decoded frame, including `subscription`.
    pub payload: Value,
}

/// One decoded line from the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Answer to the request in flight.
    Response(Value),
    /// Pushed log line.
    Log(LogEvent),
    /// Pushed subscription notification.
    Subscription(SubscriptionEvent),
    /// Unsolicited frame of a push type this harness does not know.
    Unilateral(Value),
}

impl Frame {
    /// Decode and classify one line.
    ///
    /// # Errors
    ///
    /// - [`AppError::Protocol`]`("malformed json: …")`: not valid JSON.
    /// - [`AppError::Protocol`]: not a JSON object, or a subscription frame
    ///   whose name is missing or not a string.
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line.trim())?;
        Self::classify(value)
    }

    /// Classify an already decoded value.
    ///
    /// # Errors
    ///
    /// See [`Frame::parse`].
    pub fn classify(value: Value) -> Result<Self> {
        let Value::Object(obj) = value else {
            return Err(AppError::Protocol(format!(
                "expected a json object frame, got {value}"
            )));
        };

        if let Some(log) = obj.get("log") {
            let text = match log {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let level = obj
                .get("level")
                .and_then(Value::as_str)
                .map(str::to_owned);
            return Ok(Self::Log(LogEvent { level, text }));
        }

        if let Some(sub) = obj.get("subscription") {
            let name = sub
                .as_str()
                .filter(|n| !n.is_empty())
                .map(str::to_owned);
            let Some(name) = name else {
                return Err(AppError::Protocol(format!(
                    "subscription frame is missing its name: {}",
                    Value::Object(obj)
                )));
            };
            return Ok(Self::Subscription(SubscriptionEvent {
                name,
                payload: Value::Object(obj),
            }));
        }

        if is_unilateral(&obj) {
            return Ok(Self::Unilateral(Value::Object(obj)));
        }

        Ok(Self::Response(Value::Object(obj)))
    }
}

fn is_unilateral(obj: &Map<String, Value>) -> bool {
    obj.get("unilateral").and_then(Value::as_bool) == Some(true)
}
