//! Per-topic buffers for push traffic.
//!
//! Buffers are append-only until a caller drains a topic; draining one
//! topic never touches the others.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use serde_json::Value;

use super::frame::{LogEvent, SubscriptionEvent};

/// Key of a topic buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Pushed log lines.
    Log,
    /// Notifications for one named subscription.
    Subscription(String),
    /// Unsolicited frames of unknown push type.
    Unilateral,
}

impl Topic {
    /// Shorthand for [`Topic::Subscription`].
    #[must_use]
    pub fn subscription(name: impl Into<String>) -> Self {
        Self::Subscription(name.into())
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Log => f.write_str("log"),
            Self::Subscription(name) => write!(f, "subscription:{name}"),
            Self::Unilateral => f.write_str("unilateral"),
        }
    }
}

/// One buffered push event.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// Log line.
    Log(LogEvent),
    /// Subscription notification.
    Subscription(SubscriptionEvent),
    /// Unknown unilateral frame.
    Unilateral(Value),
}

impl PushEvent {
    /// Topic this event is filed under.
    #[must_use]
    pub fn topic(&self) -> Topic {
        match self {
            Self::Log(_) => Topic::Log,
            Self::Subscription(sub) => Topic::Subscription(sub.name.clone()),
            Self::Unilateral(_) => Topic::Unilateral,
        }
    }

    /// Log text, when this is a log event.
    #[must_use]
    pub fn as_log(&self) -> Option<&LogEvent> {
        match self {
            Self::Log(log) => Some(log),
            _ => None,
        }
    }

    /// Subscription payload, when this is a subscription event.
    #[must_use]
    pub fn as_subscription(&self) -> Option<&Value> {
        match self {
            Self::Subscription(sub) => Some(&sub.payload),
            _ => None,
        }
    }
}

/// All topic buffers of one session.
#[derive(Debug, Default)]
pub struct TopicBuffers {
    topics: HashMap<Topic, Vec<PushEvent>>,
}

impl TopicBuffers {
    /// Append `event` to its topic, preserving arrival order.
    pub fn push(&mut self, event: PushEvent) {
        self.topics.entry(event.topic()).or_default().push(event);
    }

    /// Events currently buffered for `topic`.
    #[must_use]
    pub fn get(&self, topic: &Topic) -> &[PushEvent] {
        self.topics.get(topic).map_or(&[], Vec::as_slice)
    }

    /// Remove and return everything buffered for `topic`.
    pub fn drain(&mut self, topic: &Topic) -> Vec<PushEvent> {
        self.topics.remove(topic).unwrap_or_default()
    }

    /// Number of events buffered for `topic`.
    #[must_use]
    pub fn len(&self, topic: &Topic) -> usize {
        self.get(topic).len()
    }

    /// Whether no topic holds any event.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.topics.values().all(Vec::is_empty)
    }
}
