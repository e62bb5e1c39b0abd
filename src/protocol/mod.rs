//! JSON-line control protocol spoken with the subject.
//!
//! Requests are JSON arrays, one per line. Replies and push traffic are JSON
//! objects, one per line. [`codec`] frames lines, [`frame`] classifies them,
//! [`topics`] buffers push traffic and [`session`] ties the three together.

pub mod codec;
pub mod frame;
pub mod session;
pub mod topics;

pub use frame::{Frame, LogEvent, SubscriptionEvent};
pub use session::{LogMatch, Reply, Session};
pub use topics::{PushEvent, Topic, TopicBuffers};
