#![forbid(unsafe_code)]

//! Managed test instances of a JSON-line socket server.
//!
//! An [`Instance`] launches the subject server in a throwaway directory,
//! connects to its local socket, and drives it with JSON requests while
//! buffering pushed log and subscription frames by topic. It can suspend
//! and resume the process with confirmation, and on teardown it escalates
//! from a polite shutdown to `SIGKILL` before collecting logs and profiler
//! output into aggregate files.

pub mod config;
pub mod errors;
pub mod instance;
pub mod process;
pub mod profiling;
pub mod protocol;
pub mod provision;
pub mod report;

pub use config::HarnessConfig;
pub use errors::{AppError, Result};
pub use instance::{Instance, InstanceKind, ManagedInstance};
pub use protocol::{Reply, Topic};
