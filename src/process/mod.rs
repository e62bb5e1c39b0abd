//! Subject process control: launch, connect, signal and tear down.

pub mod connector;
pub mod launcher;
pub mod signals;
pub mod termination;

pub use connector::{connect, ConnectOptions};
pub use launcher::{resolve_binary, LaunchPlan};
pub use signals::{LifecycleState, ProcState, ProcessSignal, ProcessSignaller};
pub use termination::{append_log_file, Teardown, TeardownOutcome};
