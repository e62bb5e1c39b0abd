//! Integration tests for subjects that cannot be launched or never listen.

use std::time::Duration;

use serde_json::json;

use managed_instance::process::termination::AGGREGATE_TEST_LOG;
use managed_instance::report::Verdict;
use managed_instance::{AppError, Instance};

use super::test_helpers::{read_aggregate, stub_config};

#[tokio::test]
async fn missing_binary_is_a_spawn_error_naming_the_command() {
    let aggregate = tempfile::tempdir().unwrap();
    let mut config = stub_config(aggregate.path());
    config.binary_name = "no-such-subject-binary".into();
    let mut instance = Instance::acquire(config).unwrap();

    match instance.start().await.unwrap_err() {
        AppError::Spawn { command, .. } => {
            assert!(command.starts_with("no-such-subject-binary"), "{command}");
            assert!(command.contains("--foreground --sockname="), "{command}");
        }
        other => panic!("expected a spawn error, got {other}"),
    }
}

/// A subject that exits before listening surfaces as a connect timeout,
/// and the instance is already torn down afterwards.
#[tokio::test]
async fn subject_that_never_listens_times_out_and_is_reaped() {
    let aggregate = tempfile::tempdir().unwrap();
    let mut config = stub_config(aggregate.path());
    config.server_config = json!({ "stub_exit_on_start": true });
    config.timeouts.connect_ms = 600;
    let mut instance = Instance::acquire(config).unwrap();

    match instance.start().await.unwrap_err() {
        AppError::ConnectTimeout { path, elapsed } => {
            assert!(path.ends_with("sock"), "{}", path.display());
            assert!(elapsed >= Duration::from_millis(600));
        }
        other => panic!("expected a connect timeout, got {other}"),
    }
    assert!(instance.is_terminated());
    assert_eq!(instance.results()[0].verdict, Verdict::Fail);

    let log = read_aggregate(aggregate.path(), AGGREGATE_TEST_LOG);
    assert!(log.contains("stub_exit_on_start is set"), "{log}");
}
