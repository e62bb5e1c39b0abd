//! Integration tests for teardown escalation and out-of-band death.

use std::time::{Duration, Instant};

use managed_instance::process::termination::AGGREGATE_TEST_LOG;
use managed_instance::process::{ProcState, ProcessSignal};
use managed_instance::report::Verdict;
use managed_instance::Instance;

use super::test_helpers::{await_gone, probe, read_aggregate, stub_config};

/// A subject ignoring both `shutdown-server` and SIGTERM is killed.
#[tokio::test]
async fn stubborn_subject_is_escalated_to_sigkill() {
    let aggregate = tempfile::tempdir().unwrap();
    let mut config = stub_config(aggregate.path());
    config.timeouts.terminate_ms = 500;
    let mut instance = Instance::acquire(config).unwrap();
    let pid = instance.get_pid().await.unwrap();
    instance.request(&["ignore-shutdown"]).await.unwrap();

    let started = Instant::now();
    instance.terminate().await.expect("SIGKILL succeeds");
    assert!(
        started.elapsed() >= Duration::from_millis(1_000),
        "both graceful phases must wait out their deadline"
    );
    assert_eq!(probe(pid).await, ProcState::Gone);
    assert_eq!(instance.results()[0].verdict, Verdict::Pass);

    let log = read_aggregate(aggregate.path(), AGGREGATE_TEST_LOG);
    assert!(log.contains("ignoring shutdown-server"), "{log}");
    assert!(log.contains("ignoring SIGTERM"), "{log}");
}

#[tokio::test]
async fn crashed_subject_fails_the_health_check() {
    let aggregate = tempfile::tempdir().unwrap();
    let mut instance = Instance::acquire(stub_config(aggregate.path())).unwrap();
    let pid = instance.get_pid().await.unwrap();

    let reply = instance.request(&["crash"]).await.unwrap();
    assert!(reply.is_connection_lost());
    await_gone(pid).await;

    instance.terminate().await.expect("teardown of a dead subject is clean");
    let health = &instance.results()[0];
    assert_eq!(health.verdict, Verdict::Fail);
    assert!(health.detail.contains("exited before teardown"), "{}", health.detail);

    let log = read_aggregate(aggregate.path(), AGGREGATE_TEST_LOG);
    assert!(log.contains("=== output from "), "{log}");
    assert!(log.contains("crash requested"), "{log}");
}

/// Killing the subject while a request is blocked on it ends the request
/// with `ConnectionLost` rather than a hang.
#[tokio::test]
async fn out_of_band_kill_releases_an_in_flight_request() {
    let aggregate = tempfile::tempdir().unwrap();
    let mut instance = Instance::acquire(stub_config(aggregate.path())).unwrap();
    let pid = instance.get_pid().await.unwrap();
    instance.suspend().await.unwrap();
    let signaller = instance.signaller().expect("started");

    let pending = tokio::spawn(async move {
        let reply = instance.request(&["get-pid"]).await;
        (instance, reply)
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    signaller.send(ProcessSignal::Kill).expect("SIGKILL delivered");

    let (mut instance, reply) = pending.await.unwrap();
    assert!(reply.unwrap().is_connection_lost());
    await_gone(pid).await;

    instance.terminate().await.unwrap();
    assert_eq!(instance.results()[0].verdict, Verdict::Fail);
}

#[tokio::test]
async fn terminating_an_unstarted_instance_records_nothing() {
    let aggregate = tempfile::tempdir().unwrap();
    let mut instance = Instance::acquire(stub_config(aggregate.path())).unwrap();
    instance.terminate().await.unwrap();
    assert!(instance.is_terminated());
    assert!(instance.results().is_empty());
}
