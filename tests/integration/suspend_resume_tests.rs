//! Integration tests for confirmed SIGSTOP/SIGCONT handling.

use std::time::Duration;

use managed_instance::process::{LifecycleState, ProcState};
use managed_instance::{AppError, Instance, Reply};

use super::test_helpers::{probe, stub_config};

#[tokio::test]
async fn suspend_is_confirmed_by_the_process_state() {
    let aggregate = tempfile::tempdir().unwrap();
    let mut instance = Instance::acquire(stub_config(aggregate.path())).unwrap();
    let pid = instance.get_pid().await.unwrap();

    instance.suspend().await.expect("suspend");
    assert_eq!(probe(pid).await, ProcState::Stopped);
    assert_eq!(
        instance.signaller().unwrap().lifecycle(),
        LifecycleState::Suspended
    );

    instance.resume().await.expect("resume");
    assert_ne!(probe(pid).await, ProcState::Stopped);
    assert_eq!(instance.get_pid().await.unwrap(), pid);

    instance.terminate().await.unwrap();
}

/// A request sent to a stopped subject is answered only after resume.
#[tokio::test]
async fn request_blocks_while_suspended() {
    let aggregate = tempfile::tempdir().unwrap();
    let mut instance = Instance::acquire(stub_config(aggregate.path())).unwrap();
    instance.get_pid().await.unwrap();
    instance.suspend().await.unwrap();
    let signaller = instance.signaller().expect("started");

    let pending = tokio::spawn(async move {
        let reply = instance.request(&["version"]).await;
        (instance, reply)
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!pending.is_finished(), "a stopped subject cannot answer");

    signaller.resume().await.expect("resume from another task");
    let (mut instance, reply) = pending.await.unwrap();
    let Reply::Response(answer) = reply.unwrap() else {
        panic!("expected an answer after resume");
    };
    assert!(answer.get("version").is_some());

    instance.terminate().await.unwrap();
    assert_eq!(instance.results()[0].name, "instance health");
}

#[tokio::test]
async fn terminate_resumes_a_suspended_subject_first() {
    let aggregate = tempfile::tempdir().unwrap();
    let mut instance = Instance::acquire(stub_config(aggregate.path())).unwrap();
    let pid = instance.get_pid().await.unwrap();
    instance.suspend().await.unwrap();

    instance.terminate().await.expect("teardown of a stopped subject");
    assert_eq!(probe(pid).await, ProcState::Gone);
    assert_eq!(
        instance.signaller().unwrap().lifecycle(),
        LifecycleState::Terminated
    );
}

#[tokio::test]
async fn suspend_before_start_is_not_running() {
    let aggregate = tempfile::tempdir().unwrap();
    let mut instance = Instance::acquire(stub_config(aggregate.path())).unwrap();
    let err = instance.suspend().await.unwrap_err();
    assert!(matches!(err, AppError::NotRunning(_)), "unexpected error: {err}");
}

#[tokio::test]
async fn suspend_after_terminate_is_not_running() {
    let aggregate = tempfile::tempdir().unwrap();
    let mut instance = Instance::acquire(stub_config(aggregate.path())).unwrap();
    instance.get_pid().await.unwrap();
    instance.terminate().await.unwrap();

    assert!(matches!(instance.suspend().await, Err(AppError::NotRunning(_))));
    assert!(matches!(instance.resume().await, Err(AppError::NotRunning(_))));
}

/// A subject that died on its own cannot be suspended.
#[tokio::test]
async fn suspend_after_crash_is_not_running() {
    let aggregate = tempfile::tempdir().unwrap();
    let mut instance = Instance::acquire(stub_config(aggregate.path())).unwrap();
    instance.get_pid().await.unwrap();

    let reply = instance.request(&["crash"]).await.unwrap();
    assert!(reply.is_connection_lost());
    assert!(matches!(instance.suspend().await, Err(AppError::NotRunning(_))));

    instance.terminate().await.unwrap();
}
