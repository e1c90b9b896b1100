//! Tests for the container lifecycle service.
//!
//! Runs the Handle/Commit protocol against the in-memory backend:
//! - Optimistic concurrency between handles staged from the same snapshot
//! - Start reporting and stop escalation (paused clock)
//! - Fault policy for hard power off
//! - Registry, waiters, removal, signals, logs, pending handles

use std::sync::Arc;
use std::time::Duration;

use magikcell::backend::memory::{GuestBehavior, MemoryBackend};
use magikcell::backend::{Backend, Fault, FaultMessage, PowerState};
use magikcell::constants::VM_NOT_SUSPENDED_KEY;
use magikcell::exec::task;
use magikcell::{
    Cause, Config, CreateConfig, Error, Exec, Operation, Signal, State,
};
use tokio::io::AsyncReadExt;
use tokio::time::Instant;

fn web() -> CreateConfig {
    CreateConfig {
        name: "web".into(),
        path: "/bin/web".into(),
        args: vec!["--port".into(), "80".into()],
        ..Default::default()
    }
}

fn service(backend: &Arc<MemoryBackend>) -> Exec {
    Exec::new(backend.clone(), &Config::default())
}

async fn commit_new(exec: &Exec, create: CreateConfig, target: Option<State>) -> String {
    let op = Operation::new("create");
    let mut handle = exec.create(&op, create).unwrap();
    if let Some(target) = target {
        handle.set_target_state(target);
    }
    let id = handle.id().to_string();
    handle.commit(&op, exec, None).await.unwrap();
    id
}

async fn set_state(exec: &Exec, id: &str, target: State) -> magikcell::Result<()> {
    let op = Operation::new("set state");
    let mut handle = exec.get_container(&op, id).unwrap();
    handle.set_target_state(target);
    handle.commit(&op, exec, None).await
}

fn state(exec: &Exec, id: &str) -> State {
    exec.container(id).unwrap().current_state()
}

// =============================================================================
// Create
// =============================================================================

#[tokio::test]
async fn test_create_registers_created_container() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), None).await;

    assert_eq!(id.len(), 32);
    assert_eq!(state(&exec, &id), State::Created);
    assert_eq!(backend.len(), 1);

    let container = exec.container(&id).unwrap();
    let primary = container.exec_config().primary_session().unwrap();
    assert_eq!(primary.cmd.args, vec!["/bin/web", "--port", "80"]);
}

#[tokio::test]
async fn test_create_and_start_in_one_commit() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), Some(State::Running)).await;

    assert_eq!(state(&exec, &id), State::Running);
    assert_eq!(
        backend.vm(&id).unwrap().power_state(),
        PowerState::PoweredOn
    );
}

#[tokio::test]
async fn test_create_rejects_invalid_config() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let err = exec
        .create(&Operation::new("bad"), CreateConfig::default())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_cancelled_operation_aborts_commit() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let handle = exec.create(&Operation::new("stage"), web()).unwrap();
    let op = Operation::new("cancelled");
    op.cancel();

    let err = handle.commit(&op, &exec, None).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Cancelled {
            cause: Cause::Cancelled,
            ..
        }
    ));
    assert!(backend.is_empty());
}

// =============================================================================
// Optimistic Concurrency
// =============================================================================

#[tokio::test]
async fn test_stale_handle_is_rejected_after_version_advances() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), None).await;
    let op = Operation::new("race");

    let v1 = exec.container(&id).unwrap().version().unwrap().to_string();
    let mut first = exec.get_container(&op, &id).unwrap();
    let mut second = exec.get_container(&op, &id).unwrap();

    first.set_target_state(State::Running);
    first.commit(&op, &exec, None).await.unwrap();
    let v2 = exec.container(&id).unwrap().version().unwrap().to_string();
    assert_ne!(v1, v2);

    second.set_target_state(State::Running);
    let err = second.commit(&op, &exec, None).await.unwrap_err();
    assert!(matches!(err, Error::ConcurrentAccess { .. }));
    assert!(err.is_conflict());
}

#[tokio::test]
async fn test_second_noop_commit_from_same_base_is_rejected() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), None).await;
    let op = Operation::new("noop");

    let first = exec.get_container(&op, &id).unwrap();
    let second = exec.get_container(&op, &id).unwrap();
    first.commit(&op, &exec, None).await.unwrap();
    assert!(matches!(
        second.commit(&op, &exec, None).await,
        Err(Error::ConcurrentAccess { .. })
    ));

    // A handle staged afterwards starts from the current snapshot.
    let third = exec.get_container(&op, &id).unwrap();
    third.commit(&op, &exec, None).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_commits_exactly_one_wins() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), None).await;
    let op = Operation::new("concurrent");

    let mut first = exec.get_container(&op, &id).unwrap();
    let mut second = exec.get_container(&op, &id).unwrap();
    first.set_target_state(State::Running);
    second.set_target_state(State::Running);

    let (a, b) = tokio::join!(first.commit(&op, &exec, None), second.commit(&op, &exec, None));
    let wins = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1, "results: {a:?} / {b:?}");
    let loser = if a.is_err() { a } else { b };
    assert!(matches!(loser, Err(Error::ConcurrentAccess { .. })));
    assert_eq!(state(&exec, &id), State::Running);
}

#[tokio::test]
async fn test_out_of_band_change_rejects_handle() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), None).await;

    let mut handle = exec.get_container(&Operation::new("oob"), &id).unwrap();
    backend.vm(&id).unwrap().touch();
    handle.reload();
    assert!(matches!(
        handle.commit(&Operation::new("commit"), &exec, None).await,
        Err(Error::ConcurrentAccess { .. })
    ));
}

// =============================================================================
// State Machine
// =============================================================================

#[tokio::test]
async fn test_start_stop_start() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), Some(State::Running)).await;

    set_state(&exec, &id, State::Stopped).await.unwrap();
    assert_eq!(state(&exec, &id), State::Stopped);
    assert_eq!(backend.vm(&id).unwrap().signals(), vec!["TERM"]);

    set_state(&exec, &id, State::Running).await.unwrap();
    assert_eq!(state(&exec, &id), State::Running);
}

#[tokio::test]
async fn test_stop_on_created_is_noop() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), None).await;

    set_state(&exec, &id, State::Stopped).await.unwrap();
    assert_eq!(state(&exec, &id), State::Created);
    assert!(backend.vm(&id).unwrap().signals().is_empty());
}

#[tokio::test]
async fn test_created_target_after_start_is_invalid() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), Some(State::Running)).await;

    let err = set_state(&exec, &id, State::Created).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { ref from, .. } if from == "RUNNING"));
    assert_eq!(state(&exec, &id), State::Running);
}

#[tokio::test]
async fn test_duplicate_start_is_dropped() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), Some(State::Running)).await;
    let before = backend.vm(&id).unwrap().version();

    set_state(&exec, &id, State::Running).await.unwrap();
    assert_eq!(backend.vm(&id).unwrap().version(), before);
    assert_eq!(state(&exec, &id), State::Running);
}

#[tokio::test]
async fn test_target_state_parsing() {
    assert_eq!("running".parse::<State>().unwrap(), State::Running);
    assert!(matches!(
        "PAUSED".parse::<State>(),
        Err(Error::InvalidState(_))
    ));
}

// =============================================================================
// Start Reporting
// =============================================================================

#[tokio::test]
async fn test_start_failure_carries_guest_detail() {
    let backend = Arc::new(MemoryBackend::with_guest(GuestBehavior {
        start_detail: Some("exec format error".into()),
        ..GuestBehavior::default()
    }));
    let exec = service(&backend);
    let id = commit_new(&exec, web(), None).await;

    let err = set_state(&exec, &id, State::Running).await.unwrap_err();
    match err {
        Error::StartFailed { reason, .. } => assert_eq!(reason, "exec format error"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_start_without_report_times_out() {
    let backend = Arc::new(MemoryBackend::with_guest(GuestBehavior {
        start_detail: None,
        ..GuestBehavior::default()
    }));
    let exec = service(&backend);
    let id = commit_new(&exec, web(), None).await;

    let started = Instant::now();
    let err = set_state(&exec, &id, State::Running).await.unwrap_err();
    assert!(started.elapsed() >= Config::default().start_report_timeout());
    assert!(
        matches!(err, Error::StartFailed { ref reason, .. } if reason.contains("unable to wait for process launch status"))
    );
}

// =============================================================================
// Stop Escalation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_stop_escalates_then_hard_powers_off() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), Some(State::Running)).await;
    let vm = backend.vm(&id).unwrap();
    vm.set_guest(GuestBehavior::stubborn());

    let started = Instant::now();
    set_state(&exec, &id, State::Stopped).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(20));
    assert_eq!(vm.signals(), vec!["TERM", "KILL"]);
    assert_eq!(vm.power_state(), PowerState::PoweredOff);
    assert_eq!(state(&exec, &id), State::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_stop_uses_configured_signal_and_wait() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let create = CreateConfig {
        stop_signal: "SIGINT".into(),
        ..web()
    };
    let id = commit_new(&exec, create, Some(State::Running)).await;

    let mut handle = exec.get_container(&Operation::new("stop"), &id).unwrap();
    handle.set_target_state(State::Stopped);
    let started = Instant::now();
    handle
        .commit(&Operation::new("commit"), &exec, Some(Duration::from_secs(2)))
        .await
        .unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(10));
    assert_eq!(backend.vm(&id).unwrap().signals(), vec!["INT", "KILL"]);
    assert_eq!(state(&exec, &id), State::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_hard_power_off_failure_is_reported() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), Some(State::Running)).await;
    backend.vm(&id).unwrap().set_guest(GuestBehavior {
        power_off_fault: Some(Fault::Other("disk locked".into())),
        ..GuestBehavior::stubborn()
    });

    let err = set_state(&exec, &id, State::Stopped).await.unwrap_err();
    assert!(matches!(err, Error::StopFailed { ref reason, .. } if reason.contains("disk locked")));
    assert_eq!(state(&exec, &id), State::Running);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_guest_shutdown_is_benign() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), Some(State::Running)).await;
    backend.vm(&id).unwrap().set_guest(GuestBehavior {
        power_off_fault: Some(Fault::GenericVmConfig {
            messages: vec![FaultMessage {
                key: VM_NOT_SUSPENDED_KEY.into(),
                message: "The virtual machine is not suspended".into(),
            }],
        }),
        shutdown_during_power_off: true,
        ..GuestBehavior::stubborn()
    });

    set_state(&exec, &id, State::Stopped).await.unwrap();
    assert_eq!(state(&exec, &id), State::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_already_powered_off_is_benign() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), Some(State::Running)).await;
    backend.vm(&id).unwrap().set_guest(GuestBehavior {
        power_off_fault: Some(Fault::InvalidPowerState {
            existing: PowerState::PoweredOff,
        }),
        shutdown_during_power_off: true,
        ..GuestBehavior::stubborn()
    });

    set_state(&exec, &id, State::Stopped).await.unwrap();
    assert_eq!(state(&exec, &id), State::Stopped);
}

// =============================================================================
// Reconfigure / Tasks
// =============================================================================

#[tokio::test]
async fn test_unbind_is_written_on_commit() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), None).await;

    let mut handle = exec.get_container(&Operation::new("unbind"), &id).unwrap();
    task::unbind(&mut handle, &id).unwrap();
    handle.commit(&Operation::new("commit"), &exec, None).await.unwrap();

    let stored = backend.vm(&id).unwrap().snapshot().exec_config;
    assert!(!stored.sessions[&id].active);
    assert!(!exec.container(&id).unwrap().exec_config().sessions[&id].active);
}

#[tokio::test]
async fn test_join_while_running_is_ephemeral() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), Some(State::Running)).await;

    let mut handle = exec.get_container(&Operation::new("exec"), &id).unwrap();
    task::join(
        &mut handle,
        magikcell::SessionConfig {
            id: "shell".into(),
            active: true,
            ..Default::default()
        },
    )
    .unwrap();
    handle.commit(&Operation::new("commit"), &exec, None).await.unwrap();

    let stored = backend.vm(&id).unwrap().snapshot().exec_config;
    assert!(stored.execs.contains_key("shell"));
    assert!(!stored.sessions.contains_key("shell"));
}

// =============================================================================
// Registry and Waiters
// =============================================================================

#[tokio::test]
async fn test_waiter_wakes_on_commit() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = Arc::new(service(&backend));
    let id = commit_new(&exec, web(), None).await;

    let container = exec.container(&id).unwrap();
    let waiter = tokio::spawn(async move { container.wait_for_state(State::Running).await });
    tokio::task::yield_now().await;

    set_state(&exec, &id, State::Running).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter should wake")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_waiter_resolves_immediately_when_already_there() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), None).await;
    exec.container(&id)
        .unwrap()
        .wait_for_state(State::Created)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_containers_filter_by_state() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let created = commit_new(&exec, web(), None).await;
    let running = commit_new(&exec, web(), Some(State::Running)).await;

    let ids = |s| {
        exec.containers()
            .containers(Some(s))
            .iter()
            .map(|c| c.id().to_string())
            .collect::<Vec<_>>()
    };
    assert_eq!(ids(State::Created), vec![created]);
    assert_eq!(ids(State::Running), vec![running]);
    assert_eq!(exec.containers().containers(None).len(), 2);
}

// =============================================================================
// Remove
// =============================================================================

#[tokio::test]
async fn test_remove_running_is_rejected() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), Some(State::Running)).await;

    let err = exec
        .container(&id)
        .unwrap()
        .remove(&Operation::new("rm"), &exec)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RemovePower { .. }));
    assert!(err.is_conflict());
    assert!(exec.container(&id).is_some());
}

#[tokio::test]
async fn test_remove_stopped_container() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), Some(State::Running)).await;
    set_state(&exec, &id, State::Stopped).await.unwrap();

    let container = exec.container(&id).unwrap();
    container.remove(&Operation::new("rm"), &exec).await.unwrap();

    assert!(exec.container(&id).is_none());
    assert!(backend.is_empty());
    assert!(matches!(
        container.wait_for_state(State::Running).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_remove_vanished_vm_is_not_found() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), None).await;
    let vm = backend.find_vm(&id).await.unwrap().unwrap();
    vm.destroy().await.unwrap();

    let err = exec
        .container(&id)
        .unwrap()
        .remove(&Operation::new("rm"), &exec)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(exec.container(&id).is_none());
}

#[tokio::test]
async fn test_commit_on_vanished_vm_is_not_yet_exist() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), None).await;
    let handle = exec.get_container(&Operation::new("gone"), &id).unwrap();
    backend.find_vm(&id).await.unwrap().unwrap().destroy().await.unwrap();

    assert!(matches!(
        handle.commit(&Operation::new("commit"), &exec, None).await,
        Err(Error::NotYetExist { .. })
    ));
}

// =============================================================================
// Signals and Logs
// =============================================================================

#[tokio::test]
async fn test_signal_reaches_guest() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), Some(State::Running)).await;

    exec.container(&id)
        .unwrap()
        .signal(&Operation::new("sig"), Signal::Usr1)
        .await
        .unwrap();
    assert_eq!(backend.vm(&id).unwrap().signals(), vec!["USR1"]);
    assert_eq!(backend.vm(&id).unwrap().power_state(), PowerState::PoweredOn);
}

#[tokio::test]
async fn test_signal_to_stopped_container_fails() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), None).await;

    let err = exec
        .container(&id)
        .unwrap()
        .signal(&Operation::new("sig"), Signal::Hup)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SignalFailed { .. }));
}

#[tokio::test]
async fn test_log_tail() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), None).await;
    backend.vm(&id).unwrap().append_log(b"l1\nl2\nl3\n");

    let mut reader = exec
        .container(&id)
        .unwrap()
        .log_reader(&Operation::new("logs"), Some(2), false)
        .await
        .unwrap();
    let mut out = String::new();
    reader.read_to_string(&mut out).await.unwrap();
    assert_eq!(out, "l2\nl3\n");
}

#[tokio::test]
async fn test_log_follow_until_exit() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let id = commit_new(&exec, web(), Some(State::Running)).await;
    let vm = backend.vm(&id).unwrap();
    vm.append_log(b"l1\n");

    let mut reader = exec
        .container(&id)
        .unwrap()
        .log_reader(&Operation::new("logs"), None, true)
        .await
        .unwrap();
    tokio::spawn(async move {
        vm.append_log(b"l2\n");
        vm.guest_shutdown();
    });

    let mut out = String::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_to_string(&mut out))
        .await
        .expect("log stream should end when the container exits")
        .unwrap();
    assert_eq!(out, "l1\nl2\n");
}

// =============================================================================
// Pending Handles
// =============================================================================

#[tokio::test]
async fn test_stash_and_get_handle() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let handle = exec.create(&Operation::new("stash"), web()).unwrap();
    let id = handle.id().to_string();

    let reference = exec.stash(handle);
    let mut handle = exec.get_handle(&reference).unwrap();
    assert!(exec.get_handle(&reference).is_none());

    handle.set_target_state(State::Running);
    handle.commit(&Operation::new("commit"), &exec, None).await.unwrap();
    assert_eq!(state(&exec, &id), State::Running);
}

#[tokio::test(start_paused = true)]
async fn test_stashed_handle_outlives_staging_deadline() {
    let backend = Arc::new(MemoryBackend::new());
    let exec = service(&backend);
    let staging = Operation::new("request 1").with_timeout(Duration::from_secs(1));
    let handle = exec.create(&staging, web()).unwrap();
    let id = handle.id().to_string();
    let reference = exec.stash(handle);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(staging.err().is_some());

    let mut handle = exec.get_handle(&reference).unwrap();
    handle.set_target_state(State::Running);
    handle
        .commit(&Operation::new("request 2"), &exec, None)
        .await
        .expect("commit should run under the committing caller's operation");
    assert_eq!(state(&exec, &id), State::Running);
}

#[tokio::test(start_paused = true)]
async fn test_stashed_handle_expires() {
    let backend = Arc::new(MemoryBackend::new());
    let config = Config {
        handle_ttl_secs: 60,
        ..Config::default()
    };
    let exec = Exec::new(backend.clone(), &config);
    let reference = exec.stash(exec.create(&Operation::new("ttl"), web()).unwrap());

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(exec.get_handle(&reference).is_none());
}

#[tokio::test]
async fn test_pending_handles_are_bounded() {
    let backend = Arc::new(MemoryBackend::new());
    let config = Config {
        max_pending_handles: 3,
        ..Config::default()
    };
    let exec = Exec::new(backend.clone(), &config);
    for _ in 0..5 {
        exec.stash(exec.create(&Operation::new("cap"), web()).unwrap());
    }
    assert_eq!(exec.handles().len(), 3);
}
