//! Unit tests for the supervisor: replica start, reload, crash respawn and
//! graceful stop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use prochive::models::{IdAllocator, SpawnReason, SpawnRequest, TemplateId};
use prochive::runtime::RELOAD_EXIT_CODE;
use prochive::supervisor::restart::RestartPolicy;
use prochive::supervisor::signal::ChildSignal;
use prochive::supervisor::{Supervisor, SupervisorOptions, SupervisorState};
use prochive::AppError;

use super::test_helpers::{worker, RecordingSignaller};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct Fixture {
    supervisor: Supervisor,
    signaller: Arc<RecordingSignaller>,
    spawns: mpsc::UnboundedReceiver<SpawnRequest>,
    web: TemplateId,
    cron: TemplateId,
}

/// `web`: 3 reloadable replicas; `cron`: 1 non-reloadable replica.
fn fixture(restart: RestartPolicy) -> Fixture {
    let signaller = Arc::new(RecordingSignaller::default());
    let (tx, spawns) = mpsc::unbounded_channel();
    let options = SupervisorOptions {
        stop_timeout: STOP_TIMEOUT,
        restart,
        ..SupervisorOptions::default()
    };
    let mut supervisor = Supervisor::new(signaller.clone(), tx, options);
    let mut ids = IdAllocator::new();
    let web = supervisor
        .register_worker(worker(&mut ids, "web", 3, true))
        .unwrap()
        .id;
    let cron = supervisor
        .register_worker(worker(&mut ids, "cron", 1, false))
        .unwrap()
        .id;
    Fixture {
        supervisor,
        signaller,
        spawns,
        web,
        cron,
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<SpawnRequest>) -> Vec<(TemplateId, SpawnReason)> {
    let mut out = Vec::new();
    while let Ok(request) = rx.try_recv() {
        out.push((request.kind.id(), request.reason));
    }
    out
}

/// Start the fixture and record pids 101..=103 for `web` and 201 for `cron`.
fn started(restart: RestartPolicy, now: Instant) -> Fixture {
    let mut fx = fixture(restart);
    fx.supervisor.start().expect("start");
    drain(&mut fx.spawns);
    for pid in 101..=103 {
        assert!(fx.supervisor.on_spawned(fx.web, pid, now));
    }
    assert!(fx.supervisor.on_spawned(fx.cron, 201, now));
    fx
}

// ── Start ───────────────────────────────────────────────────────────────────

#[test]
fn start_requests_every_replica() {
    let mut fx = fixture(RestartPolicy::default());
    fx.supervisor.start().expect("start");

    let requests = drain(&mut fx.spawns);
    assert_eq!(requests.len(), 4);
    assert_eq!(
        requests.iter().filter(|(id, _)| *id == fx.web).count(),
        3
    );
    assert!(requests.iter().all(|(_, r)| *r == SpawnReason::Initial));
    assert_eq!(fx.supervisor.state(), SupervisorState::Running);
}

#[test]
fn second_start_and_late_registration_fail() {
    let mut fx = fixture(RestartPolicy::default());
    fx.supervisor.start().expect("start");

    assert!(matches!(
        fx.supervisor.start(),
        Err(AppError::Supervision(_))
    ));
    let mut ids = IdAllocator::new();
    assert!(matches!(
        fx.supervisor.register_worker(worker(&mut ids, "late", 1, true)),
        Err(AppError::Config(_))
    ));
}

// ── Reload ──────────────────────────────────────────────────────────────────

#[test]
fn reload_signals_only_reloadable_children() {
    let mut fx = started(RestartPolicy::default(), Instant::now());

    let mut signalled = fx.supervisor.reload();
    signalled.sort_unstable();
    assert_eq!(signalled, vec![101, 102, 103]);
    assert_eq!(
        fx.signaller.pids_with(ChildSignal::Reload),
        signalled,
        "the non-reloadable replica must not be signalled"
    );
}

/// Every replica exiting with the reload code is replaced at once, and the
/// replica count returns to the configured value.
#[test]
fn reload_exits_are_replaced_immediately() {
    let now = Instant::now();
    let mut fx = started(RestartPolicy::default(), now);
    fx.supervisor.reload();

    for pid in 101..=103 {
        assert_eq!(
            fx.supervisor.on_child_exit(pid, Some(RELOAD_EXIT_CODE), now),
            Some(fx.web)
        );
    }
    let requests = drain(&mut fx.spawns);
    assert_eq!(requests, vec![(fx.web, SpawnReason::Reload); 3]);
    assert_eq!(fx.supervisor.pool().alive_pids_of(fx.web).len(), 0);

    for pid in 301..=303 {
        fx.supervisor.on_spawned(fx.web, pid, now);
    }
    assert_eq!(fx.supervisor.pool().alive_pids_of(fx.web), vec![301, 302, 303]);
    assert_eq!(fx.supervisor.pool().process_count(), 4);
}

/// A detached replica runs a foreign program: reload terminates it, and its
/// signal death is replaced at once on every reload without backoff.
#[test]
fn detached_replica_reloads_without_backoff() {
    let now = Instant::now();
    let mut fx = started(RestartPolicy::default(), now);
    let mut pid = 101;
    assert!(fx.supervisor.on_detached(pid));

    for round in 0..8u32 {
        let at = now + Duration::from_secs(u64::from(round));
        assert!(fx.supervisor.reload().contains(&pid));
        assert!(fx.signaller.sent().contains(&(pid, ChildSignal::Terminate)));
        assert!(!fx.signaller.pids_with(ChildSignal::Reload).contains(&pid));

        assert_eq!(fx.supervisor.on_child_exit(pid, None, at), Some(fx.web));
        let requests = drain(&mut fx.spawns);
        assert!(requests.contains(&(fx.web, SpawnReason::Reload)), "round {round}");
        assert!(!requests.contains(&(fx.web, SpawnReason::Crash)));

        pid = 500 + round;
        fx.supervisor.on_spawned(fx.web, pid, at);
        fx.supervisor.on_detached(pid);
    }
    assert_eq!(fx.supervisor.due_respawns(now + Duration::from_secs(600)), 0);
    assert_eq!(fx.supervisor.pool().alive_pids_of(fx.web).len(), 3);
}

/// A crash after a reload was already handled goes through the guard again.
#[test]
fn reload_marker_is_consumed_by_one_exit() {
    let now = Instant::now();
    let mut fx = started(RestartPolicy::default(), now);
    fx.supervisor.reload();
    fx.supervisor.on_child_exit(101, Some(RELOAD_EXIT_CODE), now);
    fx.supervisor.on_spawned(fx.web, 301, now);
    drain(&mut fx.spawns);

    fx.supervisor.on_child_exit(301, Some(1), now);
    assert!(drain(&mut fx.spawns).is_empty(), "crash respawn must be delayed");
    assert_eq!(fx.supervisor.due_respawns(now + Duration::from_secs(1)), 1);
}

// ── Crash respawn ───────────────────────────────────────────────────────────

#[test]
fn crash_respawn_waits_for_backoff() {
    let now = Instant::now();
    let mut fx = started(RestartPolicy::default(), now);

    fx.supervisor.on_child_exit(101, Some(1), now);
    assert!(drain(&mut fx.spawns).is_empty(), "crash respawn must be delayed");
    assert_eq!(fx.supervisor.due_respawns(now + Duration::from_millis(999)), 0);
    assert_eq!(fx.supervisor.due_respawns(now + Duration::from_secs(1)), 1);
    assert_eq!(drain(&mut fx.spawns), vec![(fx.web, SpawnReason::Crash)]);
}

#[test]
fn crash_loop_leaves_template_degraded() {
    let policy = RestartPolicy {
        max_restarts: 2,
        window: Duration::from_secs(60),
        backoff_first: Duration::from_secs(1),
        backoff_max: Duration::from_secs(30),
    };
    let t0 = Instant::now();
    let mut fx = started(policy, t0);

    fx.supervisor.on_child_exit(201, None, t0);
    assert_eq!(fx.supervisor.due_respawns(t0 + Duration::from_secs(1)), 1);
    fx.supervisor
        .on_spawned(fx.cron, 202, t0 + Duration::from_secs(1));

    fx.supervisor
        .on_child_exit(202, Some(2), t0 + Duration::from_secs(2));
    assert_eq!(fx.supervisor.due_respawns(t0 + Duration::from_secs(4)), 1);
    fx.supervisor
        .on_spawned(fx.cron, 203, t0 + Duration::from_secs(4));

    fx.supervisor
        .on_child_exit(203, Some(2), t0 + Duration::from_secs(5));
    assert_eq!(fx.supervisor.due_respawns(t0 + Duration::from_secs(100)), 0);
    assert!(fx.supervisor.pool().alive_pids_of(fx.cron).is_empty());
}

#[test]
fn unknown_pid_exit_is_ignored() {
    let now = Instant::now();
    let mut fx = started(RestartPolicy::default(), now);
    assert_eq!(fx.supervisor.on_child_exit(9999, Some(1), now), None);
    assert!(drain(&mut fx.spawns).is_empty());
}

// ── Stop ────────────────────────────────────────────────────────────────────

#[test]
fn stop_terminates_then_kills_once() {
    let now = Instant::now();
    let mut fx = started(RestartPolicy::default(), now);

    fx.supervisor.stop(now);
    fx.supervisor.stop(now);
    assert_eq!(fx.signaller.pids_with(ChildSignal::Terminate).len(), 4);

    assert!(fx
        .supervisor
        .sweep(now + STOP_TIMEOUT - Duration::from_millis(1))
        .is_empty());

    fx.supervisor.on_child_exit(101, Some(0), now);
    let mut killed = fx.supervisor.sweep(now + STOP_TIMEOUT);
    killed.sort_unstable();
    assert_eq!(killed, vec![102, 103, 201]);
    assert!(fx.supervisor.sweep(now + STOP_TIMEOUT * 2).is_empty());
    assert_eq!(fx.signaller.pids_with(ChildSignal::Kill).len(), 3);
}

#[test]
fn exits_during_stop_are_not_replaced() {
    let now = Instant::now();
    let mut fx = started(RestartPolicy::default(), now);
    fx.supervisor.stop(now);

    fx.supervisor.on_child_exit(101, Some(RELOAD_EXIT_CODE), now);
    fx.supervisor.on_child_exit(102, Some(1), now);
    fx.supervisor.on_child_exit(103, None, now);
    assert!(!fx.supervisor.is_stopped());
    fx.supervisor.on_child_exit(201, Some(0), now);

    assert!(drain(&mut fx.spawns).is_empty());
    assert_eq!(fx.supervisor.due_respawns(now + Duration::from_secs(60)), 0);
    assert!(fx.supervisor.is_stopped());
    assert!(fx.supervisor.reload().is_empty());
}

#[test]
fn child_spawned_after_stop_is_terminated() {
    let now = Instant::now();
    let mut fx = started(RestartPolicy::default(), now);
    fx.supervisor.stop(now);

    fx.supervisor.on_spawned(fx.web, 400, now);
    assert!(fx
        .signaller
        .sent()
        .contains(&(400, ChildSignal::Terminate)));
}
