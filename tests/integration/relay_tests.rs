//! Integration tests for control queries over the FIFO relay.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serial_test::serial;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use prochive::bus::message::ProcessSpawned;
use prochive::bus::BusClient;
use prochive::master::paths::RunPaths;
use prochive::master::pidfile::write_pid;
use prochive::master::{MasterOptions, MasterProcess};
use prochive::models::{IdAllocator, RoleKind, WorkerSpec, WorkerTemplate};
use prochive::relay::client::{QueryOutcome, RelayClient, SchedulerQuery, StatusQuery};
use prochive::relay::{create_fifo, spawn_relay, RelayResponse};
use prochive::supervisor::signal::NixSignaller;
use prochive::supervisor::SupervisorOptions;
use prochive::AppError;

use super::test_helpers::{wait_until, SleepLauncher};

fn paths_in(dir: &Path) -> RunPaths {
    RunPaths::resolve(Path::new("/opt/app/server"), Some(&dir.join("master.pid")))
}

#[test]
fn missing_pid_file_means_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let client = RelayClient::new(paths_in(dir.path()), Duration::from_secs(5));

    let started = Instant::now();
    let outcome = client.query::<StatusQuery>().unwrap();
    assert!(matches!(outcome, QueryOutcome::NotRunning));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn live_master_without_fifos_means_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    write_pid(&paths.pid_file, std::process::id()).unwrap();

    let client = RelayClient::new(paths, Duration::from_secs(5));
    assert!(matches!(
        client.query::<SchedulerQuery>().unwrap(),
        QueryOutcome::NotRunning
    ));
}

/// Relay endpoint that answers every query with an empty task list after
/// `delay`.
fn answering_relay(paths: &RunPaths, delay: Duration) -> CancellationToken {
    write_pid(&paths.pid_file, std::process::id()).unwrap();
    create_fifo(&paths.rx_fifo).unwrap();
    create_fifo(&paths.tx_fifo).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let ct = CancellationToken::new();
    spawn_relay(&paths.rx_fifo, &paths.tx_fifo, tx, ct.clone()).unwrap();
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            tokio::time::sleep(delay).await;
            let _ = envelope.reply.send(RelayResponse::Scheduler(Vec::new()));
        }
    });
    ct
}

#[tokio::test]
async fn concurrent_clients_each_get_their_answer() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    let ct = answering_relay(&paths, Duration::from_millis(50));

    let queries: Vec<_> = (0..4)
        .map(|_| {
            let client = RelayClient::new(paths.clone(), Duration::from_secs(5));
            tokio::task::spawn_blocking(move || client.query::<SchedulerQuery>())
        })
        .collect();
    for query in queries {
        let outcome = query.await.unwrap().expect("every client is answered");
        assert!(matches!(outcome, QueryOutcome::Answered(ref t) if t.is_empty()));
    }
    ct.cancel();
}

/// A client that gave up leaves its answer in the pipe; the next client
/// discards it and still gets its own.
#[tokio::test]
async fn abandoned_answer_is_discarded_by_the_next_client() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    let ct = answering_relay(&paths, Duration::from_millis(300));

    let impatient = RelayClient::new(paths.clone(), Duration::from_millis(50));
    let err = tokio::task::spawn_blocking(move || impatient.query::<SchedulerQuery>())
        .await
        .unwrap()
        .expect_err("answer arrives too late");
    assert!(matches!(err, AppError::Transport(_)));
    tokio::time::sleep(Duration::from_millis(500)).await;

    let patient = RelayClient::new(paths.clone(), Duration::from_secs(5));
    let outcome = tokio::task::spawn_blocking(move || patient.query::<SchedulerQuery>())
        .await
        .unwrap()
        .expect("fresh answer");
    assert!(matches!(outcome, QueryOutcome::Answered(_)));
    ct.cancel();
}

fn worker_template(ids: &mut IdAllocator, spec: WorkerSpec) -> WorkerTemplate {
    WorkerTemplate::from_spec(spec, ids).expect("valid worker spec")
}

/// A running master answers status queries from reports its workers sent
/// over the bus, then removes its run-time files on shutdown.
#[tokio::test]
#[serial]
async fn master_answers_status_queries() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    let mut ids = IdAllocator::new();
    let workers = vec![
        worker_template(&mut ids, WorkerSpec::new("web").count(3)),
        worker_template(&mut ids, WorkerSpec::new("queue").count(2).reloadable(false)),
    ];

    let workers_web = workers[0].id;
    let launcher = SleepLauncher::default();
    let launched = Arc::clone(&launcher.launched);
    let master = MasterProcess::new(
        MasterOptions {
            paths: paths.clone(),
            supervisor: SupervisorOptions {
                stop_timeout: Duration::from_secs(2),
                ..SupervisorOptions::default()
            },
            shutdown_timeout: Some(Duration::from_secs(10)),
        },
        workers,
        Vec::new(),
        Vec::new(),
        Box::new(launcher),
        Arc::new(NixSignaller),
    )
    .unwrap();
    let handle = master.handle();

    let driver = async {
        wait_until("five workers", || launched.lock().unwrap().len() == 5).await;

        let bus = BusClient::connect(&paths.socket).await.expect("bus is up");
        let children = launched.lock().unwrap().clone();
        for (role, pid) in children {
            bus.dispatch(ProcessSpawned {
                template_id: role.id,
                kind: role.kind,
                pid,
                user: "tester".into(),
                name: "worker".into(),
                reloadable: true,
                started_at: Utc::now(),
            })
            .await
            .expect("spawn report acknowledged");
        }

        // A worker reaped before its announcement is handled leaves no record.
        bus.dispatch(ProcessSpawned {
            template_id: workers_web,
            kind: RoleKind::Worker,
            pid: u32::MAX,
            user: "tester".into(),
            name: "web".into(),
            reloadable: true,
            started_at: Utc::now(),
        })
        .await
        .expect("late announcement acknowledged");

        let client = RelayClient::new(paths.clone(), Duration::from_secs(5));
        let relay = client.clone();
        let status = tokio::task::spawn_blocking(move || relay.query::<StatusQuery>())
            .await
            .unwrap()
            .expect("status query");
        let QueryOutcome::Answered(status) = status else {
            panic!("master should be reachable");
        };
        assert!(status.is_running);
        assert_eq!(status.master_pid, std::process::id());
        assert_eq!(status.processes_count, 5);
        assert_eq!(status.workers.len(), 2);

        let tasks = tokio::task::spawn_blocking(move || client.query::<SchedulerQuery>())
            .await
            .unwrap()
            .expect("scheduler query");
        assert!(matches!(tasks, QueryOutcome::Answered(ref t) if t.is_empty()));

        handle.stop(0);
    };

    let (code, ()) = tokio::join!(master.run(), driver);
    assert_eq!(code.expect("master runs"), 0);
    assert!(!paths.pid_file.exists());
    assert!(!paths.rx_fifo.exists());
    assert!(!paths.socket.exists());
}
