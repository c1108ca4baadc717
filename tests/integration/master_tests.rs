//! Integration tests for master startup and module-driven shutdown.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serial_test::serial;
use tokio::process::{Child, Command};

use prochive::master::paths::RunPaths;
use prochive::master::pidfile::write_pid;
use prochive::master::launcher::ChildLauncher;
use prochive::master::{MasterOptions, MasterProcess};
use prochive::models::{ChildRole, IdAllocator, WorkerSpec, WorkerTemplate};
use prochive::supervisor::signal::{process_alive, NixSignaller};
use prochive::supervisor::SupervisorOptions;
use prochive::{AppError, MasterHandle, Module, Result, StopFuture};

use super::test_helpers::{wait_until, SleepLauncher};

fn master(paths: &RunPaths, modules: Vec<Box<dyn Module>>) -> Result<MasterProcess> {
    MasterProcess::new(
        MasterOptions {
            paths: paths.clone(),
            supervisor: SupervisorOptions::default(),
            shutdown_timeout: Some(Duration::from_secs(10)),
        },
        Vec::new(),
        Vec::new(),
        modules,
        Box::new(SleepLauncher::default()),
        Arc::new(NixSignaller),
    )
}

fn paths_in(dir: &Path) -> RunPaths {
    RunPaths::resolve(Path::new("/opt/app/server"), Some(&dir.join("master.pid")))
}

#[tokio::test]
#[serial]
async fn live_pid_file_refuses_a_second_master() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    write_pid(&paths.pid_file, std::process::id()).unwrap();

    let err = master(&paths, Vec::new())
        .unwrap()
        .run()
        .await
        .expect_err("pid file names a live process");
    assert!(matches!(err, AppError::Supervision(_)));
    assert!(paths.pid_file.exists(), "the other master's pid file stays");
}

/// Stops the master as soon as it starts and needs a moment to wind down.
struct ShortLived {
    drained: Arc<AtomicBool>,
}

impl Module for ShortLived {
    fn name(&self) -> &str {
        "short-lived"
    }

    fn init(&mut self, master: MasterHandle) -> Result<()> {
        master.stop(3);
        Ok(())
    }

    fn stop(&mut self) -> Option<StopFuture> {
        let drained = Arc::clone(&self.drained);
        Some(Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drained.store(true, Ordering::SeqCst);
        }))
    }
}

#[tokio::test]
#[serial]
async fn master_waits_for_modules_and_keeps_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    let drained = Arc::new(AtomicBool::new(false));
    let module = ShortLived {
        drained: Arc::clone(&drained),
    };

    let code = tokio::time::timeout(
        Duration::from_secs(5),
        master(&paths, vec![Box::new(module)]).unwrap().run(),
    )
    .await
    .expect("master stops")
    .expect("master runs");

    assert_eq!(code, 3);
    assert!(drained.load(Ordering::SeqCst));
    assert!(!paths.pid_file.exists());
}

#[test]
fn duplicate_module_names_are_rejected() {
    let modules: Vec<Box<dyn Module>> = vec![
        Box::new(ShortLived {
            drained: Arc::default(),
        }),
        Box::new(ShortLived {
            drained: Arc::default(),
        }),
    ];
    let dir = tempfile::tempdir().unwrap();
    let err = master(&paths_in(dir.path()), modules).err().expect("duplicate name");
    assert!(matches!(err, AppError::Config(_)));
}

/// Starts children that ignore `SIGTERM`.
#[derive(Debug, Default, Clone)]
struct StubbornLauncher {
    pids: Arc<Mutex<Vec<u32>>>,
}

impl ChildLauncher for StubbornLauncher {
    fn launch(&mut self, _role: ChildRole, _socket: &Path) -> Result<Child> {
        let child = Command::new("sh")
            .args(["-c", "trap '' TERM; exec sleep 30"])
            .kill_on_drop(true)
            .spawn()?;
        if let Some(pid) = child.id() {
            self.pids.lock().unwrap().push(pid);
        }
        Ok(child)
    }
}

/// Children outliving the shutdown deadline are killed and the master
/// returns without waiting for the per-child stop timeout.
#[tokio::test]
#[serial]
async fn shutdown_deadline_kills_remaining_children() {
    let dir = tempfile::tempdir().unwrap();
    let paths = paths_in(dir.path());
    let mut ids = IdAllocator::new();
    let workers = vec![WorkerTemplate::from_spec(WorkerSpec::new("stubborn"), &mut ids).unwrap()];
    let launcher = StubbornLauncher::default();
    let pids = Arc::clone(&launcher.pids);

    let master = MasterProcess::new(
        MasterOptions {
            paths: paths.clone(),
            supervisor: SupervisorOptions {
                stop_timeout: Duration::from_secs(60),
                ..SupervisorOptions::default()
            },
            shutdown_timeout: Some(Duration::from_millis(300)),
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
        wait_until("worker started", || !pids.lock().unwrap().is_empty()).await;
        // Let the shell install its trap before stopping.
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.stop(4);
    };
    let (code, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(master.run(), driver)
    })
    .await
    .expect("deadline ends the shutdown");
    assert_eq!(code.expect("master runs"), 4);
    assert!(!paths.pid_file.exists());

    let pid = pids.lock().unwrap()[0];
    wait_until("worker killed", || !process_alive(pid)).await;
}
