//! Unit tests for schedule parsing and periodic task timing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;

use prochive::models::{IdAllocator, SpawnReason, SpawnRequest};
use prochive::scheduler::{Schedule, Scheduler};
use prochive::supervisor::signal::ChildSignal;
use prochive::AppError;

use super::test_helpers::{periodic, RecordingSignaller};

fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, hour, minute, second)
        .single()
        .expect("valid timestamp")
}

fn scheduler() -> (
    Scheduler,
    Arc<RecordingSignaller>,
    mpsc::UnboundedReceiver<SpawnRequest>,
) {
    let signaller = Arc::new(RecordingSignaller::default());
    let (tx, rx) = mpsc::unbounded_channel();
    let scheduler = Scheduler::new(signaller.clone(), tx, Duration::from_secs(5));
    (scheduler, signaller, rx)
}

// ── Schedule parsing ────────────────────────────────────────────────────────

#[test]
fn interval_forms_are_accepted() {
    for raw in ["every 30s", "30s", "every 30 seconds"] {
        let schedule: Schedule = raw.parse().expect(raw);
        assert!(
            matches!(schedule, Schedule::Every(d) if d == Duration::from_secs(30)),
            "{raw} must parse as a 30 second interval"
        );
    }
    let schedule: Schedule = "5 minutes".parse().unwrap();
    assert_eq!(
        schedule.next_after(at(10, 0, 0)),
        Some(at(10, 5, 0))
    );
}

#[test]
fn five_field_cron_gets_a_seconds_field() {
    let schedule: Schedule = "0 0 * * *".parse().expect("daily at midnight");
    assert!(matches!(schedule, Schedule::Cron(_)));
    let next = schedule.next_after(at(12, 0, 0)).unwrap();
    assert_eq!(
        next,
        Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).single().unwrap()
    );
}

#[test]
fn six_field_cron_is_used_as_is() {
    let schedule: Schedule = "*/10 * * * * *".parse().unwrap();
    assert_eq!(schedule.next_after(at(8, 0, 1)), Some(at(8, 0, 10)));
}

#[test]
fn nonsense_and_zero_intervals_are_rejected() {
    assert!(matches!(
        "whenever you like".parse::<Schedule>(),
        Err(AppError::Config(_))
    ));
    assert!(matches!("every 0s".parse::<Schedule>(), Err(AppError::Config(_))));
}

// ── Registration ────────────────────────────────────────────────────────────

#[test]
fn unparsable_schedule_is_listed_but_never_run() {
    let (mut scheduler, _, mut rx) = scheduler();
    let mut ids = IdAllocator::new();
    let task = scheduler
        .register(periodic(&mut ids, "broken", "not a schedule"))
        .expect("registration succeeds despite a bad schedule");

    scheduler.start(at(0, 0, 0));
    assert!(scheduler.tick(at(23, 59, 59)).is_empty());
    assert!(rx.try_recv().is_err());

    let listing = scheduler.tasks_info();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].id, task.id);
    assert_eq!(listing[0].schedule, "not a schedule");
    assert!(listing[0].next_run.is_none());
}

#[test]
fn duplicate_and_late_registration_fail() {
    let (mut scheduler, _, _rx) = scheduler();
    let mut ids = IdAllocator::new();
    scheduler
        .register(periodic(&mut ids, "report", "every 1h"))
        .unwrap();
    assert!(matches!(
        scheduler.register(periodic(&mut ids, "report", "every 2h")),
        Err(AppError::Config(_))
    ));

    scheduler.start(at(0, 0, 0));
    assert!(matches!(
        scheduler.register(periodic(&mut ids, "other", "every 2h")),
        Err(AppError::Config(_))
    ));
}

// ── Ticking ─────────────────────────────────────────────────────────────────

#[test]
fn due_task_requests_a_run() {
    let (mut scheduler, _, mut rx) = scheduler();
    let mut ids = IdAllocator::new();
    let task = scheduler
        .register(periodic(&mut ids, "report", "every 30s"))
        .unwrap();
    scheduler.start(at(9, 0, 0));
    assert_eq!(scheduler.task(task.id).unwrap().next_run, Some(at(9, 0, 30)));

    assert!(scheduler.tick(at(9, 0, 29)).is_empty());
    assert_eq!(scheduler.tick(at(9, 0, 30)), vec![task.id]);

    let request = rx.try_recv().expect("spawn request");
    assert_eq!(request.kind.id(), task.id);
    assert_eq!(request.reason, SpawnReason::Schedule);
}

/// A tick that comes late runs the task once and schedules the next run
/// from the current time; the missed runs are not replayed.
#[test]
fn missed_runs_are_not_replayed() {
    let (mut scheduler, _, mut rx) = scheduler();
    let mut ids = IdAllocator::new();
    let task = scheduler
        .register(periodic(&mut ids, "report", "every 30s"))
        .unwrap();
    scheduler.start(at(9, 0, 0));

    let late = at(9, 5, 7);
    assert_eq!(scheduler.tick(late), vec![task.id]);
    assert_eq!(scheduler.task(task.id).unwrap().next_run, Some(at(9, 5, 37)));
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err(), "exactly one run for the missed period");
}

#[test]
fn run_is_skipped_while_previous_run_is_alive() {
    let (mut scheduler, _, mut rx) = scheduler();
    let mut ids = IdAllocator::new();
    let task = scheduler
        .register(periodic(&mut ids, "report", "every 30s"))
        .unwrap();
    scheduler.start(at(9, 0, 0));

    assert_eq!(scheduler.tick(at(9, 0, 30)), vec![task.id]);
    assert!(scheduler.on_spawned(task.id, 700, Instant::now()));
    rx.try_recv().unwrap();

    assert!(scheduler.tick(at(9, 1, 0)).is_empty());
    assert!(rx.try_recv().is_err());
    assert_eq!(
        scheduler.task(task.id).unwrap().next_run,
        Some(at(9, 1, 30)),
        "a skipped run still advances the schedule"
    );

    assert_eq!(scheduler.on_exit(700, Some(0)), Some(task.id));
    assert_eq!(scheduler.tick(at(9, 1, 30)), vec![task.id]);
}

// ── Stop ────────────────────────────────────────────────────────────────────

#[test]
fn stop_terminates_running_tasks() {
    let (mut scheduler, signaller, _rx) = scheduler();
    let mut ids = IdAllocator::new();
    let task = scheduler
        .register(periodic(&mut ids, "report", "every 30s"))
        .unwrap();
    scheduler.start(at(9, 0, 0));
    scheduler.tick(at(9, 0, 30));
    let now = Instant::now();
    scheduler.on_spawned(task.id, 700, now);

    scheduler.stop(now);
    assert_eq!(signaller.sent(), vec![(700, ChildSignal::Terminate)]);
    assert!(!scheduler.is_stopped());
    assert!(scheduler.tick(at(10, 0, 0)).is_empty());

    assert_eq!(scheduler.sweep(now + Duration::from_secs(5)), vec![700]);
    scheduler.on_exit(700, None);
    assert!(scheduler.is_stopped());
}
