//! Unit tests for crash-respawn throttling.

use std::time::{Duration, Instant};

use prochive::models::TemplateId;
use prochive::supervisor::restart::{RestartDecision, RestartGuard, RestartPolicy};

fn policy() -> RestartPolicy {
    RestartPolicy {
        max_restarts: 3,
        window: Duration::from_secs(60),
        backoff_first: Duration::from_secs(1),
        backoff_max: Duration::from_secs(5),
    }
}

#[test]
fn backoff_doubles_up_to_the_cap() {
    let policy = policy();
    assert_eq!(policy.backoff(1), Duration::from_secs(1));
    assert_eq!(policy.backoff(2), Duration::from_secs(2));
    assert_eq!(policy.backoff(3), Duration::from_secs(4));
    assert_eq!(policy.backoff(4), Duration::from_secs(5));
    assert_eq!(policy.backoff(200), Duration::from_secs(5));
}

#[test]
fn guard_gives_up_after_budget_is_spent() {
    let mut guard = RestartGuard::new(policy());
    let id = TemplateId(1);
    let now = Instant::now();

    assert_eq!(
        guard.on_crash(id, now),
        RestartDecision::RespawnAfter(Duration::from_secs(1))
    );
    assert_eq!(
        guard.on_crash(id, now + Duration::from_secs(1)),
        RestartDecision::RespawnAfter(Duration::from_secs(2))
    );
    assert_eq!(
        guard.on_crash(id, now + Duration::from_secs(2)),
        RestartDecision::RespawnAfter(Duration::from_secs(4))
    );
    assert_eq!(
        guard.on_crash(id, now + Duration::from_secs(3)),
        RestartDecision::GiveUp { crashes: 4 }
    );
}

#[test]
fn crashes_outside_the_window_are_forgotten() {
    let mut guard = RestartGuard::new(policy());
    let id = TemplateId(1);
    let start = Instant::now();
    for offset in 0..3 {
        guard.on_crash(id, start + Duration::from_secs(offset));
    }

    let later = start + Duration::from_secs(120);
    assert_eq!(
        guard.on_crash(id, later),
        RestartDecision::RespawnAfter(Duration::from_secs(1))
    );
}

#[test]
fn templates_have_separate_budgets() {
    let mut guard = RestartGuard::new(policy());
    let now = Instant::now();
    for _ in 0..4 {
        guard.on_crash(TemplateId(1), now);
    }
    assert_eq!(
        guard.on_crash(TemplateId(2), now),
        RestartDecision::RespawnAfter(Duration::from_secs(1))
    );
}
