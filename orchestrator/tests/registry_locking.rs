//! Registry locking across independent connections, as several daemons on
//! one host would use it.

use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread;

use chrono::Utc;
use orchestrator::core::types::{ProjectMeta, ProjectState};
use orchestrator::io::registry::Registry;

fn seeded_registry(temp: &tempfile::TempDir, project_id: &str) -> PathBuf {
    let path = temp.path().join("state/registry.db");
    let registry = Registry::open(&path).expect("open");
    registry
        .register(
            &ProjectMeta::new(project_id, Utc::now()),
            &temp.path().join(project_id),
        )
        .expect("register");
    path
}

/// Workers race for one project; exactly one wins.
#[test]
fn exactly_one_connection_acquires_the_lock() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = seeded_registry(&temp, "P1");
    let workers = 8;
    let barrier = Arc::new(Barrier::new(workers));

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let registry = Registry::open(&path).expect("open");
                barrier.wait();
                registry
                    .try_lock("P1", &format!("worker-{worker}"))
                    .expect("try_lock")
            })
        })
        .collect();
    let wins = handles
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .filter(|acquired| *acquired)
        .count();

    assert_eq!(wins, 1);
    let registry = Registry::open(&path).expect("open");
    let record = registry.get_project("P1").expect("get").expect("present");
    let owner = record.locked_by.expect("locked");
    assert!(owner.starts_with("worker-"));
}

/// A released lock can be claimed by a different connection, and a locked
/// project is hidden from the unlocked-by-state listing.
#[test]
fn released_lock_is_visible_to_other_connections() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = seeded_registry(&temp, "P2");
    let first = Registry::open(&path).expect("open");
    let second = Registry::open(&path).expect("open");

    assert!(first.try_lock("P2", "host-a:1").expect("lock"));
    assert!(!second.try_lock("P2", "host-b:2").expect("lock"));
    assert!(
        second
            .list_by_state(ProjectState::Idea)
            .expect("list")
            .is_empty()
    );

    first.unlock("P2").expect("unlock");
    assert!(second.try_lock("P2", "host-b:2").expect("lock"));
    let record = first.get_project("P2").expect("get").expect("present");
    assert_eq!(record.locked_by.as_deref(), Some("host-b:2"));
}

/// Snapshot writes from one connection are read back intact by another.
#[test]
fn state_updates_are_shared_between_connections() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = seeded_registry(&temp, "P3");
    let writer = Registry::open(&path).expect("open");
    let reader = Registry::open(&path).expect("open");

    let mut meta = reader.get_project("P3").expect("get").expect("present").meta;
    meta.state = ProjectState::Run;
    meta.retry_count = 1;
    meta.failure_reason = Some("batch job 7: NODE_FAIL".to_string());
    meta.job_id = Some(7);
    writer.update_state("P3", &meta).expect("update");

    let record = reader.get_project("P3").expect("get").expect("present");
    assert_eq!(record.state, ProjectState::Run);
    assert_eq!(record.retry_count, 1);
    assert_eq!(record.failure_reason.as_deref(), Some("batch job 7: NODE_FAIL"));
    assert_eq!(record.meta, meta);
    assert_eq!(reader.list_active().expect("active").len(), 1);
}
