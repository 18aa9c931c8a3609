//! Lock protocol tests: the on-disk artifact is the only synchronization
//! point, so these exercise the file-level contract directly.

use chrono::Utc;
use serde_json::json;

use docwatch::lock::{DirectoryLock, LockManager, LockStatus, process_alive};

/// Above any kernel's pid_max.
const DEAD_PID: u32 = 99_999_999;

fn manager() -> LockManager {
    LockManager::new(3600)
}

#[test]
fn orphan_reclaimed_within_one_acquire_call() {
    let dir = tempfile::tempdir().unwrap();
    let lock_path = LockManager::lock_path(dir.path());

    // Scenario: a previous run died holding the lock.
    std::fs::write(
        &lock_path,
        json!({
            "process_id": DEAD_PID,
            "created_at": "2026-01-01T00:00:00Z",
            "directory": dir.path(),
            "status": "active",
            "lock_file_path": lock_path,
        })
        .to_string(),
    )
    .unwrap();

    let lock = manager().acquire(dir.path()).unwrap();
    assert_eq!(lock.process_id, std::process::id());
    assert_eq!(lock.status, LockStatus::Active);
}

#[test]
fn live_owner_denies_second_acquire() {
    let dir = tempfile::tempdir().unwrap();
    let m = manager();

    let first = m.acquire(dir.path()).unwrap();
    assert!(m.acquire(dir.path()).is_err());
    m.release(&first).unwrap();

    // After release the directory is free again.
    let second = m.acquire(dir.path()).unwrap();
    m.release(&second).unwrap();
}

#[test]
fn wire_format_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let m = manager();
    let lock = m.acquire(dir.path()).unwrap();

    let raw = std::fs::read_to_string(LockManager::lock_path(dir.path())).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();

    // Field names and types are a compatibility contract.
    assert_eq!(value["process_id"], std::process::id());
    assert_eq!(value["status"], "active");
    assert_eq!(value["directory"], dir.path().to_str().unwrap());
    assert_eq!(
        value["lock_file_path"],
        LockManager::lock_path(dir.path()).to_str().unwrap()
    );
    // created_at parses as RFC 3339 / ISO-8601.
    let created = value["created_at"].as_str().unwrap();
    chrono::DateTime::parse_from_rfc3339(created).unwrap();

    m.release(&lock).unwrap();
}

#[test]
fn foreign_lock_parses_and_reports_owner() {
    let dir = tempfile::tempdir().unwrap();
    let lock_path = LockManager::lock_path(dir.path());

    // A lock written by other tooling, with an extra field we must keep.
    std::fs::write(
        &lock_path,
        json!({
            "process_id": std::process::id(),
            "created_at": Utc::now().to_rfc3339(),
            "directory": dir.path(),
            "status": "active",
            "lock_file_path": lock_path,
            "host": "worker-7",
        })
        .to_string(),
    )
    .unwrap();

    let m = manager();
    let seen = m.inspect(dir.path()).unwrap().unwrap();
    assert_eq!(seen.process_id, std::process::id());
    assert_eq!(seen.extra["host"], "worker-7");
}

#[test]
fn release_requires_ownership() {
    let dir = tempfile::tempdir().unwrap();
    let m = manager();

    let lock = m.acquire(dir.path()).unwrap();
    let foreign = DirectoryLock {
        process_id: DEAD_PID,
        ..lock.clone()
    };

    assert!(m.release(&foreign).is_err());
    assert!(LockManager::lock_path(dir.path()).exists());

    m.release(&lock).unwrap();
    assert!(!LockManager::lock_path(dir.path()).exists());
}

#[test]
fn corrupt_lock_reclaimed_once() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(LockManager::lock_path(dir.path()), "���not json").unwrap();

    let m = manager();
    let lock = m.acquire(dir.path()).unwrap();
    assert_eq!(lock.process_id, std::process::id());
    m.release(&lock).unwrap();
}

#[test]
fn sweep_is_a_noop_without_locks() {
    let dir = tempfile::tempdir().unwrap();
    assert!(!manager().reclaim_orphan(dir.path()).unwrap());
}

#[test]
fn own_pid_is_alive_dead_pid_is_not() {
    assert!(process_alive(std::process::id()));
    assert!(!process_alive(DEAD_PID));
    // Pid 1 belongs to init/systemd: exists, owned by root. The probe
    // must treat it as alive rather than reclaiming its locks.
    assert!(process_alive(1));
}
