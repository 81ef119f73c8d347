// crates/hge-harness-ledger/tests/port_ledger.rs
// ============================================================================
// Module: Port Ledger Tests
// Description: Reservation, release, sweep and fallback behavior.
// Purpose: Validate port uniqueness across workers sharing one ledger file.
// ============================================================================

//! ## Overview
//! Integration tests for the `SQLite` port ledger:
//! - Uniqueness across ledgers opened on the same file and across threads
//! - Release by owner and by port list
//! - Stale sweeps for dead owners and expired reservations
//! - Probe-only fallback when the ledger file cannot be opened

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::collections::BTreeSet;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::thread;

use hge_harness_ledger::LedgerConfig;
use hge_harness_ledger::LedgerError;
use hge_harness_ledger::LedgerMode;
use hge_harness_ledger::PortLedger;
use hge_harness_ledger::PortOwner;
use hge_harness_ledger::current_pid;
use rusqlite::Connection;
use rusqlite::params;
use tempfile::TempDir;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Port range start used by these tests; far from the harness defaults.
const TEST_PORT_BASE: u16 = 41_000;

/// Ledger file inside `dir`, in a directory that does not exist yet.
fn ledger_path(dir: &TempDir) -> PathBuf {
    dir.path().join("nested").join("tests_info.db")
}

/// Ledger config with millisecond backoff.
fn fast_config(dir: &TempDir) -> LedgerConfig {
    let mut config = LedgerConfig::new(ledger_path(dir));
    config.backoff_min_ms = 1;
    config.backoff_max_ms = 5;
    config
}

/// Pid of a child that has already been reaped.
fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

// ============================================================================
// SECTION: Reservation
// ============================================================================

#[test]
fn reserve_creates_ledger_and_records_entry() {
    let dir = TempDir::new().unwrap();
    let ledger = PortLedger::open(fast_config(&dir)).unwrap();
    assert_eq!(ledger.mode(), LedgerMode::Shared);
    assert!(ledger_path(&dir).exists());

    let port = ledger.reserve(TEST_PORT_BASE).unwrap();
    assert!(port >= TEST_PORT_BASE);
    assert!(ledger.is_reserved(port).unwrap());

    let entries = ledger.list_reserved().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].port, port);
    assert_eq!(entries[0].owner, Some(PortOwner::Process(current_pid())));
}

#[test]
fn reserve_skips_ports_bound_on_host() {
    let dir = TempDir::new().unwrap();
    let ledger = PortLedger::open(fast_config(&dir)).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let bound = listener.local_addr().unwrap().port();
    if bound == u16::MAX {
        return;
    }
    let port = ledger.reserve(bound).unwrap();
    assert_ne!(port, bound);
    assert!(port > bound);
}

#[test]
fn two_workers_on_one_file_never_share_a_port() {
    let dir = TempDir::new().unwrap();
    let first = PortLedger::open(fast_config(&dir)).unwrap();
    let second = PortLedger::open(fast_config(&dir)).unwrap();

    let a = first.reserve(TEST_PORT_BASE + 100).unwrap();
    let b = second.reserve(TEST_PORT_BASE + 100).unwrap();
    assert_ne!(a, b);
}

#[test]
fn concurrent_reservations_are_unique() {
    let dir = TempDir::new().unwrap();
    let config = fast_config(&dir);
    PortLedger::open(config.clone()).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let config = config.clone();
            thread::spawn(move || {
                let ledger = PortLedger::open(config).unwrap();
                (0..4).map(|_| ledger.reserve(TEST_PORT_BASE + 200).unwrap()).collect::<Vec<_>>()
            })
        })
        .collect();
    let mut seen = BTreeSet::new();
    for handle in handles {
        for port in handle.join().unwrap() {
            assert!(seen.insert(port), "port {port} handed out twice");
        }
    }
    assert_eq!(seen.len(), 32);
}

#[test]
fn shared_ledger_handle_is_usable_across_threads() {
    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(PortLedger::open(fast_config(&dir)).unwrap());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || ledger.reserve(TEST_PORT_BASE + 300).unwrap())
        })
        .collect();
    let ports: BTreeSet<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(ports.len(), 4);
}

#[test]
fn scan_limit_yields_exhausted() {
    let dir = TempDir::new().unwrap();
    let mut config = fast_config(&dir);
    config.scan_limit = 2;
    let ledger = PortLedger::open(config).unwrap();
    ledger.assign_process(TEST_PORT_BASE + 400, current_pid(), Some("blocker")).unwrap();
    ledger.assign_process(TEST_PORT_BASE + 401, current_pid(), Some("blocker")).unwrap();

    let err = ledger.reserve(TEST_PORT_BASE + 400).unwrap_err();
    match err {
        LedgerError::Exhausted {
            start,
            attempts,
            ..
        } => {
            assert_eq!(start, TEST_PORT_BASE + 400);
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
}

// ============================================================================
// SECTION: Ownership And Release
// ============================================================================

#[test]
fn release_by_process_owner_removes_entries() {
    let dir = TempDir::new().unwrap();
    let ledger = PortLedger::open(fast_config(&dir)).unwrap();
    let port = ledger.reserve(TEST_PORT_BASE + 500).unwrap();
    let owner = current_pid();
    ledger.assign_process(port, owner, Some("GraphQL engine")).unwrap();

    let released = ledger.release_owner(&PortOwner::Process(owner)).unwrap();
    assert_eq!(released, vec![port]);
    assert!(!ledger.is_reserved(port).unwrap());
}

#[test]
fn container_owner_replaces_process_owner() {
    let dir = TempDir::new().unwrap();
    let ledger = PortLedger::open(fast_config(&dir)).unwrap();
    let port = ledger.reserve(TEST_PORT_BASE + 600).unwrap();
    ledger.assign_container(port, "hge-test-container", Some("Postgres")).unwrap();

    let entry = ledger.list_reserved().unwrap().into_iter().find(|e| e.port == port).unwrap();
    assert_eq!(entry.owner, Some(PortOwner::Container("hge-test-container".to_string())));
    assert_eq!(entry.service.as_deref(), Some("Postgres"));

    assert!(ledger.release_owner(&PortOwner::Process(current_pid())).unwrap().is_empty());
    let released =
        ledger.release_owner(&PortOwner::Container("hge-test-container".to_string())).unwrap();
    assert_eq!(released, vec![port]);
}

#[test]
fn release_ports_removes_listed_entries_only() {
    let dir = TempDir::new().unwrap();
    let ledger = PortLedger::open(fast_config(&dir)).unwrap();
    let first = ledger.reserve(TEST_PORT_BASE + 700).unwrap();
    let second = ledger.reserve(first + 1).unwrap();

    ledger.release_ports(&[first]).unwrap();
    assert!(!ledger.is_reserved(first).unwrap());
    assert!(ledger.is_reserved(second).unwrap());
}

// ============================================================================
// SECTION: Stale Sweep
// ============================================================================

#[test]
fn entries_of_dead_processes_are_swept_on_open() {
    let dir = TempDir::new().unwrap();
    let ledger = PortLedger::open(fast_config(&dir)).unwrap();
    let port = ledger.reserve(TEST_PORT_BASE + 800).unwrap();
    ledger.assign_process(port, dead_pid(), Some("crashed worker")).unwrap();
    drop(ledger);

    let reopened = PortLedger::open(fast_config(&dir)).unwrap();
    assert!(!reopened.is_reserved(port).unwrap());
}

#[test]
fn sweep_follows_the_owner_process() {
    let dir = TempDir::new().unwrap();
    let ledger = PortLedger::open(fast_config(&dir)).unwrap();
    let port = ledger.reserve(TEST_PORT_BASE + 850).unwrap();
    let mut owner = Command::new("sleep").arg("30").spawn().unwrap();
    ledger.assign_process(port, owner.id(), Some("engine")).unwrap();

    assert_eq!(ledger.sweep_stale().unwrap(), 0);
    assert!(ledger.is_reserved(port).unwrap());

    owner.kill().unwrap();
    owner.wait().unwrap();
    assert_eq!(ledger.sweep_stale().unwrap(), 1);
    assert!(!ledger.is_reserved(port).unwrap());
}

#[test]
fn expired_entries_are_swept() {
    let dir = TempDir::new().unwrap();
    let ledger = PortLedger::open(fast_config(&dir)).unwrap();
    let port = ledger.reserve(TEST_PORT_BASE + 900).unwrap();
    ledger.assign_container(port, "long-gone", None).unwrap();

    let raw = Connection::open(ledger_path(&dir)).unwrap();
    raw.execute(
        "UPDATE reserved_ports SET reserved_at = ?1 WHERE port = ?2",
        params![0_i64, i64::from(port)],
    )
    .unwrap();

    assert_eq!(ledger.sweep_stale().unwrap(), 1);
    assert!(!ledger.is_reserved(port).unwrap());
}

#[test]
fn assignment_restarts_the_reservation_age() {
    let dir = TempDir::new().unwrap();
    let ledger = PortLedger::open(fast_config(&dir)).unwrap();
    let port = ledger.reserve(TEST_PORT_BASE + 920).unwrap();

    let raw = Connection::open(ledger_path(&dir)).unwrap();
    raw.execute(
        "UPDATE reserved_ports SET reserved_at = ?1 WHERE port = ?2",
        params![0_i64, i64::from(port)],
    )
    .unwrap();
    ledger.assign_container(port, "hge-still-running", Some("graphql-engine")).unwrap();

    let entry = ledger.list_reserved().unwrap().into_iter().find(|e| e.port == port).unwrap();
    assert!(entry.reserved_at_ms > 0);
    assert_eq!(ledger.sweep_stale().unwrap(), 0);
    assert!(ledger.is_reserved(port).unwrap());
}

#[test]
fn live_entries_survive_the_sweep() {
    let dir = TempDir::new().unwrap();
    let ledger = PortLedger::open(fast_config(&dir)).unwrap();
    let port = ledger.reserve(TEST_PORT_BASE + 950).unwrap();
    assert_eq!(ledger.sweep_stale().unwrap(), 0);
    assert!(ledger.is_reserved(port).unwrap());
}

// ============================================================================
// SECTION: HPC Files
// ============================================================================

#[test]
fn hpc_files_are_stored_once_by_absolute_path() {
    let dir = TempDir::new().unwrap();
    let ledger = PortLedger::open(fast_config(&dir)).unwrap();
    let tix = dir.path().join("graphql-engine-1-noAuth-default-abcd1234.tix");
    ledger.add_hpc_file(&tix).unwrap();
    ledger.add_hpc_file(&tix).unwrap();

    let files = ledger.hpc_files().unwrap();
    assert_eq!(files, vec![tix]);
}

// ============================================================================
// SECTION: Fallback
// ============================================================================

#[test]
fn unopenable_ledger_falls_back_to_probe_only() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();
    let mut config = LedgerConfig::new(blocker.join("tests_info.db"));
    config.scan_limit = 50;

    let ledger = PortLedger::open_or_probe_only(config);
    assert_eq!(ledger.mode(), LedgerMode::ProbeOnly);

    let first = ledger.reserve(TEST_PORT_BASE + 1_000).unwrap();
    let second = ledger.reserve(TEST_PORT_BASE + 1_000).unwrap();
    assert_ne!(first, second);
    assert!(ledger.list_reserved().unwrap().is_empty());

    ledger.release_ports(&[first]).unwrap();
    assert!(!ledger.is_reserved(first).unwrap());
    assert!(ledger.is_reserved(second).unwrap());
    assert!(ledger.hpc_files().unwrap().is_empty());
}
