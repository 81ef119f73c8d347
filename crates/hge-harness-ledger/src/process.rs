// crates/hge-harness-ledger/src/process.rs
// ============================================================================
// Module: Process Helpers
// Description: Liveness checks and signal delivery for foreign processes.
// Purpose: Sweep ledger entries of dead owners and stop daemons by pid.
// Dependencies: sysinfo, tracing
// ============================================================================

//! ## Overview
//! Every query refreshes only the process it asks about. Zombies count as
//! dead.

use std::thread;
use std::time::Duration;
use std::time::Instant;

use sysinfo::Pid;
use sysinfo::ProcessRefreshKind;
use sysinfo::ProcessStatus;
use sysinfo::ProcessesToUpdate;
use sysinfo::Signal;
use sysinfo::System;
#[cfg(unix)]
use sysinfo::UpdateKind;
use tracing::debug;

/// Poll interval while waiting for a process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Returns the pid of the current harness process.
#[must_use]
pub fn current_pid() -> u32 {
    std::process::id()
}

/// Loads the current state of `pid` with the requested detail.
fn snapshot(pid: Pid, refresh: ProcessRefreshKind) -> System {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, refresh);
    system
}

/// Returns true when a process with `pid` currently exists.
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let pid = Pid::from_u32(pid);
    snapshot(pid, ProcessRefreshKind::nothing())
        .process(pid)
        .is_some_and(|process| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

/// Sends SIGINT to `pid`. Returns false when the signal could not be delivered.
#[must_use]
pub fn send_interrupt(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let target = Pid::from_u32(pid);
    let system = snapshot(target, ProcessRefreshKind::nothing());
    match system.process(target).map(|process| process.kill_with(Signal::Interrupt)) {
        Some(Some(true)) => true,
        Some(Some(false)) => {
            debug!(pid, "failed to send SIGINT");
            false
        }
        Some(None) => {
            debug!(pid, "SIGINT is not supported on this platform");
            false
        }
        None => {
            debug!(pid, "no process to interrupt");
            false
        }
    }
}

/// Waits until `pid` disappears. Returns false when `timeout` elapses first.
#[must_use]
pub fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    while is_process_alive(pid) {
        if start.elapsed() > timeout {
            return false;
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
    true
}

/// Returns true when the harness runs with an effective user id of 0.
#[must_use]
pub fn running_as_root() -> bool {
    #[cfg(unix)]
    {
        let pid = Pid::from_u32(current_pid());
        snapshot(pid, ProcessRefreshKind::nothing().with_user(UpdateKind::Always))
            .process(pid)
            .and_then(|process| process.effective_user_id().or_else(|| process.user_id()).cloned())
            .is_some_and(|uid| *uid == 0)
    }
    #[cfg(not(unix))]
    {
        false
    }
}
