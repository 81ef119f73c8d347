// crates/hge-harness-runner/src/child.rs
// ============================================================================
// Module: Child Processes
// Description: Graceful stop of spawned children.
// Purpose: Give engines and webhooks a chance to flush logs and coverage.
// Dependencies: hge-harness-ledger, tracing
// ============================================================================

//! ## Overview
//! Graceful stop of spawned child processes.

use std::process::Child;
use std::process::ExitStatus;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use hge_harness_ledger::send_interrupt;
use tracing::debug;
use tracing::warn;

/// Poll interval while waiting for a child to exit.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Sends SIGINT and waits up to `grace`; kills the child afterwards.
/// Returns the exit status when it could be collected.
pub fn interrupt_and_wait(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let pid = child.id();
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }
    if !send_interrupt(pid) {
        debug!(pid, "interrupt not delivered");
    }
    let start = Instant::now();
    while start.elapsed() < grace {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(err) => {
                debug!(pid, error = %err, "failed to poll child");
                break;
            }
        }
    }
    warn!(pid, "child ignored SIGINT; killing");
    if let Err(err) = child.kill() {
        debug!(pid, error = %err, "failed to kill child");
    }
    child.wait().ok()
}
