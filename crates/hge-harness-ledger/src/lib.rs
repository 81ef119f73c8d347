// crates/hge-harness-ledger/src/lib.rs
// ============================================================================
// Module: Harness Port Ledger Library
// Description: Shared port reservation ledger and host probes.
// Purpose: Keep parallel test workers from handing out the same port.
// Dependencies: rand, rusqlite, sysinfo, thiserror, tracing
// ============================================================================

//! ## Overview
//! `hge-harness-ledger` owns the only state shared between concurrently
//! running harness workers: a `SQLite` file recording which ports are in use,
//! who owns them, and which coverage (`.tix`) files were produced. When the
//! file cannot be opened the ledger degrades to probing host sockets only.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod ledger;
pub mod probe;
pub mod process;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use ledger::*;
pub use probe::is_port_open;
pub use process::current_pid;
pub use process::is_process_alive;
pub use process::running_as_root;
pub use process::send_interrupt;
pub use process::wait_for_exit;
