// crates/hge-harness-ledger/src/probe.rs
// ============================================================================
// Module: Port Probe
// Description: Loopback TCP probe for occupied ports.
// Purpose: Detect ports bound by processes that never touched the ledger.
// Dependencies: std
// ============================================================================

//! ## Overview
//! Loopback TCP probe that detects ports bound by processes outside the ledger.

use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::time::Duration;

/// Connect timeout for a single loopback probe.
const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Returns true when something accepts TCP connections on `127.0.0.1:port`.
#[must_use]
pub fn is_port_open(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok()
}
