// crates/hge-harness-runner/src/topology.rs
// ============================================================================
// Module: Topology
// Description: Addresses and credentials of a running test case.
// Purpose: Hand what setup produced to the pytest runner.
// Dependencies: none
// ============================================================================

//! ## Overview
//! Addresses and credentials of a running test case.

use std::path::PathBuf;

use crate::jwt::JwtMaterial;

/// Everything pytest needs to reach the services of one test case.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    /// Primary engine URLs, one per database URL.
    pub engine_urls: Vec<String>,
    /// Replica engine URLs, empty without replicas.
    pub replica_urls: Vec<String>,
    /// Database URLs the engines were started against.
    pub pg_urls: Vec<String>,
    /// Ports reserved for the pytest events webhook, one per primary.
    pub evts_webhook_ports: Vec<u16>,
    /// Ports reserved for the pytest remote GraphQL server, one per primary.
    pub remote_gql_ports: Vec<u16>,
    /// Engine log files, primaries first.
    pub log_files: Vec<PathBuf>,
    /// Admin secret, absent for `noAuth`.
    pub admin_secret: Option<String>,
    /// JWT key and configuration.
    pub jwt: Option<JwtMaterial>,
    /// Full auth webhook URL.
    pub auth_webhook_url: Option<String>,
    /// Trust bundle pytest verifies the webhook against.
    pub ca_bundle: Option<PathBuf>,
}
