// crates/hge-harness-runner/src/lib.rs
// ============================================================================
// Module: Harness Runner Library
// Description: Service managers and the scenario runner.
// Purpose: Bring up everything a test case needs, run pytest, tear it down.
// Dependencies: hge-harness-config, hge-harness-ledger, testcontainers, reqwest
// ============================================================================

//! ## Overview
//! `hge-harness-runner` drives one test case at a time through
//! [`ScenarioRunner`]: Postgres (adopted, containerized or proxied through
//! pgbouncer), the auth webhook and its certificates, the engine instances,
//! and finally the pytest suite. Every manager takes the shared
//! [`hge_harness_ledger::PortLedger`] explicitly and releases what it claimed
//! on teardown.
//! Invariants:
//! - Teardown runs after every test case, including failed ones.
//! - Teardown is idempotent for every manager.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod auth;
pub mod certs;
mod child;
mod docker;
pub mod engine;
pub mod jwt;
pub mod pgbouncer;
pub mod postgres;
pub mod pytest;
pub mod scenario;
pub mod secrets;
pub mod telemetry;
pub mod topology;
pub mod webhook;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use auth::AuthMaterial;
pub use certs::CertError;
pub use certs::WebhookTlsFiles;
pub use engine::EngineError;
pub use engine::EngineManager;
pub use engine::EngineSettings;
pub use engine::InstanceState;
pub use engine::wait_for_liveness;
pub use jwt::JwtMaterial;
pub use postgres::PostgresError;
pub use postgres::PostgresManager;
pub use postgres::PostgresSettings;
pub use pytest::PytestError;
pub use pytest::PytestRunner;
pub use scenario::ScenarioError;
pub use scenario::ScenarioOptions;
pub use scenario::ScenarioRunner;
pub use telemetry::init_tracing;
pub use topology::Topology;
pub use webhook::AuthWebhookManager;
pub use webhook::WebhookCommand;
pub use webhook::WebhookError;
