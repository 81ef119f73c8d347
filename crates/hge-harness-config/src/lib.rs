// crates/hge-harness-config/src/lib.rs
// ============================================================================
// Module: Harness Config Library
// Description: Scenario catalog, auth modes and test case configuration.
// Purpose: Validate every test case once, before any process is started.
// Dependencies: serde, serde_jcs, serde_yaml, sha2, thiserror, url
// ============================================================================

//! ## Overview
//! `hge-harness-config` turns loosely shaped YAML test case documents into
//! strongly typed [`TestCaseConfig`] values. Scenario names and auth modes are
//! checked against a built-in catalog, defaults are filled in, and each test
//! case gets a short content hash used to namespace its log and coverage
//! files.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod auth;
pub mod catalog;
pub mod env;
pub mod error;
pub mod hashing;
pub mod overrides;
pub mod test_case;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use auth::*;
pub use catalog::*;
pub use env::HarnessEnv;
pub use env::HarnessSettings;
pub use error::ConfigError;
pub use hashing::conf_hash;
pub use overrides::ArgOverrides;
pub use test_case::*;
