// crates/hge-harness-config/src/error.rs
// ============================================================================
// Module: Config Errors
// Description: Error type shared by all configuration modules.
// Purpose: Report configuration problems before any process is started.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! Configuration error type shared by all configuration modules.

use thiserror::Error;

/// Configuration errors. All of them are fatal for the test run.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading a configuration source failed.
    #[error("config io error: {0}")]
    Io(String),
    /// YAML could not be parsed.
    #[error("config parse error: {0}")]
    Parse(String),
    /// The document parsed but is not a valid configuration.
    #[error("invalid config: {0}")]
    Invalid(String),
    /// Scenario name not present in the catalog.
    #[error("unknown scenario {0}")]
    UnknownScenario(String),
    /// Auth name not present in the auth catalog.
    #[error("unknown auth {0}")]
    UnknownAuth(String),
    /// Auth mode outside the scenario's allow-list.
    #[error("auth {auth} is not allowed for scenario {scenario} (allowed: {allowed})")]
    AuthNotAllowed {
        /// Scenario name.
        scenario: String,
        /// Requested auth mode.
        auth: String,
        /// Comma separated allow-list.
        allowed: String,
    },
    /// Two mutually exclusive options were both set.
    #[error("{first} and {second} should not be defined together")]
    Conflict {
        /// First option, with its environment variable.
        first: String,
        /// Second option, with its environment variable.
        second: String,
    },
}
