// crates/hge-harness-config/src/env.rs
// ============================================================================
// Module: Harness Environment
// Description: Environment-backed settings for the harness.
// Purpose: Centralize env parsing with strict UTF-8 validation.
// Dependencies: std
// ============================================================================

//! ## Overview
//! Every `HASURA_TEST_*` variable the harness reads is named here. Values must
//! be valid UTF-8 and, when set, non-empty; anything else fails closed.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::PathBuf;

use crate::error::ConfigError;

// ============================================================================
// SECTION: Environment Constants
// ============================================================================

/// Output directory used when `HASURA_TEST_OUTPUT_FOLDER` is unset.
pub const DEFAULT_OUTPUT_DIR: &str = "graphql-engine-test-output";

/// Ledger file name inside the output directory.
pub const DEFAULT_LEDGER_FILE: &str = "tests_info.db";

/// Log filter used when `HASURA_TEST_LOGLEVEL` is unset.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment keys read by the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessEnv {
    /// Output directory for logs, certificates and the ledger.
    OutputFolder,
    /// Port ledger file override.
    InfoDb,
    /// Log filter directive.
    LogLevel,
    /// Comma separated Postgres URLs.
    PgUrls,
    /// Postgres docker image.
    PgDockerImage,
    /// Engine docker image.
    HgeDockerImage,
    /// Engine executable path.
    GraphqlEngine,
    /// Space separated engine RTS options.
    HgeRtsOpts,
    /// Scenario name or inline YAML.
    Scenario,
    /// Auth name or inline YAML.
    Auth,
}

impl HarnessEnv {
    /// Returns the canonical environment variable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OutputFolder => "HASURA_TEST_OUTPUT_FOLDER",
            Self::InfoDb => "HASURA_TEST_INFO_DB",
            Self::LogLevel => "HASURA_TEST_LOGLEVEL",
            Self::PgUrls => "HASURA_TEST_PG_URLS",
            Self::PgDockerImage => "HASURA_TEST_PG_DOCKER_IMAGE",
            Self::HgeDockerImage => "HASURA_TEST_HGE_DOCKER_IMAGE",
            Self::GraphqlEngine => "HASURA_TEST_GRAPHQL_ENGINE",
            Self::HgeRtsOpts => "HASURA_TEST_HGE_RTS_OPTS",
            Self::Scenario => "HASURA_TEST_SCENARIO",
            Self::Auth => "HASURA_TEST_AUTH",
        }
    }

    /// Reads this variable, rejecting invalid UTF-8 and empty values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the value is not UTF-8 or empty.
    pub fn read(self) -> Result<Option<String>, ConfigError> {
        read_env_nonempty(self.as_str())
    }
}

// ============================================================================
// SECTION: Settings
// ============================================================================

/// Harness-wide settings derived from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessSettings {
    /// Directory receiving logs, certificates and coverage files.
    pub output_dir: PathBuf,
    /// Port ledger file.
    pub ledger_path: PathBuf,
    /// Log filter directive.
    pub log_level: String,
}

impl HarnessSettings {
    /// Loads settings from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a value is not valid UTF-8 or is
    /// set but empty.
    pub fn load() -> Result<Self, ConfigError> {
        let output_dir = HarnessEnv::OutputFolder
            .read()?
            .map_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR), PathBuf::from);
        let ledger_path = HarnessEnv::InfoDb
            .read()?
            .map_or_else(|| output_dir.join(DEFAULT_LEDGER_FILE), PathBuf::from);
        let log_level = HarnessEnv::LogLevel.read()?.unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
        Ok(Self {
            output_dir,
            ledger_path,
            log_level,
        })
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Reads an environment variable and enforces UTF-8 validity.
///
/// # Errors
///
/// Returns an error when the environment variable contains invalid UTF-8.
fn read_env_strict(name: &str) -> Result<Option<String>, ConfigError> {
    std::env::var_os(name).map_or(Ok(None), |raw| {
        raw.into_string()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{name} must be valid UTF-8")))
    })
}

/// Reads an environment variable and rejects empty values.
///
/// # Errors
///
/// Returns an error when the variable is set but empty or whitespace.
fn read_env_nonempty(name: &str) -> Result<Option<String>, ConfigError> {
    match read_env_strict(name)? {
        Some(value) if value.trim().is_empty() => {
            Err(ConfigError::Invalid(format!("{name} must not be empty")))
        }
        Some(value) => Ok(Some(value)),
        None => Ok(None),
    }
}
