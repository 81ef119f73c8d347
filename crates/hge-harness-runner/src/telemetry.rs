// crates/hge-harness-runner/src/telemetry.rs
// ============================================================================
// Module: Telemetry
// Description: Tracing subscriber installation for the harness binary.
// Purpose: Route lifecycle events to stderr with an env-driven filter.
// Dependencies: tracing-subscriber
// ============================================================================

//! ## Overview
//! The harness logs through `tracing`. [`init_tracing`] installs a `fmt`
//! layer filtered by the directive from `HASURA_TEST_LOGLEVEL`, or `debug`
//! when verbose output was requested.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Directive used when verbose output is requested.
const VERBOSE_DIRECTIVE: &str = "debug";

/// Tracing setup failure.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The filter directive could not be parsed.
    #[error("invalid log filter '{directive}': {message}")]
    Filter {
        /// Rejected directive.
        directive: String,
        /// Parser message.
        message: String,
    },
    /// A global subscriber was already installed.
    #[error("tracing subscriber already installed: {0}")]
    Install(String),
}

/// Builds the filter for `directive`, or `debug` when `verbose` is set.
///
/// # Errors
///
/// Returns [`TelemetryError::Filter`] when the directive does not parse.
pub fn build_filter(directive: &str, verbose: bool) -> Result<EnvFilter, TelemetryError> {
    let directive = if verbose { VERBOSE_DIRECTIVE } else { directive };
    EnvFilter::try_new(directive).map_err(|err| TelemetryError::Filter {
        directive: directive.to_string(),
        message: err.to_string(),
    })
}

/// Installs the global stderr subscriber.
///
/// # Errors
///
/// Returns [`TelemetryError`] when the filter is invalid or a subscriber is
/// already installed.
pub fn init_tracing(directive: &str, verbose: bool) -> Result<(), TelemetryError> {
    let filter = build_filter(directive, verbose)?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .try_init()
        .map_err(|err| TelemetryError::Install(err.to_string()))
}
