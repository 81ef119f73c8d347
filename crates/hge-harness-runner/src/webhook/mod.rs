// crates/hge-harness-runner/src/webhook/mod.rs
// ============================================================================
// Module: Auth Webhook
// Description: TLS auth webhook server and its process manager.
// Purpose: Back the engine's webhook auth mode with a predictable toy auth.
// Dependencies: axum, axum-server, reqwest
// ============================================================================

//! ## Overview
//! The webhook runs as a separate OS process (`hge-harness auth-webhook`)
//! serving [`server::router`] over TLS. [`manager::AuthWebhookManager`]
//! reserves its port, launches the process, verifies the configured route and
//! stops it on teardown.

pub mod manager;
pub mod server;

use thiserror::Error;

pub use manager::AuthWebhookManager;
pub use manager::WebhookCommand;
pub use server::WebhookServerConfig;

/// Auth webhook errors.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// TLS material could not be loaded.
    #[error("webhook tls error: {0}")]
    Tls(String),
    /// The server failed while serving.
    #[error("webhook server error: {0}")]
    Serve(String),
    /// The async runtime could not be created.
    #[error("webhook runtime error: {0}")]
    Runtime(String),
    /// The webhook process could not be started.
    #[error("webhook launch failed: {0}")]
    Launch(String),
    /// The port ledger rejected an operation.
    #[error("webhook port error: {0}")]
    Ledger(String),
    /// The webhook did not answer the verification request.
    #[error("webhook at {url} did not become ready: {message}")]
    NotReady {
        /// Verified URL.
        url: String,
        /// Last failure.
        message: String,
    },
}
