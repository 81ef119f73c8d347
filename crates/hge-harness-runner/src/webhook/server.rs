// crates/hge-harness-runner/src/webhook/server.rs
// ============================================================================
// Module: Auth Webhook Server
// Description: Toy bearer-token and cookie auth over TLS.
// Purpose: Answer the engine's auth hook with predictable decisions.
// Dependencies: axum, axum-server, base64, serde_json, tokio
// ============================================================================

//! ## Overview
//! Two routes are served, each for GET and POST:
//! - `/token-as-base64-of-headers`: the bearer token is the base64 encoding
//!   of a JSON header object. The request is allowed when that object has
//!   `X-Hasura-Auth-Mode: webhook`, and the object is echoed back as the
//!   session variables.
//! - `/cookie-auth`: allowed with `x-hasura-role: admin` when a non-empty
//!   cookie is present.
//!
//! GET reads request headers; POST reads `{"headers": {...}}` from the body.
//! Everything else is 401 with an empty JSON object.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::http::header::COOKIE;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::WebhookError;

// ============================================================================
// SECTION: Routes
// ============================================================================

/// Bearer token route.
pub const TOKEN_ROUTE: &str = "/token-as-base64-of-headers";

/// Cookie route.
pub const COOKIE_ROUTE: &str = "/cookie-auth";

/// Header the decoded token must carry.
const AUTH_MODE_HEADER: &str = "X-Hasura-Auth-Mode";

/// Grace period for in-flight requests on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Outcome of one auth decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// Allowed with these session variables.
    Allow(Value),
    /// Denied for this reason.
    Deny(&'static str),
}

/// Builds the webhook router.
pub fn router() -> Router {
    Router::new()
        .route(TOKEN_ROUTE, get(token_get).post(token_post))
        .route(COOKIE_ROUTE, get(cookie_get).post(cookie_post))
}

/// Handles a bearer token in request headers.
async fn token_get(headers: HeaderMap) -> Response {
    let authorization = headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok());
    respond(TOKEN_ROUTE, authorize_bearer(authorization))
}

/// Handles a bearer token in a posted header object.
async fn token_post(body: Bytes) -> Response {
    let headers = posted_headers(&body);
    respond(TOKEN_ROUTE, authorize_bearer(lookup(&headers, "authorization")))
}

/// Handles a cookie in request headers.
async fn cookie_get(headers: HeaderMap) -> Response {
    let cookie = headers.get(COOKIE).and_then(|value| value.to_str().ok());
    respond(COOKIE_ROUTE, authorize_cookie(cookie))
}

/// Handles a cookie in a posted header object.
async fn cookie_post(body: Bytes) -> Response {
    let headers = posted_headers(&body);
    respond(COOKIE_ROUTE, authorize_cookie(lookup(&headers, "cookie")))
}

/// Logs the decision and renders the response.
fn respond(route: &str, decision: AuthDecision) -> Response {
    match decision {
        AuthDecision::Allow(session) => {
            info!(route, session = %session, "allowed");
            (StatusCode::OK, Json(session)).into_response()
        }
        AuthDecision::Deny(reason) => {
            info!(route, reason, "denied");
            (StatusCode::UNAUTHORIZED, Json(json!({}))).into_response()
        }
    }
}

// ============================================================================
// SECTION: Decisions
// ============================================================================

/// Decides a request from its `Authorization` header value.
#[must_use]
pub fn authorize_bearer(authorization: Option<&str>) -> AuthDecision {
    let Some(authorization) = authorization else {
        return AuthDecision::Deny("missing authorization header");
    };
    let Some(token) = authorization.strip_prefix("Bearer ") else {
        return AuthDecision::Deny("not a bearer token");
    };
    let Ok(decoded) = STANDARD.decode(token.trim()) else {
        return AuthDecision::Deny("token is not base64");
    };
    let Ok(Value::Object(headers)) = serde_json::from_slice::<Value>(&decoded) else {
        return AuthDecision::Deny("token is not a json object");
    };
    if headers.get(AUTH_MODE_HEADER).and_then(Value::as_str) == Some("webhook") {
        AuthDecision::Allow(Value::Object(headers))
    } else {
        AuthDecision::Deny("token lacks X-Hasura-Auth-Mode: webhook")
    }
}

/// Decides a request from its `Cookie` header value.
#[must_use]
pub fn authorize_cookie(cookie: Option<&str>) -> AuthDecision {
    match cookie {
        Some(cookie) if !cookie.trim().is_empty() => {
            AuthDecision::Allow(json!({"x-hasura-role": "admin"}))
        }
        _ => AuthDecision::Deny("missing cookie"),
    }
}

/// Extracts the `headers` object of a POST body.
fn posted_headers(body: &[u8]) -> Map<String, Value> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(mut payload)) => match payload.remove("headers") {
            Some(Value::Object(headers)) => headers,
            _ => Map::new(),
        },
        _ => Map::new(),
    }
}

/// Case-insensitive string header lookup.
fn lookup<'a>(headers: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    headers.iter().find(|(key, _)| key.eq_ignore_ascii_case(name)).and_then(|(_, value)| value.as_str())
}

// ============================================================================
// SECTION: Serving
// ============================================================================

/// Listen address and TLS files of a webhook process.
#[derive(Debug, Clone)]
pub struct WebhookServerConfig {
    /// Address to bind.
    pub addr: SocketAddr,
    /// Leaf certificate PEM file.
    pub cert_file: PathBuf,
    /// Leaf private key PEM file.
    pub key_file: PathBuf,
}

/// Serves the webhook until `handle` shuts it down.
///
/// # Errors
///
/// Returns [`WebhookError`] when the TLS files cannot be loaded or serving
/// fails.
pub async fn serve(config: WebhookServerConfig, handle: Handle<SocketAddr>) -> Result<(), WebhookError> {
    install_crypto_provider();
    let tls = RustlsConfig::from_pem_file(&config.cert_file, &config.key_file)
        .await
        .map_err(|err| WebhookError::Tls(err.to_string()))?;
    info!(addr = %config.addr, "auth webhook listening");
    axum_server::bind_rustls(config.addr, tls)
        .handle(handle)
        .serve(router().into_make_service())
        .await
        .map_err(|err| WebhookError::Serve(err.to_string()))
}

/// Installs the aws-lc-rs provider as the process default. Returns false
/// when a provider was already installed; that provider stays in place.
fn install_crypto_provider() -> bool {
    let installed = rustls::crypto::aws_lc_rs::default_provider().install_default().is_ok();
    if !installed {
        debug!("rustls crypto provider already installed");
    }
    installed
}

/// Runs the webhook on its own runtime until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns [`WebhookError`] when the runtime cannot be built or serving fails.
pub fn run_blocking(config: WebhookServerConfig) -> Result<(), WebhookError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| WebhookError::Runtime(err.to_string()))?;
    runtime.block_on(async move {
        let handle = Handle::new();
        let signal_handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("auth webhook shutting down");
            signal_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        });
        serve(config, handle).await
    })
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::SignalKind;
        use tokio::signal::unix::signal;

        if let Ok(mut terminate) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
            return;
        }
    }
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for SIGINT");
    }
}
