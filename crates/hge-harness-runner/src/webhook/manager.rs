// crates/hge-harness-runner/src/webhook/manager.rs
// ============================================================================
// Module: Auth Webhook Manager
// Description: Launch, verify and stop the auth webhook process.
// Purpose: Own the webhook port and process for one test case.
// Dependencies: hge-harness-ledger, reqwest, base64
// ============================================================================

//! ## Overview
//! The webhook process is the harness binary itself, started with the
//! `auth-webhook` subcommand. Its port is claimed from 9090 upward and handed
//! to the process pid once it is spawned. A verification request against the
//! configured route must succeed before the engine is started.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;
use std::process::Child;
use std::process::Command;
use std::process::Stdio;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use hge_harness_ledger::PortLedger;
use hge_harness_ledger::PortOwner;
use reqwest::blocking::Client;
use reqwest::blocking::RequestBuilder;
use reqwest::header::AUTHORIZATION;
use reqwest::header::COOKIE;
use serde_json::json;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::WebhookError;
use super::server::COOKIE_ROUTE;
use super::server::TOKEN_ROUTE;
use crate::certs::WebhookTlsFiles;
use crate::child::interrupt_and_wait;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// First port probed for the webhook.
pub const WEBHOOK_START_PORT: u16 = 9090;

/// Ledger service name of the webhook.
const SERVICE_NAME: &str = "auth webhook";

/// Verification attempts before giving up.
const VERIFY_ATTEMPTS: u32 = 50;

/// Delay between verification attempts.
const VERIFY_INTERVAL: Duration = Duration::from_millis(200);

/// Per-request timeout of verification requests.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// Grace period after SIGINT.
const STOP_GRACE: Duration = Duration::from_secs(10);

// ============================================================================
// SECTION: Command
// ============================================================================

/// Program and leading arguments that start a webhook process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookCommand {
    /// Executable to run.
    pub program: PathBuf,
    /// Arguments placed before `--port`, `--cert` and `--key`.
    pub args: Vec<String>,
}

impl WebhookCommand {
    /// Runs the `auth-webhook` subcommand of the current executable.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Launch`] when the current executable is unknown.
    pub fn current_exe() -> Result<Self, WebhookError> {
        let program = std::env::current_exe().map_err(|err| WebhookError::Launch(err.to_string()))?;
        Ok(Self {
            program,
            args: vec!["auth-webhook".to_string()],
        })
    }

    /// Returns the full argument list for `port` and the TLS files.
    #[must_use]
    pub fn arguments(&self, port: u16, tls: &WebhookTlsFiles) -> Vec<String> {
        let mut args = self.args.clone();
        args.extend([
            "--port".to_string(),
            port.to_string(),
            "--cert".to_string(),
            tls.cert_file.display().to_string(),
            "--key".to_string(),
            tls.key_file.display().to_string(),
        ]);
        args
    }
}

// ============================================================================
// SECTION: Manager
// ============================================================================

/// Running webhook process.
struct RunningWebhook {
    /// Child process.
    child: Child,
    /// Listening port.
    port: u16,
    /// `https://localhost:<port>`.
    root_url: String,
}

/// Starts and stops the auth webhook process.
pub struct AuthWebhookManager {
    /// Shared port ledger.
    ledger: Arc<PortLedger>,
    /// Webhook command.
    command: WebhookCommand,
    /// Running process, if any.
    running: Option<RunningWebhook>,
}

impl AuthWebhookManager {
    /// Creates a stopped manager.
    #[must_use]
    pub const fn new(ledger: Arc<PortLedger>, command: WebhookCommand) -> Self {
        Self {
            ledger,
            command,
            running: None,
        }
    }

    /// Returns `https://localhost:<port>` while the webhook runs.
    #[must_use]
    pub fn root_url(&self) -> Option<&str> {
        self.running.as_ref().map(|running| running.root_url.as_str())
    }

    /// Launches the webhook and verifies `verify_path`. Returns the root URL.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError`] when the port cannot be reserved, the process
    /// cannot be spawned or it does not answer the verification request. The
    /// process is stopped on failure.
    pub fn start(
        &mut self,
        tls: &WebhookTlsFiles,
        log_file: &Path,
        verify_path: &str,
    ) -> Result<String, WebhookError> {
        self.stop();
        let port = self.ledger.reserve(WEBHOOK_START_PORT).map_err(|err| WebhookError::Ledger(err.to_string()))?;
        let child = match self.spawn(port, tls, log_file) {
            Ok(child) => child,
            Err(err) => {
                if let Err(release) = self.ledger.release_ports(&[port]) {
                    warn!(port, error = %release, "failed to release webhook port");
                }
                return Err(err);
            }
        };
        if let Err(err) = self.ledger.assign_process(port, child.id(), Some(SERVICE_NAME)) {
            warn!(port, error = %err, "failed to assign webhook port");
        }
        let root_url = format!("https://localhost:{port}");
        info!(port, pid = child.id(), log = %log_file.display(), "auth webhook started");
        self.running = Some(RunningWebhook {
            child,
            port,
            root_url: root_url.clone(),
        });

        if let Err(err) = self.verify(&format!("{root_url}{verify_path}"), &tls.ca_cert_pem, log_file) {
            self.stop();
            return Err(err);
        }
        Ok(root_url)
    }

    /// Spawns the webhook process with output redirected to `log_file`.
    fn spawn(&self, port: u16, tls: &WebhookTlsFiles, log_file: &Path) -> Result<Child, WebhookError> {
        let stdout = File::create(log_file).map_err(|err| WebhookError::Launch(err.to_string()))?;
        let stderr = stdout.try_clone().map_err(|err| WebhookError::Launch(err.to_string()))?;
        Command::new(&self.command.program)
            .args(self.command.arguments(port, tls))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|err| {
                WebhookError::Launch(format!("{}: {err}", self.command.program.display()))
            })
    }

    /// Polls `url` until it answers as expected for its route.
    fn verify(&mut self, url: &str, ca_pem: &str, log_file: &Path) -> Result<(), WebhookError> {
        let not_ready = |message: String| WebhookError::NotReady {
            url: url.to_string(),
            message,
        };
        let ca = reqwest::Certificate::from_pem(ca_pem.as_bytes()).map_err(|err| not_ready(err.to_string()))?;
        let client = Client::builder()
            .tls_certs_only([ca])
            .timeout(VERIFY_TIMEOUT)
            .build()
            .map_err(|err| not_ready(err.to_string()))?;

        let mut last = String::from("no attempt made");
        for _ in 0..VERIFY_ATTEMPTS {
            if let Some(running) = self.running.as_mut()
                && let Ok(Some(status)) = running.child.try_wait()
            {
                let log = fs::read_to_string(log_file).unwrap_or_default();
                return Err(not_ready(format!("process exited with {status}\n{log}")));
            }
            match verification_request(&client, url).send() {
                Ok(response) if response.status().is_success() || !requires_success(url) => {
                    info!(url, status = response.status().as_u16(), "auth webhook verified");
                    return Ok(());
                }
                Ok(response) => last = format!("status {}", response.status()),
                Err(err) => last = err.to_string(),
            }
            thread::sleep(VERIFY_INTERVAL);
        }
        Err(not_ready(last))
    }

    /// Stops the webhook and releases its port. Safe to call repeatedly.
    pub fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        let pid = running.child.id();
        info!(port = running.port, pid, "stopping auth webhook");
        match interrupt_and_wait(&mut running.child, STOP_GRACE) {
            Some(status) => debug!(pid, status = %status, "auth webhook stopped"),
            None => warn!(pid, "auth webhook exit status unavailable"),
        }
        match self.ledger.release_owner(&PortOwner::Process(pid)) {
            Ok(ports) if ports.is_empty() => {
                if let Err(err) = self.ledger.release_ports(&[running.port]) {
                    warn!(port = running.port, error = %err, "failed to release webhook port");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(pid, error = %err, "failed to release webhook ports"),
        }
    }
}

impl Drop for AuthWebhookManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Builds the request that proves the route at `url` answers.
fn verification_request(client: &Client, url: &str) -> RequestBuilder {
    let request = client.get(url);
    if url.ends_with(TOKEN_ROUTE) {
        let token = STANDARD.encode(json!({"X-Hasura-Auth-Mode": "webhook"}).to_string());
        request.header(AUTHORIZATION, format!("Bearer {token}"))
    } else if url.ends_with(COOKIE_ROUTE) {
        request.header(COOKIE, "foo=bar")
    } else {
        request
    }
}

/// Known routes must answer 200; any response proves other routes are served.
fn requires_success(url: &str) -> bool {
    url.ends_with(TOKEN_ROUTE) || url.ends_with(COOKIE_ROUTE)
}
