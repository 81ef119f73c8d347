// crates/hge-harness-runner/src/scenario.rs
// ============================================================================
// Module: Scenario Runner
// Description: Provision, test and tear down one test case at a time.
// Purpose: Compose the managers in the order a test case needs them.
// Dependencies: hge-harness-config, hge-harness-ledger, tracing
// ============================================================================

//! ## Overview
//! A test case runs as: Postgres setup, engine launch, pytest. Scenarios that
//! ask for it restart their pgbouncer proxies and run pytest a second time.
//! Engines and Postgres are torn down after every test case, whatever the
//! outcome. A batch stops at the first failing test case.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hge_harness_config::TestCaseConfig;
use hge_harness_ledger::PortLedger;
use thiserror::Error;
use tracing::debug;
use tracing::info;

use crate::certs::SYSTEM_CERTS_DIR;
use crate::engine::DEFAULT_LIVENESS_TIMEOUT;
use crate::engine::EngineError;
use crate::engine::EngineManager;
use crate::engine::EngineSettings;
use crate::postgres::DEFAULT_READY_TIMEOUT;
use crate::postgres::PostgresError;
use crate::postgres::PostgresManager;
use crate::postgres::PostgresSettings;
use crate::pytest::PytestError;
use crate::pytest::PytestRunner;
use crate::topology::Topology;
use crate::webhook::WebhookCommand;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Pause between stopping and starting pgbouncer on a restart.
pub const PGBOUNCER_RESTART_DELAY: Duration = Duration::from_secs(20);

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Test case failures.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// The output directory could not be created.
    #[error("output directory error: {0}")]
    Output(String),
    /// Postgres or pgbouncer could not be provisioned.
    #[error(transparent)]
    Postgres(#[from] PostgresError),
    /// The engines could not be started.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// Pytest could not be started.
    #[error(transparent)]
    Pytest(PytestError),
    /// The suite reported failures.
    #[error("test suite failed with exit code {exit_code}")]
    TestSuiteFailed {
        /// Pytest exit code.
        exit_code: i32,
    },
}

impl From<PytestError> for ScenarioError {
    fn from(err: PytestError) -> Self {
        match err {
            PytestError::Failed {
                exit_code,
            } => Self::TestSuiteFailed {
                exit_code,
            },
            other @ PytestError::Launch { .. } => Self::Pytest(other),
        }
    }
}

// ============================================================================
// SECTION: Options
// ============================================================================

/// Run-wide inputs shared by every test case.
#[derive(Debug, Clone)]
pub struct ScenarioOptions {
    /// Output directory for logs and generated files.
    pub output_dir: PathBuf,
    /// Command that starts the auth webhook.
    pub webhook_command: WebhookCommand,
    /// Pytest invocation.
    pub pytest: PytestRunner,
    /// System CA directory copied into the webhook trust store.
    pub system_certs_dir: PathBuf,
    /// Time allowed for engines to become live.
    pub liveness_timeout: Duration,
    /// Time allowed for each database to accept connections.
    pub ready_timeout: Duration,
    /// Pause between stopping and starting pgbouncer on a restart.
    pub pgbouncer_restart_delay: Duration,
}

impl ScenarioOptions {
    /// Creates options with default timeouts.
    #[must_use]
    pub fn new(output_dir: PathBuf, webhook_command: WebhookCommand) -> Self {
        Self {
            output_dir,
            webhook_command,
            pytest: PytestRunner::default(),
            system_certs_dir: PathBuf::from(SYSTEM_CERTS_DIR),
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            pgbouncer_restart_delay: PGBOUNCER_RESTART_DELAY,
        }
    }
}

// ============================================================================
// SECTION: Runner
// ============================================================================

/// Runs test cases against freshly provisioned services.
pub struct ScenarioRunner {
    /// Shared port ledger.
    ledger: Arc<PortLedger>,
    /// Run-wide inputs.
    options: ScenarioOptions,
}

impl ScenarioRunner {
    /// Creates a runner.
    #[must_use]
    pub const fn new(ledger: Arc<PortLedger>, options: ScenarioOptions) -> Self {
        Self {
            ledger,
            options,
        }
    }

    /// Runs every test case in order, stopping at the first failure. Returns
    /// the number of test cases that passed.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing test case.
    pub fn run_all(&self, cases: &[TestCaseConfig]) -> Result<usize, ScenarioError> {
        for (index, case) in cases.iter().enumerate() {
            info!(
                case = index + 1,
                total = cases.len(),
                scenario = %case.scenario.name,
                auth = case.auth.kind().as_str(),
                "running test case"
            );
            self.run(case)?;
        }
        Ok(cases.len())
    }

    /// Runs one test case and tears everything down afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`ScenarioError`] when provisioning fails or the suite
    /// reports failures. Teardown has completed when this returns.
    pub fn run(&self, case: &TestCaseConfig) -> Result<(), ScenarioError> {
        fs::create_dir_all(&self.options.output_dir).map_err(|err| ScenarioError::Output(err.to_string()))?;
        if let Ok(yaml) = case.to_yaml() {
            debug!(conf_hash = %case.conf_hash, "test case:\n{yaml}");
        }

        let mut postgres = PostgresManager::new(
            Arc::clone(&self.ledger),
            PostgresSettings {
                output_dir: self.options.output_dir.clone(),
                source: case.postgres.clone(),
                with_pgbouncer: case.scenario.with_pgbouncer_proxy,
                ready_timeout: self.options.ready_timeout,
            },
        );
        let mut engine_settings = EngineSettings::for_test_case(case, &self.options.output_dir);
        engine_settings.system_certs_dir.clone_from(&self.options.system_certs_dir);
        engine_settings.liveness_timeout = self.options.liveness_timeout;
        let mut engines =
            EngineManager::new(Arc::clone(&self.ledger), engine_settings, self.options.webhook_command.clone());

        let result = self.run_steps(case, &mut postgres, &mut engines);
        engines.teardown();
        postgres.teardown();

        if result.is_ok() {
            info!("PASSED scenario: {}, auth: {}", case.scenario.name, case.auth.kind().as_str());
        }
        result
    }

    /// Runs the provisioning and test steps of `case`.
    fn run_steps(
        &self,
        case: &TestCaseConfig,
        postgres: &mut PostgresManager,
        engines: &mut EngineManager,
    ) -> Result<(), ScenarioError> {
        let db_urls = postgres.setup()?;
        let topology = engines.run(&db_urls)?;
        self.run_pytest(&topology, case)?;

        if case.scenario.rerun_after_pgbouncer_restart {
            postgres.restart_pgbouncer_proxies(self.options.pgbouncer_restart_delay)?;
            info!(scenario = %case.scenario.name, "re-running tests after pgbouncer restart");
            self.run_pytest(&topology, case)?;
        }
        Ok(())
    }

    /// Runs pytest against `topology`.
    fn run_pytest(&self, topology: &Topology, case: &TestCaseConfig) -> Result<(), ScenarioError> {
        self.options.pytest.run(topology, &case.scenario, &case.extra_pytest_args).map_err(ScenarioError::from)
    }
}
