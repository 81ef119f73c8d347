// crates/hge-harness-cli/src/main.rs
// ============================================================================
// Module: Harness CLI Entry Point
// Description: Command dispatcher for test runs, validation and maintenance.
// Purpose: Run GraphQL engine end-to-end scenarios from the command line.
// Dependencies: clap, hge-harness-config, hge-harness-ledger, hge-harness-runner
// ============================================================================

//! ## Overview
//! `hge-harness run` loads test cases (from `-f FILE` or from options with
//! `HASURA_TEST_*` fallbacks), then provisions and tests them one by one.
//! `validate` and `scenarios` inspect configuration without starting
//! anything, `ledger` maintains the shared port ledger, and `auth-webhook` is
//! the entry point of the webhook process the harness launches itself.

// ============================================================================
// SECTION: Modules
// ============================================================================


// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use hge_harness_config::ArgOverrides;
use hge_harness_config::HarnessSettings;
use hge_harness_config::ScenarioCatalog;
use hge_harness_config::TestCaseConfig;
use hge_harness_config::expand_test_cases;
use hge_harness_config::read_document;
use hge_harness_ledger::LedgerConfig;
use hge_harness_ledger::LedgerMode;
use hge_harness_ledger::PortLedger;
use hge_harness_ledger::PortOwner;
use hge_harness_runner::PytestRunner;
use hge_harness_runner::ScenarioOptions;
use hge_harness_runner::ScenarioRunner;
use hge_harness_runner::WebhookCommand;
use hge_harness_runner::init_tracing;
use hge_harness_runner::webhook::WebhookServerConfig;
use hge_harness_runner::webhook::server::run_blocking;
use thiserror::Error;
use tracing::info;
use tracing::warn;

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Top-level CLI definition.
#[derive(Parser, Debug)]
#[command(name = "hge-harness", version, disable_help_subcommand = true)]
struct Cli {
    /// Log at debug level regardless of `HASURA_TEST_LOGLEVEL`.
    #[arg(long, global = true)]
    verbose: bool,
    /// Selected subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision services and run the pytest suite for every test case.
    Run(RunCommand),
    /// Load, expand and print test cases without starting anything.
    Validate(TestCaseArgs),
    /// List catalog scenarios with their allowed auth modes.
    Scenarios,
    /// Port ledger maintenance.
    Ledger {
        /// Selected ledger subcommand.
        #[command(subcommand)]
        command: LedgerCommand,
    },
    /// Serve the auth webhook over TLS until interrupted.
    AuthWebhook(AuthWebhookCommand),
}

/// Options selecting the test cases to run.
#[derive(Args, Debug, Default)]
struct TestCaseArgs {
    /// Test case YAML file, `-` for stdin.
    #[arg(
        short = 'f',
        long = "file",
        value_name = "FILE",
        conflicts_with_all = [
            "pg_urls",
            "pg_docker_image",
            "hge_docker_image",
            "hge_executable",
            "hge_rts_opts",
            "scenario",
            "auth",
        ]
    )]
    file: Option<PathBuf>,
    /// Comma separated Postgres URLs (`HASURA_TEST_PG_URLS`).
    #[arg(long, value_name = "URLS")]
    pg_urls: Option<String>,
    /// Postgres docker image (`HASURA_TEST_PG_DOCKER_IMAGE`).
    #[arg(long, value_name = "IMAGE")]
    pg_docker_image: Option<String>,
    /// Engine docker image (`HASURA_TEST_HGE_DOCKER_IMAGE`).
    #[arg(long, value_name = "IMAGE")]
    hge_docker_image: Option<String>,
    /// Engine executable (`HASURA_TEST_GRAPHQL_ENGINE`).
    #[arg(long, value_name = "PATH")]
    hge_executable: Option<String>,
    /// Space separated engine RTS options (`HASURA_TEST_HGE_RTS_OPTS`).
    #[arg(long, value_name = "OPTS", allow_hyphen_values = true)]
    hge_rts_opts: Option<String>,
    /// Scenario name or inline YAML (`HASURA_TEST_SCENARIO`).
    #[arg(long, value_name = "SCENARIO")]
    scenario: Option<String>,
    /// Auth name or inline YAML (`HASURA_TEST_AUTH`).
    #[arg(long, value_name = "AUTH")]
    auth: Option<String>,
    /// Extra pytest arguments, given after `--`.
    #[arg(last = true, value_name = "PYTEST_ARGS")]
    pytest_args: Vec<String>,
}

impl TestCaseArgs {
    /// Returns the topology options as overrides.
    fn overrides(&self) -> ArgOverrides {
        ArgOverrides {
            pg_urls: self.pg_urls.clone(),
            pg_docker_image: self.pg_docker_image.clone(),
            hge_docker_image: self.hge_docker_image.clone(),
            hge_executable: self.hge_executable.clone(),
            hge_rts_opts: self.hge_rts_opts.clone(),
            scenario: self.scenario.clone(),
            auth: self.auth.clone(),
        }
    }
}

/// Configuration for the `run` command.
#[derive(Args, Debug)]
struct RunCommand {
    /// Test case selection.
    #[command(flatten)]
    test_cases: TestCaseArgs,
    /// Pytest executable.
    #[arg(long, value_name = "PROGRAM", default_value = "pytest")]
    pytest: PathBuf,
    /// Directory pytest runs in.
    #[arg(long, value_name = "DIR")]
    pytest_dir: Option<PathBuf>,
}

/// Ledger subcommands.
#[derive(Subcommand, Debug)]
enum LedgerCommand {
    /// List reserved ports and their owners.
    List,
    /// Release ports by port, process or container.
    Release(LedgerReleaseCommand),
    /// Remove entries of dead owners and expired reservations.
    Sweep,
    /// List registered coverage files.
    HpcFiles,
}

/// Configuration for `ledger release`; exactly one selector is required.
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct LedgerReleaseCommand {
    /// Comma separated ports.
    #[arg(long, value_name = "PORTS", value_delimiter = ',')]
    ports: Vec<u16>,
    /// Owning process id.
    #[arg(long, value_name = "PID")]
    pid: Option<u32>,
    /// Owning container name.
    #[arg(long, value_name = "NAME")]
    container: Option<String>,
}

/// Configuration for the `auth-webhook` command.
#[derive(Args, Debug)]
struct AuthWebhookCommand {
    /// Port to listen on.
    #[arg(long, value_name = "PORT")]
    port: u16,
    /// Leaf certificate PEM file.
    #[arg(long, value_name = "PATH")]
    cert: PathBuf,
    /// Leaf private key PEM file.
    #[arg(long, value_name = "PATH")]
    key: PathBuf,
    /// Address to bind.
    #[arg(long, value_name = "ADDR", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    host: IpAddr,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI error wrapper for user-facing error messages.
#[derive(Debug, Error)]
#[error("{message}")]
struct CliError {
    /// Human-readable error message.
    message: String,
}

impl CliError {
    /// Constructs a new [`CliError`] from a message.
    const fn new(message: String) -> Self {
        Self {
            message,
        }
    }
}

/// CLI result alias for fallible operations.
type CliResult<T> = Result<T, CliError>;

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point returning an exit code.
fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => emit_error(&err.to_string()),
    }
}

/// Executes the CLI command dispatcher.
fn run() -> CliResult<ExitCode> {
    let cli = Cli::parse();
    let settings = HarnessSettings::load().map_err(|err| CliError::new(err.to_string()))?;
    init_tracing(&settings.log_level, cli.verbose).map_err(|err| CliError::new(err.to_string()))?;

    match cli.command {
        Commands::Run(command) => command_run(command, &settings),
        Commands::Validate(args) => command_validate(&args),
        Commands::Scenarios => command_scenarios(),
        Commands::Ledger {
            command,
        } => command_ledger(command, &settings),
        Commands::AuthWebhook(command) => command_auth_webhook(command),
    }
}

// ============================================================================
// SECTION: Test Case Commands
// ============================================================================

/// Loads and expands the selected test cases.
fn load_test_cases(args: &TestCaseArgs) -> CliResult<Vec<TestCaseConfig>> {
    let config_error = |err: hge_harness_config::ConfigError| CliError::new(err.to_string());
    let catalog = ScenarioCatalog::builtin().map_err(config_error)?;
    let document = match &args.file {
        Some(path) => read_document(path).map_err(config_error)?,
        None => args.overrides().with_env_fallback().and_then(|overrides| overrides.to_document()).map_err(config_error)?,
    };
    expand_test_cases(&document, &args.pytest_args, &catalog).map_err(config_error)
}

/// Executes the `run` command.
fn command_run(command: RunCommand, settings: &HarnessSettings) -> CliResult<ExitCode> {
    let cases = load_test_cases(&command.test_cases)?;
    fs::create_dir_all(&settings.output_dir).map_err(|err| {
        CliError::new(format!("failed to create {}: {err}", settings.output_dir.display()))
    })?;
    let ledger = PortLedger::open_or_probe_only(LedgerConfig::new(settings.ledger_path.clone()));
    if ledger.mode() == LedgerMode::ProbeOnly {
        warn!(ledger = %settings.ledger_path.display(), "port ledger unavailable; probing ports only");
    }

    let webhook_command = WebhookCommand::current_exe().map_err(|err| CliError::new(err.to_string()))?;
    let mut options = ScenarioOptions::new(settings.output_dir.clone(), webhook_command);
    options.pytest = PytestRunner {
        program: command.pytest,
        working_dir: command.pytest_dir,
    };
    info!(count = cases.len(), output = %settings.output_dir.display(), "starting test run");
    let passed = ScenarioRunner::new(Arc::new(ledger), options)
        .run_all(&cases)
        .map_err(|err| CliError::new(err.to_string()))?;
    write_line(&format!("{passed} test case(s) passed"))?;
    Ok(ExitCode::SUCCESS)
}

/// Executes the `validate` command.
fn command_validate(args: &TestCaseArgs) -> CliResult<ExitCode> {
    let cases = load_test_cases(args)?;
    for (index, case) in cases.iter().enumerate() {
        write_line(&format!(
            "# test case {}: scenario {}, auth {}, hash {}",
            index + 1,
            case.scenario.name,
            case.auth.kind(),
            case.conf_hash
        ))?;
        let yaml = case.to_yaml().map_err(|err| CliError::new(err.to_string()))?;
        write_line(yaml.trim_end())?;
    }
    Ok(ExitCode::SUCCESS)
}

/// Executes the `scenarios` command.
fn command_scenarios() -> CliResult<ExitCode> {
    let catalog = ScenarioCatalog::builtin().map_err(|err| CliError::new(err.to_string()))?;
    for scenario in catalog.iter() {
        write_line(&format!("{}\t{}", scenario.name, scenario.allowed_auth_list()))?;
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Ledger Commands
// ============================================================================

/// Executes a `ledger` subcommand.
fn command_ledger(command: LedgerCommand, settings: &HarnessSettings) -> CliResult<ExitCode> {
    let ledger_error = |err: hge_harness_ledger::LedgerError| CliError::new(err.to_string());
    let ledger = PortLedger::open(LedgerConfig::new(settings.ledger_path.clone())).map_err(ledger_error)?;
    match command {
        LedgerCommand::List => {
            for entry in ledger.list_reserved().map_err(ledger_error)? {
                let owner = entry.owner.map_or_else(|| "unassigned".to_string(), |owner| owner.to_string());
                let service = entry.service.unwrap_or_else(|| "-".to_string());
                write_line(&format!("{}\t{owner}\t{service}", entry.port))?;
            }
        }
        LedgerCommand::Release(release) => {
            let released = if let Some(pid) = release.pid {
                ledger.release_owner(&PortOwner::Process(pid)).map_err(ledger_error)?
            } else if let Some(container) = release.container {
                ledger.release_owner(&PortOwner::Container(container)).map_err(ledger_error)?
            } else {
                ledger.release_ports(&release.ports).map_err(ledger_error)?;
                release.ports
            };
            for port in released {
                write_line(&format!("released {port}"))?;
            }
        }
        LedgerCommand::Sweep => {
            let removed = ledger.sweep_stale().map_err(ledger_error)?;
            write_line(&format!("removed {removed} stale reservation(s)"))?;
        }
        LedgerCommand::HpcFiles => {
            for path in ledger.hpc_files().map_err(ledger_error)? {
                write_line(&path.display().to_string())?;
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Auth Webhook Command
// ============================================================================

/// Executes the `auth-webhook` command.
fn command_auth_webhook(command: AuthWebhookCommand) -> CliResult<ExitCode> {
    let config = WebhookServerConfig {
        addr: SocketAddr::new(command.host, command.port),
        cert_file: command.cert,
        key_file: command.key,
    };
    run_blocking(config).map_err(|err| CliError::new(err.to_string()))?;
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Output Helpers
// ============================================================================

/// Writes a single line to stdout.
fn write_stdout_line(message: &str) -> std::io::Result<()> {
    let mut stdout = std::io::stdout();
    writeln!(&mut stdout, "{message}")
}

/// Writes a line to stdout, mapping failures to [`CliError`].
fn write_line(message: &str) -> CliResult<()> {
    write_stdout_line(message).map_err(|err| CliError::new(format!("failed to write to stdout: {err}")))
}

/// Writes a single line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")
}

/// Emits an error message to stderr and returns a failure exit code.
fn emit_error(message: &str) -> ExitCode {
    let _ = write_stderr_line(message);
    ExitCode::FAILURE
}
