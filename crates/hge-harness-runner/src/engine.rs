// crates/hge-harness-runner/src/engine.rs
// ============================================================================
// Module: Engine Manager
// Description: Launch, watch and stop the GraphQL engine instances.
// Purpose: Turn database URLs into live engine URLs for one test case.
// Dependencies: hge-harness-ledger, reqwest, testcontainers, tracing
// ============================================================================

//! ## Overview
//! One primary instance is started per database URL, plus one replica per
//! URL when the scenario asks for replicas. Each instance gets a port claimed
//! from 8080 upward, its own log and coverage files, and an env assembled from
//! defaults, the auth material and the scenario. Instances run as
//! subprocesses or as host-network containers.
//!
//! Each instance moves through [`InstanceState`]: `Starting` on launch,
//! `Running` once its version endpoint answers, `Stopping` and `Stopped`
//! during teardown. An instance that exits before that point fails the run
//! with its captured log. Replicas are launched only after every primary is
//! live.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::path::Path;
use std::path::PathBuf;
use std::process::Child;
use std::process::Command;
use std::process::Stdio;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use hge_harness_config::AuthConfig;
use hge_harness_config::EngineConfig;
use hge_harness_config::EngineLaunch;
use hge_harness_config::ScenarioDef;
use hge_harness_config::TestCaseConfig;
use hge_harness_ledger::PortLedger;
use hge_harness_ledger::PortOwner;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use testcontainers::Container;
use testcontainers::GenericImage;
use testcontainers::ImageExt;
use testcontainers::core::AccessMode;
use testcontainers::core::Mount;
use testcontainers::runners::SyncRunner;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::auth::AuthMaterial;
use crate::certs::CertError;
use crate::certs::SYSTEM_CERTS_DIR;
use crate::child::interrupt_and_wait;
use crate::docker::collected_logs;
use crate::docker::container_name;
use crate::docker::generic_image;
use crate::docker::spawn_log_collectors;
use crate::docker::stop_and_remove;
use crate::topology::Topology;
use crate::webhook::AuthWebhookManager;
use crate::webhook::WebhookCommand;
use crate::webhook::WebhookError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// First port probed for an engine instance.
pub const ENGINE_START_PORT: u16 = 8080;

/// First port probed for the pytest events webhook.
pub const EVENTS_WEBHOOK_START_PORT: u16 = 5592;

/// First port probed for the pytest remote GraphQL server.
pub const REMOTE_GQL_START_PORT: u16 = 6000;

/// Default liveness timeout.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(20);

/// Delay between liveness attempts.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Per-request timeout of liveness requests.
const LIVENESS_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause between instance launches.
const LAUNCH_STAGGER: Duration = Duration::from_millis(200);

/// Grace period after SIGINT before an engine is killed.
const STOP_GRACE: Duration = Duration::from_secs(30);

/// Ledger service name of an engine.
const SERVICE_NAME: &str = "GraphQL engine";

/// Env applied to every instance before auth and scenario env.
const DEFAULT_ENV: [(&str, &str); 3] = [
    ("HASURA_GRAPHQL_ENABLE_TELEMETRY", "false"),
    ("EVENT_WEBHOOK_HEADER", "MyEnvValue"),
    ("HASURA_GRAPHQL_STRINGIFY_NUMERIC_TYPES", "true"),
];

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Engine manager errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Auth material could not be generated.
    #[error("auth material failed: {0}")]
    Auth(#[from] CertError),
    /// The auth webhook could not be started.
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    /// The port ledger rejected an operation.
    #[error("engine port error: {0}")]
    Ledger(String),
    /// An instance could not be launched.
    #[error("failed to launch {instance}: {message}")]
    Launch {
        /// Instance label.
        instance: String,
        /// Launch failure.
        message: String,
    },
    /// An instance exited before the run finished starting.
    #[error("{instance} exited during startup:\n{log}")]
    Exited {
        /// Instance label.
        instance: String,
        /// Captured output of the instance.
        log: String,
    },
    /// Instances did not answer their version endpoint in time.
    #[error("engines not live after {timeout_secs}s: {urls}")]
    LivenessTimeout {
        /// URLs that never answered.
        urls: String,
        /// Timeout that expired.
        timeout_secs: u64,
    },
    /// The liveness client could not be built.
    #[error("liveness client failed: {0}")]
    Client(String),
}

// ============================================================================
// SECTION: Settings
// ============================================================================

/// Inputs of the engine manager for one test case.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Output directory for logs, coverage files and auth material.
    pub output_dir: PathBuf,
    /// How instances are launched.
    pub engine: EngineConfig,
    /// Scenario being run.
    pub scenario: ScenarioDef,
    /// Resolved auth mode.
    pub auth: AuthConfig,
    /// Hash namespacing log and coverage files.
    pub conf_hash: String,
    /// System CA directory copied into the custom trust store.
    pub system_certs_dir: PathBuf,
    /// Time allowed for instances to become live.
    pub liveness_timeout: Duration,
}

impl EngineSettings {
    /// Builds settings for `case` with default timeouts.
    #[must_use]
    pub fn for_test_case(case: &TestCaseConfig, output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            engine: case.engine.clone(),
            scenario: case.scenario.clone(),
            auth: case.auth.clone(),
            conf_hash: case.conf_hash.clone(),
            system_certs_dir: PathBuf::from(SYSTEM_CERTS_DIR),
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
        }
    }

    /// Returns the log/coverage path prefix of instance `index`.
    #[must_use]
    pub fn instance_prefix(&self, index: usize) -> PathBuf {
        self.output_dir.join(format!(
            "graphql-engine-{index}-{}-{}-{}",
            self.auth.kind().as_str(),
            self.scenario.name,
            self.conf_hash
        ))
    }
}

// ============================================================================
// SECTION: Instance Env And Arguments
// ============================================================================

/// Per-instance inputs of the engine env.
#[derive(Debug, Clone, Copy)]
pub struct InstanceEnv<'a> {
    /// Database URL.
    pub db_url: &'a str,
    /// Engine server port.
    pub port: u16,
    /// Events webhook port of the primary.
    pub events_port: u16,
    /// Coverage file.
    pub tix_file: &'a Path,
}

/// Builds the env of one instance. Later layers win: defaults, instance
/// values, `auth_env`, `scenario_env`.
#[must_use]
pub fn engine_env(
    instance: &InstanceEnv<'_>,
    auth_env: &BTreeMap<String, String>,
    scenario_env: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> =
        DEFAULT_ENV.iter().map(|(key, value)| ((*key).to_string(), (*value).to_string())).collect();
    env.insert("HPCTIXFILE".to_string(), instance.tix_file.display().to_string());
    env.insert("WEBHOOK_FROM_ENV".to_string(), format!("http://127.0.0.1:{}", instance.events_port));
    env.insert("HASURA_GRAPHQL_DATABASE_URL".to_string(), instance.db_url.to_string());
    env.insert("HASURA_GRAPHQL_SERVER_PORT".to_string(), instance.port.to_string());
    env.extend(auth_env.iter().map(|(key, value)| (key.clone(), value.clone())));
    env.extend(scenario_env.iter().map(|(key, value)| (key.clone(), value.clone())));
    env
}

/// Appends `suffix` to the file name of `prefix`.
fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut path = prefix.as_os_str().to_os_string();
    path.push(suffix);
    PathBuf::from(path)
}

/// Returns whether an env entry is worth logging.
fn is_logged_env_key(key: &str) -> bool {
    key.starts_with("HASURA_GRAPHQL") || key.contains("WEBHOOK")
}

/// Builds the `serve` arguments: scenario args, then `+RTS .. -RTS`.
#[must_use]
pub fn serve_args(hge_args: &[String], rts_opts: &[String]) -> Vec<String> {
    let mut args = hge_args.to_vec();
    if !rts_opts.is_empty() {
        args.push("+RTS".to_string());
        args.extend(rts_opts.iter().cloned());
        args.push("-RTS".to_string());
    }
    args
}

/// Returns the full command line that serves with `args`.
#[must_use]
pub fn serve_command(launch: &EngineLaunch, args: &[String]) -> Vec<String> {
    let mut command: Vec<String> = match launch {
        EngineLaunch::StackExec => ["stack", "exec", "graphql-engine", "--", "serve"]
            .iter()
            .map(ToString::to_string)
            .collect(),
        EngineLaunch::Executable(path) => vec![path.to_string_lossy().into_owned(), "serve".to_string()],
        EngineLaunch::Docker(_) => vec!["graphql-engine".to_string(), "serve".to_string()],
    };
    command.extend(args.iter().cloned());
    command
}

// ============================================================================
// SECTION: Liveness
// ============================================================================

/// Returns whether `url` answers `GET /v1/version` with 200.
fn is_live(client: &Client, url: &str) -> bool {
    match client.get(format!("{url}/v1/version")).send() {
        Ok(response) => response.status() == StatusCode::OK,
        Err(err) => {
            debug!(url, error = %err, "engine not answering yet");
            false
        }
    }
}

/// Polls every URL once per second until all answer or `timeout` expires.
/// `check_alive` runs before each round and aborts the wait on error.
///
/// # Errors
///
/// Returns the error of `check_alive`, or [`EngineError::LivenessTimeout`]
/// naming the URLs that never answered.
pub fn wait_for_liveness<F>(urls: &[String], timeout: Duration, mut check_alive: F) -> Result<(), EngineError>
where
    F: FnMut() -> Result<(), EngineError>,
{
    let client = Client::builder()
        .timeout(LIVENESS_REQUEST_TIMEOUT)
        .build()
        .map_err(|err| EngineError::Client(err.to_string()))?;
    let start = Instant::now();
    loop {
        check_alive()?;
        let pending: Vec<&str> =
            urls.iter().map(String::as_str).filter(|url| !is_live(&client, url)).collect();
        if pending.is_empty() {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(EngineError::LivenessTimeout {
                urls: pending.join(", "),
                timeout_secs: timeout.as_secs(),
            });
        }
        debug!(pending = pending.len(), "waiting for engines");
        thread::sleep(LIVENESS_INTERVAL);
    }
}

// ============================================================================
// SECTION: Instances
// ============================================================================

/// Lifecycle state of an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Not running.
    Stopped,
    /// Launched, not yet live.
    Starting,
    /// Answering its version endpoint.
    Running,
    /// Being stopped.
    Stopping,
}

/// Handle of a launched instance.
enum Launched {
    /// Subprocess.
    Process(Child),
    /// Container.
    Container {
        /// Container name, the ledger owner of its port.
        name: String,
        /// Container handle.
        container: Container<GenericImage>,
        /// Log collector threads.
        collectors: Vec<JoinHandle<()>>,
    },
}

/// One engine instance.
struct EngineInstance {
    /// `graphql-engine-<n>`.
    label: String,
    /// Whether this is a replica.
    replica: bool,
    /// `http://localhost:<port>`.
    url: String,
    /// Log file.
    log_file: PathBuf,
    /// Lifecycle state.
    state: InstanceState,
    /// Launch handle while running.
    launched: Option<Launched>,
}

impl EngineInstance {
    /// Returns the captured log when the instance has exited.
    fn exited_log(&mut self) -> Option<String> {
        let exited = match self.launched.as_mut()? {
            Launched::Process(child) => matches!(child.try_wait(), Ok(Some(_))),
            Launched::Container {
                container,
                ..
            } => matches!(container.is_running(), Ok(false)),
        };
        if !exited {
            return None;
        }
        self.state = InstanceState::Stopped;
        let log = match self.launched.as_ref() {
            Some(Launched::Container {
                container,
                ..
            }) => collected_logs(container),
            _ => fs::read_to_string(&self.log_file).unwrap_or_default(),
        };
        Some(log)
    }
}

// ============================================================================
// SECTION: Manager
// ============================================================================

/// Launches and stops the engine instances of one test case.
pub struct EngineManager {
    /// Shared port ledger.
    ledger: Arc<PortLedger>,
    /// Test case inputs.
    settings: EngineSettings,
    /// Auth webhook process.
    webhook: AuthWebhookManager,
    /// Generated auth material.
    auth: Option<AuthMaterial>,
    /// Full auth webhook URL while the webhook runs.
    webhook_url: Option<String>,
    /// Launched instances, primaries first.
    instances: Vec<EngineInstance>,
    /// Events webhook ports, one per primary.
    evts_ports: Vec<u16>,
    /// Remote GraphQL ports, one per primary.
    remote_ports: Vec<u16>,
}

impl EngineManager {
    /// Creates a manager with nothing running.
    #[must_use]
    pub fn new(ledger: Arc<PortLedger>, settings: EngineSettings, webhook_command: WebhookCommand) -> Self {
        let webhook = AuthWebhookManager::new(Arc::clone(&ledger), webhook_command);
        Self {
            ledger,
            settings,
            webhook,
            auth: None,
            webhook_url: None,
            instances: Vec::new(),
            evts_ports: Vec::new(),
            remote_ports: Vec::new(),
        }
    }

    /// Returns the label and state of every instance.
    #[must_use]
    pub fn instance_states(&self) -> Vec<(String, InstanceState)> {
        self.instances.iter().map(|instance| (instance.label.clone(), instance.state)).collect()
    }

    /// Prepares auth, launches every instance against `db_urls` and waits
    /// until all of them are live.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when auth material, the webhook, a port or a
    /// launch fails, when an instance exits early, or when liveness times
    /// out. Whatever was started stays owned by the manager for
    /// [`Self::teardown`].
    pub fn run(&mut self, db_urls: &[String]) -> Result<Topology, EngineError> {
        self.teardown();
        self.instances.clear();
        fs::create_dir_all(&self.settings.output_dir).map_err(|err| EngineError::Launch {
            instance: "output directory".to_string(),
            message: err.to_string(),
        })?;
        self.start_auth()?;

        let auth_env = self.auth.as_ref().map(|auth| auth.engine_env(self.webhook_url.as_deref())).unwrap_or_default();
        let replicas: &[bool] = if self.settings.scenario.with_hge_replica { &[false, true] } else { &[false] };
        let mut engine_port = ENGINE_START_PORT;
        let mut evts_port = EVENTS_WEBHOOK_START_PORT;
        let mut remote_port = REMOTE_GQL_START_PORT;

        for &replica in replicas {
            for (db_index, db_url) in db_urls.iter().enumerate() {
                let events_port = if replica {
                    self.evts_ports.get(db_index).copied().unwrap_or(EVENTS_WEBHOOK_START_PORT)
                } else {
                    let events = self.reserve(evts_port)?;
                    self.evts_ports.push(events);
                    evts_port = events.saturating_add(1);
                    let remote = self.reserve(remote_port)?;
                    self.remote_ports.push(remote);
                    remote_port = remote.saturating_add(1);
                    events
                };
                if replica {
                    let primaries = self.urls(false);
                    self.wait_until_live(&primaries)?;
                }
                let port = self.reserve(engine_port)?;
                engine_port = port.saturating_add(1);
                if let Err(err) = self.launch(replica, port, db_url, events_port, &auth_env) {
                    if let Err(release) = self.ledger.release_ports(&[port]) {
                        warn!(port, error = %release, "failed to release engine port");
                    }
                    return Err(err);
                }
                thread::sleep(LAUNCH_STAGGER);
            }
        }

        let mut all_urls = self.urls(false);
        all_urls.extend(self.urls(true));
        info!(count = all_urls.len(), "waiting for engines to be live");
        self.wait_until_live(&all_urls)?;
        Ok(self.topology(db_urls))
    }

    /// Generates auth material and starts the webhook when required.
    fn start_auth(&mut self) -> Result<(), EngineError> {
        let auth = AuthMaterial::prepare(
            &self.settings.auth,
            &self.settings.scenario,
            &self.settings.output_dir,
            &self.settings.system_certs_dir,
        )?;
        let plan = auth.webhook.clone();
        self.auth = Some(auth);
        if let Some(plan) = plan {
            let root = self.webhook.start(&plan.tls, &plan.log_file, &plan.path)?;
            let url = format!("{root}{}", plan.path);
            info!(url = %url, mode = plan.mode.env_value(), "auth webhook ready");
            self.webhook_url = Some(url);
        }
        Ok(())
    }

    /// Claims a port for the harness process.
    fn reserve(&self, start: u16) -> Result<u16, EngineError> {
        self.ledger.reserve(start).map_err(|err| EngineError::Ledger(err.to_string()))
    }

    /// Returns the URLs of the primaries or of the replicas.
    fn urls(&self, replica: bool) -> Vec<String> {
        self.instances
            .iter()
            .filter(|instance| instance.replica == replica)
            .map(|instance| instance.url.clone())
            .collect()
    }

    /// Waits until `urls` are live, failing fast when an instance exits.
    fn wait_until_live(&mut self, urls: &[String]) -> Result<(), EngineError> {
        let timeout = self.settings.liveness_timeout;
        wait_for_liveness(urls, timeout, || self.check_not_exited())?;
        for instance in &mut self.instances {
            if instance.state == InstanceState::Starting && urls.contains(&instance.url) {
                instance.state = InstanceState::Running;
            }
        }
        Ok(())
    }

    /// Fails with the captured log of the first instance that has exited.
    fn check_not_exited(&mut self) -> Result<(), EngineError> {
        for instance in &mut self.instances {
            if let Some(log) = instance.exited_log() {
                return Err(EngineError::Exited {
                    instance: instance.label.clone(),
                    log,
                });
            }
        }
        Ok(())
    }

    /// Launches one instance on `port`; the caller releases `port` on failure.
    fn launch(
        &mut self,
        replica: bool,
        port: u16,
        db_url: &str,
        events_port: u16,
        auth_env: &BTreeMap<String, String>,
    ) -> Result<(), EngineError> {
        let index = self.instances.len() + 1;
        let label = format!("graphql-engine-{index}");
        let launch_error = |message: String| EngineError::Launch {
            instance: label.clone(),
            message,
        };
        let prefix = std::path::absolute(self.settings.instance_prefix(index))
            .map_err(|err| launch_error(err.to_string()))?;
        let log_file = with_suffix(&prefix, ".log");
        let tix_file = with_suffix(&prefix, ".tix");
        if let Err(err) = self.ledger.add_hpc_file(&tix_file) {
            warn!(tix = %tix_file.display(), error = %err, "failed to register coverage file");
        }

        let env = engine_env(
            &InstanceEnv {
                db_url,
                port,
                events_port,
                tix_file: &tix_file,
            },
            auth_env,
            &self.settings.scenario.hge_env,
        );
        for (key, value) in env.iter().filter(|(key, _)| is_logged_env_key(key)) {
            info!(instance = %label, key = %key, value = %value, "engine env");
        }
        let args = serve_args(&self.settings.scenario.hge_args, &self.settings.engine.rts_opts);
        let command = serve_command(&self.settings.engine.launch, &args);
        info!(instance = %label, replica, command = %command.join(" "), "launching engine");

        let launched = match &self.settings.engine.launch {
            EngineLaunch::Docker(image) => self.start_container(&label, image, port, command, &env, &log_file),
            EngineLaunch::StackExec | EngineLaunch::Executable(_) => {
                self.spawn_process(&label, port, &command, &env, &log_file)
            }
        };
        let launched = launched?;

        self.instances.push(EngineInstance {
            label,
            replica,
            url: format!("http://localhost:{port}"),
            log_file,
            state: InstanceState::Starting,
            launched: Some(launched),
        });
        Ok(())
    }

    /// Spawns a subprocess with output redirected to `log_file`.
    fn spawn_process(
        &self,
        label: &str,
        port: u16,
        command: &[String],
        env: &BTreeMap<String, String>,
        log_file: &Path,
    ) -> Result<Launched, EngineError> {
        let launch_error = |message: String| EngineError::Launch {
            instance: label.to_string(),
            message,
        };
        let Some((program, args)) = command.split_first() else {
            return Err(launch_error("empty command".to_string()));
        };
        let stdout = File::create(log_file).map_err(|err| launch_error(err.to_string()))?;
        let stderr = stdout.try_clone().map_err(|err| launch_error(err.to_string()))?;
        let child = Command::new(program)
            .args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|err| launch_error(format!("{program}: {err}")))?;
        if let Err(err) = self.ledger.assign_process(port, child.id(), Some(SERVICE_NAME)) {
            warn!(port, error = %err, "failed to assign engine port");
        }
        info!(instance = label, pid = child.id(), port, log = %log_file.display(), "engine started");
        Ok(Launched::Process(child))
    }

    /// Starts a host-network container streaming its output to `log_file`.
    fn start_container(
        &self,
        label: &str,
        image: &hge_harness_config::DockerImage,
        port: u16,
        command: Vec<String>,
        env: &BTreeMap<String, String>,
        log_file: &Path,
    ) -> Result<Launched, EngineError> {
        let launch_error = |message: String| EngineError::Launch {
            instance: label.to_string(),
            message,
        };
        let name = container_name("hge", port);
        let mut request = generic_image(image).with_cmd(command).with_network("host").with_container_name(name.clone());
        for (key, value) in env {
            request = request.with_env_var(key.clone(), value.clone());
        }
        if let Some(plan) = self.auth.as_ref().and_then(|auth| auth.webhook.as_ref()) {
            let certs_dir = plan.tls.certs_dir.display().to_string();
            request = request
                .with_mount(Mount::bind_mount(certs_dir.clone(), certs_dir).with_access_mode(AccessMode::ReadOnly));
        }
        info!(instance = label, image = %image, container = %name, "starting engine container");
        let container = request.start().map_err(|err| launch_error(err.to_string()))?;
        let collectors = match spawn_log_collectors(&container, log_file) {
            Ok(collectors) => collectors,
            Err(err) => {
                warn!(container = %name, error = %err, "failed to collect engine logs");
                Vec::new()
            }
        };
        if let Err(err) = self.ledger.assign_container(port, &name, Some(SERVICE_NAME)) {
            warn!(port, error = %err, "failed to assign engine port");
        }
        Ok(Launched::Container {
            name,
            container,
            collectors,
        })
    }

    /// Builds the topology handed to pytest.
    fn topology(&self, db_urls: &[String]) -> Topology {
        let auth = self.auth.as_ref();
        let mut log_files: Vec<PathBuf> =
            self.instances.iter().filter(|instance| !instance.replica).map(|instance| instance.log_file.clone()).collect();
        log_files.extend(
            self.instances.iter().filter(|instance| instance.replica).map(|instance| instance.log_file.clone()),
        );
        Topology {
            engine_urls: self.urls(false),
            replica_urls: self.urls(true),
            pg_urls: db_urls.to_vec(),
            evts_webhook_ports: self.evts_ports.clone(),
            remote_gql_ports: self.remote_ports.clone(),
            log_files,
            admin_secret: auth.and_then(|auth| auth.admin_secret.clone()),
            jwt: auth.and_then(|auth| auth.jwt.clone()),
            auth_webhook_url: self.webhook_url.clone(),
            ca_bundle: auth.and_then(|auth| auth.webhook.as_ref()).map(|plan| plan.tls.bundle_file.clone()),
        }
    }

    /// Stops every instance, the webhook and the auth files, then releases
    /// the harness ports. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        let mut containers = Vec::new();
        for instance in &mut self.instances {
            let Some(launched) = instance.launched.take() else {
                instance.state = InstanceState::Stopped;
                continue;
            };
            instance.state = InstanceState::Stopping;
            match launched {
                Launched::Process(mut child) => {
                    let pid = child.id();
                    info!(instance = %instance.label, pid, "stopping engine");
                    let status = interrupt_and_wait(&mut child, STOP_GRACE);
                    debug!(instance = %instance.label, exited = status.is_some(), "engine stopped");
                    if let Err(err) = self.ledger.release_owner(&PortOwner::Process(pid)) {
                        warn!(pid, error = %err, "failed to release engine ports");
                    }
                    instance.state = InstanceState::Stopped;
                }
                Launched::Container {
                    name,
                    container,
                    collectors,
                } => containers.push((name, container, collectors)),
            }
        }

        let names: Vec<String> = containers.iter().map(|(name, _, _)| name.clone()).collect();
        thread::scope(|scope| {
            for (name, container, collectors) in containers {
                scope.spawn(move || stop_and_remove(&name, container, collectors));
            }
        });
        for name in names {
            if let Err(err) = self.ledger.release_owner(&PortOwner::Container(name.clone())) {
                warn!(container = %name, error = %err, "failed to release engine ports");
            }
        }
        for instance in &mut self.instances {
            instance.state = InstanceState::Stopped;
        }

        self.webhook.stop();
        self.webhook_url = None;
        if let Some(auth) = self.auth.take() {
            auth.cleanup();
        }
        let mut harness_ports = std::mem::take(&mut self.evts_ports);
        harness_ports.append(&mut self.remote_ports);
        if !harness_ports.is_empty()
            && let Err(err) = self.ledger.release_ports(&harness_ports)
        {
            warn!(error = %err, "failed to release pytest ports");
        }
    }
}

impl Drop for EngineManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use std::collections::BTreeMap;
    use std::path::Path;
    use std::path::PathBuf;

    use hge_harness_config::DockerImage;
    use hge_harness_config::EngineLaunch;

    use super::InstanceEnv;
    use super::engine_env;
    use super::is_logged_env_key;
    use super::serve_args;
    use super::serve_command;

    #[test]
    fn env_layers_override_in_order() {
        let auth_env = BTreeMap::from([("HASURA_GRAPHQL_ADMIN_SECRET".to_string(), "ABC123".to_string())]);
        let scenario_env = BTreeMap::from([
            ("HASURA_GRAPHQL_ENABLE_TELEMETRY".to_string(), "true".to_string()),
            ("HASURA_GRAPHQL_CORS_DOMAIN".to_string(), "http://localhost".to_string()),
        ]);
        let env = engine_env(
            &InstanceEnv {
                db_url: "postgres://localhost/db",
                port: 8081,
                events_port: 5593,
                tix_file: Path::new("/out/graphql-engine-1.tix"),
            },
            &auth_env,
            &scenario_env,
        );
        assert_eq!(env["HASURA_GRAPHQL_ENABLE_TELEMETRY"], "true");
        assert_eq!(env["EVENT_WEBHOOK_HEADER"], "MyEnvValue");
        assert_eq!(env["HASURA_GRAPHQL_STRINGIFY_NUMERIC_TYPES"], "true");
        assert_eq!(env["HPCTIXFILE"], "/out/graphql-engine-1.tix");
        assert_eq!(env["WEBHOOK_FROM_ENV"], "http://127.0.0.1:5593");
        assert_eq!(env["HASURA_GRAPHQL_DATABASE_URL"], "postgres://localhost/db");
        assert_eq!(env["HASURA_GRAPHQL_SERVER_PORT"], "8081");
        assert_eq!(env["HASURA_GRAPHQL_ADMIN_SECRET"], "ABC123");
        assert_eq!(env["HASURA_GRAPHQL_CORS_DOMAIN"], "http://localhost");
    }

    #[test]
    fn only_engine_and_webhook_keys_are_logged() {
        assert!(is_logged_env_key("HASURA_GRAPHQL_DATABASE_URL"));
        assert!(is_logged_env_key("WEBHOOK_FROM_ENV"));
        assert!(is_logged_env_key("EVENT_WEBHOOK_HEADER"));
        assert!(!is_logged_env_key("HPCTIXFILE"));
    }

    #[test]
    fn rts_options_are_wrapped() {
        let args = serve_args(&["--enable-console".to_string()], &["-N2".to_string(), "-A64m".to_string()]);
        assert_eq!(args, vec!["--enable-console", "+RTS", "-N2", "-A64m", "-RTS"]);
        assert_eq!(serve_args(&[], &[]), Vec::<String>::new());
    }

    #[test]
    fn serve_command_depends_on_launch_mode() {
        let args = vec!["--stringify-numeric-types".to_string()];
        assert_eq!(
            serve_command(&EngineLaunch::StackExec, &args),
            vec!["stack", "exec", "graphql-engine", "--", "serve", "--stringify-numeric-types"]
        );
        assert_eq!(
            serve_command(&EngineLaunch::Executable(PathBuf::from("/bin/graphql-engine")), &args),
            vec!["/bin/graphql-engine", "serve", "--stringify-numeric-types"]
        );
        let image = DockerImage {
            name: "hasura/graphql-engine".into(),
            tag: "latest".into(),
        };
        assert_eq!(
            serve_command(&EngineLaunch::Docker(image), &args),
            vec!["graphql-engine", "serve", "--stringify-numeric-types"]
        );
    }
}
