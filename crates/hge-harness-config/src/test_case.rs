// crates/hge-harness-config/src/test_case.rs
// ============================================================================
// Module: Test Case Configuration
// Description: Test case documents, their expansion and validation.
// Purpose: Produce immutable, fully defaulted test cases before any launch.
// Dependencies: serde, serde_yaml, url
// ============================================================================

//! ## Overview
//! A test case document names a Postgres source, an engine launch method and
//! a scenario. Documents may be lists, and a `scenario` list fans a single
//! document out into one test case per scenario. Every expanded document is
//! validated into a [`TestCaseConfig`] and hashed so its output files do not
//! collide with other test cases.
//!
//! Security posture: documents come from local files or stdin and are bounded
//! to [`MAX_TEST_CONF_SIZE`] bytes of UTF-8.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde_yaml::Mapping;
use serde_yaml::Value;
use url::Url;

use crate::auth::AuthConfig;
use crate::catalog::ScenarioCatalog;
use crate::catalog::ScenarioDef;
use crate::error::ConfigError;
use crate::hashing::conf_hash;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum size of a test case document in bytes.
pub const MAX_TEST_CONF_SIZE: usize = 1024 * 1024;

/// Test case used when no document is given.
const DEFAULT_TEST_CONF: &str = include_str!("../catalog/default_test_conf.yaml");

/// Path argument meaning "read the document from stdin".
pub const STDIN_SOURCE: &str = "-";

/// Maximum Postgres identifier length.
const MAX_DATABASE_NAME_LEN: usize = 63;

/// Tag used for image references without one.
const DEFAULT_IMAGE_TAG: &str = "latest";

// ============================================================================
// SECTION: Docker Images
// ============================================================================

/// Docker image reference split into repository and tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerImage {
    /// Repository, including any registry prefix.
    pub name: String,
    /// Tag (`latest` when omitted).
    pub tag: String,
}

impl DockerImage {
    /// Parses `name[:tag]`. A `:` that belongs to a registry port is not
    /// mistaken for a tag separator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for empty names or tags.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        let last_slash = raw.rfind('/').map_or(0, |idx| idx + 1);
        let (name, tag) = match raw[last_slash..].rfind(':') {
            Some(idx) => (&raw[..last_slash + idx], &raw[last_slash + idx + 1..]),
            None => (raw, DEFAULT_IMAGE_TAG),
        };
        if name.is_empty() || tag.is_empty() || raw.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid(format!("invalid docker image reference '{raw}'")));
        }
        Ok(Self {
            name: name.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl fmt::Display for DockerImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

// ============================================================================
// SECTION: Postgres Source
// ============================================================================

/// Postgres provisioned in a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresDocker {
    /// Image to run.
    pub image: DockerImage,
    /// Databases to test against; the first is created by the image.
    pub databases: Vec<String>,
}

/// Where the databases under test come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostgresSource {
    /// Existing databases.
    Urls(Vec<String>),
    /// A container started for this test case.
    Docker(PostgresDocker),
}

/// `postgres` block as written in YAML.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawPostgres {
    /// Existing database URLs.
    #[serde(default)]
    urls: Option<Vec<String>>,
    /// Container settings.
    #[serde(default)]
    with_docker: Option<RawPostgresDocker>,
}

/// `postgres.withDocker` block as written in YAML.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPostgresDocker {
    /// Image reference.
    image: String,
    /// Database names.
    #[serde(default)]
    databases: Vec<String>,
}

impl PostgresSource {
    /// Validates a `postgres` block.
    fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let raw: RawPostgres = serde_yaml::from_value(value.clone())
            .map_err(|err| ConfigError::Invalid(format!("invalid postgres config: {err}")))?;
        match (raw.urls, raw.with_docker) {
            (Some(urls), None) => {
                if urls.is_empty() {
                    return Err(ConfigError::Invalid(
                        "postgres urls must not be empty".to_string(),
                    ));
                }
                for url in &urls {
                    validate_postgres_url(url)?;
                }
                Ok(Self::Urls(urls))
            }
            (None, Some(docker)) => {
                if docker.databases.is_empty() {
                    return Err(ConfigError::Invalid(
                        "postgres withDocker needs at least one database".to_string(),
                    ));
                }
                for name in &docker.databases {
                    validate_database_name(name)?;
                }
                Ok(Self::Docker(PostgresDocker {
                    image: DockerImage::parse(&docker.image)?,
                    databases: docker.databases,
                }))
            }
            _ => Err(ConfigError::Invalid(
                "postgres needs exactly one of 'urls' or 'withDocker'".to_string(),
            )),
        }
    }
}

/// Checks that `raw` is a `postgres://` or `postgresql://` URL.
fn validate_postgres_url(raw: &str) -> Result<(), ConfigError> {
    let url = Url::parse(raw)
        .map_err(|err| ConfigError::Invalid(format!("invalid postgres url '{raw}': {err}")))?;
    match url.scheme() {
        "postgres" | "postgresql" if url.host_str().is_some() => Ok(()),
        _ => Err(ConfigError::Invalid(format!(
            "postgres url '{raw}' must use the postgres scheme and name a host"
        ))),
    }
}

/// Checks that `name` is a plain Postgres identifier.
fn validate_database_name(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid_start = chars.next().is_some_and(|first| first.is_ascii_alphabetic() || first == '_');
    let valid_rest = chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if valid_start && valid_rest && name.len() <= MAX_DATABASE_NAME_LEN {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("invalid database name '{name}'")))
    }
}

// ============================================================================
// SECTION: Engine Launch
// ============================================================================

/// How the engine under test is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineLaunch {
    /// `stack exec graphql-engine -- serve`.
    StackExec,
    /// A local executable.
    Executable(PathBuf),
    /// A docker image with host networking.
    Docker(DockerImage),
}

/// Engine configuration of a test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Launch method.
    pub launch: EngineLaunch,
    /// Runtime options passed between `+RTS` and `-RTS`.
    pub rts_opts: Vec<String>,
}

/// `graphqlEngine` mapping form as written in YAML.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawEngine {
    /// Executable path.
    #[serde(default)]
    with_executable: Option<PathBuf>,
    /// Container settings.
    #[serde(default)]
    with_docker: Option<RawEngineDocker>,
    /// Stack flag.
    #[serde(default)]
    with_stack_exec: bool,
    /// Runtime options.
    #[serde(default)]
    rts_opts: Vec<String>,
}

/// `graphqlEngine.withDocker` block as written in YAML.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEngineDocker {
    /// Image reference.
    image: String,
}

impl EngineConfig {
    /// Validates a `graphqlEngine` value.
    fn from_value(value: &Value) -> Result<Self, ConfigError> {
        if value.as_str() == Some("withStackExec") {
            return Ok(Self {
                launch: EngineLaunch::StackExec,
                rts_opts: Vec::new(),
            });
        }
        let raw: RawEngine = serde_yaml::from_value(value.clone())
            .map_err(|err| ConfigError::Invalid(format!("invalid graphqlEngine config: {err}")))?;
        let launch = match (raw.with_executable, raw.with_docker, raw.with_stack_exec) {
            (Some(path), None, false) => {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::Invalid(
                        "graphqlEngine withExecutable must not be empty".to_string(),
                    ));
                }
                EngineLaunch::Executable(path)
            }
            (None, Some(docker), false) => EngineLaunch::Docker(DockerImage::parse(&docker.image)?),
            (None, None, true) => EngineLaunch::StackExec,
            _ => {
                return Err(ConfigError::Invalid(
                    "graphqlEngine needs exactly one of 'withExecutable', 'withDocker' or \
                     'withStackExec'"
                        .to_string(),
                ));
            }
        };
        Ok(Self {
            launch,
            rts_opts: raw.rts_opts,
        })
    }
}

// ============================================================================
// SECTION: Test Case
// ============================================================================

/// Top-level test case document as written in YAML.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawTestCase {
    /// Postgres block.
    #[serde(default)]
    postgres: Option<Value>,
    /// Engine block.
    #[serde(default)]
    graphql_engine: Option<Value>,
    /// Scenario reference.
    #[serde(default)]
    scenario: Option<Value>,
    /// Auth used when the scenario does not fix one.
    #[serde(default)]
    auth: Option<Value>,
    /// Pytest block.
    #[serde(default)]
    pytest: RawPytest,
}

/// `pytest` block of a test case.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawPytest {
    /// Extra pytest arguments.
    #[serde(default)]
    extra_args: Vec<String>,
}

/// Validated, immutable test case.
#[derive(Debug, Clone, PartialEq)]
pub struct TestCaseConfig {
    /// Database source.
    pub postgres: PostgresSource,
    /// Engine launch configuration.
    pub engine: EngineConfig,
    /// Resolved scenario.
    pub scenario: ScenarioDef,
    /// Effective auth mode.
    pub auth: AuthConfig,
    /// Extra pytest arguments (document plus trailing command line arguments).
    pub extra_pytest_args: Vec<String>,
    /// Short hash of the expanded document.
    pub conf_hash: String,
    /// Expanded document the test case was built from.
    pub document: Value,
}

impl TestCaseConfig {
    /// Validates one expanded test case document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when any block is missing or invalid, when the
    /// scenario is unknown, or when the effective auth is not allowed.
    pub fn from_document(document: &Value, catalog: &ScenarioCatalog) -> Result<Self, ConfigError> {
        let raw: RawTestCase = serde_yaml::from_value(document.clone())
            .map_err(|err| ConfigError::Invalid(format!("invalid test case: {err}")))?;
        let postgres = raw
            .postgres
            .as_ref()
            .ok_or_else(|| ConfigError::Invalid("could not get postgres config".to_string()))
            .and_then(PostgresSource::from_value)?;
        let engine = raw
            .graphql_engine
            .as_ref()
            .ok_or_else(|| ConfigError::Invalid("could not get graphqlEngine config".to_string()))
            .and_then(EngineConfig::from_value)?;
        let scenario = match &raw.scenario {
            Some(reference) => catalog.resolve(reference)?,
            None => catalog.resolve(&Value::String("default".to_string()))?,
        };
        let auth = match (&scenario.auth, &raw.auth) {
            (Some(auth), _) => auth.clone(),
            (None, Some(value)) => AuthConfig::from_value(value)?,
            (None, None) => AuthConfig::NoAuth,
        };
        if !scenario.allows(auth.kind()) {
            return Err(ConfigError::AuthNotAllowed {
                scenario: scenario.name.clone(),
                auth: auth.kind().to_string(),
                allowed: scenario.allowed_auth_list(),
            });
        }
        Ok(Self {
            postgres,
            engine,
            scenario,
            auth,
            extra_pytest_args: raw.pytest.extra_args,
            conf_hash: conf_hash(document)?,
            document: document.clone(),
        })
    }

    /// Renders the expanded document as YAML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when serialization fails.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.document).map_err(|err| ConfigError::Invalid(err.to_string()))
    }
}

// ============================================================================
// SECTION: Loading And Expansion
// ============================================================================

/// Reads a test case document from `path`, or from stdin when `path` is `-`.
///
/// # Errors
///
/// Returns [`ConfigError`] when the source cannot be read, exceeds
/// [`MAX_TEST_CONF_SIZE`], is not UTF-8, or is not YAML.
pub fn read_document(path: &Path) -> Result<Value, ConfigError> {
    let bytes = if path.as_os_str() == STDIN_SOURCE {
        let mut bytes = Vec::new();
        let limit = u64::try_from(MAX_TEST_CONF_SIZE).unwrap_or(u64::MAX).saturating_add(1);
        std::io::stdin()
            .lock()
            .take(limit)
            .read_to_end(&mut bytes)
            .map_err(|err| ConfigError::Io(err.to_string()))?;
        bytes
    } else {
        fs::read(path).map_err(|err| ConfigError::Io(format!("{}: {err}", path.display())))?
    };
    if bytes.len() > MAX_TEST_CONF_SIZE {
        return Err(ConfigError::Invalid("test case document exceeds size limit".to_string()));
    }
    let content = std::str::from_utf8(&bytes)
        .map_err(|_| ConfigError::Invalid("test case document must be utf-8".to_string()))?;
    parse_document(content)
}

/// Parses a YAML test case document.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] for malformed YAML.
pub fn parse_document(content: &str) -> Result<Value, ConfigError> {
    serde_yaml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))
}

/// Returns the built-in default test case document.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] when the embedded document is malformed.
pub fn default_document() -> Result<Value, ConfigError> {
    parse_document(DEFAULT_TEST_CONF)
}

/// Expands `document` into validated test cases, appending `extra_args` to
/// every test case's pytest arguments.
///
/// # Errors
///
/// Returns the first [`ConfigError`] found in any expanded test case.
pub fn expand_test_cases(
    document: &Value,
    extra_args: &[String],
    catalog: &ScenarioCatalog,
) -> Result<Vec<TestCaseConfig>, ConfigError> {
    let mut documents = Vec::new();
    collect_documents(document, &mut documents)?;
    if documents.is_empty() {
        return Err(ConfigError::Invalid("no test cases defined".to_string()));
    }
    documents
        .into_iter()
        .map(|mut doc| {
            append_extra_args(&mut doc, extra_args)?;
            TestCaseConfig::from_document(&Value::Mapping(doc), catalog)
        })
        .collect()
}

/// Flattens lists and `scenario` lists into single test case mappings.
fn collect_documents(document: &Value, out: &mut Vec<Mapping>) -> Result<(), ConfigError> {
    match document {
        Value::Sequence(items) => {
            for item in items {
                collect_documents(item, out)?;
            }
            Ok(())
        }
        Value::Mapping(mapping) => {
            if let Some(Value::Sequence(scenarios)) = mapping.get("scenario") {
                for scenario in scenarios {
                    let mut single = mapping.clone();
                    single.insert(Value::String("scenario".to_string()), scenario.clone());
                    out.push(single);
                }
            } else {
                out.push(mapping.clone());
            }
            Ok(())
        }
        _ => Err(ConfigError::Invalid("test case must be a mapping or a list".to_string())),
    }
}

/// Appends `extra_args` to `pytest.extraArgs`, creating the keys as needed.
fn append_extra_args(document: &mut Mapping, extra_args: &[String]) -> Result<(), ConfigError> {
    if extra_args.is_empty() {
        return Ok(());
    }
    let pytest = document
        .entry(Value::String("pytest".to_string()))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    let Value::Mapping(pytest) = pytest else {
        return Err(ConfigError::Invalid("pytest must be a mapping".to_string()));
    };
    let args = pytest
        .entry(Value::String("extraArgs".to_string()))
        .or_insert_with(|| Value::Sequence(Vec::new()));
    let Value::Sequence(args) = args else {
        return Err(ConfigError::Invalid("pytest.extraArgs must be a list".to_string()));
    };
    args.extend(extra_args.iter().cloned().map(Value::String));
    Ok(())
}
