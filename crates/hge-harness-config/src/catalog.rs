// crates/hge-harness-config/src/catalog.rs
// ============================================================================
// Module: Scenario Catalog
// Description: Built-in scenario definitions and inline scenario parsing.
// Purpose: Resolve scenario names or mappings into typed scenario definitions.
// Dependencies: serde, serde_yaml
// ============================================================================

//! ## Overview
//! The catalog is an embedded YAML mapping from scenario name to scenario
//! body. A scenario is referenced by name or written inline as a mapping; in
//! both cases the body is checked for unknown keys and defaults are applied
//! for everything it leaves out.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_yaml::Value;

use crate::auth::AuthConfig;
use crate::auth::AuthKind;
use crate::error::ConfigError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Embedded scenario catalog.
const BUILTIN_SCENARIOS: &str = include_str!("../catalog/scenarios.yaml");

/// Name given to inline scenarios without a `name` key.
pub const CUSTOM_SCENARIO_NAME: &str = "custom";

/// Webhook path used when a scenario does not pick one.
pub const DEFAULT_AUTH_WEBHOOK_PATH: &str = "/token-as-base64-of-headers";

// ============================================================================
// SECTION: Scenario Definition
// ============================================================================

/// Validated scenario definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioDef {
    /// Scenario name (`custom` for unnamed inline scenarios).
    pub name: String,
    /// Auth mode fixed by the scenario, if any.
    pub auth: Option<AuthConfig>,
    /// Auth kinds the scenario can run with.
    pub allowed_auth: Vec<AuthKind>,
    /// Front every database URL with a pgbouncer proxy.
    pub with_pgbouncer_proxy: bool,
    /// Start a replica engine per database URL.
    pub with_hge_replica: bool,
    /// Restart the pgbouncer proxies and run the suite a second time.
    pub rerun_after_pgbouncer_restart: bool,
    /// Extra engine environment.
    pub hge_env: BTreeMap<String, String>,
    /// Extra engine `serve` arguments.
    pub hge_args: Vec<String>,
    /// Extra pytest arguments.
    pub pytest_args: Vec<String>,
    /// Test files run unless the caller names tests explicitly.
    pub default_tests: Vec<String>,
    /// Path on the auth webhook the engine calls.
    pub auth_webhook_path: String,
}

impl ScenarioDef {
    /// Parses a scenario body. `fallback_name` is used when the body has no
    /// `name` key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the body is malformed.
    pub fn from_value(value: &Value, fallback_name: &str) -> Result<Self, ConfigError> {
        let body = if value.is_null() { Value::Mapping(serde_yaml::Mapping::new()) } else { value.clone() };
        let raw: RawScenario = serde_yaml::from_value(body).map_err(|err| {
            ConfigError::Invalid(format!("invalid scenario {fallback_name}: {err}"))
        })?;
        raw.into_def(fallback_name)
    }

    /// Returns true when `kind` is allowed for this scenario.
    #[must_use]
    pub fn allows(&self, kind: AuthKind) -> bool {
        self.allowed_auth.contains(&kind)
    }

    /// Returns the allow-list as a comma separated string.
    #[must_use]
    pub fn allowed_auth_list(&self) -> String {
        self.allowed_auth.iter().map(|kind| kind.as_str()).collect::<Vec<_>>().join(", ")
    }
}

/// Scenario body as written in YAML.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawScenario {
    /// Explicit scenario name.
    #[serde(default)]
    name: Option<String>,
    /// Scenario auth, validated separately.
    #[serde(default)]
    auth: Option<Value>,
    /// Allowed auth names.
    #[serde(default)]
    allowed_auth: Option<Vec<String>>,
    /// Postgres options.
    #[serde(default)]
    postgres: RawScenarioPostgres,
    /// Replica flag.
    #[serde(default, alias = "hgeReplica")]
    with_hge_replica: bool,
    /// Rerun flag.
    #[serde(default)]
    rerun_after_pgbouncer_restart: bool,
    /// Engine options.
    #[serde(default)]
    hge: RawScenarioHge,
    /// Pytest options.
    #[serde(default)]
    pytest: RawScenarioPytest,
    /// Webhook path.
    #[serde(default)]
    auth_webhook_path: Option<String>,
}

/// `postgres` block of a scenario.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawScenarioPostgres {
    /// Proxy flag.
    #[serde(default)]
    with_pgbouncer_proxy: bool,
}

/// `hge` block of a scenario.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawScenarioHge {
    /// Environment with scalar values.
    #[serde(default)]
    env: BTreeMap<String, Value>,
    /// `serve` arguments.
    #[serde(default)]
    args: Vec<String>,
}

/// `pytest` block of a scenario.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RawScenarioPytest {
    /// Extra arguments.
    #[serde(default)]
    args: Vec<String>,
    /// Default test files.
    #[serde(default)]
    default_tests: Vec<String>,
}

impl RawScenario {
    /// Validates the raw body into a [`ScenarioDef`].
    fn into_def(self, fallback_name: &str) -> Result<ScenarioDef, ConfigError> {
        let name = self.name.unwrap_or_else(|| fallback_name.to_string());
        let auth = self.auth.as_ref().map(AuthConfig::from_value).transpose()?;
        let allowed_auth = match self.allowed_auth {
            Some(names) => {
                let kinds =
                    names.iter().map(|name| AuthKind::parse(name)).collect::<Result<Vec<_>, _>>()?;
                if kinds.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "scenario {name}: allowedAuth must not be empty"
                    )));
                }
                kinds
            }
            None => AuthKind::ALL.to_vec(),
        };
        if let Some(auth) = &auth
            && !allowed_auth.contains(&auth.kind())
        {
            return Err(ConfigError::AuthNotAllowed {
                scenario: name,
                auth: auth.kind().to_string(),
                allowed: allowed_auth.iter().map(|kind| kind.as_str()).collect::<Vec<_>>().join(", "),
            });
        }
        let mut hge_env = BTreeMap::new();
        for (key, value) in self.hge.env {
            let rendered = scalar_to_string(&value).ok_or_else(|| {
                ConfigError::Invalid(format!("scenario {name}: hge.env.{key} must be a scalar"))
            })?;
            hge_env.insert(key, rendered);
        }
        let auth_webhook_path =
            self.auth_webhook_path.unwrap_or_else(|| DEFAULT_AUTH_WEBHOOK_PATH.to_string());
        if !auth_webhook_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "scenario {name}: authWebhookPath must start with '/'"
            )));
        }
        Ok(ScenarioDef {
            name,
            auth,
            allowed_auth,
            with_pgbouncer_proxy: self.postgres.with_pgbouncer_proxy,
            with_hge_replica: self.with_hge_replica,
            rerun_after_pgbouncer_restart: self.rerun_after_pgbouncer_restart,
            hge_env,
            hge_args: self.hge.args,
            pytest_args: self.pytest.args,
            default_tests: self.pytest.default_tests,
            auth_webhook_path,
        })
    }
}

/// Renders a YAML scalar as an environment value.
fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

// ============================================================================
// SECTION: Catalog
// ============================================================================

/// Named scenarios, in catalog order.
#[derive(Debug, Clone)]
pub struct ScenarioCatalog {
    /// Catalog entries.
    entries: Vec<ScenarioDef>,
}

impl ScenarioCatalog {
    /// Loads the embedded catalog.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the embedded catalog is malformed.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_yaml(BUILTIN_SCENARIOS)
    }

    /// Parses a catalog document (a mapping from name to scenario body).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the document or any entry is malformed.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let document: serde_yaml::Mapping =
            serde_yaml::from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        let mut entries = Vec::with_capacity(document.len());
        for (key, body) in &document {
            let name = key.as_str().ok_or_else(|| {
                ConfigError::Invalid("scenario names must be strings".to_string())
            })?;
            let mut def = ScenarioDef::from_value(body, name)?;
            def.name = name.to_string();
            entries.push(def);
        }
        Ok(Self {
            entries,
        })
    }

    /// Returns the scenario called `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ScenarioDef> {
        self.entries.iter().find(|def| def.name == name)
    }

    /// Iterates scenarios in catalog order.
    pub fn iter(&self) -> impl Iterator<Item = &ScenarioDef> {
        self.entries.iter()
    }

    /// Resolves a scenario reference: a catalog name or an inline mapping.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownScenario`] for names outside the catalog
    /// and [`ConfigError::Invalid`] for malformed inline scenarios.
    pub fn resolve(&self, reference: &Value) -> Result<ScenarioDef, ConfigError> {
        match reference {
            Value::String(name) => {
                self.get(name).cloned().ok_or_else(|| ConfigError::UnknownScenario(name.clone()))
            }
            Value::Mapping(_) => ScenarioDef::from_value(reference, CUSTOM_SCENARIO_NAME),
            _ => Err(ConfigError::Invalid(
                "scenario must be a catalog name or a mapping".to_string(),
            )),
        }
    }
}
