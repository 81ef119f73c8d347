// crates/hge-harness-config/src/overrides.rs
// ============================================================================
// Module: Command Line Overrides
// Description: Build a test case document from options and HASURA_TEST_* env.
// Purpose: Apply option precedence and reject conflicting option pairs.
// Dependencies: serde_yaml
// ============================================================================

//! ## Overview
//! Each option falls back to its `HASURA_TEST_*` variable. The resolved
//! options are applied on top of the built-in default test case. Postgres
//! URLs and a Postgres image are mutually exclusive, as are an engine image
//! and an engine executable.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde_yaml::Mapping;
use serde_yaml::Value;

use crate::auth::inline_value;
use crate::env::HarnessEnv;
use crate::error::ConfigError;
use crate::test_case::default_document;

// ============================================================================
// SECTION: Overrides
// ============================================================================

/// Test case options given on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgOverrides {
    /// Comma separated Postgres URLs.
    pub pg_urls: Option<String>,
    /// Postgres docker image.
    pub pg_docker_image: Option<String>,
    /// Engine docker image.
    pub hge_docker_image: Option<String>,
    /// Engine executable.
    pub hge_executable: Option<String>,
    /// Space separated engine RTS options.
    pub hge_rts_opts: Option<String>,
    /// Scenario name or inline YAML.
    pub scenario: Option<String>,
    /// Auth name or inline YAML.
    pub auth: Option<String>,
}

impl ArgOverrides {
    /// Returns true when any option that shapes the topology is set.
    #[must_use]
    pub const fn has_topology_options(&self) -> bool {
        self.pg_urls.is_some()
            || self.pg_docker_image.is_some()
            || self.hge_docker_image.is_some()
            || self.hge_executable.is_some()
            || self.hge_rts_opts.is_some()
            || self.scenario.is_some()
            || self.auth.is_some()
    }

    /// Fills unset options from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when a variable is not UTF-8 or empty.
    pub fn with_env_fallback(self) -> Result<Self, ConfigError> {
        self.resolve_with(HarnessEnv::read)
    }

    /// Fills unset options through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `lookup`.
    pub fn resolve_with<F>(self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(HarnessEnv) -> Result<Option<String>, ConfigError>,
    {
        let pick = |value: Option<String>, key: HarnessEnv| match value {
            Some(value) => Ok(Some(value)),
            None => lookup(key),
        };
        Ok(Self {
            pg_urls: pick(self.pg_urls, HarnessEnv::PgUrls)?,
            pg_docker_image: pick(self.pg_docker_image, HarnessEnv::PgDockerImage)?,
            hge_docker_image: pick(self.hge_docker_image, HarnessEnv::HgeDockerImage)?,
            hge_executable: pick(self.hge_executable, HarnessEnv::GraphqlEngine)?,
            hge_rts_opts: pick(self.hge_rts_opts, HarnessEnv::HgeRtsOpts)?,
            scenario: pick(self.scenario, HarnessEnv::Scenario)?,
            auth: pick(self.auth, HarnessEnv::Auth)?,
        })
    }

    /// Builds a test case document from the default document and these
    /// options.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Conflict`] for exclusive pairs that are both
    /// set, or [`ConfigError`] for malformed values.
    pub fn to_document(&self) -> Result<Value, ConfigError> {
        let Value::Mapping(mut document) = default_document()? else {
            return Err(ConfigError::Invalid("default test case must be a mapping".to_string()));
        };
        self.apply_postgres(&mut document)?;
        self.apply_engine(&mut document)?;
        if let Some(scenario) = &self.scenario {
            document.insert(key("scenario"), inline_value(scenario)?);
        }
        if let Some(auth) = &self.auth {
            document.insert(key("auth"), inline_value(auth)?);
        }
        Ok(Value::Mapping(document))
    }

    /// Applies `--pg-urls` or `--pg-docker-image`.
    fn apply_postgres(&self, document: &mut Mapping) -> Result<(), ConfigError> {
        exclusive(
            (&self.pg_urls, "--pg-urls", HarnessEnv::PgUrls),
            (&self.pg_docker_image, "--pg-docker-image", HarnessEnv::PgDockerImage),
        )?;
        if let Some(urls) = &self.pg_urls {
            let urls = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(|url| Value::String(url.to_string()))
                .collect();
            let mut postgres = Mapping::new();
            postgres.insert(key("urls"), Value::Sequence(urls));
            document.insert(key("postgres"), Value::Mapping(postgres));
        }
        if let Some(image) = &self.pg_docker_image {
            let postgres = document.entry(key("postgres")).or_insert_with(|| Value::Mapping(Mapping::new()));
            let Value::Mapping(postgres) = postgres else {
                return Err(ConfigError::Invalid("postgres must be a mapping".to_string()));
            };
            let docker =
                postgres.entry(key("withDocker")).or_insert_with(|| Value::Mapping(Mapping::new()));
            let Value::Mapping(docker) = docker else {
                return Err(ConfigError::Invalid("postgres.withDocker must be a mapping".to_string()));
            };
            docker.insert(key("image"), Value::String(image.clone()));
        }
        Ok(())
    }

    /// Applies the engine image, executable and RTS options.
    fn apply_engine(&self, document: &mut Mapping) -> Result<(), ConfigError> {
        exclusive(
            (&self.hge_docker_image, "--hge-docker-image", HarnessEnv::HgeDockerImage),
            (&self.hge_executable, "--hge-executable", HarnessEnv::GraphqlEngine),
        )?;
        if let Some(image) = &self.hge_docker_image {
            let mut docker = Mapping::new();
            docker.insert(key("image"), Value::String(image.clone()));
            let mut engine = Mapping::new();
            engine.insert(key("withDocker"), Value::Mapping(docker));
            document.insert(key("graphqlEngine"), Value::Mapping(engine));
        }
        if let Some(executable) = &self.hge_executable {
            let mut engine = Mapping::new();
            engine.insert(key("withExecutable"), Value::String(executable.clone()));
            document.insert(key("graphqlEngine"), Value::Mapping(engine));
        }
        if let Some(rts_opts) = &self.hge_rts_opts {
            let opts: Vec<Value> =
                rts_opts.split_whitespace().map(|opt| Value::String(opt.to_string())).collect();
            let engine = document.entry(key("graphqlEngine")).or_insert(Value::Null);
            if engine.as_str() == Some("withStackExec") || engine.is_null() {
                let mut stack = Mapping::new();
                stack.insert(key("withStackExec"), Value::Bool(true));
                *engine = Value::Mapping(stack);
            }
            let Value::Mapping(engine) = engine else {
                return Err(ConfigError::Invalid("graphqlEngine must be a mapping".to_string()));
            };
            engine.insert(key("rtsOpts"), Value::Sequence(opts));
        }
        Ok(())
    }
}

/// Builds a string mapping key.
fn key(name: &str) -> Value {
    Value::String(name.to_string())
}

/// Rejects two options that are both set.
fn exclusive(
    first: (&Option<String>, &str, HarnessEnv),
    second: (&Option<String>, &str, HarnessEnv),
) -> Result<(), ConfigError> {
    if first.0.is_some() && second.0.is_some() {
        return Err(ConfigError::Conflict {
            first: format!("{} (env: {})", first.1, first.2.as_str()),
            second: format!("{} (env: {})", second.1, second.2.as_str()),
        });
    }
    Ok(())
}
