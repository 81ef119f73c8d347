// crates/hge-harness-runner/src/pytest.rs
// ============================================================================
// Module: Pytest Runner
// Description: Argument assembly and invocation of the pytest suite.
// Purpose: Run the suite against a topology and surface its exit code.
// Dependencies: hge-harness-config, tracing
// ============================================================================

//! ## Overview
//! Multi-valued options are passed as one flag followed by its values. The
//! suite runs with one worker per database URL. Scenario default tests are
//! selected only when no extra argument names a test itself.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Command;

use hge_harness_config::ScenarioDef;
use thiserror::Error;
use tracing::info;

use crate::topology::Topology;

/// Default pytest executable.
pub const DEFAULT_PYTEST_PROGRAM: &str = "pytest";

/// Pytest invocation errors.
#[derive(Debug, Error)]
pub enum PytestError {
    /// The pytest process could not be started.
    #[error("failed to start {program}: {message}")]
    Launch {
        /// Executable.
        program: String,
        /// OS error.
        message: String,
    },
    /// The suite finished with a non-zero exit code.
    #[error("tests failed: exit code {exit_code}")]
    Failed {
        /// Exit code; `128 + signal` when killed by a signal.
        exit_code: i32,
    },
}

/// Builds the pytest argument list for `topology`.
#[must_use]
pub fn pytest_args(topology: &Topology, scenario: &ScenarioDef, extra_args: &[String]) -> Vec<String> {
    let mut args = vec!["--cache-clear".to_string()];
    push_values(&mut args, "--hge-urls", topology.engine_urls.iter().cloned());
    push_values(&mut args, "--pg-urls", topology.pg_urls.iter().cloned());
    push_values(&mut args, "--evts-webhook-ports", topology.evts_webhook_ports.iter().map(ToString::to_string));
    push_values(&mut args, "--remote-gql-ports", topology.remote_gql_ports.iter().map(ToString::to_string));
    push_values(
        &mut args,
        "--hge-log-files",
        topology.log_files.iter().map(|path| path.display().to_string()),
    );
    args.extend(["-rsx".to_string(), "-v".to_string()]);
    if !topology.replica_urls.is_empty() {
        push_values(&mut args, "--hge-replica-urls", topology.replica_urls.iter().cloned());
    }
    args.extend(["-n".to_string(), topology.pg_urls.len().to_string()]);

    if let Some(secret) = &topology.admin_secret {
        args.extend(["--hge-key".to_string(), secret.clone()]);
    }
    if let Some(jwt) = &topology.jwt {
        args.extend([
            "--hge-jwt-key-file".to_string(),
            jwt.private_key_file.display().to_string(),
            "--hge-jwt-conf".to_string(),
            jwt.conf_json(),
        ]);
    } else if let Some(url) = &topology.auth_webhook_url {
        args.extend(["--hge-webhook".to_string(), url.clone()]);
    }

    args.extend(scenario.pytest_args.iter().cloned());
    if !extra_args.iter().any(|arg| arg.starts_with("test_")) {
        args.extend(scenario.default_tests.iter().cloned());
    }
    args.extend(extra_args.iter().cloned());
    args
}

/// Pushes `flag` followed by every value.
fn push_values(args: &mut Vec<String>, flag: &str, values: impl Iterator<Item = String>) {
    args.push(flag.to_string());
    args.extend(values);
}

/// Runs the pytest suite.
#[derive(Debug, Clone)]
pub struct PytestRunner {
    /// Executable, `pytest` unless overridden.
    pub program: PathBuf,
    /// Directory the suite runs in; the current directory when unset.
    pub working_dir: Option<PathBuf>,
}

impl Default for PytestRunner {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PYTEST_PROGRAM),
            working_dir: None,
        }
    }
}

impl PytestRunner {
    /// Runs the suite against `topology` and waits for it.
    ///
    /// # Errors
    ///
    /// Returns [`PytestError::Launch`] when pytest cannot be started and
    /// [`PytestError::Failed`] when it exits non-zero.
    pub fn run(&self, topology: &Topology, scenario: &ScenarioDef, extra_args: &[String]) -> Result<(), PytestError> {
        let args = pytest_args(topology, scenario, extra_args);
        info!(program = %self.program.display(), args = %args.join(" "), "running pytest");
        let mut command = Command::new(&self.program);
        command.args(&args);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        if let Some(bundle) = &topology.ca_bundle {
            command.env("REQUESTS_CA_BUNDLE", bundle);
        }
        let status = command.status().map_err(|err| PytestError::Launch {
            program: self.program.display().to_string(),
            message: err.to_string(),
        })?;
        if status.success() {
            return Ok(());
        }
        let exit_code = status.code().or_else(|| status.signal().map(|signal| 128 + signal)).unwrap_or(-1);
        Err(PytestError::Failed {
            exit_code,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(
        clippy::panic,
        clippy::unwrap_used,
        clippy::use_debug,
        reason = "Test-only assertions are permitted."
    )]

    use std::path::PathBuf;

    use hge_harness_config::ScenarioCatalog;
    use hge_harness_config::ScenarioDef;
    use serde_json::json;

    use super::PytestError;
    use super::PytestRunner;
    use super::pytest_args;
    use crate::jwt::JwtMaterial;
    use crate::topology::Topology;

    /// Two-database topology without auth.
    fn topology() -> Topology {
        Topology {
            engine_urls: vec!["http://localhost:8080".into(), "http://localhost:8081".into()],
            pg_urls: vec!["postgres://a".into(), "postgres://b".into()],
            evts_webhook_ports: vec![5592, 5593],
            remote_gql_ports: vec![6000, 6001],
            log_files: vec![PathBuf::from("/out/1.log"), PathBuf::from("/out/2.log")],
            ..Topology::default()
        }
    }

    /// Scenario with one default test.
    fn scenario() -> ScenarioDef {
        let mut scenario = ScenarioCatalog::builtin().unwrap().get("default").unwrap().clone();
        scenario.pytest_args = vec!["--test-cors".into()];
        scenario.default_tests = vec!["test_cors.py".into()];
        scenario
    }

    #[test]
    fn lists_follow_their_flags_and_parallelism_matches_databases() {
        let args = pytest_args(&topology(), &scenario(), &[]);
        let expected: Vec<String> = [
            "--cache-clear",
            "--hge-urls",
            "http://localhost:8080",
            "http://localhost:8081",
            "--pg-urls",
            "postgres://a",
            "postgres://b",
            "--evts-webhook-ports",
            "5592",
            "5593",
            "--remote-gql-ports",
            "6000",
            "6001",
            "--hge-log-files",
            "/out/1.log",
            "/out/2.log",
            "-rsx",
            "-v",
            "-n",
            "2",
            "--test-cors",
            "test_cors.py",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn explicit_tests_replace_default_tests() {
        let args = pytest_args(&topology(), &scenario(), &["test_graphql_queries.py".into()]);
        assert!(!args.contains(&"test_cors.py".to_string()));
        assert_eq!(args.last().unwrap(), "test_graphql_queries.py");

        let args = pytest_args(&topology(), &scenario(), &["-k".into(), "cors".into()]);
        assert!(args.contains(&"test_cors.py".to_string()));
    }

    #[test]
    fn auth_options_are_added() {
        let mut topology = topology();
        topology.replica_urls = vec!["http://localhost:8082".into()];
        topology.admin_secret = Some("ABC123".into());
        topology.jwt = Some(JwtMaterial {
            private_key_file: PathBuf::from("/out/default_jwt_private.key"),
            conf: json!({"type": "RS512"}),
        });
        topology.auth_webhook_url = Some("https://localhost:9090/token-as-base64-of-headers".into());
        let args = pytest_args(&topology, &scenario(), &[]);
        let joined = args.join(" ");
        assert!(joined.contains("--hge-replica-urls http://localhost:8082 -n 2"));
        assert!(joined.contains("--hge-key ABC123"));
        assert!(joined.contains("--hge-jwt-key-file /out/default_jwt_private.key --hge-jwt-conf {\"type\":\"RS512\"}"));
        assert!(!joined.contains("--hge-webhook"));

        topology.jwt = None;
        let joined = pytest_args(&topology, &scenario(), &[]).join(" ");
        assert!(joined.contains("--hge-webhook https://localhost:9090/token-as-base64-of-headers"));
    }

    #[test]
    fn exit_codes_are_reported() {
        let passing = PytestRunner {
            program: PathBuf::from("true"),
            working_dir: None,
        };
        passing.run(&topology(), &scenario(), &[]).unwrap();

        let failing = PytestRunner {
            program: PathBuf::from("false"),
            working_dir: None,
        };
        match failing.run(&topology(), &scenario(), &[]) {
            Err(PytestError::Failed {
                exit_code,
            }) => assert_eq!(exit_code, 1),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn missing_program_is_a_launch_error() {
        let runner = PytestRunner {
            program: PathBuf::from("/nonexistent/pytest"),
            working_dir: None,
        };
        assert!(matches!(runner.run(&topology(), &scenario(), &[]), Err(PytestError::Launch { .. })));
    }
}
