// crates/hge-harness-config/tests/scenario_validation.rs
// ============================================================================
// Module: Scenario Validation Tests
// Description: Test case loading, expansion and catalog validation.
// Purpose: Ensure invalid test cases fail before any process is started.
// ============================================================================

//! ## Overview
//! Integration tests for test case documents:
//! - Unknown scenarios and disallowed auth modes are rejected
//! - Defaults are filled for absent keys
//! - List documents and scenario lists expand into several test cases
//! - The configuration hash ignores key order

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::fs;

use hge_harness_config::AuthConfig;
use hge_harness_config::AuthKind;
use hge_harness_config::ConfigError;
use hge_harness_config::DEFAULT_AUTH_WEBHOOK_PATH;
use hge_harness_config::EngineLaunch;
use hge_harness_config::MAX_TEST_CONF_SIZE;
use hge_harness_config::PostgresSource;
use hge_harness_config::ScenarioCatalog;
use hge_harness_config::TestCaseConfig;
use hge_harness_config::WebhookMode;
use hge_harness_config::conf_hash;
use hge_harness_config::expand_test_cases;
use hge_harness_config::parse_document;
use hge_harness_config::read_document;
use proptest::prelude::*;
use serde_yaml::Mapping;
use serde_yaml::Value;
use tempfile::TempDir;

// ============================================================================
// SECTION: Helpers
// ============================================================================

const BASE: &str = "\
postgres:
  urls:
    - postgresql://hge:pw@localhost:5432/hge_tests
graphqlEngine:
  withExecutable: /usr/local/bin/graphql-engine
";

fn expand(yaml: &str) -> Result<Vec<TestCaseConfig>, ConfigError> {
    let catalog = ScenarioCatalog::builtin().unwrap();
    expand_test_cases(&parse_document(yaml).unwrap(), &[], &catalog)
}

fn single(yaml: &str) -> TestCaseConfig {
    let mut cases = expand(yaml).unwrap();
    assert_eq!(cases.len(), 1);
    cases.remove(0)
}

// ============================================================================
// SECTION: Catalog Validation
// ============================================================================

#[test]
fn unknown_scenario_is_rejected() {
    let err = expand(&format!("{BASE}scenario: noSuchScenario\n")).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownScenario(name) if name == "noSuchScenario"));
}

#[test]
fn auth_outside_allow_list_is_rejected() {
    let err = expand(&format!("{BASE}scenario: horizontalScaling\nauth: jwt\n")).unwrap_err();
    match err {
        ConfigError::AuthNotAllowed {
            scenario,
            auth,
            allowed,
        } => {
            assert_eq!(scenario, "horizontalScaling");
            assert_eq!(auth, "jwt");
            assert_eq!(allowed, "noAuth, adminSecret");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn default_auth_must_also_be_allowed() {
    let err = expand(&format!("{BASE}scenario: allowlistQueries\n")).unwrap_err();
    assert!(matches!(err, ConfigError::AuthNotAllowed { .. }));
}

#[test]
fn unknown_auth_is_rejected() {
    let err = expand(&format!("{BASE}auth: bearer\n")).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownAuth(_)));
}

#[test]
fn webhook_mode_outside_allowed_values_is_rejected() {
    let err = expand(&format!("{BASE}auth:\n  webhook:\n    mode: delete\n")).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn unknown_top_level_keys_are_rejected() {
    let err = expand(&format!("{BASE}engine: oops\n")).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

// ============================================================================
// SECTION: Defaults
// ============================================================================

#[test]
fn defaults_are_filled() {
    let case = single(BASE);
    assert_eq!(case.scenario.name, "default");
    assert_eq!(case.auth, AuthConfig::NoAuth);
    assert_eq!(case.scenario.auth_webhook_path, DEFAULT_AUTH_WEBHOOK_PATH);
    assert_eq!(case.scenario.allowed_auth, AuthKind::ALL.to_vec());
    assert!(case.extra_pytest_args.is_empty());
    assert_eq!(
        case.engine.launch,
        EngineLaunch::Executable("/usr/local/bin/graphql-engine".into())
    );
    assert_eq!(case.conf_hash.len(), 8);
}

#[test]
fn webhook_auth_defaults_are_filled() {
    let case = single(&format!("{BASE}auth: webhook\n"));
    let AuthConfig::Webhook(webhook) = case.auth else {
        panic!("expected webhook auth");
    };
    assert!(!webhook.secure);
    assert_eq!(webhook.mode, WebhookMode::Get);
}

#[test]
fn inline_scenario_without_name_is_custom() {
    let case = single(&format!(
        "{BASE}scenario:\n  withHgeReplica: true\n  hge:\n    env:\n      HASURA_GRAPHQL_DEV_MODE: true\n"
    ));
    assert_eq!(case.scenario.name, "custom");
    assert!(case.scenario.with_hge_replica);
    assert_eq!(
        case.scenario.hge_env.get("HASURA_GRAPHQL_DEV_MODE").map(String::as_str),
        Some("true")
    );
}

#[test]
fn postgres_needs_exactly_one_source() {
    let yaml = "postgres:\n  urls: [postgresql://localhost/db]\n  withDocker:\n    image: postgres\n    databases: [db]\ngraphqlEngine: withStackExec\n";
    assert!(matches!(expand(yaml), Err(ConfigError::Invalid(_))));

    let yaml = "graphqlEngine: withStackExec\n";
    assert!(matches!(expand(yaml), Err(ConfigError::Invalid(_))));
}

#[test]
fn docker_postgres_is_typed() {
    let case = single(
        "postgres:\n  withDocker:\n    image: postgres:15\n    databases: [a, b]\ngraphqlEngine:\n  withDocker:\n    image: hasura/graphql-engine:v2\n",
    );
    let PostgresSource::Docker(docker) = case.postgres else {
        panic!("expected docker postgres");
    };
    assert_eq!(docker.image.tag, "15");
    assert_eq!(docker.databases, vec!["a".to_string(), "b".to_string()]);
    let EngineLaunch::Docker(image) = case.engine.launch else {
        panic!("expected docker engine");
    };
    assert_eq!(image.name, "hasura/graphql-engine");
}

// ============================================================================
// SECTION: Expansion
// ============================================================================

#[test]
fn scenario_list_expands_into_test_cases() {
    let cases = expand(&format!("{BASE}scenario: [default, corsDomains, logging]\n")).unwrap();
    let names: Vec<_> = cases.iter().map(|case| case.scenario.name.as_str()).collect();
    assert_eq!(names, vec!["default", "corsDomains", "logging"]);
    assert_ne!(cases[0].conf_hash, cases[1].conf_hash);
}

#[test]
fn list_documents_expand_each_element() {
    let yaml = format!(
        "- {}\n- {}\n",
        flow_style(&format!("{BASE}scenario: default\n")),
        flow_style(&format!("{BASE}scenario: [corsDomains, logging]\n"))
    );
    let cases = expand(&yaml).unwrap();
    assert_eq!(cases.len(), 3);
}

#[test]
fn trailing_args_are_appended_to_extra_args() {
    let catalog = ScenarioCatalog::builtin().unwrap();
    let document =
        parse_document(&format!("{BASE}pytest:\n  extraArgs: [--accept]\n")).unwrap();
    let extra = vec!["test_graphql_queries.py".to_string()];
    let cases = expand_test_cases(&document, &extra, &catalog).unwrap();
    assert_eq!(
        cases[0].extra_pytest_args,
        vec!["--accept".to_string(), "test_graphql_queries.py".to_string()]
    );
}

#[test]
fn oversized_documents_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("big.yaml");
    fs::write(&path, "#".repeat(MAX_TEST_CONF_SIZE + 1)).unwrap();
    assert!(matches!(read_document(&path), Err(ConfigError::Invalid(_))));

    let path = dir.path().join("ok.yaml");
    fs::write(&path, BASE).unwrap();
    assert!(read_document(&path).unwrap().is_mapping());
}

// ============================================================================
// SECTION: Configuration Hash
// ============================================================================

#[test]
fn conf_hash_ignores_key_order() {
    let a = single(&format!("{BASE}scenario: logging\n"));
    let b = single(&format!(
        "scenario: logging\ngraphqlEngine:\n  withExecutable: /usr/local/bin/graphql-engine\npostgres:\n  urls:\n    - postgresql://hge:pw@localhost:5432/hge_tests\n"
    ));
    assert_eq!(a.conf_hash, b.conf_hash);
}

#[test]
fn conf_hash_golden_value() {
    // sha256 of {"a":1,"b":[true,"x"]}
    let value = parse_document("b: [true, x]\na: 1\n").unwrap();
    assert_eq!(conf_hash(&value).unwrap(), "63e8063d");
}

proptest! {
    #[test]
    fn conf_hash_is_insertion_order_independent(
        entries in proptest::collection::btree_map("[a-z]{1,8}", "[a-z0-9]{0,8}", 1..8)
    ) {
        let mut forward = Mapping::new();
        for (key, value) in &entries {
            forward.insert(Value::String(key.clone()), Value::String(value.clone()));
        }
        let mut backward = Mapping::new();
        for (key, value) in entries.iter().rev() {
            backward.insert(Value::String(key.clone()), Value::String(value.clone()));
        }
        prop_assert_eq!(
            conf_hash(&Value::Mapping(forward)).unwrap(),
            conf_hash(&Value::Mapping(backward)).unwrap()
        );
    }
}

/// Renders a YAML mapping document in flow style so it can be a list item.
fn flow_style(yaml: &str) -> String {
    let value = parse_document(yaml).unwrap();
    serde_json::to_string(&value).unwrap()
}
