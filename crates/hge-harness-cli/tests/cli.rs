// crates/hge-harness-cli/tests/cli.rs
// ============================================================================
// Module: CLI Integration Tests
// Description: Drive the built binary for commands that start no services.
// Purpose: Keep validation output, ledger maintenance and exit codes stable.
// Dependencies: hge-harness binary
// ============================================================================

//! ## Overview
//! Runs `hge-harness` with an isolated output folder and ledger:
//! - `scenarios` lists the catalog
//! - `validate` prints expanded test cases and rejects invalid ones
//! - `ledger` subcommands work on an empty ledger
//! - `run` fails before provisioning when the configuration is invalid

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
    reason = "Test-only output and panic-based assertions are permitted."
)]

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::Output;

use tempfile::TempDir;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Path of the built binary.
fn harness_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_hge-harness"))
}

/// Runs the binary with `args` and every `HASURA_TEST_*` variable scoped to
/// `dir`.
fn run_harness(dir: &TempDir, args: &[&str]) -> Output {
    let mut command = Command::new(harness_bin());
    for (key, _) in std::env::vars_os() {
        if key.to_string_lossy().starts_with("HASURA_TEST_") {
            command.env_remove(key);
        }
    }
    command
        .args(args)
        .env("HASURA_TEST_OUTPUT_FOLDER", dir.path().join("output"))
        .env("HASURA_TEST_INFO_DB", dir.path().join("ledger").join("tests_info.db"))
        .output()
        .expect("run hge-harness")
}

/// Writes `content` to `name` under `dir`.
fn write_conf(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

/// Lossy stdout.
fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Lossy stderr.
fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[test]
fn scenarios_lists_the_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_harness(&dir, &["scenarios"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let listing = stdout(&output);
    assert!(listing.lines().any(|line| line.starts_with("default\t")));
    assert!(listing.lines().any(|line| line.starts_with("horizontalScaling\tnoAuth, adminSecret")), "{listing}");
}

#[test]
fn validate_prints_each_expanded_test_case() {
    let dir = tempfile::tempdir().unwrap();
    let conf = write_conf(
        dir.path(),
        "conf.yaml",
        "postgres:\n  urls: ['postgres://localhost/hge']\n\
         graphqlEngine:\n  withExecutable: /bin/graphql-engine\n\
         scenario: [default, corsDomains]\n\
         auth: adminSecret\n",
    );
    let output = run_harness(&dir, &["validate", "-f", conf.to_str().unwrap()]);
    assert!(output.status.success(), "{}", stderr(&output));
    let printed = stdout(&output);
    assert!(printed.contains("# test case 1: scenario default, auth adminSecret"), "{printed}");
    assert!(printed.contains("# test case 2: scenario corsDomains, auth adminSecret"), "{printed}");
}

#[test]
fn validate_rejects_auth_outside_the_allow_list() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_harness(
        &dir,
        &[
            "validate",
            "--pg-urls",
            "postgres://localhost/hge",
            "--hge-executable",
            "/bin/graphql-engine",
            "--scenario",
            "horizontalScaling",
            "--auth",
            "jwt",
        ],
    );
    assert!(!output.status.success());
    assert!(stderr(&output).contains("not allowed for scenario horizontalScaling"), "{}", stderr(&output));
}

#[test]
fn validate_rejects_conflicting_postgres_options() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_harness(
        &dir,
        &[
            "validate",
            "--pg-urls",
            "postgres://localhost/hge",
            "--pg-docker-image",
            "postgres:16",
            "--hge-executable",
            "/bin/graphql-engine",
        ],
    );
    assert!(!output.status.success());
    assert!(stderr(&output).contains("should not be defined together"), "{}", stderr(&output));
}

#[test]
fn run_with_unknown_scenario_fails_before_provisioning() {
    let dir = tempfile::tempdir().unwrap();
    let output = run_harness(
        &dir,
        &[
            "run",
            "--pg-urls",
            "postgres://localhost/hge",
            "--hge-executable",
            "/bin/graphql-engine",
            "--scenario",
            "doesNotExist",
        ],
    );
    assert!(!output.status.success());
    assert!(stderr(&output).contains("unknown scenario doesNotExist"), "{}", stderr(&output));
    assert!(!dir.path().join("output").exists());
}

#[test]
fn ledger_commands_work_on_an_empty_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let list = run_harness(&dir, &["ledger", "list"]);
    assert!(list.status.success(), "{}", stderr(&list));
    assert!(stdout(&list).is_empty());

    let release = run_harness(&dir, &["ledger", "release", "--ports", "41999"]);
    assert!(release.status.success(), "{}", stderr(&release));
    assert_eq!(stdout(&release).trim(), "released 41999");

    let sweep = run_harness(&dir, &["ledger", "sweep"]);
    assert!(sweep.status.success(), "{}", stderr(&sweep));
    assert!(stdout(&sweep).contains("removed 0 stale reservation(s)"));

    let hpc = run_harness(&dir, &["ledger", "hpc-files"]);
    assert!(hpc.status.success(), "{}", stderr(&hpc));
    assert!(stdout(&hpc).is_empty());
}
