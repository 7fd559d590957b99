#![allow(clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jsonschema::JSONSchema;
use serde_json::Value;
use ulid::Ulid;

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn assert_schema(schema_path: &Path, value: &Value) {
    let schema = read_json(schema_path);
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

fn dfc_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_dfc"));
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run dfc command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

#[test]
fn help_lists_expected_subcommands() {
    let output = match Command::new(env!("CARGO_BIN_EXE_dfc")).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["round", "forecast", "stats", "history", "poll", "advice", "signatures"] {
        assert!(stdout.contains(required), "missing subcommand {required}");
    }
}

#[test]
fn forecast_json_matches_contract_schema() {
    let db_path = std::env::temp_dir().join(format!("dfc-contract-{}.sqlite3", Ulid::new()));
    let rounds = [
        ("1", "6,5,4"),
        ("2", "1,2,2"),
        ("3", "3,3,6"),
        ("4", "6,6,2"),
        ("5", "1,1,4"),
        ("6", "5,4,3"),
        ("7", "2,2,2"),
        ("8", "6,3,5"),
        ("9", "4,4,4"),
        ("10", "1,6,6"),
    ];
    for (round_id, dice) in rounds {
        let output = dfc_output(
            &db_path,
            &["round", "append", "--round-id", round_id, "--dice", dice],
        );
        assert!(
            output.status.success(),
            "append failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        assert_eq!(stdout_json(&output)["accepted"], Value::Bool(true));
    }

    let output = dfc_output(&db_path, &["forecast", "--json"]);
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_schema(
        &repo_root().join("contracts/forecast/v1/forecast.schema.json"),
        &report,
    );
    assert_eq!(report["round_id"], Value::from(10));
    assert_eq!(report["pattern"], Value::from("HLHHLHLHHH"));

    let _ = fs::remove_file(&db_path);
}

#[test]
fn forecast_on_empty_store_exits_non_zero() {
    let db_path = std::env::temp_dir().join(format!("dfc-empty-{}.sqlite3", Ulid::new()));
    let output = dfc_output(&db_path, &["forecast"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not ready"));
    let _ = fs::remove_file(&db_path);
}
