#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::{json, Value};
use ulid::Ulid;

fn bt_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_bt") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/bt");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "benchtrack-cli", "--bin", "bt"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build bt binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn bt_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(bt_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to execute bt command {:?}: {err}", args),
    }
}

fn parse_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "bt command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout json: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn temp_file(label: &str, extension: &str) -> PathBuf {
    std::env::temp_dir().join(format!("bt-snapshot-{label}-{}.{extension}", Ulid::new()))
}

fn remove_db(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut raw = path.as_os_str().to_os_string();
        raw.push(suffix);
        let _ = fs::remove_file(PathBuf::from(raw));
    }
}

fn seed_history(db: &Path) {
    for day in 1..=5_u32 {
        let report = json!({
            "commit": {
                "id": format!("{day:040x}"),
                "author": {"name": "Dev One", "email": "dev@example.com", "username": "devone"},
                "committer": {"name": "GitHub", "email": "noreply@github.com", "username": "web-flow"},
                "distinct": true,
                "message": format!("change {day}"),
                "timestamp": format!("2024-05-0{day}T08:00:00Z"),
                "url": format!("https://example.com/commit/{day}")
            },
            "date": 1_714_550_400_000_i64 + i64::from(day - 1) * 86_400_000,
            "tool": "cargo",
            "benches": [
                {"name": "decode/small", "value": 100 + day, "range": "± 3", "unit": "ns/iter"},
                {"name": "throughput", "value": 5_000 - day, "unit": "ops/s", "biggerIsBetter": true}
            ]
        });
        let path = temp_file("report", "json");
        if let Err(err) = fs::write(&path, report.to_string()) {
            panic!("failed to write report: {err}");
        }
        let path_text = path.display().to_string();
        parse_json(&bt_output(db, &["ingest", "--report", path_text.as_str()]));
        let _ = fs::remove_file(&path);
    }
}

#[test]
fn series_queries_return_ordered_history() {
    let db = temp_file("series", "sqlite3");
    seed_history(&db);

    let list = parse_json(&bt_output(&db, &["series", "list", "--tool", "cargo"]));
    assert_eq!(list["contract_version"], json!("series_list.v1"));
    assert_eq!(list["series"], json!(["decode/small", "throughput"]));

    let show = parse_json(&bt_output(
        &db,
        &[
            "series",
            "show",
            "--series",
            "cargo:decode/small",
            "--from",
            "2024-05-02T00:00:00Z",
            "--to",
            "2024-05-04T23:59:59Z",
        ],
    ));
    let values: Vec<f64> = show["entries"]
        .as_array()
        .map(|entries| entries.iter().filter_map(|entry| entry["value"].as_f64()).collect())
        .unwrap_or_default();
    assert_eq!(values, vec![102.0, 103.0, 104.0]);
    assert_eq!(show["info"]["entry_count"], json!(5));

    let last = parse_json(&bt_output(
        &db,
        &["series", "show", "--series", "cargo:decode/small", "--last", "2"],
    ));
    assert_eq!(last["entries"].as_array().map(Vec::len), Some(2));

    let latest = parse_json(&bt_output(&db, &["latest", "--series", "cargo:throughput"]));
    assert_eq!(latest["entry"]["value"], json!(4_995.0));
    assert_eq!(latest["entry"]["run"]["commit"]["author"]["username"], json!("devone"));

    let evaluation = parse_json(&bt_output(&db, &["evaluate", "--series", "cargo:throughput"]));
    assert_eq!(evaluation["contract_version"], json!("evaluation.v1"));
    assert_eq!(evaluation["evaluation"]["polarity"], json!("lower_is_worse"));

    let missing = parse_json(&bt_output(&db, &["latest", "--series", "cargo:missing"]));
    assert_eq!(missing["entry"], Value::Null);

    remove_db(&db);
}

#[test]
fn export_import_round_trip_is_byte_identical() {
    let source_db = temp_file("export-source", "sqlite3");
    let replica_db = temp_file("export-replica", "sqlite3");
    let first = temp_file("data", "js");
    let second = temp_file("data-again", "js");
    seed_history(&source_db);

    let first_text = first.display().to_string();
    let exported = parse_json(&bt_output(
        &source_db,
        &[
            "export",
            "--output",
            first_text.as_str(),
            "--repo-url",
            "https://example.com/repo",
            "--js",
        ],
    ));
    assert_eq!(exported["runs"], json!(5));
    assert_eq!(exported["format"], json!("data.js"));

    let imported = parse_json(&bt_output(&replica_db, &["import", "--input", first_text.as_str()]));
    assert_eq!(imported["runs"], json!(5));
    assert_eq!(imported["inserted"], json!(10));
    assert_eq!(imported["duplicates"], json!(0));

    let second_text = second.display().to_string();
    parse_json(&bt_output(
        &replica_db,
        &[
            "export",
            "--output",
            second_text.as_str(),
            "--repo-url",
            "https://example.com/repo",
            "--js",
        ],
    ));

    let read = |path: &Path| match fs::read_to_string(path) {
        Ok(body) => body,
        Err(err) => panic!("failed to read {}: {err}", path.display()),
    };
    let first_body = read(&first);
    assert!(first_body.starts_with("window.BENCHMARK_DATA = "));
    assert!(first_body.contains("\"range\": \"± 3\""));
    assert_eq!(first_body, read(&second));

    let reimported = parse_json(&bt_output(&replica_db, &["import", "--input", first_text.as_str()]));
    assert_eq!(reimported["inserted"], json!(0));
    assert_eq!(reimported["duplicates"], json!(10));

    remove_db(&source_db);
    remove_db(&replica_db);
    let _ = fs::remove_file(&first);
    let _ = fs::remove_file(&second);
}

#[test]
fn stdout_export_is_the_history_document() {
    let db = temp_file("stdout-export", "sqlite3");
    seed_history(&db);
    let document = parse_json(&bt_output(&db, &["export"]));
    assert_eq!(document["entries"]["cargo"].as_array().map(Vec::len), Some(5));
    assert_eq!(
        document["entries"]["cargo"][0]["benches"][1]["biggerIsBetter"],
        json!(true)
    );
    remove_db(&db);
}

#[test]
fn prune_removes_old_entries_and_keeps_tables_append_only() {
    let db = temp_file("prune", "sqlite3");
    seed_history(&db);

    let pruned = parse_json(&bt_output(&db, &["prune", "--before", "2024-05-03T00:00:00Z"]));
    assert_eq!(pruned["contract_version"], json!("prune_result.v1"));
    assert_eq!(pruned["entries_removed"], json!(4));
    assert_eq!(pruned["runs_removed"], json!(2));
    assert_eq!(pruned["series_removed"], json!(0));

    let show = parse_json(&bt_output(&db, &["series", "show", "--series", "cargo:decode/small"]));
    assert_eq!(show["entries"].as_array().map(Vec::len), Some(3));

    let conn = match Connection::open(&db) {
        Ok(conn) => conn,
        Err(err) => panic!("failed to open db: {err}"),
    };
    assert!(conn.execute("DELETE FROM series_entries", []).is_err());
    assert!(conn.execute("UPDATE series_entries SET value = 0", []).is_err());
    drop(conn);

    remove_db(&db);
}
