#![allow(clippy::float_cmp)]

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use benchtrack_core::alert::{AlertSink, CollectingAlertSink, RegressionAlert};
use benchtrack_core::detect::RegressionDetector;
use benchtrack_core::ingest::Ingestor;
use benchtrack_core::query::QueryEngine;
use benchtrack_core::store::{AppendMode, HistoryStore};
use benchtrack_core::{BenchError, SeriesKey};
use benchtrack_store_sqlite::SqliteHistoryStore;
use serde_json::{json, Value};
use ulid::Ulid;

fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err}"),
    }
}

struct TempDb {
    path: PathBuf,
}

impl TempDb {
    fn new(label: &str) -> Self {
        Self {
            path: std::env::temp_dir().join(format!("benchtrack-{label}-{}.sqlite3", Ulid::new())),
        }
    }

    fn open(&self) -> SqliteHistoryStore {
        let store = must(SqliteHistoryStore::open(&self.path));
        must(store.migrate());
        store
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut raw = self.path.clone().into_os_string();
            raw.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(raw));
        }
    }
}

struct OfflineSink;

impl AlertSink for OfflineSink {
    fn notify(&self, _alert: &RegressionAlert) -> Result<(), BenchError> {
        Err(BenchError::AlertDelivery("webhook unreachable".to_string()))
    }
}

fn report(seed: u32, second: u32, benches: &[(&str, f64)]) -> Value {
    let minute = second / 60;
    let second = second % 60;
    json!({
        "commit": {
            "id": format!("{seed:040x}"),
            "author": {"name": "Dev One", "email": "dev@example.com", "username": "devone"},
            "timestamp": format!("2024-06-01T09:{minute:02}:{second:02}Z"),
            "url": format!("https://example.com/commit/{seed}")
        },
        "tool": "cargo",
        "benches": benches
            .iter()
            .map(|(name, value)| json!({"name": name, "value": value, "range": "± 1000000", "unit": "ns/iter"}))
            .collect::<Vec<_>>()
    })
}

fn key(name: &str) -> SeriesKey {
    must(SeriesKey::new("cargo", name))
}

#[test]
fn concurrent_writers_keep_every_series_ordered() {
    let db = TempDb::new("concurrent");
    let store = Arc::new(db.open());
    let detector = Arc::new(RegressionDetector::default());

    let handles: Vec<_> = (0..4_u32)
        .map(|worker| {
            let store = Arc::clone(&store);
            let detector = Arc::clone(&detector);
            thread::spawn(move || {
                let ingestor = Ingestor::new(store.as_ref(), detector.as_ref());
                for step in 0..10_u32 {
                    let seed = worker * 100 + step + 1;
                    let payload = report(
                        seed,
                        step * 4 + worker,
                        &[("langid/overview", 30_000_000.0), ("langid/detect", 1_000.0)],
                    );
                    match ingestor.ingest_value(&payload, AppendMode::Live) {
                        Ok(_) => {}
                        Err(BenchError::OutOfOrderEntry { .. }) => {
                            must(ingestor.ingest_value(&payload, AppendMode::Backfill));
                        }
                        Err(err) => panic!("test failure: {err}"),
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        if handle.join().is_err() {
            panic!("writer thread panicked");
        }
    }

    let engine = QueryEngine::new(store.as_ref());
    for name in ["langid/overview", "langid/detect"] {
        let entries: Vec<_> = must(engine.history(&key(name)))
            .with_page_size(16)
            .map(must)
            .collect();
        assert_eq!(entries.len(), 40);
        for pair in entries.windows(2) {
            assert!(pair[0].position < pair[1].position);
            assert!(pair[0].run.recorded_at <= pair[1].run.recorded_at);
        }
    }
    assert_eq!(must(store.list_runs()).len(), 40);
}

#[test]
fn regression_alert_flows_from_sqlite_history() {
    let db = TempDb::new("alert");
    let store = db.open();
    let detector = RegressionDetector::default();
    let sink = CollectingAlertSink::new();
    let ingestor = Ingestor::new(&store, &detector).with_sink(&sink);

    for i in 0..10 {
        must(ingestor.ingest_value(
            &report(i + 1, i * 60, &[("langid/overview", 30_000_000.0)]),
            AppendMode::Live,
        ));
    }
    let steady = must(ingestor.ingest_value(
        &report(50, 11 * 60, &[("langid/overview", 30_500_000.0)]),
        AppendMode::Live,
    ));
    assert!(!steady.has_regression());

    let outcome = must(ingestor.ingest_value(
        &report(99, 12 * 60, &[("langid/overview", 45_000_000.0)]),
        AppendMode::Live,
    ));
    assert!(outcome.has_regression());
    let alerts = sink.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].value, 45_000_000.0);
    assert_eq!(alerts[0].commit.sha.as_str(), format!("{:040x}", 99));
}

#[test]
fn failed_alert_delivery_keeps_the_entry() {
    let db = TempDb::new("offline-sink");
    let store = db.open();
    let detector = RegressionDetector::default();
    let offline = OfflineSink;
    let ingestor = Ingestor::new(&store, &detector).with_sink(&offline);

    for i in 0..10 {
        must(ingestor.ingest_value(
            &report(i + 1, i * 60, &[("langid/overview", 30_000_000.0)]),
            AppendMode::Live,
        ));
    }
    let outcome = must(ingestor.ingest_value(
        &report(99, 12 * 60, &[("langid/overview", 45_000_000.0)]),
        AppendMode::Live,
    ));
    assert_eq!(outcome.alert_failures, 1);
    assert_eq!(outcome.alerts_delivered, 0);

    let reopened = db.open();
    let latest = must(QueryEngine::new(&reopened).latest(&key("langid/overview")));
    assert_eq!(latest.map(|entry| entry.value), Some(45_000_000.0));
}

#[test]
fn one_invalid_metric_leaves_no_trace() {
    let db = TempDb::new("invalid-metric");
    let store = db.open();
    let detector = RegressionDetector::default();
    let ingestor = Ingestor::new(&store, &detector);

    let mut payload = report(
        1,
        0,
        &[("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0), ("e", 5.0)],
    );
    if let Some(benches) = payload["benches"].as_array_mut() {
        benches.push(json!({"name": "f", "value": "not-a-number", "unit": "ns/iter"}));
    }

    let err = match ingestor.ingest_value(&payload, AppendMode::Live) {
        Ok(_) => panic!("expected malformed report"),
        Err(err) => err,
    };
    assert_eq!(err.code(), "malformed_report");
    assert!(must(store.all_series()).is_empty());
    assert!(must(store.list_runs()).is_empty());
}
