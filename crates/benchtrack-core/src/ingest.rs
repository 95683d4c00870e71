//! Parse, append, evaluate, alert: the write path for one report.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::alert::{AlertSink, RegressionAlert};
use crate::detect::{Evaluation, RegressionDetector};
use crate::report::parse_report;
use crate::store::{AppendMode, AppendOutcome, HistoryStore, RunRef, SeriesEntry};
use crate::{BenchError, BenchRun, CommitSha, SeriesKey};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SeriesEvaluation {
    pub series: SeriesKey,
    pub commit: CommitSha,
    pub value: f64,
    pub unit: String,
    pub evaluation: Evaluation,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IngestReport {
    pub outcome: AppendOutcome,
    /// One per inserted series on the live path; empty for backfills.
    pub evaluations: Vec<SeriesEvaluation>,
    pub alerts_delivered: usize,
    pub alert_failures: usize,
}

impl IngestReport {
    pub fn regressions(&self) -> impl Iterator<Item = &SeriesEvaluation> {
        self.evaluations
            .iter()
            .filter(|item| item.evaluation.verdict.is_regression())
    }

    #[must_use]
    pub fn has_regression(&self) -> bool {
        self.regressions().next().is_some()
    }
}

/// Wires parser, store, detector and sinks for one report at a time.
///
/// The store lock is released before detection starts; sink failures are
/// logged and never undo the append.
pub struct Ingestor<'a> {
    store: &'a dyn HistoryStore,
    detector: &'a RegressionDetector,
    sinks: Vec<&'a dyn AlertSink>,
}

impl<'a> Ingestor<'a> {
    #[must_use]
    pub fn new(store: &'a dyn HistoryStore, detector: &'a RegressionDetector) -> Self {
        Self {
            store,
            detector,
            sinks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: &'a dyn AlertSink) -> Self {
        self.sinks.push(sink);
        self
    }

    /// # Errors
    /// Returns [`BenchError::MalformedReport`] for invalid reports and any
    /// append error from the store. Nothing is written on error.
    pub fn ingest_value(&self, report: &Value, mode: AppendMode) -> Result<IngestReport, BenchError> {
        let run = parse_report(report)?;
        self.ingest_run(&run, mode)
    }

    /// # Errors
    /// Returns any append error from the store.
    pub fn ingest_run(&self, run: &BenchRun, mode: AppendMode) -> Result<IngestReport, BenchError> {
        let outcome = match mode {
            AppendMode::Live => self.store.append(run)?,
            AppendMode::Backfill => self.store.backfill(run)?,
        };
        info!(
            commit = %run.commit.sha,
            tool = %run.tool,
            inserted = outcome.inserted_count(),
            duplicates = outcome.duplicate_count(),
            backfill = mode == AppendMode::Backfill,
            "ingested benchmark run"
        );

        let mut report = IngestReport {
            outcome,
            evaluations: Vec::new(),
            alerts_delivered: 0,
            alert_failures: 0,
        };
        if mode == AppendMode::Backfill {
            return Ok(report);
        }
        let Some(run_id) = report.outcome.run_id else {
            return Ok(report);
        };

        let commit = report
            .outcome
            .commit
            .clone()
            .unwrap_or_else(|| run.commit.clone());
        let run_ref = RunRef {
            run_id,
            commit,
            tool: run.tool.clone(),
            suite: run.suite.clone(),
            recorded_at: run.recorded_at,
        };
        for (metric, appended) in run.metrics.iter().zip(&report.outcome.series) {
            let Some(position) = appended.position else {
                continue;
            };
            let entry = SeriesEntry {
                position,
                run: run_ref.clone(),
                value: metric.value,
                uncertainty: metric.uncertainty,
                unit: metric.unit.clone(),
            };
            let evaluation = match self.detector.evaluate(self.store, &appended.series, &entry) {
                Ok(evaluation) => evaluation,
                Err(err) => {
                    warn!(series = %appended.series, error = %err, "regression evaluation skipped");
                    continue;
                }
            };
            debug!(
                series = %appended.series,
                verdict = evaluation.verdict.as_str(),
                deviation = evaluation.deviation,
                "evaluated series entry"
            );

            if let Some(alert) = RegressionAlert::from_evaluation(&appended.series, &entry, &evaluation) {
                for sink in &self.sinks {
                    match sink.notify(&alert) {
                        Ok(()) => report.alerts_delivered += 1,
                        Err(err) => {
                            report.alert_failures += 1;
                            warn!(series = %alert.series, commit = %alert.commit.sha, error = %err, "alert sink failed");
                        }
                    }
                }
            }

            report.evaluations.push(SeriesEvaluation {
                series: appended.series.clone(),
                commit: run.commit.sha.clone(),
                value: metric.value,
                unit: metric.unit.clone(),
                evaluation,
            });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::CollectingAlertSink;
    use crate::detect::{DetectorPolicy, Verdict};
    use crate::memory::InMemoryHistoryStore;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    struct FailingSink;

    impl AlertSink for FailingSink {
        fn notify(&self, _alert: &RegressionAlert) -> Result<(), BenchError> {
            Err(BenchError::AlertDelivery("chat service offline".to_string()))
        }
    }

    fn report(seed: u32, minute: u32, value: f64) -> Value {
        json!({
            "commit": {
                "id": format!("{seed:040x}"),
                "author": {"name": "Dev One", "email": "dev@example.com"},
                "timestamp": format!("2024-06-01T10:{minute:02}:00Z"),
                "url": format!("https://example.com/commit/{seed}")
            },
            "tool": "cargo",
            "benches": [{"name": "langid/overview", "value": value, "range": "± 1000000", "unit": "ns/iter"}]
        })
    }

    fn seed_flat_history(ingestor: &Ingestor<'_>) {
        for i in 0..10 {
            must_ok(ingestor.ingest_value(&report(i + 1, i, 30_000_000.0), AppendMode::Live));
        }
    }

    #[test]
    fn regression_reaches_every_sink() {
        let store = InMemoryHistoryStore::new();
        let detector = RegressionDetector::new(DetectorPolicy::default());
        let sink = CollectingAlertSink::new();
        let ingestor = Ingestor::new(&store, &detector).with_sink(&sink);
        seed_flat_history(&ingestor);

        let outcome = must_ok(ingestor.ingest_value(&report(99, 30, 45_000_000.0), AppendMode::Live));
        assert!(outcome.has_regression());
        assert_eq!(outcome.alerts_delivered, 1);
        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].series.to_string(), "cargo:langid/overview");
        assert!((alerts[0].baseline.center - 30_000_000.0).abs() < 1e-6);
    }

    #[test]
    fn alert_carries_the_first_stored_commit() {
        let store = InMemoryHistoryStore::new();
        let detector = RegressionDetector::default();
        let sink = CollectingAlertSink::new();
        let ingestor = Ingestor::new(&store, &detector).with_sink(&sink);
        seed_flat_history(&ingestor);

        let mut first = report(99, 29, 1.0);
        first["commit"]["message"] = json!("original");
        first["benches"][0]["name"] = json!("langid/detect");
        must_ok(ingestor.ingest_value(&first, AppendMode::Live));

        let mut edited = report(99, 30, 45_000_000.0);
        edited["commit"]["message"] = json!("rewritten");
        edited["commit"]["author"]["name"] = json!("Someone Else");
        let outcome = must_ok(ingestor.ingest_value(&edited, AppendMode::Live));
        assert!(outcome.has_regression());

        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].commit.sha.as_str(), format!("{:040x}", 99));
        assert_eq!(alerts[0].commit.message, "original");
        assert_eq!(alerts[0].commit.author.name, "Dev One");
        assert_eq!(alerts[0].commit.url, "https://example.com/commit/99");
    }

    #[test]
    fn early_entries_report_insufficient_history() {
        let store = InMemoryHistoryStore::new();
        let detector = RegressionDetector::default();
        let ingestor = Ingestor::new(&store, &detector);
        must_ok(ingestor.ingest_value(&report(1, 0, 10.0), AppendMode::Live));
        must_ok(ingestor.ingest_value(&report(2, 1, 10.0), AppendMode::Live));
        let third = must_ok(ingestor.ingest_value(&report(3, 2, 1_000_000_000.0), AppendMode::Live));
        assert_eq!(
            third.evaluations[0].evaluation.verdict,
            Verdict::InsufficientHistory {
                available: 2,
                required: 5
            }
        );
        assert!(!third.has_regression());
    }

    #[test]
    fn failing_sink_keeps_the_append() {
        let store = InMemoryHistoryStore::new();
        let detector = RegressionDetector::default();
        let failing = FailingSink;
        let ingestor = Ingestor::new(&store, &detector).with_sink(&failing);
        seed_flat_history(&ingestor);

        let outcome = must_ok(ingestor.ingest_value(&report(99, 30, 45_000_000.0), AppendMode::Live));
        assert_eq!(outcome.alert_failures, 1);
        let key = must_ok(SeriesKey::new("cargo", "langid/overview"));
        let tail = must_ok(store.read_tail(&key, None, 1));
        assert!((tail[0].value - 45_000_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn invalid_metric_rejects_whole_report() {
        let store = InMemoryHistoryStore::new();
        let detector = RegressionDetector::default();
        let ingestor = Ingestor::new(&store, &detector);
        let mut benches: Vec<Value> = (0..5)
            .map(|i| json!({"name": format!("codec/{i}"), "value": 10 + i, "unit": "ns/iter"}))
            .collect();
        benches.push(json!({"name": "codec/bad", "value": "NaN", "unit": "ns/iter"}));
        let mut payload = report(1, 0, 1.0);
        payload["benches"] = Value::Array(benches);

        let result = ingestor.ingest_value(&payload, AppendMode::Live);
        assert!(matches!(result, Err(BenchError::MalformedReport(_))));
        assert!(must_ok(store.all_series()).is_empty());
    }

    #[test]
    fn backfill_skips_detection() {
        let store = InMemoryHistoryStore::new();
        let detector = RegressionDetector::default();
        let sink = CollectingAlertSink::new();
        let ingestor = Ingestor::new(&store, &detector).with_sink(&sink);
        seed_flat_history(&ingestor);
        let outcome = must_ok(ingestor.ingest_value(&report(77, 59, 90_000_000.0), AppendMode::Backfill));
        assert!(outcome.evaluations.is_empty());
        assert!(sink.is_empty());
    }
}
