//! Process-local [`HistoryStore`] for embedding and tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use time::OffsetDateTime;
use ulid::Ulid;

use crate::store::{
    classify_candidate, AppendMode, AppendOutcome, AppendStatus, EntryPosition, HistoryStore,
    PruneReport, ReadBounds, RunRef, SeriesAppend, SeriesEntry, SeriesInfo, StoreOptions,
    StoredRun,
};
use crate::{unix_millis, BenchError, BenchRun, Commit, CommitSha, Metric, Polarity, SeriesKey};

#[derive(Debug, Default)]
struct MemoryState {
    last_seq: i64,
    commits: BTreeMap<CommitSha, Commit>,
    runs: Vec<MemoryRun>,
    series: BTreeMap<SeriesKey, MemorySeries>,
}

#[derive(Debug)]
struct MemoryRun {
    run_ref: RunRef,
    metrics: Vec<Metric>,
}

#[derive(Debug)]
struct MemorySeries {
    unit: String,
    polarity_hint: Option<Polarity>,
    entries: Vec<SeriesEntry>,
    shas: BTreeSet<CommitSha>,
}

impl MemorySeries {
    fn info(&self, key: &SeriesKey) -> SeriesInfo {
        SeriesInfo {
            key: key.clone(),
            unit: self.unit.clone(),
            polarity_hint: self.polarity_hint,
            entry_count: self.entries.len() as u64,
            first_entry: self.entries.first().map(|entry| entry.position),
            last_entry: self.entries.last().map(|entry| entry.position),
        }
    }
}

/// In-memory history with the same invariants as the durable stores.
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    options: StoreOptions,
    state: Mutex<MemoryState>,
}

impl InMemoryHistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_options(options: StoreOptions) -> Self {
        Self {
            options,
            state: Mutex::new(MemoryState::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, BenchError> {
        self.state
            .lock()
            .map_err(|_| BenchError::StoreUnavailable("history store mutex poisoned".to_string()))
    }

    fn commit(&self, run: &BenchRun, mode: AppendMode) -> Result<AppendOutcome, BenchError> {
        let mut state = self.lock()?;

        let mut plan = Vec::with_capacity(run.metrics.len());
        for metric in &run.metrics {
            let key = run.series_key(metric);
            let series = state.series.get(&key);
            let already_recorded = series.is_some_and(|series| series.shas.contains(&run.commit.sha));
            let tail_ms = series
                .and_then(|series| series.entries.last())
                .map(|entry| entry.position.recorded_at_ms);
            let status = classify_candidate(
                &key,
                run,
                already_recorded,
                tail_ms,
                mode,
                self.options.duplicate_policy,
            )?;
            plan.push((key, status));
        }

        if plan.iter().all(|(_, status)| *status == AppendStatus::Duplicate) {
            return Ok(AppendOutcome {
                run_id: None,
                commit: None,
                series: plan
                    .into_iter()
                    .map(|(series, status)| SeriesAppend {
                        series,
                        status,
                        position: None,
                    })
                    .collect(),
            });
        }

        let commit = state
            .commits
            .entry(run.commit.sha.clone())
            .or_insert_with(|| run.commit.clone())
            .clone();
        let run_ref = RunRef {
            run_id: Ulid::new(),
            commit,
            tool: run.tool.clone(),
            suite: run.suite.clone(),
            recorded_at: run.recorded_at,
        };
        let recorded_at_ms = unix_millis(run.recorded_at);

        let mut outcome = Vec::with_capacity(plan.len());
        let mut owned_metrics = Vec::new();
        for (metric, (key, status)) in run.metrics.iter().zip(plan) {
            if status == AppendStatus::Duplicate {
                outcome.push(SeriesAppend {
                    series: key,
                    status,
                    position: None,
                });
                continue;
            }

            state.last_seq += 1;
            let position = EntryPosition {
                recorded_at_ms,
                entry_seq: state.last_seq,
            };
            let series = state
                .series
                .entry(key.clone())
                .or_insert_with(|| MemorySeries {
                    unit: metric.unit.clone(),
                    polarity_hint: None,
                    entries: Vec::new(),
                    shas: BTreeSet::new(),
                });
            series.polarity_hint = series.polarity_hint.or(metric.polarity);
            let index = series
                .entries
                .partition_point(|entry| entry.position < position);
            series.entries.insert(
                index,
                SeriesEntry {
                    position,
                    run: run_ref.clone(),
                    value: metric.value,
                    uncertainty: metric.uncertainty,
                    unit: metric.unit.clone(),
                },
            );
            series.shas.insert(run.commit.sha.clone());
            owned_metrics.push(metric.clone());
            outcome.push(SeriesAppend {
                series: key,
                status,
                position: Some(position),
            });
        }

        let run_id = run_ref.run_id;
        let stored_commit = run_ref.commit.clone();
        state.runs.push(MemoryRun {
            run_ref,
            metrics: owned_metrics,
        });
        Ok(AppendOutcome {
            run_id: Some(run_id),
            commit: Some(stored_commit),
            series: outcome,
        })
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn append(&self, run: &BenchRun) -> Result<AppendOutcome, BenchError> {
        self.commit(run, AppendMode::Live)
    }

    fn backfill(&self, run: &BenchRun) -> Result<AppendOutcome, BenchError> {
        self.commit(run, AppendMode::Backfill)
    }

    fn snapshot_seq(&self) -> Result<i64, BenchError> {
        Ok(self.lock()?.last_seq)
    }

    fn read_page(
        &self,
        key: &SeriesKey,
        bounds: &ReadBounds,
        after: Option<EntryPosition>,
        snapshot: i64,
        limit: usize,
    ) -> Result<Vec<SeriesEntry>, BenchError> {
        let state = self.lock()?;
        let Some(series) = state.series.get(key) else {
            return Ok(Vec::new());
        };
        Ok(series
            .entries
            .iter()
            .filter(|entry| entry.position.entry_seq <= snapshot)
            .filter(|entry| bounds.contains(entry.position.recorded_at_ms))
            .filter(|entry| after.map_or(true, |after| entry.position > after))
            .take(limit)
            .cloned()
            .collect())
    }

    fn read_tail(
        &self,
        key: &SeriesKey,
        before: Option<EntryPosition>,
        limit: usize,
    ) -> Result<Vec<SeriesEntry>, BenchError> {
        let state = self.lock()?;
        let Some(series) = state.series.get(key) else {
            return Ok(Vec::new());
        };
        let end = before.map_or(series.entries.len(), |before| {
            series
                .entries
                .partition_point(|entry| entry.position < before)
        });
        let start = end.saturating_sub(limit);
        Ok(series.entries[start..end].to_vec())
    }

    fn list_series(&self, tool: &str) -> Result<BTreeSet<String>, BenchError> {
        let state = self.lock()?;
        Ok(state
            .series
            .keys()
            .filter(|key| key.tool == tool)
            .map(|key| key.name.clone())
            .collect())
    }

    fn series_info(&self, key: &SeriesKey) -> Result<Option<SeriesInfo>, BenchError> {
        let state = self.lock()?;
        Ok(state.series.get(key).map(|series| series.info(key)))
    }

    fn all_series(&self) -> Result<Vec<SeriesInfo>, BenchError> {
        let state = self.lock()?;
        Ok(state
            .series
            .iter()
            .map(|(key, series)| series.info(key))
            .collect())
    }

    fn list_runs(&self) -> Result<Vec<StoredRun>, BenchError> {
        let state = self.lock()?;
        let mut runs: Vec<StoredRun> = state
            .runs
            .iter()
            .filter(|stored| !stored.metrics.is_empty())
            .map(|stored| StoredRun {
                run_id: stored.run_ref.run_id,
                run: BenchRun {
                    commit: stored.run_ref.commit.clone(),
                    tool: stored.run_ref.tool.clone(),
                    suite: stored.run_ref.suite.clone(),
                    recorded_at: stored.run_ref.recorded_at,
                    metrics: stored.metrics.clone(),
                },
            })
            .collect();
        runs.sort_by_key(|stored| unix_millis(stored.run.recorded_at));
        Ok(runs)
    }

    fn prune_before(&self, cutoff: OffsetDateTime) -> Result<PruneReport, BenchError> {
        let cutoff_ms = unix_millis(cutoff);
        let mut state = self.lock()?;

        let mut entries_removed = 0_u64;
        for series in state.series.values_mut() {
            let before = series.entries.len();
            series
                .entries
                .retain(|entry| entry.position.recorded_at_ms >= cutoff_ms);
            entries_removed += (before - series.entries.len()) as u64;
            series.shas = series
                .entries
                .iter()
                .map(|entry| entry.run.commit.sha.clone())
                .collect();
        }

        let runs_before = state.runs.len();
        state
            .runs
            .retain(|stored| unix_millis(stored.run_ref.recorded_at) >= cutoff_ms);
        let runs_removed = (runs_before - state.runs.len()) as u64;

        let series_before = state.series.len();
        state.series.retain(|_, series| !series.entries.is_empty());
        let series_removed = (series_before - state.series.len()) as u64;

        tracing::info!(
            %cutoff,
            entries_removed,
            runs_removed,
            series_removed,
            "pruned in-memory history"
        );
        Ok(PruneReport {
            cutoff,
            entries_removed,
            runs_removed,
            series_removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DuplicatePolicy, SeriesCursor};
    use crate::{parse_rfc3339, Person};

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn sha(seed: u32) -> CommitSha {
        must_ok(CommitSha::parse(&format!("{seed:040x}")))
    }

    fn run(seed: u32, timestamp: &str, metrics: &[(&str, f64)]) -> BenchRun {
        let person = Person {
            name: "Dev One".to_string(),
            email: "dev@example.com".to_string(),
            username: None,
        };
        let recorded_at = must_ok(parse_rfc3339(timestamp));
        BenchRun {
            commit: Commit {
                sha: sha(seed),
                author: person.clone(),
                committer: person,
                message: format!("commit {seed}"),
                timestamp: recorded_at,
                url: String::new(),
                tree_id: None,
                distinct: None,
            },
            tool: "cargo".to_string(),
            suite: None,
            recorded_at,
            metrics: metrics
                .iter()
                .map(|(name, value)| Metric {
                    name: (*name).to_string(),
                    value: *value,
                    uncertainty: 0.0,
                    unit: "ns/iter".to_string(),
                    polarity: None,
                    extra: None,
                })
                .collect(),
        }
    }

    fn key(name: &str) -> SeriesKey {
        must_ok(SeriesKey::new("cargo", name))
    }

    #[test]
    fn reingest_is_a_noop_by_default() {
        let store = InMemoryHistoryStore::new();
        let first = run(1, "2024-01-01T00:00:00Z", &[("a", 1.0), ("b", 2.0)]);
        must_ok(store.append(&first));
        let again = must_ok(store.append(&first));
        assert_eq!(again.run_id, None);
        assert_eq!(again.duplicate_count(), 2);
        assert_eq!(must_ok(store.read_tail(&key("a"), None, 10)).len(), 1);
        assert_eq!(must_ok(store.list_runs()).len(), 1);
    }

    #[test]
    fn reject_policy_fails_whole_run() {
        let store = InMemoryHistoryStore::with_options(StoreOptions {
            duplicate_policy: DuplicatePolicy::Reject,
            read_pool_size: 0,
        });
        must_ok(store.append(&run(1, "2024-01-01T00:00:00Z", &[("a", 1.0)])));
        let mixed = run(1, "2024-01-02T00:00:00Z", &[("b", 1.0), ("a", 1.0)]);
        assert!(matches!(store.append(&mixed), Err(BenchError::DuplicateEntry { .. })));
        assert!(must_ok(store.series_info(&key("b"))).is_none());
    }

    #[test]
    fn out_of_order_needs_backfill() {
        let store = InMemoryHistoryStore::new();
        must_ok(store.append(&run(2, "2024-01-02T00:00:00Z", &[("a", 2.0)])));
        let late = run(1, "2024-01-01T00:00:00Z", &[("a", 1.0)]);
        assert!(matches!(store.append(&late), Err(BenchError::OutOfOrderEntry { .. })));
        must_ok(store.backfill(&late));
        let values: Vec<f64> = must_ok(store.read_tail(&key("a"), None, 10))
            .iter()
            .map(|entry| entry.value)
            .collect();
        assert_eq!(values, vec![1.0, 2.0]);
    }

    #[test]
    fn cursor_pages_and_ignores_later_commits() {
        let store = InMemoryHistoryStore::new();
        for day in 1..=9_u32 {
            let timestamp = format!("2024-01-0{day}T00:00:00Z");
            must_ok(store.append(&run(day, &timestamp, &[("a", f64::from(day))])));
        }
        let mut cursor = must_ok(SeriesCursor::open(&store, key("a"), ReadBounds::all())).with_page_size(2);
        let first = must_ok(cursor.next().transpose()).map(|entry| entry.value);
        assert_eq!(first, Some(1.0));

        must_ok(store.backfill(&run(100, "2023-12-31T00:00:00Z", &[("a", 0.0)])));
        cursor.restart();
        let values: Vec<f64> = cursor.map(|entry| must_ok(entry).value).collect();
        assert_eq!(values, (1..=9).map(f64::from).collect::<Vec<_>>());
    }

    #[test]
    fn tail_reads_are_bounded_and_ascending() {
        let store = InMemoryHistoryStore::new();
        for day in 1..=5_u32 {
            let timestamp = format!("2024-01-0{day}T00:00:00Z");
            must_ok(store.append(&run(day, &timestamp, &[("a", f64::from(day))])));
        }
        let all = must_ok(store.read_tail(&key("a"), None, 10));
        let window = must_ok(store.read_tail(&key("a"), Some(all[4].position), 3));
        let values: Vec<f64> = window.iter().map(|entry| entry.value).collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn prune_drops_old_runs_only() {
        let store = InMemoryHistoryStore::new();
        must_ok(store.append(&run(1, "2024-01-01T00:00:00Z", &[("a", 1.0)])));
        must_ok(store.append(&run(2, "2024-01-03T00:00:00Z", &[("a", 2.0)])));
        let report = must_ok(store.prune_before(must_ok(parse_rfc3339("2024-01-02T00:00:00Z"))));
        assert_eq!(report.entries_removed, 1);
        assert_eq!(report.runs_removed, 1);
        assert_eq!(must_ok(store.list_runs()).len(), 1);
    }

    #[test]
    fn prune_drops_series_left_without_entries() {
        let store = InMemoryHistoryStore::new();
        must_ok(store.append(&run(1, "2024-01-01T00:00:00Z", &[("a", 1.0), ("b", 1.0)])));
        must_ok(store.append(&run(2, "2024-01-03T00:00:00Z", &[("a", 2.0)])));
        let report = must_ok(store.prune_before(must_ok(parse_rfc3339("2024-01-02T00:00:00Z"))));
        assert_eq!(report.series_removed, 1);
        assert!(must_ok(store.series_info(&key("b"))).is_none());
        let names: Vec<String> = must_ok(store.list_series("cargo")).into_iter().collect();
        assert_eq!(names, vec!["a".to_string()]);
        assert_eq!(must_ok(store.all_series()).len(), 1);
    }

    #[test]
    fn append_returns_the_first_stored_commit() {
        let store = InMemoryHistoryStore::new();
        must_ok(store.append(&run(1, "2024-01-01T00:00:00Z", &[("a", 1.0)])));
        let mut edited = run(1, "2024-01-02T00:00:00Z", &[("b", 2.0)]);
        edited.commit.message = "rewritten".to_string();
        let outcome = must_ok(store.append(&edited));
        let stored = outcome.commit.map(|commit| commit.message);
        assert_eq!(stored.as_deref(), Some("commit 1"));
    }
}
