//! Append-only series storage contract.
//!
//! A [`HistoryStore`] owns every invariant of the history: one entry per
//! `(series, commit)`, non-decreasing `recorded_at` on the live path, and
//! all-or-nothing commits across the series of one run. Implementations decide
//! durability; [`crate::memory::InMemoryHistoryStore`] keeps everything in
//! process and `benchtrack-store-sqlite` persists to SQLite.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{from_unix_millis, unix_millis, BenchError, BenchRun, Commit, Polarity, SeriesKey};

/// Rows fetched per round trip by [`SeriesCursor`].
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Total order of entries inside one series: `recorded_at` first, insertion
/// sequence second.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntryPosition {
    pub recorded_at_ms: i64,
    pub entry_seq: i64,
}

/// The run an entry belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRef {
    pub run_id: Ulid,
    pub commit: Commit,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeriesEntry {
    pub position: EntryPosition,
    pub run: RunRef,
    pub value: f64,
    pub uncertainty: f64,
    pub unit: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AppendStatus {
    Inserted,
    Duplicate,
}

impl AppendStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeriesAppend {
    pub series: SeriesKey,
    pub status: AppendStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<EntryPosition>,
}

/// Result of a successful append: one status per metric, in report order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Absent when every metric was already recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Ulid>,
    /// The stored copy of the run's commit. The first report for a sha
    /// wins, so this can differ from the submitted metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<Commit>,
    pub series: Vec<SeriesAppend>,
}

impl AppendOutcome {
    pub fn inserted(&self) -> impl Iterator<Item = &SeriesAppend> {
        self.series
            .iter()
            .filter(|item| item.status == AppendStatus::Inserted)
    }

    #[must_use]
    pub fn inserted_count(&self) -> usize {
        self.inserted().count()
    }

    #[must_use]
    pub fn duplicate_count(&self) -> usize {
        self.series.len() - self.inserted_count()
    }
}

/// How a re-ingested `(series, commit)` pair is treated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Already-recorded series are reported as [`AppendStatus::Duplicate`].
    #[default]
    Ignore,
    /// Any already-recorded series fails the whole run with
    /// [`BenchError::DuplicateEntry`].
    Reject,
}

/// Which commit path a run takes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AppendMode {
    /// Rejects entries older than the series tail.
    Live,
    /// Accepts entries anywhere in the series.
    Backfill,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StoreOptions {
    pub duplicate_policy: DuplicatePolicy,
    /// Read connections kept open beside the writer. Zero reads through the
    /// write connection.
    pub read_pool_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::Ignore,
            read_pool_size: 4,
        }
    }
}

/// Inclusive `recorded_at` bounds, in Unix milliseconds.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ReadBounds {
    pub from_ms: Option<i64>,
    pub to_ms: Option<i64>,
}

impl ReadBounds {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn between(from: Option<OffsetDateTime>, to: Option<OffsetDateTime>) -> Self {
        Self {
            from_ms: from.map(unix_millis),
            to_ms: to.map(unix_millis),
        }
    }

    #[must_use]
    pub fn contains(&self, recorded_at_ms: i64) -> bool {
        self.from_ms.map_or(true, |from| recorded_at_ms >= from)
            && self.to_ms.map_or(true, |to| recorded_at_ms <= to)
    }

    #[must_use]
    pub fn is_empty_range(&self) -> bool {
        matches!((self.from_ms, self.to_ms), (Some(from), Some(to)) if from > to)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeriesInfo {
    pub key: SeriesKey,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polarity_hint: Option<Polarity>,
    pub entry_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_entry: Option<EntryPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_entry: Option<EntryPosition>,
}

/// A stored run with the metrics it contributed, in report order.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRun {
    pub run_id: Ulid,
    pub run: BenchRun,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PruneReport {
    #[serde(with = "time::serde::rfc3339")]
    pub cutoff: OffsetDateTime,
    pub entries_removed: u64,
    pub runs_removed: u64,
    /// Series left without entries are dropped along with them.
    pub series_removed: u64,
}

/// Durable, ordered, deduplicated history keyed by series.
pub trait HistoryStore: Send + Sync {
    /// Commits a run on the live path.
    ///
    /// # Errors
    /// Returns [`BenchError::DuplicateEntry`] under [`DuplicatePolicy::Reject`],
    /// [`BenchError::OutOfOrderEntry`] when any metric is older than its series
    /// tail, and [`BenchError::StoreUnavailable`] on persistence failure. Every
    /// error leaves all series unchanged.
    fn append(&self, run: &BenchRun) -> Result<AppendOutcome, BenchError>;

    /// Commits a run that may land before existing entries.
    ///
    /// # Errors
    /// As [`HistoryStore::append`], minus the ordering check.
    fn backfill(&self, run: &BenchRun) -> Result<AppendOutcome, BenchError>;

    /// Highest entry sequence committed so far; pins cursor snapshots.
    ///
    /// # Errors
    /// Returns [`BenchError::StoreUnavailable`] when the store cannot be read.
    fn snapshot_seq(&self) -> Result<i64, BenchError>;

    /// Up to `limit` entries strictly after `after`, within `bounds`, with
    /// `entry_seq <= snapshot`, ascending.
    ///
    /// # Errors
    /// Returns [`BenchError::StoreUnavailable`] when the store cannot be read.
    fn read_page(
        &self,
        key: &SeriesKey,
        bounds: &ReadBounds,
        after: Option<EntryPosition>,
        snapshot: i64,
        limit: usize,
    ) -> Result<Vec<SeriesEntry>, BenchError>;

    /// The last `limit` entries strictly before `before` (or the tail when
    /// `None`), ascending.
    ///
    /// # Errors
    /// Returns [`BenchError::StoreUnavailable`] when the store cannot be read.
    fn read_tail(
        &self,
        key: &SeriesKey,
        before: Option<EntryPosition>,
        limit: usize,
    ) -> Result<Vec<SeriesEntry>, BenchError>;

    /// Benchmark names recorded under `tool`.
    ///
    /// # Errors
    /// Returns [`BenchError::StoreUnavailable`] when the store cannot be read.
    fn list_series(&self, tool: &str) -> Result<BTreeSet<String>, BenchError>;

    /// # Errors
    /// Returns [`BenchError::StoreUnavailable`] when the store cannot be read.
    fn series_info(&self, key: &SeriesKey) -> Result<Option<SeriesInfo>, BenchError>;

    /// Every series, ordered by key.
    ///
    /// # Errors
    /// Returns [`BenchError::StoreUnavailable`] when the store cannot be read.
    fn all_series(&self) -> Result<Vec<SeriesInfo>, BenchError>;

    /// Every run ordered by `(recorded_at, insertion)`, each carrying the
    /// metrics it still owns.
    ///
    /// # Errors
    /// Returns [`BenchError::StoreUnavailable`] when the store cannot be read.
    fn list_runs(&self) -> Result<Vec<StoredRun>, BenchError>;

    /// Deletes entries recorded strictly before `cutoff`. Runs left without
    /// entries are removed too.
    ///
    /// # Errors
    /// Returns [`BenchError::StoreUnavailable`] on persistence failure.
    fn prune_before(&self, cutoff: OffsetDateTime) -> Result<PruneReport, BenchError>;
}

/// Decides the fate of one metric of `run` against the current series state.
///
/// Duplicates are checked before ordering, so a re-sent report is a no-op even
/// when the series has moved on.
///
/// # Errors
/// Returns [`BenchError::DuplicateEntry`] or [`BenchError::OutOfOrderEntry`].
pub fn classify_candidate(
    key: &SeriesKey,
    run: &BenchRun,
    already_recorded: bool,
    tail_ms: Option<i64>,
    mode: AppendMode,
    policy: DuplicatePolicy,
) -> Result<AppendStatus, BenchError> {
    if already_recorded {
        return match policy {
            DuplicatePolicy::Ignore => Ok(AppendStatus::Duplicate),
            DuplicatePolicy::Reject => Err(BenchError::DuplicateEntry {
                series: key.clone(),
                sha: run.commit.sha.clone(),
            }),
        };
    }

    if mode == AppendMode::Live {
        if let Some(tail_ms) = tail_ms {
            if unix_millis(run.recorded_at) < tail_ms {
                return Err(BenchError::OutOfOrderEntry {
                    series: key.clone(),
                    candidate: run.recorded_at,
                    tail: from_unix_millis(tail_ms)?,
                });
            }
        }
    }

    Ok(AppendStatus::Inserted)
}

/// Lazy, restartable walk over one series.
///
/// The cursor pins the store's high-water sequence when opened, so entries
/// committed afterwards (including backfills) stay invisible to it. Dropping
/// the cursor abandons the read.
pub struct SeriesCursor<'a> {
    store: &'a dyn HistoryStore,
    key: SeriesKey,
    bounds: ReadBounds,
    snapshot: i64,
    page_size: usize,
    after: Option<EntryPosition>,
    buffer: VecDeque<SeriesEntry>,
    done: bool,
}

impl<'a> SeriesCursor<'a> {
    /// # Errors
    /// Returns [`BenchError::StoreUnavailable`] when the snapshot cannot be
    /// pinned.
    pub fn open(
        store: &'a dyn HistoryStore,
        key: SeriesKey,
        bounds: ReadBounds,
    ) -> Result<Self, BenchError> {
        let snapshot = store.snapshot_seq()?;
        Ok(Self {
            store,
            key,
            done: bounds.is_empty_range(),
            bounds,
            snapshot,
            page_size: DEFAULT_PAGE_SIZE,
            after: None,
            buffer: VecDeque::new(),
        })
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    #[must_use]
    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    #[must_use]
    pub fn snapshot(&self) -> i64 {
        self.snapshot
    }

    /// Rewinds to the first entry of the same snapshot.
    pub fn restart(&mut self) {
        self.after = None;
        self.buffer.clear();
        self.done = self.bounds.is_empty_range();
    }

    fn fill(&mut self) -> Result<(), BenchError> {
        let page = self.store.read_page(
            &self.key,
            &self.bounds,
            self.after,
            self.snapshot,
            self.page_size,
        )?;
        if page.len() < self.page_size {
            self.done = true;
        }
        if let Some(last) = page.last() {
            self.after = Some(last.position);
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for SeriesCursor<'_> {
    type Item = Result<SeriesEntry, BenchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            if let Err(err) = self.fill() {
                self.done = true;
                return Some(Err(err));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
