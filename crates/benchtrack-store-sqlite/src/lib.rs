#![allow(clippy::missing_errors_doc)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use benchtrack_core::store::{
    classify_candidate, AppendMode, AppendOutcome, AppendStatus, EntryPosition, HistoryStore,
    PruneReport, ReadBounds, RunRef, SeriesAppend, SeriesEntry, SeriesInfo, StoreOptions,
    StoredRun,
};
use benchtrack_core::{
    format_rfc3339, now_utc, parse_rfc3339, unix_millis, BenchError, BenchRun, Commit, CommitSha,
    Metric, Person, Polarity, SeriesKey,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;
use tracing::{debug, info};
use ulid::Ulid;

const HISTORY_MIGRATION_VERSION: i64 = 1;

const SCHEMA_HISTORY_V1: &str = r"
CREATE TABLE IF NOT EXISTS commits (
  sha TEXT PRIMARY KEY CHECK (length(sha) = 40),
  author_name TEXT NOT NULL,
  author_email TEXT NOT NULL,
  author_username TEXT,
  committer_name TEXT NOT NULL,
  committer_email TEXT NOT NULL,
  committer_username TEXT,
  message TEXT NOT NULL,
  committed_at TEXT NOT NULL,
  url TEXT NOT NULL,
  tree_id TEXT,
  distinct_flag INTEGER CHECK (distinct_flag IN (0, 1) OR distinct_flag IS NULL)
);

CREATE TABLE IF NOT EXISTS runs (
  run_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL UNIQUE,
  sha TEXT NOT NULL,
  tool TEXT NOT NULL,
  suite TEXT,
  recorded_at TEXT NOT NULL,
  recorded_at_ms INTEGER NOT NULL,
  FOREIGN KEY (sha) REFERENCES commits(sha)
);

CREATE TABLE IF NOT EXISTS series (
  series_id INTEGER PRIMARY KEY AUTOINCREMENT,
  tool TEXT NOT NULL,
  name TEXT NOT NULL,
  unit TEXT NOT NULL,
  polarity_hint TEXT CHECK (
    polarity_hint IN ('higher_is_worse', 'lower_is_worse') OR polarity_hint IS NULL
  ),
  created_at TEXT NOT NULL,
  UNIQUE (tool, name)
);

CREATE TABLE IF NOT EXISTS series_entries (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  series_id INTEGER NOT NULL,
  run_seq INTEGER NOT NULL,
  sha TEXT NOT NULL,
  metric_index INTEGER NOT NULL CHECK (metric_index >= 0),
  value REAL NOT NULL,
  uncertainty REAL NOT NULL CHECK (uncertainty >= 0.0),
  unit TEXT NOT NULL,
  polarity TEXT CHECK (polarity IN ('higher_is_worse', 'lower_is_worse') OR polarity IS NULL),
  extra TEXT,
  recorded_at_ms INTEGER NOT NULL,
  UNIQUE (series_id, sha),
  FOREIGN KEY (series_id) REFERENCES series(series_id),
  FOREIGN KEY (run_seq) REFERENCES runs(run_seq),
  FOREIGN KEY (sha) REFERENCES commits(sha)
);

CREATE INDEX IF NOT EXISTS idx_series_entries_order
  ON series_entries(series_id, recorded_at_ms, entry_seq);
CREATE INDEX IF NOT EXISTS idx_series_entries_run
  ON series_entries(run_seq, metric_index);
CREATE INDEX IF NOT EXISTS idx_runs_order
  ON runs(recorded_at_ms, run_seq);

CREATE TABLE IF NOT EXISTS retention_lease (
  lease_id INTEGER PRIMARY KEY CHECK (lease_id = 1),
  acquired_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_commits_no_update
BEFORE UPDATE ON commits
BEGIN
  SELECT RAISE(FAIL, 'commits is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_commits_no_delete
BEFORE DELETE ON commits
BEGIN
  SELECT RAISE(FAIL, 'commits is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_runs_no_update
BEFORE UPDATE ON runs
BEGIN
  SELECT RAISE(FAIL, 'runs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_runs_no_delete
BEFORE DELETE ON runs
WHEN NOT EXISTS (SELECT 1 FROM retention_lease)
BEGIN
  SELECT RAISE(FAIL, 'runs is append-only outside retention pruning');
END;

CREATE TRIGGER IF NOT EXISTS trg_series_entries_no_update
BEFORE UPDATE ON series_entries
BEGIN
  SELECT RAISE(FAIL, 'series_entries is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_series_entries_no_delete
BEFORE DELETE ON series_entries
WHEN NOT EXISTS (SELECT 1 FROM retention_lease)
BEGIN
  SELECT RAISE(FAIL, 'series_entries is append-only outside retention pruning');
END;
";

const COMMIT_COLUMNS: &str = "c.sha, c.author_name, c.author_email, c.author_username,
    c.committer_name, c.committer_email, c.committer_username,
    c.message, c.committed_at, c.url, c.tree_id, c.distinct_flag";

const SERIES_STATS_QUERY: &str = "SELECT
    (SELECT COUNT(*) FROM series_entries WHERE series_id = ?1),
    (SELECT recorded_at_ms FROM series_entries WHERE series_id = ?1
       ORDER BY recorded_at_ms ASC, entry_seq ASC LIMIT 1),
    (SELECT entry_seq FROM series_entries WHERE series_id = ?1
       ORDER BY recorded_at_ms ASC, entry_seq ASC LIMIT 1),
    (SELECT recorded_at_ms FROM series_entries WHERE series_id = ?1
       ORDER BY recorded_at_ms DESC, entry_seq DESC LIMIT 1),
    (SELECT entry_seq FROM series_entries WHERE series_id = ?1
       ORDER BY recorded_at_ms DESC, entry_seq DESC LIMIT 1)";

/// SQLite-backed [`HistoryStore`].
///
/// Writes go through one connection inside an immediate transaction, which is
/// the only serialization point. Reads rotate over a pool of query-only
/// connections and see committed data only.
pub struct SqliteHistoryStore {
    path: PathBuf,
    options: StoreOptions,
    write_connection: Mutex<Connection>,
    read_connections: Vec<Mutex<Connection>>,
    read_cursor: AtomicUsize,
}

impl SqliteHistoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_options(path, StoreOptions::default())
    }

    pub fn open_with_options(path: &Path, options: StoreOptions) -> Result<Self> {
        let write_connection = open_connection(path)?;
        let in_memory = path == Path::new(":memory:");
        let pool_size = if in_memory { 0 } else { options.read_pool_size };

        let mut read_connections = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let connection = open_connection(path)?;
            connection
                .execute_batch("PRAGMA query_only = ON;")
                .context("failed to mark read connection query-only")?;
            read_connections.push(Mutex::new(connection));
        }

        Ok(Self {
            path: path.to_path_buf(),
            options,
            write_connection: Mutex::new(write_connection),
            read_connections,
            read_cursor: AtomicUsize::new(0),
        })
    }

    /// Creates or upgrades the schema. Safe to run on every start.
    pub fn migrate(&self) -> Result<()> {
        let conn = self
            .write_connection
            .lock()
            .map_err(|_| anyhow::anyhow!("write connection mutex poisoned"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_HISTORY_V1)
            .context("failed to apply history schema")?;

        let now = format_rfc3339(now_utc())?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![HISTORY_MIGRATION_VERSION, now],
        )
        .context("failed to register history schema migration")?;

        debug!(path = %self.path.display(), version = HISTORY_MIGRATION_VERSION, "history schema ready");
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>, BenchError> {
        self.write_connection
            .lock()
            .map_err(|_| BenchError::StoreUnavailable("write connection mutex poisoned".to_string()))
    }

    fn with_reader<T>(
        &self,
        what: &str,
        read: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, BenchError> {
        let guard = if self.read_connections.is_empty() {
            self.writer()?
        } else {
            let index = self.read_cursor.fetch_add(1, Ordering::Relaxed) % self.read_connections.len();
            self.read_connections[index].lock().map_err(|_| {
                BenchError::StoreUnavailable("read connection mutex poisoned".to_string())
            })?
        };
        read(&guard).store_context(what)
    }

    fn commit_run(&self, run: &BenchRun, mode: AppendMode) -> Result<AppendOutcome, BenchError> {
        let mut conn = self.writer()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .store_context("failed to start append transaction")?;

        let mut plan = Vec::with_capacity(run.metrics.len());
        for metric in &run.metrics {
            let key = run.series_key(metric);
            let series_id = find_series_id(&tx, &key).store_context("failed to resolve series")?;
            let (already_recorded, tail_ms) = match series_id {
                Some(series_id) => {
                    let recorded: bool = tx
                        .query_row(
                            "SELECT EXISTS(SELECT 1 FROM series_entries WHERE series_id = ?1 AND sha = ?2)",
                            params![series_id, run.commit.sha.as_str()],
                            |row| row.get(0),
                        )
                        .store_context("failed to check for duplicate entry")?;
                    let tail: Option<i64> = tx
                        .query_row(
                            "SELECT MAX(recorded_at_ms) FROM series_entries WHERE series_id = ?1",
                            params![series_id],
                            |row| row.get(0),
                        )
                        .store_context("failed to read series tail")?;
                    (recorded, tail)
                }
                None => (false, None),
            };
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
            debug!(commit = %run.commit.sha, tool = %run.tool, "run already recorded");
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

        let committed_at = format_rfc3339(run.commit.timestamp)?;
        insert_commit(&tx, &run.commit, &committed_at).store_context("failed to record commit")?;
        let stored_commit =
            load_commit(&tx, &run.commit.sha).store_context("failed to read stored commit")?;

        let run_id = Ulid::new();
        let recorded_at_ms = unix_millis(run.recorded_at);
        tx.execute(
            "INSERT INTO runs(run_id, sha, tool, suite, recorded_at, recorded_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run_id.to_string(),
                run.commit.sha.as_str(),
                run.tool,
                run.suite,
                format_rfc3339(run.recorded_at)?,
                recorded_at_ms,
            ],
        )
        .store_context("failed to record run")?;
        let run_seq = tx.last_insert_rowid();
        let created_at = format_rfc3339(now_utc())?;

        let mut outcome = Vec::with_capacity(plan.len());
        for (index, (metric, (key, status))) in run.metrics.iter().zip(plan).enumerate() {
            if status == AppendStatus::Duplicate {
                outcome.push(SeriesAppend {
                    series: key,
                    status,
                    position: None,
                });
                continue;
            }

            let series_id = ensure_series(&tx, &key, metric, &created_at)
                .store_context("failed to create series")?;
            tx.execute(
                "INSERT INTO series_entries(
                    series_id, run_seq, sha, metric_index, value, uncertainty,
                    unit, polarity, extra, recorded_at_ms
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    series_id,
                    run_seq,
                    run.commit.sha.as_str(),
                    i64::try_from(index).unwrap_or(i64::MAX),
                    metric.value,
                    metric.uncertainty,
                    metric.unit,
                    metric.polarity.map(Polarity::as_str),
                    metric.extra,
                    recorded_at_ms,
                ],
            )
            .store_context("failed to append series entry")?;
            outcome.push(SeriesAppend {
                series: key,
                status,
                position: Some(EntryPosition {
                    recorded_at_ms,
                    entry_seq: tx.last_insert_rowid(),
                }),
            });
        }

        tx.commit().store_context("failed to commit append transaction")?;

        let inserted = outcome
            .iter()
            .filter(|item| item.status == AppendStatus::Inserted)
            .count();
        debug!(
            commit = %run.commit.sha,
            run_id = %run_id,
            inserted,
            backfill = mode == AppendMode::Backfill,
            "appended run"
        );
        Ok(AppendOutcome {
            run_id: Some(run_id),
            commit: Some(stored_commit),
            series: outcome,
        })
    }

    #[cfg(test)]
    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.write_connection
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl HistoryStore for SqliteHistoryStore {
    fn append(&self, run: &BenchRun) -> Result<AppendOutcome, BenchError> {
        self.commit_run(run, AppendMode::Live)
    }

    fn backfill(&self, run: &BenchRun) -> Result<AppendOutcome, BenchError> {
        self.commit_run(run, AppendMode::Backfill)
    }

    fn snapshot_seq(&self) -> Result<i64, BenchError> {
        self.with_reader("failed to read snapshot sequence", |conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(entry_seq), 0) FROM series_entries",
                [],
                |row| row.get(0),
            )
        })
    }

    fn read_page(
        &self,
        key: &SeriesKey,
        bounds: &ReadBounds,
        after: Option<EntryPosition>,
        snapshot: i64,
        limit: usize,
    ) -> Result<Vec<SeriesEntry>, BenchError> {
        let sql = format!(
            "SELECT e.entry_seq, e.recorded_at_ms, e.value, e.uncertainty, e.unit,
                    r.run_id, r.tool, r.suite, r.recorded_at, {COMMIT_COLUMNS}
             FROM series_entries e
             JOIN series s ON s.series_id = e.series_id
             JOIN runs r ON r.run_seq = e.run_seq
             JOIN commits c ON c.sha = e.sha
             WHERE s.tool = ?1 AND s.name = ?2
               AND e.entry_seq <= ?3
               AND (?4 IS NULL OR e.recorded_at_ms >= ?4)
               AND (?5 IS NULL OR e.recorded_at_ms <= ?5)
               AND (?6 IS NULL
                    OR e.recorded_at_ms > ?6
                    OR (e.recorded_at_ms = ?6 AND e.entry_seq > ?7))
             ORDER BY e.recorded_at_ms ASC, e.entry_seq ASC
             LIMIT ?8"
        );
        self.with_reader("failed to read series page", |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(
                params![
                    key.tool,
                    key.name,
                    snapshot,
                    bounds.from_ms,
                    bounds.to_ms,
                    after.map(|position| position.recorded_at_ms),
                    after.map(|position| position.entry_seq),
                    sql_limit(limit),
                ],
                parse_entry_row,
            )?;
            collect_rows(rows)
        })
    }

    fn read_tail(
        &self,
        key: &SeriesKey,
        before: Option<EntryPosition>,
        limit: usize,
    ) -> Result<Vec<SeriesEntry>, BenchError> {
        let sql = format!(
            "SELECT e.entry_seq, e.recorded_at_ms, e.value, e.uncertainty, e.unit,
                    r.run_id, r.tool, r.suite, r.recorded_at, {COMMIT_COLUMNS}
             FROM series_entries e
             JOIN series s ON s.series_id = e.series_id
             JOIN runs r ON r.run_seq = e.run_seq
             JOIN commits c ON c.sha = e.sha
             WHERE s.tool = ?1 AND s.name = ?2
               AND (?3 IS NULL
                    OR e.recorded_at_ms < ?3
                    OR (e.recorded_at_ms = ?3 AND e.entry_seq < ?4))
             ORDER BY e.recorded_at_ms DESC, e.entry_seq DESC
             LIMIT ?5"
        );
        let mut entries = self.with_reader("failed to read series tail", |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(
                params![
                    key.tool,
                    key.name,
                    before.map(|position| position.recorded_at_ms),
                    before.map(|position| position.entry_seq),
                    sql_limit(limit),
                ],
                parse_entry_row,
            )?;
            collect_rows(rows)
        })?;
        entries.reverse();
        Ok(entries)
    }

    fn list_series(&self, tool: &str) -> Result<BTreeSet<String>, BenchError> {
        self.with_reader("failed to list series", |conn| {
            let mut stmt = conn.prepare_cached("SELECT name FROM series WHERE tool = ?1 ORDER BY name")?;
            let rows = stmt.query_map(params![tool], |row| row.get::<_, String>(0))?;
            Ok(collect_rows(rows)?.into_iter().collect())
        })
    }

    fn series_info(&self, key: &SeriesKey) -> Result<Option<SeriesInfo>, BenchError> {
        self.with_reader("failed to read series info", |conn| {
            let row = conn
                .query_row(
                    "SELECT series_id, tool, name, unit, polarity_hint FROM series
                     WHERE tool = ?1 AND name = ?2",
                    params![key.tool, key.name],
                    parse_series_row,
                )
                .optional()?;
            row.map(|row| load_series_info(conn, row)).transpose()
        })
    }

    fn all_series(&self) -> Result<Vec<SeriesInfo>, BenchError> {
        self.with_reader("failed to list series", |conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT series_id, tool, name, unit, polarity_hint FROM series ORDER BY tool, name",
            )?;
            let rows = stmt.query_map([], parse_series_row)?;
            collect_rows(rows)?
                .into_iter()
                .map(|row| load_series_info(conn, row))
                .collect()
        })
    }

    fn list_runs(&self) -> Result<Vec<StoredRun>, BenchError> {
        self.with_reader("failed to list runs", |conn| {
            let mut metrics: BTreeMap<i64, Vec<Metric>> = BTreeMap::new();
            let mut stmt = conn.prepare_cached(
                "SELECT e.run_seq, s.name, e.value, e.uncertainty, e.unit, e.polarity, e.extra
                 FROM series_entries e
                 JOIN series s ON s.series_id = e.series_id
                 ORDER BY e.run_seq ASC, e.metric_index ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                let run_seq: i64 = row.get(0)?;
                let polarity_raw: Option<String> = row.get(5)?;
                Ok((
                    run_seq,
                    Metric {
                        name: row.get(1)?,
                        value: row.get(2)?,
                        uncertainty: row.get(3)?,
                        unit: row.get(4)?,
                        polarity: polarity_raw
                            .as_deref()
                            .map(|raw| parse_polarity(5, raw))
                            .transpose()?,
                        extra: row.get(6)?,
                    },
                ))
            })?;
            for (run_seq, metric) in collect_rows(rows)? {
                metrics.entry(run_seq).or_default().push(metric);
            }

            let sql = format!(
                "SELECT r.run_seq, r.run_id, r.tool, r.suite, r.recorded_at, {COMMIT_COLUMNS}
                 FROM runs r
                 JOIN commits c ON c.sha = r.sha
                 ORDER BY r.recorded_at_ms ASC, r.run_seq ASC"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map([], |row| {
                let run_seq: i64 = row.get(0)?;
                let run_id = parse_ulid(1, &row.get::<_, String>(1)?)?;
                let recorded_at = parse_timestamp(4, &row.get::<_, String>(4)?)?;
                Ok((
                    run_seq,
                    run_id,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    recorded_at,
                    parse_commit_columns(row, 5)?,
                ))
            })?;

            let mut runs = Vec::new();
            for (run_seq, run_id, tool, suite, recorded_at, commit) in collect_rows(rows)? {
                let Some(run_metrics) = metrics.remove(&run_seq) else {
                    continue;
                };
                runs.push(StoredRun {
                    run_id,
                    run: BenchRun {
                        commit,
                        tool,
                        suite,
                        recorded_at,
                        metrics: run_metrics,
                    },
                });
            }
            Ok(runs)
        })
    }

    fn prune_before(&self, cutoff: OffsetDateTime) -> Result<PruneReport, BenchError> {
        let cutoff_ms = unix_millis(cutoff);
        let mut conn = self.writer()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .store_context("failed to start prune transaction")?;

        tx.execute(
            "INSERT INTO retention_lease(lease_id, acquired_at) VALUES (1, ?1)",
            params![format_rfc3339(now_utc())?],
        )
        .store_context("failed to acquire retention lease")?;
        let entries_removed = tx
            .execute(
                "DELETE FROM series_entries WHERE recorded_at_ms < ?1",
                params![cutoff_ms],
            )
            .store_context("failed to prune series entries")?;
        let runs_removed = tx
            .execute(
                "DELETE FROM runs
                 WHERE recorded_at_ms < ?1
                   AND NOT EXISTS (SELECT 1 FROM series_entries e WHERE e.run_seq = runs.run_seq)",
                params![cutoff_ms],
            )
            .store_context("failed to prune runs")?;
        let series_removed = tx
            .execute(
                "DELETE FROM series
                 WHERE NOT EXISTS (SELECT 1 FROM series_entries e WHERE e.series_id = series.series_id)",
                [],
            )
            .store_context("failed to prune empty series")?;
        tx.execute("DELETE FROM retention_lease", [])
            .store_context("failed to release retention lease")?;
        tx.commit().store_context("failed to commit prune transaction")?;

        info!(
            %cutoff,
            entries_removed,
            runs_removed,
            series_removed,
            "pruned benchmark history"
        );
        Ok(PruneReport {
            cutoff,
            entries_removed: u64::try_from(entries_removed).unwrap_or(u64::MAX),
            runs_removed: u64::try_from(runs_removed).unwrap_or(u64::MAX),
            series_removed: u64::try_from(series_removed).unwrap_or(u64::MAX),
        })
    }
}

trait StoreResultExt<T> {
    fn store_context(self, what: &str) -> Result<T, BenchError>;
}

impl<T> StoreResultExt<T> for rusqlite::Result<T> {
    fn store_context(self, what: &str) -> Result<T, BenchError> {
        self.map_err(|err| BenchError::StoreUnavailable(format!("{what}: {err}")))
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

fn find_series_id(conn: &Connection, key: &SeriesKey) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT series_id FROM series WHERE tool = ?1 AND name = ?2",
        params![key.tool, key.name],
        |row| row.get(0),
    )
    .optional()
}

fn ensure_series(
    conn: &Connection,
    key: &SeriesKey,
    metric: &Metric,
    created_at: &str,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO series(tool, name, unit, polarity_hint, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            key.tool,
            key.name,
            metric.unit,
            metric.polarity.map(Polarity::as_str),
            created_at
        ],
    )?;
    if let Some(polarity) = metric.polarity {
        conn.execute(
            "UPDATE series SET polarity_hint = ?3
             WHERE tool = ?1 AND name = ?2 AND polarity_hint IS NULL",
            params![key.tool, key.name, polarity.as_str()],
        )?;
    }
    conn.query_row(
        "SELECT series_id FROM series WHERE tool = ?1 AND name = ?2",
        params![key.tool, key.name],
        |row| row.get(0),
    )
}

fn insert_commit(conn: &Connection, commit: &Commit, committed_at: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO commits(
            sha, author_name, author_email, author_username,
            committer_name, committer_email, committer_username,
            message, committed_at, url, tree_id, distinct_flag
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            commit.sha.as_str(),
            commit.author.name,
            commit.author.email,
            commit.author.username,
            commit.committer.name,
            commit.committer.email,
            commit.committer.username,
            commit.message,
            committed_at,
            commit.url,
            commit.tree_id,
            commit.distinct.map(bool_to_sql),
        ],
    )?;
    Ok(())
}

fn load_commit(conn: &Connection, sha: &CommitSha) -> rusqlite::Result<Commit> {
    conn.query_row(
        &format!("SELECT {COMMIT_COLUMNS} FROM commits c WHERE c.sha = ?1"),
        params![sha.as_str()],
        |row| parse_commit_columns(row, 0),
    )
}

struct SeriesRow {
    series_id: i64,
    key: SeriesKey,
    unit: String,
    polarity_hint: Option<Polarity>,
}

fn parse_series_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SeriesRow> {
    let hint_raw: Option<String> = row.get(4)?;
    Ok(SeriesRow {
        series_id: row.get(0)?,
        key: SeriesKey {
            tool: row.get(1)?,
            name: row.get(2)?,
        },
        unit: row.get(3)?,
        polarity_hint: hint_raw
            .as_deref()
            .map(|raw| parse_polarity(4, raw))
            .transpose()?,
    })
}

fn load_series_info(conn: &Connection, row: SeriesRow) -> rusqlite::Result<SeriesInfo> {
    let (count, first_ms, first_seq, last_ms, last_seq): (
        i64,
        Option<i64>,
        Option<i64>,
        Option<i64>,
        Option<i64>,
    ) = conn.query_row(SERIES_STATS_QUERY, params![row.series_id], |stats| {
        Ok((
            stats.get(0)?,
            stats.get(1)?,
            stats.get(2)?,
            stats.get(3)?,
            stats.get(4)?,
        ))
    })?;
    let position = |ms: Option<i64>, seq: Option<i64>| {
        ms.zip(seq).map(|(recorded_at_ms, entry_seq)| EntryPosition {
            recorded_at_ms,
            entry_seq,
        })
    };
    Ok(SeriesInfo {
        key: row.key,
        unit: row.unit,
        polarity_hint: row.polarity_hint,
        entry_count: u64::try_from(count).unwrap_or_default(),
        first_entry: position(first_ms, first_seq),
        last_entry: position(last_ms, last_seq),
    })
}

fn parse_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SeriesEntry> {
    let run_id = parse_ulid(5, &row.get::<_, String>(5)?)?;
    let recorded_at = parse_timestamp(8, &row.get::<_, String>(8)?)?;
    Ok(SeriesEntry {
        position: EntryPosition {
            entry_seq: row.get(0)?,
            recorded_at_ms: row.get(1)?,
        },
        value: row.get(2)?,
        uncertainty: row.get(3)?,
        unit: row.get(4)?,
        run: RunRef {
            run_id,
            commit: parse_commit_columns(row, 9)?,
            tool: row.get(6)?,
            suite: row.get(7)?,
            recorded_at,
        },
    })
}

fn parse_commit_columns(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Commit> {
    let sha_raw: String = row.get(offset)?;
    let sha = CommitSha::parse(&sha_raw).map_err(|err| {
        conversion_error(offset, rusqlite::types::Type::Text, &err.to_string())
    })?;
    let timestamp = parse_timestamp(offset + 8, &row.get::<_, String>(offset + 8)?)?;
    let distinct: Option<i64> = row.get(offset + 11)?;
    Ok(Commit {
        sha,
        author: Person {
            name: row.get(offset + 1)?,
            email: row.get(offset + 2)?,
            username: row.get(offset + 3)?,
        },
        committer: Person {
            name: row.get(offset + 4)?,
            email: row.get(offset + 5)?,
            username: row.get(offset + 6)?,
        },
        message: row.get(offset + 7)?,
        timestamp,
        url: row.get(offset + 9)?,
        tree_id: row.get(offset + 10)?,
        distinct: distinct.map(|flag| flag != 0),
    })
}

fn parse_timestamp(column: usize, raw: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339(raw)
        .map_err(|err| conversion_error(column, rusqlite::types::Type::Text, &err.to_string()))
}

fn parse_ulid(column: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|err| {
        conversion_error(
            column,
            rusqlite::types::Type::Text,
            &format!("invalid run_id {raw:?}: {err}"),
        )
    })
}

fn parse_polarity(column: usize, raw: &str) -> rusqlite::Result<Polarity> {
    Polarity::parse(raw).ok_or_else(|| {
        conversion_error(
            column,
            rusqlite::types::Type::Text,
            &format!("invalid polarity: {raw}"),
        )
    })
}

fn conversion_error(column: usize, kind: rusqlite::types::Type, message: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        kind,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message.to_string(),
        )),
    )
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> rusqlite::Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
