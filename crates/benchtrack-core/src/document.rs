//! Dashboard history document (`data.js`) export and import.
//!
//! The document groups runs by suite:
//! `{"lastUpdate": ms, "repoUrl": "...", "entries": {"<suite>": [run, ...]}}`,
//! optionally prefixed with `window.BENCHMARK_DATA = ` for static dashboards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::report::{format_range, parse_report};
use crate::store::HistoryStore;
use crate::{format_rfc3339, unix_millis, BenchError, BenchRun, Person};

pub const DATA_JS_PREFIX: &str = "window.BENCHMARK_DATA = ";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkDocument {
    pub last_update: i64,
    #[serde(default)]
    pub repo_url: String,
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<Value>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub runs: usize,
    pub inserted: usize,
    pub duplicates: usize,
}

#[derive(Serialize)]
struct DocPerson<'a> {
    email: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
}

impl<'a> From<&'a Person> for DocPerson<'a> {
    fn from(person: &'a Person) -> Self {
        Self {
            email: &person.email,
            name: &person.name,
            username: person.username.as_deref(),
        }
    }
}

#[derive(Serialize)]
struct DocCommit<'a> {
    author: DocPerson<'a>,
    committer: DocPerson<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    distinct: Option<bool>,
    id: &'a str,
    message: &'a str,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tree_id: Option<&'a str>,
    url: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocBench<'a> {
    name: &'a str,
    value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    range: Option<String>,
    unit: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    bigger_is_better: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    extra: Option<&'a str>,
}

#[derive(Serialize)]
struct DocRun<'a> {
    commit: DocCommit<'a>,
    date: i64,
    tool: &'a str,
    benches: Vec<DocBench<'a>>,
}

impl BenchmarkDocument {
    /// Parses either the bare JSON document or its `data.js` form.
    ///
    /// # Errors
    /// Returns [`BenchError::Document`] when the text is not a history document.
    pub fn parse(raw: &str) -> Result<Self, BenchError> {
        let trimmed = raw.trim();
        let body = trimmed
            .strip_prefix(DATA_JS_PREFIX.trim_end())
            .map_or(trimmed, |rest| rest.trim_start().trim_end_matches(';').trim_end());
        serde_json::from_str(body)
            .map_err(|err| BenchError::Document(format!("invalid history document: {err}")))
    }

    /// # Errors
    /// Returns [`BenchError::Document`] when serialization fails.
    pub fn to_json_pretty(&self) -> Result<String, BenchError> {
        serde_json::to_string_pretty(self)
            .map_err(|err| BenchError::Document(format!("failed to encode history document: {err}")))
    }

    /// # Errors
    /// Returns [`BenchError::Document`] when serialization fails.
    pub fn to_data_js(&self) -> Result<String, BenchError> {
        Ok(format!("{DATA_JS_PREFIX}{}\n", self.to_json_pretty()?))
    }

    #[must_use]
    pub fn run_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

/// Builds the history document from every stored run.
///
/// Suites are sorted by name, runs keep store order and benches keep report
/// order, so equal histories always export to identical text.
///
/// # Errors
/// Returns [`BenchError::StoreUnavailable`] when the store cannot be read and
/// [`BenchError::Document`] when a run cannot be encoded.
pub fn export_document(
    store: &dyn HistoryStore,
    repo_url: &str,
) -> Result<BenchmarkDocument, BenchError> {
    let runs = store.list_runs()?;
    let mut entries: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    let mut last_update = 0_i64;
    for stored in &runs {
        let date = unix_millis(stored.run.recorded_at);
        last_update = last_update.max(date);
        entries
            .entry(stored.run.suite_name().to_string())
            .or_default()
            .push(encode_run(&stored.run)?);
    }
    Ok(BenchmarkDocument {
        last_update,
        repo_url: repo_url.to_string(),
        entries,
    })
}

/// Validates every run in the document, then commits them through the
/// backfill path in document order. Already-recorded entries are skipped.
///
/// # Errors
/// Returns [`BenchError::Document`] naming the first invalid run before
/// anything is written, or the store's error for a failed commit.
pub fn import_document(
    store: &dyn HistoryStore,
    document: &BenchmarkDocument,
) -> Result<ImportSummary, BenchError> {
    let mut runs = Vec::with_capacity(document.run_count());
    for (suite, items) in &document.entries {
        for (index, item) in items.iter().enumerate() {
            let mut run = parse_report(item).map_err(|err| {
                BenchError::Document(format!("entries[{suite:?}][{index}]: {err}"))
            })?;
            run.suite = Some(suite.clone());
            runs.push(run);
        }
    }

    let mut summary = ImportSummary::default();
    for run in &runs {
        let outcome = store.backfill(run)?;
        summary.runs += 1;
        summary.inserted += outcome.inserted_count();
        summary.duplicates += outcome.duplicate_count();
    }
    tracing::info!(
        runs = summary.runs,
        inserted = summary.inserted,
        duplicates = summary.duplicates,
        "imported history document"
    );
    Ok(summary)
}

fn encode_run(run: &BenchRun) -> Result<Value, BenchError> {
    let doc = DocRun {
        commit: DocCommit {
            author: (&run.commit.author).into(),
            committer: (&run.commit.committer).into(),
            distinct: run.commit.distinct,
            id: run.commit.sha.as_str(),
            message: &run.commit.message,
            timestamp: format_rfc3339(run.commit.timestamp)?,
            tree_id: run.commit.tree_id.as_deref(),
            url: &run.commit.url,
        },
        date: unix_millis(run.recorded_at),
        tool: &run.tool,
        benches: run
            .metrics
            .iter()
            .map(|metric| DocBench {
                name: &metric.name,
                value: json_number(metric.value),
                range: (metric.uncertainty > 0.0).then(|| format_range(metric.uncertainty)),
                unit: &metric.unit,
                bigger_is_better: metric.polarity.map(crate::Polarity::bigger_is_better),
                extra: metric.extra.as_deref(),
            })
            .collect(),
    };
    serde_json::to_value(doc)
        .map_err(|err| BenchError::Document(format!("failed to encode run {}: {err}", run.commit.sha)))
}

/// Whole numbers are written without a fractional part, matching harness
/// output.
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn json_number(value: f64) -> Value {
    const EXACT_INTEGER_LIMIT: f64 = 9_007_199_254_740_992.0;
    if value.fract() == 0.0 && value.abs() < EXACT_INTEGER_LIMIT {
        return Value::Number(Number::from(value as i64));
    }
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}
