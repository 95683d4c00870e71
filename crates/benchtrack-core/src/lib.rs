//! Typed model and pure logic for continuous benchmark history.
//!
//! Reports enter through [`report::parse_report`], are committed by a
//! [`store::HistoryStore`] implementation, and are judged by
//! [`detect::RegressionDetector`]. [`ingest::Ingestor`] wires the three together
//! and forwards confirmed regressions to an [`alert::AlertSink`].

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

pub mod alert;
pub mod detect;
pub mod document;
pub mod ingest;
pub mod memory;
pub mod query;
pub mod report;
pub mod store;

/// Separates tool and benchmark name in the textual form of a [`SeriesKey`].
pub const SERIES_KEY_SEPARATOR: char = ':';

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum BenchError {
    #[error("malformed report: {0}")]
    MalformedReport(String),
    #[error("duplicate entry: series {series} already records commit {sha}")]
    DuplicateEntry { series: SeriesKey, sha: CommitSha },
    #[error("out-of-order entry: series {series} tail recorded at {tail}, candidate recorded at {candidate}")]
    OutOfOrderEntry {
        series: SeriesKey,
        candidate: OffsetDateTime,
        tail: OffsetDateTime,
    },
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("history document error: {0}")]
    Document(String),
    #[error("alert delivery failed: {0}")]
    AlertDelivery(String),
}

impl BenchError {
    /// Stable machine-readable code used in CLI error envelopes.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedReport(_) => "malformed_report",
            Self::DuplicateEntry { .. } => "duplicate_entry",
            Self::OutOfOrderEntry { .. } => "out_of_order_entry",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Configuration(_) => "configuration",
            Self::Document(_) => "document",
            Self::AlertDelivery(_) => "alert_delivery",
        }
    }
}

/// Lowercase 40-character hexadecimal commit identifier.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct CommitSha(String);

impl CommitSha {
    /// Validates and normalizes a commit sha.
    ///
    /// # Errors
    /// Returns [`BenchError::MalformedReport`] unless `raw` is exactly 40
    /// hexadecimal characters.
    pub fn parse(raw: &str) -> Result<Self, BenchError> {
        let trimmed = raw.trim();
        if trimmed.len() != 40 || !trimmed.bytes().all(|byte| byte.is_ascii_hexdigit()) {
            return Err(BenchError::MalformedReport(format!(
                "commit sha MUST be 40 hex characters, got {trimmed:?}"
            )));
        }
        Ok(Self(trimmed.to_ascii_lowercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CommitSha {
    type Error = BenchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CommitSha> for String {
    fn from(value: CommitSha) -> Self {
        value.0
    }
}

impl Display for CommitSha {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a series: one benchmark metric under one tool.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SeriesKey {
    pub tool: String,
    pub name: String,
}

impl SeriesKey {
    /// Builds a key after checking both parts are usable as identifiers.
    ///
    /// # Errors
    /// Returns [`BenchError::MalformedReport`] when either part is empty or
    /// contains [`SERIES_KEY_SEPARATOR`].
    pub fn new(tool: &str, name: &str) -> Result<Self, BenchError> {
        validate_key_part("tool", tool)?;
        validate_key_part("metric name", name)?;
        Ok(Self {
            tool: tool.to_string(),
            name: name.to_string(),
        })
    }

    /// Parses the `tool:name` form produced by [`Display`].
    ///
    /// # Errors
    /// Returns [`BenchError::MalformedReport`] when the separator is missing or
    /// either part is invalid.
    pub fn parse(raw: &str) -> Result<Self, BenchError> {
        let Some((tool, name)) = raw.split_once(SERIES_KEY_SEPARATOR) else {
            return Err(BenchError::MalformedReport(format!(
                "series key must be in <tool>{SERIES_KEY_SEPARATOR}<name> format, got {raw:?}"
            )));
        };
        Self::new(tool, name)
    }
}

impl Display for SeriesKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.tool, SERIES_KEY_SEPARATOR, self.name)
    }
}

fn validate_key_part(label: &str, value: &str) -> Result<(), BenchError> {
    if value.trim().is_empty() {
        return Err(BenchError::MalformedReport(format!(
            "{label} MUST be non-empty"
        )));
    }
    if value.contains(SERIES_KEY_SEPARATOR) {
        return Err(BenchError::MalformedReport(format!(
            "{label} MUST NOT contain {SERIES_KEY_SEPARATOR:?}: {value:?}"
        )));
    }
    Ok(())
}

/// Which direction of change counts as a performance loss.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Durations, sizes, allocations.
    #[default]
    HigherIsWorse,
    /// Throughput and other rates.
    LowerIsWorse,
}

impl Polarity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HigherIsWorse => "higher_is_worse",
            Self::LowerIsWorse => "lower_is_worse",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "higher_is_worse" => Some(Self::HigherIsWorse),
            "lower_is_worse" => Some(Self::LowerIsWorse),
            _ => None,
        }
    }

    /// Maps the `biggerIsBetter` flag carried by dashboard history documents.
    #[must_use]
    pub fn from_bigger_is_better(bigger_is_better: bool) -> Self {
        if bigger_is_better {
            Self::LowerIsWorse
        } else {
            Self::HigherIsWorse
        }
    }

    #[must_use]
    pub fn bigger_is_better(self) -> bool {
        matches!(self, Self::LowerIsWorse)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Person {
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Commit {
    pub sha: CommitSha,
    pub author: Person,
    pub committer: Person,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distinct: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metric {
    pub name: String,
    pub value: f64,
    pub uncertainty: f64,
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polarity: Option<Polarity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

/// One accepted report: a commit plus its measured metrics, in report order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchRun {
    pub commit: Commit,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub metrics: Vec<Metric>,
}

impl BenchRun {
    #[must_use]
    pub fn series_key(&self, metric: &Metric) -> SeriesKey {
        SeriesKey {
            tool: self.tool.clone(),
            name: metric.name.clone(),
        }
    }

    /// Series touched by this run, in report order.
    #[must_use]
    pub fn series_keys(&self) -> Vec<SeriesKey> {
        self.metrics
            .iter()
            .map(|metric| self.series_key(metric))
            .collect()
    }

    /// Suite name used when grouping runs in a history document.
    #[must_use]
    pub fn suite_name(&self) -> &str {
        self.suite.as_deref().unwrap_or(&self.tool)
    }
}

/// Parses an RFC3339 timestamp, keeping its original offset.
///
/// # Errors
/// Returns [`BenchError::MalformedReport`] when parsing fails.
pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, BenchError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| BenchError::MalformedReport(format!("invalid RFC3339 timestamp {value:?}: {err}")))
}

/// Formats a timestamp as RFC3339 in its own offset.
///
/// # Errors
/// Returns [`BenchError::Document`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, BenchError> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| BenchError::Document(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Milliseconds since the Unix epoch; the ordering key of series entries.
#[must_use]
pub fn unix_millis(value: OffsetDateTime) -> i64 {
    value.unix_timestamp() * 1_000 + i64::from(value.millisecond())
}

/// Inverse of [`unix_millis`], producing a UTC timestamp.
///
/// # Errors
/// Returns [`BenchError::MalformedReport`] when `millis` is outside the
/// representable range.
pub fn from_unix_millis(millis: i64) -> Result<OffsetDateTime, BenchError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|err| BenchError::MalformedReport(format!("timestamp {millis} ms out of range: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
