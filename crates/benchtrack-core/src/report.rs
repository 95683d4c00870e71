//! Validating boundary between loosely typed CI payloads and [`BenchRun`].
//!
//! Harnesses disagree on field names and number encodings, so parsing walks a
//! [`serde_json::Value`] by hand and reports the first failing field path.
//! Parsing is all-or-nothing and never touches storage.

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::{
    from_unix_millis, parse_rfc3339, validate_key_part, BenchError, BenchRun, Commit, CommitSha,
    Metric, Person, Polarity,
};

/// Parses a JSON report document.
///
/// # Errors
/// Returns [`BenchError::MalformedReport`] when the text is not JSON or the
/// report fails validation.
pub fn parse_report_str(raw: &str) -> Result<BenchRun, BenchError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| BenchError::MalformedReport(format!("report is not valid JSON: {err}")))?;
    parse_report(&value)
}

/// Validates one report and converts it into a [`BenchRun`].
///
/// # Errors
/// Returns [`BenchError::MalformedReport`] naming the first field that fails
/// validation.
pub fn parse_report(value: &Value) -> Result<BenchRun, BenchError> {
    let root = as_object(value, "$")?;

    let commit = parse_commit(required(root, "commit", "$")?, "commit")?;
    let tool = required_str(root, "tool", "$")?;
    validate_key_part("tool", tool).map_err(|err| at("tool", &err))?;

    let suite = optional_str(root, "suite", "$")?
        .map(|raw| {
            if raw.trim().is_empty() {
                Err(malformed("suite", "MUST be non-empty when present"))
            } else {
                Ok(raw.to_string())
            }
        })
        .transpose()?;

    let recorded_at = parse_recorded_at(root, commit.timestamp)?;

    let benches_key = if root.contains_key("benches") {
        "benches"
    } else {
        "metrics"
    };
    let benches = required(root, benches_key, "$")?
        .as_array()
        .ok_or_else(|| malformed(benches_key, "MUST be an array"))?;
    if benches.is_empty() {
        return Err(malformed(benches_key, "at least one metric is required"));
    }

    let mut seen = BTreeSet::new();
    let mut metrics = Vec::with_capacity(benches.len());
    for (index, bench) in benches.iter().enumerate() {
        let path = format!("{benches_key}[{index}]");
        let metric = parse_metric(bench, &path, tool)?;
        if !seen.insert(metric.name.clone()) {
            return Err(malformed(
                &format!("{path}.name"),
                &format!("duplicate metric name {:?} in one report", metric.name),
            ));
        }
        metrics.push(metric);
    }

    Ok(BenchRun {
        commit,
        tool: tool.to_string(),
        suite,
        recorded_at,
        metrics,
    })
}

fn parse_commit(value: &Value, path: &str) -> Result<Commit, BenchError> {
    let object = as_object(value, path)?;

    let sha_key = if object.contains_key("id") { "id" } else { "sha" };
    let sha_raw = required_str(object, sha_key, path)?;
    let sha = CommitSha::parse(sha_raw).map_err(|err| at(&format!("{path}.{sha_key}"), &err))?;

    let author = parse_person(required(object, "author", path)?, &format!("{path}.author"))?;
    let committer = match object.get("committer") {
        Some(raw) if !raw.is_null() => parse_person(raw, &format!("{path}.committer"))?,
        _ => author.clone(),
    };

    let timestamp_raw = required_str(object, "timestamp", path)?;
    let timestamp =
        parse_rfc3339(timestamp_raw).map_err(|err| at(&format!("{path}.timestamp"), &err))?;

    let distinct = match object.get("distinct") {
        None | Some(Value::Null) => None,
        Some(Value::Bool(flag)) => Some(*flag),
        Some(_) => return Err(malformed(&format!("{path}.distinct"), "MUST be a boolean")),
    };

    Ok(Commit {
        sha,
        author,
        committer,
        message: optional_str(object, "message", path)?
            .unwrap_or_default()
            .to_string(),
        timestamp,
        url: optional_str(object, "url", path)?
            .unwrap_or_default()
            .to_string(),
        tree_id: optional_str(object, "tree_id", path)?.map(str::to_string),
        distinct,
    })
}

fn parse_person(value: &Value, path: &str) -> Result<Person, BenchError> {
    let object = as_object(value, path)?;
    let name = required_str(object, "name", path)?;
    Ok(Person {
        name: name.to_string(),
        email: optional_str(object, "email", path)?
            .unwrap_or_default()
            .to_string(),
        username: optional_str(object, "username", path)?.map(str::to_string),
    })
}

fn parse_recorded_at(
    root: &Map<String, Value>,
    commit_timestamp: OffsetDateTime,
) -> Result<OffsetDateTime, BenchError> {
    if let Some(date) = root.get("date").filter(|value| !value.is_null()) {
        let millis = date
            .as_i64()
            .ok_or_else(|| malformed("date", "MUST be integer milliseconds since the Unix epoch"))?;
        return from_unix_millis(millis).map_err(|err| at("date", &err));
    }

    if let Some(raw) = optional_str(root, "recorded_at", "$")? {
        return parse_rfc3339(raw).map_err(|err| at("recorded_at", &err));
    }

    Ok(commit_timestamp)
}

fn parse_metric(value: &Value, path: &str, run_tool: &str) -> Result<Metric, BenchError> {
    let object = as_object(value, path)?;

    let name = required_str(object, "name", path)?;
    validate_key_part("metric name", name).map_err(|err| at(&format!("{path}.name"), &err))?;

    if let Some(tool) = optional_str(object, "tool", path)? {
        if tool != run_tool {
            return Err(malformed(
                &format!("{path}.tool"),
                &format!("metric tool {tool:?} differs from report tool {run_tool:?}"),
            ));
        }
    }

    let value_path = format!("{path}.value");
    let measured = loose_number(required(object, "value", path)?, &value_path)?;
    if !measured.is_finite() {
        return Err(malformed(&value_path, "MUST be a finite number"));
    }

    let uncertainty = parse_uncertainty(object, path)?;

    let polarity = match object.get("biggerIsBetter") {
        None | Some(Value::Null) => None,
        Some(Value::Bool(flag)) => Some(Polarity::from_bigger_is_better(*flag)),
        Some(_) => {
            return Err(malformed(
                &format!("{path}.biggerIsBetter"),
                "MUST be a boolean",
            ))
        }
    };
    let polarity = match optional_str(object, "polarity", path)? {
        Some(raw) => Some(Polarity::parse(raw).ok_or_else(|| {
            malformed(
                &format!("{path}.polarity"),
                "MUST be higher_is_worse or lower_is_worse",
            )
        })?),
        None => polarity,
    };

    Ok(Metric {
        name: name.to_string(),
        value: measured,
        uncertainty,
        unit: optional_str(object, "unit", path)?
            .unwrap_or_default()
            .to_string(),
        polarity,
        extra: optional_str(object, "extra", path)?.map(str::to_string),
    })
}

fn parse_uncertainty(object: &Map<String, Value>, path: &str) -> Result<f64, BenchError> {
    let (field, parsed) = match (object.get("uncertainty"), object.get("range")) {
        (Some(raw), _) if !raw.is_null() => {
            let field = format!("{path}.uncertainty");
            let parsed = loose_number(raw, &field)?;
            (field, parsed)
        }
        (_, Some(Value::String(raw))) => {
            let field = format!("{path}.range");
            let parsed = parse_range(raw).ok_or_else(|| {
                malformed(&field, &format!("unrecognized range {raw:?}, expected \"± N\""))
            })?;
            (field, parsed)
        }
        (_, Some(raw)) if !raw.is_null() => {
            let field = format!("{path}.range");
            let parsed = loose_number(raw, &field)?;
            (field, parsed)
        }
        _ => return Ok(0.0),
    };

    if !parsed.is_finite() || parsed < 0.0 {
        return Err(malformed(&field, "MUST be a finite number >= 0"));
    }
    Ok(parsed)
}

/// Parses the textual error band used by benchmark harnesses: `"± 23"`,
/// `"+/- 23"` or a bare number.
#[must_use]
pub fn parse_range(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix('±')
        .or_else(|| trimmed.strip_prefix("+/-"))
        .unwrap_or(trimmed);
    parse_number_text(body)
}

/// Renders an uncertainty the way [`parse_range`] reads it back.
#[must_use]
pub fn format_range(uncertainty: f64) -> String {
    format!("± {uncertainty}")
}

fn loose_number(value: &Value, path: &str) -> Result<f64, BenchError> {
    match value {
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| malformed(path, "MUST be representable as f64")),
        Value::String(raw) => {
            parse_number_text(raw).ok_or_else(|| malformed(path, &format!("not a number: {raw:?}")))
        }
        _ => Err(malformed(path, "MUST be a number")),
    }
}

fn parse_number_text(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|ch| *ch != ',' && *ch != '_')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

fn as_object<'a>(value: &'a Value, path: &str) -> Result<&'a Map<String, Value>, BenchError> {
    value
        .as_object()
        .ok_or_else(|| malformed(path, "MUST be a JSON object"))
}

fn required<'a>(
    object: &'a Map<String, Value>,
    key: &str,
    parent: &str,
) -> Result<&'a Value, BenchError> {
    match object.get(key) {
        Some(value) if !value.is_null() => Ok(value),
        _ => Err(malformed(&join_path(parent, key), "is required")),
    }
}

fn required_str<'a>(
    object: &'a Map<String, Value>,
    key: &str,
    parent: &str,
) -> Result<&'a str, BenchError> {
    required(object, key, parent)?
        .as_str()
        .ok_or_else(|| malformed(&join_path(parent, key), "MUST be a string"))
}

fn optional_str<'a>(
    object: &'a Map<String, Value>,
    key: &str,
    parent: &str,
) -> Result<Option<&'a str>, BenchError> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => Ok(Some(raw.as_str())),
        Some(_) => Err(malformed(&join_path(parent, key), "MUST be a string")),
    }
}

fn join_path(parent: &str, key: &str) -> String {
    if parent == "$" {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn malformed(path: &str, reason: &str) -> BenchError {
    BenchError::MalformedReport(format!("{path}: {reason}"))
}

fn at(path: &str, err: &BenchError) -> BenchError {
    match err {
        BenchError::MalformedReport(reason) => malformed(path, reason),
        other => malformed(path, &other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_malformed(result: Result<BenchRun, BenchError>) -> String {
        match result {
            Err(BenchError::MalformedReport(reason)) => reason,
            Err(other) => panic!("expected MalformedReport, got {other}"),
            Ok(run) => panic!("expected MalformedReport, got run for {}", run.commit.sha),
        }
    }

    fn fixture_report() -> Value {
        json!({
            "commit": {
                "author": {"email": "dev@example.com", "name": "Dev One", "username": "devone"},
                "committer": {"email": "noreply@github.com", "name": "GitHub", "username": "web-flow"},
                "distinct": true,
                "id": "6fddde66b8f481ae480d988f9664773f1de8d80e",
                "message": "Hotfix github workflow",
                "timestamp": "2020-10-13T13:51:51-07:00",
                "tree_id": "66b95d6457876f8388c27c053225371a3e838a30",
                "url": "https://example.com/commit/6fddde66b8f481ae480d988f9664773f1de8d80e"
            },
            "date": 1_602_622_547_047_i64,
            "tool": "cargo",
            "benches": [
                {"name": "langid/overview", "value": 5658, "range": "± 2", "unit": "ns/iter"},
                {"name": "locale/overview", "value": "12,004", "range": "+/- 31", "unit": "ns/iter"}
            ]
        })
    }

    #[test]
    fn parses_dashboard_style_report() {
        let run = must_ok(parse_report(&fixture_report()));
        assert_eq!(run.tool, "cargo");
        assert_eq!(run.commit.sha.as_str(), "6fddde66b8f481ae480d988f9664773f1de8d80e");
        assert_eq!(run.commit.committer.username.as_deref(), Some("web-flow"));
        assert_eq!(crate::unix_millis(run.recorded_at), 1_602_622_547_047);
        assert_eq!(run.metrics.len(), 2);
        assert_eq!(run.metrics[0].name, "langid/overview");
        assert!((run.metrics[0].uncertainty - 2.0).abs() < f64::EPSILON);
        assert!((run.metrics[1].value - 12_004.0).abs() < f64::EPSILON);
        assert!((run.metrics[1].uncertainty - 31.0).abs() < f64::EPSILON);
    }

    #[test]
    fn recorded_at_defaults_to_commit_timestamp() {
        let mut report = fixture_report();
        report["date"] = Value::Null;
        let run = must_ok(parse_report(&report));
        assert_eq!(run.recorded_at, run.commit.timestamp);
    }

    #[test]
    fn missing_range_means_zero_uncertainty() {
        let mut report = fixture_report();
        report["benches"] = json!([{"name": "derive+opt", "value": 9386, "unit": "bytes", "biggerIsBetter": false}]);
        let run = must_ok(parse_report(&report));
        assert!(run.metrics[0].uncertainty.abs() < f64::EPSILON);
        assert_eq!(run.metrics[0].polarity, Some(Polarity::HigherIsWorse));
    }

    #[test]
    fn rejects_invalid_sha() {
        let mut report = fixture_report();
        report["commit"]["id"] = json!("not-a-sha");
        let reason = must_malformed(parse_report(&report));
        assert!(reason.starts_with("commit.id:"), "{reason}");
    }

    #[test]
    fn rejects_empty_metric_list() {
        let mut report = fixture_report();
        report["benches"] = json!([]);
        let reason = must_malformed(parse_report(&report));
        assert!(reason.contains("at least one metric"), "{reason}");
    }

    #[test]
    fn rejects_non_finite_values_in_text_form() {
        for raw in ["NaN", "inf", "-infinity"] {
            let mut report = fixture_report();
            report["benches"][1]["value"] = json!(raw);
            let reason = must_malformed(parse_report(&report));
            assert!(reason.starts_with("benches[1].value:"), "{reason}");
        }
    }

    #[test]
    fn rejects_negative_uncertainty() {
        let mut report = fixture_report();
        report["benches"][0]["range"] = Value::Null;
        report["benches"][0]["uncertainty"] = json!(-1.0);
        let reason = must_malformed(parse_report(&report));
        assert!(reason.starts_with("benches[0].uncertainty:"), "{reason}");
    }

    #[test]
    fn rejects_separator_in_metric_name() {
        let mut report = fixture_report();
        report["benches"][0]["name"] = json!("langid:overview");
        let reason = must_malformed(parse_report(&report));
        assert!(reason.starts_with("benches[0].name:"), "{reason}");
    }

    #[test]
    fn rejects_duplicate_metric_names() {
        let mut report = fixture_report();
        report["benches"][1]["name"] = json!("langid/overview");
        let reason = must_malformed(parse_report(&report));
        assert!(reason.contains("duplicate metric name"), "{reason}");
    }

    #[test]
    fn first_failure_is_reported() {
        let mut report = fixture_report();
        report["benches"][0]["value"] = json!("oops");
        report["benches"][1]["name"] = json!("");
        let reason = must_malformed(parse_report(&report));
        assert!(reason.starts_with("benches[0].value:"), "{reason}");
    }

    #[test]
    fn metric_tool_must_match_report_tool() {
        let mut report = fixture_report();
        report["benches"][0]["tool"] = json!("google-benchmark");
        let reason = must_malformed(parse_report(&report));
        assert!(reason.starts_with("benches[0].tool:"), "{reason}");
    }

    #[test]
    fn metrics_alias_and_sha_alias_are_accepted() {
        let report = json!({
            "commit": {
                "sha": "28674c5a4a27ffba89ef4f195bdc5c4d64df4c98",
                "author": {"name": "Dev One"},
                "timestamp": "2020-10-13T14:05:47-07:00"
            },
            "recorded_at": "2020-10-13T21:16:11Z",
            "tool": "google-benchmark",
            "metrics": [{"name": "BM_parse", "value": 1.5, "uncertainty": 0.25, "unit": "us", "polarity": "higher_is_worse"}]
        });
        let run = must_ok(parse_report(&report));
        assert_eq!(run.commit.committer, run.commit.author);
        assert_eq!(run.tool, "google-benchmark");
        assert!((run.metrics[0].uncertainty - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn range_text_round_trips() {
        assert_eq!(parse_range("± 23"), Some(23.0));
        assert_eq!(parse_range("+/- 1.5"), Some(1.5));
        assert_eq!(parse_range("7"), Some(7.0));
        assert_eq!(parse_range("about 7"), None);
        assert_eq!(parse_range(&format_range(133.0)), Some(133.0));
        assert_eq!(format_range(2.0), "± 2");
    }
}
