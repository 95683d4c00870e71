//! `bt`: command surface over a benchmark history database.
//!
//! Every command prints exactly one JSON document on stdout. Logs go to
//! stderr, and failures print an error envelope (`{"code", "message"}`) there.
//! Hosts that embed the tool call [`run_cli`] with a parsed [`Cli`], or
//! [`run_command`] against a store they already opened.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use benchtrack_core::alert::{
    AlertSink, JsonLinesAlertSink, QueuedAlertSink, TracingAlertSink, DEFAULT_QUEUE_CAPACITY,
};
use benchtrack_core::detect::{DetectorPolicy, RegressionDetector};
use benchtrack_core::document::{export_document, import_document, BenchmarkDocument};
use benchtrack_core::ingest::Ingestor;
use benchtrack_core::query::QueryEngine;
use benchtrack_core::report::parse_report_str;
use benchtrack_core::store::{AppendMode, DuplicatePolicy, HistoryStore, StoreOptions};
use benchtrack_core::{parse_rfc3339, BenchError, SeriesKey};
use benchtrack_store_sqlite::SqliteHistoryStore;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bt")]
#[command(about = "Benchmark history and regression detection")]
pub struct Cli {
    #[arg(long, global = true, default_value = "./benchtrack.sqlite3")]
    db: PathBuf,

    /// Detector policy JSON file.
    #[arg(long, global = true)]
    policy: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Append one report and evaluate every new entry.
    Ingest(IngestArgs),
    Series {
        #[command(subcommand)]
        command: SeriesCommand,
    },
    /// Newest entry of a series.
    Latest(SeriesArgs),
    /// Re-evaluate the newest entry of a series without writing.
    Evaluate(SeriesArgs),
    /// Write the whole history as a benchmark data document.
    Export(ExportArgs),
    /// Backfill every run of a benchmark data document.
    Import(ImportArgs),
    /// Drop entries recorded before a cutoff.
    Prune(PruneArgs),
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Report file, or `-` for stdin.
    #[arg(long)]
    report: String,
    /// Accept the run anywhere in history and skip detection.
    #[arg(long)]
    backfill: bool,
    #[arg(long)]
    reject_duplicates: bool,
    #[arg(long)]
    fail_on_regression: bool,
    /// Append each regression alert to this JSON-lines file.
    #[arg(long)]
    alert_log: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum SeriesCommand {
    List(SeriesListArgs),
    Show(SeriesShowArgs),
}

#[derive(Debug, Args)]
pub struct SeriesListArgs {
    #[arg(long)]
    tool: String,
}

#[derive(Debug, Args)]
pub struct SeriesShowArgs {
    /// `tool:name`
    #[arg(long)]
    series: String,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    /// Only the newest N entries; ignores `--from`/`--to`.
    #[arg(long, conflicts_with_all = ["from", "to"])]
    last: Option<usize>,
}

#[derive(Debug, Args)]
pub struct SeriesArgs {
    /// `tool:name`
    #[arg(long)]
    series: String,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long, default_value = "")]
    repo_url: String,
    /// Write the `window.BENCHMARK_DATA = ...` script form.
    #[arg(long, requires = "output")]
    js: bool,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    #[arg(long)]
    input: PathBuf,
}

#[derive(Debug, Args)]
pub struct PruneArgs {
    /// RFC 3339 cutoff; entries recorded strictly before it are removed.
    #[arg(long)]
    before: String,
}

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    /// Validate the file given with `--policy`.
    Check,
}

/// Raised after output is printed when `--fail-on-regression` is set.
#[derive(Debug, thiserror::Error)]
#[error("regression detected in {count} series")]
pub struct RegressionDetected {
    pub count: usize,
}

/// Executes a parsed command line.
///
/// # Errors
/// Returns an error when logging, policy loading, store access or the
/// command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_level, cli.log_json)?;

    if let Command::Policy {
        command: PolicyCommand::Check,
    } = &cli.command
    {
        let path = cli
            .policy
            .as_deref()
            .ok_or_else(|| anyhow!("policy check requires --policy FILE"))?;
        let policy = load_policy(Some(path))?;
        return print_json(&json!({
            "contract_version": "policy_check.v1",
            "policy": path.display().to_string(),
            "valid": true,
            "default": policy.default,
            "overrides": policy.series.keys().collect::<Vec<_>>(),
        }));
    }

    let policy = load_policy(cli.policy.as_deref())?;
    let options = StoreOptions {
        duplicate_policy: match &cli.command {
            Command::Ingest(args) if args.reject_duplicates => DuplicatePolicy::Reject,
            _ => DuplicatePolicy::Ignore,
        },
        ..StoreOptions::default()
    };
    let store = open_store(&cli.db, options)?;
    run_command(cli.command, &store, &RegressionDetector::new(policy))
}

/// Executes a command against an already-open store.
///
/// # Errors
/// Returns an error when input cannot be read, the store rejects the
/// operation, or `--fail-on-regression` trips.
pub fn run_command(
    command: Command,
    store: &dyn HistoryStore,
    detector: &RegressionDetector,
) -> Result<()> {
    match command {
        Command::Ingest(args) => run_ingest(&args, store, detector),
        Command::Series {
            command: SeriesCommand::List(args),
        } => {
            let names = QueryEngine::new(store).list_series(&args.tool)?;
            print_json(&json!({
                "contract_version": "series_list.v1",
                "tool": args.tool,
                "series": names,
            }))
        }
        Command::Series {
            command: SeriesCommand::Show(args),
        } => {
            let key = SeriesKey::parse(&args.series)?;
            let engine = QueryEngine::new(store);
            let entries = match args.last {
                Some(count) => engine.last(&key, count)?,
                None => engine
                    .range(
                        &key,
                        parse_optional_time(args.from.as_deref())?,
                        parse_optional_time(args.to.as_deref())?,
                    )?
                    .collect::<Result<Vec<_>, BenchError>>()?,
            };
            print_json(&json!({
                "contract_version": "series_history.v1",
                "series": key.to_string(),
                "info": engine.series_info(&key)?,
                "entries": entries,
            }))
        }
        Command::Latest(args) => {
            let key = SeriesKey::parse(&args.series)?;
            let entry = QueryEngine::new(store).latest(&key)?;
            print_json(&json!({
                "contract_version": "series_latest.v1",
                "series": key.to_string(),
                "entry": entry,
            }))
        }
        Command::Evaluate(args) => {
            let key = SeriesKey::parse(&args.series)?;
            let (entry, evaluation) = match detector.evaluate_latest(store, &key)? {
                Some((entry, evaluation)) => (Some(entry), Some(evaluation)),
                None => (None, None),
            };
            print_json(&json!({
                "contract_version": "evaluation.v1",
                "series": key.to_string(),
                "entry": entry,
                "evaluation": evaluation,
            }))
        }
        Command::Export(args) => run_export(&args, store),
        Command::Import(args) => {
            let raw = std::fs::read_to_string(&args.input)
                .with_context(|| format!("failed to read {}", args.input.display()))?;
            let document = BenchmarkDocument::parse(&raw)?;
            let summary = import_document(store, &document)?;
            print_json(&json!({
                "contract_version": "import_result.v1",
                "input": args.input.display().to_string(),
                "runs": summary.runs,
                "inserted": summary.inserted,
                "duplicates": summary.duplicates,
            }))
        }
        Command::Prune(args) => {
            let cutoff = parse_rfc3339(&args.before)?;
            let report = store.prune_before(cutoff)?;
            print_json(&json!({
                "contract_version": "prune_result.v1",
                "cutoff": args.before,
                "entries_removed": report.entries_removed,
                "runs_removed": report.runs_removed,
                "series_removed": report.series_removed,
            }))
        }
        Command::Policy {
            command: PolicyCommand::Check,
        } => print_json(&json!({
            "contract_version": "policy_check.v1",
            "valid": true,
            "default": detector.policy().default,
            "overrides": detector.policy().series.keys().collect::<Vec<_>>(),
        })),
    }
}

fn run_ingest(
    args: &IngestArgs,
    store: &dyn HistoryStore,
    detector: &RegressionDetector,
) -> Result<()> {
    let raw = read_report(&args.report)?;
    let run = parse_report_str(&raw)?;
    let mode = if args.backfill {
        AppendMode::Backfill
    } else {
        AppendMode::Live
    };

    let tracing_sink = TracingAlertSink;
    let alert_log = match &args.alert_log {
        Some(path) => {
            let sink = JsonLinesAlertSink::open(path)?;
            Some(QueuedAlertSink::spawn(Box::new(sink), DEFAULT_QUEUE_CAPACITY)?)
        }
        None => None,
    };
    let mut ingestor = Ingestor::new(store, detector).with_sink(&tracing_sink);
    if let Some(sink) = &alert_log {
        ingestor = ingestor.with_sink(sink as &dyn AlertSink);
    }

    let report = ingestor.ingest_run(&run, mode)?;
    if let Some(sink) = &alert_log {
        sink.shutdown();
    }

    let regressions = report.regressions().count();
    print_json(&json!({
        "contract_version": "ingest_result.v1",
        "commit": run.commit.sha,
        "tool": run.tool,
        "backfill": args.backfill,
        "run_id": report.outcome.run_id,
        "series": report.outcome.series,
        "evaluations": report.evaluations,
        "regressions": regressions,
        "alerts_delivered": report.alerts_delivered,
        "alert_failures": report.alert_failures,
    }))?;

    if args.fail_on_regression && regressions > 0 {
        return Err(RegressionDetected { count: regressions }.into());
    }
    Ok(())
}

fn run_export(args: &ExportArgs, store: &dyn HistoryStore) -> Result<()> {
    let document = export_document(store, &args.repo_url)?;
    let Some(output) = &args.output else {
        return print_json(&serde_json::to_value(&document)?);
    };

    let body = if args.js {
        document.to_data_js()?
    } else {
        let mut text = document.to_json_pretty()?;
        text.push('\n');
        text
    };
    std::fs::write(output, body)
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!(output = %output.display(), runs = document.run_count(), "exported history");
    print_json(&json!({
        "contract_version": "export_result.v1",
        "output": output.display().to_string(),
        "format": if args.js { "data.js" } else { "json" },
        "runs": document.run_count(),
        "last_update": document.last_update,
    }))
}

/// Renders an error as the `{"code", "message"}` envelope printed on stderr.
#[must_use]
pub fn error_envelope(err: &anyhow::Error) -> String {
    let code = if let Some(bench) = err.chain().find_map(|cause| cause.downcast_ref::<BenchError>()) {
        bench.code()
    } else if err.downcast_ref::<RegressionDetected>().is_some() {
        "regression_detected"
    } else {
        "cli_error"
    };
    json!({
        "code": code,
        "message": format!("{err:#}"),
    })
    .to_string()
}

fn init_tracing(level: &str, json_output: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid --log-level filter {level:?}"))?,
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    // A second init in the same process keeps the first subscriber.
    let _ = if json_output {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    Ok(())
}

fn open_store(db: &Path, options: StoreOptions) -> Result<SqliteHistoryStore> {
    let store = SqliteHistoryStore::open_with_options(db, options)?;
    store.migrate()?;
    Ok(store)
}

fn load_policy(path: Option<&Path>) -> Result<DetectorPolicy> {
    let Some(path) = path else {
        return Ok(DetectorPolicy::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy {}", path.display()))?;
    DetectorPolicy::from_json(&raw)
        .with_context(|| format!("invalid policy {}", path.display()))
}

fn read_report(source: &str) -> Result<String> {
    if source == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("failed to read report from stdin")?;
        return Ok(raw);
    }
    std::fs::read_to_string(source).with_context(|| format!("failed to read report {source}"))
}

fn parse_optional_time(raw: Option<&str>) -> Result<Option<OffsetDateTime>> {
    raw.map(|value| parse_rfc3339(value).map_err(anyhow::Error::from))
        .transpose()
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
