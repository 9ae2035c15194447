use std::collections::{BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde_json::{Value, json};

use crate::config::RuntimeConfig;
use crate::events::{self, EventSink};

pub fn unix_ms_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Appends pipeline events to a JSONL file, one record per line.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    pub enabled: bool,
    pub path: PathBuf,
    pub run_id: String,
    pub command: String,
    pub file_lock: Arc<std::sync::Mutex<()>>,
}

impl TelemetrySink {
    pub fn new(cfg: &RuntimeConfig, command: String) -> Self {
        let run_id = format!("run-{}-{}", unix_ms_now(), std::process::id());
        Self {
            enabled: cfg.telemetry_enabled,
            path: PathBuf::from(&cfg.telemetry_path),
            run_id,
            command,
            file_lock: Arc::new(std::sync::Mutex::new(())),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Record one event; write failures are logged, not returned.
    pub fn record(&self, event: &str, payload: &Value) {
        if let Err(err) = self.emit(event, payload) {
            tracing::warn!(
                event = event,
                path = %self.path.display(),
                error = %err,
                "telemetry write failed"
            );
        }
    }

    fn append_event_line(&self, value: &Value) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create telemetry directory '{}'",
                    parent.display()
                )
            })?;
        }

        let _guard = self.file_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open telemetry path '{}'", self.path.display()))?;

        serde_json::to_writer(&mut file, value).with_context(|| {
            format!("failed to serialize telemetry event for '{}'", self.command)
        })?;
        writeln!(file).context("failed to write telemetry newline")
    }
}

impl EventSink for TelemetrySink {
    fn emit(&self, event: &str, data: &Value) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let mut record = serde_json::Map::new();
        record.insert("ts_unix_ms".to_string(), json!(unix_ms_now()));
        record.insert("event".to_string(), json!(event));
        record.insert("run_id".to_string(), json!(self.run_id));
        record.insert("command".to_string(), json!(self.command));

        if let Some(map) = data.as_object() {
            for (key, value) in map {
                record.insert(key.clone(), value.clone());
            }
        }

        self.append_event_line(&Value::Object(record))
    }
}

#[derive(Debug, Default)]
pub struct TelemetrySummary {
    pub total_lines: usize,
    pub parsed_events: usize,
    pub parse_errors: usize,
    pub unique_runs: BTreeSet<String>,
    pub command_counts: HashMap<String, usize>,
    pub loops_completed: usize,
    pub loops_passed: usize,
    pub iterations_completed: usize,
    pub iteration_timeouts: usize,
    pub invalid_results: usize,
    pub approvals_requested: usize,
    pub best_score: Option<f64>,
    pub last_event_ts_unix_ms: Option<u128>,
}

impl TelemetrySummary {
    pub fn mean_iterations_per_loop(&self) -> Option<f64> {
        (self.loops_completed > 0)
            .then(|| self.iterations_completed as f64 / self.loops_completed as f64)
    }
}

pub fn summarize_telemetry_lines(lines: Vec<String>, limit: usize) -> TelemetrySummary {
    let mut summary = TelemetrySummary::default();
    let max_events = limit.max(1);
    summary.total_lines = lines.len();

    for line in lines.into_iter().rev().take(max_events) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parsed = match serde_json::from_str::<Value>(line) {
            Ok(value) => value,
            Err(_) => {
                summary.parse_errors += 1;
                continue;
            }
        };

        summary.parsed_events += 1;

        if let Some(run_id) = parsed.get("run_id").and_then(Value::as_str)
            && !run_id.is_empty()
        {
            summary.unique_runs.insert(run_id.to_string());
        }

        if let Some(command) = parsed.get("command").and_then(Value::as_str)
            && !command.is_empty()
        {
            *summary
                .command_counts
                .entry(command.to_string())
                .or_insert(0) += 1;
        }

        if let Some(ts) = parsed.get("ts_unix_ms").and_then(Value::as_u64) {
            let ts_u128 = ts as u128;
            summary.last_event_ts_unix_ms = Some(
                summary
                    .last_event_ts_unix_ms
                    .map(|existing| existing.max(ts_u128))
                    .unwrap_or(ts_u128),
            );
        }

        match parsed
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default()
        {
            events::ITERATION_COMPLETE => summary.iterations_completed += 1,
            events::ITERATION_TIMEOUT => summary.iteration_timeouts += 1,
            events::INVALID_GRAPH_RESULT => summary.invalid_results += 1,
            events::HUMAN_APPROVAL_REQUESTED => summary.approvals_requested += 1,
            events::LOOP_COMPLETE => {
                summary.loops_completed += 1;
                if parsed.get("passed").and_then(Value::as_bool) == Some(true) {
                    summary.loops_passed += 1;
                }
                if let Some(score) = parsed.get("best_score").and_then(Value::as_f64) {
                    summary.best_score = Some(summary.best_score.map_or(score, |s| s.max(score)));
                }
            }
            _ => {}
        }
    }

    summary
}

pub fn run_telemetry_report(
    cfg: &RuntimeConfig,
    path_override: Option<String>,
    limit: usize,
) -> Result<()> {
    let path = PathBuf::from(path_override.unwrap_or_else(|| cfg.telemetry_path.clone()));
    if !path.exists() {
        println!("No telemetry file found at '{}'.", path.display());
        return Ok(());
    }

    let file = std::fs::File::open(&path)
        .with_context(|| format!("failed to open telemetry file '{}'", path.display()))?;
    let reader = io::BufReader::new(file);
    let lines = reader
        .lines()
        .collect::<std::result::Result<Vec<String>, std::io::Error>>()
        .with_context(|| format!("failed to read telemetry file '{}'", path.display()))?;

    let summary = summarize_telemetry_lines(lines, limit);
    let mut commands = summary.command_counts.iter().collect::<Vec<_>>();
    commands.sort_by_key(|(name, count)| (std::cmp::Reverse(**count), (*name).clone()));

    println!("Telemetry report");
    println!("Path: {}", path.display());
    println!("Lines in file: {}", summary.total_lines);
    println!(
        "Events analyzed: {} (parse_errors={})",
        summary.parsed_events, summary.parse_errors
    );
    println!("Unique runs: {}", summary.unique_runs.len());
    println!(
        "Loops: completed={} passed={}",
        summary.loops_completed, summary.loops_passed
    );
    println!(
        "Iterations: completed={} timed_out={} invalid={} approvals_requested={}",
        summary.iterations_completed,
        summary.iteration_timeouts,
        summary.invalid_results,
        summary.approvals_requested
    );
    if let Some(mean) = summary.mean_iterations_per_loop() {
        println!("Mean iterations per loop: {mean:.1}");
    }
    if let Some(best) = summary.best_score {
        println!("Best score: {best:.2}");
    }

    if !commands.is_empty() {
        println!("Top commands:");
        for (name, count) in commands.into_iter().take(5) {
            println!("- {}: {}", name, count);
        }
    }

    if let Some(last_ts) = summary.last_event_ts_unix_ms {
        println!("Last event ts_unix_ms: {last_ts}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sink_appends_flattened_records() {
        let dir = tempdir().unwrap();
        let cfg = RuntimeConfig {
            telemetry_enabled: true,
            telemetry_path: dir
                .path()
                .join("nested/events.jsonl")
                .to_string_lossy()
                .to_string(),
            ..RuntimeConfig::default()
        };
        let sink = TelemetrySink::new(&cfg, "run".to_string()).with_run_id("run-1");

        sink.emit(events::ITERATION_START, &json!({"iteration": 1}))
            .unwrap();
        sink.record(events::LOOP_COMPLETE, &json!({"passed": true, "best_score": 0.8}));

        let content = std::fs::read_to_string(dir.path().join("nested/events.jsonl")).unwrap();
        let lines = content.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "iteration_start");
        assert_eq!(first["iteration"], 1);
        assert_eq!(first["run_id"], "run-1");
    }

    #[test]
    fn disabled_sink_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let cfg = RuntimeConfig {
            telemetry_enabled: false,
            telemetry_path: path.to_string_lossy().to_string(),
            ..RuntimeConfig::default()
        };
        TelemetrySink::new(&cfg, "run".into())
            .emit(events::ITERATION_START, &json!({}))
            .unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn summary_counts_loop_events() {
        let lines = vec![
            r#"{"event":"iteration_complete","run_id":"a","command":"run","ts_unix_ms":10}"#,
            r#"{"event":"iteration_timeout","run_id":"a","command":"run","ts_unix_ms":11}"#,
            r#"{"event":"iteration_complete","run_id":"a","command":"run","ts_unix_ms":12}"#,
            r#"{"event":"loop_complete","run_id":"a","command":"run","passed":true,"best_score":0.92,"ts_unix_ms":13}"#,
            "not json",
            r#"{"event":"loop_complete","run_id":"b","command":"serve","passed":false,"best_score":0.4,"ts_unix_ms":20}"#,
        ]
        .into_iter()
        .map(String::from)
        .collect();

        let summary = summarize_telemetry_lines(lines, 100);

        assert_eq!(summary.parsed_events, 5);
        assert_eq!(summary.parse_errors, 1);
        assert_eq!(summary.unique_runs.len(), 2);
        assert_eq!(summary.iterations_completed, 2);
        assert_eq!(summary.iteration_timeouts, 1);
        assert_eq!(summary.loops_completed, 2);
        assert_eq!(summary.loops_passed, 1);
        assert_eq!(summary.best_score, Some(0.92));
        assert_eq!(summary.mean_iterations_per_loop(), Some(1.0));
        assert_eq!(summary.last_event_ts_unix_ms, Some(20));
    }
}
