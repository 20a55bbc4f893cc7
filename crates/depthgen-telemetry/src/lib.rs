use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use depthgen_core::{TelemetryEvent, TelemetrySink};
use reqwest::blocking::Client;
use serde::Serialize;

/// Sink selected by `DEPTHGEN_TELEMETRY_SINK`; `None` when unset or misconfigured.
pub fn sink_from_env() -> Option<Box<dyn TelemetrySink>> {
    sink_from_lookup(|key| std::env::var(key).ok())
}

fn sink_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Box<dyn TelemetrySink>> {
    let mode = lookup("DEPTHGEN_TELEMETRY_SINK")?;
    match mode.trim().to_ascii_lowercase().as_str() {
        "stdout" => Some(Box::new(StdoutSink)),
        "file" => {
            let path = lookup("DEPTHGEN_TELEMETRY_FILE").filter(|v| !v.trim().is_empty())?;
            Some(Box::new(FileSink::new(PathBuf::from(path))))
        }
        "http" => {
            let endpoint = lookup("DEPTHGEN_TELEMETRY_ENDPOINT").filter(|v| !v.trim().is_empty())?;
            Some(Box::new(HttpSink::new(endpoint)))
        }
        other => {
            tracing::warn!(sink = other, "unknown telemetry sink, telemetry disabled");
            None
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryEnvelope {
    event_type: String,
    version: &'static str,
    platform: &'static str,
    duration_ms: Option<u64>,
    detail: Option<String>,
}

impl From<&TelemetryEvent> for TelemetryEnvelope {
    fn from(event: &TelemetryEvent) -> Self {
        Self {
            event_type: format!("{:?}", event.event_type),
            version: env!("CARGO_PKG_VERSION"),
            platform: std::env::consts::OS,
            duration_ms: event.duration_ms,
            detail: event.detail.clone(),
        }
    }
}

pub struct StdoutSink;

impl TelemetrySink for StdoutSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Ok(line) = serde_json::to_string(&TelemetryEnvelope::from(&event)) {
            println!("{}", line);
        }
    }
}

pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn write_line(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("creating telemetry log parent directory")?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("opening telemetry file")?;
        writeln!(file, "{}", line).context("writing telemetry line")?;
        Ok(())
    }
}

impl TelemetrySink for FileSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Ok(line) = serde_json::to_string(&TelemetryEnvelope::from(&event)) {
            if let Err(err) = self.write_line(&line) {
                tracing::debug!(error = %format!("{err:#}"), "dropping telemetry event");
            }
        }
    }
}

pub struct HttpSink {
    endpoint: String,
    client: Client,
}

impl HttpSink {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: Client::new(),
        }
    }
}

impl TelemetrySink for HttpSink {
    fn emit(&self, event: TelemetryEvent) {
        let payload = TelemetryEnvelope::from(&event);
        if let Err(err) = self.client.post(&self.endpoint).json(&payload).send() {
            tracing::debug!(error = %err, endpoint = %self.endpoint, "telemetry post failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use depthgen_core::TelemetryEventType;

    use super::*;

    #[test]
    fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("telemetry.jsonl");
        let sink = FileSink::new(path.clone());
        sink.emit(TelemetryEvent {
            event_type: TelemetryEventType::PredictionStart,
            duration_ms: None,
            detail: None,
        });
        sink.emit(TelemetryEvent {
            event_type: TelemetryEventType::PredictionSuccess,
            duration_ms: Some(12),
            detail: Some("seed=42".to_string()),
        });

        let raw = std::fs::read_to_string(&path).expect("read telemetry");
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["eventType"], "PredictionStart");
        assert_eq!(lines[1]["durationMs"], 12);
        assert_eq!(lines[1]["detail"], "seed=42");
    }

    #[test]
    fn sink_selection_requires_its_settings() {
        assert!(sink_from_lookup(|_| None).is_none());
        assert!(sink_from_lookup(|key| (key == "DEPTHGEN_TELEMETRY_SINK").then(|| "stdout".to_string())).is_some());
        assert!(sink_from_lookup(|key| (key == "DEPTHGEN_TELEMETRY_SINK").then(|| "file".to_string())).is_none());
        assert!(sink_from_lookup(|key| match key {
            "DEPTHGEN_TELEMETRY_SINK" => Some("HTTP".to_string()),
            "DEPTHGEN_TELEMETRY_ENDPOINT" => Some("http://localhost:9/events".to_string()),
            _ => None,
        })
        .is_some());
        assert!(sink_from_lookup(|key| (key == "DEPTHGEN_TELEMETRY_SINK").then(|| "syslog".to_string())).is_none());
    }
}
