use crate::config::Config;
use crate::protocol::Envelope;
use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Envelope trace storage policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStorageMode {
    None,
    Rolling,
    Full,
}

impl TraceStorageMode {
    fn from_raw(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "rolling" => Self::Rolling,
            "full" => Self::Full,
            _ => Self::None,
        }
    }
}

/// Which way a traced envelope crossed the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TraceDirection {
    ToPlugin,
    FromPlugin,
}

/// One forwarded envelope. Payloads are never recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeTraceEvent {
    pub id: String,
    pub timestamp: String,
    pub direction: TraceDirection,
    pub filename: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl EnvelopeTraceEvent {
    fn describe(direction: TraceDirection, filename: &str, envelope: &Envelope) -> Self {
        let (message_id, reply_to) = match envelope {
            Envelope::Message { id, reply_to, .. } => (Some(id.clone()), reply_to.clone()),
            _ => (None, None),
        };
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            direction,
            filename: filename.to_string(),
            kind: envelope.kind().to_string(),
            worker_id: envelope.worker_id().map(str::to_string),
            message_id,
            reply_to,
        }
    }
}

/// JSONL recorder for envelopes the host forwards.
pub struct EnvelopeTrace {
    mode: TraceStorageMode,
    max_entries: usize,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EnvelopeTrace {
    pub fn new(mode: TraceStorageMode, max_entries: usize, path: PathBuf) -> Self {
        Self {
            mode,
            max_entries: max_entries.max(1),
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Build the recorder the config asks for; `None` when tracing is off.
    pub fn from_config(config: &Config) -> Option<Arc<Self>> {
        let mode = TraceStorageMode::from_raw(&config.trace.mode);
        if mode == TraceStorageMode::None {
            if !config.trace.mode.trim().is_empty()
                && !config.trace.mode.trim().eq_ignore_ascii_case("none")
            {
                tracing::warn!(
                    mode = %config.trace.mode,
                    "Unknown trace.mode; falling back to none"
                );
            }
            return None;
        }
        Some(Arc::new(Self::new(
            mode,
            config.trace.max_entries,
            config.resolve_trace_path(),
        )))
    }

    pub fn mode(&self) -> TraceStorageMode {
        self.mode
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record one envelope. Failures are logged, never propagated.
    pub fn record(&self, direction: TraceDirection, filename: &str, envelope: &Envelope) {
        let event = EnvelopeTraceEvent::describe(direction, filename, envelope);
        if let Err(err) = self.append(&event) {
            tracing::warn!("Failed to write envelope trace event: {err}");
        }
    }

    fn append(&self, event: &EnvelopeTraceEvent) -> Result<()> {
        if self.mode == TraceStorageMode::None {
            return Ok(());
        }

        let _guard = self.write_lock.lock();

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;

        if self.mode == TraceStorageMode::Rolling {
            self.trim_to_last_entries()?;
        }

        Ok(())
    }

    fn trim_to_last_entries(&self) -> Result<()> {
        let raw = fs::read_to_string(&self.path).unwrap_or_default();
        let lines: Vec<&str> = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();

        if lines.len() <= self.max_entries {
            return Ok(());
        }

        let kept = &lines[lines.len() - self.max_entries..];
        let mut rewritten = kept.join("\n");
        rewritten.push('\n');

        let tmp = self.path.with_extension(format!(
            "tmp.{}.{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        fs::write(&tmp, rewritten)?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

/// Load the most recent trace events, newest first, optionally restricted
/// to one envelope kind.
pub fn load_events(
    path: &Path,
    limit: usize,
    kind_filter: Option<&str>,
) -> Result<Vec<EnvelopeTraceEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let raw = fs::read_to_string(path)?;
    let mut events = Vec::new();
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<EnvelopeTraceEvent>(trimmed) {
            Ok(event) => events.push(event),
            Err(err) => tracing::warn!("Skipping malformed envelope trace line: {err}"),
        }
    }

    if let Some(kind) = kind_filter.map(str::trim).filter(|k| !k.is_empty()) {
        events.retain(|event| event.kind.eq_ignore_ascii_case(kind));
    }

    if events.len() > limit {
        events = events.split_off(events.len() - limit);
    }

    events.reverse();
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(n: usize) -> Envelope {
        Envelope::message(format!("w1/message/{n}"), None, Some("w1".into()), json!(n))
    }

    #[test]
    fn storage_mode_parses_known_values() {
        assert_eq!(TraceStorageMode::from_raw("none"), TraceStorageMode::None);
        assert_eq!(TraceStorageMode::from_raw(" Rolling "), TraceStorageMode::Rolling);
        assert_eq!(TraceStorageMode::from_raw("full"), TraceStorageMode::Full);
        assert_eq!(TraceStorageMode::from_raw("loud"), TraceStorageMode::None);
    }

    #[test]
    fn disabled_config_builds_no_recorder() {
        assert!(EnvelopeTrace::from_config(&Config::default()).is_none());

        let mut config = Config::default();
        config.trace.mode = "full".into();
        let trace = EnvelopeTrace::from_config(&config).expect("tracing enabled");
        assert_eq!(trace.mode(), TraceStorageMode::Full);
    }

    #[test]
    fn rolling_mode_keeps_latest_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("trace.jsonl");
        let trace = EnvelopeTrace::new(TraceStorageMode::Rolling, 2, path.clone());

        for n in 0..5 {
            trace.record(TraceDirection::ToPlugin, "echo", &message(n));
        }

        let events = load_events(&path, 10, None).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message_id.as_deref(), Some("w1/message/4"));
        assert_eq!(events[1].message_id.as_deref(), Some("w1/message/3"));
    }

    #[test]
    fn events_describe_lifecycle_envelopes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/trace.jsonl");
        let trace = EnvelopeTrace::new(TraceStorageMode::Full, 100, path.clone());

        trace.record(
            TraceDirection::ToPlugin,
            "echo",
            &Envelope::RegisterWorker {
                id: "w1".into(),
                file: "a.test.js".into(),
            },
        );
        trace.record(TraceDirection::FromPlugin, "echo", &Envelope::Available);
        trace.record(TraceDirection::FromPlugin, "echo", &message(1));

        let all = load_events(&path, 10, None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].kind, "register-worker");
        assert_eq!(all[2].worker_id.as_deref(), Some("w1"));
        assert_eq!(all[2].direction, TraceDirection::ToPlugin);
        assert!(all[1].worker_id.is_none());

        let available = load_events(&path, 10, Some("available")).unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].direction, TraceDirection::FromPlugin);
    }

    #[test]
    fn missing_trace_file_loads_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let events = load_events(&tmp.path().join("absent.jsonl"), 10, None).unwrap();
        assert!(events.is_empty());
    }
}
