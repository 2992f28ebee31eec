use std::fs::{File, OpenOptions};
use std::io::Write;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub enum MessageLogMode {
    /// Inbound schedule fields and outbound pushes.
    Full,
    /// Outbound pushes and events only.
    PushesOnly,
}

/// Optional NDJSON log of broker traffic and external pushes.
pub(crate) struct MessageLogger {
    mode: MessageLogMode,
    file: File,
}

impl MessageLogger {
    pub fn new(mode: MessageLogMode, path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { mode, file })
    }

    pub fn log_field(&mut self, topic: &str, field: &str, value: &str) {
        if matches!(self.mode, MessageLogMode::PushesOnly) {
            return;
        }
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "rx",
            "topic": topic,
            "field": field,
            "value": value,
        });
        self.write_line(&entry);
    }

    pub fn log_push(&mut self, zone: &str, temp: f64) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "push",
            "zone": zone,
            "temp": temp,
        });
        self.write_line(&entry);
    }

    pub fn log_event(&mut self, kind: &str, detail: &Value) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "event",
            "kind": kind,
            "detail": detail,
        });
        self.write_line(&entry);
    }

    fn write_line(&mut self, entry: &Value) {
        if let Ok(line) = serde_json::to_string(entry)
            && let Err(e) = writeln!(self.file, "{line}")
        {
            warn!("failed to write log entry: {e}");
        }
    }
}
