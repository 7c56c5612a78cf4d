// SPDX-License-Identifier: MIT
//! Diagnostics logger (spec §4.14): structured per-route NDJSON trace/chat
//! files, kept separate from the `tracing` operability channel so a
//! redacted, route-scoped audit trail survives independent of log level.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{TimeZone, Utc};
use qqgate_core::{redact_text, route_dir_name, Route};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagChannel {
    Trace,
    Chat,
}

impl DiagChannel {
    fn stem(self) -> &'static str {
        match self {
            DiagChannel::Trace => "trace",
            DiagChannel::Chat => "chat",
        }
    }

    /// `logs/trace-YYYY-MM-DD.ndjson` / `logs/chat-YYYY-MM-DD.ndjson`
    /// (spec §6 "Persisted layout", §4.14) — one file per UTC calendar day
    /// so the append-only channel never grows unbounded.
    fn file_name(self, ts_ms: i64) -> String {
        let day = Utc
            .timestamp_millis_opt(ts_ms)
            .single()
            .unwrap_or_else(Utc::now)
            .format("%Y-%m-%d");
        format!("{}-{day}.ndjson", self.stem())
    }
}

#[derive(Debug, Serialize)]
pub struct DiagEvent<'a> {
    pub ts_ms: i64,
    pub event: &'a str,
    #[serde(flatten)]
    pub fields: Value,
}

/// Emits redacted NDJSON lines under `<root>/<route-dir>/<channel>.ndjson`.
/// One line per `emit` call, fsync-free append — loss on crash is
/// acceptable for a diagnostics channel.
pub struct DiagnosticsLogger {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl DiagnosticsLogger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), write_lock: Mutex::new(()) }
    }

    pub fn emit(&self, route: &Route, channel: DiagChannel, event: &DiagEvent<'_>) {
        let dir = self.route_dir(route);
        if let Err(err) = std::fs::create_dir_all(&dir) {
            tracing::warn!(error = %err, path = %dir.display(), "diagnostics directory create failed");
            return;
        }
        let mut line = match serde_json::to_string(event) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(error = %err, "diagnostics event serialization failed");
                return;
            }
        };
        line = redact_text(&line);
        line.push('\n');

        let path = dir.join(channel.file_name(event.ts_ms));
        let _guard = self.write_lock.lock().expect("diagnostics write lock poisoned");
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(mut f) => {
                if let Err(err) = f.write_all(line.as_bytes()) {
                    tracing::warn!(error = %err, path = %path.display(), "diagnostics write failed");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, path = %path.display(), "diagnostics file open failed");
            }
        }
    }

    fn route_dir(&self, route: &Route) -> PathBuf {
        self.root.join(route_dir_name(route)).join("logs")
    }
}

/// Convenience for building a `DiagEvent` field map without pulling in
/// `serde_json::json!` at every call site.
pub fn fields(pairs: &[(&str, Value)]) -> Value {
    let mut map = serde_json::Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    Value::Object(map)
}

pub fn route_dir_path(root: &Path, route: &Route) -> PathBuf {
    root.join(route_dir_name(route)).join("logs")
}
