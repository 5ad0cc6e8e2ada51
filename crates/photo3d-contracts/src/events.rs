use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only `events.jsonl` log for one pipeline.
///
/// - default fields are `type`, `pipeline_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
/// - clones share one file lock, so concurrent view workers may emit
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: Option<PathBuf>,
    pipeline_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, pipeline_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: Some(path.into()),
                pipeline_id: pipeline_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    /// Writer that builds events but persists nothing.
    pub fn detached(pipeline_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: None,
                pipeline_id: pipeline_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn pipeline_id(&self) -> &str {
        &self.inner.pipeline_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "pipeline_id".to_string(),
            Value::String(self.inner.pipeline_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        let Some(path) = self.inner.path.as_ref() else {
            return Ok(Value::Object(event));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }

    /// Emit and log instead of failing; telemetry must not abort generation.
    pub fn record(&self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.emit(event_type, payload) {
            tracing::warn!(event_type, error = %err, "failed to append pipeline event");
        }
    }
}

/// Shorthand for building a payload from `json!({...})`.
pub fn payload(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_default()
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;
    use std::thread;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "pipe-123");

        let emitted = writer.emit("view_completed", payload(json!({"angle": "front"})))?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], json!("view_completed"));
        assert_eq!(parsed["pipeline_id"], json!("pipe-123"));
        assert_eq!(parsed["angle"], json!("front"));
        DateTime::parse_from_rfc3339(parsed["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn detached_writer_touches_no_file() -> anyhow::Result<()> {
        let writer = EventWriter::detached("pipe-1");
        let event = writer.emit("status_checked", EventPayload::new())?;
        assert!(writer.path().is_none());
        assert_eq!(event["pipeline_id"], json!("pipe-1"));
        Ok(())
    }

    #[test]
    fn concurrent_emitters_keep_lines_whole() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let writer = Arc::new(EventWriter::new(&path, "pipe-9"));

        let handles = (0..8)
            .map(|idx| {
                let writer = Arc::clone(&writer);
                thread::spawn(move || writer.emit("tick", payload(json!({"idx": idx}))))
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("emitter thread panicked"))??;
        }

        let content = fs::read_to_string(&path)?;
        let lines = content.lines().collect::<Vec<&str>>();
        assert_eq!(lines.len(), 8);
        for line in lines {
            let parsed: Value = serde_json::from_str(line)?;
            assert_eq!(parsed["type"], json!("tick"));
        }
        Ok(())
    }
}
