//! Structured JSON event log written by a background thread.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::field::{Field, Visit};
use tracing::Event;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Records buffered before new events are dropped.
pub const LOG_BUFFER: usize = 10_000;
const FLUSH_EVERY: usize = 1024;

/// One line of the JSON log.
#[derive(Debug, Serialize)]
pub struct LogRecord {
    pub t_ms: u64,
    pub level: &'static str,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "JsonMap::is_empty")]
    pub fields: JsonMap<String, JsonValue>,
}

#[derive(Default)]
struct FieldVisitor {
    fields: JsonMap<String, JsonValue>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: JsonValue) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, JsonValue::Bool(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        let value = serde_json::Number::from_f64(value)
            .map_or_else(|| JsonValue::String(value.to_string()), JsonValue::Number);
        self.insert(field, value);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, JsonValue::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.insert(field, JsonValue::String(format!("{value:?}")));
    }
}

/// Serializes records on its own thread so logging never blocks a task.
#[derive(Debug)]
pub struct JsonLogWriter {
    started_at: Instant,
    sender: Mutex<Option<SyncSender<LogRecord>>>,
    handle: Mutex<Option<JoinHandle<eyre::Result<()>>>>,
    dropped: AtomicU64,
    written: AtomicU64,
}

impl JsonLogWriter {
    pub fn new(path: &Path, capacity: usize) -> eyre::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(std::fs::File::create(path)?);
        let (tx, rx) = mpsc::sync_channel::<LogRecord>(capacity);
        let handle = std::thread::Builder::new()
            .name("json-log".into())
            .spawn(move || -> eyre::Result<()> {
                let mut pending = 0usize;
                for record in rx {
                    serde_json::to_writer(&mut out, &record)?;
                    out.write_all(b"\n")?;
                    pending += 1;
                    if pending >= FLUSH_EVERY {
                        out.flush()?;
                        pending = 0;
                    }
                }
                out.flush()?;
                Ok(())
            })?;
        Ok(Self {
            started_at: Instant::now(),
            sender: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            dropped: AtomicU64::new(0),
            written: AtomicU64::new(0),
        })
    }

    /// Queue `record`, dropping it when the buffer is full or closed.
    pub fn record(&self, record: LogRecord) {
        let sender = self.sender.lock().clone();
        let sent = match sender {
            Some(sender) => match sender.try_send(record) {
                Ok(()) => true,
                Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => false,
            },
            None => false,
        };
        if sent {
            self.written.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Close the channel and wait for the file to be flushed.
    pub fn finish(&self) -> eyre::Result<()> {
        drop(self.sender.lock().take());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| eyre::eyre!("json log writer thread panicked"))??;
        }
        Ok(())
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn total_events(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

/// Tracing layer feeding a [`JsonLogWriter`].
#[derive(Clone)]
pub struct JsonLogLayer {
    writer: Arc<JsonLogWriter>,
}

impl JsonLogLayer {
    pub fn new(writer: Arc<JsonLogWriter>) -> Self {
        Self { writer }
    }
}

impl<S: tracing::Subscriber> Layer<S> for JsonLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let mut fields = visitor.fields;
        let message = fields.remove("message").map(|value| match value {
            JsonValue::String(text) => text,
            other => other.to_string(),
        });
        self.writer.record(LogRecord {
            t_ms: self.writer.elapsed_ms(),
            level: meta.level().as_str(),
            target: meta.target().to_string(),
            message,
            fields,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn events_become_json_lines() {
        let dir = temp_dir("json-log");
        let path = dir.join("events.jsonl");
        let writer = Arc::new(JsonLogWriter::new(&path, 16).expect("writer"));
        let subscriber = tracing_subscriber::registry().with(JsonLogLayer::new(Arc::clone(&writer)));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(section = 3u64, indexer = "cht", "section confirmed");
            tracing::warn!(ok = false, "invalid response");
        });
        writer.finish().expect("finish");

        let text = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<JsonValue> = text
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["message"], "section confirmed");
        assert_eq!(lines[0]["fields"]["section"], 3);
        assert_eq!(lines[0]["fields"]["indexer"], "cht");
        assert_eq!(lines[1]["level"], "WARN");
        assert_eq!(writer.total_events(), 2);
        assert_eq!(writer.dropped_events(), 0);

        writer.record(LogRecord {
            t_ms: 0,
            level: "INFO",
            target: "late".into(),
            message: None,
            fields: JsonMap::new(),
        });
        assert_eq!(writer.dropped_events(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
