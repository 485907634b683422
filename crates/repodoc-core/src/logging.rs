//! Per-run event log.
//!
//! [`RunLog`] is a `tracing` layer that buffers events in a bounded ring
//! until a run directory exists, then is attached to `<run_dir>/info.log`
//! through its [`RunLogHandle`]: the buffer is flushed to the file and
//! later events are appended line by line.

use std::fs::File;
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// File name of the event log inside a run directory.
pub const INFO_LOG_FILE: &str = "info.log";

/// A single captured log entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Timestamp as seconds since the log was created.
    pub elapsed_secs: f64,
    pub level: Level,
    /// Target module path.
    pub target: String,
    /// The message followed by the event's other fields as `key=value`.
    pub message: String,
}

impl LogEntry {
    fn line(&self) -> String {
        format!(
            "{:>9.3}s {:<5} {}: {}",
            self.elapsed_secs, self.level, self.target, self.message
        )
    }
}

#[derive(Debug)]
struct LogState {
    entries: Vec<LogEntry>,
    capacity: usize,
    start_time: std::time::Instant,
    sink: Option<(PathBuf, LineWriter<File>)>,
}

impl LogState {
    fn push(&mut self, level: Level, target: String, message: String) {
        let entry = LogEntry {
            elapsed_secs: self.start_time.elapsed().as_secs_f64(),
            level,
            target,
            message,
        };
        if let Some((_, writer)) = self.sink.as_mut() {
            // A failing log write must not take the run down with it.
            let _ = writeln!(writer, "{}", entry.line());
        }
        if self.entries.len() >= self.capacity {
            self.entries.remove(0);
        }
        self.entries.push(entry);
    }
}

/// A `tracing` layer capturing events of at least `min_level`.
#[derive(Debug, Clone)]
pub struct RunLog {
    state: Arc<Mutex<LogState>>,
    min_level: Level,
}

impl RunLog {
    /// Create a log keeping the last `capacity` entries in memory.
    pub fn new(capacity: usize, min_level: Level) -> Self {
        Self {
            state: Arc::new(Mutex::new(LogState {
                entries: Vec::with_capacity(capacity.min(1024)),
                capacity: capacity.max(1),
                start_time: std::time::Instant::now(),
                sink: None,
            })),
            min_level,
        }
    }

    /// Handle for attaching the log to a run directory and reading entries.
    pub fn handle(&self) -> RunLogHandle {
        RunLogHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: Subscriber> Layer<S> for RunLog {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // `Level` orders TRACE as greatest, so "at least as severe" is `<=`.
        if *metadata.level() > self.min_level {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if let Ok(mut state) = self.state.lock() {
            state.push(*metadata.level(), metadata.target().to_string(), visitor.finish());
        }
    }
}

/// Control handle for a [`RunLog`].
#[derive(Debug, Clone)]
pub struct RunLogHandle {
    state: Arc<Mutex<LogState>>,
}

impl RunLogHandle {
    /// Start writing to `<dir>/info.log`, flushing the buffered entries first.
    pub fn attach(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let path = dir.join(INFO_LOG_FILE);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let mut writer = LineWriter::new(file);
        let mut state = self
            .state
            .lock()
            .map_err(|_| std::io::Error::other("run log lock poisoned"))?;
        for entry in &state.entries {
            writeln!(writer, "{}", entry.line())?;
        }
        state.sink = Some((path.clone(), writer));
        Ok(path)
    }

    /// Stop writing to the file; returns its path if one was attached.
    pub fn detach(&self) -> Option<PathBuf> {
        let mut state = self.state.lock().ok()?;
        let (path, mut writer) = state.sink.take()?;
        let _ = writer.flush();
        Some(path)
    }

    /// Snapshot of the buffered entries.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.state
            .lock()
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }
}

/// Visitor rendering the `message` field followed by the other fields.
#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Vec<String>,
}

impl FieldVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.join(" ")
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={value:?}", field.name()));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={value}", field.name()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn test_captures_events_with_fields() {
        let log = RunLog::new(100, Level::INFO);
        let handle = log.handle();
        let _guard = tracing_subscriber::registry().with(log).set_default();

        tracing::info!(step = 3, tool = "read_file", "tool call");
        tracing::debug!("filtered out");
        tracing::warn!("a warning");

        let entries = handle.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, Level::INFO);
        assert_eq!(entries[0].message, "tool call step=3 tool=read_file");
        assert_eq!(entries[1].level, Level::WARN);
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let log = RunLog::new(3, Level::INFO);
        let handle = log.handle();
        let _guard = tracing_subscriber::registry().with(log).set_default();

        tracing::info!("one");
        tracing::info!("two");
        tracing::info!("three");
        tracing::info!("four");

        let entries = handle.entries();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].message.contains("two"));
    }

    #[test]
    fn test_attach_flushes_buffer_then_appends() {
        let tmp = TempDir::new().unwrap();
        let log = RunLog::new(100, Level::INFO);
        let handle = log.handle();
        let _guard = tracing_subscriber::registry().with(log).set_default();

        tracing::info!("before attach");
        let path = handle.attach(tmp.path()).unwrap();
        tracing::info!("after attach");
        assert_eq!(handle.detach(), Some(path.clone()));
        tracing::info!("after detach");

        let text = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("before attach"));
        assert!(lines[1].ends_with("after attach"));
    }
}
