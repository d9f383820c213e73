//! Status notification sinks.
//!
//! The state machine reports every lifecycle transition as a [`StatusEvent`].
//! Sinks are independent: a failing or panicking sink is logged and skipped,
//! it never aborts the pipeline or starves the other sinks.

use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

/// Fixed status vocabulary of monitor-mode notifications.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotifyStatus {
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for NotifyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyStatus::Processing => write!(f, "processing"),
            NotifyStatus::Completed => write!(f, "completed"),
            NotifyStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Immutable record handed to every sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub filename: String,
    pub status: NotifyStatus,
    pub message: String,
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(
        filename: impl Into<String>,
        status: NotifyStatus,
        message: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            filename: filename.into(),
            status,
            message: message.into(),
            metadata,
            timestamp: Utc::now(),
        }
    }
}

pub type NotifyResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub trait StatusNotifier: Send + Sync {
    fn notify(&self, event: &StatusEvent) -> NotifyResult;
}

/// Writes events to the tracing log.
pub struct LogNotifier;

impl StatusNotifier for LogNotifier {
    fn notify(&self, event: &StatusEvent) -> NotifyResult {
        let metadata = Value::Object(event.metadata.clone());
        match event.status {
            NotifyStatus::Failed => {
                warn!(file = %event.filename, %metadata, "[{}] {}", event.status, event.message)
            }
            _ => info!(file = %event.filename, %metadata, "[{}] {}", event.status, event.message),
        }
        Ok(())
    }
}

type Callback = dyn Fn(&str, NotifyStatus, &str, &Map<String, Value>) -> NotifyResult + Send + Sync;

/// Programmatic callback receiving `(filename, status, details, metadata)`.
pub struct CallbackNotifier {
    callback: Box<Callback>,
}

impl CallbackNotifier {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&str, NotifyStatus, &str, &Map<String, Value>) -> NotifyResult + Send + Sync + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }
}

impl StatusNotifier for CallbackNotifier {
    fn notify(&self, event: &StatusEvent) -> NotifyResult {
        (self.callback)(&event.filename, event.status, &event.message, &event.metadata)
    }
}

/// Emits one JSON object per line to the wrapped writer.
pub struct JsonStreamNotifier<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonStreamNotifier<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl JsonStreamNotifier<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> StatusNotifier for JsonStreamNotifier<W> {
    fn notify(&self, event: &StatusEvent) -> NotifyResult {
        let line = serde_json::to_string(event)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| "json stream writer poisoned")?;
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(())
    }
}

/// Fans every event out to each registered sink, isolating their failures.
#[derive(Clone, Default)]
pub struct Notifiers {
    sinks: Vec<Arc<dyn StatusNotifier>>,
}

impl Notifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl StatusNotifier + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    pub fn emit(&self, event: &StatusEvent) {
        for (index, sink) in self.sinks.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| sink.notify(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(sink = index, file = %event.filename, "Status notifier failed: {}", e)
                }
                Err(_) => error!(sink = index, file = %event.filename, "Status notifier panicked"),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Sink that records every event it receives.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingNotifier {
        pub events: Arc<Mutex<Vec<StatusEvent>>>,
    }

    impl RecordingNotifier {
        pub fn snapshot(&self) -> Vec<StatusEvent> {
            self.events.lock().map(|e| e.clone()).unwrap_or_default()
        }
    }

    impl StatusNotifier for RecordingNotifier {
        fn notify(&self, event: &StatusEvent) -> NotifyResult {
            self.events.lock().map_err(|_| "poisoned")?.push(event.clone());
            Ok(())
        }
    }

    struct FailingNotifier;

    impl StatusNotifier for FailingNotifier {
        fn notify(&self, _event: &StatusEvent) -> NotifyResult {
            Err("sink unavailable".into())
        }
    }

    struct PanickingNotifier;

    impl StatusNotifier for PanickingNotifier {
        fn notify(&self, _event: &StatusEvent) -> NotifyResult {
            panic!("sink exploded");
        }
    }

    #[test]
    fn failing_sinks_do_not_block_the_others() {
        let recorder = RecordingNotifier::default();
        let notifiers = Notifiers::new()
            .with(FailingNotifier)
            .with(PanickingNotifier)
            .with(recorder.clone());

        let event = StatusEvent::new("a.dat", NotifyStatus::Processing, "Fetching", Map::new());
        notifiers.emit(&event);
        notifiers.emit(&event);

        assert_eq!(recorder.snapshot().len(), 2);
    }

    #[test]
    fn callback_receives_event_fields() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let notifiers = Notifiers::new().with(CallbackNotifier::new(
            move |filename, status, details, metadata| {
                sink_seen.lock().map_err(|_| "poisoned")?.push((
                    filename.to_string(),
                    status,
                    details.to_string(),
                    metadata.get("state").cloned(),
                ));
                Ok(())
            },
        ));

        let mut metadata = Map::new();
        metadata.insert("state".into(), Value::from("restoring"));
        notifiers.emit(&StatusEvent::new(
            "b.rar",
            NotifyStatus::Failed,
            "boom",
            metadata,
        ));

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[(
                "b.rar".to_string(),
                NotifyStatus::Failed,
                "boom".to_string(),
                Some(Value::from("restoring"))
            )]
        );
    }

    #[test]
    fn json_stream_writes_one_line_per_event() {
        let sink = JsonStreamNotifier::new(Vec::new());
        sink.notify(&StatusEvent::new("c.dat", NotifyStatus::Completed, "done", Map::new()))
            .unwrap();
        sink.notify(&StatusEvent::new("c.dat", NotifyStatus::Failed, "oops", Map::new()))
            .unwrap();

        let buffer = sink.writer.into_inner().unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["status"], "completed");
        assert_eq!(lines[1]["message"], "oops");
        assert!(lines[0]["timestamp"].is_string());
    }
}
