//! One-shot JSON command protocol.
//!
//! A single command object is read from stdin; progress, the result and any
//! error are written to stdout as one JSON envelope per line.

use std::future::Future;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::PipelineError;
use crate::exit_codes::exit;
use crate::fetch::ResourceLocator;
use crate::notify::{NotifyResult, NotifyStatus, StatusEvent, StatusNotifier};
use crate::pipeline::{BackupJob, CompletedJob, FailedJob, JobOptions, JobRunner, JobStatus};
use crate::utils::redact_locator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Progress,
    Result,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Processing,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub timestamp: DateTime<Utc>,
    pub status: EnvelopeStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn progress(message: impl Into<String>, data: Option<Value>) -> Self {
        Self::new(EnvelopeKind::Progress, EnvelopeStatus::Processing, message, data)
    }

    pub fn result(message: impl Into<String>, data: Value) -> Self {
        Self::new(EnvelopeKind::Result, EnvelopeStatus::Success, message, Some(data))
    }

    pub fn error(message: impl Into<String>, data: Value) -> Self {
        Self::new(EnvelopeKind::Error, EnvelopeStatus::Failed, message, Some(data))
    }

    fn new(
        kind: EnvelopeKind,
        status: EnvelopeStatus,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            status,
            message: message.into(),
            data,
        }
    }
}

/// Serialises envelopes as JSON lines; shared by the progress sink and the
/// final report so lines never interleave.
pub struct EnvelopeWriter<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> EnvelopeWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn write(&self, envelope: &Envelope) -> NotifyResult {
        let line = serde_json::to_string(envelope)?;
        let mut out = self.out.lock().map_err(|_| "stdout writer poisoned")?;
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }

    /// Like [`write`](Self::write), logging failures instead of returning them.
    pub fn emit(&self, envelope: Envelope) {
        if let Err(e) = self.write(&envelope) {
            warn!("Failed to write {:?} envelope: {}", envelope.kind, e);
        }
    }
}

impl EnvelopeWriter<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

/// Forwards non-terminal state changes as `progress` envelopes. Terminal
/// outcomes are reported once by [`execute`].
pub struct ProgressNotifier<W: Write + Send> {
    out: Arc<EnvelopeWriter<W>>,
}

impl<W: Write + Send> ProgressNotifier<W> {
    pub fn new(out: Arc<EnvelopeWriter<W>>) -> Self {
        Self { out }
    }
}

impl<W: Write + Send> StatusNotifier for ProgressNotifier<W> {
    fn notify(&self, event: &StatusEvent) -> NotifyResult {
        if event.status != NotifyStatus::Processing {
            return Ok(());
        }
        let mut data = event.metadata.clone();
        data.insert("filename".into(), json!(event.filename));
        self.out.write(&Envelope {
            kind: EnvelopeKind::Progress,
            timestamp: event.timestamp,
            status: EnvelopeStatus::Processing,
            message: event.message.clone(),
            data: Some(Value::Object(data)),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct RestoreOptions {
    database_name: Option<String>,
    archive_processed: Option<bool>,
}

/// A decoded `restore` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreCommand {
    pub resource: String,
    pub database_name: Option<String>,
    pub archive_processed: Option<bool>,
}

/// Why a command was refused before any work started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: &'static str,
    pub message: String,
}

impl Rejection {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn envelope(&self) -> Envelope {
        Envelope::error(self.message.clone(), json!({ "code": self.code }))
    }
}

pub fn decode(input: &str) -> Result<RestoreCommand, Rejection> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Rejection::new(
            "EMPTY_COMMAND",
            "Empty command received on STDIN",
        ));
    }
    let value: Value = serde_json::from_str(input)
        .map_err(|_| Rejection::new("INVALID_JSON", "Invalid JSON command"))?;
    let Value::Object(command) = value else {
        return Err(Rejection::new(
            "INVALID_JSON",
            "Command must be a JSON object",
        ));
    };

    let name = command
        .get("command")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    if name != "restore" {
        return Err(Rejection::new(
            "UNKNOWN_COMMAND",
            format!("Unknown command: {}", name),
        ));
    }

    let resource = command
        .get("resource")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .ok_or_else(|| Rejection::new("MISSING_RESOURCE", "Missing resource URI"))?;

    let options = match command.get("options") {
        None | Some(Value::Null) => RestoreOptions::default(),
        Some(raw) => RestoreOptions::deserialize(raw)
            .map_err(|e| Rejection::new("INVALID_JSON", format!("Invalid options: {}", e)))?,
    };

    Ok(RestoreCommand {
        resource: resource.to_string(),
        database_name: options.database_name,
        archive_processed: options.archive_processed,
    })
}

/// Reads the whole command from `input`. Returns `None` if `shutdown`
/// resolves before the input is closed.
pub async fn read_command<R, S>(input: R, shutdown: S) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
    S: Future<Output = ()>,
{
    let mut input = input;
    let mut text = String::new();
    tokio::select! {
        read = input.read_to_string(&mut text) => read.map(|_| Some(text)),
        _ = shutdown => Ok(None),
    }
}

/// Emits the envelope for a termination that arrived before any command did.
pub fn interrupted_before_command<W: Write + Send>(out: &EnvelopeWriter<W>) -> i32 {
    out.emit(Envelope::error(
        "Operation interrupted",
        json!({ "code": "INTERRUPTED", "details": {} }),
    ));
    exit::INTERRUPTED
}

/// Runs one command to completion and reports it. Returns the process exit code.
///
/// When `shutdown` resolves first, the job is cancelled and given `grace` to
/// reach a checkpoint; anything but a completed restore then exits as interrupted.
pub async fn execute<W, S>(
    command: RestoreCommand,
    runner: &JobRunner,
    default_archive_processed: bool,
    out: &EnvelopeWriter<W>,
    shutdown: S,
    grace: Duration,
) -> i32
where
    W: Write + Send,
    S: Future<Output = ()>,
{
    let resource = redact_locator(&command.resource);
    out.emit(Envelope::progress(
        format!("Resolving resource: {}", resource),
        None,
    ));

    let locator = match ResourceLocator::parse(&command.resource) {
        Ok(locator) => locator,
        Err(e) => {
            out.emit(error_envelope(&resource, &e));
            return exit::FAILURE;
        }
    };
    let job = BackupJob::new(
        locator,
        command.database_name,
        JobOptions {
            archive_processed: command
                .archive_processed
                .unwrap_or(default_archive_processed),
        },
    );

    let cancel = CancellationToken::new();
    let (status_tx, status_rx) = watch::channel(JobStatus::Pending);
    let run = runner.run(job, &cancel, &status_tx);
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => report(out, &resource, result),
        _ = shutdown => {
            warn!(
                "Termination requested while {}, waiting up to {:?} for a checkpoint",
                *status_rx.borrow(),
                grace
            );
            cancel.cancel();
            match tokio::time::timeout(grace, &mut run).await {
                Ok(Ok(done)) => report(out, &resource, Ok(done)),
                Ok(Err(failed)) => interrupted(out, &resource, Some(&failed.error)),
                Err(_) => {
                    if *status_rx.borrow() == JobStatus::Restoring {
                        warn!("Abandoning restore of {}; verify the target database", resource);
                    }
                    interrupted(out, &resource, None)
                }
            }
        }
    }
}

fn report<W: Write + Send>(
    out: &EnvelopeWriter<W>,
    resource: &str,
    result: Result<CompletedJob, FailedJob>,
) -> i32 {
    match result {
        Ok(done) => {
            info!("Restored {} into '{}'", resource, done.database_name);
            out.emit(Envelope::result(
                format!("Successfully restored database {}", done.database_name),
                success_data(&done),
            ));
            exit::SUCCESS
        }
        Err(failed) if matches!(failed.error, PipelineError::Interrupted(_)) => {
            interrupted(out, resource, Some(&failed.error))
        }
        Err(failed) => {
            out.emit(error_envelope(resource, &failed.error));
            exit::FAILURE
        }
    }
}

fn success_data(done: &CompletedJob) -> Value {
    json!({
        "job_id": done.job_id.to_string(),
        "database_name": done.database_name,
        "duration_ms": done.duration.as_millis() as u64,
        "backup_metadata": done.backup_metadata,
        "restore_file": done.restore_file,
        "archived_path": done.disposition.path().map(|p| p.display().to_string()),
        "attempts": done.attempts,
    })
}

fn error_envelope(resource: &str, error: &PipelineError) -> Envelope {
    let mut details = error.details();
    details["resource"] = json!(resource);
    Envelope::error(
        error.to_string(),
        json!({ "code": error.code(), "details": details }),
    )
}

fn interrupted<W: Write + Send>(
    out: &EnvelopeWriter<W>,
    resource: &str,
    error: Option<&PipelineError>,
) -> i32 {
    let mut data = json!({ "code": "INTERRUPTED", "details": { "resource": resource } });
    if let Some(error) = error {
        data["details"]["error"] = json!(error.to_string());
    }
    out.emit(Envelope::error("Operation interrupted", data));
    exit::INTERRUPTED
}
