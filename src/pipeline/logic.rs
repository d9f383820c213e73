// backup-ingest/src/pipeline/logic.rs
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use super::{BackupJob, CompletedJob, FailedJob, JobResult, JobStatus};
use crate::archiver::{Archiver, Disposition, JobOutcome};
use crate::config::{AppConfig, DatabaseSettings};
use crate::errors::PipelineError;
use crate::extract::ArchiveExtractor;
use crate::fetch::{ResourceFetcher, ResourceLocator};
use crate::notify::{Notifiers, NotifyStatus, StatusEvent};
use crate::restore::{RestoreDescriptor, RestoreExecutor};
use crate::utils::{redact_locator, redact_path};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Runs backup jobs through Fetch -> Extract -> Restore -> Archive.
///
/// One runner is shared by every job; each call to [`JobRunner::run`] owns its
/// job and scratch directory exclusively.
pub struct JobRunner {
    fetcher: ResourceFetcher,
    extractor: ArchiveExtractor,
    executor: Arc<dyn RestoreExecutor>,
    archiver: Archiver,
    notifiers: Notifiers,
    database: DatabaseSettings,
    shared_dir: Option<PathBuf>,
    scratch_root: PathBuf,
    keep_scratch: bool,
    retry_policy: ExponentialBuilder,
}

impl JobRunner {
    pub fn new(
        config: &AppConfig,
        executor: Arc<dyn RestoreExecutor>,
        notifiers: Notifiers,
    ) -> Result<Self, PipelineError> {
        let backup = &config.backup;
        let retry_policy = ExponentialBuilder::default()
            .with_min_delay(backup.retry_delay)
            .with_max_delay(MAX_RETRY_DELAY.max(backup.retry_delay))
            .with_factor(2.0)
            .with_max_times(backup.retry_attempts.saturating_sub(1) as usize)
            .with_jitter();

        Ok(Self {
            fetcher: ResourceFetcher::new(config.fetch.clone())?,
            extractor: ArchiveExtractor::default(),
            executor,
            archiver: Archiver::new(backup.quarantine_failed),
            notifiers,
            database: config.database.clone(),
            shared_dir: backup.shared_dir.clone(),
            scratch_root: backup.scratch_dir.clone(),
            keep_scratch: backup.keep_scratch,
            retry_policy,
        })
    }

    pub fn notifiers(&self) -> &Notifiers {
        &self.notifiers
    }

    /// Drives `job` to a terminal state. Every state change is published on
    /// `status` and reported to the notifiers exactly once.
    pub async fn run(
        &self,
        job: BackupJob,
        cancel: &CancellationToken,
        status: &watch::Sender<JobStatus>,
    ) -> JobResult {
        let span = info_span!(
            "job",
            job_id = %job.id,
            resource = %redact_locator(&job.locator.to_string())
        );
        self.run_to_completion(job, cancel, status)
            .instrument(span)
            .await
    }

    async fn run_to_completion(
        &self,
        mut job: BackupJob,
        cancel: &CancellationToken,
        status: &watch::Sender<JobStatus>,
    ) -> JobResult {
        let mut transitions = Transitions {
            notifiers: &self.notifiers,
            filename: job.locator.file_name(),
            job_id: job.id,
            status,
            last: None,
        };

        let scratch = match self.create_scratch(job.id) {
            Ok(scratch) => scratch,
            Err(e) => return self.fail(job, &mut transitions, e).await,
        };

        let outcome = self
            .drive(&mut job, &mut transitions, scratch.path(), cancel)
            .await;
        self.release_scratch(scratch);

        match outcome {
            Ok(done) => {
                let mut metadata = Map::new();
                metadata.insert("database_name".into(), json!(done.database_name));
                metadata.insert("duration_ms".into(), json!(done.duration.as_millis() as u64));
                metadata.insert(
                    "backup_metadata".into(),
                    serde_json::to_value(&done.backup_metadata).unwrap_or(Value::Null),
                );
                metadata.insert(
                    "archived_path".into(),
                    json!(done.disposition.path().map(|p| p.display().to_string())),
                );
                let message = format!("Restored into database '{}'", done.database_name);
                transitions.enter(&mut job, JobStatus::Completed, message, metadata);
                info!(
                    "Job completed: database '{}' in {:?} after {} attempt(s)",
                    done.database_name, done.duration, done.attempts
                );
                Ok(done)
            }
            Err(e) => self.fail(job, &mut transitions, e).await,
        }
    }

    async fn drive(
        &self,
        job: &mut BackupJob,
        transitions: &mut Transitions<'_>,
        scratch: &Path,
        cancel: &CancellationToken,
    ) -> Result<CompletedJob, PipelineError> {
        // Fetching
        checkpoint(cancel, JobStatus::Fetching)?;
        let message = format!("Fetching {}", transitions.filename);
        let mut metadata = Map::new();
        metadata.insert(
            "resource".into(),
            json!(redact_locator(&job.locator.to_string())),
        );
        transitions.enter(job, JobStatus::Fetching, message, metadata);

        let attempts = AtomicU32::new(0);
        let fetched = {
            let fetcher = &self.fetcher;
            let locator = &job.locator;
            let counter = &attempts;
            (move || async move {
                counter.fetch_add(1, Ordering::Relaxed);
                fetcher.fetch(locator, scratch).await
            })
            .retry(&self.retry_policy)
            .when(|e: &PipelineError| e.is_transient())
            .notify(|e, dur: Duration| warn!("Fetch failed, retrying in {:?}: {}", dur, e))
            .await
        };
        job.attempt_count = attempts.load(Ordering::Relaxed);
        let local_path = fetched?;

        // Extracting
        checkpoint(cancel, JobStatus::Extracting)?;
        let message = format!("Inspecting {}", redact_path(&local_path));
        transitions.enter(job, JobStatus::Extracting, message, Map::new());
        let candidates = self
            .extractor
            .extract(&local_path, &scratch.join("extract"))
            .await?;
        let candidate_count = candidates.len();
        let restore_file = candidates
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::AmbiguousArchive {
                path: local_path.clone(),
                message: "no restore candidate".into(),
                candidates: vec![],
            })?;

        // Restoring
        checkpoint(cancel, JobStatus::Restoring)?;
        let descriptor = RestoreDescriptor {
            file_path: restore_file.clone(),
            declared_name: job.target_database_name.clone(),
            fallback_name: job.locator.file_name(),
            connection: self.database.clone(),
            shared_dir: self.shared_dir.clone(),
        };
        let restore_name = redact_path(&restore_file);
        let mut metadata = Map::new();
        metadata.insert("restore_file".into(), json!(restore_name));
        metadata.insert("candidates".into(), json!(candidate_count));
        transitions.enter(
            job,
            JobStatus::Restoring,
            format!("Restoring {}", restore_name),
            metadata,
        );

        let attempts = AtomicU32::new(0);
        let restored = {
            let executor = &self.executor;
            let descriptor = &descriptor;
            let counter = &attempts;
            (move || async move {
                counter.fetch_add(1, Ordering::Relaxed);
                executor.restore(descriptor).await
            })
            .retry(&self.retry_policy)
            .when(|e: &PipelineError| e.is_transient())
            .notify(|e, dur: Duration| warn!("Restore failed, retrying in {:?}: {}", dur, e))
            .await
        };
        job.attempt_count = attempts.load(Ordering::Relaxed);
        let result = restored?;

        // Archiving. Past the restore there is no cancellation checkpoint.
        let mut metadata = Map::new();
        metadata.insert("database_name".into(), json!(result.database_name));
        let message = format!("Restore finished, archiving {}", transitions.filename);
        transitions.enter(job, JobStatus::Archiving, message, metadata);
        let disposition = match &job.locator {
            ResourceLocator::File(path) => {
                self.archiver
                    .archive(path, JobOutcome::Succeeded, job.options.archive_processed)
                    .await?
            }
            _ => Disposition::LeftInPlace,
        };

        Ok(CompletedJob {
            job_id: job.id,
            database_name: result.database_name,
            duration: result.duration,
            backup_metadata: result.backup_metadata,
            restore_file: restore_name,
            disposition,
            attempts: job.attempt_count,
        })
    }

    async fn fail(
        &self,
        mut job: BackupJob,
        transitions: &mut Transitions<'_>,
        error: PipelineError,
    ) -> JobResult {
        let failed_in = job.status;
        job.last_error = Some(error.to_string());

        let disposition = match (&job.locator, &error) {
            (_, PipelineError::Interrupted(_) | PipelineError::Archive { .. }) => {
                Disposition::LeftInPlace
            }
            (ResourceLocator::File(path), _) if path.exists() => {
                match self.archiver.archive(path, JobOutcome::Failed, false).await {
                    Ok(disposition) => disposition,
                    Err(e) => {
                        warn!("Could not quarantine {}: {}", redact_path(path), e);
                        Disposition::LeftInPlace
                    }
                }
            }
            _ => Disposition::LeftInPlace,
        };

        let mut metadata = match error.details() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        metadata.insert("failed_state".into(), json!(failed_in.as_str()));
        if let Some(path) = disposition.path() {
            metadata.insert("quarantined_path".into(), json!(path.display().to_string()));
        }
        transitions.enter(&mut job, JobStatus::Failed, error.to_string(), metadata);

        if matches!(error, PipelineError::Interrupted(_)) {
            warn!("Job interrupted in state {}: {}", failed_in, error);
        } else {
            error!("Job failed in state {}: {}", failed_in, error);
        }

        Err(FailedJob {
            job_id: job.id,
            failed_in,
            error,
            attempts: job.attempt_count,
            disposition,
        })
    }

    fn create_scratch(&self, job_id: Uuid) -> Result<TempDir, PipelineError> {
        std::fs::create_dir_all(&self.scratch_root).map_err(|e| {
            PipelineError::Configuration(format!(
                "cannot create scratch directory {}: {}",
                self.scratch_root.display(),
                e
            ))
        })?;
        tempfile::Builder::new()
            .prefix(&format!("backup-ingest-{}-", job_id.simple()))
            .tempdir_in(&self.scratch_root)
            .map_err(|e| {
                PipelineError::Configuration(format!(
                    "cannot create job scratch directory in {}: {}",
                    self.scratch_root.display(),
                    e
                ))
            })
    }

    fn release_scratch(&self, scratch: TempDir) {
        if self.keep_scratch {
            let kept = scratch.keep();
            info!("Keeping scratch directory {}", kept.display());
        } else if let Err(e) = scratch.close() {
            warn!("Failed to remove scratch directory: {}", e);
        }
    }
}

fn checkpoint(cancel: &CancellationToken, next: JobStatus) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Interrupted(next.to_string()));
    }
    Ok(())
}

/// Applies state changes to a job and reports each one exactly once.
struct Transitions<'a> {
    notifiers: &'a Notifiers,
    filename: String,
    job_id: Uuid,
    status: &'a watch::Sender<JobStatus>,
    last: Option<DateTime<Utc>>,
}

impl Transitions<'_> {
    fn enter(
        &mut self,
        job: &mut BackupJob,
        next: JobStatus,
        message: String,
        mut metadata: Map<String, Value>,
    ) {
        job.status = next;
        self.status.send_replace(next);

        metadata.insert("state".into(), json!(next.as_str()));
        metadata.insert("job_id".into(), json!(self.job_id.to_string()));
        metadata.insert("attempts".into(), json!(job.attempt_count));

        let notify_status = match next {
            JobStatus::Completed => NotifyStatus::Completed,
            JobStatus::Failed => NotifyStatus::Failed,
            _ => NotifyStatus::Processing,
        };
        let mut event = StatusEvent::new(self.filename.clone(), notify_status, message, metadata);
        // Wall clock may step backwards; events of one job never do.
        if let Some(last) = self.last {
            if event.timestamp < last {
                event.timestamp = last;
            }
        }
        self.last = Some(event.timestamp);
        self.notifiers.emit(&event);
    }
}
