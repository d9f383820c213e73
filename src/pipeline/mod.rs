pub(crate) mod logic;

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::archiver::Disposition;
use crate::errors::PipelineError;
use crate::fetch::ResourceLocator;
use crate::restore::BackupMetadata;

pub use logic::JobRunner;

/// Lifecycle of one backup job. `Failed` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Fetching,
    Extracting,
    Restoring,
    Archiving,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Fetching => "fetching",
            JobStatus::Extracting => "extracting",
            JobStatus::Restoring => "restoring",
            JobStatus::Archiving => "archiving",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    /// Move the input into `archived/` after a successful restore.
    pub archive_processed: bool,
}

/// One unit of work, owned by the runner executing it.
#[derive(Debug)]
pub struct BackupJob {
    pub id: Uuid,
    pub locator: ResourceLocator,
    pub target_database_name: Option<String>,
    pub options: JobOptions,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
}

impl BackupJob {
    pub fn new(
        locator: ResourceLocator,
        target_database_name: Option<String>,
        options: JobOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            locator,
            target_database_name: target_database_name.filter(|n| !n.trim().is_empty()),
            options,
            status: JobStatus::Pending,
            attempt_count: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletedJob {
    pub job_id: Uuid,
    pub database_name: String,
    pub duration: Duration,
    pub backup_metadata: BackupMetadata,
    /// Name of the file that was handed to the restore executor.
    pub restore_file: String,
    pub disposition: Disposition,
    pub attempts: u32,
}

#[derive(Debug)]
pub struct FailedJob {
    pub job_id: Uuid,
    /// State the job was in when it failed.
    pub failed_in: JobStatus,
    pub error: PipelineError,
    pub attempts: u32,
    pub disposition: Disposition,
}

pub type JobResult = Result<CompletedJob, FailedJob>;

