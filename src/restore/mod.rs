pub(crate) mod db_restore;
pub(crate) mod metadata;
pub(crate) mod verification;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::DatabaseSettings;
use crate::errors::PipelineError;

pub use db_restore::PgRestoreExecutor;
pub use metadata::{BackupFormat, BackupMetadata};

/// Everything one restore needs. Built fresh for every job.
#[derive(Debug, Clone)]
pub struct RestoreDescriptor {
    pub file_path: PathBuf,
    /// Name requested by the caller; wins over anything found in the backup.
    pub declared_name: Option<String>,
    /// Label used when neither a declared nor a recorded name is usable,
    /// usually the original input's file name.
    pub fallback_name: String,
    pub connection: DatabaseSettings,
    /// Directory the database server can read; the file is staged there first.
    pub shared_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RestoreResult {
    pub database_name: String,
    pub duration: Duration,
    pub backup_metadata: BackupMetadata,
}

/// Drives a database server restore to completion and verifies the result.
#[async_trait]
pub trait RestoreExecutor: Send + Sync {
    async fn restore(&self, descriptor: &RestoreDescriptor) -> Result<RestoreResult, PipelineError>;
}
