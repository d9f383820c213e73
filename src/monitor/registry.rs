use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::watch;
use uuid::Uuid;

use crate::pipeline::JobStatus;

#[derive(Debug)]
struct InFlight {
    job_id: Uuid,
    status: watch::Receiver<JobStatus>,
    started: Instant,
}

/// Snapshot of one in-flight job.
#[derive(Debug, Clone)]
pub struct InFlightJob {
    pub path: PathBuf,
    pub job_id: Uuid,
    pub status: JobStatus,
    pub started: Instant,
}

/// Paths with a job in flight. A path is present at most once; the entry
/// lives exactly as long as its [`Registration`].
#[derive(Debug, Clone, Default)]
pub struct ProcessingRegistry {
    inner: Arc<Mutex<HashMap<PathBuf, InFlight>>>,
}

impl ProcessingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PathBuf, InFlight>> {
        // Entries stay consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims `path` for a job. Returns `None` if another job already holds it.
    pub fn try_register(
        &self,
        path: &Path,
        job_id: Uuid,
        status: watch::Receiver<JobStatus>,
    ) -> Option<Registration> {
        let mut entries = self.entries();
        if entries.contains_key(path) {
            return None;
        }
        entries.insert(
            path.to_path_buf(),
            InFlight {
                job_id,
                status,
                started: Instant::now(),
            },
        );
        Some(Registration {
            registry: self.clone(),
            path: path.to_path_buf(),
        })
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn snapshot(&self) -> Vec<InFlightJob> {
        self.entries()
            .iter()
            .map(|(path, entry)| InFlightJob {
                path: path.clone(),
                job_id: entry.job_id,
                status: *entry.status.borrow(),
                started: entry.started,
            })
            .collect()
    }
}

/// Removes its path from the registry when dropped, whatever the job's outcome.
#[derive(Debug)]
pub struct Registration {
    registry: ProcessingRegistry,
    path: PathBuf,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.entries().remove(&self.path);
    }
}
