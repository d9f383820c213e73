//! Directory monitor: polls the watch directory and dispatches stable files
//! to the job runner, never blocking on the jobs themselves.

pub(crate) mod registry;
pub(crate) mod scanner;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, json};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::errors::PipelineError;
use crate::fetch::ResourceLocator;
use crate::notify::{NotifyStatus, StatusEvent};
use crate::pipeline::{BackupJob, JobOptions, JobRunner, JobStatus};
use crate::utils::redact_path;

pub use registry::ProcessingRegistry;
use scanner::{Settlement, StabilityTracker, WatchedFile};

pub struct DirectoryMonitor {
    runner: Arc<JobRunner>,
    registry: ProcessingRegistry,
    watch_dir: PathBuf,
    patterns: Vec<String>,
    polling_interval: Duration,
    archive_processed: bool,
    failure_cooldown: Duration,
    shutdown_grace: Duration,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl DirectoryMonitor {
    pub fn new(config: &AppConfig, runner: Arc<JobRunner>) -> Self {
        Self {
            runner,
            registry: ProcessingRegistry::new(),
            watch_dir: config.watch_dir.clone(),
            patterns: config
                .backup
                .file_patterns
                .iter()
                .map(|p| p.to_ascii_lowercase())
                .collect(),
            polling_interval: config.polling_interval,
            archive_processed: config.backup.archive_processed,
            failure_cooldown: config.backup.failure_cooldown,
            shutdown_grace: config.backup.shutdown_grace,
            permits: Arc::new(Semaphore::new(config.backup.max_concurrent_restores.max(1))),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the monitor when cancelled. Running jobs observe it at
    /// their checkpoints.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn registry(&self) -> &ProcessingRegistry {
        &self.registry
    }

    /// Polls until [`stop`](Self::stop) is called, then waits up to the
    /// shutdown grace period for in-flight jobs.
    pub async fn start(&self) {
        info!(
            "Monitoring {} every {:?} for {}",
            self.watch_dir.display(),
            self.polling_interval,
            self.patterns.join(", ")
        );

        let (settled_tx, mut settled_rx) = mpsc::unbounded_channel::<Settlement>();
        let mut tracker = StabilityTracker::default();
        let mut listing_failed = false;
        let mut ticker = tokio::time::interval(self.polling_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let listing = match self.list().await {
                Ok(listing) => {
                    if listing_failed {
                        info!("Watch directory {} is readable again", self.watch_dir.display());
                        listing_failed = false;
                    }
                    listing
                }
                Err(message) => {
                    if !listing_failed {
                        self.report_listing_failure(&message);
                        listing_failed = true;
                    } else {
                        debug!("Watch directory still unreadable: {}", message);
                    }
                    continue;
                }
            };

            let now = Instant::now();
            for file in tracker.observe(listing) {
                if self.shutdown.is_cancelled() {
                    break;
                }
                if self.registry.contains(&file.path) {
                    continue;
                }
                // A job sends its settlement before releasing its registration,
                // so once the path is free its settlement is already queued.
                while let Ok(settlement) = settled_rx.try_recv() {
                    tracker.settle(settlement, Instant::now());
                }
                if tracker.is_settled(&file, now, self.failure_cooldown) {
                    continue;
                }
                let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                    debug!("All restore slots busy; remaining files wait for the next poll");
                    break;
                };
                self.dispatch(file, permit, settled_tx.clone());
            }
        }

        self.drain().await;
    }

    async fn list(&self) -> Result<Vec<WatchedFile>, String> {
        let dir = self.watch_dir.clone();
        let patterns = self.patterns.clone();
        match tokio::task::spawn_blocking(move || scanner::list_candidates(&dir, &patterns)).await
        {
            Ok(Ok(listing)) => Ok(listing),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("listing task failed: {}", e)),
        }
    }

    fn report_listing_failure(&self, message: &str) {
        warn!(
            "Cannot list watch directory {}: {}",
            self.watch_dir.display(),
            message
        );
        let mut metadata = Map::new();
        metadata.insert("code".into(), json!("InfrastructureError"));
        metadata.insert("error".into(), json!(message));
        metadata.insert("watch_dir".into(), json!(self.watch_dir.display().to_string()));
        self.runner.notifiers().emit(&StatusEvent::new(
            self.watch_dir.display().to_string(),
            NotifyStatus::Failed,
            format!("Cannot list watch directory: {}", message),
            metadata,
        ));
    }

    fn dispatch(
        &self,
        file: WatchedFile,
        permit: OwnedSemaphorePermit,
        settled_tx: mpsc::UnboundedSender<Settlement>,
    ) {
        let (status_tx, status_rx) = watch::channel(JobStatus::Pending);
        let job = BackupJob::new(
            ResourceLocator::File(file.path.clone()),
            None,
            JobOptions {
                archive_processed: self.archive_processed,
            },
        );
        let Some(registration) = self.registry.try_register(&file.path, job.id, status_rx) else {
            return;
        };
        info!("Dispatching {} as job {}", redact_path(&file.path), job.id);

        let runner = Arc::clone(&self.runner);
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let result = runner.run(job, &shutdown, &status_tx).await;
            let interrupted = matches!(
                &result,
                Err(failed) if matches!(failed.error, PipelineError::Interrupted(_))
            );
            if !interrupted {
                let _ = settled_tx.send(Settlement {
                    path: file.path,
                    fingerprint: file.fingerprint,
                    succeeded: result.is_ok(),
                });
            }
            drop(registration);
            drop(permit);
        });
    }

    async fn drain(&self) {
        self.tasks.close();
        let in_flight = self.registry.len();
        if in_flight == 0 {
            info!("Monitor stopped, no jobs in flight");
            return;
        }
        info!(
            "Monitor stopping, waiting up to {:?} for {} in-flight job(s)",
            self.shutdown_grace, in_flight
        );
        if tokio::time::timeout(self.shutdown_grace, self.tasks.wait())
            .await
            .is_ok()
        {
            info!("All in-flight jobs finished");
            return;
        }

        for job in self.registry.snapshot() {
            if job.status == JobStatus::Restoring {
                error!(
                    job_id = %job.job_id,
                    file = %redact_path(&job.path),
                    running_for = ?job.started.elapsed(),
                    "Unresolved job: shutdown grace period expired during restore; verify the target database before reprocessing"
                );
            } else {
                warn!(
                    job_id = %job.job_id,
                    file = %redact_path(&job.path),
                    "Job still {} when the shutdown grace period expired",
                    job.status
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notifiers;
    use crate::notify::tests::RecordingNotifier;
    use crate::pipeline::logic::tests::{FakeExecutor, test_config};
    use crate::restore::{
        BackupFormat, BackupMetadata, RestoreDescriptor, RestoreExecutor, RestoreResult,
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        monitor: Arc<DirectoryMonitor>,
        recorder: RecordingNotifier,
        watch: tempfile::TempDir,
        _scratch: tempfile::TempDir,
    }

    fn fixture(executor: Arc<dyn RestoreExecutor>, overrides: &[(&str, &str)]) -> Fixture {
        let watch = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let watch_dir = watch.path().display().to_string();
        let mut vars = vec![
            ("BACKUP_WATCH_DIR", watch_dir.as_str()),
            ("BACKUP_POLLING_INTERVAL", "0.02"),
            ("BACKUP_SHUTDOWN_GRACE", "2"),
        ];
        vars.extend_from_slice(overrides);
        let config = test_config(scratch.path(), &vars);
        let recorder = RecordingNotifier::default();
        let runner =
            JobRunner::new(&config, executor, Notifiers::new().with(recorder.clone())).unwrap();
        Fixture {
            monitor: Arc::new(DirectoryMonitor::new(&config, Arc::new(runner))),
            recorder,
            watch,
            _scratch: scratch,
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    fn archived_count(dir: &Path) -> usize {
        std::fs::read_dir(dir.join("archived"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_stable_file_is_restored_and_archived_once() {
        let executor = Arc::new(FakeExecutor::succeeding());
        let f = fixture(executor.clone(), &[]);
        std::fs::write(f.watch.path().join("sales.dat"), b"SELECT 1;").unwrap();

        let monitor = Arc::clone(&f.monitor);
        let handle = tokio::spawn(async move { monitor.start().await });

        assert!(wait_for(|| archived_count(f.watch.path()) == 1).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.monitor.stop();
        handle.await.unwrap();

        assert_eq!(executor.call_count(), 1);
        assert!(!f.watch.path().join("sales.dat").exists());
        let statuses: Vec<_> = f.recorder.snapshot().iter().map(|e| e.status).collect();
        assert_eq!(statuses.last(), Some(&NotifyStatus::Completed));
    }

    #[tokio::test]
    async fn test_file_in_flight_is_not_dispatched_twice() {
        let executor = Arc::new(FakeExecutor::succeeding().delayed(Duration::from_millis(400)));
        let f = fixture(executor.clone(), &[("BACKUP_ARCHIVE_PROCESSED", "false")]);
        std::fs::write(f.watch.path().join("slow.dat"), b"SELECT 1;").unwrap();

        let monitor = Arc::clone(&f.monitor);
        let handle = tokio::spawn(async move { monitor.start().await });

        assert!(wait_for(|| f.monitor.registry().len() == 1).await);
        // Many poll cycles pass while the job is restoring.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(executor.call_count(), 1);

        assert!(wait_for(|| f.monitor.registry().is_empty()).await);
        // Unchanged and already restored: left alone.
        tokio::time::sleep(Duration::from_millis(150)).await;
        f.monitor.stop();
        handle.await.unwrap();
        assert_eq!(executor.call_count(), 1);
    }

    struct ConcurrencyGauge {
        current: AtomicUsize,
        peak: AtomicUsize,
        total: AtomicUsize,
    }

    #[async_trait]
    impl RestoreExecutor for ConcurrencyGauge {
        async fn restore(
            &self,
            descriptor: &RestoreDescriptor,
        ) -> Result<RestoreResult, PipelineError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(80)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.total.fetch_add(1, Ordering::SeqCst);
            Ok(RestoreResult {
                database_name: descriptor.fallback_name.replace('.', "_"),
                duration: Duration::from_millis(80),
                backup_metadata: BackupMetadata::new(BackupFormat::PlainSql, 1),
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_unchanged_files_are_restored_once_under_fast_polling() {
        let executor = Arc::new(FakeExecutor::succeeding().delayed(Duration::from_millis(3)));
        let f = fixture(
            executor.clone(),
            &[
                ("BACKUP_ARCHIVE_PROCESSED", "false"),
                ("BACKUP_POLLING_INTERVAL", "0.001"),
                ("BACKUP_MAX_CONCURRENT_RESTORES", "4"),
            ],
        );
        for i in 0..20 {
            std::fs::write(f.watch.path().join(format!("db{:02}.dat", i)), b"SELECT 1;").unwrap();
        }
        for i in 0..200 {
            std::fs::write(f.watch.path().join(format!("noise{}.txt", i)), b"x").unwrap();
        }

        let monitor = Arc::clone(&f.monitor);
        let handle = tokio::spawn(async move { monitor.start().await });

        assert!(wait_for(|| executor.call_count() >= 20).await);
        // Keep polling well past the last completion.
        tokio::time::sleep(Duration::from_millis(500)).await;
        f.monitor.stop();
        handle.await.unwrap();

        assert_eq!(executor.call_count(), 20);
        let mut seen: Vec<String> = executor
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.fallback_name.clone())
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn test_concurrent_restores_are_capped() {
        let gauge = Arc::new(ConcurrencyGauge {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        });
        let f = fixture(gauge.clone(), &[("BACKUP_MAX_CONCURRENT_RESTORES", "2")]);
        for name in ["a.dat", "b.dat", "c.dat", "d.dat", "e.dat"] {
            std::fs::write(f.watch.path().join(name), b"SELECT 1;").unwrap();
        }

        let monitor = Arc::clone(&f.monitor);
        let handle = tokio::spawn(async move { monitor.start().await });

        assert!(wait_for(|| archived_count(f.watch.path()) == 5).await);
        f.monitor.stop();
        handle.await.unwrap();

        assert_eq!(gauge.total.load(Ordering::SeqCst), 5);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_failed_file_waits_for_change_before_retry() {
        let executor = Arc::new(FakeExecutor::with(|call, _| {
            if call == 1 {
                Err(PipelineError::restore("db", "syntax error at or near", false))
            } else {
                Ok(())
            }
        }));
        let f = fixture(executor.clone(), &[("BACKUP_FAILURE_COOLDOWN", "300")]);
        let path = f.watch.path().join("broken.sql");
        std::fs::write(&path, b"SELEC 1;").unwrap();

        let monitor = Arc::clone(&f.monitor);
        let handle = tokio::spawn(async move { monitor.start().await });

        assert!(wait_for(|| executor.call_count() == 1 && f.monitor.registry().is_empty()).await);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(executor.call_count(), 1);
        assert!(path.exists());

        // A corrected upload replaces the file.
        std::fs::write(&path, b"SELECT 1; -- fixed").unwrap();
        assert!(wait_for(|| archived_count(f.watch.path()) == 1).await);
        f.monitor.stop();
        handle.await.unwrap();
        assert_eq!(executor.call_count(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_directory_is_reported_and_polling_continues() {
        let executor = Arc::new(FakeExecutor::succeeding());
        let f = fixture(executor.clone(), &[]);
        let watch_root = f.watch.path().to_path_buf();
        std::fs::remove_dir(&watch_root).unwrap();

        let monitor = Arc::clone(&f.monitor);
        let handle = tokio::spawn(async move { monitor.start().await });

        assert!(
            wait_for(|| f
                .recorder
                .snapshot()
                .iter()
                .any(|e| e.status == NotifyStatus::Failed
                    && e.metadata["code"] == "InfrastructureError"))
            .await
        );

        std::fs::create_dir(&watch_root).unwrap();
        std::fs::write(watch_root.join("late.dat"), b"SELECT 1;").unwrap();
        assert!(wait_for(|| executor.call_count() == 1).await);

        f.monitor.stop();
        handle.await.unwrap();
        let infra_events = f
            .recorder
            .snapshot()
            .iter()
            .filter(|e| e.metadata.get("code").is_some_and(|c| *c == "InfrastructureError"))
            .count();
        assert_eq!(infra_events, 1);
    }

    #[tokio::test]
    async fn test_stop_waits_for_job_in_flight() {
        let executor = Arc::new(FakeExecutor::succeeding().delayed(Duration::from_millis(300)));
        let f = fixture(executor.clone(), &[]);
        std::fs::write(f.watch.path().join("long.dat"), b"SELECT 1;").unwrap();

        let monitor = Arc::clone(&f.monitor);
        let handle = tokio::spawn(async move { monitor.start().await });

        assert!(wait_for(|| executor.call_count() == 1).await);
        f.monitor.stop();
        handle.await.unwrap();

        // The restore was past its last checkpoint, so it ran through archiving.
        assert!(f.monitor.registry().is_empty());
        assert_eq!(archived_count(f.watch.path()), 1);
    }

    #[tokio::test]
    async fn test_grace_period_bounds_shutdown() {
        let executor = Arc::new(FakeExecutor::succeeding().delayed(Duration::from_secs(30)));
        let f = fixture(executor.clone(), &[("BACKUP_SHUTDOWN_GRACE", "0.1")]);
        std::fs::write(f.watch.path().join("huge.dat"), b"SELECT 1;").unwrap();

        let monitor = Arc::clone(&f.monitor);
        let handle = tokio::spawn(async move { monitor.start().await });

        assert!(wait_for(|| executor.call_count() == 1).await);
        let stopped_at = Instant::now();
        f.monitor.stop();
        handle.await.unwrap();

        assert!(stopped_at.elapsed() < Duration::from_secs(5));
        let unresolved = f.monitor.registry().snapshot();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].status, JobStatus::Restoring);
    }
}
