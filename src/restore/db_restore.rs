// backup-ingest/src/restore/db_restore.rs
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::metadata::{self, BackupFormat, BackupMetadata, SqlHeaderScanner};
use super::{RestoreDescriptor, RestoreExecutor, RestoreResult, verification};
use crate::config::{DatabaseSettings, ExistingDatabasePolicy};
use crate::errors::PipelineError;
use crate::utils::find_pg_tool;

const SYSTEM_DATABASES: &[&str] = &["postgres", "template0", "template1"];

const DISK_FULL_MARKERS: &[&str] = &["no space left on device", "could not extend file", "disk full"];

const TRANSIENT_MARKERS: &[&str] = &[
    "could not connect",
    "connection refused",
    "server closed the connection",
    "timeout expired",
    "connection to server",
    "the database system is starting up",
    "the database system is shutting down",
    "too many clients",
];

/// Restores PostgreSQL dumps with the client tools and manages the target
/// database through a shared admin pool.
pub struct PgRestoreExecutor {
    admin_pool: PgPool,
    scanner: SqlHeaderScanner,
}

impl PgRestoreExecutor {
    /// The pool connects lazily and never holds more than `max_connections`.
    pub fn new(settings: &DatabaseSettings, max_connections: u32) -> Result<Self, PipelineError> {
        let scanner = SqlHeaderScanner::new()
            .map_err(|e| PipelineError::Configuration(format!("SQL header patterns: {}", e)))?;
        let admin_pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(settings.connect_timeout)
            .connect_lazy_with(connect_options(settings));
        Ok(Self {
            admin_pool,
            scanner,
        })
    }

    async fn inspect(
        &self,
        path: &Path,
        settings: &DatabaseSettings,
        label: &str,
    ) -> Result<BackupMetadata, PipelineError> {
        let size_bytes = tokio::fs::metadata(path)
            .await
            .map_err(|e| {
                PipelineError::restore(label, format!("cannot read {}: {}", path.display(), e), false)
            })?
            .len();
        if size_bytes == 0 {
            return Err(PipelineError::restore(
                label,
                format!("Backup file is empty: {}", path.display()),
                false,
            ));
        }
        let format = metadata::detect_format(path)
            .map_err(|e| {
                PipelineError::restore(label, format!("cannot read {}: {}", path.display(), e), false)
            })?
            .ok_or_else(|| {
                PipelineError::restore(
                    label,
                    format!(
                        "{} is neither a PostgreSQL custom-format dump nor an SQL script",
                        path.display()
                    ),
                    false,
                )
            })?;

        let mut backup_metadata = BackupMetadata::new(format, size_bytes);
        match format {
            BackupFormat::Custom => {
                let pg_restore = find_pg_tool("pg_restore")?;
                let mut cmd = Command::new(pg_restore);
                cmd.arg("--list").arg(path);
                let output = run_tool(cmd, "pg_restore --list", label, settings.connect_timeout).await?;
                if !output.status.success() {
                    return Err(PipelineError::restore(
                        label,
                        format!(
                            "pg_restore cannot read archive: {}",
                            String::from_utf8_lossy(&output.stderr).trim()
                        ),
                        false,
                    ));
                }
                metadata::parse_restore_list(&String::from_utf8_lossy(&output.stdout), &mut backup_metadata);
            }
            BackupFormat::PlainSql => {
                self.scanner.scan_file(path, &mut backup_metadata).map_err(|e| {
                    PipelineError::restore(label, format!("cannot read {}: {}", path.display(), e), false)
                })?;
            }
        }
        debug!("Backup metadata for {}: {:?}", path.display(), backup_metadata);
        Ok(backup_metadata)
    }

    /// Makes sure an empty target database exists, honouring the existing-database policy.
    async fn prepare_target(
        &self,
        database: &str,
        settings: &DatabaseSettings,
    ) -> Result<(), PipelineError> {
        let db_exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(database)
                .fetch_one(&self.admin_pool)
                .await
                .map_err(|e| sql_failure(database, "check existence of database", e))?;

        if db_exists {
            match settings.existing_database {
                ExistingDatabasePolicy::Reject => {
                    return Err(PipelineError::restore(
                        database,
                        "database already exists and the existing-database policy is 'reject'",
                        false,
                    ));
                }
                ExistingDatabasePolicy::Overwrite => {
                    info!("Database '{}' already exists, dropping it before restore", database);
                    self.drop_database(database).await?;
                }
            }
        }

        sqlx::query(&format!(
            "CREATE DATABASE {} OWNER {}",
            quote_ident(database),
            quote_ident(&settings.user)
        ))
        .execute(&self.admin_pool)
        .await
        .map_err(|e| sql_failure(database, "create database", e))?;
        info!("Database '{}' created", database);
        Ok(())
    }

    async fn drop_database(&self, database: &str) -> Result<(), PipelineError> {
        sqlx::query(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(database)
        .execute(&self.admin_pool)
        .await
        .map_err(|e| sql_failure(database, "terminate connections to database", e))?;

        sqlx::query(&format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", quote_ident(database)))
            .execute(&self.admin_pool)
            .await
            .map_err(|e| sql_failure(database, "drop database", e))?;
        Ok(())
    }

    /// Removes a target the restore tool left half-populated, so a retry starts clean.
    async fn discard_target(&self, database: &str) {
        match self.drop_database(database).await {
            Ok(()) => info!("Dropped partially restored database '{}'", database),
            Err(e) => warn!("Could not drop partially restored database '{}': {}", database, e),
        }
    }
}

#[async_trait]
impl RestoreExecutor for PgRestoreExecutor {
    async fn restore(&self, descriptor: &RestoreDescriptor) -> Result<RestoreResult, PipelineError> {
        let started = Instant::now();
        let settings = &descriptor.connection;

        let mut backup_metadata = self
            .inspect(&descriptor.file_path, settings, &descriptor.fallback_name)
            .await?;
        let database = metadata::resolve_database_name(
            descriptor.declared_name.as_deref(),
            backup_metadata
                .source_database
                .as_deref()
                .filter(|name| !is_system_database(name, settings)),
            &descriptor.fallback_name,
        );
        guard_system_database(&database, settings)?;

        let staged = StagedFile::prepare(&descriptor.file_path, descriptor.shared_dir.as_deref())
            .await
            .map_err(|e| {
                PipelineError::restore(&database, format!("cannot stage backup file: {}", e), false)
            })?;

        info!(
            "Restoring {:?} backup into database '{}' ({} bytes)",
            backup_metadata.format, database, backup_metadata.size_bytes
        );
        self.prepare_target(&database, settings).await?;

        if let Err(e) = restore_with_tool(backup_metadata.format, staged.path(), &database, settings).await {
            // After a timeout the killed session is rolled back by the server itself.
            if !matches!(e, PipelineError::Timeout { .. }) {
                self.discard_target(&database).await;
            }
            return Err(e);
        }
        drop(staged);

        let tables = verification::wait_until_online(
            &self.admin_pool,
            &connect_options(settings),
            &database,
            settings.verify_timeout,
        )
        .await?;
        backup_metadata.public_tables = Some(tables);

        Ok(RestoreResult {
            database_name: database,
            duration: started.elapsed(),
            backup_metadata,
        })
    }
}

fn connect_options(settings: &DatabaseSettings) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(&settings.host)
        .port(settings.port)
        .username(&settings.user)
        .password(&settings.password)
        .database(&settings.maintenance_database)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_system_database(database: &str, settings: &DatabaseSettings) -> bool {
    SYSTEM_DATABASES
        .iter()
        .any(|name| database.eq_ignore_ascii_case(name))
        || database.eq_ignore_ascii_case(&settings.maintenance_database)
}

fn guard_system_database(database: &str, settings: &DatabaseSettings) -> Result<(), PipelineError> {
    if is_system_database(database, settings) {
        return Err(PipelineError::restore(
            database,
            "refusing to restore over a system or maintenance database",
            false,
        ));
    }
    Ok(())
}

async fn restore_with_tool(
    format: BackupFormat,
    path: &Path,
    database: &str,
    settings: &DatabaseSettings,
) -> Result<(), PipelineError> {
    let (tool, mut cmd) = match format {
        BackupFormat::Custom => {
            let mut cmd = Command::new(find_pg_tool("pg_restore")?);
            cmd.arg("--no-owner")
                .arg("--no-acl")
                .arg("--single-transaction")
                .arg("--host")
                .arg(&settings.host)
                .arg("--port")
                .arg(settings.port.to_string())
                .arg("--username")
                .arg(&settings.user)
                .arg("--dbname")
                .arg(database)
                .arg(path);
            ("pg_restore", cmd)
        }
        BackupFormat::PlainSql => {
            let mut cmd = Command::new(find_pg_tool("psql")?);
            cmd.arg("-X") // Do not read psqlrc
                .arg("-q")
                .arg("-v")
                .arg("ON_ERROR_STOP=1")
                .arg("-h")
                .arg(&settings.host)
                .arg("-p")
                .arg(settings.port.to_string())
                .arg("-U")
                .arg(&settings.user)
                .arg("-d")
                .arg(database)
                .arg("-f")
                .arg(path);
            ("psql", cmd)
        }
    };
    cmd.env("PGPASSWORD", &settings.password)
        .env("PGCONNECT_TIMEOUT", settings.connect_timeout.as_secs().max(1).to_string());

    let output = run_tool(cmd, tool, database, settings.restore_timeout).await?;
    if output.status.success() {
        debug!("{} finished restoring '{}'", tool, database);
        return Ok(());
    }
    Err(classify_tool_failure(
        database,
        tool,
        &output.status.to_string(),
        &String::from_utf8_lossy(&output.stderr),
    ))
}

/// Runs a client tool with a deadline; the child is killed if the deadline passes.
async fn run_tool(
    mut cmd: Command,
    tool: &str,
    database: &str,
    deadline: std::time::Duration,
) -> Result<std::process::Output, PipelineError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    tokio::time::timeout(deadline, cmd.output())
        .await
        .map_err(|_| PipelineError::Timeout {
            operation: format!("{} for database '{}'", tool, database),
            after: deadline,
        })?
        .map_err(|e| PipelineError::restore(database, format!("failed to execute {}: {}", tool, e), false))
}

/// True when the diagnostic points at a condition that may clear on its own.
pub(crate) fn is_transient_diagnostic(diagnostic: &str) -> bool {
    let lowered = diagnostic.to_ascii_lowercase();
    if DISK_FULL_MARKERS.iter().any(|m| lowered.contains(m)) {
        return false;
    }
    TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m))
}

fn classify_tool_failure(database: &str, tool: &str, status: &str, stderr: &str) -> PipelineError {
    let stderr = stderr.trim();
    let lowered = stderr.to_ascii_lowercase();
    let message = if DISK_FULL_MARKERS.iter().any(|m| lowered.contains(m)) {
        format!("insufficient disk space on the database server ({}): {}", tool, stderr)
    } else {
        format!("{} exited with {}: {}", tool, status, stderr)
    };
    PipelineError::restore(database, message, is_transient_diagnostic(stderr))
}

fn sql_failure(database: &str, action: &str, e: sqlx::Error) -> PipelineError {
    let transient = matches!(e, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
        || is_transient_diagnostic(&e.to_string());
    PipelineError::restore(database, format!("failed to {}: {}", action, e), transient)
}

/// A copy of the backup inside the shared directory, removed on drop.
struct StagedFile {
    path: PathBuf,
    owned: bool,
}

impl StagedFile {
    async fn prepare(source: &Path, shared_dir: Option<&Path>) -> std::io::Result<Self> {
        let Some(shared_dir) = shared_dir else {
            return Ok(Self {
                path: source.to_path_buf(),
                owned: false,
            });
        };
        if source.starts_with(shared_dir) {
            return Ok(Self {
                path: source.to_path_buf(),
                owned: false,
            });
        }
        tokio::fs::create_dir_all(shared_dir).await?;
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "backup".into());
        let path = shared_dir.join(format!("{}_{}", uuid::Uuid::new_v4().simple(), file_name));
        tokio::fs::copy(source, &path).await?;
        debug!("Staged {} as {}", source.display(), path.display());
        Ok(Self { path, owned: true })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.owned {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to remove staged file {}: {}", self.path.display(), e);
            }
        }
    }
}
