// backup-ingest/src/config/mod.rs
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[cfg(test)]
use figment::providers::Serialized;
use figment::{Figment, providers::Env};
use serde::{Deserialize, Deserializer, de};
use serde_json::Value;

use crate::errors::PipelineError;

const DEFAULT_WATCH_DIR: &str = "/data/backups";
const DEFAULT_FILE_PATTERNS: &[&str] = &[
    ".rar", ".zip", ".tar.gz", ".tgz", ".gz", ".7z", ".dat", ".dump", ".backup", ".bak", ".sql",
];
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// What to do when the restore target already exists on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingDatabasePolicy {
    Overwrite,
    Reject,
}

impl FromStr for ExistingDatabasePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "overwrite" | "replace" => Ok(Self::Overwrite),
            "reject" => Ok(Self::Reject),
            other => Err(format!("expected 'overwrite' or 'reject', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub maintenance_database: String,
    pub connect_timeout: Duration,
    pub restore_timeout: Duration,
    pub verify_timeout: Duration,
    pub existing_database: ExistingDatabasePolicy,
}

/// Overrides for the object store client. Anything left unset falls back to the
/// default AWS provider chain.
#[derive(Debug, Clone, Default)]
pub struct ObjectStoreSettings {
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub http_timeout: Duration,
    pub max_download_bytes: u64,
    pub object_store: ObjectStoreSettings,
}

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub shared_dir: Option<PathBuf>,
    pub scratch_dir: PathBuf,
    pub file_patterns: Vec<String>,
    pub archive_processed: bool,
    pub quarantine_failed: bool,
    /// Total attempts for transient fetch/restore failures, first try included.
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub max_concurrent_restores: usize,
    pub shutdown_grace: Duration,
    pub failure_cooldown: Duration,
    pub keep_scratch: bool,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub watch_dir: PathBuf,
    pub polling_interval: Duration,
    pub database: DatabaseSettings,
    pub backup: BackupSettings,
    pub fetch: FetchSettings,
    pub logging: LoggingSettings,
}

/// Raw settings as read from the environment. Every field is optional so a
/// blank value reads the same as an unset one.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EnvVars {
    #[serde(deserialize_with = "lax")]
    backup_watch_dir: Option<PathBuf>,
    #[serde(deserialize_with = "lax")]
    backup_polling_interval: Option<Seconds>,

    #[serde(deserialize_with = "lax")]
    db_host: Option<String>,
    #[serde(deserialize_with = "lax")]
    db_port: Option<u16>,
    #[serde(deserialize_with = "lax")]
    db_user: Option<String>,
    #[serde(deserialize_with = "lax")]
    db_password: Option<String>,
    #[serde(deserialize_with = "lax")]
    db_maintenance_database: Option<String>,
    #[serde(deserialize_with = "lax")]
    db_connect_timeout: Option<Seconds>,
    #[serde(deserialize_with = "lax")]
    db_restore_timeout: Option<Seconds>,
    #[serde(deserialize_with = "lax")]
    db_verify_timeout: Option<Seconds>,
    #[serde(deserialize_with = "lax")]
    db_existing_database: Option<ExistingDatabasePolicy>,

    #[serde(deserialize_with = "lax")]
    backup_shared_dir: Option<PathBuf>,
    #[serde(deserialize_with = "lax")]
    backup_scratch_dir: Option<PathBuf>,
    #[serde(deserialize_with = "lax")]
    backup_file_patterns: Option<String>,
    #[serde(deserialize_with = "lax")]
    backup_archive_processed: Option<Flag>,
    #[serde(deserialize_with = "lax")]
    backup_quarantine_failed: Option<Flag>,
    #[serde(deserialize_with = "lax")]
    backup_retry_attempts: Option<u32>,
    #[serde(deserialize_with = "lax")]
    backup_retry_delay: Option<Seconds>,
    #[serde(deserialize_with = "lax")]
    backup_max_concurrent_restores: Option<usize>,
    #[serde(deserialize_with = "lax")]
    backup_shutdown_grace: Option<Seconds>,
    #[serde(deserialize_with = "lax")]
    backup_failure_cooldown: Option<Seconds>,
    #[serde(deserialize_with = "lax")]
    backup_keep_scratch: Option<Flag>,

    #[serde(deserialize_with = "lax")]
    fetch_http_timeout: Option<Seconds>,
    #[serde(deserialize_with = "lax")]
    fetch_max_download_bytes: Option<u64>,
    #[serde(deserialize_with = "lax")]
    s3_endpoint_url: Option<String>,
    #[serde(deserialize_with = "lax")]
    s3_region: Option<String>,
    #[serde(deserialize_with = "lax")]
    s3_access_key_id: Option<String>,
    #[serde(deserialize_with = "lax")]
    s3_secret_access_key: Option<String>,

    #[serde(deserialize_with = "lax")]
    log_level: Option<String>,
    #[serde(deserialize_with = "lax")]
    log_json: Option<Flag>,
}

impl AppConfig {
    /// Environment variables map to settings in UPPER_SNAKE_CASE.
    pub fn figment() -> Figment {
        Figment::new().merge(Env::raw())
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_figment(Self::figment())
    }

    pub fn from_figment(figment: Figment) -> Result<Self, PipelineError> {
        let vars: EnvVars = figment
            .extract()
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;
        Self::validate(vars)
    }

    /// Builds a configuration from explicit `NAME=value` pairs instead of the
    /// process environment.
    #[cfg(test)]
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, PipelineError> {
        let vars: std::collections::HashMap<String, String> = pairs
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
            .collect();
        Self::from_figment(Figment::from(Serialized::defaults(vars)))
    }

    fn validate(vars: EnvVars) -> Result<Self, PipelineError> {
        let password = vars
            .db_password
            .ok_or_else(|| PipelineError::Configuration("DB_PASSWORD must be set".into()))?;

        let database = DatabaseSettings {
            host: vars.db_host.unwrap_or_else(|| "localhost".into()),
            port: vars.db_port.unwrap_or(5432),
            user: vars.db_user.unwrap_or_else(|| "postgres".into()),
            password,
            maintenance_database: vars
                .db_maintenance_database
                .unwrap_or_else(|| "postgres".into()),
            connect_timeout: seconds_or(vars.db_connect_timeout, 60),
            restore_timeout: seconds_or(vars.db_restore_timeout, 3600),
            verify_timeout: seconds_or(vars.db_verify_timeout, 300),
            existing_database: vars
                .db_existing_database
                .unwrap_or(ExistingDatabasePolicy::Overwrite),
        };

        let file_patterns = match vars.backup_file_patterns {
            Some(raw) => raw
                .split(',')
                .map(|p| p.trim().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>(),
            None => DEFAULT_FILE_PATTERNS.iter().map(|p| p.to_string()).collect(),
        };
        if file_patterns.is_empty() {
            return Err(PipelineError::Configuration(
                "BACKUP_FILE_PATTERNS cannot be empty".into(),
            ));
        }

        let retry_attempts = vars.backup_retry_attempts.unwrap_or(3);
        if retry_attempts == 0 {
            return Err(PipelineError::Configuration(
                "BACKUP_RETRY_ATTEMPTS must be at least 1".into(),
            ));
        }
        let max_concurrent_restores = vars.backup_max_concurrent_restores.unwrap_or(2);
        if max_concurrent_restores == 0 {
            return Err(PipelineError::Configuration(
                "BACKUP_MAX_CONCURRENT_RESTORES must be at least 1".into(),
            ));
        }

        let backup = BackupSettings {
            shared_dir: vars.backup_shared_dir,
            scratch_dir: vars.backup_scratch_dir.unwrap_or_else(env::temp_dir),
            file_patterns,
            archive_processed: flag_or(vars.backup_archive_processed, true),
            quarantine_failed: flag_or(vars.backup_quarantine_failed, false),
            retry_attempts,
            retry_delay: seconds_or(vars.backup_retry_delay, 5),
            max_concurrent_restores,
            shutdown_grace: seconds_or(vars.backup_shutdown_grace, 30),
            failure_cooldown: seconds_or(vars.backup_failure_cooldown, 300),
            keep_scratch: flag_or(vars.backup_keep_scratch, false),
        };

        let fetch = FetchSettings {
            http_timeout: seconds_or(vars.fetch_http_timeout, 600),
            max_download_bytes: vars
                .fetch_max_download_bytes
                .unwrap_or(100 * 1024 * 1024 * 1024),
            object_store: ObjectStoreSettings {
                endpoint_url: vars.s3_endpoint_url,
                region: vars.s3_region,
                access_key_id: vars.s3_access_key_id,
                secret_access_key: vars.s3_secret_access_key,
            },
        };

        let level = vars
            .log_level
            .unwrap_or_else(|| "info".into())
            .to_ascii_lowercase();
        let level = match level.as_str() {
            "warning" => "warn".to_string(),
            "critical" => "error".to_string(),
            _ => level,
        };
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(PipelineError::Configuration(format!(
                "LOG_LEVEL must be one of: {}",
                LOG_LEVELS.join(", ")
            )));
        }

        let polling_interval = seconds_or(vars.backup_polling_interval, 1);
        if polling_interval.is_zero() {
            return Err(PipelineError::Configuration(
                "BACKUP_POLLING_INTERVAL must be greater than zero".into(),
            ));
        }

        Ok(AppConfig {
            watch_dir: vars
                .backup_watch_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WATCH_DIR)),
            polling_interval,
            database,
            backup,
            fetch,
            logging: LoggingSettings {
                level,
                json: flag_or(vars.log_json, false),
            },
        })
    }
}

fn seconds_or(value: Option<Seconds>, default_secs: u64) -> Duration {
    value.map_or(Duration::from_secs(default_secs), |s| s.0)
}

fn flag_or(value: Option<Flag>, default: bool) -> bool {
    value.map_or(default, |f| f.0)
}

/// A duration given as (possibly fractional) seconds.
#[derive(Debug, Clone, Copy)]
struct Seconds(Duration);

impl FromStr for Seconds {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secs: f64 = s.parse().map_err(|e| format!("not a number of seconds: {}", e))?;
        Duration::try_from_secs_f64(secs)
            .map(Seconds)
            .map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
struct Flag(bool);

impl FromStr for Flag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Flag(true)),
            "0" | "false" | "no" | "off" => Ok(Flag(false)),
            _ => Err("not a boolean".to_string()),
        }
    }
}

/// Accepts strings, numbers and booleans alike and parses their text form.
/// Blank values deserialize to `None`.
fn lax<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = match Value::deserialize(deserializer)? {
        Value::Null => return Ok(None),
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => {
            return Err(de::Error::custom(
                "expected a string, a number or a boolean",
            ));
        }
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|e| de::Error::custom(format!("'{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, PipelineError> {
        AppConfig::from_pairs(pairs.iter().copied())
    }

    #[test]
    fn test_defaults_with_only_password() -> anyhow::Result<()> {
        let config = config_from(&[("DB_PASSWORD", "secret")])?;

        assert_eq!(config.watch_dir, PathBuf::from("/data/backups"));
        assert_eq!(config.polling_interval, Duration::from_secs(1));
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.database.existing_database, ExistingDatabasePolicy::Overwrite);
        assert_eq!(config.backup.retry_attempts, 3);
        assert_eq!(config.backup.retry_delay, Duration::from_secs(5));
        assert!(config.backup.archive_processed);
        assert!(!config.backup.quarantine_failed);
        assert!(config.backup.file_patterns.contains(&".rar".to_string()));
        assert!(config.backup.file_patterns.contains(&".dat".to_string()));
        assert_eq!(config.logging.level, "info");
        Ok(())
    }

    #[test]
    fn test_missing_password_is_configuration_error() {
        let err = config_from(&[]).unwrap_err();
        assert_eq!(err.code(), "ConfigurationError");
    }

    #[test]
    fn test_overrides_are_parsed() -> anyhow::Result<()> {
        let config = config_from(&[
            ("DB_PASSWORD", "secret"),
            ("BACKUP_WATCH_DIR", "/srv/incoming"),
            ("BACKUP_POLLING_INTERVAL", "0.25"),
            ("BACKUP_FILE_PATTERNS", ".DAT, .Rar ,"),
            ("BACKUP_QUARANTINE_FAILED", "yes"),
            ("BACKUP_MAX_CONCURRENT_RESTORES", "4"),
            ("DB_EXISTING_DATABASE", "reject"),
            ("LOG_LEVEL", "WARNING"),
        ])?;

        assert_eq!(config.watch_dir, PathBuf::from("/srv/incoming"));
        assert_eq!(config.polling_interval, Duration::from_millis(250));
        assert_eq!(config.backup.file_patterns, vec![".dat", ".rar"]);
        assert!(config.backup.quarantine_failed);
        assert_eq!(config.backup.max_concurrent_restores, 4);
        assert_eq!(config.database.existing_database, ExistingDatabasePolicy::Reject);
        assert_eq!(config.logging.level, "warn");
        Ok(())
    }

    #[test]
    fn test_blank_values_fall_back_to_defaults() -> anyhow::Result<()> {
        let config = config_from(&[
            ("DB_PASSWORD", "12345"),
            ("DB_PORT", "  "),
            ("BACKUP_WATCH_DIR", ""),
            ("BACKUP_ARCHIVE_PROCESSED", ""),
        ])?;

        assert_eq!(config.database.password, "12345");
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.watch_dir, PathBuf::from("/data/backups"));
        assert!(config.backup.archive_processed);
        assert!(config_from(&[("DB_PASSWORD", " ")]).is_err());
        Ok(())
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for (key, value) in [
            ("DB_PORT", "not-a-port"),
            ("BACKUP_MAX_CONCURRENT_RESTORES", "0"),
            ("BACKUP_RETRY_ATTEMPTS", "0"),
            ("BACKUP_ARCHIVE_PROCESSED", "maybe"),
            ("BACKUP_POLLING_INTERVAL", "-1"),
            ("DB_EXISTING_DATABASE", "merge"),
            ("LOG_LEVEL", "loud"),
        ] {
            let result = config_from(&[("DB_PASSWORD", "secret"), (key, value)]);
            assert!(result.is_err(), "{}={} should be rejected", key, value);
        }
    }
}
