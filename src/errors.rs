use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Value, json};
use thiserror::Error;

/// Failure taxonomy shared by every stage of the ingestion pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unsupported resource scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Failed to fetch {resource}: {message}")]
    Fetch {
        resource: String,
        message: String,
        transient: bool,
    },

    #[error("Failed to extract {}: {message}", .path.display())]
    Extraction {
        path: PathBuf,
        message: String,
        /// Output of the extraction tool, when one was involved.
        diagnostic: Option<String>,
    },

    #[error("Cannot choose a backup file inside {}: {message}", .path.display())]
    AmbiguousArchive {
        path: PathBuf,
        message: String,
        candidates: Vec<PathBuf>,
    },

    #[error("Restore of database '{database}' failed: {message}")]
    Restore {
        database: String,
        message: String,
        transient: bool,
    },

    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout { operation: String, after: Duration },

    #[error("Failed to move {} to {}: {source}", .from.display(), .to.display())]
    Archive {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Shutdown requested before {0}")]
    Interrupted(String),
}

impl PipelineError {
    pub fn fetch(resource: impl Into<String>, message: impl Into<String>, transient: bool) -> Self {
        Self::Fetch {
            resource: resource.into(),
            message: message.into(),
            transient,
        }
    }

    pub fn restore(database: impl Into<String>, message: impl Into<String>, transient: bool) -> Self {
        Self::Restore {
            database: database.into(),
            message: message.into(),
            transient,
        }
    }

    /// Classification name reported to notifiers and the CLI envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedScheme(_) => "UnsupportedSchemeError",
            Self::Fetch { .. } => "FetchError",
            Self::Extraction { .. } => "ExtractionError",
            Self::AmbiguousArchive { .. } => "AmbiguousArchiveError",
            Self::Restore { .. } => "RestoreError",
            Self::Timeout { .. } => "TimeoutError",
            Self::Archive { .. } => "ArchiveError",
            Self::Configuration(_) => "ConfigurationError",
            Self::Interrupted(_) => "Interrupted",
        }
    }

    /// Whether retrying the same step has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Fetch { transient, .. } | Self::Restore { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Structured detail attached to failure notifications.
    pub fn details(&self) -> Value {
        let mut details = json!({
            "code": self.code(),
            "error": self.to_string(),
            "transient": self.is_transient(),
        });
        match self {
            Self::Extraction {
                diagnostic: Some(diagnostic),
                ..
            } => {
                details["diagnostic"] = Value::String(diagnostic.clone());
            }
            Self::AmbiguousArchive { candidates, .. } => {
                details["candidates"] = candidates
                    .iter()
                    .map(|p| Value::String(p.display().to_string()))
                    .collect();
            }
            _ => {}
        }
        details
    }
}
