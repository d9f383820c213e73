use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::PipelineError;

pub const ARCHIVE_DIR: &str = "archived";
pub const QUARANTINE_DIR: &str = "quarantine";

const MAX_NAME_ATTEMPTS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
}

/// Where the original input ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "path", rename_all = "snake_case")]
pub enum Disposition {
    Archived(PathBuf),
    Quarantined(PathBuf),
    LeftInPlace,
}

impl Disposition {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Disposition::Archived(p) | Disposition::Quarantined(p) => Some(p),
            Disposition::LeftInPlace => None,
        }
    }
}

/// Relocates processed inputs into `archived/` or `quarantine/` next to them.
#[derive(Debug, Clone, Copy)]
pub struct Archiver {
    quarantine_failed: bool,
}

impl Archiver {
    pub fn new(quarantine_failed: bool) -> Self {
        Self { quarantine_failed }
    }

    pub async fn archive(
        &self,
        original: &Path,
        outcome: JobOutcome,
        archive_processed: bool,
    ) -> Result<Disposition, PipelineError> {
        let quarantine_failed = self.quarantine_failed;
        let source = original.to_path_buf();
        tokio::task::spawn_blocking(move || {
            relocate(&source, outcome, archive_processed, quarantine_failed)
        })
        .await
        .map_err(|e| PipelineError::Archive {
            from: original.to_path_buf(),
            to: PathBuf::new(),
            source: std::io::Error::other(e),
        })?
    }
}

fn relocate(
    original: &Path,
    outcome: JobOutcome,
    archive_processed: bool,
    quarantine_failed: bool,
) -> Result<Disposition, PipelineError> {
    let parent = original.parent().unwrap_or_else(|| Path::new("."));
    let file_name = original
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "backup".into());

    match outcome {
        JobOutcome::Succeeded if archive_processed => {
            let (base, ext) = split_extension(&file_name);
            let stamped = format!("{}_{}", base, Utc::now().format("%Y%m%d_%H%M%S"));
            let target = move_into(original, &parent.join(ARCHIVE_DIR), &stamped, ext)?;
            info!("Archived {} to {}", original.display(), target.display());
            Ok(Disposition::Archived(target))
        }
        JobOutcome::Failed if quarantine_failed => {
            let (base, ext) = split_extension(&file_name);
            let target = move_into(original, &parent.join(QUARANTINE_DIR), base, ext)?;
            warn!("Quarantined {} to {}", original.display(), target.display());
            Ok(Disposition::Quarantined(target))
        }
        _ => Ok(Disposition::LeftInPlace),
    }
}

/// `nightly.tar.gz` -> (`nightly`, `.tar.gz`); `a.dat` -> (`a`, `.dat`).
fn split_extension(file_name: &str) -> (&str, &str) {
    let lowered = file_name.to_ascii_lowercase();
    if lowered.ends_with(".tar.gz") && file_name.len() > 7 {
        let idx = file_name.len() - 7;
        return (&file_name[..idx], &file_name[idx..]);
    }
    match file_name.rfind('.') {
        Some(idx) if idx > 0 => (&file_name[..idx], &file_name[idx..]),
        _ => (file_name, ""),
    }
}

/// Moves `source` into `directory` as `{base}{ext}`, or `{base}_{n}{ext}` when
/// that name is taken. The name is reserved with `create_new` before the move.
fn move_into(source: &Path, directory: &Path, base: &str, ext: &str) -> Result<PathBuf, PipelineError> {
    let archive_error = |to: &Path, e: std::io::Error| PipelineError::Archive {
        from: source.to_path_buf(),
        to: to.to_path_buf(),
        source: e,
    };

    std::fs::create_dir_all(directory).map_err(|e| archive_error(directory, e))?;

    for counter in 0..MAX_NAME_ATTEMPTS {
        let name = if counter == 0 {
            format!("{}{}", base, ext)
        } else {
            format!("{}_{}{}", base, counter, ext)
        };
        let candidate = directory.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(_) => {
                if let Err(e) = move_file(source, &candidate) {
                    let _ = std::fs::remove_file(&candidate);
                    return Err(archive_error(&candidate, e));
                }
                return Ok(candidate);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(archive_error(&candidate, e)),
        }
    }

    Err(archive_error(
        &directory.join(format!("{}{}", base, ext)),
        std::io::Error::new(ErrorKind::AlreadyExists, "no free archive file name"),
    ))
}

/// Rename when source and destination share a filesystem, otherwise copy,
/// check the copied size, then delete the source.
fn move_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    match std::fs::rename(src, dst) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {}
        Err(e) => return Err(e),
    }

    let expected = std::fs::metadata(src)?.len();
    let copied = std::fs::copy(src, dst)?;
    let written = std::fs::metadata(dst)?.len();
    if copied != expected || written != expected {
        return Err(std::io::Error::other(format!(
            "copy verification failed: expected {} bytes, wrote {}",
            expected, written
        )));
    }
    std::fs::remove_file(src)
}
