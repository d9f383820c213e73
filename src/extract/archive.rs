// backup-ingest/src/extract/archive.rs
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::ArchiveKind;
use crate::errors::PipelineError;

/// Unpacks the formats handled without an external tool.
///
/// Runs on a blocking thread; callers wrap it in `spawn_blocking`.
pub fn extract_in_process(
    kind: ArchiveKind,
    archive_path: &Path,
    extract_to_dir: &Path,
) -> Result<(), PipelineError> {
    let failed = |message: String| PipelineError::Extraction {
        path: archive_path.to_path_buf(),
        message,
        diagnostic: None,
    };

    if !archive_path.is_file() {
        return Err(failed("archive for extraction is not a file".into()));
    }
    std::fs::create_dir_all(extract_to_dir).map_err(|e| {
        failed(format!(
            "failed to create extraction directory {}: {}",
            extract_to_dir.display(),
            e
        ))
    })?;

    let archive_file = File::open(archive_path)
        .map_err(|e| failed(format!("failed to open archive file: {}", e)))?;

    match kind {
        ArchiveKind::TarGz => {
            let gz_decoder = flate2::read::GzDecoder::new(archive_file);
            unpack_tar(tar::Archive::new(gz_decoder), extract_to_dir).map_err(|e| {
                failed(format!("failed to unpack tar.gz archive: {}", e))
            })?;
        }
        ArchiveKind::Tar => {
            unpack_tar(tar::Archive::new(archive_file), extract_to_dir)
                .map_err(|e| failed(format!("failed to unpack tar archive: {}", e)))?;
        }
        ArchiveKind::Gzip => {
            let target = extract_to_dir.join(gunzipped_name(archive_path));
            let mut decoder = flate2::read::MultiGzDecoder::new(archive_file);
            let mut output = File::create(&target).map_err(|e| {
                failed(format!("failed to create {}: {}", target.display(), e))
            })?;
            io::copy(&mut decoder, &mut output)
                .map_err(|e| failed(format!("failed to decompress gzip stream: {}", e)))?;
        }
        ArchiveKind::Zip => {
            let mut archive = zip::ZipArchive::new(archive_file)
                .map_err(|e| failed(format!("failed to read zip archive: {}", e)))?;
            if (0..archive.len()).any(|i| {
                archive
                    .by_index_raw(i)
                    .map(|entry| entry.encrypted())
                    .unwrap_or(false)
            }) {
                return Err(failed("zip archive is password protected".into()));
            }
            archive
                .extract(extract_to_dir)
                .map_err(|e| failed(format!("failed to unpack zip archive: {}", e)))?;
        }
        ArchiveKind::Rar | ArchiveKind::SevenZip => {
            return Err(failed(format!("{} archives need an external tool", kind)));
        }
    }

    debug!(
        "Archive {} extracted to {}",
        archive_path.display(),
        extract_to_dir.display()
    );
    Ok(())
}

fn unpack_tar<R: io::Read>(mut archive: tar::Archive<R>, extract_to_dir: &Path) -> io::Result<()> {
    archive.set_preserve_permissions(false);
    archive.unpack(extract_to_dir)
}

/// `nightly.sql.gz` -> `nightly.sql`; names without `.gz` keep their stem.
fn gunzipped_name(archive_path: &Path) -> PathBuf {
    let name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let lowered = name.to_ascii_lowercase();
    let stem = if lowered.ends_with(".gz") {
        &name[..name.len() - 3]
    } else {
        name.as_str()
    };
    if stem.is_empty() {
        PathBuf::from("decompressed")
    } else {
        PathBuf::from(stem)
    }
}
