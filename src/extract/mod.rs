pub(crate) mod archive;
pub(crate) mod external;

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::errors::PipelineError;

pub const DEFAULT_BACKUP_EXTENSIONS: &[&str] = &[".dat", ".dump", ".backup", ".bak", ".sql"];

const TAR_MAGIC_OFFSET: usize = 257;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Tar,
    Gzip,
    Zip,
    Rar,
    SevenZip,
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArchiveKind::TarGz => "tar.gz",
            ArchiveKind::Tar => "tar",
            ArchiveKind::Gzip => "gzip",
            ArchiveKind::Zip => "zip",
            ArchiveKind::Rar => "rar",
            ArchiveKind::SevenZip => "7z",
        };
        f.write_str(name)
    }
}

impl ArchiveKind {
    /// Archive format implied by the file name alone.
    pub fn from_extension(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar") {
            Some(Self::Tar)
        } else if name.ends_with(".gz") {
            Some(Self::Gzip)
        } else if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".rar") {
            Some(Self::Rar)
        } else if name.ends_with(".7z") {
            Some(Self::SevenZip)
        } else {
            None
        }
    }

    /// Archive format according to the file's leading bytes.
    pub fn detect(path: &Path) -> std::io::Result<Option<Self>> {
        let mut header = Vec::with_capacity(512);
        File::open(path)?.take(512).read_to_end(&mut header)?;

        if header.starts_with(&[0x1f, 0x8b]) {
            let mut inner = Vec::with_capacity(512);
            let decoder = flate2::read::GzDecoder::new(File::open(path)?);
            // A truncated or corrupt stream still counts as gzip; extraction reports it.
            let _ = decoder.take(512).read_to_end(&mut inner);
            return Ok(Some(if has_tar_magic(&inner) {
                Self::TarGz
            } else {
                Self::Gzip
            }));
        }
        if header.starts_with(b"PK\x03\x04") || header.starts_with(b"PK\x05\x06") {
            return Ok(Some(Self::Zip));
        }
        if header.starts_with(b"Rar!\x1a\x07") {
            return Ok(Some(Self::Rar));
        }
        if header.starts_with(&[b'7', b'z', 0xbc, 0xaf, 0x27, 0x1c]) {
            return Ok(Some(Self::SevenZip));
        }
        if has_tar_magic(&header) {
            return Ok(Some(Self::Tar));
        }
        Ok(None)
    }
}

fn has_tar_magic(block: &[u8]) -> bool {
    block.len() >= TAR_MAGIC_OFFSET + 5 && &block[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5] == b"ustar"
}

/// Turns an input artifact into the backup file(s) the restore step consumes.
#[derive(Debug, Clone)]
pub struct ArchiveExtractor {
    backup_extensions: Vec<String>,
}

impl Default for ArchiveExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_BACKUP_EXTENSIONS.iter().map(|e| e.to_string()).collect())
    }
}

impl ArchiveExtractor {
    pub fn new(backup_extensions: Vec<String>) -> Self {
        Self {
            backup_extensions: backup_extensions
                .into_iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Returns candidate restore files, best candidate first.
    ///
    /// Non-archives come back unchanged as a single-element list. Archives are
    /// unpacked below `work_dir`, which the caller owns and removes.
    pub async fn extract(
        &self,
        local_path: &Path,
        work_dir: &Path,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        let Some(kind) = self.classify(local_path)? else {
            debug!("{} is not an archive, passing through", local_path.display());
            return Ok(vec![local_path.to_path_buf()]);
        };

        let first_level = work_dir.join("extracted");
        self.unpack(kind, local_path, &first_level).await?;

        let mut candidates = self.backup_files(&first_level);
        if candidates.is_empty() {
            // One level of nesting: an archive wrapping a single inner archive.
            if let Some(inner) = single_file(&first_level) {
                if let Some(inner_kind) = self.classify(&inner)? {
                    info!("Unpacking nested {} archive {}", inner_kind, inner.display());
                    let second_level = work_dir.join("nested");
                    self.unpack(inner_kind, &inner, &second_level).await?;
                    candidates = self.backup_files(&second_level);
                }
            }
        }

        select_candidates(local_path, candidates)
    }

    fn classify(&self, path: &Path) -> Result<Option<ArchiveKind>, PipelineError> {
        let detected = ArchiveKind::detect(path).map_err(|e| PipelineError::Extraction {
            path: path.to_path_buf(),
            message: format!("cannot read file header: {}", e),
            diagnostic: None,
        })?;
        match (detected, ArchiveKind::from_extension(path)) {
            (Some(kind), _) => Ok(Some(kind)),
            (None, Some(claimed)) => Err(PipelineError::Extraction {
                path: path.to_path_buf(),
                message: format!("file name suggests {} but the signature does not match", claimed),
                diagnostic: None,
            }),
            (None, None) => Ok(None),
        }
    }

    async fn unpack(
        &self,
        kind: ArchiveKind,
        archive_path: &Path,
        destination: &Path,
    ) -> Result<(), PipelineError> {
        info!("Extracting {} archive {}", kind, archive_path.display());
        match kind {
            ArchiveKind::Rar | ArchiveKind::SevenZip => {
                external::extract_with_tool(kind, archive_path, destination).await
            }
            _ => {
                let source = archive_path.to_path_buf();
                let target = destination.to_path_buf();
                tokio::task::spawn_blocking(move || archive::extract_in_process(kind, &source, &target))
                    .await
                    .map_err(|e| PipelineError::Extraction {
                        path: archive_path.to_path_buf(),
                        message: format!("extraction task failed: {}", e),
                        diagnostic: None,
                    })?
            }
        }
    }

    fn is_backup_file(&self, path: &Path) -> bool {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        self.backup_extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }

    fn backup_files(&self, root: &Path) -> Vec<(PathBuf, u64)> {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && self.is_backup_file(e.path()))
            .map(|e| {
                let size = e.metadata().map(|m| m.len()).unwrap_or(0);
                (e.into_path(), size)
            })
            .collect()
    }
}

fn single_file(root: &Path) -> Option<PathBuf> {
    let mut files = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file());
    let first = files.next()?;
    match files.next() {
        Some(_) => None,
        None => Some(first.into_path()),
    }
}

/// Orders candidates largest first. Two equally large best candidates give no
/// basis for a choice and are reported instead of guessed.
fn select_candidates(
    archive_path: &Path,
    mut candidates: Vec<(PathBuf, u64)>,
) -> Result<Vec<PathBuf>, PipelineError> {
    if candidates.is_empty() {
        return Err(PipelineError::AmbiguousArchive {
            path: archive_path.to_path_buf(),
            message: "archive contains no file with a known backup extension".into(),
            candidates: vec![],
        });
    }
    candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    if candidates.len() > 1 && candidates[0].1 == candidates[1].1 {
        let tied = candidates[0].1;
        return Err(PipelineError::AmbiguousArchive {
            path: archive_path.to_path_buf(),
            message: format!("several backup files share the largest size ({} bytes)", tied),
            candidates: candidates
                .into_iter()
                .filter(|(_, size)| *size == tied)
                .map(|(p, _)| p)
                .collect(),
        });
    }
    if candidates.len() > 1 {
        info!(
            "Archive holds {} backup files, choosing the largest: {}",
            candidates.len(),
            candidates[0].0.display()
        );
    }
    Ok(candidates.into_iter().map(|(p, _)| p).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn write_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, content) in entries {
            zip.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap();
    }

    #[tokio::test]
    async fn test_plain_file_passes_through_unchanged() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let work = tempfile::tempdir()?;
        let dump = dir.path().join("sample.dat");
        std::fs::write(&dump, b"PGDMP\x01\x0e\x00 custom dump body")?;

        let result = ArchiveExtractor::default().extract(&dump, work.path()).await?;

        assert_eq!(result, vec![dump]);
        assert_eq!(std::fs::read_dir(work.path())?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_tar_gz_with_single_backup_is_extracted_verbatim() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let work = tempfile::tempdir()?;
        let archive = dir.path().join("nightly.tar.gz");
        let body: &[u8] = b"-- PostgreSQL database dump\nSELECT 1;\n";
        write_tar_gz(&archive, &[("backups/nightly.sql", body), ("README", b"notes")]);

        let result = ArchiveExtractor::default().extract(&archive, work.path()).await?;

        assert_eq!(result.len(), 1);
        assert!(result[0].starts_with(work.path()));
        assert_eq!(std::fs::read(&result[0])?, body);
        Ok(())
    }

    #[tokio::test]
    async fn test_zip_picks_largest_backup_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let work = tempfile::tempdir()?;
        let archive = dir.path().join("bundle.zip");
        write_zip(
            &archive,
            &[("small.dat", b"PGDMP-small"), ("large.dump", b"PGDMP-much-larger-body")],
        );

        let result = ArchiveExtractor::default().extract(&archive, work.path()).await?;

        assert_eq!(result.len(), 2);
        assert!(result[0].ends_with("large.dump"));
        Ok(())
    }

    #[tokio::test]
    async fn test_equal_sized_candidates_are_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let archive = dir.path().join("twins.zip");
        write_zip(&archive, &[("a.dat", b"same-size"), ("b.dat", b"same-size")]);

        let err = ArchiveExtractor::default()
            .extract(&archive, work.path())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "AmbiguousArchiveError");
    }

    #[tokio::test]
    async fn test_archive_without_backup_files_is_ambiguous() {
        let dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let archive = dir.path().join("docs.zip");
        write_zip(&archive, &[("readme.txt", b"nothing to restore")]);

        let err = ArchiveExtractor::default()
            .extract(&archive, work.path())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "AmbiguousArchiveError");
    }

    #[tokio::test]
    async fn test_nested_archive_is_unpacked_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let work = tempfile::tempdir()?;
        let inner = dir.path().join("inner.tar.gz");
        write_tar_gz(&inner, &[("db.dump", b"PGDMP-nested")]);
        let outer = dir.path().join("outer.zip");
        write_zip(&outer, &[("inner.tar.gz", &std::fs::read(&inner)?)]);

        let result = ArchiveExtractor::default().extract(&outer, work.path()).await?;

        assert_eq!(result.len(), 1);
        assert_eq!(std::fs::read(&result[0])?, b"PGDMP-nested");
        Ok(())
    }

    #[tokio::test]
    async fn test_fake_rar_extension_fails_signature_check() {
        let dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let fake = dir.path().join("backup.rar");
        std::fs::write(&fake, b"definitely not a rar archive").unwrap();

        let err = ArchiveExtractor::default()
            .extract(&fake, work.path())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "ExtractionError");
    }

    #[tokio::test]
    async fn test_corrupt_gzip_is_extraction_error() {
        let dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let broken = dir.path().join("broken.sql.gz");
        std::fs::write(&broken, [0x1f, 0x8b, 0x08, 0x00, 0xde, 0xad]).unwrap();

        let err = ArchiveExtractor::default()
            .extract(&broken, work.path())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "ExtractionError");
    }

    #[test]
    fn test_signature_detection() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let rar = dir.path().join("x.bin");
        std::fs::write(&rar, b"Rar!\x1a\x07\x01\x00rest")?;
        assert_eq!(ArchiveKind::detect(&rar)?, Some(ArchiveKind::Rar));

        let sevenz = dir.path().join("y.bin");
        std::fs::write(&sevenz, [b'7', b'z', 0xbc, 0xaf, 0x27, 0x1c, 0, 4])?;
        assert_eq!(ArchiveKind::detect(&sevenz)?, Some(ArchiveKind::SevenZip));

        let tgz = dir.path().join("z.bin");
        write_tar_gz(&tgz, &[("a.sql", b"SELECT 1;")]);
        assert_eq!(ArchiveKind::detect(&tgz)?, Some(ArchiveKind::TarGz));

        let plain = dir.path().join("p.dat");
        std::fs::write(&plain, b"PGDMP")?;
        assert_eq!(ArchiveKind::detect(&plain)?, None);
        Ok(())
    }
}
