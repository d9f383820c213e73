// backup-ingest/src/restore/metadata.rs
use std::io::Read;
use std::path::Path;

use regex::Regex;
use serde::Serialize;

/// PostgreSQL identifiers are truncated by the server beyond this many bytes.
pub const MAX_IDENTIFIER_BYTES: usize = 63;

const CUSTOM_DUMP_MAGIC: &[u8] = b"PGDMP";
const PLAIN_SCAN_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupFormat {
    /// `pg_dump -Fc` archive, restored with `pg_restore`.
    Custom,
    /// SQL script, restored with `psql`.
    PlainSql,
}

/// What could be learned about a backup before restoring it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupMetadata {
    pub format: BackupFormat,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toc_entries: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_tables: Option<i64>,
}

impl BackupMetadata {
    pub fn new(format: BackupFormat, size_bytes: u64) -> Self {
        Self {
            format,
            size_bytes,
            source_database: None,
            server_version: None,
            created_at: None,
            toc_entries: None,
            public_tables: None,
        }
    }
}

/// Classifies a backup by content. `None` means neither a custom dump nor text.
pub fn detect_format(path: &Path) -> std::io::Result<Option<BackupFormat>> {
    let mut head = Vec::with_capacity(4096);
    std::fs::File::open(path)?.take(4096).read_to_end(&mut head)?;
    if head.starts_with(CUSTOM_DUMP_MAGIC) {
        Ok(Some(BackupFormat::Custom))
    } else if head.contains(&0) {
        Ok(None)
    } else {
        Ok(Some(BackupFormat::PlainSql))
    }
}

/// Reads the table of contents printed by `pg_restore --list`.
pub fn parse_restore_list(listing: &str, metadata: &mut BackupMetadata) {
    for line in listing.lines() {
        let Some(comment) = line.strip_prefix(';') else {
            continue;
        };
        let comment = comment.trim();
        if let Some(created) = comment.strip_prefix("Archive created at ") {
            metadata.created_at = Some(created.trim().to_string());
            continue;
        }
        let Some((key, value)) = comment.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "dbname" => metadata.source_database = Some(value.to_string()),
            "TOC Entries" => metadata.toc_entries = value.parse().ok(),
            "Dumped from database version" => metadata.server_version = Some(value.to_string()),
            _ => {}
        }
    }
}

/// Header comments and the first database statement of a plain SQL dump.
pub struct SqlHeaderScanner {
    server_version: Regex,
    started_on: Regex,
    create_database: Regex,
    connect: Regex,
}

impl SqlHeaderScanner {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            server_version: Regex::new(r"(?m)^--\s*Dumped from database version\s+(\S+)")?,
            started_on: Regex::new(r"(?m)^--\s*Started on\s+(.+?)\s*$")?,
            create_database: Regex::new(r#"(?mi)^\s*CREATE\s+DATABASE\s+"?([^"\s;]+)"?"#)?,
            connect: Regex::new(r#"(?m)^\\(?:connect|c)\s+(?:-reuse-previous=\S+\s+)?"?([^"\s]+)"?"#)?,
        })
    }

    pub fn scan_file(&self, path: &Path, metadata: &mut BackupMetadata) -> std::io::Result<()> {
        let mut head = Vec::new();
        std::fs::File::open(path)?
            .take(PLAIN_SCAN_BYTES)
            .read_to_end(&mut head)?;
        self.scan(&String::from_utf8_lossy(&head), metadata);
        Ok(())
    }

    pub fn scan(&self, text: &str, metadata: &mut BackupMetadata) {
        let first = |re: &Regex| re.captures(text).map(|c| c[1].to_string());
        metadata.server_version = first(&self.server_version);
        metadata.created_at = first(&self.started_on);
        metadata.source_database = first(&self.create_database).or_else(|| first(&self.connect));
    }
}

/// Turns an arbitrary label into a safe database identifier.
///
/// Unsafe characters collapse to `_`, the result is lowercased, names starting
/// with a digit get a `db_` prefix, and the length is capped at
/// [`MAX_IDENTIFIER_BYTES`]. Returns `None` if nothing usable remains.
pub fn sanitize_database_name(raw: &str) -> Option<String> {
    let mut name = String::with_capacity(raw.len());
    let mut last_was_separator = false;
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            name.push(ch.to_ascii_lowercase());
            last_was_separator = false;
        } else if !last_was_separator {
            name.push('_');
            last_was_separator = true;
        }
    }
    let name = name.trim_matches('_');
    if name.is_empty() {
        return None;
    }
    let mut name = if name.starts_with(|c: char| c.is_ascii_digit()) {
        format!("db_{}", name)
    } else {
        name.to_string()
    };
    name.truncate(MAX_IDENTIFIER_BYTES);
    Some(name.trim_end_matches('_').to_string())
}

/// File name without any archive or dump extension: `Sales-2024.tar.gz` -> `Sales-2024`.
pub fn file_stem_label(file_name: &str) -> &str {
    let lowered = file_name.to_ascii_lowercase();
    for suffix in [".tar.gz", ".sql.gz"] {
        if lowered.ends_with(suffix) {
            return &file_name[..file_name.len() - suffix.len()];
        }
    }
    match file_name.rfind('.') {
        Some(idx) if idx > 0 => &file_name[..idx],
        _ => file_name,
    }
}

/// Picks the target database: declared name, then the name recorded in the
/// backup, then the fallback label. The first candidate that survives
/// sanitization wins; if none does, a timestamped name is generated.
pub fn resolve_database_name(
    declared: Option<&str>,
    from_backup: Option<&str>,
    fallback: &str,
) -> String {
    [declared, from_backup, Some(file_stem_label(fallback))]
        .into_iter()
        .flatten()
        .find_map(sanitize_database_name)
        .unwrap_or_else(|| format!("restored_db_{}", chrono::Utc::now().timestamp()))
}
