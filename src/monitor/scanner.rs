use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tracing::debug;

use crate::archiver::{ARCHIVE_DIR, QUARANTINE_DIR};

/// Size and modification time; a change means the file is still being written
/// or has been replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFile {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
}

/// Lists regular files directly inside `dir` whose names end with one of
/// `patterns` (case-insensitive), oldest first.
pub fn list_candidates(dir: &Path, patterns: &[String]) -> io::Result<Vec<WatchedFile>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || name == ARCHIVE_DIR || name == QUARANTINE_DIR {
            continue;
        }
        let lowered = name.to_ascii_lowercase();
        if !patterns.iter().any(|p| lowered.ends_with(p.as_str())) {
            continue;
        }
        // Follows symlinks; the file may also vanish between listing and stat.
        let Ok(metadata) = std::fs::metadata(entry.path()) else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        files.push(WatchedFile {
            path: entry.path(),
            fingerprint: Fingerprint {
                size: metadata.len(),
                modified: metadata.modified().ok(),
            },
        });
    }
    files.sort_by(|a, b| {
        a.fingerprint
            .modified
            .cmp(&b.fingerprint.modified)
            .then_with(|| a.path.cmp(&b.path))
    });
    Ok(files)
}

/// How a finished job left its file.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    pub succeeded: bool,
}

#[derive(Debug, Clone, Copy)]
struct Settled {
    fingerprint: Fingerprint,
    succeeded: bool,
    at: Instant,
}

/// Per-path observations carried across poll cycles.
#[derive(Debug, Default)]
pub struct StabilityTracker {
    observed: HashMap<PathBuf, Fingerprint>,
    settled: HashMap<PathBuf, Settled>,
}

impl StabilityTracker {
    /// Records this cycle's listing and returns the files whose fingerprint
    /// matches the previous cycle. Paths no longer listed are forgotten.
    pub fn observe(&mut self, listing: Vec<WatchedFile>) -> Vec<WatchedFile> {
        let mut next = HashMap::with_capacity(listing.len());
        let mut stable = Vec::new();
        for file in listing {
            if self.observed.get(&file.path) == Some(&file.fingerprint) {
                stable.push(file.clone());
            } else {
                debug!("{} changed since last poll, waiting", file.path.display());
            }
            next.insert(file.path, file.fingerprint);
        }
        self.settled.retain(|path, _| next.contains_key(path));
        self.observed = next;
        stable
    }

    pub fn settle(&mut self, settlement: Settlement, at: Instant) {
        self.settled.insert(
            settlement.path,
            Settled {
                fingerprint: settlement.fingerprint,
                succeeded: settlement.succeeded,
                at,
            },
        );
    }

    /// A file already handled in its current form: restored successfully, or
    /// failed less than `cooldown` ago. A changed fingerprint clears this.
    pub fn is_settled(&self, file: &WatchedFile, now: Instant, cooldown: Duration) -> bool {
        match self.settled.get(&file.path) {
            Some(s) if s.fingerprint == file.fingerprint => {
                s.succeeded || now.duration_since(s.at) < cooldown
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn patterns() -> Vec<String> {
        vec![".rar".into(), ".dat".into(), ".tar.gz".into()]
    }

    fn watched(path: &str, size: u64) -> WatchedFile {
        WatchedFile {
            path: PathBuf::from(path),
            fingerprint: Fingerprint {
                size,
                modified: None,
            },
        }
    }

    #[test]
    fn test_listing_filters_entries() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("a.DAT"), b"1")?;
        std::fs::write(dir.path().join("b.tar.gz"), b"1")?;
        std::fs::write(dir.path().join("notes.txt"), b"1")?;
        std::fs::write(dir.path().join(".hidden.dat"), b"1")?;
        std::fs::create_dir(dir.path().join("folder.dat"))?;
        std::fs::create_dir(dir.path().join(ARCHIVE_DIR))?;
        std::fs::write(dir.path().join(ARCHIVE_DIR).join("old.dat"), b"1")?;

        let mut names: Vec<String> = list_candidates(dir.path(), &patterns())?
            .into_iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        names.sort();

        assert_eq!(names, vec!["a.DAT", "b.tar.gz"]);
        Ok(())
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        assert!(list_candidates(Path::new("/definitely/not/a/dir"), &patterns()).is_err());
    }

    #[test]
    fn test_file_is_stable_after_two_identical_observations() {
        let mut tracker = StabilityTracker::default();

        assert!(tracker.observe(vec![watched("/w/a.dat", 10)]).is_empty());
        assert!(tracker.observe(vec![watched("/w/a.dat", 20)]).is_empty());
        let stable = tracker.observe(vec![watched("/w/a.dat", 20)]);

        assert_eq!(stable, vec![watched("/w/a.dat", 20)]);
    }

    #[test]
    fn test_vanished_files_are_forgotten() {
        let mut tracker = StabilityTracker::default();
        tracker.observe(vec![watched("/w/a.dat", 1), watched("/w/b.dat", 1)]);
        tracker.observe(vec![watched("/w/b.dat", 1)]);

        // Reappearing counts as a new sighting.
        assert_eq!(
            tracker.observe(vec![watched("/w/a.dat", 1), watched("/w/b.dat", 1)]),
            vec![watched("/w/b.dat", 1)]
        );
    }

    #[test]
    fn test_failed_file_waits_for_cooldown_or_change() {
        let mut tracker = StabilityTracker::default();
        let file = watched("/w/bad.rar", 5);
        tracker.observe(vec![file.clone()]);
        let failed_at = Instant::now();
        tracker.settle(
            Settlement {
                path: file.path.clone(),
                fingerprint: file.fingerprint,
                succeeded: false,
            },
            failed_at,
        );
        let cooldown = Duration::from_secs(60);

        assert!(tracker.is_settled(&file, failed_at + Duration::from_secs(1), cooldown));
        assert!(!tracker.is_settled(&file, failed_at + Duration::from_secs(61), cooldown));
        assert!(!tracker.is_settled(&watched("/w/bad.rar", 6), failed_at, cooldown));
    }

    #[test]
    fn test_successful_file_stays_settled_while_unchanged() {
        let mut tracker = StabilityTracker::default();
        let file = watched("/w/ok.dat", 5);
        tracker.observe(vec![file.clone()]);
        let at = Instant::now();
        tracker.settle(
            Settlement {
                path: file.path.clone(),
                fingerprint: file.fingerprint,
                succeeded: true,
            },
            at,
        );

        assert!(tracker.is_settled(&file, at + Duration::from_secs(3600), Duration::ZERO));
    }
}
