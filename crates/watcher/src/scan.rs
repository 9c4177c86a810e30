use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use log::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Size and modification time of a file at scan time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub len: u64,
    pub modified: Option<SystemTime>,
}

/// Every regular file under a root with its fingerprint
pub type Snapshot = HashMap<PathBuf, Fingerprint>;

/// Which part of a tree a scan covers
#[derive(Debug, Clone)]
pub struct ScanScope<'a> {
    pub root: &'a Path,
    pub recursive: bool,
    /// Subtrees that are never reported (output and archive dirs under the root)
    pub excluded: &'a [PathBuf],
}

impl ScanScope<'_> {
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.excluded.iter().any(|ex| path.starts_with(ex))
    }

    fn walk(&self) -> impl Iterator<Item = DirEntry> {
        let mut walker = WalkDir::new(self.root).follow_links(false).sort_by_file_name();
        if !self.recursive {
            walker = walker.max_depth(1);
        }
        let excluded = self.excluded.to_vec();
        walker
            .into_iter()
            .filter_entry(move |entry| !excluded.iter().any(|ex| entry.path().starts_with(ex)))
            .filter_map(|entry| match entry {
                Ok(e) => Some(e),
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
    }
}

/// Regular files already present under the root, in a stable order
pub fn existing_files(scope: &ScanScope<'_>) -> Vec<PathBuf> {
    let files: Vec<PathBuf> = scope.walk().map(|e| e.into_path()).collect();
    info!("Found {} existing files in {}", files.len(), scope.root.display());
    files
}

/// Fingerprint every regular file under the root
pub fn snapshot(scope: &ScanScope<'_>) -> Snapshot {
    let mut snapshot = Snapshot::new();
    let mut entry_count = 0;

    for entry in scope.walk() {
        entry_count += 1;
        // Log progress every 1000 entries
        if entry_count % 1000 == 0 {
            debug!("Scanned {} entries so far in {}...", entry_count, scope.root.display());
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                // vanished between listing and stat
                debug!("Failed to stat {}: {}", entry.path().display(), e);
                continue;
            }
        };
        snapshot.insert(
            entry.into_path(),
            Fingerprint {
                len: metadata.len(),
                modified: metadata.modified().ok(),
            },
        );
    }

    snapshot
}
