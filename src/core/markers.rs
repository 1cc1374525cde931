//! Deletion markers and the independent sweep that consumes them.
//!
//! A marker is a zero-byte file dropped into a directory once its contents
//! have been verified-copied downstream. Marking and sweeping are separate
//! operations that may run on different machines; nothing is tracked in
//! memory.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::core::models::{RAW_DATA_DIR, StorageRoots, Tier};
use crate::error::{IoResultExt, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    /// Capture-PC cache has been pulled to the workstation.
    Ubiquitin,
    /// Workstation raw data has been confirmed on the archive and the server.
    Telomere,
}

impl MarkerKind {
    pub fn filename(&self) -> &'static str {
        match self {
            Self::Ubiquitin => "ubiquitin.bin",
            Self::Telomere => "telomere.bin",
        }
    }

    /// The only tier on which the sweep honours this marker.
    pub fn tier(&self) -> Tier {
        match self {
            Self::Ubiquitin => Tier::Capture,
            Self::Telomere => Tier::Workstation,
        }
    }
}

/// Tag `directory` for reclamation. Tagging twice is harmless.
pub fn mark(directory: &Path, kind: MarkerKind) -> Result<PathBuf> {
    let marker = directory.join(kind.filename());
    if !marker.exists() {
        fs::File::create(&marker).at(&marker)?;
        info!(directory = %directory.display(), marker = kind.filename(), "Directory marked for deletion");
    }
    Ok(marker)
}

pub fn is_marked(directory: &Path, kind: MarkerKind) -> bool {
    directory.join(kind.filename()).is_file()
}

#[derive(Debug, Default)]
pub struct PurgeReport {
    pub removed: Vec<PathBuf>,
}

/// Sweep the capture and workstation roots and remove every directory tagged
/// with the marker scoped to that tier.
///
/// A tagged `raw_data` directory is escalated to its whole session directory.
/// Markers placed directly in a root are ignored.
pub fn purge(roots: &StorageRoots) -> Result<PurgeReport> {
    let mut report = PurgeReport::default();

    for kind in [MarkerKind::Ubiquitin, MarkerKind::Telomere] {
        let root = roots.root(kind.tier());
        if !root.exists() {
            debug!(root = %root.display(), "Root not present, skipping sweep");
            continue;
        }

        let mut candidates = Vec::new();
        find_marked(root, kind, &mut candidates)?;

        for candidate in candidates {
            if candidate == root {
                warn!(root = %root.display(), marker = kind.filename(), "Ignoring marker at storage root");
                continue;
            }

            let target = match candidate.file_name() {
                Some(name) if name == RAW_DATA_DIR => candidate
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or(candidate),
                _ => candidate,
            };

            if target == root || !target.starts_with(root) {
                warn!(target = %target.display(), "Refusing to remove directory outside the swept root");
                continue;
            }

            fs::remove_dir_all(&target).at(&target)?;
            info!(directory = %target.display(), marker = kind.filename(), "Removed redundant data");
            report.removed.push(target);
        }
    }

    if report.removed.is_empty() {
        info!("No redundant data to purge");
    }

    Ok(report)
}

/// Collect directories holding `kind`'s marker. Marked directories are not
/// descended into since they are removed whole.
fn find_marked(current: &Path, kind: MarkerKind, found: &mut Vec<PathBuf>) -> Result<()> {
    if is_marked(current, kind) {
        found.push(current.to_path_buf());
        return Ok(());
    }

    for entry in fs::read_dir(current).at(current)? {
        let entry = entry.at(current)?;
        let path = entry.path();
        let metadata = path.symlink_metadata().at(&path)?;
        if metadata.is_dir() {
            find_marked(&path, kind, found)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn marking_is_idempotent() {
        let temp = tempdir().unwrap();
        let first = mark(temp.path(), MarkerKind::Ubiquitin).unwrap();
        let second = mark(temp.path(), MarkerKind::Ubiquitin).unwrap();
        assert_eq!(first, second);
        assert!(is_marked(temp.path(), MarkerKind::Ubiquitin));
        assert_eq!(fs::metadata(first).unwrap().len(), 0);
    }

    #[test]
    fn purge_respects_tier_scope() {
        let temp = tempdir().unwrap();
        let roots = StorageRoots::under(temp.path());

        let capture_cache = roots.capture_root.join("2024-01-01-00-00-00-000000");
        let session = roots.workstation_root.join("p/s/2024-01-01-00-00-00-000000");
        let raw_data = session.join("raw_data");
        let unmarked = roots.workstation_root.join("p/s/2024-01-02-00-00-00-000000/raw_data");
        for dir in [&capture_cache, &raw_data, &unmarked] {
            fs::create_dir_all(dir).unwrap();
        }

        mark(&capture_cache, MarkerKind::Ubiquitin).unwrap();
        mark(&raw_data, MarkerKind::Telomere).unwrap();
        // Wrong-tier marker must not trigger deletion.
        mark(&unmarked, MarkerKind::Ubiquitin).unwrap();

        let report = purge(&roots).unwrap();

        assert_eq!(report.removed.len(), 2);
        assert!(!capture_cache.exists());
        assert!(!session.exists(), "raw_data marker escalates to session dir");
        assert!(unmarked.exists());
        assert!(roots.workstation_root.join("p/s").exists());
    }

    #[test]
    fn purge_ignores_marker_at_root() {
        let temp = tempdir().unwrap();
        let roots = StorageRoots::under(temp.path());
        fs::create_dir_all(&roots.capture_root).unwrap();
        mark(&roots.capture_root, MarkerKind::Ubiquitin).unwrap();

        let report = purge(&roots).unwrap();
        assert!(report.removed.is_empty());
        assert!(roots.capture_root.exists());
    }

    #[test]
    fn purge_with_missing_roots_is_noop() {
        let temp = tempdir().unwrap();
        let roots = StorageRoots::under(&temp.path().join("absent"));
        let report = purge(&roots).unwrap();
        assert!(report.removed.is_empty());
    }
}
