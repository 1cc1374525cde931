//! Session creation and restoration.
//!
//! A session is named after the UTC time it was created at. The name is
//! claimed by atomically creating the session directory, so two sessions
//! created in the same microsecond end up as `<id>` and `<id>_1`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::core::models::{
    RAW_DATA_DIR, SNAPSHOT_FILENAME, SessionIdentity, SessionTree, StorageRoots, Tier,
};
use crate::error::{Error, IoResultExt, Result};

/// Layout of a session id: UTC time down to the microsecond.
pub const SESSION_ID_FORMAT: &str = "%Y-%m-%d-%H-%M-%S-%6f";

/// Zero-byte file in the workstation `raw_data` of a session whose acquisition
/// runtime never finished initializing. Such a session holds nothing worth
/// keeping.
pub const UNINITIALIZED_MARKER: &str = "nk.bin";

/// Tiers that can host the session name, in preference order.
const CLAIM_ORDER: [Tier; 3] = [Tier::Workstation, Tier::Server, Tier::Archive];

pub fn session_id(timestamp: DateTime<Utc>) -> String {
    timestamp.format(SESSION_ID_FORMAT).to_string()
}

/// Create a new session named after the current time.
pub fn create(project: &str, subject: &str, roots: &StorageRoots) -> Result<SessionTree> {
    create_at(project, subject, roots, Utc::now())
}

/// Create a new session named after `timestamp`.
///
/// The name is claimed on every reachable tier among workstation, server and
/// archive, taking the first suffix that is free on all of them. The directory
/// skeleton is then laid down on each claimed tier and on the capture PC, and
/// the snapshot written into each `raw_data`. Unreachable tiers are skipped;
/// only if none accepts the session does creation fail.
///
/// The new session starts out uninitialized (see [`UNINITIALIZED_MARKER`]).
pub fn create_at(
    project: &str,
    subject: &str,
    roots: &StorageRoots,
    timestamp: DateTime<Utc>,
) -> Result<SessionTree> {
    let base = session_id(timestamp);
    let candidate = SessionTree::new(
        SessionIdentity {
            project: project.to_string(),
            subject: subject.to_string(),
            session: base.clone(),
        },
        roots.clone(),
    );

    let (session, claimed) = claim_name(&candidate, &base)?;

    let tree = SessionTree::new(
        SessionIdentity {
            project: project.to_string(),
            subject: subject.to_string(),
            session,
        },
        roots.clone(),
    );

    for tier in Tier::ALL {
        if tier != Tier::Capture && !claimed.contains(&tier) {
            continue;
        }
        if let Err(e) = lay_out(&tree, tier) {
            warn!(
                tier = tier.as_str(),
                session = tree.session_name(),
                error = %e,
                "Skipping unreachable tier"
            );
        }
    }

    let raw_data = tree.raw_data(Tier::Workstation);
    if raw_data.is_dir() {
        let marker = raw_data.join(UNINITIALIZED_MARKER);
        fs::File::create(&marker).at(&marker)?;
    }

    info!(
        project,
        subject,
        session = tree.session_name(),
        path = %tree.path().display(),
        "Session created"
    );
    Ok(tree)
}

/// Whether the acquisition runtime finished initializing `tree`.
pub fn is_initialized(tree: &SessionTree) -> bool {
    !tree
        .raw_data(Tier::Workstation)
        .join(UNINITIALIZED_MARKER)
        .exists()
}

/// Record that the acquisition runtime initialized successfully, so the
/// session now holds data worth keeping.
pub fn runtime_initialized(tree: &SessionTree) -> Result<()> {
    let marker = tree.raw_data(Tier::Workstation).join(UNINITIALIZED_MARKER);
    match fs::remove_file(&marker) {
        Ok(()) => {
            debug!(session = tree.session_name(), "Session initialized");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(marker, e)),
    }
}

/// Restore a session from the snapshot in `session_dir/raw_data`.
pub fn reopen(session_dir: &Path) -> Result<SessionTree> {
    let path = session_dir.join(RAW_DATA_DIR).join(SNAPSHOT_FILENAME);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(Error::MissingSnapshot { path });
        }
        Err(e) => return Err(Error::io(path, e)),
    };

    toml::from_str(&content).map_err(|e| Error::MalformedSnapshot {
        path,
        message: e.to_string(),
    })
}

/// Write the snapshot into `raw_data` on `tier`.
pub fn save_snapshot(tree: &SessionTree, tier: Tier) -> Result<()> {
    let path = tree.snapshot_path(tier);
    let content = toml::to_string_pretty(tree).map_err(|e| Error::MalformedSnapshot {
        path: path.clone(),
        message: e.to_string(),
    })?;
    fs::write(&path, content).at(&path)
}

/// Names of the sessions under `subject_dir` that carry a snapshot, sorted.
/// A missing directory has none.
pub fn list_sessions(subject_dir: &Path) -> Result<Vec<String>> {
    if !subject_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut sessions = Vec::new();
    for entry in fs::read_dir(subject_dir).at(subject_dir)? {
        let path = entry.at(subject_dir)?.path();
        if path.join(RAW_DATA_DIR).join(SNAPSHOT_FILENAME).is_file()
            && let Some(name) = path.file_name().and_then(|n| n.to_str())
        {
            sessions.push(name.to_string());
        }
    }
    sessions.sort();
    Ok(sessions)
}

/// Delete the session directory of `tree` from every tier it exists on,
/// including its session cache on the capture PC. Per-subject data stays.
pub fn remove_session_dirs(tree: &SessionTree) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for tier in Tier::ALL {
        let directory = tree.session_dir(tier);
        if !directory.is_dir() {
            debug!(tier = tier.as_str(), "Session not present on tier");
            continue;
        }
        fs::remove_dir_all(&directory).at(&directory)?;
        info!(tier = tier.as_str(), directory = %directory.display(), "Session directory removed");
        removed.push(directory);
    }
    Ok(removed)
}

/// Delete the files left in the shared capture cache.
pub fn reset_capture_cache(tree: &SessionTree) -> Result<()> {
    let cache = tree.capture_cache();
    if !cache.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(&cache).at(&cache)? {
        let path = entry.at(&cache)?.path();
        if path.is_file() {
            fs::remove_file(&path).at(&path)?;
        }
    }
    Ok(())
}

/// Claim `base`, or the first `base_N`, by atomically creating the session
/// directory on every reachable tier. A name taken on any tier, or already
/// used as a capture-PC session cache, moves on to the next suffix; the
/// directories created for the rejected name are removed again.
fn claim_name(candidate: &SessionTree, base: &str) -> Result<(String, Vec<Tier>)> {
    let mut reachable: Vec<(Tier, PathBuf)> = Vec::new();
    for tier in CLAIM_ORDER {
        let root = candidate.roots.root(tier);
        if !root.is_dir() {
            warn!(tier = tier.as_str(), root = %root.display(), "Tier unavailable for session claim");
            continue;
        }
        let subject_dir = candidate.subject_dir(tier);
        match fs::create_dir_all(&subject_dir) {
            Ok(()) => reachable.push((tier, subject_dir)),
            Err(e) => {
                warn!(tier = tier.as_str(), error = %e, "Tier unavailable for session claim");
            }
        }
    }

    let mut suffix = 0u32;
    while !reachable.is_empty() {
        let name = match suffix {
            0 => base.to_string(),
            n => format!("{base}_{n}"),
        };
        suffix += 1;

        if candidate.roots.capture_root.join(&name).exists() {
            continue;
        }

        let mut created = Vec::new();
        let mut taken = false;
        let mut failed = Vec::new();
        for (tier, subject_dir) in &reachable {
            let candidate = subject_dir.join(&name);
            match fs::create_dir(&candidate) {
                Ok(()) => created.push((*tier, candidate)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    taken = true;
                    break;
                }
                Err(e) => {
                    warn!(tier = tier.as_str(), error = %e, "Tier unavailable for session claim");
                    failed.push(*tier);
                }
            }
        }

        if taken {
            for (_, directory) in &created {
                fs::remove_dir(directory).at(directory)?;
            }
            reachable.retain(|(tier, _)| !failed.contains(tier));
            continue;
        }
        if !created.is_empty() {
            return Ok((name, created.into_iter().map(|(tier, _)| tier).collect()));
        }
        reachable.retain(|(tier, _)| !failed.contains(tier));
    }

    Err(Error::NoReachableTier {
        session: base.to_string(),
    })
}

/// Create the skeleton of `tree` on `tier` and, off the capture PC, write the
/// snapshot.
pub(crate) fn lay_out(tree: &SessionTree, tier: Tier) -> Result<()> {
    let root = tree.roots.root(tier);
    if !root.is_dir() {
        return Err(Error::io(root, std::io::Error::from(ErrorKind::NotFound)));
    }

    for directory in tree.skeleton(tier) {
        fs::create_dir_all(&directory).at(&directory)?;
    }
    if tier != Tier::Capture {
        save_snapshot(tree, tier)?;
    }
    Ok(())
}
