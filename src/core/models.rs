use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Directory names shared by every tier that holds a session's raw data.
pub const RAW_DATA_DIR: &str = "raw_data";
pub const CAMERA_FRAMES_DIR: &str = "camera_frames";
pub const MESOSCOPE_FRAMES_DIR: &str = "mesoscope_frames";
pub const BEHAVIOR_LOG_DIR: &str = "behavior_data_log";
pub const PULLED_FRAMES_DIR: &str = "raw_mesoscope_frames";
pub const PERSISTENT_DATA_DIR: &str = "persistent_data";
pub const METADATA_DIR: &str = "metadata";
/// Shared capture-PC cache the acquisition software writes into.
pub const CAPTURE_CACHE_DIR: &str = "mesoscope_data";

pub const SNAPSHOT_FILENAME: &str = "session_data.toml";
pub const HARDWARE_CONFIGURATION_FILENAME: &str = "hardware_configuration.toml";

/// Machine role holding a copy of session data at some point in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Capture,
    Workstation,
    Archive,
    Server,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Capture, Tier::Workstation, Tier::Archive, Tier::Server];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Capture => "capture",
            Self::Workstation => "workstation",
            Self::Archive => "archive",
            Self::Server => "server",
        }
    }
}

/// Mount points of the four tiers as seen from the workstation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRoots {
    pub capture_root: PathBuf,
    pub workstation_root: PathBuf,
    pub archive_root: PathBuf,
    pub server_root: PathBuf,
}

impl StorageRoots {
    pub fn root(&self, tier: Tier) -> &Path {
        match tier {
            Tier::Capture => &self.capture_root,
            Tier::Workstation => &self.workstation_root,
            Tier::Archive => &self.archive_root,
            Tier::Server => &self.server_root,
        }
    }

    /// Convenience layout with every tier under one directory.
    pub fn under(base: &Path) -> Self {
        Self {
            capture_root: base.join("capture"),
            workstation_root: base.join("workstation"),
            archive_root: base.join("archive"),
            server_root: base.join("server"),
        }
    }
}

impl Default for StorageRoots {
    fn default() -> Self {
        Self {
            capture_root: PathBuf::from("/mnt/capture"),
            workstation_root: PathBuf::from("/data/projects"),
            archive_root: PathBuf::from("/mnt/archive"),
            server_root: PathBuf::from("/mnt/server"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub project: String,
    pub subject: String,
    pub session: String,
}

/// A session's identity bound to the storage roots it was created under.
///
/// Every path is derived from these two values alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTree {
    pub identity: SessionIdentity,
    pub roots: StorageRoots,
}

impl SessionTree {
    pub fn new(identity: SessionIdentity, roots: StorageRoots) -> Self {
        Self { identity, roots }
    }

    pub fn session_name(&self) -> &str {
        &self.identity.session
    }

    /// The session directory on the workstation.
    pub fn path(&self) -> PathBuf {
        self.session_dir(Tier::Workstation)
    }

    pub fn subject_dir(&self, tier: Tier) -> PathBuf {
        self.roots
            .root(tier)
            .join(&self.identity.project)
            .join(&self.identity.subject)
    }

    /// Session directory on a tier. On the capture PC this is the
    /// session-qualified cache the shared cache is renamed to.
    pub fn session_dir(&self, tier: Tier) -> PathBuf {
        match tier {
            Tier::Capture => self.roots.capture_root.join(&self.identity.session),
            _ => self.subject_dir(tier).join(&self.identity.session),
        }
    }

    pub fn raw_data(&self, tier: Tier) -> PathBuf {
        self.session_dir(tier).join(RAW_DATA_DIR)
    }

    pub fn camera_frames(&self, tier: Tier) -> PathBuf {
        self.raw_data(tier).join(CAMERA_FRAMES_DIR)
    }

    pub fn mesoscope_frames(&self, tier: Tier) -> PathBuf {
        self.raw_data(tier).join(MESOSCOPE_FRAMES_DIR)
    }

    pub fn behavior_log(&self, tier: Tier) -> PathBuf {
        self.raw_data(tier).join(BEHAVIOR_LOG_DIR)
    }

    /// Staging area for frames pulled from the capture PC before transcoding.
    pub fn pulled_frames(&self) -> PathBuf {
        self.raw_data(Tier::Workstation).join(PULLED_FRAMES_DIR)
    }

    pub fn persistent_data(&self, tier: Tier) -> PathBuf {
        match tier {
            Tier::Capture => self
                .roots
                .capture_root
                .join(PERSISTENT_DATA_DIR)
                .join(&self.identity.project)
                .join(&self.identity.subject),
            _ => self.subject_dir(tier).join(PERSISTENT_DATA_DIR),
        }
    }

    pub fn metadata(&self, tier: Tier) -> PathBuf {
        self.subject_dir(tier).join(METADATA_DIR)
    }

    /// Shared capture-PC cache, reused by every session.
    pub fn capture_cache(&self) -> PathBuf {
        self.roots.capture_root.join(CAPTURE_CACHE_DIR)
    }

    pub fn snapshot_path(&self, tier: Tier) -> PathBuf {
        self.raw_data(tier).join(SNAPSHOT_FILENAME)
    }

    pub fn hardware_configuration_path(&self) -> PathBuf {
        self.raw_data(Tier::Workstation)
            .join(HARDWARE_CONFIGURATION_FILENAME)
    }

    /// Directories created eagerly when the session is set up on a tier.
    pub fn skeleton(&self, tier: Tier) -> Vec<PathBuf> {
        match tier {
            Tier::Capture => vec![self.capture_cache(), self.persistent_data(Tier::Capture)],
            Tier::Workstation => vec![
                self.camera_frames(tier),
                self.mesoscope_frames(tier),
                self.behavior_log(tier),
                self.persistent_data(tier),
                self.metadata(tier),
            ],
            Tier::Archive | Tier::Server => vec![
                self.camera_frames(tier),
                self.mesoscope_frames(tier),
                self.behavior_log(tier),
                self.metadata(tier),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> SessionTree {
        SessionTree::new(
            SessionIdentity {
                project: "vr_study".into(),
                subject: "A7".into(),
                session: "2024-03-01-12-00-00-000001".into(),
            },
            StorageRoots::under(Path::new("/base")),
        )
    }

    #[test]
    fn paths_are_pure_functions_of_identity_and_roots() {
        let t = tree();
        assert_eq!(
            t.raw_data(Tier::Workstation),
            PathBuf::from("/base/workstation/vr_study/A7/2024-03-01-12-00-00-000001/raw_data")
        );
        assert_eq!(
            t.raw_data(Tier::Server),
            PathBuf::from("/base/server/vr_study/A7/2024-03-01-12-00-00-000001/raw_data")
        );
        assert_eq!(
            t.session_dir(Tier::Capture),
            PathBuf::from("/base/capture/2024-03-01-12-00-00-000001")
        );
        assert_eq!(
            t.persistent_data(Tier::Capture),
            PathBuf::from("/base/capture/persistent_data/vr_study/A7")
        );
        assert_eq!(t.clone().path(), tree().path());
    }

    #[test]
    fn subject_level_directories_sit_beside_sessions() {
        let t = tree();
        assert_eq!(
            t.metadata(Tier::Archive),
            PathBuf::from("/base/archive/vr_study/A7/metadata")
        );
        assert_eq!(
            t.persistent_data(Tier::Workstation),
            PathBuf::from("/base/workstation/vr_study/A7/persistent_data")
        );
    }

    #[test]
    fn workstation_skeleton_has_all_caches() {
        let t = tree();
        let skeleton = t.skeleton(Tier::Workstation);
        assert!(skeleton.contains(&t.camera_frames(Tier::Workstation)));
        assert!(skeleton.contains(&t.mesoscope_frames(Tier::Workstation)));
        assert!(skeleton.contains(&t.behavior_log(Tier::Workstation)));
    }
}
