use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::models::StorageRoots;
use crate::core::transfer_engine::DestinationPolicy;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "labvault.toml";

/// Environment variable prefix; nested keys are separated by `__`,
/// e.g. `LABVAULT_WORKERS__CHECKSUM=16`.
pub const ENV_PREFIX: &str = "LABVAULT_";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageRoots,
    pub workers: WorkerConfig,
    pub transcoder: TranscoderConfig,
    pub transfer: TransferConfig,
    pub pull: PullConfig,
    pub compaction: CompactionConfig,
    pub log: LogSettings,
}

/// Parallelism per stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub checksum: usize,
    pub transfer: usize,
    pub pull: usize,
    pub transcode: usize,
    pub compaction: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            checksum: cores,
            transfer: 16,
            pull: 30,
            transcode: (cores / 2).max(1),
            compaction: cores,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscoderConfig {
    pub batch_size: usize,
    pub verify_integrity: bool,
    pub remove_sources: bool,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            batch_size: 250,
            verify_integrity: true,
            remove_sources: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub destination_policy: DestinationPolicy,
    pub sync_files: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            destination_policy: DestinationPolicy::Concurrent,
            sync_files: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullConfig {
    pub max_attempts: u32,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub verify_integrity: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub json: bool,
    pub verbose: bool,
}

impl AppConfig {
    /// Layer defaults, the config file, `LABVAULT_*` environment variables and
    /// finally `overrides` (usually the parsed command line).
    pub fn load<T: Serialize>(
        config_file: Option<&Path>,
        overrides: Option<&T>,
    ) -> Result<Self, Box<figment::Error>> {
        let file = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract().map_err(Box::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_without_file() {
        let temp = tempdir().unwrap();
        let config =
            AppConfig::load(Some(&temp.path().join("missing.toml")), None::<&()>).unwrap();

        assert_eq!(config.transcoder.batch_size, 250);
        assert_eq!(config.pull.max_attempts, 5);
        assert_eq!(
            config.transfer.destination_policy,
            DestinationPolicy::Concurrent
        );
        assert!(config.workers.checksum >= 1);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("labvault.toml");
        std::fs::write(
            &path,
            r#"
[storage]
capture_root = "/mnt/scanimage"
workstation_root = "/data"
archive_root = "/mnt/nas"
server_root = "/mnt/server"

[transfer]
destination_policy = "sequential"

[transcoder]
batch_size = 64
"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path), None::<&()>).unwrap();
        assert_eq!(config.storage.capture_root, PathBuf::from("/mnt/scanimage"));
        assert_eq!(
            config.transfer.destination_policy,
            DestinationPolicy::Sequential
        );
        assert_eq!(config.transcoder.batch_size, 64);
        assert!(config.transcoder.verify_integrity, "unset keys keep defaults");
    }

    #[test]
    fn test_overrides_win() {
        let temp = tempdir().unwrap();
        let mut log = BTreeMap::new();
        log.insert("verbose", true);
        let mut overrides = BTreeMap::new();
        overrides.insert("log", log);

        let config = AppConfig::load(Some(&temp.path().join("none.toml")), Some(&overrides))
            .unwrap();
        assert!(config.log.verbose);
        assert!(!config.log.json);
    }
}
