use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::metadata_sync::{self, MetadataSync};
use crate::core::pull::{LogOperator, Operator};
use crate::core::transfer_engine::{NativeCopyEngine, TransferEngine};

/// Configuration plus the collaborators preprocessing calls out to.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub operator: Arc<dyn Operator>,
    pub metadata_sync: Arc<dyn MetadataSync>,
}

impl AppContext {
    /// Unattended context: missing capture files fail after the configured
    /// attempts and no metadata is synced.
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            operator: Arc::new(LogOperator),
            metadata_sync: metadata_sync::noop(),
        }
    }

    pub fn with_operator(mut self, operator: Arc<dyn Operator>) -> Self {
        self.operator = operator;
        self
    }

    pub fn with_metadata_sync(mut self, metadata_sync: Arc<dyn MetadataSync>) -> Self {
        self.metadata_sync = metadata_sync;
        self
    }

    /// Copy engine configured for a transfer stage with `workers` parallel copies.
    pub fn transfer_engine(&self, workers: usize) -> Arc<dyn TransferEngine> {
        Arc::new(NativeCopyEngine {
            sync_files: self.config.transfer.sync_files,
            workers,
            checksum_workers: self.config.workers.checksum,
        })
    }
}
