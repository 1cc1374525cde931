use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::core::models::SessionTree;
use crate::error::Result;

/// Pulls ancillary per-subject records (surgery notes, water restriction
/// logs) from an external source into the subject's `metadata` directory.
#[async_trait]
pub trait MetadataSync: Send + Sync {
    async fn sync(&self, tree: &SessionTree) -> Result<()>;
}

/// Used when no external record source is configured.
pub struct NoopMetadataSync;

#[async_trait]
impl MetadataSync for NoopMetadataSync {
    async fn sync(&self, tree: &SessionTree) -> Result<()> {
        debug!(session = tree.session_name(), "No metadata source configured");
        Ok(())
    }
}

pub fn noop() -> Arc<dyn MetadataSync> {
    Arc::new(NoopMetadataSync)
}
