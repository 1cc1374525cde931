mod native_copy;

pub use native_copy::NativeCopyEngine;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::info;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub destination: PathBuf,
    pub files: usize,
    pub total_bytes: u64,
    pub duration_secs: u64,
    /// Destination checksum, equal to the source sidecar.
    pub checksum: String,
}

/// How a single source is fanned out to several destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DestinationPolicy {
    /// All destinations are written at once.
    #[default]
    Concurrent,
    /// One destination after another; the first failure stops the rest.
    Sequential,
}

/// Verified copy of a sealed directory tree.
///
/// An implementation must never modify or delete the source, and must only
/// report success once the destination checksum matches the source sidecar.
pub trait TransferEngine: Send + Sync {
    fn transfer(
        &self,
        req: &TransferRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TransferResult>> + Send>>;
}

/// Copy `source` to every destination under `policy`.
///
/// Succeeds only if every destination verified; on failure the first error is
/// returned after all in-flight copies have finished.
pub async fn copy_to_all(
    engine: Arc<dyn TransferEngine>,
    source: PathBuf,
    destinations: Vec<PathBuf>,
    policy: DestinationPolicy,
) -> Result<Vec<TransferResult>> {
    info!(
        source = %source.display(),
        destinations = destinations.len(),
        ?policy,
        "Copying to all destinations"
    );

    let requests: Vec<TransferRequest> = destinations
        .into_iter()
        .map(|destination| TransferRequest {
            source: source.clone(),
            destination,
        })
        .collect();

    match policy {
        DestinationPolicy::Sequential => {
            let mut results = Vec::with_capacity(requests.len());
            for req in &requests {
                results.push(engine.transfer(req).await?);
            }
            Ok(results)
        }
        DestinationPolicy::Concurrent => {
            let total = requests.len();
            let mut set = JoinSet::new();
            for (index, req) in requests.iter().enumerate() {
                let transfer = engine.transfer(req);
                set.spawn(async move { (index, transfer.await) });
            }

            let mut slots: Vec<Option<TransferResult>> = (0..total).map(|_| None).collect();
            let mut first_error = None;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((index, Ok(result))) => slots[index] = Some(result),
                    Ok((_, Err(e))) => {
                        first_error.get_or_insert(e);
                    }
                    Err(e) => {
                        first_error.get_or_insert(Error::Worker {
                            stage: "transfer",
                            message: e.to_string(),
                        });
                    }
                }
            }

            match first_error {
                Some(e) => Err(e),
                None => Ok(slots.into_iter().flatten().collect()),
            }
        }
    }
}
