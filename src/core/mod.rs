pub mod checksum;
pub mod hardware;
pub mod log_compactor;
pub mod markers;
pub mod metadata_sync;
pub mod models;
pub mod orchestrator;
pub mod pull;
pub mod session;
pub mod transcoder;
pub mod transfer_engine;
pub mod workers;

pub use hardware::HardwareConfiguration;
pub use models::{SessionIdentity, SessionTree, StorageRoots, Tier};
pub use orchestrator::{Orchestrator, PreprocessReport};
pub use transfer_engine::{DestinationPolicy, TransferEngine, TransferRequest, TransferResult};
