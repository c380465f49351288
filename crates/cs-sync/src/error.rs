use cs_channel::{ChannelError, MappingError};
use cs_core::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("channel: {0}")]
    Channel(#[from] ChannelError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("mapping: {0}")]
    Mapping(#[from] MappingError),

    /// A full run is already in progress; runs never overlap.
    #[error("a reconciliation run is already in progress")]
    RunInProgress,

    /// A run finished but some records did not make it.
    #[error("{failed} record(s) failed, {unverified} left unverified")]
    PartialBatchFailure { failed: u64, unverified: u64 },

    #[error("webhook event {0} not found")]
    EventNotFound(uuid::Uuid),
}

pub type Result<T> = std::result::Result<T, SyncError>;
