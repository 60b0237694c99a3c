use thiserror::Error;

use snacka_shared::types::ResourceId;
use snacka_shared::RequestError;
use snacka_store::StoreError;

/// Errors surfaced by the sync engine and its handle.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The server refused or failed a mutate action. The optimistic change
    /// has already been rolled back.
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("Resource {resource} denied after waiting {waited_ms} ms")]
    ResourceDenied { resource: ResourceId, waited_ms: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Resource host failed: {0}")]
    Host(String),

    #[error("Sync engine is not running")]
    EngineClosed,

    #[error("Session ended before the operation resolved")]
    SessionEnded,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;
