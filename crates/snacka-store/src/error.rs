use thiserror::Error;

use snacka_shared::types::CommunityId;

/// Errors produced by the store layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The targeted entity is not in the store.
    #[error("Record not found")]
    NotFound,

    /// The change would leave a community without an owner.
    #[error("Community {community} must keep exactly one owner")]
    SoleOwner { community: CommunityId },

    /// A thread reply was composed with no thread open for its parent.
    #[error("No open thread for this reply")]
    ThreadNotOpen,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
