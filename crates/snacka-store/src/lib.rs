//! # snacka-store
//!
//! In-memory mirrors of server-owned entities for the Snacka client.
//!
//! Every domain store wraps a generic [`EntityStore`] and exposes merge
//! operations instead of raw setters, so replays, reordering and optimistic
//! echoes converge on the same state. Stores live for one connection session
//! and are not internally synchronized: a single owner task mutates them.

pub mod config;
pub mod entity;
pub mod members;
pub mod messages;
pub mod models;
pub mod notifications;
pub mod threads;
pub mod tombstones;
pub mod voice;

mod error;

pub use config::StoreConfig;
pub use entity::{Batch, ChangeSet, EntityStore, Notification, SubscriptionId};
pub use error::{Result, StoreError};
pub use members::MembershipStore;
pub use messages::MessageStore;
pub use models::*;
pub use notifications::NotificationStore;
pub use threads::ThreadStore;
pub use voice::VoiceStore;

/// Every domain store of one session.
pub struct Stores {
    pub messages: MessageStore,
    pub threads: ThreadStore,
    pub notifications: NotificationStore,
    pub members: MembershipStore,
    pub voice: VoiceStore,
}

impl Stores {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            messages: MessageStore::new(config),
            threads: ThreadStore::new(config),
            notifications: NotificationStore::new(config),
            members: MembershipStore::new(config),
            voice: VoiceStore::new(config),
        }
    }

    /// Drop all session state (logout).
    pub fn clear(&mut self) {
        self.messages.clear();
        self.threads.clear();
        self.notifications.clear();
        self.members.clear();
        self.voice.clear();
    }
}

impl Default for Stores {
    fn default() -> Self {
        Self::new(&StoreConfig::default())
    }
}
