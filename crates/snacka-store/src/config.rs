use std::time::Duration;

use snacka_shared::constants::{NOTIFICATION_CAP, OPTIMISTIC_MATCH_WINDOW_SECS, TOMBSTONE_TTL_SECS};

/// Tunables for the domain stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Activity feed ring size.
    pub notification_cap: usize,
    /// How long a local deletion blocks stale events for the same id.
    pub tombstone_ttl: Duration,
    /// How far apart an optimistic entry and its server copy may be stamped
    /// and still be matched without a correlation id.
    pub match_window: chrono::Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            notification_cap: NOTIFICATION_CAP,
            tombstone_ttl: Duration::from_secs(TOMBSTONE_TTL_SECS),
            match_window: chrono::Duration::seconds(OPTIMISTIC_MATCH_WINDOW_SECS),
        }
    }
}
