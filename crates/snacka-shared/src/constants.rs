/// Application name
pub const APP_NAME: &str = "Snacka";

/// Maximum number of items kept in the activity feed
pub const NOTIFICATION_CAP: usize = 50;

/// How long a locally deleted entity blocks stale resurrection (5 minutes)
pub const TOMBSTONE_TTL_SECS: u64 = 300;

/// Window in which a server payload may adopt a matching optimistic entry
pub const OPTIMISTIC_MATCH_WINDOW_SECS: i64 = 30;

/// Horizon of the dispatcher's duplicate-delivery seen-set (10 minutes)
pub const SEEN_HORIZON_SECS: u64 = 600;

/// Upper bound on remembered deliveries regardless of horizon
pub const SEEN_CAPACITY: usize = 4096;

/// Live events buffered while a catch-up batch is outstanding
pub const MAX_BUFFERED_EVENTS: usize = 10_000;

/// Delay between resource release and reacquire
pub const DEFAULT_QUARANTINE_MS: u64 = 250;

/// Longest a queued resource claimant waits before being denied
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 5_000;

/// Catch-up retry backoff
pub const BACKOFF_BASE_MS: u64 = 500;
pub const BACKOFF_MAX_MS: u64 = 30_000;

/// Resolved operations kept for diagnostics
pub const OPERATION_HISTORY: usize = 64;

/// Engine command channel depth
pub const COMMAND_CHANNEL_CAPACITY: usize = 256;
