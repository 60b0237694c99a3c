//! Sync engine configuration loaded from environment variables.
//!
//! Every setting has a default, so the engine runs with zero configuration.

use std::str::FromStr;
use std::time::Duration;

use snacka_shared::constants::{
    BACKOFF_BASE_MS, BACKOFF_MAX_MS, DEFAULT_ACQUIRE_TIMEOUT_MS, DEFAULT_QUARANTINE_MS,
    MAX_BUFFERED_EVENTS, OPERATION_HISTORY, SEEN_CAPACITY, SEEN_HORIZON_SECS,
};
use snacka_store::StoreConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Delay between an exclusive resource's release and its next grant.
    /// Env: `SNACKA_QUARANTINE_MS`
    pub quarantine: Duration,

    /// How long a queued resource claimant waits before being denied.
    /// Env: `SNACKA_ACQUIRE_TIMEOUT_MS`
    pub acquire_timeout: Duration,

    /// How long a delivery stays in the duplicate seen-set.
    /// Env: `SNACKA_SEEN_HORIZON_SECS`
    pub seen_horizon: Duration,

    /// Upper bound on remembered deliveries.
    /// Env: `SNACKA_SEEN_CAPACITY`
    pub seen_capacity: usize,

    /// Live events buffered while a catch-up batch is outstanding.
    /// Env: `SNACKA_MAX_BUFFERED_EVENTS`
    pub max_buffered_events: usize,

    /// Catch-up retry backoff.
    /// Env: `SNACKA_BACKOFF_BASE_MS`, `SNACKA_BACKOFF_MAX_MS`
    pub backoff_base: Duration,
    pub backoff_max: Duration,

    /// Resolved operations kept for diagnostics.
    pub operation_history: usize,

    /// Domain store tunables.
    /// Env: `SNACKA_NOTIFICATION_CAP`, `SNACKA_TOMBSTONE_TTL_SECS`,
    /// `SNACKA_MATCH_WINDOW_SECS`
    pub store: StoreConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            quarantine: Duration::from_millis(DEFAULT_QUARANTINE_MS),
            acquire_timeout: Duration::from_millis(DEFAULT_ACQUIRE_TIMEOUT_MS),
            seen_horizon: Duration::from_secs(SEEN_HORIZON_SECS),
            seen_capacity: SEEN_CAPACITY,
            max_buffered_events: MAX_BUFFERED_EVENTS,
            backoff_base: Duration::from_millis(BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(BACKOFF_MAX_MS),
            operation_history: OPERATION_HISTORY,
            store: StoreConfig::default(),
        }
    }
}

/// Parse one variable, warning (and keeping the default) on bad input.
fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Invalid value, using default");
            None
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, "SNACKA_QUARANTINE_MS") {
            config.quarantine = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "SNACKA_ACQUIRE_TIMEOUT_MS") {
            config.acquire_timeout = Duration::from_millis(ms);
        }

        // -- Dispatcher --

        if let Some(secs) = parse_var::<u64>(&lookup, "SNACKA_SEEN_HORIZON_SECS") {
            config.seen_horizon = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "SNACKA_SEEN_CAPACITY") {
            config.seen_capacity = n.max(1);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "SNACKA_MAX_BUFFERED_EVENTS") {
            config.max_buffered_events = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "SNACKA_BACKOFF_BASE_MS") {
            config.backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "SNACKA_BACKOFF_MAX_MS") {
            config.backoff_max = Duration::from_millis(ms);
        }

        // -- Stores --

        if let Some(n) = parse_var::<usize>(&lookup, "SNACKA_NOTIFICATION_CAP") {
            if n == 0 {
                tracing::warn!("SNACKA_NOTIFICATION_CAP must be positive, using default");
            } else {
                config.store.notification_cap = n;
            }
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "SNACKA_TOMBSTONE_TTL_SECS") {
            config.store.tombstone_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<i64>(&lookup, "SNACKA_MATCH_WINDOW_SECS") {
            config.store.match_window = chrono::Duration::seconds(secs.max(0));
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.quarantine, Duration::from_millis(250));
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.store.notification_cap, 50);
        assert_eq!(SyncConfig::from_lookup(|_| None), config);
    }

    #[test]
    fn test_overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("SNACKA_QUARANTINE_MS", "400"),
            ("SNACKA_NOTIFICATION_CAP", "20"),
            ("SNACKA_MATCH_WINDOW_SECS", " 10 "),
        ]));
        assert_eq!(config.quarantine, Duration::from_millis(400));
        assert_eq!(config.store.notification_cap, 20);
        assert_eq!(config.store.match_window, chrono::Duration::seconds(10));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("SNACKA_QUARANTINE_MS", "soon"),
            ("SNACKA_NOTIFICATION_CAP", "0"),
        ]));
        assert_eq!(config.quarantine, Duration::from_millis(DEFAULT_QUARANTINE_MS));
        assert_eq!(config.store.notification_cap, 50);
    }
}
