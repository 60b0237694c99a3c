//! # snacka-client
//!
//! Real-time sync core of the Snacka client: the event dispatcher, the
//! reconciler for optimistic mutations, the exclusive resource broker, and
//! the engine task that owns the domain stores from `snacka-store`.
//!
//! A host application spawns one [`SyncEngine`] per signed-in session, feeds
//! it [`TransportEvent`]s from its push connection, implements
//! [`RequestApi`] over its request channel and [`ResourceHost`] over its
//! platform resources, and talks to the engine through [`SyncHandle`].

pub mod api;
pub mod backoff;
pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod reconciler;

mod error;

use tracing_subscriber::{fmt, EnvFilter};

pub use api::{
    ApiRequest, ApiResponse, MentionParser, NoMentions, RequestApi, ResourceHost, TransportEvent,
    UuidMentions,
};
pub use broker::{ExclusiveResourceLease, Lease, LeasePhase, ResourceBroker};
pub use config::SyncConfig;
pub use dispatcher::{DispatchStats, Dispatcher, Incoming};
pub use engine::{Intent, Receipt, SyncEngine, SyncHandle, SyncStats};
pub use error::{Result, SyncError};
pub use reconciler::{OperationKind, OperationStatus, PendingOperation, Reconciler, Rollback};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "snacka_client=debug,snacka_store=info,warn";

/// Install the fmt subscriber. Does nothing if one is already installed.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
