//! # snacka-replay
//!
//! Feeds a recorded push-transport log through a real sync engine and prints
//! the resulting store state and dispatcher statistics as JSON. Useful for
//! reproducing ordering and duplicate-delivery bugs from field recordings.

mod recording;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use snacka_client::{SyncConfig, SyncEngine, SyncHandle, SyncStats, UuidMentions};
use snacka_shared::constants::APP_NAME;
use snacka_shared::types::UserId;
use snacka_store::Stores;

use crate::recording::{LogHost, ReplayApi};

/// Replay command line arguments.
#[derive(Parser, Debug)]
#[command(name = "snacka-replay")]
#[command(about = "Replay a recorded push-event log through the Snacka sync engine")]
struct Args {
    /// Transport recording, one JSON object per line
    #[arg(short, long, value_name = "FILE")]
    log: PathBuf,

    /// Catch-up batch served on the first connect, one event frame per line
    #[arg(short, long, value_name = "FILE")]
    backlog: Option<PathBuf>,

    /// Signed-in user id (random when omitted)
    #[arg(short, long, value_name = "UUID")]
    user: Option<Uuid>,

    /// How long to wait for an outstanding catch-up before reporting
    #[arg(long, value_name = "MS", default_value_t = 5_000)]
    settle_ms: u64,
}

#[derive(Debug, Serialize)]
struct Summary {
    user: UserId,
    stores: StoreSummary,
    sync: SyncStats,
}

#[derive(Debug, Serialize)]
struct StoreSummary {
    messages: usize,
    pending_messages: usize,
    mentions_of_user: usize,
    open_thread: Option<String>,
    thread_replies: usize,
    notifications: usize,
    unread_notifications: usize,
    members: usize,
    voice_participants: usize,
}

impl StoreSummary {
    fn collect(stores: &Stores, user: UserId) -> Self {
        Self {
            messages: stores.messages.len(),
            pending_messages: stores.messages.pending_count(),
            mentions_of_user: stores.messages.mention_count(user),
            open_thread: stores.threads.open_thread().map(|id| id.to_string()),
            thread_replies: stores.threads.len(),
            notifications: stores.notifications.len(),
            unread_notifications: stores.notifications.unread_count(),
            members: stores.members.len(),
            voice_participants: stores.voice.len(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    snacka_client::init_tracing();

    info!("Starting {} replay v{}", APP_NAME, env!("CARGO_PKG_VERSION"));
    let config = SyncConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 1. Load the recording
    // -----------------------------------------------------------------------
    let log = tokio::fs::read_to_string(&args.log)
        .await
        .with_context(|| format!("reading {}", args.log.display()))?;
    let events = recording::parse_log(&log)?;

    let backlog = match &args.backlog {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            recording::parse_backlog(&text)?
        }
        None => Vec::new(),
    };
    info!(events = events.len(), backlog = backlog.len(), "Recording loaded");

    // -----------------------------------------------------------------------
    // 2. Start the engine
    // -----------------------------------------------------------------------
    let user = args.user.map(UserId::from).unwrap_or_else(UserId::new);
    let (transport, transport_rx) = mpsc::channel(1);
    let (handle, task) = SyncEngine::spawn(
        config,
        user,
        Arc::new(ReplayApi::new(backlog)),
        Arc::new(LogHost),
        Arc::new(UuidMentions),
        transport_rx,
    );

    // -----------------------------------------------------------------------
    // 3. Feed the transport and let the engine settle
    // -----------------------------------------------------------------------
    for event in events {
        transport
            .send(event)
            .await
            .context("sync engine stopped during replay")?;
    }
    // A free slot on the single-slot channel means the last event was taken.
    drop(
        transport
            .reserve()
            .await
            .context("sync engine stopped during replay")?,
    );
    settle(&handle, Duration::from_millis(args.settle_ms)).await?;

    // -----------------------------------------------------------------------
    // 4. Report
    // -----------------------------------------------------------------------
    let stores = handle
        .read(move |stores| StoreSummary::collect(stores, user))
        .await?;
    let summary = Summary {
        user,
        stores,
        sync: handle.stats().await?,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    handle.shutdown().await;
    task.await.context("sync engine task panicked")?;
    Ok(())
}

/// Wait until no catch-up is outstanding, or `limit` passes.
async fn settle(handle: &SyncHandle, limit: Duration) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let stats = handle.stats().await?;
        if !stats.catching_up {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(buffered = stats.buffered, "Catch-up still outstanding, reporting anyway");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
