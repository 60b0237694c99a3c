//! Push event dispatcher.
//!
//! Tracks the connection lifecycle, buffers live events while a catch-up
//! batch is outstanding, drops exact-duplicate deliveries and routes each
//! event to the merge operation of the store that owns it.
//!
//! ```text
//!  Disconnected ──> Connecting ──> Synced ──> Degraded ──> Connecting ...
//!        ^                                        |
//!        └──────────────── (closed) ──────────────┘
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use snacka_shared::protocol::{DeliveryKey, EventFrame, PushEvent};
use snacka_shared::types::ConnectionState;
use snacka_store::{MergeOutcome, Stores};

use crate::api::MentionParser;
use crate::config::SyncConfig;

/// A decoded event on its way to the stores.
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub event: PushEvent,
    pub event_id: Option<Uuid>,
}

impl Incoming {
    pub fn from_frame(frame: &EventFrame) -> Result<Self, snacka_shared::ProtocolError> {
        Ok(Self {
            event: PushEvent::decode(frame)?,
            event_id: frame.event_id,
        })
    }

    pub fn delivery_key(&self) -> DeliveryKey {
        self.event.delivery_key(self.event_id)
    }
}

/// Bounded, time-limited memory of recent deliveries.
#[derive(Debug)]
pub struct SeenSet {
    horizon: Duration,
    capacity: usize,
    order: VecDeque<(DeliveryKey, Instant)>,
    keys: HashSet<DeliveryKey>,
}

impl SeenSet {
    pub fn new(horizon: Duration, capacity: usize) -> Self {
        Self {
            horizon,
            capacity: capacity.max(1),
            order: VecDeque::new(),
            keys: HashSet::new(),
        }
    }

    /// Record `key`. Returns `false` if it was already seen within the
    /// horizon.
    pub fn insert(&mut self, key: DeliveryKey) -> bool {
        self.purge_expired();
        if self.keys.contains(&key) {
            return false;
        }
        self.keys.insert(key.clone());
        self.order.push_back((key, Instant::now()));
        while self.order.len() > self.capacity {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        true
    }

    pub fn purge_expired(&mut self) {
        let now = Instant::now();
        while let Some((key, at)) = self.order.front() {
            if now.duration_since(*at) < self.horizon {
                break;
            }
            self.keys.remove(key);
            self.order.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.keys.clear();
    }
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub applied: u64,
    pub unchanged: u64,
    pub stale: u64,
    pub duplicates: u64,
    /// Unknown, malformed or overflowed events.
    pub dropped: u64,
    pub buffered: u64,
    /// Events held behind an in-flight operation.
    pub held: u64,
    pub catch_ups: u64,
}

pub struct Dispatcher {
    state: ConnectionState,
    catching_up: bool,
    /// Events were lost to buffer overflow; another catch-up is needed.
    resync: bool,
    last_synced: Option<DateTime<Utc>>,
    buffer: VecDeque<Incoming>,
    max_buffered: usize,
    seen: SeenSet,
    mentions: Arc<dyn MentionParser>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(config: &SyncConfig, mentions: Arc<dyn MentionParser>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            catching_up: false,
            resync: false,
            last_synced: None,
            buffer: VecDeque::new(),
            max_buffered: config.max_buffered_events,
            seen: SeenSet::new(config.seen_horizon, config.seen_capacity),
            mentions,
            stats: DispatchStats::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn is_catching_up(&self) -> bool {
        self.catching_up
    }

    pub fn last_synced(&self) -> Option<DateTime<Utc>> {
        self.last_synced
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            info!(from = ?self.state, to = ?next, "Connection state changed");
            self.state = next;
        }
    }

    // -- lifecycle -----------------------------------------------------------

    pub fn on_connecting(&mut self) {
        self.transition(ConnectionState::Connecting);
    }

    /// The transport is up. Returns the `since` bound of the catch-up batch
    /// to request.
    pub fn on_connected(&mut self) -> Option<DateTime<Utc>> {
        self.transition(ConnectionState::Synced);
        self.begin_catch_up()
    }

    /// Start (or restart) a catch-up. Live events are buffered until
    /// [`complete_catch_up`](Self::complete_catch_up).
    pub fn begin_catch_up(&mut self) -> Option<DateTime<Utc>> {
        self.catching_up = true;
        self.stats.catch_ups += 1;
        debug!(since = ?self.last_synced, "Requesting catch-up batch");
        self.last_synced
    }

    /// Catch-up fetch failed; stay buffering and retry later.
    pub fn catch_up_failed(&mut self) {
        self.transition(ConnectionState::Degraded);
    }

    /// Feed the catch-up batch, then release the buffered live events
    /// behind it, in that order. Returns the events to apply.
    pub fn complete_catch_up(
        &mut self,
        frames: Vec<EventFrame>,
        requested_at: DateTime<Utc>,
    ) -> Vec<Incoming> {
        let mut ready = Vec::with_capacity(frames.len() + self.buffer.len());
        for frame in &frames {
            if let Some(incoming) = self.decode(frame) {
                ready.push(incoming);
            }
        }
        let backlog = ready.len();
        ready.extend(self.buffer.drain(..));

        // An overflowed window keeps the old bound so the next batch covers it.
        if !self.resync {
            self.last_synced = Some(requested_at);
        }
        self.catching_up = false;
        self.transition(ConnectionState::Synced);
        info!(backlog, live = ready.len() - backlog, "Catch-up complete");
        ready
    }

    /// Whether events were dropped while buffering. Clears the flag.
    pub fn take_resync(&mut self) -> bool {
        std::mem::take(&mut self.resync)
    }

    pub fn on_disconnected(&mut self, reason: &str) {
        warn!(reason, "Push connection lost");
        self.catching_up = true;
        self.transition(ConnectionState::Degraded);
    }

    /// Transport gone for good.
    pub fn on_closed(&mut self) {
        self.catching_up = false;
        self.transition(ConnectionState::Disconnected);
    }

    /// Forget the session (logout).
    pub fn reset(&mut self) {
        self.catching_up = false;
        self.resync = false;
        self.last_synced = None;
        self.buffer.clear();
        self.seen.clear();
        self.stats = DispatchStats::default();
        self.transition(ConnectionState::Disconnected);
    }

    // -- events --------------------------------------------------------------

    fn decode(&mut self, frame: &EventFrame) -> Option<Incoming> {
        match Incoming::from_frame(frame) {
            Ok(incoming) => Some(incoming),
            Err(e) => {
                warn!(kind = %frame.kind, error = %e, "Dropping undecodable event");
                self.stats.dropped += 1;
                None
            }
        }
    }

    /// Decode a live frame. Returns the event if it may be applied now;
    /// `None` if it was dropped or buffered behind a catch-up.
    pub fn accept(&mut self, bytes: &[u8]) -> Option<Incoming> {
        let frame = match EventFrame::from_bytes(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping invalid frame");
                self.stats.dropped += 1;
                return None;
            }
        };
        let incoming = self.decode(&frame)?;

        if self.catching_up || self.state != ConnectionState::Synced {
            if self.buffer.len() >= self.max_buffered {
                warn!(
                    limit = self.max_buffered,
                    kind = incoming.event.kind(),
                    "Catch-up buffer full, dropping live event"
                );
                self.stats.dropped += 1;
                self.resync = true;
                return None;
            }
            self.buffer.push_back(incoming);
            self.stats.buffered += 1;
            return None;
        }
        Some(incoming)
    }

    /// Exact-duplicate filter. Returns `false` for a replayed delivery.
    pub fn admit(&mut self, incoming: &Incoming) -> bool {
        if self.seen.insert(incoming.delivery_key()) {
            return true;
        }
        debug!(kind = incoming.event.kind(), "Dropping duplicate delivery");
        self.stats.duplicates += 1;
        false
    }

    pub fn note_held(&mut self) {
        self.stats.held += 1;
    }

    /// Apply one event to its store.
    pub fn route(&mut self, stores: &mut Stores, event: PushEvent) -> MergeOutcome {
        let kind = event.kind();
        let outcome = match event {
            PushEvent::MessageCreated(mut p) => {
                if p.mentions.is_empty() {
                    p.mentions = self.mentions.mentioned_users(&p.content);
                }
                stores.messages.merge_message(p)
            }
            PushEvent::MessageEdited(e) => stores.messages.apply_edit(e.id, e.content, e.edited_at),
            PushEvent::MessageDeleted(d) => {
                if stores.threads.is_open(d.id) {
                    stores.threads.close();
                }
                match stores.messages.delete(d.id) {
                    Some(_) => MergeOutcome::Applied,
                    None => MergeOutcome::Unchanged,
                }
            }
            PushEvent::ThreadReplyCreated(p) => stores.threads.merge_reply(p),
            PushEvent::ThreadReplyDeleted(d) => {
                let removed = stores.threads.remove_reply(&d.id).is_some();
                let decremented = stores.messages.on_reply_deleted(d.parent_id, d.id);
                if removed || decremented {
                    MergeOutcome::Applied
                } else {
                    MergeOutcome::Unchanged
                }
            }
            PushEvent::ThreadMetadataUpdated(m) => {
                stores
                    .messages
                    .apply_thread_metadata(m.parent_id, m.reply_count, m.last_reply_at)
            }
            PushEvent::NotificationReceived(p) => stores.notifications.merge_notification(p),
            PushEvent::NotificationRead(r) => stores.notifications.mark_read_by_server(&r.id),
            PushEvent::NotificationDeleted(d) => {
                match stores.notifications.remove_by_server(&d.id) {
                    Some(_) => MergeOutcome::Applied,
                    None => MergeOutcome::Unchanged,
                }
            }
            PushEvent::MemberUpserted(p) => stores.members.merge_member(p),
            PushEvent::MemberRemoved(r) => stores.members.merge_removal(r),
            PushEvent::MemberRoleChanged(c) => stores.members.apply_role_change(c),
            PushEvent::VoiceStateUpdated(s) => stores.voice.merge_state(s),
            PushEvent::VoiceParticipantLeft(l) => {
                stores.voice.leave(l.channel_id, l.user_id, l.left_at)
            }
        };

        match outcome {
            MergeOutcome::Applied => self.stats.applied += 1,
            MergeOutcome::Unchanged => self.stats.unchanged += 1,
            MergeOutcome::Stale => {
                debug!(kind, "Stale event dropped");
                self.stats.stale += 1;
            }
        }
        outcome
    }
}
