use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use snacka_shared::protocol::NotificationPayload;
use snacka_shared::types::{InviteId, LocalId, NotificationId, NotificationKind};

use crate::config::StoreConfig;
use crate::entity::{EntityStore, Notification, SubscriptionId};
use crate::models::{within, MergeOutcome, NotificationItem};
use crate::tombstones::Tombstones;

/// The activity feed: newest first, capped, at most one item per server id.
pub struct NotificationStore {
    items: EntityStore<LocalId, NotificationItem>,
    by_server: HashMap<NotificationId, LocalId>,
    tombstones: Tombstones<NotificationId>,
    /// Read receipts that arrived before their notification.
    read_ahead: Tombstones<NotificationId>,
    match_window: chrono::Duration,
    unread: usize,
}

impl NotificationStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            items: EntityStore::new()
                .with_order(|a: &NotificationItem, b: &NotificationItem| {
                    b.timestamp.cmp(&a.timestamp)
                })
                .with_capacity_limit(config.notification_cap),
            by_server: HashMap::new(),
            tombstones: Tombstones::new(config.tombstone_ttl),
            read_ahead: Tombstones::new(config.tombstone_ttl),
            match_window: config.match_window,
            unread: 0,
        }
    }

    pub fn get(&self, id: &LocalId) -> Option<&NotificationItem> {
        self.items.get(id)
    }

    pub fn find_by_server(&self, server_id: &NotificationId) -> Option<&NotificationItem> {
        self.by_server
            .get(server_id)
            .and_then(|local| self.items.get(local))
    }

    pub fn find_by_invite(&self, invite_id: &InviteId) -> Option<&NotificationItem> {
        self.items
            .values()
            .find(|item| item.invite_id.as_ref() == Some(invite_id))
    }

    pub fn get_all(&self) -> Vec<NotificationItem> {
        self.items.get_all()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn unread_count(&self) -> usize {
        self.unread
    }

    pub fn subscribe(
        &mut self,
        listener: impl FnMut(&mut Notification<'_, LocalId, NotificationItem>) + Send + 'static,
    ) -> SubscriptionId {
        self.items.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.items.unsubscribe(id)
    }

    pub fn merge_notification(&mut self, mut payload: NotificationPayload) -> MergeOutcome {
        if self.tombstones.contains(&payload.id) {
            debug!(notification = %payload.id.short(), "Ignoring notification for deleted id");
            return MergeOutcome::Stale;
        }
        if self.read_ahead.contains(&payload.id) {
            self.read_ahead.lift(&payload.id);
            payload.is_read = true;
        }

        let outcome = if let Some(local) = self.by_server.get(&payload.id).copied() {
            self.merge_existing(local, &payload)
        } else if let Some(local) = self.find_optimistic(&payload) {
            debug!(local = %local.short(), server = %payload.id.short(), "Adopted local notification");
            self.items
                .upsert(local, NotificationItem::from_payload(local, payload));
            MergeOutcome::Applied
        } else {
            let local = LocalId::new();
            self.items
                .upsert(local, NotificationItem::from_payload(local, payload));
            MergeOutcome::Applied
        };

        self.recompute();
        outcome
    }

    fn merge_existing(&mut self, local: LocalId, p: &NotificationPayload) -> MergeOutcome {
        let Some(existing) = self.items.get(&local) else {
            return MergeOutcome::Unchanged;
        };
        let stale = (existing.is_read && !p.is_read) || p.timestamp < existing.timestamp;

        let changed = self.items.update(&local, |item| {
            item.is_read |= p.is_read;
            item.timestamp = item.timestamp.max(p.timestamp);
            if item.preview.is_none() {
                item.preview = p.preview.clone();
            }
        });
        match (changed, stale) {
            (true, _) => MergeOutcome::Applied,
            (false, true) => MergeOutcome::Stale,
            (false, false) => MergeOutcome::Unchanged,
        }
    }

    /// Local item without a server id that this payload is the server copy of.
    fn find_optimistic(&self, p: &NotificationPayload) -> Option<LocalId> {
        self.items
            .values()
            .find(|item| {
                if item.server_id.is_some() || item.kind != p.kind {
                    return false;
                }
                if item.invite_id.is_some() && item.invite_id == p.invite_id {
                    return true;
                }
                item.message_id.is_some()
                    && item.message_id == p.message_id
                    && item.actor_id == p.actor_id
                    && item.preview == p.preview
                    && within(item.timestamp, p.timestamp, self.match_window)
            })
            .map(|item| item.id)
    }

    /// Add an item that has no server id yet.
    pub fn insert_local(&mut self, item: NotificationItem) -> LocalId {
        let id = item.id;
        self.items.upsert(id, item);
        self.recompute();
        id
    }

    /// Mark one item read. Returns the prior read state for rollback.
    pub fn mark_read(&mut self, id: &LocalId) -> Option<bool> {
        let prior = self.items.get(id).map(|item| item.is_read)?;
        self.items.update(id, |item| item.is_read = true);
        self.recompute();
        Some(prior)
    }

    /// Apply a `notification_read` push event. A receipt for an id not yet
    /// seen is held until the notification arrives.
    pub fn mark_read_by_server(&mut self, server_id: &NotificationId) -> MergeOutcome {
        let Some(local) = self.by_server.get(server_id).copied() else {
            if !self.tombstones.contains(server_id) {
                debug!(notification = %server_id.short(), "Holding read receipt for unseen notification");
                self.read_ahead.insert(*server_id);
            }
            return MergeOutcome::Unchanged;
        };
        let outcome = if self.items.update(&local, |item| item.is_read = true) {
            MergeOutcome::Applied
        } else {
            MergeOutcome::Unchanged
        };
        self.recompute();
        outcome
    }

    /// Put a read flag back after a failed mark-read. Only local rollback may
    /// clear `is_read`.
    pub fn restore_read_state(&mut self, id: &LocalId, is_read: bool) -> bool {
        let changed = self.items.update(id, |item| item.is_read = is_read);
        self.recompute();
        changed
    }

    pub fn remove(&mut self, id: &LocalId) -> Option<NotificationItem> {
        let removed = self.items.remove(id)?;
        if let Some(server_id) = removed.server_id {
            self.tombstones.insert(server_id);
        }
        self.recompute();
        Some(removed)
    }

    pub fn remove_by_server(&mut self, server_id: &NotificationId) -> Option<NotificationItem> {
        self.tombstones.insert(*server_id);
        let local = self.by_server.get(server_id).copied()?;
        let removed = self.items.remove(&local);
        self.recompute();
        removed
    }

    /// Undo a local removal.
    pub fn restore(&mut self, item: NotificationItem) {
        if let Some(server_id) = &item.server_id {
            self.tombstones.lift(server_id);
        }
        self.items.upsert(item.id, item);
        self.recompute();
    }

    /// Items of one kind created after `since`, newest first.
    pub fn of_kind(&self, kind: NotificationKind, since: DateTime<Utc>) -> Vec<&NotificationItem> {
        self.items
            .values()
            .filter(|item| item.kind == kind && item.timestamp >= since)
            .collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.tombstones.clear();
        self.read_ahead.clear();
        self.recompute();
    }

    fn recompute(&mut self) {
        self.by_server = self
            .items
            .values()
            .filter_map(|item| item.server_id.map(|server| (server, item.id)))
            .collect();
        self.unread = self.items.values().filter(|item| !item.is_read).count();
    }
}
