use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use snacka_shared::protocol::MessagePayload;
use snacka_shared::types::{ChannelId, Delivery, MessageId, UserId};

use crate::config::StoreConfig;
use crate::entity::{EntityStore, Notification, SubscriptionId};
use crate::models::{within, MergeOutcome, Message};
use crate::tombstones::Tombstones;

/// Channel timelines, ordered by creation time.
pub struct MessageStore {
    entries: EntityStore<MessageId, Message>,
    tombstones: Tombstones<MessageId>,
    /// Thread replies whose deletion has already been counted.
    deleted_replies: Tombstones<MessageId>,
    match_window: chrono::Duration,
    channel_counts: HashMap<ChannelId, usize>,
    mention_counts: HashMap<UserId, usize>,
}

fn is_newer(incoming: Option<DateTime<Utc>>, stored: Option<DateTime<Utc>>) -> bool {
    match (incoming, stored) {
        (Some(incoming), Some(stored)) => incoming > stored,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Field-level merge of a payload onto the stored message.
fn merge_fields(existing: &Message, p: &MessagePayload) -> Message {
    let mut merged = existing.clone();
    if is_newer(p.edited_at, existing.edited_at) {
        merged.content = p.content.clone();
        merged.edited_at = p.edited_at;
    }
    merged.reply_count = existing.reply_count.max(p.reply_count);
    merged.last_reply_at = existing.last_reply_at.max(p.last_reply_at);
    if merged.mentions.is_empty() {
        merged.mentions = p.mentions.clone();
    }
    merged.delivery = Delivery::Confirmed;
    merged
}

impl MessageStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            entries: EntityStore::new()
                .with_order(|a: &Message, b: &Message| a.created_at.cmp(&b.created_at)),
            tombstones: Tombstones::new(config.tombstone_ttl),
            deleted_replies: Tombstones::new(config.tombstone_ttl),
            match_window: config.match_window,
            channel_counts: HashMap::new(),
            mention_counts: HashMap::new(),
        }
    }

    // -- reads ---------------------------------------------------------------

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.entries.get(id)
    }

    pub fn get_all(&self) -> Vec<Message> {
        self.entries.get_all()
    }

    pub fn channel_messages(&self, channel_id: ChannelId) -> Vec<&Message> {
        self.entries
            .values()
            .filter(|m| m.channel_id == channel_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn channel_count(&self, channel_id: ChannelId) -> usize {
        self.channel_counts.get(&channel_id).copied().unwrap_or(0)
    }

    pub fn mention_count(&self, user_id: UserId) -> usize {
        self.mention_counts.get(&user_id).copied().unwrap_or(0)
    }

    pub fn pending_count(&self) -> usize {
        self.entries.values().filter(|m| m.is_pending()).count()
    }

    pub fn is_deleted(&self, id: &MessageId) -> bool {
        self.tombstones.contains(id)
    }

    pub fn subscribe(
        &mut self,
        listener: impl FnMut(&mut Notification<'_, MessageId, Message>) + Send + 'static,
    ) -> SubscriptionId {
        self.entries.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.entries.unsubscribe(id)
    }

    // -- merges --------------------------------------------------------------

    /// Merge a server message (push event, catch-up or response).
    pub fn merge_message(&mut self, payload: MessagePayload) -> MergeOutcome {
        if self.tombstones.contains(&payload.id) {
            debug!(msg = %payload.id.short(), "Ignoring message for deleted id");
            return MergeOutcome::Stale;
        }

        if let Some(existing) = self.entries.get(&payload.id) {
            let stale = is_newer(existing.edited_at, payload.edited_at)
                || payload.reply_count < existing.reply_count;
            let merged = merge_fields(existing, &payload);
            if self.entries.upsert(payload.id, merged) {
                self.recompute();
                return MergeOutcome::Applied;
            }
            return if stale {
                MergeOutcome::Stale
            } else {
                MergeOutcome::Unchanged
            };
        }

        if let Some(local_id) = self.find_optimistic(&payload) {
            let id = payload.id;
            self.entries
                .rekey(&local_id, id, Message::from_payload(payload));
            debug!(local = %local_id.short(), server = %id.short(), "Adopted optimistic message");
            self.recompute();
            return MergeOutcome::Applied;
        }

        self.entries
            .upsert(payload.id, Message::from_payload(payload));
        self.recompute();
        MergeOutcome::Applied
    }

    /// Pending local message this payload is the server copy of: same
    /// correlation id, or same channel, author and content close in time.
    fn find_optimistic(&self, p: &MessagePayload) -> Option<MessageId> {
        self.entries
            .values()
            .find(|m| {
                m.is_pending()
                    && match (m.correlation_id, p.correlation_id) {
                        (Some(local), Some(incoming)) => local == incoming,
                        _ => {
                            m.channel_id == p.channel_id
                                && m.author_id == p.author_id
                                && m.content == p.content
                                && within(m.created_at, p.created_at, self.match_window)
                        }
                    }
            })
            .map(|m| m.id)
    }

    /// Out-of-order guard: applies only if `edited_at` is strictly newer.
    pub fn apply_edit(
        &mut self,
        id: MessageId,
        content: String,
        edited_at: DateTime<Utc>,
    ) -> MergeOutcome {
        if self.tombstones.contains(&id) {
            return MergeOutcome::Stale;
        }
        let Some(existing) = self.entries.get(&id) else {
            return MergeOutcome::Unchanged;
        };
        if !is_newer(Some(edited_at), existing.edited_at) {
            debug!(msg = %id.short(), "Dropping out-of-order edit");
            return MergeOutcome::Stale;
        }

        self.entries.update(&id, |m| {
            m.content = content;
            m.edited_at = Some(edited_at);
        });
        MergeOutcome::Applied
    }

    /// Reply counters only move forward.
    pub fn apply_thread_metadata(
        &mut self,
        parent_id: MessageId,
        reply_count: u32,
        last_reply_at: Option<DateTime<Utc>>,
    ) -> MergeOutcome {
        let Some(existing) = self.entries.get(&parent_id) else {
            return MergeOutcome::Unchanged;
        };
        let stale = reply_count < existing.reply_count;

        let changed = self.entries.update(&parent_id, |m| {
            m.reply_count = m.reply_count.max(reply_count);
            m.last_reply_at = m.last_reply_at.max(last_reply_at);
        });
        match (changed, stale) {
            (true, _) => MergeOutcome::Applied,
            (false, true) => MergeOutcome::Stale,
            (false, false) => MergeOutcome::Unchanged,
        }
    }

    /// An explicit reply deletion is the one case the counter goes down.
    /// Each reply is counted once, however often its deletion is delivered.
    pub fn on_reply_deleted(&mut self, parent_id: MessageId, reply_id: MessageId) -> bool {
        if self.deleted_replies.contains(&reply_id) {
            debug!(reply = %reply_id.short(), "Reply deletion already counted");
            return false;
        }
        self.deleted_replies.insert(reply_id);
        self.entries.update(&parent_id, |m| {
            m.reply_count = m.reply_count.saturating_sub(1);
        })
    }

    // -- local mutations -----------------------------------------------------

    pub fn insert_optimistic(&mut self, message: Message) -> MessageId {
        let id = message.id;
        self.entries.upsert(id, message);
        self.recompute();
        id
    }

    /// Swap a pending local message for the server copy, in the same slot.
    pub fn confirm(&mut self, local_id: MessageId, payload: MessagePayload) -> MergeOutcome {
        if !self.entries.contains(&local_id) || self.entries.contains(&payload.id) {
            // The echo got here first, or the local copy is gone.
            self.entries.remove(&local_id);
            return self.merge_message(payload);
        }

        let id = payload.id;
        self.entries
            .rekey(&local_id, id, Message::from_payload(payload));
        self.recompute();
        MergeOutcome::Applied
    }

    /// Drop a pending local message without leaving a tombstone.
    pub fn discard(&mut self, local_id: &MessageId) -> Option<Message> {
        let removed = self.entries.remove(local_id);
        self.recompute();
        removed
    }

    /// Delete and tombstone, so stale events cannot bring the message back.
    pub fn delete(&mut self, id: MessageId) -> Option<Message> {
        self.tombstones.insert(id);
        let removed = self.entries.remove(&id);
        self.recompute();
        removed
    }

    /// Undo a local delete.
    pub fn restore(&mut self, message: Message) {
        self.tombstones.lift(&message.id);
        self.entries.upsert(message.id, message);
        self.recompute();
    }

    /// Undo a local edit, bypassing the out-of-order guard.
    pub fn restore_edit(
        &mut self,
        id: MessageId,
        content: String,
        edited_at: Option<DateTime<Utc>>,
    ) -> bool {
        self.entries.update(&id, |m| {
            m.content = content;
            m.edited_at = edited_at;
        })
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.tombstones.clear();
        self.deleted_replies.clear();
        self.recompute();
    }

    fn recompute(&mut self) {
        self.channel_counts.clear();
        self.mention_counts.clear();
        for m in self.entries.values() {
            *self.channel_counts.entry(m.channel_id).or_default() += 1;
            for user in &m.mentions {
                *self.mention_counts.entry(*user).or_default() += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use snacka_shared::types::CorrelationId;

    fn store() -> MessageStore {
        MessageStore::new(&StoreConfig::default())
    }

    fn payload(channel_id: ChannelId, content: &str) -> MessagePayload {
        MessagePayload {
            id: MessageId::new(),
            channel_id,
            author_id: UserId::new(),
            content: content.to_string(),
            created_at: Utc::now(),
            edited_at: None,
            reply_count: 0,
            last_reply_at: None,
            correlation_id: None,
            mentions: Vec::new(),
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut store = store();
        let p = payload(ChannelId::new(), "hello");

        assert_eq!(store.merge_message(p.clone()), MergeOutcome::Applied);
        let snapshot = store.get_all();
        assert_eq!(store.merge_message(p), MergeOutcome::Unchanged);
        assert_eq!(store.get_all(), snapshot);
    }

    #[test]
    fn test_optimistic_echo_adopts_slot() {
        let mut store = store();
        let channel = ChannelId::new();
        let author = UserId::new();
        let correlation = CorrelationId::new();

        store.merge_message(payload(channel, "before"));
        let local = store.insert_optimistic(Message::optimistic(
            channel,
            author,
            "hi".into(),
            correlation,
        ));

        let mut echo = payload(channel, "hi");
        echo.author_id = author;
        echo.correlation_id = Some(correlation);
        let server_id = echo.id;

        assert_eq!(store.merge_message(echo), MergeOutcome::Applied);
        assert_eq!(store.len(), 2);
        assert!(store.get(&local).is_none());
        let adopted = store.get(&server_id).unwrap();
        assert_eq!(adopted.delivery, Delivery::Confirmed);
        assert_eq!(store.channel_count(channel), 2);
    }

    #[test]
    fn test_echo_without_correlation_matches_by_content() {
        let mut store = store();
        let channel = ChannelId::new();
        let author = UserId::new();
        store.insert_optimistic(Message::optimistic(
            channel,
            author,
            "same words".into(),
            CorrelationId::new(),
        ));

        let mut echo = payload(channel, "same words");
        echo.author_id = author;
        store.merge_message(echo);

        assert_eq!(store.len(), 1);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_older_edit_is_dropped() {
        let mut store = store();
        let p = payload(ChannelId::new(), "v1");
        let id = p.id;
        store.merge_message(p);

        let t1 = Utc::now();
        let t0 = t1 - Duration::seconds(10);
        assert_eq!(store.apply_edit(id, "v3".into(), t1), MergeOutcome::Applied);
        assert_eq!(store.apply_edit(id, "v2".into(), t0), MergeOutcome::Stale);
        assert_eq!(store.apply_edit(id, "v3-again".into(), t1), MergeOutcome::Stale);

        assert_eq!(store.get(&id).unwrap().content, "v3");
    }

    #[test]
    fn test_edit_order_does_not_matter() {
        let base = payload(ChannelId::new(), "v1");
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(1);

        let mut a = store();
        a.merge_message(base.clone());
        a.apply_edit(base.id, "A".into(), t0);
        a.apply_edit(base.id, "B".into(), t1);

        let mut b = store();
        b.merge_message(base.clone());
        b.apply_edit(base.id, "B".into(), t1);
        b.apply_edit(base.id, "A".into(), t0);

        assert_eq!(a.get_all(), b.get_all());
        assert_eq!(a.get(&base.id).unwrap().content, "B");
    }

    #[test]
    fn test_reply_count_never_regresses() {
        let mut store = store();
        let p = payload(ChannelId::new(), "parent");
        let id = p.id;
        store.merge_message(p);

        let now = Utc::now();
        assert_eq!(
            store.apply_thread_metadata(id, 5, Some(now)),
            MergeOutcome::Applied
        );
        assert_eq!(
            store.apply_thread_metadata(id, 3, Some(now - Duration::seconds(30))),
            MergeOutcome::Stale
        );
        let m = store.get(&id).unwrap();
        assert_eq!(m.reply_count, 5);
        assert_eq!(m.last_reply_at, Some(now));

        let reply = MessageId::new();
        assert!(store.on_reply_deleted(id, reply));
        assert_eq!(store.get(&id).unwrap().reply_count, 4);
    }

    #[test]
    fn test_reply_deletion_counted_once() {
        let mut store = store();
        let mut p = payload(ChannelId::new(), "parent");
        p.reply_count = 5;
        let id = p.id;
        store.merge_message(p);

        let reply = MessageId::new();
        assert!(store.on_reply_deleted(id, reply));
        assert!(!store.on_reply_deleted(id, reply));
        assert_eq!(store.get(&id).unwrap().reply_count, 4);

        assert!(store.on_reply_deleted(id, MessageId::new()));
        assert_eq!(store.get(&id).unwrap().reply_count, 3);
    }

    #[test]
    fn test_deleted_message_is_not_resurrected() {
        let mut store = store();
        let p = payload(ChannelId::new(), "bye");
        store.merge_message(p.clone());

        assert!(store.delete(p.id).is_some());
        assert_eq!(store.merge_message(p.clone()), MergeOutcome::Stale);
        assert!(store.get(&p.id).is_none());
        assert!(store.is_deleted(&p.id));
    }

    #[test]
    fn test_restore_after_delete() {
        let mut store = store();
        let channel = ChannelId::new();
        let first = payload(channel, "first");
        let mut second = payload(channel, "second");
        second.created_at = first.created_at + Duration::seconds(1);
        store.merge_message(first.clone());
        store.merge_message(second);

        let removed = store.delete(first.id).unwrap();
        store.restore(removed);

        assert!(!store.is_deleted(&first.id));
        assert_eq!(store.channel_messages(channel)[0].id, first.id);
    }

    #[test]
    fn test_confirm_after_echo() {
        let mut store = store();
        let channel = ChannelId::new();
        let author = UserId::new();
        let correlation = CorrelationId::new();
        let mut local = Message::optimistic(channel, author, "x".into(), correlation);
        // Far enough apart that content matching does not kick in.
        local.created_at = Utc::now() - Duration::hours(1);
        let local_id = store.insert_optimistic(local);

        let mut server = payload(channel, "x");
        server.author_id = author;
        // Echo carried a different correlation, so it landed as a new row.
        server.correlation_id = Some(CorrelationId::new());
        store.merge_message(server.clone());
        assert_eq!(store.len(), 2);

        store.confirm(local_id, server);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_mention_counts() {
        let mut store = store();
        let alice = UserId::new();
        let mut p = payload(ChannelId::new(), "@alice hi");
        p.mentions = vec![alice];
        store.merge_message(p.clone());
        assert_eq!(store.mention_count(alice), 1);

        store.delete(p.id);
        assert_eq!(store.mention_count(alice), 0);
    }
}
