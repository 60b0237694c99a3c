use tracing::debug;

use snacka_shared::protocol::ThreadReplyPayload;
use snacka_shared::types::{Delivery, MessageId};

use crate::config::StoreConfig;
use crate::entity::{EntityStore, Notification, SubscriptionId};
use crate::error::{Result, StoreError};
use crate::models::{within, MergeOutcome, ThreadReply};

/// Replies of the one open thread panel.
///
/// Replies only live while their thread is open; closing (or switching) the
/// thread drops them. Deleted replies are removed outright, with no
/// tombstone.
pub struct ThreadStore {
    open: Option<MessageId>,
    replies: EntityStore<MessageId, ThreadReply>,
    match_window: chrono::Duration,
}

impl ThreadStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            open: None,
            replies: EntityStore::new()
                .with_order(|a: &ThreadReply, b: &ThreadReply| a.created_at.cmp(&b.created_at)),
            match_window: config.match_window,
        }
    }

    pub fn open_thread(&self) -> Option<MessageId> {
        self.open
    }

    pub fn is_open(&self, parent_id: MessageId) -> bool {
        self.open == Some(parent_id)
    }

    /// Open the panel for `parent_id`. Switching threads drops the previous
    /// thread's replies.
    pub fn open(&mut self, parent_id: MessageId) {
        if self.open == Some(parent_id) {
            return;
        }
        self.replies.clear();
        self.open = Some(parent_id);
        debug!(parent = %parent_id.short(), "Thread opened");
    }

    pub fn close(&mut self) -> Option<MessageId> {
        let closed = self.open.take();
        self.replies.clear();
        if let Some(parent) = closed {
            debug!(parent = %parent.short(), "Thread closed");
        }
        closed
    }

    /// Seed the open thread with a fetched page of replies.
    pub fn load(&mut self, parent_id: MessageId, page: Vec<ThreadReplyPayload>) -> usize {
        if !self.is_open(parent_id) {
            return 0;
        }
        self.replies.batch(|b| {
            page.into_iter()
                .filter(|p| p.parent_id == parent_id)
                .filter(|p| b.upsert(p.id, ThreadReply::from_payload(p.clone())))
                .count()
        })
    }

    pub fn get(&self, id: &MessageId) -> Option<&ThreadReply> {
        self.replies.get(id)
    }

    pub fn replies(&self) -> Vec<ThreadReply> {
        self.replies.get_all()
    }

    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }

    pub fn subscribe(
        &mut self,
        listener: impl FnMut(&mut Notification<'_, MessageId, ThreadReply>) + Send + 'static,
    ) -> SubscriptionId {
        self.replies.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.replies.unsubscribe(id)
    }

    pub fn merge_reply(&mut self, payload: ThreadReplyPayload) -> MergeOutcome {
        if !self.is_open(payload.parent_id) {
            return MergeOutcome::Unchanged;
        }

        if self.replies.contains(&payload.id) {
            return if self
                .replies
                .upsert(payload.id, ThreadReply::from_payload(payload))
            {
                MergeOutcome::Applied
            } else {
                MergeOutcome::Unchanged
            };
        }

        let pending = self
            .replies
            .values()
            .find(|r| {
                r.delivery == Delivery::Pending
                    && match (r.correlation_id, payload.correlation_id) {
                        (Some(local), Some(incoming)) => local == incoming,
                        _ => {
                            r.author_id == payload.author_id
                                && r.content == payload.content
                                && within(r.created_at, payload.created_at, self.match_window)
                        }
                    }
            })
            .map(|r| r.id);

        let id = payload.id;
        match pending {
            Some(local) => {
                self.replies
                    .rekey(&local, id, ThreadReply::from_payload(payload));
            }
            None => {
                self.replies.upsert(id, ThreadReply::from_payload(payload));
            }
        }
        MergeOutcome::Applied
    }

    pub fn insert_optimistic(&mut self, reply: ThreadReply) -> Result<MessageId> {
        if !self.is_open(reply.parent_id) {
            return Err(StoreError::ThreadNotOpen);
        }
        let id = reply.id;
        self.replies.upsert(id, reply);
        Ok(id)
    }

    pub fn confirm(&mut self, local_id: MessageId, payload: ThreadReplyPayload) -> MergeOutcome {
        if !self.replies.contains(&local_id) || self.replies.contains(&payload.id) {
            self.replies.remove(&local_id);
            return self.merge_reply(payload);
        }
        let id = payload.id;
        self.replies
            .rekey(&local_id, id, ThreadReply::from_payload(payload));
        MergeOutcome::Applied
    }

    pub fn discard(&mut self, local_id: &MessageId) -> Option<ThreadReply> {
        self.replies.remove(local_id)
    }

    pub fn remove_reply(&mut self, id: &MessageId) -> Option<ThreadReply> {
        self.replies.remove(id)
    }

    pub fn clear(&mut self) {
        self.open = None;
        self.replies.clear();
    }
}
