use chrono::{DateTime, Utc};
use tracing::debug;

use snacka_shared::protocol::VoiceStatePayload;
use snacka_shared::types::{ChannelId, UserId};

use crate::config::StoreConfig;
use crate::entity::{EntityStore, Notification, SubscriptionId};
use crate::models::{MergeOutcome, VoiceKey, VoiceParticipant};
use crate::tombstones::Tombstones;

/// Who is in which voice channel, and what they are sending.
/// Last writer wins on `updated_at`.
pub struct VoiceStore {
    participants: EntityStore<VoiceKey, VoiceParticipant>,
    tombstones: Tombstones<VoiceKey>,
}

impl VoiceStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            participants: EntityStore::new(),
            tombstones: Tombstones::new(config.tombstone_ttl),
        }
    }

    pub fn get(&self, channel_id: ChannelId, user_id: UserId) -> Option<&VoiceParticipant> {
        self.participants.get(&VoiceKey {
            channel_id,
            user_id,
        })
    }

    /// Participants of one channel in join order.
    pub fn participants(&self, channel_id: ChannelId) -> Vec<&VoiceParticipant> {
        self.participants
            .values()
            .filter(|p| p.channel_id == channel_id)
            .collect()
    }

    pub fn screen_sharers(&self, channel_id: ChannelId) -> Vec<UserId> {
        self.participants
            .values()
            .filter(|p| p.channel_id == channel_id && p.screen_sharing)
            .map(|p| p.user_id)
            .collect()
    }

    pub fn participant_count(&self, channel_id: ChannelId) -> usize {
        self.participants
            .values()
            .filter(|p| p.channel_id == channel_id)
            .count()
    }

    pub fn get_all(&self) -> Vec<VoiceParticipant> {
        self.participants.get_all()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn subscribe(
        &mut self,
        listener: impl FnMut(&mut Notification<'_, VoiceKey, VoiceParticipant>) + Send + 'static,
    ) -> SubscriptionId {
        self.participants.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.participants.unsubscribe(id)
    }

    pub fn merge_state(&mut self, payload: VoiceStatePayload) -> MergeOutcome {
        let incoming = VoiceParticipant::from_payload(payload);
        let key = incoming.key();

        if self.tombstones.blocks(&key, incoming.updated_at) {
            debug!(user = %key.user_id.short(), "Ignoring voice state older than leave");
            return MergeOutcome::Stale;
        }
        if let Some(existing) = self.participants.get(&key) {
            if incoming.updated_at < existing.updated_at {
                return MergeOutcome::Stale;
            }
        }

        if self.participants.upsert(key, incoming) {
            MergeOutcome::Applied
        } else {
            MergeOutcome::Unchanged
        }
    }

    pub fn leave(
        &mut self,
        channel_id: ChannelId,
        user_id: UserId,
        left_at: DateTime<Utc>,
    ) -> MergeOutcome {
        let key = VoiceKey {
            channel_id,
            user_id,
        };
        if let Some(existing) = self.participants.get(&key) {
            if existing.updated_at > left_at {
                return MergeOutcome::Stale;
            }
        }
        self.tombstones.insert_at(key, left_at);
        match self.participants.remove(&key) {
            Some(_) => MergeOutcome::Applied,
            None => MergeOutcome::Unchanged,
        }
    }

    pub fn clear(&mut self) {
        self.participants.clear();
        self.tombstones.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn state(channel_id: ChannelId, user_id: UserId, at: DateTime<Utc>) -> VoiceStatePayload {
        VoiceStatePayload {
            channel_id,
            user_id,
            muted: false,
            deafened: false,
            camera_on: false,
            screen_sharing: false,
            updated_at: at,
        }
    }

    #[test]
    fn test_last_writer_wins() {
        let mut store = VoiceStore::new(&StoreConfig::default());
        let channel = ChannelId::new();
        let user = UserId::new();
        let t0 = Utc::now();

        let mut sharing = state(channel, user, t0 + Duration::seconds(1));
        sharing.screen_sharing = true;
        assert_eq!(store.merge_state(sharing), MergeOutcome::Applied);
        assert_eq!(
            store.merge_state(state(channel, user, t0)),
            MergeOutcome::Stale
        );

        assert_eq!(store.screen_sharers(channel), vec![user]);
        assert_eq!(store.participant_count(channel), 1);
    }

    #[test]
    fn test_leave_blocks_stale_state() {
        let mut store = VoiceStore::new(&StoreConfig::default());
        let channel = ChannelId::new();
        let user = UserId::new();
        let t0 = Utc::now();
        store.merge_state(state(channel, user, t0));

        let left_at = t0 + Duration::seconds(2);
        assert_eq!(store.leave(channel, user, left_at), MergeOutcome::Applied);
        assert_eq!(
            store.merge_state(state(channel, user, t0 + Duration::seconds(1))),
            MergeOutcome::Stale
        );
        assert!(store.participants(channel).is_empty());

        // Rejoin.
        assert_eq!(
            store.merge_state(state(channel, user, t0 + Duration::seconds(3))),
            MergeOutcome::Applied
        );
    }

    #[test]
    fn test_participants_in_join_order() {
        let mut store = VoiceStore::new(&StoreConfig::default());
        let channel = ChannelId::new();
        let (a, b) = (UserId::new(), UserId::new());
        let now = Utc::now();
        store.merge_state(state(channel, a, now));
        store.merge_state(state(channel, b, now));
        store.merge_state(state(ChannelId::new(), UserId::new(), now));

        let mut muted = state(channel, a, now + Duration::seconds(1));
        muted.muted = true;
        store.merge_state(muted);

        let ids: Vec<_> = store.participants(channel).iter().map(|p| p.user_id).collect();
        assert_eq!(ids, vec![a, b]);
        assert!(store.get(channel, a).unwrap().muted);
    }
}
