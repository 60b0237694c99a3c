//! Entities held by the domain stores.
//!
//! Every struct derives `Serialize` so it can be handed directly to the UI
//! layer, and `PartialEq` so the entity store can tell a no-op upsert apart
//! from a real change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use snacka_shared::protocol::{
    MemberPayload, MessagePayload, NotificationPayload, ThreadReplyPayload, VoiceStatePayload,
};
use snacka_shared::types::{
    ChannelId, CommunityId, CorrelationId, Delivery, InviteId, LocalId, MessageId,
    NotificationId, NotificationKind, Role, UserId,
};

/// Result of applying one payload to a domain store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Observable state changed.
    Applied,
    /// The payload was already reflected (replay, duplicate, unrelated view).
    Unchanged,
    /// The payload is older than what is stored, or targets a tombstoned
    /// entity. Dropped.
    Stale,
}

/// Whether two instants are at most `window` apart.
pub(crate) fn within(a: DateTime<Utc>, b: DateTime<Utc>, window: chrono::Duration) -> bool {
    (a - b).num_milliseconds().abs() <= window.num_milliseconds()
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub reply_count: u32,
    pub last_reply_at: Option<DateTime<Utc>>,
    pub mentions: Vec<UserId>,
    pub correlation_id: Option<CorrelationId>,
    pub delivery: Delivery,
}

impl Message {
    pub fn from_payload(p: MessagePayload) -> Self {
        Self {
            id: p.id,
            channel_id: p.channel_id,
            author_id: p.author_id,
            content: p.content,
            created_at: p.created_at,
            edited_at: p.edited_at,
            reply_count: p.reply_count,
            last_reply_at: p.last_reply_at,
            mentions: p.mentions,
            correlation_id: p.correlation_id,
            delivery: Delivery::Confirmed,
        }
    }

    /// A locally composed message awaiting server confirmation.
    pub fn optimistic(
        channel_id: ChannelId,
        author_id: UserId,
        content: String,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            id: MessageId::new(),
            channel_id,
            author_id,
            content,
            created_at: Utc::now(),
            edited_at: None,
            reply_count: 0,
            last_reply_at: None,
            mentions: Vec::new(),
            correlation_id: Some(correlation_id),
            delivery: Delivery::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.delivery == Delivery::Pending
    }
}

// ---------------------------------------------------------------------------
// Thread reply
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadReply {
    pub id: MessageId,
    pub parent_id: MessageId,
    pub author_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub correlation_id: Option<CorrelationId>,
    pub delivery: Delivery,
}

impl ThreadReply {
    pub fn from_payload(p: ThreadReplyPayload) -> Self {
        Self {
            id: p.id,
            parent_id: p.parent_id,
            author_id: p.author_id,
            content: p.content,
            created_at: p.created_at,
            correlation_id: p.correlation_id,
            delivery: Delivery::Confirmed,
        }
    }

    pub fn optimistic(
        parent_id: MessageId,
        author_id: UserId,
        content: String,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            id: MessageId::new(),
            parent_id,
            author_id,
            content,
            created_at: Utc::now(),
            correlation_id: Some(correlation_id),
            delivery: Delivery::Pending,
        }
    }
}

// ---------------------------------------------------------------------------
// Notification (activity feed item)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationItem {
    /// Local id; survives server id assignment.
    pub id: LocalId,
    /// `None` until the server assigns one.
    pub server_id: Option<NotificationId>,
    pub kind: NotificationKind,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    pub actor_id: Option<UserId>,
    pub community_id: Option<CommunityId>,
    pub channel_id: Option<ChannelId>,
    /// Message the item refers to (the parent, for thread replies).
    pub message_id: Option<MessageId>,
    pub invite_id: Option<InviteId>,
    pub preview: Option<String>,
}

impl NotificationItem {
    pub fn from_payload(id: LocalId, p: NotificationPayload) -> Self {
        Self {
            id,
            server_id: Some(p.id),
            kind: p.kind,
            timestamp: p.timestamp,
            is_read: p.is_read,
            actor_id: p.actor_id,
            community_id: p.community_id,
            channel_id: p.channel_id,
            message_id: p.message_id,
            invite_id: p.invite_id,
            preview: p.preview,
        }
    }

    /// A locally created item with no server id yet.
    pub fn local(kind: NotificationKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: LocalId::new(),
            server_id: None,
            kind,
            timestamp,
            is_read: false,
            actor_id: None,
            community_id: None,
            channel_id: None,
            message_id: None,
            invite_id: None,
            preview: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Member
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberKey {
    pub community_id: CommunityId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub community_id: CommunityId,
    pub user_id: UserId,
    pub role: Role,
    pub display_name_override: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Member {
    pub fn from_payload(p: MemberPayload) -> Self {
        Self {
            community_id: p.community_id,
            user_id: p.user_id,
            role: p.role,
            display_name_override: p.display_name_override,
            updated_at: p.updated_at,
        }
    }

    pub fn key(&self) -> MemberKey {
        MemberKey {
            community_id: self.community_id,
            user_id: self.user_id,
        }
    }
}

/// Per-community role tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoleCounts {
    pub owners: usize,
    pub admins: usize,
    pub members: usize,
}

// ---------------------------------------------------------------------------
// Voice participant
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoiceKey {
    pub channel_id: ChannelId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceParticipant {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub muted: bool,
    pub deafened: bool,
    pub camera_on: bool,
    pub screen_sharing: bool,
    pub updated_at: DateTime<Utc>,
}

impl VoiceParticipant {
    pub fn from_payload(p: VoiceStatePayload) -> Self {
        Self {
            channel_id: p.channel_id,
            user_id: p.user_id,
            muted: p.muted,
            deafened: p.deafened,
            camera_on: p.camera_on,
            screen_sharing: p.screen_sharing,
            updated_at: p.updated_at,
        }
    }

    pub fn key(&self) -> VoiceKey {
        VoiceKey {
            channel_id: self.channel_id,
            user_id: self.user_id,
        }
    }
}
