//! Push event wire format.
//!
//! The transport delivers JSON frames `{ "event_id"?, "type", "data" }`.
//! [`PushEvent::decode`] is the routing table from the closed set of kind
//! strings to typed payloads; anything else is a [`ProtocolError`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::types::{
    ChannelId, CommunityId, CorrelationId, InviteId, MessageId, NotificationId,
    NotificationKind, Role, UserId,
};

/// One frame as it arrives from the push transport (or a catch-up backlog).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    /// Transport-level delivery id, when the server provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl EventFrame {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(ProtocolError::InvalidFrame)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::InvalidFrame)
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reply_count: u32,
    #[serde(default)]
    pub last_reply_at: Option<DateTime<Utc>>,
    /// Client nonce of the send that produced this message, echoed back.
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    #[serde(default)]
    pub mentions: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEdit {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub content: String,
    pub edited_at: DateTime<Utc>,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDeletion {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub deleted_at: DateTime<Utc>,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadReplyPayload {
    pub id: MessageId,
    pub parent_id: MessageId,
    pub author_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadReplyDeletion {
    pub id: MessageId,
    pub parent_id: MessageId,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMetadata {
    pub parent_id: MessageId,
    pub reply_count: u32,
    #[serde(default)]
    pub last_reply_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub id: NotificationId,
    pub kind: NotificationKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub actor_id: Option<UserId>,
    #[serde(default)]
    pub community_id: Option<CommunityId>,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    #[serde(default)]
    pub message_id: Option<MessageId>,
    #[serde(default)]
    pub invite_id: Option<InviteId>,
    #[serde(default)]
    pub preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRead {
    pub id: NotificationId,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationDeletion {
    pub id: NotificationId,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberPayload {
    pub community_id: CommunityId,
    pub user_id: UserId,
    pub role: Role,
    #[serde(default)]
    pub display_name_override: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRemoval {
    pub community_id: CommunityId,
    pub user_id: UserId,
    pub removed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleChange {
    pub community_id: CommunityId,
    pub user_id: UserId,
    pub role: Role,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceStatePayload {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub deafened: bool,
    #[serde(default)]
    pub camera_on: bool,
    #[serde(default)]
    pub screen_sharing: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceLeave {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub left_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Every push event the client understands.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    MessageCreated(MessagePayload),
    MessageEdited(MessageEdit),
    MessageDeleted(MessageDeletion),
    ThreadReplyCreated(ThreadReplyPayload),
    ThreadReplyDeleted(ThreadReplyDeletion),
    ThreadMetadataUpdated(ThreadMetadata),
    NotificationReceived(NotificationPayload),
    NotificationRead(NotificationRead),
    NotificationDeleted(NotificationDeletion),
    MemberUpserted(MemberPayload),
    MemberRemoved(MemberRemoval),
    MemberRoleChanged(RoleChange),
    VoiceStateUpdated(VoiceStatePayload),
    VoiceParticipantLeft(VoiceLeave),
}

/// The logical entity an event touches. Used to hold events behind
/// in-flight operations on the same entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Message(MessageId),
    Thread(MessageId),
    Notification(NotificationId),
    Member(CommunityId, UserId),
    Voice(ChannelId, UserId),
}

/// Identity of one delivery, used by the dispatcher's seen-set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeliveryKey {
    /// Transport-assigned event id.
    Event(Uuid),
    /// Derived from kind, entity and the event's own timestamp.
    Derived {
        kind: &'static str,
        entity: String,
        stamp: i64,
    },
}

fn payload<T: DeserializeOwned>(kind: &str, data: serde_json::Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::Malformed {
        kind: kind.to_string(),
        source,
    })
}

fn stamp(at: &DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

impl PushEvent {
    /// Decode a frame into a typed event.
    pub fn decode(frame: &EventFrame) -> Result<Self, ProtocolError> {
        let kind = frame.kind.as_str();
        let data = frame.data.clone();
        let event = match kind {
            "message_created" => Self::MessageCreated(payload(kind, data)?),
            "message_edited" => Self::MessageEdited(payload(kind, data)?),
            "message_deleted" => Self::MessageDeleted(payload(kind, data)?),
            "thread_reply_created" => Self::ThreadReplyCreated(payload(kind, data)?),
            "thread_reply_deleted" => Self::ThreadReplyDeleted(payload(kind, data)?),
            "thread_metadata_updated" => Self::ThreadMetadataUpdated(payload(kind, data)?),
            "notification_received" => Self::NotificationReceived(payload(kind, data)?),
            "notification_read" => Self::NotificationRead(payload(kind, data)?),
            "notification_deleted" => Self::NotificationDeleted(payload(kind, data)?),
            "member_upserted" => Self::MemberUpserted(payload(kind, data)?),
            "member_removed" => Self::MemberRemoved(payload(kind, data)?),
            "member_role_changed" => Self::MemberRoleChanged(payload(kind, data)?),
            "voice_state_updated" => Self::VoiceStateUpdated(payload(kind, data)?),
            "voice_participant_left" => Self::VoiceParticipantLeft(payload(kind, data)?),
            other => return Err(ProtocolError::UnknownKind(other.to_string())),
        };
        Ok(event)
    }

    /// Encode back into a frame (used by recorders, replays and tests).
    pub fn to_frame(&self, event_id: Option<Uuid>) -> Result<EventFrame, ProtocolError> {
        let data = match self {
            Self::MessageCreated(p) => serde_json::to_value(p),
            Self::MessageEdited(p) => serde_json::to_value(p),
            Self::MessageDeleted(p) => serde_json::to_value(p),
            Self::ThreadReplyCreated(p) => serde_json::to_value(p),
            Self::ThreadReplyDeleted(p) => serde_json::to_value(p),
            Self::ThreadMetadataUpdated(p) => serde_json::to_value(p),
            Self::NotificationReceived(p) => serde_json::to_value(p),
            Self::NotificationRead(p) => serde_json::to_value(p),
            Self::NotificationDeleted(p) => serde_json::to_value(p),
            Self::MemberUpserted(p) => serde_json::to_value(p),
            Self::MemberRemoved(p) => serde_json::to_value(p),
            Self::MemberRoleChanged(p) => serde_json::to_value(p),
            Self::VoiceStateUpdated(p) => serde_json::to_value(p),
            Self::VoiceParticipantLeft(p) => serde_json::to_value(p),
        }
        .map_err(ProtocolError::InvalidFrame)?;

        Ok(EventFrame {
            event_id,
            kind: self.kind().to_string(),
            data,
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageCreated(_) => "message_created",
            Self::MessageEdited(_) => "message_edited",
            Self::MessageDeleted(_) => "message_deleted",
            Self::ThreadReplyCreated(_) => "thread_reply_created",
            Self::ThreadReplyDeleted(_) => "thread_reply_deleted",
            Self::ThreadMetadataUpdated(_) => "thread_metadata_updated",
            Self::NotificationReceived(_) => "notification_received",
            Self::NotificationRead(_) => "notification_read",
            Self::NotificationDeleted(_) => "notification_deleted",
            Self::MemberUpserted(_) => "member_upserted",
            Self::MemberRemoved(_) => "member_removed",
            Self::MemberRoleChanged(_) => "member_role_changed",
            Self::VoiceStateUpdated(_) => "voice_state_updated",
            Self::VoiceParticipantLeft(_) => "voice_participant_left",
        }
    }

    pub fn entity(&self) -> EntityRef {
        match self {
            Self::MessageCreated(p) => EntityRef::Message(p.id),
            Self::MessageEdited(p) => EntityRef::Message(p.id),
            Self::MessageDeleted(p) => EntityRef::Message(p.id),
            Self::ThreadReplyCreated(p) => EntityRef::Message(p.id),
            Self::ThreadReplyDeleted(p) => EntityRef::Message(p.id),
            Self::ThreadMetadataUpdated(p) => EntityRef::Thread(p.parent_id),
            Self::NotificationReceived(p) => EntityRef::Notification(p.id),
            Self::NotificationRead(p) => EntityRef::Notification(p.id),
            Self::NotificationDeleted(p) => EntityRef::Notification(p.id),
            Self::MemberUpserted(p) => EntityRef::Member(p.community_id, p.user_id),
            Self::MemberRemoved(p) => EntityRef::Member(p.community_id, p.user_id),
            Self::MemberRoleChanged(p) => EntityRef::Member(p.community_id, p.user_id),
            Self::VoiceStateUpdated(p) => EntityRef::Voice(p.channel_id, p.user_id),
            Self::VoiceParticipantLeft(p) => EntityRef::Voice(p.channel_id, p.user_id),
        }
    }

    /// Client nonce carried by server echoes of our own mutations.
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Self::MessageCreated(p) => p.correlation_id,
            Self::MessageEdited(p) => p.correlation_id,
            Self::MessageDeleted(p) => p.correlation_id,
            Self::ThreadReplyCreated(p) => p.correlation_id,
            Self::MemberRoleChanged(p) => p.correlation_id,
            _ => None,
        }
    }

    /// Seen-set identity for this delivery.
    pub fn delivery_key(&self, event_id: Option<Uuid>) -> DeliveryKey {
        if let Some(id) = event_id {
            return DeliveryKey::Event(id);
        }

        let (entity, stamp) = match self {
            Self::MessageCreated(p) => (p.id.to_string(), stamp(&p.created_at)),
            Self::MessageEdited(p) => (p.id.to_string(), stamp(&p.edited_at)),
            Self::MessageDeleted(p) => (p.id.to_string(), stamp(&p.deleted_at)),
            Self::ThreadReplyCreated(p) => (p.id.to_string(), stamp(&p.created_at)),
            Self::ThreadReplyDeleted(p) => (p.id.to_string(), stamp(&p.deleted_at)),
            // Metadata carries no event time; the counter itself is the version.
            Self::ThreadMetadataUpdated(p) => (
                format!("{}#{}", p.parent_id, p.reply_count),
                p.last_reply_at.as_ref().map(stamp).unwrap_or_default(),
            ),
            Self::NotificationReceived(p) => (p.id.to_string(), stamp(&p.timestamp)),
            Self::NotificationRead(p) => (p.id.to_string(), stamp(&p.read_at)),
            Self::NotificationDeleted(p) => (p.id.to_string(), stamp(&p.deleted_at)),
            Self::MemberUpserted(p) => (
                format!("{}/{}", p.community_id, p.user_id),
                stamp(&p.updated_at),
            ),
            Self::MemberRemoved(p) => (
                format!("{}/{}", p.community_id, p.user_id),
                stamp(&p.removed_at),
            ),
            Self::MemberRoleChanged(p) => (
                format!("{}/{}", p.community_id, p.user_id),
                stamp(&p.updated_at),
            ),
            Self::VoiceStateUpdated(p) => (
                format!("{}/{}", p.channel_id, p.user_id),
                stamp(&p.updated_at),
            ),
            Self::VoiceParticipantLeft(p) => (
                format!("{}/{}", p.channel_id, p.user_id),
                stamp(&p.left_at),
            ),
        };

        DeliveryKey::Derived {
            kind: self.kind(),
            entity,
            stamp,
        }
    }
}
