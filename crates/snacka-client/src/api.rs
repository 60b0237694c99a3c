//! Collaborators the engine talks to: the push transport, the request API,
//! the resource host and the mention parser.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use snacka_shared::protocol::{
    EventFrame, MessageDeletion, MessageEdit, MessagePayload, RoleChange, ThreadReplyPayload,
};
use snacka_shared::types::{
    ChannelId, CommunityId, CorrelationId, InviteId, MessageId, NotificationId, ResourceId,
    Role, UserId, ViewId,
};
use snacka_shared::RequestError;

/// What the push transport reports to the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connecting,
    Connected,
    Disconnected { reason: String },
    /// One raw JSON [`EventFrame`].
    Frame(Vec<u8>),
}

/// A mutate action sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ApiRequest {
    SendMessage {
        correlation_id: CorrelationId,
        channel_id: ChannelId,
        content: String,
    },
    EditMessage {
        correlation_id: CorrelationId,
        message_id: MessageId,
        content: String,
    },
    DeleteMessage {
        correlation_id: CorrelationId,
        message_id: MessageId,
    },
    SendReply {
        correlation_id: CorrelationId,
        parent_id: MessageId,
        content: String,
    },
    MarkRead {
        correlation_id: CorrelationId,
        notification_id: NotificationId,
    },
    AcceptInvite {
        correlation_id: CorrelationId,
        invite_id: InviteId,
    },
    DeclineInvite {
        correlation_id: CorrelationId,
        invite_id: InviteId,
    },
    SetRole {
        correlation_id: CorrelationId,
        community_id: CommunityId,
        user_id: UserId,
        role: Role,
    },
}

impl ApiRequest {
    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            Self::SendMessage { correlation_id, .. }
            | Self::EditMessage { correlation_id, .. }
            | Self::DeleteMessage { correlation_id, .. }
            | Self::SendReply { correlation_id, .. }
            | Self::MarkRead { correlation_id, .. }
            | Self::AcceptInvite { correlation_id, .. }
            | Self::DeclineInvite { correlation_id, .. }
            | Self::SetRole { correlation_id, .. } => *correlation_id,
        }
    }
}

/// Server confirmation of a mutate action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "data", rename_all = "snake_case")]
pub enum ApiResponse {
    Message(MessagePayload),
    Edited(MessageEdit),
    Deleted(MessageDeletion),
    Reply(ThreadReplyPayload),
    Role(RoleChange),
    /// Accepted with no entity to report.
    Ack,
}

/// Request/response access to the server.
#[async_trait]
pub trait RequestApi: Send + Sync + 'static {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, RequestError>;

    /// Events since `since` (everything the server still has when `None`).
    async fn fetch_backlog(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventFrame>, RequestError>;
}

/// Owner of the hardware behind exclusive resources (renderers, capture
/// devices). Attach and detach may be slow; the broker never holds its lock
/// across them.
#[async_trait]
pub trait ResourceHost: Send + Sync + 'static {
    async fn attach(&self, resource: &ResourceId, owner: ViewId) -> Result<(), String>;
    async fn detach(&self, resource: &ResourceId, owner: ViewId) -> Result<(), String>;
}

/// Extracts mentioned users from message content.
pub trait MentionParser: Send + Sync + 'static {
    fn mentioned_users(&self, content: &str) -> Vec<UserId>;
}

/// Parser that never finds mentions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMentions;

impl MentionParser for NoMentions {
    fn mentioned_users(&self, _content: &str) -> Vec<UserId> {
        Vec::new()
    }
}

/// Recognizes `@<uuid>` tokens, the form mentions take on the wire before
/// display names are substituted.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidMentions;

impl MentionParser for UuidMentions {
    fn mentioned_users(&self, content: &str) -> Vec<UserId> {
        let mut users = Vec::new();
        for token in content.split_whitespace() {
            let Some(rest) = token.strip_prefix('@') else {
                continue;
            };
            let rest = rest.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
            if let Ok(id) = Uuid::parse_str(rest) {
                let user = UserId(id);
                if !users.contains(&user) {
                    users.push(user);
                }
            }
        }
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_mentions() {
        let a = UserId::new();
        let b = UserId::new();
        let content = format!("hey @{a}, and @{b}! also @{a} and @nobody");
        assert_eq!(UuidMentions.mentioned_users(&content), vec![a, b]);
        assert!(NoMentions.mentioned_users(&content).is_empty());
    }

    #[test]
    fn test_request_serializes_with_action_tag() {
        let request = ApiRequest::DeleteMessage {
            correlation_id: CorrelationId::new(),
            message_id: MessageId::new(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["action"], "delete_message");
        assert_eq!(
            serde_json::from_value::<ApiRequest>(json).unwrap(),
            request
        );
    }
}
