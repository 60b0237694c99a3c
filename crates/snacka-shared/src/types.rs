use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a `Uuid`-backed identifier newtype.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// First eight hex characters, for log lines.
            pub fn short(&self) -> String {
                self.0.simple().to_string()[..8].to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// A user account.
    UserId
);
uuid_id!(
    /// A text or voice channel.
    ChannelId
);
uuid_id!(
    /// A community (server/guild) grouping channels and members.
    CommunityId
);
uuid_id!(
    /// A message or thread reply. Optimistic entries use a client-local id
    /// until the server assigns the real one.
    MessageId
);
uuid_id!(
    /// Server-assigned notification id.
    NotificationId
);
uuid_id!(
    /// Client-local activity feed id, stable across server id assignment.
    LocalId
);
uuid_id!(
    /// Client-generated id tying an optimistic mutation to its request,
    /// its response and the server echo.
    CorrelationId
);
uuid_id!(
    /// A community invite.
    InviteId
);
uuid_id!(
    /// A UI view that can own exclusive resources (video tile, thread panel...).
    ViewId
);

/// Name of an exclusive hardware-bound resource, e.g. `"video-renderer:0"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Push connection lifecycle as seen by the event dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Synced,
    /// Connection lost or catch-up failed; reconnecting.
    Degraded,
}

/// Community role. Declaration order gives `Owner > Admin > Member`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Admin,
    Owner,
}

/// Closed set of activity feed item kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Mention,
    ThreadReply,
    DirectMessage,
    CommunityInvite,
    Reaction,
    System,
}

/// Whether a locally held entity has been confirmed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delivery {
    Pending,
    Confirmed,
}
