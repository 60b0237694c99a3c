//! Optimistic mutation tracking.
//!
//! Every user-initiated mutation is applied to the stores right away and
//! registered here under its correlation id together with the inverse change
//! ([`Rollback`]). When the server answers, the operation is settled: the
//! optimistic entity is swapped for the confirmed one, or the rollback runs.
//! Push events touching an entity with an operation in flight are held and
//! released once it settles.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::debug;

use snacka_shared::protocol::{EntityRef, PushEvent};
use snacka_shared::types::{CorrelationId, LocalId, MessageId};
use snacka_store::{Member, Message, NotificationItem, Stores};

use crate::api::ApiResponse;
use crate::dispatcher::Incoming;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    SendMessage,
    EditMessage,
    DeleteMessage,
    SendReply,
    MarkRead,
    AcceptInvite,
    DeclineInvite,
    SetRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    InFlight,
    Committed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingOperation {
    pub correlation_id: CorrelationId,
    pub kind: OperationKind,
    #[serde(skip)]
    pub target: Option<EntityRef>,
    pub submitted_at: DateTime<Utc>,
    pub status: OperationStatus,
}

/// Inverse of an optimistic change.
#[derive(Debug, Clone, PartialEq)]
pub enum Rollback {
    DiscardMessage(MessageId),
    RestoreMessage(Message),
    RestoreEdit {
        id: MessageId,
        content: String,
        edited_at: Option<DateTime<Utc>>,
    },
    DiscardReply(MessageId),
    RestoreReadState {
        id: LocalId,
        is_read: bool,
    },
    RestoreNotification(NotificationItem),
    RestoreMembers(Vec<Member>),
    Nothing,
}

impl Rollback {
    pub fn apply(self, stores: &mut Stores) {
        match self {
            Self::DiscardMessage(local) => {
                stores.messages.discard(&local);
            }
            Self::RestoreMessage(message) => stores.messages.restore(message),
            Self::RestoreEdit {
                id,
                content,
                edited_at,
            } => {
                stores.messages.restore_edit(id, content, edited_at);
            }
            Self::DiscardReply(local) => {
                stores.threads.discard(&local);
            }
            Self::RestoreReadState { id, is_read } => {
                stores.notifications.restore_read_state(&id, is_read);
            }
            Self::RestoreNotification(item) => stores.notifications.restore(item),
            Self::RestoreMembers(prior) => stores.members.restore_members(prior),
            Self::Nothing => {}
        }
    }

    /// Install the server's version of the entity in place of the optimistic
    /// one. Returns the confirmed entity, when there is one.
    pub fn confirm(&self, stores: &mut Stores, response: ApiResponse) -> Option<EntityRef> {
        match (self, response) {
            (Self::DiscardMessage(local), ApiResponse::Message(payload)) => {
                let id = payload.id;
                stores.messages.confirm(*local, payload);
                Some(EntityRef::Message(id))
            }
            (Self::DiscardReply(local), ApiResponse::Reply(payload)) => {
                let id = payload.id;
                stores.threads.confirm(*local, payload);
                Some(EntityRef::Message(id))
            }
            // Our own edit: the server's stamp is authoritative.
            (_, ApiResponse::Edited(edit)) => {
                stores
                    .messages
                    .restore_edit(edit.id, edit.content, Some(edit.edited_at));
                Some(EntityRef::Message(edit.id))
            }
            (_, ApiResponse::Role(change)) => {
                let target = EntityRef::Member(change.community_id, change.user_id);
                stores.members.apply_role_change(change);
                Some(target)
            }
            (_, ApiResponse::Deleted(deletion)) => Some(EntityRef::Message(deletion.id)),
            _ => None,
        }
    }
}

/// An operation that has just left the in-flight set.
#[derive(Debug)]
pub struct Settled {
    pub operation: PendingOperation,
    pub rollback: Rollback,
    /// Push events held behind the operation, in arrival order.
    pub held: Vec<Incoming>,
}

struct Tracked {
    operation: PendingOperation,
    rollback: Rollback,
    held: Vec<Incoming>,
}

pub struct Reconciler {
    pending: IndexMap<CorrelationId, Tracked>,
    history: VecDeque<PendingOperation>,
    history_cap: usize,
}

impl Reconciler {
    pub fn new(history_cap: usize) -> Self {
        Self {
            pending: IndexMap::new(),
            history: VecDeque::new(),
            history_cap,
        }
    }

    pub fn begin(
        &mut self,
        correlation_id: CorrelationId,
        kind: OperationKind,
        target: Option<EntityRef>,
        rollback: Rollback,
    ) {
        debug!(op = %correlation_id.short(), ?kind, "Operation in flight");
        self.pending.insert(
            correlation_id,
            Tracked {
                operation: PendingOperation {
                    correlation_id,
                    kind,
                    target,
                    submitted_at: Utc::now(),
                    status: OperationStatus::InFlight,
                },
                rollback,
                held: Vec::new(),
            },
        );
    }

    pub fn is_in_flight(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    /// The in-flight operation `event` must wait for, if any.
    pub fn blocking_operation(&self, event: &PushEvent) -> Option<CorrelationId> {
        if let Some(correlation_id) = event.correlation_id() {
            if self.pending.contains_key(&correlation_id) {
                return Some(correlation_id);
            }
        }
        let entity = event.entity();
        self.pending
            .values()
            .find(|t| t.operation.target.as_ref() == Some(&entity))
            .map(|t| t.operation.correlation_id)
    }

    /// Hold `incoming` behind its blocking operation. Returns it back when
    /// nothing blocks it.
    pub fn hold(&mut self, incoming: Incoming) -> Option<Incoming> {
        let Some(correlation_id) = self.blocking_operation(&incoming.event) else {
            return Some(incoming);
        };
        debug!(
            kind = incoming.event.kind(),
            op = %correlation_id.short(),
            "Holding event behind in-flight operation"
        );
        match self.pending.get_mut(&correlation_id) {
            Some(tracked) => {
                tracked.held.push(incoming);
                None
            }
            None => Some(incoming),
        }
    }

    /// Move an operation out of the in-flight set. `None` for unknown ids
    /// (late responses after logout).
    pub fn settle(&mut self, correlation_id: &CorrelationId, status: OperationStatus) -> Option<Settled> {
        let tracked = self.pending.shift_remove(correlation_id)?;
        let mut operation = tracked.operation;
        operation.status = status;

        self.history.push_back(operation.clone());
        while self.history.len() > self.history_cap {
            self.history.pop_front();
        }

        Some(Settled {
            operation,
            rollback: tracked.rollback,
            held: tracked.held,
        })
    }

    pub fn pending(&self) -> Vec<PendingOperation> {
        self.pending.values().map(|t| t.operation.clone()).collect()
    }

    pub fn history(&self) -> Vec<PendingOperation> {
        self.history.iter().cloned().collect()
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Drop all pending work. Returns the dropped correlation ids.
    pub fn clear(&mut self) -> Vec<CorrelationId> {
        let dropped = self.pending.keys().copied().collect();
        self.pending.clear();
        self.history.clear();
        dropped
    }
}
