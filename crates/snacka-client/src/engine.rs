//! The sync engine: one owner task for the stores.
//!
//! The engine task owns the [`Stores`], the [`Dispatcher`] and the
//! [`Reconciler`]. Everything else reaches it through a cloneable
//! [`SyncHandle`]: commands go in over a `tokio::sync::mpsc` channel and
//! replies come back over `oneshot`. Request I/O and catch-up fetches run in
//! spawned tasks that post their results back to the engine, so all store
//! mutations and notifications happen on the engine task, in arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use snacka_shared::constants::COMMAND_CHANNEL_CAPACITY;
use snacka_shared::protocol::{EntityRef, EventFrame};
use snacka_shared::types::{
    ChannelId, CommunityId, ConnectionState, CorrelationId, InviteId, LocalId, MessageId,
    ResourceId, Role, UserId, ViewId,
};
use snacka_shared::RequestError;
use snacka_store::{Message, StoreError, Stores, ThreadReply};

use crate::api::{ApiRequest, ApiResponse, MentionParser, RequestApi, ResourceHost, TransportEvent};
use crate::backoff::Backoff;
use crate::broker::{ExclusiveResourceLease, Lease, ResourceBroker};
use crate::config::SyncConfig;
use crate::dispatcher::{DispatchStats, Dispatcher, Incoming};
use crate::error::{Result, SyncError};
use crate::reconciler::{OperationKind, OperationStatus, PendingOperation, Reconciler, Rollback};

// ---------------------------------------------------------------------------
// Command / result types
// ---------------------------------------------------------------------------

/// A user-initiated mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    SendMessage {
        channel_id: ChannelId,
        content: String,
    },
    EditMessage {
        message_id: MessageId,
        content: String,
    },
    DeleteMessage {
        message_id: MessageId,
    },
    SendReply {
        parent_id: MessageId,
        content: String,
    },
    MarkRead {
        notification: LocalId,
    },
    AcceptInvite {
        invite_id: InviteId,
    },
    DeclineInvite {
        invite_id: InviteId,
    },
    SetRole {
        community_id: CommunityId,
        user_id: UserId,
        role: Role,
    },
}

/// Outcome of a committed intent.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub correlation_id: CorrelationId,
    /// The server-confirmed entity, when the action produced one.
    pub entity: Option<EntityRef>,
}

/// Diagnostics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub connection: ConnectionState,
    pub catching_up: bool,
    pub last_synced: Option<DateTime<Utc>>,
    pub dispatch: DispatchStats,
    pub buffered: usize,
    pub in_flight: Vec<PendingOperation>,
    pub recent: Vec<PendingOperation>,
}

type ReadFn = Box<dyn FnOnce(&Stores) + Send>;
type UpdateFn = Box<dyn FnOnce(&mut Stores) + Send>;

/// Commands sent *into* the engine task.
enum Command {
    Read(ReadFn),
    Update(UpdateFn),
    Intent {
        intent: Intent,
        reply: oneshot::Sender<Result<Receipt>>,
    },
    OpenThread {
        parent_id: MessageId,
        view: ViewId,
        reply: oneshot::Sender<Option<ViewId>>,
    },
    CloseThread(oneshot::Sender<Option<ViewId>>),
    ConnectionState(oneshot::Sender<ConnectionState>),
    Stats(oneshot::Sender<SyncStats>),
    Logout(oneshot::Sender<()>),
    Shutdown,
}

/// Results of work the engine spawned.
enum Internal {
    Resolved {
        correlation_id: CorrelationId,
        session: u64,
        result: std::result::Result<ApiResponse, RequestError>,
    },
    CatchUp {
        generation: u64,
        requested_at: DateTime<Utc>,
        result: std::result::Result<Vec<EventFrame>, RequestError>,
    },
    RetryCatchUp {
        generation: u64,
    },
}

/// An intent after its optimistic change has been applied.
struct Staged {
    kind: OperationKind,
    target: Option<EntityRef>,
    rollback: Rollback,
    /// `None` when there is nothing to tell the server.
    request: Option<ApiRequest>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    user_id: UserId,
    stores: Stores,
    dispatcher: Dispatcher,
    reconciler: Reconciler,
    api: Arc<dyn RequestApi>,
    mentions: Arc<dyn MentionParser>,
    backoff: Backoff,
    responders: HashMap<CorrelationId, oneshot::Sender<Result<Receipt>>>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    /// Bumped whenever an outstanding catch-up becomes irrelevant.
    catch_up_generation: u64,
    /// Bumped on logout; responses from an earlier session are ignored.
    session: u64,
    thread_view: Option<ViewId>,
}

impl SyncEngine {
    /// Spawn the engine task.
    ///
    /// Returns the handle used by every view plus the task's join handle.
    /// The task ends on [`SyncHandle::shutdown`] or once every handle is
    /// dropped.
    pub fn spawn(
        config: SyncConfig,
        user_id: UserId,
        api: Arc<dyn RequestApi>,
        host: Arc<dyn ResourceHost>,
        mentions: Arc<dyn MentionParser>,
        transport: mpsc::Receiver<TransportEvent>,
    ) -> (SyncHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(COMMAND_CHANNEL_CAPACITY);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel::<Internal>();

        let broker = ResourceBroker::new(host, config.quarantine, config.acquire_timeout);
        let engine = Self {
            user_id,
            stores: Stores::new(&config.store),
            dispatcher: Dispatcher::new(&config, mentions.clone()),
            reconciler: Reconciler::new(config.operation_history),
            api,
            mentions,
            backoff: Backoff::new(config.backoff_base, config.backoff_max),
            responders: HashMap::new(),
            internal_tx,
            catch_up_generation: 0,
            session: 0,
            thread_view: None,
        };

        let task = tokio::spawn(engine.run(cmd_rx, transport, internal_rx));
        let handle = SyncHandle {
            commands: cmd_tx,
            broker,
        };
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut transport: mpsc::Receiver<TransportEvent>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        info!(user = %self.user_id.short(), "Sync engine started");
        let mut transport_open = true;

        loop {
            tokio::select! {
                // --- Commands from handles ---
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Shutdown) => {
                            info!("Sync engine shutdown requested");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            info!("All sync handles dropped, shutting down engine");
                            break;
                        }
                    }
                }

                // --- Push transport ---
                event = transport.recv(), if transport_open => {
                    match event {
                        Some(event) => self.handle_transport(event),
                        None => {
                            info!("Push transport closed");
                            transport_open = false;
                            self.catch_up_generation += 1;
                            self.dispatcher.on_closed();
                        }
                    }
                }

                // --- Spawned work reporting back ---
                Some(msg) = internal.recv() => self.handle_internal(msg),
            }
        }

        if !self.responders.is_empty() {
            debug!(count = self.responders.len(), "Dropping unresolved operations");
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Read(f) => f(&self.stores),
            Command::Update(f) => f(&mut self.stores),
            Command::Intent { intent, reply } => self.submit(intent, reply),
            Command::OpenThread {
                parent_id,
                view,
                reply,
            } => {
                self.stores.threads.open(parent_id);
                let previous = self.thread_view.replace(view).filter(|v| *v != view);
                let _ = reply.send(previous);
            }
            Command::CloseThread(reply) => {
                self.stores.threads.close();
                let _ = reply.send(self.thread_view.take());
            }
            Command::ConnectionState(reply) => {
                let _ = reply.send(self.dispatcher.state());
            }
            Command::Stats(reply) => {
                let _ = reply.send(SyncStats {
                    connection: self.dispatcher.state(),
                    catching_up: self.dispatcher.is_catching_up(),
                    last_synced: self.dispatcher.last_synced(),
                    dispatch: self.dispatcher.stats().clone(),
                    buffered: self.dispatcher.buffered(),
                    in_flight: self.reconciler.pending(),
                    recent: self.reconciler.history(),
                });
            }
            Command::Logout(reply) => {
                self.logout();
                let _ = reply.send(());
            }
            // Handled by the run loop.
            Command::Shutdown => {}
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connecting => self.dispatcher.on_connecting(),
            TransportEvent::Connected => {
                let since = self.dispatcher.on_connected();
                self.request_catch_up(since);
            }
            TransportEvent::Disconnected { reason } => {
                self.catch_up_generation += 1;
                self.dispatcher.on_disconnected(&reason);
            }
            TransportEvent::Frame(bytes) => {
                if let Some(incoming) = self.dispatcher.accept(&bytes) {
                    self.deliver(incoming);
                }
            }
        }
    }

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Resolved {
                correlation_id,
                session,
                result,
            } => {
                if session != self.session {
                    debug!(op = %correlation_id.short(), "Ignoring response from ended session");
                    return;
                }
                self.resolve(correlation_id, result);
            }
            Internal::CatchUp {
                generation,
                requested_at,
                result,
            } => self.finish_catch_up(generation, requested_at, result),
            Internal::RetryCatchUp { generation } => {
                if generation == self.catch_up_generation
                    && self.dispatcher.is_catching_up()
                    && self.dispatcher.state() == ConnectionState::Degraded
                {
                    let since = self.dispatcher.begin_catch_up();
                    self.request_catch_up(since);
                }
            }
        }
    }

    // -- events --------------------------------------------------------------

    /// Duplicate check, then apply.
    fn deliver(&mut self, incoming: Incoming) {
        if self.dispatcher.admit(&incoming) {
            self.apply(incoming);
        }
    }

    /// Apply an admitted event unless an in-flight operation holds it.
    fn apply(&mut self, incoming: Incoming) {
        match self.reconciler.hold(incoming) {
            Some(incoming) => {
                self.dispatcher.route(&mut self.stores, incoming.event);
            }
            None => self.dispatcher.note_held(),
        }
    }

    fn request_catch_up(&mut self, since: Option<DateTime<Utc>>) {
        self.catch_up_generation += 1;
        let generation = self.catch_up_generation;
        let requested_at = Utc::now();
        let api = self.api.clone();
        let tx = self.internal_tx.clone();

        tokio::spawn(async move {
            let result = api.fetch_backlog(since).await;
            let _ = tx.send(Internal::CatchUp {
                generation,
                requested_at,
                result,
            });
        });
    }

    fn finish_catch_up(
        &mut self,
        generation: u64,
        requested_at: DateTime<Utc>,
        result: std::result::Result<Vec<EventFrame>, RequestError>,
    ) {
        if generation != self.catch_up_generation {
            debug!(generation, "Ignoring superseded catch-up");
            return;
        }

        match result {
            Ok(frames) => {
                self.backoff.reset();
                for incoming in self.dispatcher.complete_catch_up(frames, requested_at) {
                    self.deliver(incoming);
                }
                if self.dispatcher.take_resync() {
                    info!("Live events were dropped while buffering, catching up again");
                    let since = self.dispatcher.begin_catch_up();
                    self.request_catch_up(since);
                }
            }
            Err(e) => {
                self.dispatcher.catch_up_failed();
                let delay = self.backoff.next_delay();
                warn!(
                    error = %e,
                    attempt = self.backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "Catch-up failed, retrying"
                );
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Internal::RetryCatchUp { generation });
                });
            }
        }
    }

    // -- intents -------------------------------------------------------------

    fn submit(&mut self, intent: Intent, reply: oneshot::Sender<Result<Receipt>>) {
        let correlation_id = CorrelationId::new();
        let staged = match self.stage(correlation_id, intent) {
            Ok(staged) => staged,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        self.reconciler
            .begin(correlation_id, staged.kind, staged.target.clone(), staged.rollback);

        let Some(request) = staged.request else {
            // Local-only change: committed on the spot.
            self.reconciler
                .settle(&correlation_id, OperationStatus::Committed);
            let _ = reply.send(Ok(Receipt {
                correlation_id,
                entity: staged.target,
            }));
            return;
        };

        self.responders.insert(correlation_id, reply);
        let api = self.api.clone();
        let tx = self.internal_tx.clone();
        let session = self.session;
        tokio::spawn(async move {
            let result = api.execute(request).await;
            let _ = tx.send(Internal::Resolved {
                correlation_id,
                session,
                result,
            });
        });
    }

    /// Apply the optimistic change for `intent` and build its request.
    fn stage(&mut self, correlation_id: CorrelationId, intent: Intent) -> Result<Staged> {
        let stores = &mut self.stores;
        let staged = match intent {
            Intent::SendMessage {
                channel_id,
                content,
            } => {
                let mut message =
                    Message::optimistic(channel_id, self.user_id, content.clone(), correlation_id);
                message.mentions = self.mentions.mentioned_users(&content);
                let local = stores.messages.insert_optimistic(message);
                Staged {
                    kind: OperationKind::SendMessage,
                    target: Some(EntityRef::Message(local)),
                    rollback: Rollback::DiscardMessage(local),
                    request: Some(ApiRequest::SendMessage {
                        correlation_id,
                        channel_id,
                        content,
                    }),
                }
            }

            Intent::EditMessage {
                message_id,
                content,
            } => {
                let existing = stores
                    .messages
                    .get(&message_id)
                    .cloned()
                    .ok_or(StoreError::NotFound)?;
                stores
                    .messages
                    .restore_edit(message_id, content.clone(), Some(Utc::now()));
                Staged {
                    kind: OperationKind::EditMessage,
                    target: Some(EntityRef::Message(message_id)),
                    rollback: Rollback::RestoreEdit {
                        id: message_id,
                        content: existing.content,
                        edited_at: existing.edited_at,
                    },
                    request: Some(ApiRequest::EditMessage {
                        correlation_id,
                        message_id,
                        content,
                    }),
                }
            }

            Intent::DeleteMessage { message_id } => {
                // Deleting leaves a tombstone, so only delete what is present.
                if stores.messages.get(&message_id).is_none() {
                    return Err(StoreError::NotFound.into());
                }
                let removed = stores
                    .messages
                    .delete(message_id)
                    .ok_or(StoreError::NotFound)?;
                Staged {
                    kind: OperationKind::DeleteMessage,
                    target: Some(EntityRef::Message(message_id)),
                    rollback: Rollback::RestoreMessage(removed),
                    request: Some(ApiRequest::DeleteMessage {
                        correlation_id,
                        message_id,
                    }),
                }
            }

            Intent::SendReply { parent_id, content } => {
                let reply =
                    ThreadReply::optimistic(parent_id, self.user_id, content.clone(), correlation_id);
                let local = stores.threads.insert_optimistic(reply)?;
                Staged {
                    kind: OperationKind::SendReply,
                    target: Some(EntityRef::Message(local)),
                    rollback: Rollback::DiscardReply(local),
                    request: Some(ApiRequest::SendReply {
                        correlation_id,
                        parent_id,
                        content,
                    }),
                }
            }

            Intent::MarkRead { notification } => {
                let server_id = stores
                    .notifications
                    .get(&notification)
                    .ok_or(StoreError::NotFound)?
                    .server_id;
                let was_read = stores
                    .notifications
                    .mark_read(&notification)
                    .ok_or(StoreError::NotFound)?;
                Staged {
                    kind: OperationKind::MarkRead,
                    target: server_id.map(EntityRef::Notification),
                    rollback: Rollback::RestoreReadState {
                        id: notification,
                        is_read: was_read,
                    },
                    request: server_id.map(|notification_id| ApiRequest::MarkRead {
                        correlation_id,
                        notification_id,
                    }),
                }
            }

            Intent::AcceptInvite { invite_id } => stage_invite(
                stores,
                invite_id,
                OperationKind::AcceptInvite,
                ApiRequest::AcceptInvite {
                    correlation_id,
                    invite_id,
                },
            ),

            Intent::DeclineInvite { invite_id } => stage_invite(
                stores,
                invite_id,
                OperationKind::DeclineInvite,
                ApiRequest::DeclineInvite {
                    correlation_id,
                    invite_id,
                },
            ),

            Intent::SetRole {
                community_id,
                user_id,
                role,
            } => {
                let prior = stores.members.set_role(community_id, user_id, role)?;
                Staged {
                    kind: OperationKind::SetRole,
                    target: Some(EntityRef::Member(community_id, user_id)),
                    rollback: Rollback::RestoreMembers(prior),
                    request: Some(ApiRequest::SetRole {
                        correlation_id,
                        community_id,
                        user_id,
                        role,
                    }),
                }
            }
        };
        Ok(staged)
    }

    fn resolve(
        &mut self,
        correlation_id: CorrelationId,
        result: std::result::Result<ApiResponse, RequestError>,
    ) {
        let status = if result.is_ok() {
            OperationStatus::Committed
        } else {
            OperationStatus::Failed
        };
        let Some(settled) = self.reconciler.settle(&correlation_id, status) else {
            debug!(op = %correlation_id.short(), "Ignoring response for unknown operation");
            return;
        };
        let kind = settled.operation.kind;

        let outcome = match result {
            Ok(response) => {
                let entity = settled.rollback.confirm(&mut self.stores, response);
                debug!(op = %correlation_id.short(), ?kind, "Operation committed");
                Ok(Receipt {
                    correlation_id,
                    entity,
                })
            }
            Err(e) => {
                warn!(op = %correlation_id.short(), ?kind, error = %e, "Operation failed, rolling back");
                settled.rollback.apply(&mut self.stores);
                Err(SyncError::Request(e))
            }
        };

        for incoming in settled.held {
            self.apply(incoming);
        }

        match self.responders.remove(&correlation_id) {
            Some(reply) => {
                let _ = reply.send(outcome);
            }
            None => error!(op = %correlation_id.short(), "Settled operation had no responder"),
        }
    }

    fn logout(&mut self) {
        let dropped = self.reconciler.clear();
        for correlation_id in &dropped {
            if let Some(reply) = self.responders.remove(correlation_id) {
                let _ = reply.send(Err(SyncError::SessionEnded));
            }
        }
        for (_, reply) in self.responders.drain() {
            let _ = reply.send(Err(SyncError::SessionEnded));
        }

        self.stores.clear();
        self.dispatcher.reset();
        self.backoff.reset();
        self.thread_view = None;
        self.catch_up_generation += 1;
        self.session += 1;
        info!(dropped = dropped.len(), "Session ended, stores cleared");
    }
}

/// Invite notifications disappear as soon as the user answers.
fn stage_invite(
    stores: &mut Stores,
    invite_id: InviteId,
    kind: OperationKind,
    request: ApiRequest,
) -> Staged {
    let local = stores.notifications.find_by_invite(&invite_id).map(|i| i.id);
    let removed = local.and_then(|id| stores.notifications.remove(&id));
    Staged {
        kind,
        target: removed
            .as_ref()
            .and_then(|item| item.server_id)
            .map(EntityRef::Notification),
        rollback: removed
            .map(Rollback::RestoreNotification)
            .unwrap_or(Rollback::Nothing),
        request: Some(request),
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable access to the engine for views.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    broker: ResourceBroker,
}

impl SyncHandle {
    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SyncError::EngineClosed)?;
        rx.await.map_err(|_| SyncError::EngineClosed)
    }

    /// Run `f` against a consistent snapshot of the stores.
    pub async fn read<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Stores) -> R + Send + 'static,
    {
        self.request(|tx| {
            Command::Read(Box::new(move |stores| {
                let _ = tx.send(f(stores));
            }))
        })
        .await
    }

    /// Run `f` with mutable access to the stores on the engine task (for
    /// subscribing listeners or loading pages).
    pub async fn update<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Stores) -> R + Send + 'static,
    {
        self.request(|tx| {
            Command::Update(Box::new(move |stores| {
                let _ = tx.send(f(stores));
            }))
        })
        .await
    }

    /// Submit an intent and wait until the server settles it. On failure the
    /// optimistic change has been rolled back before the error is returned.
    pub async fn submit(&self, intent: Intent) -> Result<Receipt> {
        self.request(|reply| Command::Intent { intent, reply })
            .await?
    }

    pub async fn send_message(&self, channel_id: ChannelId, content: impl Into<String>) -> Result<Receipt> {
        self.submit(Intent::SendMessage {
            channel_id,
            content: content.into(),
        })
        .await
    }

    pub async fn edit_message(&self, message_id: MessageId, content: impl Into<String>) -> Result<Receipt> {
        self.submit(Intent::EditMessage {
            message_id,
            content: content.into(),
        })
        .await
    }

    pub async fn delete_message(&self, message_id: MessageId) -> Result<Receipt> {
        self.submit(Intent::DeleteMessage { message_id }).await
    }

    pub async fn send_reply(&self, parent_id: MessageId, content: impl Into<String>) -> Result<Receipt> {
        self.submit(Intent::SendReply {
            parent_id,
            content: content.into(),
        })
        .await
    }

    pub async fn mark_read(&self, notification: LocalId) -> Result<Receipt> {
        self.submit(Intent::MarkRead { notification }).await
    }

    pub async fn accept_invite(&self, invite_id: InviteId) -> Result<Receipt> {
        self.submit(Intent::AcceptInvite { invite_id }).await
    }

    pub async fn decline_invite(&self, invite_id: InviteId) -> Result<Receipt> {
        self.submit(Intent::DeclineInvite { invite_id }).await
    }

    pub async fn set_role(&self, community_id: CommunityId, user_id: UserId, role: Role) -> Result<Receipt> {
        self.submit(Intent::SetRole {
            community_id,
            user_id,
            role,
        })
        .await
    }

    /// Make `user_id` the community owner; the previous owner becomes admin.
    pub async fn promote(&self, community_id: CommunityId, user_id: UserId) -> Result<Receipt> {
        self.set_role(community_id, user_id, Role::Owner).await
    }

    /// Show `parent_id` in the thread panel owned by `view`. A different
    /// view that had the panel loses its resource leases.
    pub async fn open_thread(&self, parent_id: MessageId, view: ViewId) -> Result<()> {
        let previous = self
            .request(|reply| Command::OpenThread {
                parent_id,
                view,
                reply,
            })
            .await?;
        if let Some(previous) = previous {
            self.broker.revoke_owner(previous).await;
        }
        Ok(())
    }

    /// Close the thread panel and revoke its view's resource leases.
    /// Returns the number of leases revoked.
    pub async fn close_thread(&self) -> Result<usize> {
        let view = self.request(Command::CloseThread).await?;
        Ok(match view {
            Some(view) => self.broker.revoke_owner(view).await,
            None => 0,
        })
    }

    /// A view was torn down: release its leases and withdraw its queued
    /// claims. Its in-flight operations still complete.
    pub async fn close_view(&self, view: ViewId) -> usize {
        self.broker.revoke_owner(view).await
    }

    pub async fn acquire_resource(&self, resource: &ResourceId, view: ViewId) -> Result<Lease> {
        self.broker.acquire(resource, view).await
    }

    pub async fn release_resource(&self, lease: Lease) -> Result<()> {
        self.broker.release(lease).await
    }

    pub fn lease_info(&self, resource: &ResourceId) -> Option<ExclusiveResourceLease> {
        self.broker.lease_info(resource)
    }

    pub fn broker(&self) -> &ResourceBroker {
        &self.broker
    }

    pub async fn connection_state(&self) -> Result<ConnectionState> {
        self.request(Command::ConnectionState).await
    }

    pub async fn stats(&self) -> Result<SyncStats> {
        self.request(Command::Stats).await
    }

    /// End the session: pending operations fail with
    /// [`SyncError::SessionEnded`] and every store is cleared.
    pub async fn logout(&self) -> Result<()> {
        self.request(Command::Logout).await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}
