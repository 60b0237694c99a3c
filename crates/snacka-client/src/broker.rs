//! Exclusive resource broker.
//!
//! Hands hardware-bound resources (video renderers, capture devices) from one
//! view to the next with at most one owner at a time. Each resource moves
//! through
//!
//! ```text
//!  Free ──acquire──> Held ──release──> Releasing ──detached──> Quarantined
//!   ^                                                              |
//!   └──────────── quarantine elapsed, no claimant queued ──────────┘
//! ```
//!
//! Claimants that arrive while the resource is busy queue in FIFO order and
//! are granted when the quarantine ends. Every grant and every quarantine
//! bumps the resource's generation so stale timers and stale leases are
//! ignored.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use snacka_shared::types::{ResourceId, ViewId};

use crate::api::ResourceHost;
use crate::error::{Result, SyncError};

/// Proof of ownership handed to the claimant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub resource: ResourceId,
    pub owner: ViewId,
    generation: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeasePhase {
    #[default]
    Free,
    Held,
    Releasing,
    Quarantined,
}

/// Snapshot of one resource's lease record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExclusiveResourceLease {
    pub resource_id: ResourceId,
    pub phase: LeasePhase,
    pub current_owner: Option<ViewId>,
    pub released_at: Option<DateTime<Utc>>,
    pub quarantine_until: Option<DateTime<Utc>>,
    pub queued: usize,
}

struct Waiter {
    claimant: ViewId,
    ticket: u64,
    grant: oneshot::Sender<Lease>,
}

#[derive(Default)]
struct Slot {
    phase: LeasePhase,
    owner: Option<ViewId>,
    generation: u64,
    released_at: Option<DateTime<Utc>>,
    quarantine_until: Option<DateTime<Utc>>,
    waiters: VecDeque<Waiter>,
}

impl Slot {
    /// Grant the oldest live waiter, or free the resource.
    fn grant_next(&mut self, resource: &ResourceId) -> Option<ViewId> {
        while let Some(waiter) = self.waiters.pop_front() {
            self.generation += 1;
            let lease = Lease {
                resource: resource.clone(),
                owner: waiter.claimant,
                generation: self.generation,
            };
            if waiter.grant.send(lease).is_ok() {
                self.phase = LeasePhase::Held;
                self.owner = Some(waiter.claimant);
                return Some(waiter.claimant);
            }
        }
        self.phase = LeasePhase::Free;
        self.owner = None;
        None
    }
}

#[derive(Default)]
struct BrokerState {
    slots: HashMap<ResourceId, Slot>,
    next_ticket: u64,
}

enum Claim {
    Granted(Lease),
    Queued {
        ticket: u64,
        grant: oneshot::Receiver<Lease>,
    },
}

struct Inner {
    state: Mutex<BrokerState>,
    host: Arc<dyn ResourceHost>,
    quarantine: Duration,
    acquire_timeout: Duration,
}

impl Inner {
    fn end_quarantine(&self, resource: &ResourceId, generation: u64) {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(resource) else {
            return;
        };
        if slot.generation != generation || slot.phase != LeasePhase::Quarantined {
            return;
        }
        slot.quarantine_until = None;
        match slot.grant_next(resource) {
            Some(owner) => debug!(%resource, owner = %owner.short(), "Quarantine over, granted"),
            None => debug!(%resource, "Quarantine over, resource free"),
        }
    }

    /// Remove a queued claim. `false` if it already left the queue.
    fn withdraw(&self, resource: &ResourceId, ticket: u64) -> bool {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(resource) else {
            return false;
        };
        let before = slot.waiters.len();
        slot.waiters.retain(|w| w.ticket != ticket);
        slot.waiters.len() != before
    }

    /// Give up a lease whose attach failed: no detach, no quarantine.
    fn abandon(&self, lease: &Lease) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(&lease.resource) {
            if slot.generation == lease.generation && slot.owner == Some(lease.owner) {
                slot.grant_next(&lease.resource);
            }
        }
    }
}

/// Rolls back a claim whose acquire future is dropped before it returns.
/// A queued claim leaves the line and a granted lease is abandoned.
struct PendingClaim {
    inner: Arc<Inner>,
    resource: ResourceId,
    queued: Option<(u64, oneshot::Receiver<Lease>)>,
    lease: Option<Lease>,
}

impl PendingClaim {
    fn new(inner: Arc<Inner>, resource: &ResourceId) -> Self {
        Self {
            inner,
            resource: resource.clone(),
            queued: None,
            lease: None,
        }
    }

    fn queue(&mut self, ticket: u64, grant: oneshot::Receiver<Lease>) -> &mut oneshot::Receiver<Lease> {
        &mut self.queued.insert((ticket, grant)).1
    }

    /// The claim completed; keep the lease.
    fn disarm(mut self) {
        self.queued = None;
        self.lease = None;
    }
}

impl Drop for PendingClaim {
    fn drop(&mut self) {
        if let Some((ticket, mut grant)) = self.queued.take() {
            // Not in line any more: the grant may already be in the channel.
            if !self.inner.withdraw(&self.resource, ticket) {
                self.lease = grant.try_recv().ok();
            }
        }
        if let Some(lease) = self.lease.take() {
            debug!(resource = %lease.resource, owner = %lease.owner.short(), "Abandoning unfinished claim");
            self.inner.abandon(&lease);
        }
    }
}

/// Cloneable handle to the broker service.
#[derive(Clone)]
pub struct ResourceBroker {
    inner: Arc<Inner>,
}

impl ResourceBroker {
    pub fn new(host: Arc<dyn ResourceHost>, quarantine: Duration, acquire_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                host,
                quarantine,
                acquire_timeout,
            }),
        }
    }

    pub fn quarantine(&self) -> Duration {
        self.inner.quarantine
    }

    /// Acquire `resource` for `claimant`, waiting in line if it is busy.
    ///
    /// Re-acquiring a resource the claimant already holds returns its lease.
    /// Fails with [`SyncError::ResourceDenied`] once the acquire timeout
    /// elapses or the claim is withdrawn by [`revoke_owner`](Self::revoke_owner).
    pub async fn acquire(&self, resource: &ResourceId, claimant: ViewId) -> Result<Lease> {
        let claim = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            let slot = state.slots.entry(resource.clone()).or_default();

            match slot.phase {
                LeasePhase::Free => {
                    slot.generation += 1;
                    slot.phase = LeasePhase::Held;
                    slot.owner = Some(claimant);
                    Claim::Granted(Lease {
                        resource: resource.clone(),
                        owner: claimant,
                        generation: slot.generation,
                    })
                }
                LeasePhase::Held if slot.owner == Some(claimant) => {
                    return Ok(Lease {
                        resource: resource.clone(),
                        owner: claimant,
                        generation: slot.generation,
                    });
                }
                phase => {
                    let (tx, rx) = oneshot::channel();
                    slot.waiters.push_back(Waiter {
                        claimant,
                        ticket,
                        grant: tx,
                    });
                    debug!(
                        %resource,
                        claimant = %claimant.short(),
                        ?phase,
                        position = slot.waiters.len(),
                        "Resource busy, queued"
                    );
                    Claim::Queued { ticket, grant: rx }
                }
            }
        };

        let mut pending = PendingClaim::new(self.inner.clone(), resource);
        let lease = match claim {
            Claim::Granted(lease) => lease,
            Claim::Queued { ticket, grant } => {
                let grant = pending.queue(ticket, grant);
                let waited = self.wait_for_grant(resource, ticket, grant).await;
                pending.queued = None;
                waited?
            }
        };
        pending.lease = Some(lease.clone());

        if let Err(e) = self.inner.host.attach(resource, claimant).await {
            warn!(%resource, claimant = %claimant.short(), error = %e, "Resource attach failed");
            drop(pending);
            return Err(SyncError::Host(e));
        }
        pending.disarm();

        info!(%resource, owner = %claimant.short(), "Resource acquired");
        Ok(lease)
    }

    async fn wait_for_grant(
        &self,
        resource: &ResourceId,
        ticket: u64,
        grant: &mut oneshot::Receiver<Lease>,
    ) -> Result<Lease> {
        let started = Instant::now();
        let denied = |started: Instant| SyncError::ResourceDenied {
            resource: resource.clone(),
            waited_ms: started.elapsed().as_millis() as u64,
        };

        match tokio::time::timeout(self.inner.acquire_timeout, &mut *grant).await {
            Ok(Ok(lease)) => Ok(lease),
            // Withdrawn.
            Ok(Err(_)) => Err(denied(started)),
            Err(_) => {
                if self.inner.withdraw(resource, ticket) {
                    warn!(%resource, "Resource acquire timed out");
                    return Err(denied(started));
                }
                // Granted between the timeout and the withdraw.
                grant.try_recv().map_err(|_| denied(started))
            }
        }
    }

    /// Release a lease: detach, then quarantine before the next grant.
    /// Stale leases are ignored.
    pub async fn release(&self, lease: Lease) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            let Some(slot) = state.slots.get_mut(&lease.resource) else {
                return Ok(());
            };
            if slot.phase != LeasePhase::Held
                || slot.owner != Some(lease.owner)
                || slot.generation != lease.generation
            {
                debug!(resource = %lease.resource, "Ignoring release of stale lease");
                return Ok(());
            }
            slot.phase = LeasePhase::Releasing;
        }

        let detached = self.inner.host.detach(&lease.resource, lease.owner).await;

        let quarantine = self.inner.quarantine;
        let deadline = Instant::now() + quarantine;
        let generation = {
            let mut state = self.inner.state.lock();
            let Some(slot) = state.slots.get_mut(&lease.resource) else {
                return Ok(());
            };
            let now = Utc::now();
            slot.phase = LeasePhase::Quarantined;
            slot.owner = None;
            slot.released_at = Some(now);
            slot.quarantine_until =
                Some(now + chrono::Duration::from_std(quarantine).unwrap_or_else(|_| chrono::Duration::zero()));
            slot.generation += 1;
            slot.generation
        };

        info!(
            resource = %lease.resource,
            owner = %lease.owner.short(),
            quarantine_ms = quarantine.as_millis() as u64,
            "Resource released"
        );

        let inner = self.inner.clone();
        let resource = lease.resource.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            inner.end_quarantine(&resource, generation);
        });

        detached.map_err(|e| {
            warn!(resource = %lease.resource, error = %e, "Resource detach failed");
            SyncError::Host(e)
        })
    }

    /// Release everything `claimant` holds and withdraw its queued claims
    /// (the view was torn down). Returns the number of leases released.
    pub async fn revoke_owner(&self, claimant: ViewId) -> usize {
        let leases: Vec<Lease> = {
            let mut state = self.inner.state.lock();
            let mut leases = Vec::new();
            for (resource, slot) in state.slots.iter_mut() {
                slot.waiters.retain(|w| w.claimant != claimant);
                if slot.phase == LeasePhase::Held && slot.owner == Some(claimant) {
                    leases.push(Lease {
                        resource: resource.clone(),
                        owner: claimant,
                        generation: slot.generation,
                    });
                }
            }
            leases
        };

        let count = leases.len();
        for lease in leases {
            if let Err(e) = self.release(lease).await {
                warn!(owner = %claimant.short(), error = %e, "Revoked lease released with errors");
            }
        }
        if count > 0 {
            info!(owner = %claimant.short(), count, "Revoked view's leases");
        }
        count
    }

    pub fn lease_info(&self, resource: &ResourceId) -> Option<ExclusiveResourceLease> {
        let state = self.inner.state.lock();
        state.slots.get(resource).map(|slot| ExclusiveResourceLease {
            resource_id: resource.clone(),
            phase: slot.phase,
            current_owner: slot.owner,
            released_at: slot.released_at,
            quarantine_until: slot.quarantine_until,
            queued: slot.waiters.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct RecordingHost {
        calls: Mutex<Vec<(&'static str, ViewId)>>,
        fail_attach: bool,
        attach_gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl ResourceHost for RecordingHost {
        async fn attach(&self, _resource: &ResourceId, owner: ViewId) -> std::result::Result<(), String> {
            self.calls.lock().push(("attach", owner));
            if let Some(gate) = &self.attach_gate {
                gate.notified().await;
            }
            if self.fail_attach {
                return Err("device busy".into());
            }
            Ok(())
        }

        async fn detach(&self, _resource: &ResourceId, owner: ViewId) -> std::result::Result<(), String> {
            self.calls.lock().push(("detach", owner));
            Ok(())
        }
    }

    const QUARANTINE: Duration = Duration::from_millis(250);

    fn broker(host: Arc<RecordingHost>) -> ResourceBroker {
        ResourceBroker::new(host, QUARANTINE, Duration::from_secs(5))
    }

    fn renderer() -> ResourceId {
        ResourceId::new("video-renderer:0")
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_acquire_during_quarantine_waits() {
        let host = Arc::new(RecordingHost::default());
        let broker = broker(host.clone());
        let (a, b) = (ViewId::new(), ViewId::new());

        let lease = broker.acquire(&renderer(), a).await.unwrap();
        broker.release(lease).await.unwrap();
        let released = Instant::now();
        assert_eq!(
            broker.lease_info(&renderer()).unwrap().phase,
            LeasePhase::Quarantined
        );

        tokio::time::advance(Duration::from_millis(100)).await;
        let lease = broker.acquire(&renderer(), b).await.unwrap();

        assert!(released.elapsed() >= QUARANTINE);
        assert_eq!(lease.owner, b);
        let calls = host.calls.lock().clone();
        assert_eq!(calls, vec![("attach", a), ("detach", a), ("attach", b)]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_acquire_after_quarantine_is_immediate() {
        let broker = broker(Arc::new(RecordingHost::default()));
        let (a, b) = (ViewId::new(), ViewId::new());

        let lease = broker.acquire(&renderer(), a).await.unwrap();
        broker.release(lease).await.unwrap();

        tokio::time::advance(QUARANTINE + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;

        let before = Instant::now();
        broker.acquire(&renderer(), b).await.unwrap();
        assert_eq!(before.elapsed(), Duration::ZERO);
        assert_eq!(
            broker.lease_info(&renderer()).unwrap().current_owner,
            Some(b)
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_queued_claimant_denied_after_timeout() {
        let broker = broker(Arc::new(RecordingHost::default()));
        let (a, b) = (ViewId::new(), ViewId::new());
        broker.acquire(&renderer(), a).await.unwrap();

        let err = broker.acquire(&renderer(), b).await.unwrap_err();
        match err {
            SyncError::ResourceDenied { waited_ms, .. } => assert!(waited_ms >= 5_000),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(broker.lease_info(&renderer()).unwrap().queued, 0);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_reacquire_by_owner_returns_lease() {
        let host = Arc::new(RecordingHost::default());
        let broker = broker(host.clone());
        let a = ViewId::new();

        let first = broker.acquire(&renderer(), a).await.unwrap();
        let second = broker.acquire(&renderer(), a).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(host.calls.lock().len(), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_fifo_grant_order() {
        let broker = broker(Arc::new(RecordingHost::default()));
        let (a, b, c) = (ViewId::new(), ViewId::new(), ViewId::new());
        let lease = broker.acquire(&renderer(), a).await.unwrap();

        let wait_b = tokio::spawn({
            let broker = broker.clone();
            async move { broker.acquire(&renderer(), b).await }
        });
        tokio::task::yield_now().await;
        let wait_c = tokio::spawn({
            let broker = broker.clone();
            async move { broker.acquire(&renderer(), c).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(broker.lease_info(&renderer()).unwrap().queued, 2);

        broker.release(lease).await.unwrap();
        let lease_b = wait_b.await.unwrap().unwrap();
        assert_eq!(lease_b.owner, b);
        assert_eq!(broker.lease_info(&renderer()).unwrap().queued, 1);

        broker.release(lease_b).await.unwrap();
        assert_eq!(wait_c.await.unwrap().unwrap().owner, c);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_revoke_owner_hands_over() {
        let broker = broker(Arc::new(RecordingHost::default()));
        let (a, b) = (ViewId::new(), ViewId::new());
        let stale = broker.acquire(&renderer(), a).await.unwrap();

        let wait_b = tokio::spawn({
            let broker = broker.clone();
            async move { broker.acquire(&renderer(), b).await }
        });
        tokio::task::yield_now().await;

        assert_eq!(broker.revoke_owner(a).await, 1);
        assert_eq!(wait_b.await.unwrap().unwrap().owner, b);

        // The revoked lease no longer releases anything.
        broker.release(stale).await.unwrap();
        assert_eq!(
            broker.lease_info(&renderer()).unwrap().phase,
            LeasePhase::Held
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_revoke_withdraws_queued_claim() {
        let broker = broker(Arc::new(RecordingHost::default()));
        let (a, b) = (ViewId::new(), ViewId::new());
        broker.acquire(&renderer(), a).await.unwrap();

        let wait_b = tokio::spawn({
            let broker = broker.clone();
            async move { broker.acquire(&renderer(), b).await }
        });
        tokio::task::yield_now().await;

        assert_eq!(broker.revoke_owner(b).await, 0);
        assert!(matches!(
            wait_b.await.unwrap(),
            Err(SyncError::ResourceDenied { .. })
        ));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_failed_attach_frees_resource() {
        let host = Arc::new(RecordingHost {
            fail_attach: true,
            ..RecordingHost::default()
        });
        let broker = broker(host);

        let err = broker.acquire(&renderer(), ViewId::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::Host(_)));
        assert_eq!(
            broker.lease_info(&renderer()).unwrap().phase,
            LeasePhase::Free
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_acquire_aborted_during_attach_frees_resource() {
        let gate = Arc::new(Notify::new());
        let host = Arc::new(RecordingHost {
            attach_gate: Some(gate.clone()),
            ..RecordingHost::default()
        });
        let broker = broker(host);
        let (a, b) = (ViewId::new(), ViewId::new());

        let stuck = tokio::spawn({
            let broker = broker.clone();
            async move { broker.acquire(&renderer(), a).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(
            broker.lease_info(&renderer()).unwrap().current_owner,
            Some(a)
        );

        stuck.abort();
        assert!(stuck.await.unwrap_err().is_cancelled());
        let info = broker.lease_info(&renderer()).unwrap();
        assert_eq!(info.phase, LeasePhase::Free);
        assert_eq!(info.current_owner, None);

        gate.notify_one();
        let lease = broker.acquire(&renderer(), b).await.unwrap();
        assert_eq!(lease.owner, b);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_dropped_claim_returns_undelivered_grant() {
        let broker = broker(Arc::new(RecordingHost::default()));
        let (a, b) = (ViewId::new(), ViewId::new());
        let resource = renderer();
        let lease = broker.acquire(&resource, a).await.unwrap();

        let mut claim = Box::pin(broker.acquire(&resource, b));
        assert!(tokio::time::timeout(Duration::from_millis(1), &mut claim)
            .await
            .is_err());
        assert_eq!(broker.lease_info(&resource).unwrap().queued, 1);

        // The grant lands in the claim's channel but is never read.
        broker.release(lease).await.unwrap();
        tokio::time::advance(QUARANTINE + Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(broker.lease_info(&resource).unwrap().current_owner, Some(b));

        drop(claim);
        let info = broker.lease_info(&resource).unwrap();
        assert_eq!(info.phase, LeasePhase::Free);
        assert_eq!(info.current_owner, None);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_dropped_queued_claim_leaves_line() {
        let broker = broker(Arc::new(RecordingHost::default()));
        let (a, b) = (ViewId::new(), ViewId::new());
        let resource = renderer();
        broker.acquire(&resource, a).await.unwrap();

        let mut claim = Box::pin(broker.acquire(&resource, b));
        assert!(tokio::time::timeout(Duration::from_millis(1), &mut claim)
            .await
            .is_err());
        assert_eq!(broker.lease_info(&resource).unwrap().queued, 1);

        drop(claim);
        assert_eq!(broker.lease_info(&resource).unwrap().queued, 0);
    }
}
