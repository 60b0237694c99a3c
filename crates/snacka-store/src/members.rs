use chrono::{DateTime, Utc};
use tracing::{debug, info};

use snacka_shared::protocol::{MemberPayload, MemberRemoval, RoleChange};
use snacka_shared::types::{CommunityId, Role, UserId};

use crate::config::StoreConfig;
use crate::entity::{Batch, EntityStore, Notification, SubscriptionId};
use crate::error::{Result, StoreError};
use crate::models::{Member, MemberKey, MergeOutcome, RoleCounts};
use crate::tombstones::Tombstones;

/// Community membership, grouped by community and sorted by role
/// (owner first), then display name.
///
/// Every committed state keeps at most one owner per community: a new owner
/// demotes the previous one to admin in the same batch.
pub struct MembershipStore {
    members: EntityStore<MemberKey, Member>,
    tombstones: Tombstones<MemberKey>,
}

/// Demote every owner of `community` other than `keep`. Returns the prior
/// state of each demoted member. `updated_at` is left alone so a demotion
/// never outranks the member's own later records.
fn demote_other_owners(
    b: &mut Batch<'_, MemberKey, Member>,
    owners: &[MemberKey],
    keep: MemberKey,
) -> Vec<Member> {
    let mut prior = Vec::new();
    for key in owners.iter().filter(|k| **k != keep) {
        if let Some(current) = b.get(key).cloned() {
            b.update(key, |m| m.role = Role::Admin);
            prior.push(current);
        }
    }
    prior
}

/// Ownership claims are ordered by `updated_at`, ties broken by user id.
fn claim_rank(m: &Member) -> (DateTime<Utc>, UserId) {
    (m.updated_at, m.user_id)
}

impl MembershipStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            members: EntityStore::new().with_order(|a: &Member, b: &Member| {
                a.community_id
                    .cmp(&b.community_id)
                    .then(b.role.cmp(&a.role))
                    .then(a.display_name_override.cmp(&b.display_name_override))
                    .then(a.user_id.cmp(&b.user_id))
            }),
            tombstones: Tombstones::new(config.tombstone_ttl),
        }
    }

    pub fn get(&self, community_id: CommunityId, user_id: UserId) -> Option<&Member> {
        self.members.get(&MemberKey {
            community_id,
            user_id,
        })
    }

    /// Members of one community, owner first.
    pub fn members(&self, community_id: CommunityId) -> Vec<&Member> {
        self.members
            .values()
            .filter(|m| m.community_id == community_id)
            .collect()
    }

    pub fn owner(&self, community_id: CommunityId) -> Option<&Member> {
        self.members
            .values()
            .find(|m| m.community_id == community_id && m.role == Role::Owner)
    }

    pub fn role_counts(&self, community_id: CommunityId) -> RoleCounts {
        self.members
            .values()
            .filter(|m| m.community_id == community_id)
            .fold(RoleCounts::default(), |mut counts, m| {
                match m.role {
                    Role::Owner => counts.owners += 1,
                    Role::Admin => counts.admins += 1,
                    Role::Member => counts.members += 1,
                }
                counts
            })
    }

    pub fn get_all(&self) -> Vec<Member> {
        self.members.get_all()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn subscribe(
        &mut self,
        listener: impl FnMut(&mut Notification<'_, MemberKey, Member>) + Send + 'static,
    ) -> SubscriptionId {
        self.members.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.members.unsubscribe(id)
    }

    fn owners_of(&self, community_id: CommunityId) -> Vec<MemberKey> {
        self.members
            .values()
            .filter(|m| m.community_id == community_id && m.role == Role::Owner)
            .map(Member::key)
            .collect()
    }

    /// Merge a full member record. Older than what is stored, or older than
    /// a recent removal, is stale.
    pub fn merge_member(&mut self, payload: MemberPayload) -> MergeOutcome {
        let incoming = Member::from_payload(payload);
        self.merge(incoming)
    }

    /// Merge a role change event. Unknown members are created with no
    /// display name override.
    pub fn apply_role_change(&mut self, change: RoleChange) -> MergeOutcome {
        let key = MemberKey {
            community_id: change.community_id,
            user_id: change.user_id,
        };
        let incoming = match self.members.get(&key) {
            Some(existing) => Member {
                role: change.role,
                updated_at: change.updated_at,
                ..existing.clone()
            },
            None => Member {
                community_id: change.community_id,
                user_id: change.user_id,
                role: change.role,
                display_name_override: None,
                updated_at: change.updated_at,
            },
        };
        self.merge(incoming)
    }

    fn merge(&mut self, incoming: Member) -> MergeOutcome {
        let key = incoming.key();
        if self.tombstones.blocks(&key, incoming.updated_at) {
            debug!(user = %key.user_id.short(), "Ignoring member update older than removal");
            return MergeOutcome::Stale;
        }
        if let Some(existing) = self.members.get(&key) {
            if incoming.updated_at < existing.updated_at {
                debug!(user = %key.user_id.short(), "Dropping stale member update");
                return MergeOutcome::Stale;
            }
        }

        let mut incoming = incoming;
        let mut owners = Vec::new();
        if incoming.role == Role::Owner {
            let rank = claim_rank(&incoming);
            let outranked = self.members.values().any(|m| {
                m.community_id == key.community_id
                    && m.role == Role::Owner
                    && m.key() != key
                    && claim_rank(m) > rank
            });
            if outranked {
                // A newer owner already holds the community.
                debug!(user = %key.user_id.short(), "Ownership claim older than current owner");
                incoming.role = Role::Admin;
            } else {
                owners = self.owners_of(key.community_id);
            }
        }

        let changed = self.members.batch(|b| {
            let demoted = demote_other_owners(b, &owners, key);
            let upserted = b.upsert(key, incoming);
            upserted || !demoted.is_empty()
        });

        if changed {
            MergeOutcome::Applied
        } else {
            MergeOutcome::Unchanged
        }
    }

    /// Local role change. Promoting a new owner demotes the previous owner in
    /// the same batch; demoting the sole owner is rejected.
    ///
    /// Returns the prior state of every member that changed, for
    /// [`restore_members`](Self::restore_members).
    pub fn set_role(
        &mut self,
        community_id: CommunityId,
        user_id: UserId,
        role: Role,
    ) -> Result<Vec<Member>> {
        let key = MemberKey {
            community_id,
            user_id,
        };
        let current = self.members.get(&key).cloned().ok_or(StoreError::NotFound)?;
        if current.role == role {
            return Ok(Vec::new());
        }
        if current.role == Role::Owner {
            return Err(StoreError::SoleOwner {
                community: community_id,
            });
        }

        let owners = if role == Role::Owner {
            self.owners_of(community_id)
        } else {
            Vec::new()
        };
        let now = Utc::now();
        let prior = self.members.batch(|b| {
            let mut prior = demote_other_owners(b, &owners, key);
            b.update(&key, |m| {
                m.role = role;
                m.updated_at = m.updated_at.max(now);
            });
            prior.push(current);
            prior
        });

        info!(
            community = %community_id.short(),
            user = %user_id.short(),
            ?role,
            "Role changed locally"
        );
        Ok(prior)
    }

    /// Put member records back exactly as they were (rollback).
    pub fn restore_members(&mut self, prior: Vec<Member>) {
        for member in &prior {
            self.tombstones.lift(&member.key());
        }
        self.members.batch(|b| {
            for member in prior {
                b.upsert(member.key(), member);
            }
        });
    }

    /// Local removal (kick or leave).
    pub fn remove_member(&mut self, community_id: CommunityId, user_id: UserId) -> Option<Member> {
        let key = MemberKey {
            community_id,
            user_id,
        };
        self.tombstones.insert(key);
        self.members.remove(&key)
    }

    /// Apply a `member_removed` event. Updates stamped after the removal may
    /// still bring the member back (rejoin).
    pub fn merge_removal(&mut self, removal: MemberRemoval) -> MergeOutcome {
        let key = MemberKey {
            community_id: removal.community_id,
            user_id: removal.user_id,
        };
        if let Some(existing) = self.members.get(&key) {
            if existing.updated_at > removal.removed_at {
                return MergeOutcome::Stale;
            }
        }
        self.tombstones.insert_at(key, removal.removed_at);
        match self.members.remove(&key) {
            Some(_) => MergeOutcome::Applied,
            None => MergeOutcome::Unchanged,
        }
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.tombstones.clear();
    }
}
