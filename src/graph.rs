//! The referral graph: IB partners, referred users, and the edges between
//! them.
//!
//! The graph is a forest. Each node has at most one parent, and every write
//! that would introduce a cycle is rejected before it touches state. Both
//! node kinds, the referral-code index, and the transfer audit log live
//! behind one `RwLock`, so graph mutations are serialized; the per-record
//! `version` counters back the optimistic CAS surface ([`ReferralGraph::cas_partner`])
//! that lifecycle transitions and admin retries rely on.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use uuid::Uuid;

use crate::error::{IbError, IbResult};
use crate::model::{IbPartner, IbStatus, ReferredUser, TransferAudit};

/// Default and maximum depth for ancestor queries.
pub const MAX_ANCESTOR_DEPTH: usize = 5;

#[derive(Debug, Default)]
struct GraphInner {
    partners: HashMap<Uuid, IbPartner>,
    users: HashMap<Uuid, ReferredUser>,
    /// Trading-platform user id -> referred-user record id.
    users_by_trading_id: HashMap<Uuid, Uuid>,
    /// Referral code -> partner id.
    codes: HashMap<String, Uuid>,
    audit: Vec<TransferAudit>,
}

/// Owner of the referral forest.
#[derive(Debug, Default)]
pub struct ReferralGraph {
    inner: RwLock<GraphInner>,
}

impl ReferralGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, GraphInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, GraphInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Registration and lookups
    // ------------------------------------------------------------------

    /// Insert a new partner node. The parent edge, when present, must point
    /// at an existing partner; a fresh node can never close a cycle.
    pub fn register_partner(&self, partner: IbPartner) -> IbResult<Uuid> {
        let mut inner = self.write();
        if inner.partners.contains_key(&partner.id) {
            return Err(IbError::Validation(format!(
                "partner {} is already registered",
                partner.id
            )));
        }
        if let Some(code) = &partner.referral_code {
            if inner.codes.contains_key(code) {
                return Err(IbError::Validation(format!(
                    "referral code {code} is already in use"
                )));
            }
        }
        if let Some(parent) = partner.parent_ib {
            if !inner.partners.contains_key(&parent) {
                return Err(IbError::NotFound {
                    entity: "parent IB",
                    id: parent,
                });
            }
        }

        let id = partner.id;
        let parent = partner.parent_ib;
        if let Some(code) = &partner.referral_code {
            inner.codes.insert(code.clone(), id);
        }
        inner.partners.insert(id, partner);
        if let Some(parent) = parent {
            Self::refresh_count(&mut inner, parent);
        }
        log::debug!("registered IB partner {id}");
        Ok(id)
    }

    /// Insert an unattributed signup. Attribution happens through
    /// [`ReferralGraph::attach`].
    pub fn register_user(&self, user: ReferredUser) -> IbResult<Uuid> {
        let mut inner = self.write();
        if inner.users.contains_key(&user.id) {
            return Err(IbError::Validation(format!(
                "referred user {} is already registered",
                user.id
            )));
        }
        if inner.users_by_trading_id.contains_key(&user.user_id) {
            return Err(IbError::Validation(format!(
                "trading user {} already has a referred-user record",
                user.user_id
            )));
        }
        if user.referred_by.is_some() {
            return Err(IbError::Validation(
                "register the user first, then attach the attribution".to_string(),
            ));
        }
        let id = user.id;
        inner.users_by_trading_id.insert(user.user_id, id);
        inner.users.insert(id, user);
        Ok(id)
    }

    pub fn partner(&self, id: Uuid) -> IbResult<IbPartner> {
        self.read()
            .partners
            .get(&id)
            .cloned()
            .ok_or(IbError::NotFound {
                entity: "IB partner",
                id,
            })
    }

    pub fn user(&self, id: Uuid) -> IbResult<ReferredUser> {
        self.read().users.get(&id).cloned().ok_or(IbError::NotFound {
            entity: "referred user",
            id,
        })
    }

    pub fn partner_by_code(&self, code: &str) -> Option<IbPartner> {
        let inner = self.read();
        let id = inner.codes.get(code)?;
        inner.partners.get(id).cloned()
    }

    pub fn code_in_use(&self, code: &str) -> bool {
        self.read().codes.contains_key(code)
    }

    /// Direct referring IB of a trading-platform user, if attributed.
    pub fn attribution_of(&self, trading_user_id: Uuid) -> Option<Uuid> {
        let inner = self.read();
        let record_id = inner.users_by_trading_id.get(&trading_user_id)?;
        inner.users.get(record_id).and_then(|u| u.referred_by)
    }

    pub fn partners(&self) -> Vec<IbPartner> {
        self.read().partners.values().cloned().collect()
    }

    pub fn users(&self) -> Vec<ReferredUser> {
        self.read().users.values().cloned().collect()
    }

    /// Whether any partner is currently bound to the given plan.
    pub fn plan_in_use(&self, plan_id: Uuid) -> bool {
        self.read()
            .partners
            .values()
            .any(|p| p.plan_id == Some(plan_id))
    }

    pub fn status_counts(&self) -> HashMap<IbStatus, usize> {
        let mut counts = HashMap::new();
        for partner in self.read().partners.values() {
            *counts.entry(partner.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn audit_trail(&self) -> Vec<TransferAudit> {
        self.read().audit.clone()
    }

    // ------------------------------------------------------------------
    // Edge writes
    // ------------------------------------------------------------------

    /// Attribute a signup to an IB. Fails if the user already has a referrer
    /// or if the target does not resolve to an ACTIVE partner.
    pub fn attach(&self, user_record_id: Uuid, ib_id: Uuid) -> IbResult<()> {
        let mut inner = self.write();
        let current = inner
            .users
            .get(&user_record_id)
            .ok_or(IbError::NotFound {
                entity: "referred user",
                id: user_record_id,
            })?
            .referred_by;
        if let Some(current_ib) = current {
            return Err(IbError::AlreadyAttributed {
                user: user_record_id,
                current_ib,
            });
        }
        Self::require_active(&inner, ib_id)?;

        let user = inner
            .users
            .get_mut(&user_record_id)
            .ok_or(IbError::NotFound {
                entity: "referred user",
                id: user_record_id,
            })?;
        user.referred_by = Some(ib_id);
        user.attributed_at = Utc::now();
        user.version += 1;
        Self::refresh_count(&mut inner, ib_id);
        log::info!("attributed user {user_record_id} to IB {ib_id}");
        Ok(())
    }

    /// Ordered ancestor ids starting at `ib_id` itself (distance 1 from the
    /// partner's referred users) and walking upward, truncated at
    /// `max_depth` entries. The visited guard is unreachable while the
    /// cycle-rejecting writes hold, but bounds the walk regardless.
    pub fn ancestor_chain(&self, ib_id: Uuid, max_depth: usize) -> IbResult<Vec<Uuid>> {
        let inner = self.read();
        if !inner.partners.contains_key(&ib_id) {
            return Err(IbError::NotFound {
                entity: "IB partner",
                id: ib_id,
            });
        }
        let depth = max_depth.min(MAX_ANCESTOR_DEPTH);
        let mut chain = Vec::with_capacity(depth);
        let mut visited = HashSet::new();
        let mut cursor = Some(ib_id);
        while let Some(id) = cursor {
            if chain.len() == depth || !visited.insert(id) {
                break;
            }
            chain.push(id);
            cursor = inner.partners.get(&id).and_then(|p| p.parent_ib);
        }
        Ok(chain)
    }

    /// Overwrite a user's attribution and append an audit row. Returns
    /// `false` as a no-op when the user is already attributed to `new_ib`.
    pub fn reparent(&self, user_record_id: Uuid, new_ib: Uuid, actor: &str) -> IbResult<bool> {
        let mut inner = self.write();
        Self::require_active(&inner, new_ib)?;
        let previous = inner
            .users
            .get(&user_record_id)
            .ok_or(IbError::NotFound {
                entity: "referred user",
                id: user_record_id,
            })?
            .referred_by;
        if previous == Some(new_ib) {
            return Ok(false);
        }

        let user = inner
            .users
            .get_mut(&user_record_id)
            .ok_or(IbError::NotFound {
                entity: "referred user",
                id: user_record_id,
            })?;
        user.referred_by = Some(new_ib);
        user.attributed_at = Utc::now();
        user.version += 1;

        if let Some(prev) = previous {
            Self::refresh_count(&mut inner, prev);
        }
        Self::refresh_count(&mut inner, new_ib);
        inner.audit.push(TransferAudit {
            moved_id: user_record_id,
            previous_ib: previous,
            new_ib,
            at: Utc::now(),
            actor: actor.to_string(),
        });
        log::info!("reparented user {user_record_id} from {previous:?} to IB {new_ib} by {actor}");
        Ok(true)
    }

    /// Move an IB under a new parent IB; the IB-to-IB variant of
    /// [`ReferralGraph::reparent`]. Rejects any move that would place a
    /// partner beneath its own subtree.
    pub fn set_parent(&self, ib_id: Uuid, new_parent: Uuid, actor: &str) -> IbResult<bool> {
        let mut inner = self.write();
        if !inner.partners.contains_key(&ib_id) {
            return Err(IbError::NotFound {
                entity: "IB partner",
                id: ib_id,
            });
        }
        Self::require_active(&inner, new_parent)?;
        if ib_id == new_parent || Self::in_subtree(&inner, new_parent, ib_id) {
            return Err(IbError::CycleDetected { ib: ib_id });
        }
        let previous = inner.partners[&ib_id].parent_ib;
        if previous == Some(new_parent) {
            return Ok(false);
        }

        let partner = inner
            .partners
            .get_mut(&ib_id)
            .ok_or(IbError::NotFound {
                entity: "IB partner",
                id: ib_id,
            })?;
        partner.parent_ib = Some(new_parent);
        partner.version += 1;

        if let Some(prev) = previous {
            Self::refresh_count(&mut inner, prev);
        }
        Self::refresh_count(&mut inner, new_parent);
        inner.audit.push(TransferAudit {
            moved_id: ib_id,
            previous_ib: previous,
            new_ib: new_parent,
            at: Utc::now(),
            actor: actor.to_string(),
        });
        log::info!("reparented IB {ib_id} from {previous:?} to IB {new_parent} by {actor}");
        Ok(true)
    }

    /// Compare-and-swap mutation of a partner record. `expected_version`
    /// must match the caller's read; on mismatch the state is untouched and
    /// the caller should reread and retry.
    pub fn cas_partner<F>(&self, id: Uuid, expected_version: u64, mutate: F) -> IbResult<IbPartner>
    where
        F: FnOnce(&mut IbPartner),
    {
        let mut inner = self.write();
        let current = inner.partners.get(&id).ok_or(IbError::NotFound {
            entity: "IB partner",
            id,
        })?;
        if current.version != expected_version {
            return Err(IbError::Conflict {
                entity: "IB partner",
                id,
            });
        }

        let old_code = current.referral_code.clone();
        let old_status = current.status;
        let mut updated = current.clone();
        mutate(&mut updated);
        updated.id = id; // identity is not writable through CAS
        updated.version = expected_version + 1;

        if updated.referral_code != old_code {
            if let Some(code) = &updated.referral_code {
                if inner.codes.get(code).is_some_and(|owner| *owner != id) {
                    return Err(IbError::Validation(format!(
                        "referral code {code} is already in use"
                    )));
                }
            }
            if let Some(code) = &old_code {
                inner.codes.remove(code);
            }
            if let Some(code) = &updated.referral_code {
                inner.codes.insert(code.clone(), id);
            }
        }

        let entered_or_left_rejected = (updated.status == IbStatus::Rejected)
            != (old_status == IbStatus::Rejected);
        let parent = updated.parent_ib;
        inner.partners.insert(id, updated.clone());
        // Rejection ends the referral; the parent's count follows.
        if entered_or_left_rejected {
            if let Some(parent) = parent {
                Self::refresh_count(&mut inner, parent);
            }
        }
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn require_active(inner: &GraphInner, ib_id: Uuid) -> IbResult<()> {
        match inner.partners.get(&ib_id) {
            Some(p) if p.status == IbStatus::Active => Ok(()),
            // An inactive partner is not a valid referral target; callers
            // see both cases as an unknown target.
            _ => Err(IbError::NotFound {
                entity: "active IB partner",
                id: ib_id,
            }),
        }
    }

    /// Whether `node` lies in the subtree rooted at `root` (ancestors of
    /// `node` include `root`).
    fn in_subtree(inner: &GraphInner, node: Uuid, root: Uuid) -> bool {
        let mut visited = HashSet::new();
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            if id == root {
                return true;
            }
            if !visited.insert(id) {
                return false;
            }
            cursor = inner.partners.get(&id).and_then(|p| p.parent_ib);
        }
        false
    }

    /// Recount direct referrals (users and child IBs) and store the result,
    /// bumping the partner's version. A Rejected child is a dead application,
    /// not a referral; it never counts toward the ladder. Pending children
    /// do count — they may still activate.
    fn refresh_count(inner: &mut GraphInner, ib_id: Uuid) {
        let users = inner
            .users
            .values()
            .filter(|u| u.referred_by == Some(ib_id))
            .count();
        let children = inner
            .partners
            .values()
            .filter(|p| p.parent_ib == Some(ib_id) && p.status != IbStatus::Rejected)
            .count();
        if let Some(partner) = inner.partners.get_mut(&ib_id) {
            let count = (users + children) as u32;
            if partner.referral_count != count {
                partner.referral_count = count;
                partner.version += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_partner(graph: &ReferralGraph, parent: Option<Uuid>) -> Uuid {
        let mut partner = IbPartner::new(Uuid::new_v4(), parent);
        partner.status = IbStatus::Active;
        graph.register_partner(partner).unwrap()
    }

    #[test]
    fn test_attach_increments_referral_count() {
        let graph = ReferralGraph::new();
        let ib = active_partner(&graph, None);
        let user = graph.register_user(ReferredUser::new(Uuid::new_v4())).unwrap();

        graph.attach(user, ib).unwrap();
        assert_eq!(graph.partner(ib).unwrap().referral_count, 1);
        assert_eq!(graph.user(user).unwrap().referred_by, Some(ib));
    }

    #[test]
    fn test_attach_twice_fails_already_attributed() {
        let graph = ReferralGraph::new();
        let ib1 = active_partner(&graph, None);
        let ib2 = active_partner(&graph, None);
        let user = graph.register_user(ReferredUser::new(Uuid::new_v4())).unwrap();

        graph.attach(user, ib1).unwrap();
        let err = graph.attach(user, ib2).unwrap_err();
        assert_eq!(
            err,
            IbError::AlreadyAttributed {
                user,
                current_ib: ib1
            }
        );
    }

    #[test]
    fn test_attach_to_non_active_partner_fails() {
        let graph = ReferralGraph::new();
        let pending = IbPartner::new(Uuid::new_v4(), None); // stays Pending
        let ib = graph.register_partner(pending).unwrap();
        let user = graph.register_user(ReferredUser::new(Uuid::new_v4())).unwrap();

        let err = graph.attach(user, ib).unwrap_err();
        assert!(matches!(err, IbError::NotFound { .. }));
    }

    #[test]
    fn test_ancestor_chain_order_and_truncation() {
        let graph = ReferralGraph::new();
        let root = active_partner(&graph, None);
        let mut chain = vec![root];
        for _ in 0..6 {
            let child = active_partner(&graph, Some(*chain.last().unwrap()));
            chain.push(child);
        }
        let leaf = *chain.last().unwrap();

        // Nearest-first: the leaf itself is distance 1.
        let result = graph.ancestor_chain(leaf, 5).unwrap();
        assert_eq!(result.len(), 5);
        assert_eq!(result[0], leaf);
        assert_eq!(result[1], chain[chain.len() - 2]);

        // EDGE CASE: requested depth above the hard cap is clamped.
        let result = graph.ancestor_chain(leaf, 50).unwrap();
        assert_eq!(result.len(), MAX_ANCESTOR_DEPTH);
    }

    #[test]
    fn test_set_parent_rejects_cycle() {
        let graph = ReferralGraph::new();
        let top = active_partner(&graph, None);
        let mid = active_partner(&graph, Some(top));
        let leaf = active_partner(&graph, Some(mid));

        // top under its own grandchild
        let err = graph.set_parent(top, leaf, "admin").unwrap_err();
        assert_eq!(err, IbError::CycleDetected { ib: top });

        // EDGE CASE: self-parenting is the shortest cycle.
        let err = graph.set_parent(top, top, "admin").unwrap_err();
        assert_eq!(err, IbError::CycleDetected { ib: top });

        // Graph untouched by the rejected writes.
        assert_eq!(graph.partner(top).unwrap().parent_ib, None);
    }

    #[test]
    fn test_reparent_recomputes_both_counts_and_audits() {
        let graph = ReferralGraph::new();
        let old_ib = active_partner(&graph, None);
        let new_ib = active_partner(&graph, None);
        let user = graph.register_user(ReferredUser::new(Uuid::new_v4())).unwrap();
        graph.attach(user, old_ib).unwrap();

        assert!(graph.reparent(user, new_ib, "admin@desk").unwrap());
        assert_eq!(graph.partner(old_ib).unwrap().referral_count, 0);
        assert_eq!(graph.partner(new_ib).unwrap().referral_count, 1);

        let audit = graph.audit_trail();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].previous_ib, Some(old_ib));
        assert_eq!(audit[0].new_ib, new_ib);
        assert_eq!(audit[0].actor, "admin@desk");

        // No-op when already at the target; no audit row.
        assert!(!graph.reparent(user, new_ib, "admin@desk").unwrap());
        assert_eq!(graph.audit_trail().len(), 1);
    }

    #[test]
    fn test_cas_partner_version_mismatch_conflicts() {
        let graph = ReferralGraph::new();
        let ib = active_partner(&graph, None);
        let snapshot = graph.partner(ib).unwrap();

        let updated = graph
            .cas_partner(ib, snapshot.version, |p| {
                p.status_reason = Some("first".into())
            })
            .unwrap();
        assert_eq!(updated.version, snapshot.version + 1);

        // Second writer still holding the stale version loses.
        let err = graph
            .cas_partner(ib, snapshot.version, |p| {
                p.status_reason = Some("second".into())
            })
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            graph.partner(ib).unwrap().status_reason.as_deref(),
            Some("first")
        );
    }

    #[test]
    fn test_rejected_children_do_not_count_as_referrals() {
        let graph = ReferralGraph::new();
        let parent = active_partner(&graph, None);
        let child = graph
            .register_partner(IbPartner::new(Uuid::new_v4(), Some(parent)))
            .unwrap();
        // A pending application still counts; it may activate.
        assert_eq!(graph.partner(parent).unwrap().referral_count, 1);

        let v = graph.partner(child).unwrap().version;
        graph
            .cas_partner(child, v, |p| p.status = IbStatus::Rejected)
            .unwrap();
        assert_eq!(graph.partner(parent).unwrap().referral_count, 0);
    }

    #[test]
    fn test_cas_partner_maintains_code_index() {
        let graph = ReferralGraph::new();
        let ib = active_partner(&graph, None);
        let v = graph.partner(ib).unwrap().version;
        graph
            .cas_partner(ib, v, |p| p.referral_code = Some("IBAAAA11".into()))
            .unwrap();
        assert_eq!(graph.partner_by_code("IBAAAA11").unwrap().id, ib);

        // A second partner cannot claim the same code.
        let other = active_partner(&graph, None);
        let v = graph.partner(other).unwrap().version;
        let err = graph
            .cas_partner(other, v, |p| p.referral_code = Some("IBAAAA11".into()))
            .unwrap_err();
        assert!(matches!(err, IbError::Validation(_)));
    }
}
