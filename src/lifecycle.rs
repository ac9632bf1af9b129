//! Partner lifecycle: the PENDING/ACTIVE/BLOCKED/SUSPENDED/REJECTED state
//! machine.
//!
//! Transitions are linearizable per partner: each one rereads the record,
//! validates against the transition table, then commits through the graph's
//! version CAS, so two concurrent admin actions can never both land on the
//! same state. Leaving ACTIVE freezes accrual for that partner only; its
//! ancestors keep earning.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use rand::Rng;
use uuid::Uuid;

use crate::error::{IbError, IbResult};
use crate::graph::ReferralGraph;
use crate::ladder::LevelLadder;
use crate::model::{IbPartner, IbStatus};
use crate::notify::{IbEvent, Notifier};
use crate::plans::PlanRegistry;
use crate::settings::SettingsStore;

/// Identity collaborator consulted by `approve()` when KYC is required.
pub trait KycProvider: Send + Sync {
    fn is_verified(&self, user_id: Uuid) -> bool;
}

/// Fixed-answer KYC provider for tests and deployments without an identity
/// collaborator wired in.
#[derive(Debug, Default)]
pub struct StaticKyc {
    verified: RwLock<HashSet<Uuid>>,
    default_verdict: bool,
}

impl StaticKyc {
    pub fn allow_all() -> Self {
        Self {
            verified: RwLock::new(HashSet::new()),
            default_verdict: true,
        }
    }

    pub fn deny_all() -> Self {
        Self::default()
    }

    pub fn mark_verified(&self, user_id: Uuid) {
        self.verified
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id);
    }
}

impl KycProvider for StaticKyc {
    fn is_verified(&self, user_id: Uuid) -> bool {
        self.default_verdict
            || self
                .verified
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&user_id)
    }
}

// No ambiguous characters; codes get read over the phone.
static CODE_ALPHABET: Lazy<Vec<char>> =
    Lazy::new(|| "ABCDEFGHJKLMNPQRSTUVWXYZ23456789".chars().collect());

const CODE_LEN: usize = 8;
const CODE_ATTEMPTS: usize = 16;

/// Lifecycle service over the shared graph, registries, and settings.
pub struct IbLifecycle {
    graph: Arc<ReferralGraph>,
    plans: Arc<PlanRegistry>,
    ladder: Arc<LevelLadder>,
    settings: Arc<SettingsStore>,
    kyc: Arc<dyn KycProvider>,
    notifier: Notifier,
}

impl IbLifecycle {
    pub fn new(
        graph: Arc<ReferralGraph>,
        plans: Arc<PlanRegistry>,
        ladder: Arc<LevelLadder>,
        settings: Arc<SettingsStore>,
        kyc: Arc<dyn KycProvider>,
        notifier: Notifier,
    ) -> Self {
        Self {
            graph,
            plans,
            ladder,
            settings,
            kyc,
            notifier,
        }
    }

    /// The transition table. Everything not listed fails `InvalidTransition`.
    fn allowed(from: IbStatus, to: IbStatus) -> bool {
        matches!(
            (from, to),
            (IbStatus::Pending, IbStatus::Active)
                | (IbStatus::Pending, IbStatus::Rejected)
                | (IbStatus::Active, IbStatus::Blocked)
                | (IbStatus::Active, IbStatus::Suspended)
                | (IbStatus::Blocked, IbStatus::Active)
                | (IbStatus::Suspended, IbStatus::Active)
        )
    }

    // ------------------------------------------------------------------
    // Application intake
    // ------------------------------------------------------------------

    /// File a new IB application, optionally attributed to a referring IB by
    /// code. Created PENDING; auto-approval, when enabled, runs the approve
    /// path immediately (a failing KYC gate leaves the application pending).
    pub fn apply(&self, user_id: Uuid, referral_code: Option<&str>) -> IbResult<IbPartner> {
        let settings = self.settings.snapshot();
        if !settings.allow_new_applications {
            return Err(IbError::Validation(
                "new IB applications are currently closed".to_string(),
            ));
        }
        let parent = match referral_code {
            Some(code) => {
                let referrer = self.graph.partner_by_code(code).ok_or_else(|| {
                    IbError::Validation(format!("unknown referral code {code}"))
                })?;
                if referrer.status != IbStatus::Active {
                    return Err(IbError::Validation(format!(
                        "referral code {code} does not belong to an active IB"
                    )));
                }
                Some(referrer.id)
            }
            None => None,
        };

        let id = self.graph.register_partner(IbPartner::new(user_id, parent))?;
        log::info!("IB application {id} received for user {user_id}");

        if settings.auto_approve {
            match self.approve(id, None) {
                Ok(active) => return Ok(active),
                Err(e) => {
                    log::warn!("auto-approve of application {id} failed, left pending: {e}");
                }
            }
        }
        self.graph.partner(id)
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// PENDING -> ACTIVE. Binds `plan_id` (default plan when omitted),
    /// computes the ladder level, and issues a referral code on first
    /// activation. Consults the KYC collaborator when settings require it.
    pub fn approve(&self, id: Uuid, plan_id: Option<Uuid>) -> IbResult<IbPartner> {
        let snapshot = self.graph.partner(id)?;
        // approve() is the Pending entry point; Blocked/Suspended return to
        // Active through unblock()/resume().
        if snapshot.status != IbStatus::Pending {
            return Err(IbError::InvalidTransition {
                from: snapshot.status,
                to: IbStatus::Active,
            });
        }

        let settings = self.settings.snapshot();
        if settings.kyc_required && !self.kyc.is_verified(snapshot.user_id) {
            return Err(IbError::KycRequired {
                user: snapshot.user_id,
            });
        }

        let plan = match plan_id {
            Some(pid) => self.plans.get(pid)?,
            None => self.plans.default_plan(),
        };
        let level = self.ladder.resolve(snapshot.referral_count);
        let code = match snapshot.referral_code.clone() {
            Some(code) => code,
            None => self.issue_code()?,
        };

        let level_id = level.map(|l| l.id);
        let updated = self.graph.cas_partner(id, snapshot.version, |p| {
            p.status = IbStatus::Active;
            p.status_reason = None;
            p.plan_id = Some(plan.id);
            p.level_id = level_id;
            if p.referral_code.is_none() {
                p.referral_code = Some(code.clone());
            }
        })?;
        log::info!("approved IB {id} on plan {}", plan.id);
        self.notifier.emit(IbEvent::LifecycleChanged {
            partner: id,
            from: snapshot.status,
            to: IbStatus::Active,
        });
        Ok(updated)
    }

    /// PENDING -> REJECTED. Terminal.
    pub fn reject(&self, id: Uuid, reason: &str) -> IbResult<IbPartner> {
        self.transition(id, IbStatus::Rejected, Some(reason))
    }

    /// ACTIVE -> BLOCKED.
    pub fn block(&self, id: Uuid, reason: &str) -> IbResult<IbPartner> {
        self.transition(id, IbStatus::Blocked, Some(reason))
    }

    /// ACTIVE -> SUSPENDED.
    pub fn suspend(&self, id: Uuid, reason: &str) -> IbResult<IbPartner> {
        self.transition(id, IbStatus::Suspended, Some(reason))
    }

    /// BLOCKED -> ACTIVE.
    pub fn unblock(&self, id: Uuid) -> IbResult<IbPartner> {
        let snapshot = self.graph.partner(id)?;
        if snapshot.status != IbStatus::Blocked {
            return Err(IbError::InvalidTransition {
                from: snapshot.status,
                to: IbStatus::Active,
            });
        }
        self.transition(id, IbStatus::Active, None)
    }

    /// SUSPENDED -> ACTIVE.
    pub fn resume(&self, id: Uuid) -> IbResult<IbPartner> {
        let snapshot = self.graph.partner(id)?;
        if snapshot.status != IbStatus::Suspended {
            return Err(IbError::InvalidTransition {
                from: snapshot.status,
                to: IbStatus::Active,
            });
        }
        self.transition(id, IbStatus::Active, None)
    }

    fn transition(&self, id: Uuid, to: IbStatus, reason: Option<&str>) -> IbResult<IbPartner> {
        let snapshot = self.graph.partner(id)?;
        Self::check(&snapshot, to)?;
        let updated = self.graph.cas_partner(id, snapshot.version, |p| {
            p.status = to;
            p.status_reason = reason.map(str::to_string);
        })?;
        log::info!("IB {id}: {} -> {to}", snapshot.status);
        self.notifier.emit(IbEvent::LifecycleChanged {
            partner: id,
            from: snapshot.status,
            to,
        });
        Ok(updated)
    }

    fn check(current: &IbPartner, to: IbStatus) -> IbResult<()> {
        if Self::allowed(current.status, to) {
            Ok(())
        } else {
            Err(IbError::InvalidTransition {
                from: current.status,
                to,
            })
        }
    }

    // ------------------------------------------------------------------
    // Level recompute (admin-triggered; levels are sticky otherwise)
    // ------------------------------------------------------------------

    /// Re-resolve a partner's ladder level from its current referral count.
    /// Promotions always apply and emit a notification; demotions apply only
    /// with `allow_demotion` (sticky policy).
    pub fn recompute_level(&self, id: Uuid, allow_demotion: bool) -> IbResult<IbPartner> {
        let snapshot = self.graph.partner(id)?;
        let resolved = self.ladder.resolve(snapshot.referral_count);
        let current_order = snapshot
            .level_id
            .and_then(|lid| self.ladder.get(lid).ok())
            .map(|l| l.order);

        let demotion = match (&resolved, current_order) {
            (Some(l), Some(cur)) => l.order < cur,
            (None, Some(_)) => true,
            _ => false,
        };
        if demotion && !allow_demotion {
            log::debug!("sticky level kept for IB {id} despite lower count");
            return Ok(snapshot);
        }

        let promotion = match (&resolved, current_order) {
            (Some(l), Some(cur)) => l.order > cur,
            (Some(_), None) => true,
            _ => false,
        };
        let level_id = resolved.as_ref().map(|l| l.id);
        if level_id == snapshot.level_id {
            return Ok(snapshot);
        }
        let updated = self
            .graph
            .cas_partner(id, snapshot.version, |p| p.level_id = level_id)?;
        if promotion {
            if let Some(level) = resolved {
                log::info!("IB {id} promoted to level {} ({})", level.order, level.name);
                self.notifier.emit(IbEvent::LevelPromoted {
                    partner: id,
                    level: level.id,
                });
            }
        }
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Referral codes
    // ------------------------------------------------------------------

    fn issue_code(&self) -> IbResult<String> {
        let mut rng = rand::thread_rng();
        for _ in 0..CODE_ATTEMPTS {
            let body: String = (0..CODE_LEN)
                .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())])
                .collect();
            let code = format!("IB{body}");
            if !self.graph.code_in_use(&code) {
                return Ok(code);
            }
        }
        Err(IbError::Validation(
            "could not allocate a unique referral code".to_string(),
        ))
    }
}
