//! Core entities of the IB partner network.
//!
//! Everything here is commission-relevant identity and state only;
//! presentation metadata (level colors, icons, display ordering) is the
//! admin layer's concern and never enters the core model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Hard ceiling on commission depth; plans and levels carry one rate slot per
/// distance up to this bound.
pub const MAX_COMMISSION_LEVELS: usize = 5;

/// Lifecycle status of an IB partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IbStatus {
    /// Application received, not yet reviewed.
    Pending,
    /// Accruing commission; eligible referral target.
    Active,
    /// Parked by an admin; accrual frozen until unblocked.
    Blocked,
    /// Parked by an admin; accrual frozen until resumed.
    Suspended,
    /// Application refused. Terminal.
    Rejected,
}

impl fmt::Display for IbStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IbStatus::Pending => "PENDING",
            IbStatus::Active => "ACTIVE",
            IbStatus::Blocked => "BLOCKED",
            IbStatus::Suspended => "SUSPENDED",
            IbStatus::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}

/// How a commission rate is applied to a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommissionType {
    /// Amount = lots * rate.
    PerLot,
    /// Amount = notional * rate / 100.
    Percentage,
}

/// An Introducing Broker: root or internal node of the referral forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IbPartner {
    pub id: Uuid,
    /// Trading-platform user behind this partner.
    pub user_id: Uuid,
    /// Unique attribution token, issued on first activation.
    pub referral_code: Option<String>,
    /// Referring IB, when this partner was itself referred. Weak reference:
    /// lookup only, never ownership.
    pub parent_ib: Option<Uuid>,
    pub status: IbStatus,
    /// Ladder level, bound at approval and on explicit recompute.
    pub level_id: Option<Uuid>,
    /// Commission plan, bound at approval.
    pub plan_id: Option<Uuid>,
    /// Direct referrals (users and IBs) currently attributed to this partner.
    pub referral_count: u32,
    /// Reason recorded by the last reject/block/suspend.
    pub status_reason: Option<String>,
    pub applied_at: DateTime<Utc>,
    /// Optimistic-concurrency version, bumped on every committed write.
    pub version: u64,
}

impl IbPartner {
    /// A fresh application in the Pending state.
    pub fn new(user_id: Uuid, parent_ib: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            referral_code: None,
            parent_ib,
            status: IbStatus::Pending,
            level_id: None,
            plan_id: None,
            referral_count: 0,
            status_reason: None,
            applied_at: Utc::now(),
            version: 0,
        }
    }
}

/// A referred trading client: leaf of the referral forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferredUser {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Referring IB. Set once at attribution; changed only through an
    /// explicit, audited transfer.
    pub referred_by: Option<Uuid>,
    pub attributed_at: DateTime<Utc>,
    pub version: u64,
}

impl ReferredUser {
    /// An unattributed signup.
    pub fn new(user_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            referred_by: None,
            attributed_at: Utc::now(),
            version: 0,
        }
    }
}

/// A named commission schedule: one optional rate per downline distance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionPlan {
    pub id: Uuid,
    pub name: String,
    pub commission_type: CommissionType,
    /// Rate at distance L lives in `level_rates[L - 1]`.
    pub level_rates: [Option<Decimal>; MAX_COMMISSION_LEVELS],
    /// Deepest distance this plan pays, 1..=5.
    pub max_levels: u8,
    pub is_default: bool,
}

impl CommissionPlan {
    pub fn new(
        name: impl Into<String>,
        commission_type: CommissionType,
        level_rates: [Option<Decimal>; MAX_COMMISSION_LEVELS],
        max_levels: u8,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            commission_type,
            level_rates,
            max_levels,
            is_default: false,
        }
    }

    /// The plan's rate at downline distance `level` (1-based), if the plan
    /// both reaches and defines that distance.
    pub fn rate_at(&self, level: u8) -> Option<Decimal> {
        if level == 0 || level > self.max_levels.min(MAX_COMMISSION_LEVELS as u8) {
            return None;
        }
        self.level_rates[(level - 1) as usize]
    }
}

/// One rung of the IB ladder, resolved from a partner's referral count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IbLevel {
    pub id: Uuid,
    pub name: String,
    /// Ladder position; unique among active levels, ascending.
    pub order: u32,
    /// Referral count required to qualify; non-decreasing with `order`.
    pub referral_target: u32,
    /// Headline rate shown to the partner for its own referrals.
    pub commission_rate: Decimal,
    pub commission_type: CommissionType,
    /// Per-distance overrides; when set for distance L, the level's rate
    /// replaces the bound plan's rate at that distance.
    pub downline_rates: [Option<Decimal>; MAX_COMMISSION_LEVELS],
    pub is_active: bool,
}

impl IbLevel {
    /// The level's override rate at downline distance `level` (1-based).
    pub fn downline_rate_at(&self, level: u8) -> Option<Decimal> {
        if level == 0 || level > MAX_COMMISSION_LEVELS as u8 {
            return None;
        }
        self.downline_rates[(level - 1) as usize]
    }
}

/// One immutable commission posting. Corrections are new offsetting entries,
/// never edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    /// Originating trade event.
    pub event_id: Uuid,
    pub beneficiary: Uuid,
    /// Downline distance from the originating user, 1-based.
    pub level: u8,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

/// A trade-close event as delivered by the trading engine. Trusted as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub originating_user_id: Uuid,
    pub lots: Decimal,
    pub notional_amount: Decimal,
    pub event_id: Uuid,
}

/// Audit row appended by every attribution transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferAudit {
    /// The moved entity (referred user or IB partner).
    pub moved_id: Uuid,
    pub previous_ib: Option<Uuid>,
    pub new_ib: Uuid,
    pub at: DateTime<Utc>,
    pub actor: String,
}
