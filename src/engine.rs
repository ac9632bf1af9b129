//! The commission engine.
//!
//! Consumes trade-close events and posts one immutable ledger entry to every
//! eligible ancestor of the originating user, up to five levels deep. Each
//! beneficiary's own ladder level overrides its bound plan's rate at a given
//! distance; a non-active ancestor is skipped without interrupting the walk,
//! so a blocked intermediary never starves the partners above it.
//!
//! Events for distinct originating users are independent and may be
//! processed concurrently; idempotence rests on the ledger's
//! `(event_id, beneficiary)` uniqueness, not on any engine-level lock.

use std::sync::Arc;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::IbResult;
use crate::graph::{ReferralGraph, MAX_ANCESTOR_DEPTH};
use crate::ladder::LevelLadder;
use crate::ledger::CommissionLedger;
use crate::model::{
    CommissionPlan, CommissionType, IbStatus, LedgerEntry, TradeEvent, MAX_COMMISSION_LEVELS,
};
use crate::plans::PlanRegistry;
use crate::settings::SettingsStore;

pub struct CommissionEngine {
    graph: Arc<ReferralGraph>,
    plans: Arc<PlanRegistry>,
    ladder: Arc<LevelLadder>,
    ledger: Arc<CommissionLedger>,
    settings: Arc<SettingsStore>,
}

impl CommissionEngine {
    pub fn new(
        graph: Arc<ReferralGraph>,
        plans: Arc<PlanRegistry>,
        ladder: Arc<LevelLadder>,
        ledger: Arc<CommissionLedger>,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            graph,
            plans,
            ladder,
            ledger,
            settings,
        }
    }

    /// Process one trade event. Returns the entries posted by this
    /// invocation; an already-processed event posts nothing and still
    /// succeeds. With the programme kill-switch off, this is a silent no-op.
    pub fn process(&self, event: &TradeEvent) -> IbResult<Vec<LedgerEntry>> {
        let settings = self.settings.snapshot();
        if !settings.is_enabled {
            log::debug!("IB programme disabled, skipping event {}", event.event_id);
            return Ok(Vec::new());
        }

        let direct_ib = match self.graph.attribution_of(event.originating_user_id) {
            Some(ib) => ib,
            // Unattributed trader: nobody earns.
            None => return Ok(Vec::new()),
        };

        let chain = self.graph.ancestor_chain(direct_ib, MAX_ANCESTOR_DEPTH)?;
        let mut posted = Vec::new();
        for (idx, beneficiary) in chain.iter().enumerate() {
            let distance = (idx + 1) as u8;
            let partner = self.graph.partner(*beneficiary)?;
            if partner.status != IbStatus::Active {
                log::debug!(
                    "skipping {} ancestor {beneficiary} at distance {distance} for event {}",
                    partner.status,
                    event.event_id
                );
                continue;
            }

            let plan = self.plan_for(&partner.plan_id);
            let Some((rate, commission_type)) = self.rate_for(&partner.level_id, &plan, distance)
            else {
                continue;
            };
            let amount = Self::amount(commission_type, rate, event);
            if let Some(entry) = self
                .ledger
                .post(event.event_id, *beneficiary, distance, amount)
            {
                log::info!(
                    "posted {amount} to IB {beneficiary} at distance {distance} for event {}",
                    event.event_id
                );
                posted.push(entry);
            }
        }
        Ok(posted)
    }

    fn plan_for(&self, plan_id: &Option<Uuid>) -> CommissionPlan {
        plan_id
            .and_then(|pid| self.plans.get(pid).ok())
            .unwrap_or_else(|| self.plans.default_plan())
    }

    /// Applicable rate at `distance` for a beneficiary: its level's downline
    /// override when defined, falling back to the bound plan's schedule.
    /// The plan's `max_levels` bounds the reach either way — an override can
    /// change the rate inside that reach, never extend it.
    fn rate_for(
        &self,
        level_id: &Option<Uuid>,
        plan: &CommissionPlan,
        distance: u8,
    ) -> Option<(Decimal, CommissionType)> {
        if distance == 0 || distance > plan.max_levels.min(MAX_COMMISSION_LEVELS as u8) {
            return None;
        }
        if let Some(level) = level_id.and_then(|lid| self.ladder.get(lid).ok()) {
            if level.is_active {
                if let Some(rate) = level.downline_rate_at(distance) {
                    return Some((rate, level.commission_type));
                }
            }
        }
        plan.rate_at(distance).map(|rate| (rate, plan.commission_type))
    }

    fn amount(commission_type: CommissionType, rate: Decimal, event: &TradeEvent) -> Decimal {
        match commission_type {
            CommissionType::PerLot => event.lots * rate,
            CommissionType::Percentage => event.notional_amount * rate / Decimal::from(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::{IbLifecycle, StaticKyc};
    use crate::model::{IbLevel, ReferredUser, MAX_COMMISSION_LEVELS};
    use crate::notify::Notifier;
    use crate::settings::IbSettings;

    struct Fixture {
        graph: Arc<ReferralGraph>,
        plans: Arc<PlanRegistry>,
        ladder: Arc<LevelLadder>,
        ledger: Arc<CommissionLedger>,
        settings: Arc<SettingsStore>,
        lifecycle: IbLifecycle,
        engine: CommissionEngine,
    }

    fn rates(list: &[(u8, i64)]) -> [Option<Decimal>; MAX_COMMISSION_LEVELS] {
        let mut out = [None; MAX_COMMISSION_LEVELS];
        for (level, rate) in list {
            out[(*level - 1) as usize] = Some(Decimal::from(*rate));
        }
        out
    }

    fn fixture(plan: CommissionPlan) -> Fixture {
        let graph = Arc::new(ReferralGraph::new());
        let plans = Arc::new(PlanRegistry::bootstrap(plan).unwrap());
        let ladder = Arc::new(LevelLadder::new());
        let ledger = Arc::new(CommissionLedger::new());
        let settings = Arc::new(SettingsStore::new(IbSettings::default()));
        let lifecycle = IbLifecycle::new(
            graph.clone(),
            plans.clone(),
            ladder.clone(),
            settings.clone(),
            Arc::new(StaticKyc::allow_all()),
            Notifier::disabled(),
        );
        let engine = CommissionEngine::new(
            graph.clone(),
            plans.clone(),
            ladder.clone(),
            ledger.clone(),
            settings.clone(),
        );
        Fixture {
            graph,
            plans,
            ladder,
            ledger,
            settings,
            lifecycle,
            engine,
        }
    }

    fn per_lot_plan() -> CommissionPlan {
        CommissionPlan::new(
            "Standard",
            CommissionType::PerLot,
            rates(&[(1, 5), (2, 3), (3, 2)]),
            3,
        )
    }

    /// Chain IB1 <- IB2 <- IB3 <- user; returns (ib1, ib2, ib3, trader id).
    fn chain(fx: &Fixture) -> (Uuid, Uuid, Uuid, Uuid) {
        let ib1 = fx.lifecycle.apply(Uuid::new_v4(), None).unwrap();
        let ib1 = fx.lifecycle.approve(ib1.id, None).unwrap();
        let ib2 = fx
            .lifecycle
            .apply(Uuid::new_v4(), ib1.referral_code.as_deref())
            .unwrap();
        let ib2 = fx.lifecycle.approve(ib2.id, None).unwrap();
        let ib3 = fx
            .lifecycle
            .apply(Uuid::new_v4(), ib2.referral_code.as_deref())
            .unwrap();
        let ib3 = fx.lifecycle.approve(ib3.id, None).unwrap();

        let trader = Uuid::new_v4();
        let record = fx.graph.register_user(ReferredUser::new(trader)).unwrap();
        fx.graph.attach(record, ib3.id).unwrap();
        (ib1.id, ib2.id, ib3.id, trader)
    }

    fn trade(trader: Uuid, lots: i64, notional: i64) -> TradeEvent {
        TradeEvent {
            originating_user_id: trader,
            lots: Decimal::from(lots),
            notional_amount: Decimal::from(notional),
            event_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_three_level_per_lot_distribution() {
        let fx = fixture(per_lot_plan());
        let (ib1, ib2, ib3, trader) = chain(&fx);

        let posted = fx.engine.process(&trade(trader, 10, 100_000)).unwrap();
        assert_eq!(posted.len(), 3);
        assert_eq!(fx.ledger.volume_for(ib3), Decimal::from(50)); // L1: 10 * 5
        assert_eq!(fx.ledger.volume_for(ib2), Decimal::from(30)); // L2: 10 * 3
        assert_eq!(fx.ledger.volume_for(ib1), Decimal::from(20)); // L3: 10 * 2
        assert_eq!(fx.ledger.entry_count(), 3);
    }

    #[test]
    fn test_max_levels_caps_the_walk() {
        let fx = fixture(per_lot_plan());
        // Four IBs above the trader; the plan stops at distance 3.
        let (ib1, _, ib3, _) = chain(&fx);
        let ib4 = fx
            .lifecycle
            .apply(
                Uuid::new_v4(),
                fx.graph.partner(ib3).unwrap().referral_code.as_deref(),
            )
            .unwrap();
        let ib4 = fx.lifecycle.approve(ib4.id, None).unwrap();
        let trader = Uuid::new_v4();
        let record = fx.graph.register_user(ReferredUser::new(trader)).unwrap();
        fx.graph.attach(record, ib4.id).unwrap();

        fx.engine.process(&trade(trader, 10, 0)).unwrap();
        // ib1 sits at distance 4 from this trader: beyond max_levels.
        assert_eq!(fx.ledger.volume_for(ib1), Decimal::ZERO);
        assert_eq!(fx.ledger.entry_count(), 3);
    }

    #[test]
    fn test_blocked_intermediary_is_skipped_not_blocking() {
        let fx = fixture(per_lot_plan());
        let (ib1, ib2, ib3, trader) = chain(&fx);
        fx.lifecycle.block(ib2, "fraud review").unwrap();

        let posted = fx.engine.process(&trade(trader, 10, 0)).unwrap();
        assert_eq!(posted.len(), 2);
        assert_eq!(fx.ledger.volume_for(ib3), Decimal::from(50));
        assert_eq!(fx.ledger.volume_for(ib2), Decimal::ZERO);
        // The walk continued past the blocked node.
        assert_eq!(fx.ledger.volume_for(ib1), Decimal::from(20));
    }

    #[test]
    fn test_reprocessing_same_event_is_idempotent() {
        let fx = fixture(per_lot_plan());
        let (_, _, _, trader) = chain(&fx);
        let event = trade(trader, 10, 0);

        fx.engine.process(&event).unwrap();
        let entries_once = fx.ledger.entries();
        let second = fx.engine.process(&event).unwrap();

        assert!(second.is_empty());
        let entries_twice = fx.ledger.entries();
        assert_eq!(entries_once.len(), entries_twice.len());
        assert_eq!(fx.ledger.total_volume(), Decimal::from(100));
    }

    #[test]
    fn test_kill_switch_silently_skips() {
        let fx = fixture(per_lot_plan());
        let (_, _, _, trader) = chain(&fx);

        let mut disabled = IbSettings::default();
        disabled.is_enabled = false;
        fx.settings.update("ops", disabled);

        let posted = fx.engine.process(&trade(trader, 10, 0)).unwrap();
        assert!(posted.is_empty());
        assert_eq!(fx.ledger.entry_count(), 0);
    }

    #[test]
    fn test_unattributed_trader_is_a_no_op() {
        let fx = fixture(per_lot_plan());
        let posted = fx.engine.process(&trade(Uuid::new_v4(), 10, 0)).unwrap();
        assert!(posted.is_empty());
    }

    #[test]
    fn test_percentage_plan_uses_notional() {
        let plan = CommissionPlan::new(
            "Revenue Share",
            CommissionType::Percentage,
            rates(&[(1, 1)]),
            1,
        );
        let fx = fixture(plan);
        let (_, _, ib3, trader) = chain(&fx);

        fx.engine.process(&trade(trader, 10, 250_000)).unwrap();
        // 1% of 250_000, only at distance 1.
        assert_eq!(fx.ledger.volume_for(ib3), Decimal::from(2_500));
        assert_eq!(fx.ledger.entry_count(), 1);
    }

    #[test]
    fn test_level_override_beats_plan_rate() {
        let fx = fixture(per_lot_plan());
        let (_, _, ib3, trader) = chain(&fx);

        // A level that pays 8 per lot at distance 1 instead of the plan's 5.
        let level = IbLevel {
            id: Uuid::new_v4(),
            name: "Gold".into(),
            order: 1,
            referral_target: 0,
            commission_rate: Decimal::from(8),
            commission_type: CommissionType::PerLot,
            downline_rates: rates(&[(1, 8)]),
            is_active: true,
        };
        let level_id = fx.ladder.create(level, false).unwrap();
        let v = fx.graph.partner(ib3).unwrap().version;
        fx.graph
            .cas_partner(ib3, v, |p| p.level_id = Some(level_id))
            .unwrap();

        fx.engine.process(&trade(trader, 10, 0)).unwrap();
        assert_eq!(fx.ledger.volume_for(ib3), Decimal::from(80));

        // EDGE CASE: distances without an override fall back to the plan —
        // ib2 still earns the plan's distance-2 rate.
        assert_eq!(fx.ledger.total_volume(), Decimal::from(80 + 30 + 20));
    }

    #[test]
    fn test_level_override_cannot_extend_plan_reach() {
        let fx = fixture(per_lot_plan()); // max_levels = 3
        let (ib1, _, ib3, _) = chain(&fx);
        let ib4 = fx
            .lifecycle
            .apply(
                Uuid::new_v4(),
                fx.graph.partner(ib3).unwrap().referral_code.as_deref(),
            )
            .unwrap();
        let ib4 = fx.lifecycle.approve(ib4.id, None).unwrap();
        let trader = Uuid::new_v4();
        let record = fx.graph.register_user(ReferredUser::new(trader)).unwrap();
        fx.graph.attach(record, ib4.id).unwrap();

        // ib1 sits at distance 4 from this trader and carries a level with a
        // distance-4 override; the plan still stops at 3.
        let level = IbLevel {
            id: Uuid::new_v4(),
            name: "Platinum".into(),
            order: 1,
            referral_target: 0,
            commission_rate: Decimal::from(9),
            commission_type: CommissionType::PerLot,
            downline_rates: rates(&[(4, 9)]),
            is_active: true,
        };
        let level_id = fx.ladder.create(level, false).unwrap();
        let v = fx.graph.partner(ib1).unwrap().version;
        fx.graph
            .cas_partner(ib1, v, |p| p.level_id = Some(level_id))
            .unwrap();

        fx.engine.process(&trade(trader, 10, 0)).unwrap();
        // EDGE CASE: the override slot exists, but distance 4 is past the
        // bound plan's reach, so nothing posts to ib1.
        assert_eq!(fx.ledger.volume_for(ib1), Decimal::ZERO);
        assert_eq!(fx.ledger.entry_count(), 3);
    }

    #[test]
    fn test_unbound_plan_falls_back_to_default() {
        let fx = fixture(per_lot_plan());
        let (_, _, ib3, trader) = chain(&fx);
        // Strip the bound plan; the default plan still governs the payout.
        let v = fx.graph.partner(ib3).unwrap().version;
        fx.graph.cas_partner(ib3, v, |p| p.plan_id = None).unwrap();

        fx.engine.process(&trade(trader, 10, 0)).unwrap();
        assert_eq!(fx.ledger.volume_for(ib3), Decimal::from(50));
        assert_eq!(fx.plans.default_plan().name, "Standard");
    }
}
