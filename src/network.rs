//! The assembled partner network.
//!
//! [`IbNetwork`] wires the referral graph, plan and level registries, the
//! ledger, settings, and the notification/KYC collaborators into one
//! constructor-injected object, and carries the admin-facing aggregate
//! queries plus the cross-registry guard rails (plan deletion).

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::engine::CommissionEngine;
use crate::error::{IbError, IbResult};
use crate::graph::ReferralGraph;
use crate::ladder::LevelLadder;
use crate::ledger::CommissionLedger;
use crate::lifecycle::{IbLifecycle, KycProvider};
use crate::model::{CommissionPlan, IbStatus};
use crate::notify::Notifier;
use crate::plans::PlanRegistry;
use crate::settings::{IbSettings, SettingsStore};
use crate::transfer::ReferralTransferService;

pub struct IbNetwork {
    graph: Arc<ReferralGraph>,
    plans: Arc<PlanRegistry>,
    ladder: Arc<LevelLadder>,
    ledger: Arc<CommissionLedger>,
    settings: Arc<SettingsStore>,
    lifecycle: IbLifecycle,
    engine: CommissionEngine,
    transfers: ReferralTransferService,
}

impl IbNetwork {
    /// Assemble the network from its initial settings, the bootstrap default
    /// plan, and the external collaborators.
    pub fn new(
        settings: IbSettings,
        default_plan: CommissionPlan,
        kyc: Arc<dyn KycProvider>,
        notifier: Notifier,
    ) -> IbResult<Self> {
        let graph = Arc::new(ReferralGraph::new());
        let plans = Arc::new(PlanRegistry::bootstrap(default_plan)?);
        let ladder = Arc::new(LevelLadder::new());
        let ledger = Arc::new(CommissionLedger::new());
        let settings = Arc::new(SettingsStore::new(settings));

        let lifecycle = IbLifecycle::new(
            graph.clone(),
            plans.clone(),
            ladder.clone(),
            settings.clone(),
            kyc,
            notifier,
        );
        let engine = CommissionEngine::new(
            graph.clone(),
            plans.clone(),
            ladder.clone(),
            ledger.clone(),
            settings.clone(),
        );
        let transfers = ReferralTransferService::new(graph.clone());

        Ok(Self {
            graph,
            plans,
            ladder,
            ledger,
            settings,
            lifecycle,
            engine,
            transfers,
        })
    }

    // ------------------------------------------------------------------
    // Component access
    // ------------------------------------------------------------------

    pub fn graph(&self) -> &ReferralGraph {
        &self.graph
    }

    pub fn plans(&self) -> &PlanRegistry {
        &self.plans
    }

    pub fn levels(&self) -> &LevelLadder {
        &self.ladder
    }

    pub fn ledger(&self) -> &CommissionLedger {
        &self.ledger
    }

    pub fn lifecycle(&self) -> &IbLifecycle {
        &self.lifecycle
    }

    pub fn engine(&self) -> &CommissionEngine {
        &self.engine
    }

    pub fn transfers(&self) -> &ReferralTransferService {
        &self.transfers
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    pub fn settings(&self) -> Arc<IbSettings> {
        self.settings.snapshot()
    }

    /// Audited admin settings update; running operations keep their snapshot.
    pub fn update_settings(&self, actor: &str, settings: IbSettings) {
        self.settings.update(actor, settings);
    }

    // ------------------------------------------------------------------
    // Cross-registry guard rails
    // ------------------------------------------------------------------

    /// Delete a plan, refusing while any partner is still bound to it.
    /// Rebind those partners first.
    pub fn delete_plan(&self, id: Uuid) -> IbResult<CommissionPlan> {
        if self.graph.plan_in_use(id) {
            return Err(IbError::Validation(format!(
                "plan {id} is still bound to partners; rebind them before deleting"
            )));
        }
        self.plans.delete(id)
    }

    // ------------------------------------------------------------------
    // Aggregate queries
    // ------------------------------------------------------------------

    /// Partner counts keyed by lifecycle status.
    pub fn status_counts(&self) -> HashMap<IbStatus, usize> {
        self.graph.status_counts()
    }

    /// Total commission volume ever posted.
    pub fn ledger_volume(&self) -> Decimal {
        self.ledger.total_volume()
    }
}
