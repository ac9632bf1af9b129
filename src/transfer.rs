//! Bulk, cycle-safe re-parenting of referred users and IBs.
//!
//! Validation is per entry: one entry failing (say, a would-be cycle) never
//! blocks the independent entries in the same batch, and the outcome lists
//! each failure with its reason so the caller can retry just that subset.

use std::collections::HashSet;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{IbError, IbResult};
use crate::graph::ReferralGraph;
use crate::model::IbStatus;

/// One bulk transfer request. `user_ids` may name referred users or IB
/// partners; IBs are re-parented with full cycle checking.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub user_ids: Vec<Uuid>,
    pub target_ib: Uuid,
    pub actor: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub user_id: Uuid,
    pub reason: IbError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Entries whose attribution actually changed.
    pub transferred: u32,
    /// Entries already attributed to the target; no-ops.
    pub skipped: u32,
    pub failures: Vec<TransferFailure>,
}

pub struct ReferralTransferService {
    graph: Arc<ReferralGraph>,
}

impl ReferralTransferService {
    pub fn new(graph: Arc<ReferralGraph>) -> Self {
        Self { graph }
    }

    /// Execute the batch. Fails up front only when the target itself does
    /// not resolve to an ACTIVE partner; every other problem is a per-entry
    /// failure. Duplicated ids are processed once.
    pub fn transfer(&self, request: &TransferRequest) -> IbResult<TransferOutcome> {
        let target = self.graph.partner(request.target_ib)?;
        if target.status != IbStatus::Active {
            return Err(IbError::Validation(format!(
                "transfer target {} is not an active IB",
                request.target_ib
            )));
        }

        let mut outcome = TransferOutcome::default();
        let mut seen = HashSet::new();
        for id in &request.user_ids {
            if !seen.insert(*id) {
                continue;
            }
            match self.transfer_one(*id, request.target_ib, &request.actor) {
                Ok(true) => outcome.transferred += 1,
                Ok(false) => outcome.skipped += 1,
                Err(reason) => outcome.failures.push(TransferFailure {
                    user_id: *id,
                    reason,
                }),
            }
        }
        log::info!(
            "transfer batch to IB {}: {} moved, {} skipped, {} failed",
            request.target_ib,
            outcome.transferred,
            outcome.skipped,
            outcome.failures.len()
        );
        Ok(outcome)
    }

    /// Move one entry. A referred user is re-attributed; an IB is
    /// re-parented under the target with cycle checking. Both paths append
    /// an audit row and recompute the affected referral counts.
    fn transfer_one(&self, id: Uuid, target: Uuid, actor: &str) -> IbResult<bool> {
        if self.graph.user(id).is_ok() {
            return self.graph.reparent(id, target, actor);
        }
        if self.graph.partner(id).is_ok() {
            return self.graph.set_parent(id, target, actor);
        }
        Err(IbError::NotFound {
            entity: "transferable entity",
            id,
        })
    }
}
