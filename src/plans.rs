//! Commission plan registry.
//!
//! Holds the named commission schedules and enforces the cardinal invariant:
//! exactly one default plan exists at all times. Setting a new default
//! atomically clears the previous one; the last default can never be deleted
//! or unset.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{IbError, IbResult};
use crate::model::{CommissionPlan, MAX_COMMISSION_LEVELS};

#[derive(Debug)]
pub struct PlanRegistry {
    inner: RwLock<HashMap<Uuid, CommissionPlan>>,
}

impl PlanRegistry {
    /// Bootstrap the registry with its default plan. The plan is forced
    /// default so the one-default invariant holds from the first instant.
    pub fn bootstrap(mut default_plan: CommissionPlan) -> IbResult<Self> {
        Self::validate(&default_plan)?;
        default_plan.is_default = true;
        let mut map = HashMap::new();
        map.insert(default_plan.id, default_plan);
        Ok(Self {
            inner: RwLock::new(map),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, CommissionPlan>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, CommissionPlan>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create(&self, plan: CommissionPlan) -> IbResult<Uuid> {
        Self::validate(&plan)?;
        let mut plans = self.write();
        if plans.contains_key(&plan.id) {
            return Err(IbError::Validation(format!(
                "plan {} already exists",
                plan.id
            )));
        }
        let id = plan.id;
        let take_default = plan.is_default;
        plans.insert(id, plan);
        if take_default {
            Self::set_sole_default(&mut plans, id);
        }
        log::info!("created commission plan {id}");
        Ok(id)
    }

    pub fn update(&self, plan: CommissionPlan) -> IbResult<()> {
        Self::validate(&plan)?;
        let mut plans = self.write();
        let existing = plans.get(&plan.id).ok_or(IbError::NotFound {
            entity: "commission plan",
            id: plan.id,
        })?;
        if existing.is_default && !plan.is_default {
            return Err(IbError::Validation(
                "cannot unset the default plan; set another plan as default instead".to_string(),
            ));
        }
        let id = plan.id;
        let take_default = plan.is_default;
        plans.insert(id, plan);
        if take_default {
            Self::set_sole_default(&mut plans, id);
        }
        Ok(())
    }

    /// Remove a plan. The default plan is not deletable; callers must also
    /// ensure no partner is still bound to it (see the facade).
    pub fn delete(&self, id: Uuid) -> IbResult<CommissionPlan> {
        let mut plans = self.write();
        let plan = plans.get(&id).ok_or(IbError::NotFound {
            entity: "commission plan",
            id,
        })?;
        if plan.is_default {
            return Err(IbError::Validation(
                "cannot delete the default plan".to_string(),
            ));
        }
        Ok(plans.remove(&id).expect("checked above"))
    }

    pub fn get(&self, id: Uuid) -> IbResult<CommissionPlan> {
        self.read().get(&id).cloned().ok_or(IbError::NotFound {
            entity: "commission plan",
            id,
        })
    }

    /// The current default plan. The bootstrap and write paths keep exactly
    /// one present at all times.
    pub fn default_plan(&self) -> CommissionPlan {
        self.read()
            .values()
            .find(|p| p.is_default)
            .cloned()
            .expect("registry invariant: exactly one default plan")
    }

    pub fn list(&self) -> Vec<CommissionPlan> {
        self.read().values().cloned().collect()
    }

    fn set_sole_default(plans: &mut HashMap<Uuid, CommissionPlan>, keep: Uuid) {
        for plan in plans.values_mut() {
            plan.is_default = plan.id == keep;
        }
    }

    fn validate(plan: &CommissionPlan) -> IbResult<()> {
        if plan.name.trim().is_empty() {
            return Err(IbError::Validation("plan name must not be empty".to_string()));
        }
        if plan.max_levels == 0 || plan.max_levels as usize > MAX_COMMISSION_LEVELS {
            return Err(IbError::Validation(format!(
                "max_levels must be between 1 and {MAX_COMMISSION_LEVELS}, got {}",
                plan.max_levels
            )));
        }
        for rate in plan.level_rates.iter().flatten() {
            if *rate < Decimal::ZERO {
                return Err(IbError::Validation(format!(
                    "commission rates must be non-negative, got {rate}"
                )));
            }
        }
        Ok(())
    }
}
