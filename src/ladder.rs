//! The IB level ladder.
//!
//! Ordered commission tiers resolved from a partner's referral count. Writes
//! validate the ladder shape before touching state: `order` is unique among
//! active levels and `referral_target` never decreases as `order` rises,
//! unless an admin passes an explicit monotonicity override.
//!
//! Levels are sticky: resolution never demotes on its own. Demotion happens
//! only through the explicit recompute operation on the lifecycle service.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::{IbError, IbResult};
use crate::model::IbLevel;

#[derive(Debug, Default)]
pub struct LevelLadder {
    inner: RwLock<HashMap<Uuid, IbLevel>>,
}

impl LevelLadder {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, IbLevel>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, IbLevel>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a level. `override_monotonic` accepts a target that breaks the
    /// non-decreasing rule; the order-uniqueness check is never overridable.
    pub fn create(&self, level: IbLevel, override_monotonic: bool) -> IbResult<Uuid> {
        Self::validate(&level)?;
        let mut levels = self.write();
        if levels.contains_key(&level.id) {
            return Err(IbError::Validation(format!(
                "level {} already exists",
                level.id
            )));
        }
        Self::check_ladder_shape(&levels, &level, override_monotonic)?;
        let id = level.id;
        levels.insert(id, level);
        log::info!("created IB level {id}");
        Ok(id)
    }

    pub fn update(&self, level: IbLevel, override_monotonic: bool) -> IbResult<()> {
        Self::validate(&level)?;
        let mut levels = self.write();
        if !levels.contains_key(&level.id) {
            return Err(IbError::NotFound {
                entity: "IB level",
                id: level.id,
            });
        }
        Self::check_ladder_shape(&levels, &level, override_monotonic)?;
        levels.insert(level.id, level);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> IbResult<IbLevel> {
        self.read().get(&id).cloned().ok_or(IbError::NotFound {
            entity: "IB level",
            id,
        })
    }

    /// Active levels in ascending ladder order.
    pub fn active_levels(&self) -> Vec<IbLevel> {
        let mut levels: Vec<IbLevel> = self.read().values().filter(|l| l.is_active).cloned().collect();
        levels.sort_by_key(|l| l.order);
        levels
    }

    pub fn list(&self) -> Vec<IbLevel> {
        let mut levels: Vec<IbLevel> = self.read().values().cloned().collect();
        levels.sort_by_key(|l| l.order);
        levels
    }

    /// Resolve a referral count to the highest-order active level whose
    /// target the count meets. Deterministic for a fixed ladder snapshot;
    /// `None` when no level qualifies.
    pub fn resolve(&self, referral_count: u32) -> Option<IbLevel> {
        self.active_levels()
            .into_iter()
            .filter(|l| l.referral_target <= referral_count)
            .last()
    }

    fn validate(level: &IbLevel) -> IbResult<()> {
        if level.name.trim().is_empty() {
            return Err(IbError::Validation("level name must not be empty".to_string()));
        }
        if level.commission_rate < Decimal::ZERO {
            return Err(IbError::Validation(format!(
                "commission rate must be non-negative, got {}",
                level.commission_rate
            )));
        }
        for rate in level.downline_rates.iter().flatten() {
            if *rate < Decimal::ZERO {
                return Err(IbError::Validation(format!(
                    "downline rates must be non-negative, got {rate}"
                )));
            }
        }
        Ok(())
    }

    /// Order uniqueness and target monotonicity against the other active
    /// levels. The candidate replaces any existing record with its id.
    fn check_ladder_shape(
        levels: &HashMap<Uuid, IbLevel>,
        candidate: &IbLevel,
        override_monotonic: bool,
    ) -> IbResult<()> {
        if !candidate.is_active {
            // Inactive levels sit outside the ladder; no shape to enforce.
            return Ok(());
        }
        let mut floor: Option<u32> = None;
        let mut ceiling: Option<u32> = None;
        for other in levels.values() {
            if other.id == candidate.id || !other.is_active {
                continue;
            }
            if other.order == candidate.order {
                return Err(IbError::DuplicateOrder {
                    order: candidate.order,
                });
            }
            if other.order < candidate.order {
                floor = Some(floor.map_or(other.referral_target, |f| f.max(other.referral_target)));
            } else {
                ceiling =
                    Some(ceiling.map_or(other.referral_target, |c| c.min(other.referral_target)));
            }
        }
        if override_monotonic {
            return Ok(());
        }
        if let Some(floor) = floor {
            if candidate.referral_target < floor {
                return Err(IbError::NonMonotonicTarget {
                    order: candidate.order,
                    target: candidate.referral_target,
                    bound: floor,
                });
            }
        }
        if let Some(ceiling) = ceiling {
            if candidate.referral_target > ceiling {
                return Err(IbError::NonMonotonicTarget {
                    order: candidate.order,
                    target: candidate.referral_target,
                    bound: ceiling,
                });
            }
        }
        Ok(())
    }
}
