//! Error types for the IB partner network core.
//!
//! One flat enum covers the whole taxonomy: validation, invariant violations,
//! state-machine errors, lookups, and optimistic-concurrency conflicts. Only
//! [`IbError::Conflict`] is ever worth retrying; invariant violations require
//! a corrected admin request.

use std::fmt;
use uuid::Uuid;

use crate::model::IbStatus;

/// Result alias used across the crate.
pub type IbResult<T> = Result<T, IbError>;

/// Error type for all core operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IbError {
    /// Malformed or inadmissible input; state untouched.
    Validation(String),
    /// A level's `order` collides with another active level.
    DuplicateOrder { order: u32 },
    /// A level's `referral_target` would break the non-decreasing ladder.
    NonMonotonicTarget {
        order: u32,
        target: u32,
        /// The neighbouring level's target the write would cross:
        /// the next-lower level's when undershooting, the next-higher
        /// level's when overshooting.
        bound: u32,
    },
    /// The write would make an IB a descendant of its own subtree.
    CycleDetected { ib: Uuid },
    /// The referred user already has a referring IB.
    AlreadyAttributed { user: Uuid, current_ib: Uuid },
    /// The requested lifecycle transition is not in the state machine.
    InvalidTransition { from: IbStatus, to: IbStatus },
    /// Approval requires a verified KYC status for this user.
    KycRequired { user: Uuid },
    /// Unknown id, or the id does not resolve to the required kind of record.
    NotFound { entity: &'static str, id: Uuid },
    /// Optimistic version check failed; the caller should reread and retry.
    Conflict { entity: &'static str, id: Uuid },
}

impl IbError {
    /// Whether the caller may safely retry the same request.
    ///
    /// Only CAS conflicts qualify; they leave state unchanged. Invariant
    /// violations never do.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IbError::Conflict { .. })
    }
}

impl fmt::Display for IbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IbError::Validation(msg) => {
                write!(f, "Validation error: {msg}")
            }
            IbError::DuplicateOrder { order } => {
                write!(f, "A level with order {order} already exists")
            }
            IbError::NonMonotonicTarget {
                order,
                target,
                bound,
            } => {
                if target < bound {
                    write!(
                        f,
                        "Referral target {target} for level order {order} is below the \
                         next-lower level's target {bound}; pass an explicit override to accept it"
                    )
                } else {
                    write!(
                        f,
                        "Referral target {target} for level order {order} exceeds the \
                         next-higher level's target {bound}; pass an explicit override to accept it"
                    )
                }
            }
            IbError::CycleDetected { ib } => {
                write!(f, "Transfer would create a referral cycle through IB {ib}")
            }
            IbError::AlreadyAttributed { user, current_ib } => {
                write!(f, "User {user} is already attributed to IB {current_ib}")
            }
            IbError::InvalidTransition { from, to } => {
                write!(f, "Invalid lifecycle transition: {from} -> {to}")
            }
            IbError::KycRequired { user } => {
                write!(f, "KYC verification is required before approving user {user}")
            }
            IbError::NotFound { entity, id } => {
                write!(f, "{entity} not found: {id}")
            }
            IbError::Conflict { entity, id } => {
                write!(f, "Concurrent update on {entity} {id}; reread and retry")
            }
        }
    }
}

impl std::error::Error for IbError {}
