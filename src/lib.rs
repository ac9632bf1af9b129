//! # ibnet
//!
//! Introducing Broker partner network core: referral attribution,
//! multi-level commission computation, and partner lifecycle management.
//!
//! The crate is the rules engine only. Trade execution, authentication, and
//! the administrative presentation layer are external collaborators; trade
//! events come in as trusted values, KYC verdicts and notification delivery
//! go through the [`lifecycle::KycProvider`] and [`notify::NotificationSink`]
//! traits.

pub mod engine;
pub mod error;
pub mod graph;
pub mod ladder;
pub mod ledger;
pub mod lifecycle;
pub mod model;
pub mod network;
pub mod notify;
pub mod plans;
pub mod settings;
pub mod transfer;

pub use engine::CommissionEngine;
pub use error::{IbError, IbResult};
pub use graph::{ReferralGraph, MAX_ANCESTOR_DEPTH};
pub use ladder::LevelLadder;
pub use ledger::CommissionLedger;
pub use lifecycle::{IbLifecycle, KycProvider, StaticKyc};
pub use model::{
    CommissionPlan, CommissionType, IbLevel, IbPartner, IbStatus, LedgerEntry, ReferredUser,
    TradeEvent, TransferAudit, MAX_COMMISSION_LEVELS,
};
pub use network::IbNetwork;
pub use notify::{IbEvent, NotificationSink, Notifier};
pub use plans::PlanRegistry;
pub use settings::{IbSettings, SettingsAudit, SettingsStore};
pub use transfer::{ReferralTransferService, TransferFailure, TransferOutcome, TransferRequest};
