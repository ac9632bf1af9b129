//! The append-only commission ledger.
//!
//! Entries are immutable once written; corrections are new offsetting
//! entries. At-most-once posting per `(event_id, beneficiary)` is enforced by
//! a uniqueness set rather than any global lock, so reprocessing a trade
//! event can never duplicate a payout.

use std::collections::HashSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::model::LedgerEntry;

#[derive(Debug, Default)]
struct LedgerInner {
    entries: Vec<LedgerEntry>,
    posted: HashSet<(Uuid, Uuid)>,
}

#[derive(Debug, Default)]
pub struct CommissionLedger {
    inner: RwLock<LedgerInner>,
}

impl CommissionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Append one posting. Returns the entry, or `None` when this
    /// `(event_id, beneficiary)` pair has already been posted.
    pub fn post(
        &self,
        event_id: Uuid,
        beneficiary: Uuid,
        level: u8,
        amount: Decimal,
    ) -> Option<LedgerEntry> {
        let mut inner = self.write();
        if !inner.posted.insert((event_id, beneficiary)) {
            log::debug!("dropping duplicate posting for event {event_id}, IB {beneficiary}");
            return None;
        }
        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            event_id,
            beneficiary,
            level,
            amount,
            created_at: Utc::now(),
        };
        inner.entries.push(entry.clone());
        Some(entry)
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.read().entries.clone()
    }

    pub fn entries_for(&self, beneficiary: Uuid) -> Vec<LedgerEntry> {
        self.read()
            .entries
            .iter()
            .filter(|e| e.beneficiary == beneficiary)
            .cloned()
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.read().entries.len()
    }

    /// Total posted amount across all beneficiaries.
    pub fn total_volume(&self) -> Decimal {
        self.read().entries.iter().map(|e| e.amount).sum()
    }

    pub fn volume_for(&self, beneficiary: Uuid) -> Decimal {
        self.read()
            .entries
            .iter()
            .filter(|e| e.beneficiary == beneficiary)
            .map(|e| e.amount)
            .sum()
    }
}
