//! Payout ledger: payouts, their append-only `PayoutEvent` claim history, and
//! the active-claim index that enforces one live payout per snapshot.

use std::sync::Arc;

use affiliate_core::error::{AffiliateError, AffiliateResult};
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::state_machine::PayoutStatus;

/// Approved commissions for one partner over `[period_start, period_end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payout {
    pub id: Uuid,
    pub partner_id: Uuid,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub amount: Decimal,
    pub currency: String,
    pub status: PayoutStatus,
    pub processor: String,
    pub destination_account: String,
    pub snapshot_ids: Vec<Uuid>,
    pub provider_transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    /// Provider calls made, including transient retries.
    pub provider_attempts: u32,
    /// Administrative retries after failure.
    pub manual_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_since: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Binds a payout to one snapshot it settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutEvent {
    pub id: Uuid,
    pub payout_id: Uuid,
    pub snapshot_id: Uuid,
    pub amount: Decimal,
    pub claimed_at: DateTime<Utc>,
    /// Set when the payout failed and gave the snapshot back.
    pub released_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct PayoutLedger {
    payouts: DashMap<Uuid, Payout>,
    by_transaction: DashMap<String, Uuid>,
    /// snapshot id → payout id, for claims held by non-failed payouts.
    claims: DashMap<Uuid, Uuid>,
    events: DashMap<Uuid, Vec<PayoutEvent>>,
    partner_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl PayoutLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutex serializing builds and claim changes for one partner.
    pub fn partner_lock(&self, partner_id: Uuid) -> Arc<Mutex<()>> {
        self.partner_locks
            .entry(partner_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Atomically claim a snapshot. Returns the current holder on conflict.
    pub fn try_claim(&self, snapshot_id: Uuid, payout_id: Uuid) -> Result<(), Uuid> {
        match self.claims.entry(snapshot_id) {
            Entry::Occupied(held) if *held.get() == payout_id => Ok(()),
            Entry::Occupied(held) => Err(*held.get()),
            Entry::Vacant(slot) => {
                slot.insert(payout_id);
                Ok(())
            }
        }
    }

    pub fn claimed_by(&self, snapshot_id: &Uuid) -> Option<Uuid> {
        self.claims.get(snapshot_id).map(|p| *p)
    }

    /// Drop every active claim held by `payout_id` and stamp its events.
    pub fn release_claims(&self, payout_id: Uuid) -> usize {
        self.claims.retain(|_, holder| *holder != payout_id);
        let now = Utc::now();
        let mut released = 0;
        if let Some(mut events) = self.events.get_mut(&payout_id) {
            for e in events.iter_mut().filter(|e| e.released_at.is_none()) {
                e.released_at = Some(now);
                released += 1;
            }
        }
        debug!(payout_id = %payout_id, released, "Payout claims released");
        released
    }

    pub fn record_events(&self, payout_id: Uuid, events: Vec<PayoutEvent>) {
        self.events.entry(payout_id).or_default().extend(events);
    }

    pub fn events_for(&self, payout_id: &Uuid) -> Vec<PayoutEvent> {
        self.events
            .get(payout_id)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn insert(&self, payout: Payout) {
        self.payouts.insert(payout.id, payout);
    }

    pub fn get(&self, id: &Uuid) -> Option<Payout> {
        self.payouts.get(id).map(|p| p.clone())
    }

    /// Mutate a payout under its entry lock; the closure sees and decides on
    /// the latest stored state. `updated_at` moves only if something changed.
    pub fn update<T>(
        &self,
        id: &Uuid,
        f: impl FnOnce(&mut Payout) -> AffiliateResult<T>,
    ) -> AffiliateResult<T> {
        let mut payout = self
            .payouts
            .get_mut(id)
            .ok_or_else(|| AffiliateError::PayoutNotFound(id.to_string()))?;
        let before = payout.clone();
        let out = f(&mut payout)?;
        if *payout != before {
            payout.updated_at = Utc::now();
        }
        Ok(out)
    }

    pub fn bind_transaction(&self, provider_transaction_id: &str, payout_id: Uuid) {
        self.by_transaction
            .insert(provider_transaction_id.to_string(), payout_id);
    }

    pub fn find_by_transaction(&self, provider_transaction_id: &str) -> Option<Payout> {
        let id = self.by_transaction.get(provider_transaction_id).map(|id| *id)?;
        self.get(&id)
    }

    pub fn list_by_status(&self, status: PayoutStatus) -> Vec<Payout> {
        self.payouts
            .iter()
            .filter(|p| p.status == status)
            .map(|p| p.clone())
            .collect()
    }

    pub fn payouts_for_partner(&self, partner_id: &Uuid) -> Vec<Payout> {
        let mut payouts: Vec<Payout> = self
            .payouts
            .iter()
            .filter(|p| &p.partner_id == partner_id)
            .map(|p| p.clone())
            .collect();
        payouts.sort_by_key(|p| p.created_at);
        payouts
    }
}
