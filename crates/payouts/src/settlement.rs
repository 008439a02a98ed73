//! Payout settlement — builds payouts from approved, unclaimed commission
//! snapshots, drives them through a provider, and reconciles provider
//! webhooks and status polls.
//!
//! Builds and claim changes run under the partner's mutex. Provider calls
//! never do: the payout is persisted as `processing` first, the lock is
//! released, and only then is the provider called with a bounded timeout.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use affiliate_commission::SnapshotStore;
use affiliate_core::config::PayoutConfig;
use affiliate_core::error::{AffiliateError, AffiliateResult};
use affiliate_core::store::{ConversionStore, PartnerDirectory};
use affiliate_core::types::{ConversionStatus, EventCommissionSnapshot};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ledger::{Payout, PayoutEvent, PayoutLedger};
use crate::processor::{
    PayoutRequest, ProcessorRegistry, ProviderError, ProviderPayoutResult, ProviderPayoutStatus,
};
use crate::retry::RetryPolicy;
use crate::state_machine::{next_status, PayoutStatus, PayoutTrigger};

pub const CANCELLED_REASON: &str = "cancelled_by_operator";

/// Caller-facing view of a payout after a settlement step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutResult {
    pub payout_id: Uuid,
    pub status: PayoutStatus,
    pub amount: Decimal,
    pub currency: String,
    pub provider_transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    pub provider_attempts: u32,
}

impl From<&Payout> for PayoutResult {
    fn from(p: &Payout) -> Self {
        Self {
            payout_id: p.id,
            status: p.status,
            amount: p.amount,
            currency: p.currency.clone(),
            provider_transaction_id: p.provider_transaction_id.clone(),
            failure_reason: p.failure_reason.clone(),
            provider_attempts: p.provider_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    /// The provider refused; the payout keeps its status.
    Declined,
    /// No confirmation yet; the payout stays `processing` until reconciled.
    PendingReconciliation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied(PayoutStatus),
    /// Duplicate or non-terminal notification; nothing changed.
    Ignored,
}

pub struct PayoutSettlement {
    ledger: Arc<PayoutLedger>,
    snapshots: Arc<dyn SnapshotStore>,
    conversions: Arc<dyn ConversionStore>,
    partners: Arc<dyn PartnerDirectory>,
    registry: Arc<ProcessorRegistry>,
    retry: RetryPolicy,
    config: PayoutConfig,
}

impl PayoutSettlement {
    pub fn new(
        config: &PayoutConfig,
        ledger: Arc<PayoutLedger>,
        snapshots: Arc<dyn SnapshotStore>,
        conversions: Arc<dyn ConversionStore>,
        partners: Arc<dyn PartnerDirectory>,
        registry: Arc<ProcessorRegistry>,
    ) -> Self {
        info!(
            currency = %config.currency,
            default_processor = %config.default_processor,
            timeout_ms = config.provider_timeout_ms,
            "Payout settlement initialized"
        );
        Self {
            ledger,
            snapshots,
            conversions,
            partners,
            registry,
            retry: RetryPolicy::from_config(config),
            config: config.clone(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn ledger(&self) -> &Arc<PayoutLedger> {
        &self.ledger
    }

    fn provider_timeout(&self) -> Duration {
        Duration::from_millis(self.config.provider_timeout_ms)
    }

    // ── Build ───────────────────────────────────────────────────────────────

    pub fn build_payout(
        &self,
        partner_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> AffiliateResult<Payout> {
        let currency = self.config.currency.clone();
        self.build_payout_in(partner_id, period_start, period_end, &currency)
    }

    /// Claim every eligible snapshot for the partner and period into a new
    /// `pending` payout. No payout is written when nothing is claimable.
    pub fn build_payout_in(
        &self,
        partner_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
        currency: &str,
    ) -> AffiliateResult<Payout> {
        if period_start >= period_end {
            return Err(AffiliateError::InvalidPeriod(format!(
                "{period_start} is not before {period_end}"
            )));
        }

        let partner = self.partners.get(&partner_id);
        let processor = partner
            .as_ref()
            .and_then(|p| p.payout_processor.clone())
            .unwrap_or_else(|| self.config.default_processor.clone());
        if !self.registry.contains(&processor) {
            return Err(AffiliateError::UnknownProcessor(processor));
        }
        let destination_account = match &partner {
            Some(p) => p.payout_account.clone(),
            None => {
                warn!(partner_id = %partner_id, "Partner missing from directory");
                String::new()
            }
        };

        let lock = self.ledger.partner_lock(partner_id);
        let _guard = lock.lock();

        let payout_id = Uuid::new_v4();
        let now = Utc::now();
        let mut claimed: Vec<EventCommissionSnapshot> = Vec::new();
        for snapshot in self.eligible_snapshots(partner_id, period_start, period_end, currency) {
            match self.ledger.try_claim(snapshot.id, payout_id) {
                Ok(()) => claimed.push(snapshot),
                Err(holder) => debug!(
                    snapshot_id = %snapshot.id,
                    holder = %holder,
                    "Snapshot already claimed, skipping"
                ),
            }
        }

        let amount: Decimal = claimed.iter().map(|s| s.amount).sum();
        if claimed.is_empty() || amount <= Decimal::ZERO {
            self.ledger.release_claims(payout_id);
            return Err(AffiliateError::NoEligibleCommissions { partner_id });
        }

        let events: Vec<PayoutEvent> = claimed
            .iter()
            .map(|s| PayoutEvent {
                id: Uuid::new_v4(),
                payout_id,
                snapshot_id: s.id,
                amount: s.amount,
                claimed_at: now,
                released_at: None,
            })
            .collect();
        let event_total: Decimal = events.iter().map(|e| e.amount).sum();
        if event_total != amount {
            self.ledger.release_claims(payout_id);
            return Err(AffiliateError::Integrity(format!(
                "payout {payout_id} amount {amount} != claimed total {event_total}"
            )));
        }

        let payout = Payout {
            id: payout_id,
            partner_id,
            period_start,
            period_end,
            amount,
            currency: currency.to_string(),
            status: PayoutStatus::Pending,
            processor,
            destination_account,
            snapshot_ids: claimed.iter().map(|s| s.id).collect(),
            provider_transaction_id: None,
            failure_reason: None,
            provider_attempts: 0,
            manual_retries: 0,
            created_at: now,
            updated_at: now,
            processing_since: None,
            completed_at: None,
        };
        self.ledger.record_events(payout_id, events);
        self.ledger.insert(payout.clone());

        metrics::counter!("payouts.built").increment(1);
        info!(
            payout_id = %payout.id,
            partner_id = %partner_id,
            snapshots = payout.snapshot_ids.len(),
            amount = %payout.amount,
            currency = %payout.currency,
            processor = %payout.processor,
            "Payout built"
        );
        Ok(payout)
    }

    fn eligible_snapshots(
        &self,
        partner_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
        currency: &str,
    ) -> Vec<EventCommissionSnapshot> {
        let mut eligible: Vec<EventCommissionSnapshot> = self
            .snapshots
            .live_for_partner(&partner_id)
            .into_iter()
            .filter(|s| s.currency.eq_ignore_ascii_case(currency))
            .filter(|s| {
                let day = s.conversion_occurred_at.date_naive();
                day >= period_start && day < period_end
            })
            .filter(|s| self.ledger.claimed_by(&s.id).is_none())
            .filter(|s| {
                self.conversions
                    .get(&s.conversion_id)
                    .is_some_and(|c| c.status == ConversionStatus::Approved)
            })
            .collect();
        eligible.sort_by_key(|s| (s.conversion_occurred_at, s.id));
        eligible
    }

    // ── Settle ──────────────────────────────────────────────────────────────

    /// Move a `pending` payout to `processing` and pay it through its provider.
    ///
    /// Every claimed snapshot must still be payable. A payout holding one that
    /// is not (its conversion was rejected after the build) is failed with its
    /// claims released and never reaches the provider.
    pub async fn settle_payout(&self, payout_id: Uuid) -> AffiliateResult<PayoutResult> {
        let payout = self.load(&payout_id)?;
        let payout = {
            let lock = self.ledger.partner_lock(payout.partner_id);
            let _guard = lock.lock();
            let current = self.load(&payout_id)?;
            if current.status == PayoutStatus::Pending {
                if let Some(reason) = self.unpayable_snapshot(&current) {
                    self.fail(payout_id, &reason)?;
                    error!(
                        payout_id = %payout_id,
                        reason = %reason,
                        "Payout holds an unpayable snapshot, settlement aborted"
                    );
                    return Err(AffiliateError::Integrity(reason));
                }
            }
            self.ledger.update(&payout_id, |p| {
                p.status = next_status(p.status, PayoutTrigger::Begin)?;
                p.processing_since = Some(Utc::now());
                Ok(p.clone())
            })?
        };
        info!(payout_id = %payout_id, amount = %payout.amount, "Payout processing");
        self.dispatch(payout).await
    }

    /// Administrative retry of a `failed` payout. Re-claims its snapshots and
    /// aborts with an integrity error if any is now held or no longer payable.
    pub async fn retry_payout(&self, payout_id: Uuid) -> AffiliateResult<PayoutResult> {
        let payout = self.load(&payout_id)?;
        let payout = {
            let lock = self.ledger.partner_lock(payout.partner_id);
            let _guard = lock.lock();

            let current = self.load(&payout_id)?;
            next_status(current.status, PayoutTrigger::Retry)?;
            if current.manual_retries >= self.config.max_manual_retries {
                return Err(AffiliateError::RetryBudgetExhausted(payout_id));
            }
            self.reclaim(&current)?;

            self.ledger.update(&payout_id, |p| {
                p.status = next_status(p.status, PayoutTrigger::Retry)?;
                p.manual_retries += 1;
                p.failure_reason = None;
                p.provider_transaction_id = None;
                p.processing_since = Some(Utc::now());
                Ok(p.clone())
            })?
        };
        info!(
            payout_id = %payout_id,
            manual_retries = payout.manual_retries,
            "Payout retry started"
        );
        self.dispatch(payout).await
    }

    /// Live snapshots of the partner whose conversion is still `approved`.
    fn payable_snapshot_ids(&self, partner_id: &Uuid) -> BTreeSet<Uuid> {
        self.snapshots
            .live_for_partner(partner_id)
            .into_iter()
            .filter(|s| {
                self.conversions
                    .get(&s.conversion_id)
                    .is_some_and(|c| c.status == ConversionStatus::Approved)
            })
            .map(|s| s.id)
            .collect()
    }

    fn unpayable_snapshot(&self, payout: &Payout) -> Option<String> {
        let payable = self.payable_snapshot_ids(&payout.partner_id);
        payout.snapshot_ids.iter().find_map(|id| {
            if !payable.contains(id) {
                Some(format!("snapshot {id} is no longer payable"))
            } else if self.ledger.claimed_by(id) != Some(payout.id) {
                Some(format!("snapshot {id} is not claimed by payout {}", payout.id))
            } else {
                None
            }
        })
    }

    fn reclaim(&self, payout: &Payout) -> AffiliateResult<()> {
        let live = self.payable_snapshot_ids(&payout.partner_id);

        let mut taken = Vec::with_capacity(payout.snapshot_ids.len());
        for snapshot_id in &payout.snapshot_ids {
            let violation = if !live.contains(snapshot_id) {
                Some(format!("snapshot {snapshot_id} is no longer payable"))
            } else {
                match self.ledger.try_claim(*snapshot_id, payout.id) {
                    Ok(()) => None,
                    Err(holder) => Some(format!(
                        "snapshot {snapshot_id} already claimed by payout {holder}"
                    )),
                }
            };
            if let Some(reason) = violation {
                self.ledger.release_claims(payout.id);
                error!(payout_id = %payout.id, reason = %reason, "Double claim detected on retry");
                return Err(AffiliateError::Integrity(reason));
            }
            taken.push(*snapshot_id);
        }

        let now = Utc::now();
        let events = taken
            .iter()
            .filter_map(|id| self.snapshots.get(id))
            .map(|s| PayoutEvent {
                id: Uuid::new_v4(),
                payout_id: payout.id,
                snapshot_id: s.id,
                amount: s.amount,
                claimed_at: now,
                released_at: None,
            })
            .collect();
        self.ledger.record_events(payout.id, events);
        Ok(())
    }

    /// Call the provider for a `processing` payout, retrying transient errors
    /// with backoff. Permanent errors fail the payout immediately.
    async fn dispatch(&self, payout: Payout) -> AffiliateResult<PayoutResult> {
        let processor = match self.registry.get(&payout.processor) {
            Ok(p) => p,
            Err(e) => {
                self.fail(payout.id, e.reason())?;
                return Err(e);
            }
        };
        let request = PayoutRequest {
            payout_id: payout.id,
            reference: format!("{}-{}", payout.id, payout.manual_retries),
            partner_id: payout.partner_id,
            destination_account: payout.destination_account.clone(),
            amount: payout.amount,
            currency: payout.currency.clone(),
            memo: format!(
                "Affiliate commission {} to {}",
                payout.period_start, payout.period_end
            ),
        };

        let mut attempt = 0;
        loop {
            self.ledger.update(&payout.id, |p| {
                p.provider_attempts += 1;
                Ok(())
            })?;
            let started = Instant::now();
            let outcome = match tokio::time::timeout(
                self.provider_timeout(),
                processor.process_payout(&request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Transient("provider call timed out".to_string())),
            };
            metrics::histogram!(
                "payouts.provider_latency_ms",
                "processor" => payout.processor.clone()
            )
            .record(started.elapsed().as_millis() as f64);

            match outcome {
                Ok(result) => return self.apply_provider_result(payout.id, result),
                Err(ProviderError::Permanent(reason)) => {
                    warn!(payout_id = %payout.id, reason = %reason, "Provider rejected payout");
                    self.fail(payout.id, &reason)?;
                    return self.result(&payout.id);
                }
                Err(ProviderError::Transient(reason)) if attempt >= self.retry.max_retries => {
                    warn!(
                        payout_id = %payout.id,
                        attempts = attempt + 1,
                        reason = %reason,
                        "Provider retry budget exhausted"
                    );
                    self.fail(payout.id, &format!("retry budget exhausted: {reason}"))?;
                    return self.result(&payout.id);
                }
                Err(ProviderError::Transient(reason)) => {
                    let backoff = self.retry.backoff_for_attempt(attempt);
                    debug!(
                        payout_id = %payout.id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        reason = %reason,
                        "Transient provider error, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    fn load(&self, payout_id: &Uuid) -> AffiliateResult<Payout> {
        self.ledger
            .get(payout_id)
            .ok_or_else(|| AffiliateError::PayoutNotFound(payout_id.to_string()))
    }

    fn result(&self, payout_id: &Uuid) -> AffiliateResult<PayoutResult> {
        self.ledger
            .get(payout_id)
            .map(|p| PayoutResult::from(&p))
            .ok_or_else(|| AffiliateError::PayoutNotFound(payout_id.to_string()))
    }

    fn apply_provider_result(
        &self,
        payout_id: Uuid,
        result: ProviderPayoutResult,
    ) -> AffiliateResult<PayoutResult> {
        self.ledger.update(&payout_id, |p| {
            p.provider_transaction_id = Some(result.provider_transaction_id.clone());
            Ok(())
        })?;
        self.ledger
            .bind_transaction(&result.provider_transaction_id, payout_id);

        match result.status {
            ProviderPayoutStatus::Completed => {
                self.complete(payout_id)?;
            }
            ProviderPayoutStatus::Failed => {
                let reason = result
                    .failure_reason
                    .unwrap_or_else(|| "provider_reported_failure".to_string());
                self.fail(payout_id, &reason)?;
            }
            ProviderPayoutStatus::Pending => {
                debug!(
                    payout_id = %payout_id,
                    tx = %result.provider_transaction_id,
                    "Provider accepted payout, awaiting settlement"
                );
            }
        }
        self.result(&payout_id)
    }

    /// `processing → completed`, once. Returns `false` if already terminal.
    fn complete(&self, payout_id: Uuid) -> AffiliateResult<bool> {
        let applied = self.ledger.update(&payout_id, |p| {
            if p.status != PayoutStatus::Processing {
                return Ok(false);
            }
            p.status = next_status(p.status, PayoutTrigger::Success)?;
            p.completed_at = Some(Utc::now());
            Ok(true)
        })?;
        if applied {
            metrics::counter!("payouts.completed").increment(1);
            info!(payout_id = %payout_id, "Payout completed");
            self.mark_conversions_paid(&payout_id);
        }
        Ok(applied)
    }

    /// `processing|pending → failed`, once, releasing the payout's claims.
    fn fail(&self, payout_id: Uuid, reason: &str) -> AffiliateResult<bool> {
        let applied = self.ledger.update(&payout_id, |p| {
            let trigger = match p.status {
                PayoutStatus::Processing => PayoutTrigger::Failure,
                PayoutStatus::Pending => PayoutTrigger::Cancel,
                _ => return Ok(false),
            };
            p.status = next_status(p.status, trigger)?;
            p.failure_reason = Some(reason.to_string());
            Ok(true)
        })?;
        if applied {
            self.ledger.release_claims(payout_id);
            metrics::counter!("payouts.failed").increment(1);
            warn!(payout_id = %payout_id, reason, "Payout failed");
        }
        Ok(applied)
    }

    /// Conversions whose live snapshots are all in completed payouts are paid.
    fn mark_conversions_paid(&self, payout_id: &Uuid) {
        let Some(payout) = self.ledger.get(payout_id) else {
            return;
        };
        let conversion_ids: BTreeSet<Uuid> = payout
            .snapshot_ids
            .iter()
            .filter_map(|id| self.snapshots.get(id))
            .map(|s| s.conversion_id)
            .collect();

        for conversion_id in conversion_ids {
            let set = self.snapshots.snapshots_for(&conversion_id);
            let reversed: BTreeSet<Uuid> = set.iter().filter_map(|s| s.reverses).collect();
            let fully_paid = set
                .iter()
                .filter(|s| !s.is_reversal() && !reversed.contains(&s.id))
                .all(|s| {
                    self.ledger
                        .claimed_by(&s.id)
                        .and_then(|holder| self.ledger.get(&holder))
                        .is_some_and(|p| p.status == PayoutStatus::Completed)
                });
            if !fully_paid {
                continue;
            }
            if let Err(e) = self.conversions.transition(&conversion_id, ConversionStatus::Paid) {
                debug!(conversion_id = %conversion_id, error = %e, "Conversion not moved to paid");
            }
        }
    }

    // ── Cancel ──────────────────────────────────────────────────────────────

    pub async fn cancel_payout(&self, payout_id: Uuid) -> AffiliateResult<CancelOutcome> {
        let payout = self.load(&payout_id)?;
        match payout.status {
            PayoutStatus::Pending => {
                let lock = self.ledger.partner_lock(payout.partner_id);
                let _guard = lock.lock();
                if self.fail(payout_id, CANCELLED_REASON)? {
                    info!(payout_id = %payout_id, "Pending payout cancelled");
                    return Ok(CancelOutcome::Cancelled);
                }
                // Raced with settle; report on whatever state won.
                Ok(CancelOutcome::Declined)
            }
            PayoutStatus::Processing => {
                let Some(tx) = payout.provider_transaction_id.clone() else {
                    return Ok(CancelOutcome::PendingReconciliation);
                };
                let processor = self.registry.get(&payout.processor)?;
                let cancelled =
                    tokio::time::timeout(self.provider_timeout(), processor.cancel_payout(&tx))
                        .await;
                match cancelled {
                    Ok(Ok(true)) => {
                        self.fail(payout_id, CANCELLED_REASON)?;
                        info!(
                            payout_id = %payout_id,
                            tx = %tx,
                            "Processing payout cancelled at provider"
                        );
                        Ok(CancelOutcome::Cancelled)
                    }
                    Ok(Ok(false)) => {
                        info!(payout_id = %payout_id, tx = %tx, "Provider declined cancel");
                        Ok(CancelOutcome::Declined)
                    }
                    Ok(Err(e)) if e.is_transient() => {
                        warn!(
                            payout_id = %payout_id,
                            error = %e,
                            "Cancel not confirmed, awaiting reconciliation"
                        );
                        Ok(CancelOutcome::PendingReconciliation)
                    }
                    Ok(Err(e)) => {
                        warn!(payout_id = %payout_id, error = %e, "Provider refused cancel");
                        Ok(CancelOutcome::Declined)
                    }
                    Err(_) => {
                        warn!(payout_id = %payout_id, "Cancel timed out, awaiting reconciliation");
                        Ok(CancelOutcome::PendingReconciliation)
                    }
                }
            }
            status => Err(AffiliateError::InvalidTransition {
                entity: "payout",
                from: status.to_string(),
                to: "cancelled".to_string(),
            }),
        }
    }

    // ── Reconcile ───────────────────────────────────────────────────────────

    /// Apply a provider webhook. Unauthenticated payloads are rejected with no
    /// state change; notifications for terminal payouts are ignored.
    pub fn handle_provider_webhook(
        &self,
        provider_name: &str,
        raw_payload: &[u8],
        signature_header: &str,
    ) -> AffiliateResult<WebhookOutcome> {
        let processor = self.registry.get(provider_name)?;
        if !processor.verify_webhook_signature(raw_payload, signature_header) {
            metrics::counter!("webhooks.rejected", "processor" => provider_name.to_string())
                .increment(1);
            warn!(processor = %provider_name, "Webhook signature rejected");
            return Err(AffiliateError::WebhookRejected("invalid signature".to_string()));
        }
        let event = processor
            .parse_webhook(raw_payload)
            .map_err(|e| AffiliateError::WebhookRejected(e.to_string()))?;

        let payout = self
            .ledger
            .find_by_transaction(&event.transaction_id)
            .ok_or_else(|| AffiliateError::PayoutNotFound(event.transaction_id.clone()))?;
        if payout.processor != provider_name {
            return Err(AffiliateError::WebhookRejected(format!(
                "transaction {} belongs to {}",
                event.transaction_id, payout.processor
            )));
        }

        let outcome = self.apply_terminal_status(payout.id, event.status, event.failure_reason)?;
        info!(
            processor = %provider_name,
            payout_id = %payout.id,
            tx = %event.transaction_id,
            outcome = ?outcome,
            "Provider webhook handled"
        );
        Ok(outcome)
    }

    /// Poll the provider for a `processing` payout's status.
    pub async fn reconcile_payout(&self, payout_id: Uuid) -> AffiliateResult<PayoutResult> {
        let payout = self.load(&payout_id)?;
        let (PayoutStatus::Processing, Some(tx)) =
            (payout.status, payout.provider_transaction_id.clone())
        else {
            return Ok(PayoutResult::from(&payout));
        };
        let processor = self.registry.get(&payout.processor)?;
        let polled =
            tokio::time::timeout(self.provider_timeout(), processor.retrieve_payout_status(&tx))
                .await;
        match polled {
            Ok(Ok(status)) => {
                self.apply_terminal_status(payout_id, status.status, status.failure_reason)?;
            }
            Ok(Err(e)) => warn!(payout_id = %payout_id, error = %e, "Status poll failed"),
            Err(_) => warn!(payout_id = %payout_id, "Status poll timed out"),
        }
        self.result(&payout_id)
    }

    fn apply_terminal_status(
        &self,
        payout_id: Uuid,
        status: ProviderPayoutStatus,
        failure_reason: Option<String>,
    ) -> AffiliateResult<WebhookOutcome> {
        let applied = match status {
            ProviderPayoutStatus::Completed => self.complete(payout_id)?,
            ProviderPayoutStatus::Failed => {
                let reason =
                    failure_reason.unwrap_or_else(|| "provider_reported_failure".to_string());
                // Only a processing payout fails from a provider report.
                match self.ledger.get(&payout_id).map(|p| p.status) {
                    Some(PayoutStatus::Processing) => self.fail(payout_id, &reason)?,
                    _ => false,
                }
            }
            ProviderPayoutStatus::Pending => false,
        };
        if !applied {
            return Ok(WebhookOutcome::Ignored);
        }
        let status = self
            .ledger
            .get(&payout_id)
            .map(|p| p.status)
            .ok_or_else(|| AffiliateError::PayoutNotFound(payout_id.to_string()))?;
        Ok(WebhookOutcome::Applied(status))
    }
}
