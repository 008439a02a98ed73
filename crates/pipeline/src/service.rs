//! Operations exposed to job runners and the webhook edge, wired over the
//! attribution, commission and payout crates.

use std::sync::Arc;

use affiliate_attribution::{AttributionEngine, JourneyTracker, TouchStore};
use affiliate_commission::{
    CommissionEngine, InMemoryRuleStore, InMemorySnapshotStore, RuleStore, SnapshotStore,
};
use affiliate_core::error::{AffiliateError, AffiliateResult};
use affiliate_core::store::{
    ConversionStore, InMemoryConversionStore, InMemoryPartnerDirectory, PartnerDirectory,
};
use affiliate_core::types::{
    ConversionEvent, ConversionStatus, CreditDistribution, EventCommissionSnapshot,
    FunnelJourney, Touch,
};
use affiliate_core::AppConfig;
use affiliate_payouts::{
    register_configured, CancelOutcome, Payout, PayoutLedger, PayoutResult, PayoutSettlement,
    ProcessorRegistry, WebhookOutcome,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Review reasons recorded on conversions left for manual resolution.
pub mod review {
    pub const NO_TOUCHES: &str = "no_touches";
    pub const NO_MATCHING_RULE: &str = "no_matching_rule";
    pub const PARTIAL_RULE_MATCH: &str = "partial_rule_match";
    pub const INVALID_MODEL: &str = "invalid_model";
}

/// Result of attributing and commissioning one conversion.
#[derive(Debug, Clone, Serialize)]
pub struct AttributionOutcome {
    pub distribution: CreditDistribution,
    pub snapshots: Vec<EventCommissionSnapshot>,
    pub unmatched_partners: Vec<Uuid>,
    /// `false` when the snapshot set already existed.
    pub created: bool,
}

/// Storage the service runs against. Swap the in-memory stores for
/// database-backed implementations in production.
#[derive(Clone)]
pub struct Backend {
    pub journeys: Arc<JourneyTracker>,
    pub touches: Arc<dyn TouchStore>,
    pub conversions: Arc<dyn ConversionStore>,
    pub partners: Arc<dyn PartnerDirectory>,
    pub rules: Arc<dyn RuleStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub ledger: Arc<PayoutLedger>,
    pub registry: Arc<ProcessorRegistry>,
}

/// In-memory stores with their concrete handles kept for seeding.
#[derive(Clone)]
pub struct InMemoryBackend {
    pub journeys: Arc<JourneyTracker>,
    pub conversions: Arc<InMemoryConversionStore>,
    pub partners: Arc<InMemoryPartnerDirectory>,
    pub rules: Arc<InMemoryRuleStore>,
    pub snapshots: Arc<InMemorySnapshotStore>,
    pub ledger: Arc<PayoutLedger>,
    pub registry: Arc<ProcessorRegistry>,
}

impl InMemoryBackend {
    /// Empty stores plus every provider enabled in `config`.
    pub fn new(config: &AppConfig) -> Self {
        let registry = Arc::new(ProcessorRegistry::new());
        register_configured(&registry, &config.providers);
        Self {
            journeys: Arc::new(JourneyTracker::new(config.attribution.window_days)),
            conversions: Arc::new(InMemoryConversionStore::new()),
            partners: Arc::new(InMemoryPartnerDirectory::new()),
            rules: Arc::new(InMemoryRuleStore::new()),
            snapshots: Arc::new(InMemorySnapshotStore::new()),
            ledger: Arc::new(PayoutLedger::new()),
            registry,
        }
    }

    pub fn backend(&self) -> Backend {
        Backend {
            journeys: self.journeys.clone(),
            touches: self.journeys.clone(),
            conversions: self.conversions.clone(),
            partners: self.partners.clone(),
            rules: self.rules.clone(),
            snapshots: self.snapshots.clone(),
            ledger: self.ledger.clone(),
            registry: self.registry.clone(),
        }
    }
}

pub struct AffiliateService {
    config: AppConfig,
    journeys: Arc<JourneyTracker>,
    touches: Arc<dyn TouchStore>,
    conversions: Arc<dyn ConversionStore>,
    snapshots: Arc<dyn SnapshotStore>,
    attribution: AttributionEngine,
    commission: CommissionEngine,
    settlement: PayoutSettlement,
}

impl AffiliateService {
    pub fn new(config: AppConfig, backend: Backend) -> Self {
        let attribution = AttributionEngine::new(&config.attribution);
        let commission = CommissionEngine::new(
            &config.commission,
            backend.rules.clone(),
            backend.snapshots.clone(),
            backend.partners.clone(),
        );
        let settlement = PayoutSettlement::new(
            &config.payouts,
            backend.ledger.clone(),
            backend.snapshots.clone(),
            backend.conversions.clone(),
            backend.partners.clone(),
            backend.registry.clone(),
        );
        info!(
            node_id = %config.node_id,
            default_model = %config.attribution.default_model,
            half_life_days = config.attribution.half_life_days,
            "Affiliate service initialized"
        );
        Self {
            journeys: backend.journeys,
            touches: backend.touches,
            conversions: backend.conversions,
            snapshots: backend.snapshots,
            attribution,
            commission,
            settlement,
            config,
        }
    }

    /// Service over fresh in-memory stores; the returned handles seed them.
    pub fn in_memory(config: AppConfig) -> (Self, InMemoryBackend) {
        let stores = InMemoryBackend::new(&config);
        (Self::new(config, stores.backend()), stores)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn settlement(&self) -> &PayoutSettlement {
        &self.settlement
    }

    pub fn snapshots(&self) -> &Arc<dyn SnapshotStore> {
        &self.snapshots
    }

    // ── Tracking boundary ───────────────────────────────────────────────────

    pub fn record_touch(&self, touch: Touch) {
        self.journeys.record_touch(touch);
    }

    pub fn record_conversion(&self, conversion: ConversionEvent) {
        self.conversions.insert(conversion);
    }

    pub fn conversion(&self, id: &Uuid) -> Option<ConversionEvent> {
        self.conversions.get(id)
    }

    pub fn journey(&self, identity_key: &str) -> Option<FunnelJourney> {
        self.journeys.journey(identity_key)
    }

    // ── Attribution + commission ────────────────────────────────────────────

    /// Attribute an approved conversion and write its commission snapshots.
    /// Safe to call repeatedly: later calls return the existing set.
    ///
    /// `model` is a model name as received from the caller; `None` uses the
    /// configured default. Input failures flag the conversion for review and
    /// leave its status untouched.
    pub fn attribute_and_commission(
        &self,
        conversion_id: Uuid,
        model: Option<&str>,
    ) -> AffiliateResult<AttributionOutcome> {
        let conversion = self
            .conversions
            .get(&conversion_id)
            .ok_or(AffiliateError::ConversionNotFound(conversion_id))?;
        if conversion.status != ConversionStatus::Approved {
            return Err(AffiliateError::InvalidTransition {
                entity: "conversion",
                from: conversion.status.to_string(),
                to: "attributed".to_string(),
            });
        }
        let distribution = self.attribute(&conversion, model)?;
        self.commission_attributed(conversion, distribution)
    }

    /// `pending → approved`, then commission. Attribution runs before the
    /// transition, so a conversion that cannot be attributed stays `pending`.
    pub fn approve_conversion(
        &self,
        conversion_id: Uuid,
        model: Option<&str>,
    ) -> AffiliateResult<AttributionOutcome> {
        let conversion = self
            .conversions
            .get(&conversion_id)
            .ok_or(AffiliateError::ConversionNotFound(conversion_id))?;
        if !conversion.status.can_transition(ConversionStatus::Approved) {
            return Err(AffiliateError::InvalidTransition {
                entity: "conversion",
                from: conversion.status.to_string(),
                to: ConversionStatus::Approved.to_string(),
            });
        }
        let distribution = self.attribute(&conversion, model)?;
        let approved = self
            .conversions
            .transition(&conversion_id, ConversionStatus::Approved)?;
        self.commission_attributed(approved, distribution)
    }

    fn attribute(
        &self,
        conversion: &ConversionEvent,
        model: Option<&str>,
    ) -> AffiliateResult<CreditDistribution> {
        let touches = self.touches.list_eligible_touches(conversion);
        let attributed = match model {
            Some(name) => self.attribution.attribute_named(conversion, &touches, name),
            None => {
                let model = self.config.attribution.default_model;
                self.attribution.attribute(conversion, &touches, model)
            }
        };
        let reason = match &attributed {
            Err(AffiliateError::NoTouches(_)) => review::NO_TOUCHES,
            Err(AffiliateError::InvalidModel(_)) => review::INVALID_MODEL,
            _ => return attributed,
        };
        self.conversions.flag_for_review(&conversion.id, reason)?;
        attributed
    }

    fn commission_attributed(
        &self,
        conversion: ConversionEvent,
        distribution: CreditDistribution,
    ) -> AffiliateResult<AttributionOutcome> {
        let conversion_id = conversion.id;
        self.conversions.record_attribution(
            &conversion_id,
            distribution.model,
            distribution.confidence,
        )?;

        let outcome = match self.commission.compute_commissions(&conversion, &distribution) {
            Ok(o) => o,
            Err(e @ AffiliateError::NoMatchingRule { .. }) => {
                self.conversions
                    .flag_for_review(&conversion_id, review::NO_MATCHING_RULE)?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if !outcome.unmatched_partners.is_empty() {
            self.conversions
                .flag_for_review(&conversion_id, review::PARTIAL_RULE_MATCH)?;
        }
        if outcome.created {
            match self.journeys.mark_completed(&conversion) {
                Ok(true) => {}
                Ok(false) => debug!(
                    identity = %conversion.identity_key,
                    "Journey already completed by an earlier conversion"
                ),
                Err(e) => debug!(error = %e, "No journey to complete"),
            }
            self.journeys
                .add_commission(&conversion.identity_key, outcome.total());
        }

        Ok(AttributionOutcome {
            distribution,
            snapshots: outcome.snapshots,
            unmatched_partners: outcome.unmatched_partners,
            created: outcome.created,
        })
    }

    /// Reject a conversion. An approved one has its snapshots reversed; a
    /// pending payout still holding one of them is refused at settlement.
    pub fn reject_conversion(
        &self,
        conversion_id: Uuid,
    ) -> AffiliateResult<Vec<EventCommissionSnapshot>> {
        let before = self
            .conversions
            .get(&conversion_id)
            .ok_or(AffiliateError::ConversionNotFound(conversion_id))?;
        let rejected = self
            .conversions
            .transition(&conversion_id, ConversionStatus::Rejected)?;
        if before.status != ConversionStatus::Approved {
            return Ok(Vec::new());
        }

        let reversals = self.commission.reverse_conversion(&conversion_id)?;
        for r in &reversals {
            if let Some(reversed) = r.reverses {
                if let Some(payout) = self.settlement.ledger().claimed_by(&reversed) {
                    warn!(
                        conversion_id = %conversion_id,
                        snapshot_id = %reversed,
                        payout_id = %payout,
                        "Reversed snapshot is held by an open payout"
                    );
                }
            }
        }
        let delta: Decimal = reversals.iter().map(|r| r.amount).sum();
        self.journeys.add_commission(&rejected.identity_key, delta);
        Ok(reversals)
    }

    // ── Payouts ─────────────────────────────────────────────────────────────

    pub fn build_payout(
        &self,
        partner_id: Uuid,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> AffiliateResult<Payout> {
        self.settlement
            .build_payout(partner_id, period_start, period_end)
    }

    pub async fn settle_payout(&self, payout_id: Uuid) -> AffiliateResult<PayoutResult> {
        self.settlement.settle_payout(payout_id).await
    }

    pub async fn cancel_payout(&self, payout_id: Uuid) -> AffiliateResult<CancelOutcome> {
        self.settlement.cancel_payout(payout_id).await
    }

    pub async fn retry_payout(&self, payout_id: Uuid) -> AffiliateResult<PayoutResult> {
        self.settlement.retry_payout(payout_id).await
    }

    pub async fn reconcile_payout(&self, payout_id: Uuid) -> AffiliateResult<PayoutResult> {
        self.settlement.reconcile_payout(payout_id).await
    }

    pub fn handle_provider_webhook(
        &self,
        provider_name: &str,
        raw_payload: &[u8],
        signature_header: &str,
    ) -> AffiliateResult<WebhookOutcome> {
        self.settlement
            .handle_provider_webhook(provider_name, raw_payload, signature_header)
    }

    pub fn payout(&self, payout_id: &Uuid) -> Option<Payout> {
        self.settlement.ledger().get(payout_id)
    }
}
