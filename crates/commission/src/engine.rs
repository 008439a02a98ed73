//! Commission engine — evaluates active rules against an attributed
//! conversion and writes one immutable snapshot set per conversion.

use std::sync::Arc;

use affiliate_core::config::CommissionConfig;
use affiliate_core::error::{AffiliateError, AffiliateResult};
use affiliate_core::store::PartnerDirectory;
use affiliate_core::types::*;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::rules::{select_rule, RuleContext};
use crate::store::{RuleStore, SnapshotStore};

/// Result of one commission run for a conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionOutcome {
    pub conversion_id: Uuid,
    /// Original snapshots for the conversion (new or pre-existing).
    pub snapshots: Vec<EventCommissionSnapshot>,
    /// Partners with credit but no matching rule; they need manual review.
    pub unmatched_partners: Vec<Uuid>,
    /// `false` when this run was an idempotent no-op.
    pub created: bool,
}

impl CommissionOutcome {
    pub fn total(&self) -> Decimal {
        self.snapshots.iter().map(|s| s.amount).sum()
    }
}

pub struct CommissionEngine {
    rules: Arc<dyn RuleStore>,
    snapshots: Arc<dyn SnapshotStore>,
    partners: Arc<dyn PartnerDirectory>,
    config: CommissionConfig,
}

impl CommissionEngine {
    pub fn new(
        config: &CommissionConfig,
        rules: Arc<dyn RuleStore>,
        snapshots: Arc<dyn SnapshotStore>,
        partners: Arc<dyn PartnerDirectory>,
    ) -> Self {
        info!(
            tier_lookback_days = config.tier_lookback_days,
            "Commission engine initialized"
        );
        Self {
            rules,
            snapshots,
            partners,
            config: config.clone(),
        }
    }

    /// Compute and persist the snapshot set for an approved conversion.
    /// A second call for the same conversion is a no-op returning the
    /// existing set.
    pub fn compute_commissions(
        &self,
        conversion: &ConversionEvent,
        distribution: &CreditDistribution,
    ) -> AffiliateResult<CommissionOutcome> {
        if conversion.status != ConversionStatus::Approved {
            return Err(AffiliateError::InvalidTransition {
                entity: "commission",
                from: conversion.status.to_string(),
                to: "snapshot".to_string(),
            });
        }
        if distribution.conversion_id != conversion.id {
            return Err(AffiliateError::Integrity(format!(
                "distribution for {} applied to conversion {}",
                distribution.conversion_id, conversion.id
            )));
        }

        let existing = self.existing_originals(&conversion.id);
        if !existing.is_empty() {
            return Ok(self.noop(conversion.id, existing));
        }

        let total_weight = distribution.total_weight();
        if total_weight > 1.0 + self.config.weight_epsilon {
            return Err(AffiliateError::Integrity(format!(
                "attribution weights for conversion {} sum to {total_weight}",
                conversion.id
            )));
        }

        if !conversion.commissionable {
            debug!(conversion_id = %conversion.id, "Non-commissionable conversion, no snapshots");
            return Ok(CommissionOutcome {
                conversion_id: conversion.id,
                snapshots: Vec::new(),
                unmatched_partners: Vec::new(),
                created: false,
            });
        }

        let as_of = conversion.occurred_at;
        let lookback_from = as_of - Duration::days(self.config.tier_lookback_days as i64);
        let now = Utc::now();
        let mut snapshots = Vec::with_capacity(distribution.credits.len());
        let mut unmatched = Vec::new();

        for credit in &distribution.credits {
            let ctx = RuleContext {
                campaign_id: conversion.campaign_id,
                partner_tier: self.partners.tier_of(&credit.partner_id),
                event_type: conversion.event_type.clone(),
                vendor_id: conversion.vendor_id,
            };
            let candidates = self.rules.active_rules_for(
                ctx.campaign_id,
                ctx.partner_tier,
                &ctx.event_type,
                as_of,
            );
            let Some(rule) = select_rule(&candidates, &ctx, as_of) else {
                warn!(
                    conversion_id = %conversion.id,
                    partner_id = %credit.partner_id,
                    "No commission rule matched"
                );
                unmatched.push(credit.partner_id);
                continue;
            };

            let trailing = self
                .snapshots
                .partner_net_total(&credit.partner_id, lookback_from, as_of);
            let amount =
                rule.action
                    .resolve(conversion.value, credit.weight, &conversion.currency, trailing)?;

            snapshots.push(EventCommissionSnapshot {
                id: Uuid::new_v4(),
                conversion_id: conversion.id,
                partner_id: credit.partner_id,
                vendor_id: conversion.vendor_id,
                campaign_id: conversion.campaign_id,
                kind: SnapshotKind::Original,
                reverses: None,
                rule_id: rule.id,
                rule_version: rule.version,
                attribution_model: distribution.model,
                attribution_weight: credit.weight,
                event_value: conversion.value,
                amount,
                currency: conversion.currency.clone(),
                conversion_occurred_at: conversion.occurred_at,
                created_at: now,
            });
        }

        if snapshots.is_empty() {
            if let Some(partner_id) = unmatched.first() {
                return Err(AffiliateError::NoMatchingRule {
                    conversion_id: conversion.id,
                    partner_id: *partner_id,
                });
            }
        }

        if !self.snapshots.insert_set(conversion.id, snapshots.clone()) {
            // Lost the race to a concurrent writer; theirs stands.
            let existing = self.existing_originals(&conversion.id);
            return Ok(self.noop(conversion.id, existing));
        }

        metrics::counter!("commission.snapshots_created").increment(snapshots.len() as u64);
        let outcome = CommissionOutcome {
            conversion_id: conversion.id,
            snapshots,
            unmatched_partners: unmatched,
            created: true,
        };
        info!(
            conversion_id = %conversion.id,
            snapshots = outcome.snapshots.len(),
            unmatched = outcome.unmatched_partners.len(),
            total = %outcome.total(),
            "Commission snapshots created"
        );
        Ok(outcome)
    }

    /// Append one compensating reversal per original snapshot. Returns the
    /// reversals written; empty if already reversed or nothing to reverse.
    pub fn reverse_conversion(
        &self,
        conversion_id: &Uuid,
    ) -> AffiliateResult<Vec<EventCommissionSnapshot>> {
        let originals = self.existing_originals(conversion_id);
        if originals.is_empty() {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let reversals: Vec<EventCommissionSnapshot> = originals
            .iter()
            .map(|o| EventCommissionSnapshot {
                id: Uuid::new_v4(),
                kind: SnapshotKind::Reversal,
                reverses: Some(o.id),
                amount: -o.amount,
                created_at: now,
                ..o.clone()
            })
            .collect();

        if !self.snapshots.append_reversals(*conversion_id, reversals.clone()) {
            debug!(conversion_id = %conversion_id, "Conversion already reversed");
            return Ok(Vec::new());
        }
        metrics::counter!("commission.reversals_created").increment(reversals.len() as u64);
        info!(
            conversion_id = %conversion_id,
            reversals = reversals.len(),
            "Commission reversed"
        );
        Ok(reversals)
    }

    fn existing_originals(&self, conversion_id: &Uuid) -> Vec<EventCommissionSnapshot> {
        self.snapshots
            .snapshots_for(conversion_id)
            .into_iter()
            .filter(|s| !s.is_reversal())
            .collect()
    }

    fn noop(
        &self,
        conversion_id: Uuid,
        existing: Vec<EventCommissionSnapshot>,
    ) -> CommissionOutcome {
        metrics::counter!("commission.idempotent_noop").increment(1);
        debug!(conversion_id = %conversion_id, "Snapshot set already exists, skipping");
        CommissionOutcome {
            conversion_id,
            snapshots: existing,
            unmatched_partners: Vec::new(),
            created: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{CommissionAction, CommissionRule, RuleCondition, TierBracket};
    use crate::store::{InMemoryRuleStore, InMemorySnapshotStore};
    use affiliate_core::store::InMemoryPartnerDirectory;
    use rust_decimal_macros::dec;

    struct Fixture {
        rules: Arc<InMemoryRuleStore>,
        snapshots: Arc<InMemorySnapshotStore>,
        partners: Arc<InMemoryPartnerDirectory>,
        engine: CommissionEngine,
    }

    fn fixture() -> Fixture {
        let rules = Arc::new(InMemoryRuleStore::new());
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let partners = Arc::new(InMemoryPartnerDirectory::new());
        let engine = CommissionEngine::new(
            &CommissionConfig::default(),
            rules.clone(),
            snapshots.clone(),
            partners.clone(),
        );
        Fixture {
            rules,
            snapshots,
            partners,
            engine,
        }
    }

    fn publish(
        store: &InMemoryRuleStore,
        conditions: Vec<RuleCondition>,
        action: CommissionAction,
    ) -> CommissionRule {
        let at = Utc::now() - Duration::days(60);
        store.publish(CommissionRule {
            id: Uuid::new_v4(),
            rule_key: Uuid::new_v4(),
            version: 0,
            name: "test".into(),
            conditions,
            action,
            valid_from: at,
            valid_until: None,
            active: true,
            created_at: at,
        })
    }

    fn approved(value: Decimal) -> ConversionEvent {
        ConversionEvent {
            id: Uuid::new_v4(),
            identity_key: "cookie".into(),
            vendor_id: Uuid::from_u128(1),
            campaign_id: Uuid::from_u128(2),
            event_type: "purchase".into(),
            commissionable: true,
            value,
            currency: "USD".into(),
            status: ConversionStatus::Approved,
            occurred_at: Utc::now(),
            attribution_model: None,
            attribution_confidence: None,
            review_reason: None,
        }
    }

    fn distribution(conversion: &ConversionEvent, credits: &[(u128, f64)]) -> CreditDistribution {
        CreditDistribution {
            conversion_id: conversion.id,
            model: AttributionModel::Linear,
            confidence: AttributionConfidence::High,
            credits: credits
                .iter()
                .map(|(p, w)| PartnerCredit {
                    partner_id: Uuid::from_u128(*p),
                    weight: *w,
                    touch_count: 1,
                })
                .collect(),
        }
    }

    #[test]
    fn test_percentage_split_and_idempotence() {
        let fx = fixture();
        publish(&fx.rules, vec![], CommissionAction::Percentage { rate: dec!(0.10) });
        let conv = approved(dec!(200.00));
        let dist = distribution(&conv, &[(10, 0.5), (11, 0.5)]);

        let first = fx.engine.compute_commissions(&conv, &dist).unwrap();
        assert!(first.created);
        assert_eq!(first.snapshots.len(), 2);
        assert!(first.snapshots.iter().all(|s| s.amount == dec!(10.00)));

        let second = fx.engine.compute_commissions(&conv, &dist).unwrap();
        assert!(!second.created);
        assert_eq!(second.total(), first.total());
        assert_eq!(fx.snapshots.count(), 2);
    }

    #[test]
    fn test_flat_ignores_weight() {
        let fx = fixture();
        publish(&fx.rules, vec![], CommissionAction::Flat { amount: dec!(4.00) });
        let conv = approved(dec!(80.00));
        let out = fx
            .engine
            .compute_commissions(&conv, &distribution(&conv, &[(10, 0.25), (11, 0.75)]))
            .unwrap();
        assert!(out.snapshots.iter().all(|s| s.amount == dec!(4.00)));
    }

    #[test]
    fn test_tiered_uses_trailing_total() {
        let fx = fixture();
        publish(
            &fx.rules,
            vec![],
            CommissionAction::Tiered {
                brackets: vec![
                    TierBracket { min_total: dec!(0), max_total: Some(dec!(15)), rate: dec!(0.10) },
                    TierBracket { min_total: dec!(15), max_total: None, rate: dec!(0.20) },
                ],
            },
        );
        let mut earlier = approved(dec!(200.00));
        earlier.occurred_at = Utc::now() - Duration::days(2);
        let out = fx
            .engine
            .compute_commissions(&earlier, &distribution(&earlier, &[(10, 1.0)]))
            .unwrap();
        assert_eq!(out.total(), dec!(20.00));

        let later = approved(dec!(100.00));
        let out = fx
            .engine
            .compute_commissions(&later, &distribution(&later, &[(10, 1.0)]))
            .unwrap();
        assert_eq!(out.total(), dec!(20.00));
    }

    #[test]
    fn test_partial_and_total_rule_miss() {
        let fx = fixture();
        fx.partners.upsert(Partner {
            id: Uuid::from_u128(10),
            name: "gold partner".into(),
            tier: PartnerTier::Gold,
            payout_processor: None,
            payout_account: "acct_10".into(),
        });
        publish(
            &fx.rules,
            vec![RuleCondition::PartnerTier(PartnerTier::Gold)],
            CommissionAction::Percentage { rate: dec!(0.10) },
        );
        let conv = approved(dec!(100.00));
        let out = fx
            .engine
            .compute_commissions(&conv, &distribution(&conv, &[(10, 0.5), (11, 0.5)]))
            .unwrap();
        assert_eq!(out.snapshots.len(), 1);
        assert_eq!(out.unmatched_partners, vec![Uuid::from_u128(11)]);

        let conv = approved(dec!(100.00));
        let err = fx
            .engine
            .compute_commissions(&conv, &distribution(&conv, &[(11, 1.0)]))
            .unwrap_err();
        assert!(matches!(err, AffiliateError::NoMatchingRule { .. }));
        assert!(fx.snapshots.snapshots_for(&conv.id).is_empty());
    }

    #[test]
    fn test_weight_overflow_is_integrity_violation() {
        let fx = fixture();
        publish(&fx.rules, vec![], CommissionAction::Percentage { rate: dec!(0.10) });
        let conv = approved(dec!(100.00));
        let err = fx
            .engine
            .compute_commissions(&conv, &distribution(&conv, &[(10, 0.7), (11, 0.7)]))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_pending_conversion_is_refused() {
        let fx = fixture();
        let mut conv = approved(dec!(100.00));
        conv.status = ConversionStatus::Pending;
        let err = fx
            .engine
            .compute_commissions(&conv, &distribution(&conv, &[(10, 1.0)]))
            .unwrap_err();
        assert_eq!(err.reason(), "invalid_transition");
    }

    #[test]
    fn test_reversal_appends_once() {
        let fx = fixture();
        publish(&fx.rules, vec![], CommissionAction::Percentage { rate: dec!(0.10) });
        let conv = approved(dec!(100.00));
        fx.engine
            .compute_commissions(&conv, &distribution(&conv, &[(10, 1.0)]))
            .unwrap();

        let reversals = fx.engine.reverse_conversion(&conv.id).unwrap();
        assert_eq!(reversals.len(), 1);
        assert_eq!(reversals[0].amount, dec!(-10.00));
        assert!(fx.engine.reverse_conversion(&conv.id).unwrap().is_empty());
        assert_eq!(fx.snapshots.snapshots_for(&conv.id).len(), 2);
        assert!(fx.snapshots.live_for_partner(&Uuid::from_u128(10)).is_empty());
    }
}
