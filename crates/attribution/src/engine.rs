//! Attribution engine — splits credit for one conversion among the partners
//! behind its touches. Pure: no writes, same inputs give the same output.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use affiliate_core::config::AttributionConfig;
use affiliate_core::error::{AffiliateError, AffiliateResult};
use affiliate_core::types::*;
use tracing::debug;
use uuid::Uuid;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

pub struct AttributionEngine {
    half_life_days: f64,
}

impl AttributionEngine {
    pub fn new(config: &AttributionConfig) -> Self {
        Self::with_half_life(config.half_life_days)
    }

    pub fn with_half_life(half_life_days: f64) -> Self {
        Self { half_life_days }
    }

    pub fn half_life_days(&self) -> f64 {
        self.half_life_days
    }

    /// Attribute using a model name as received from a caller.
    pub fn attribute_named(
        &self,
        conversion: &ConversionEvent,
        touches: &[Touch],
        model: &str,
    ) -> AffiliateResult<CreditDistribution> {
        let model: AttributionModel = model.parse()?;
        self.attribute(conversion, touches, model)
    }

    pub fn attribute(
        &self,
        conversion: &ConversionEvent,
        touches: &[Touch],
        model: AttributionModel,
    ) -> AffiliateResult<CreditDistribution> {
        if touches.is_empty() {
            return Err(AffiliateError::NoTouches(conversion.id));
        }

        let mut ordered: Vec<&Touch> = touches.iter().collect();
        ordered.sort_by_key(|t| (t.occurred_at, t.id));

        let per_touch: Vec<(Uuid, f64)> = match model {
            AttributionModel::FirstClick => {
                let winner = ordered
                    .iter()
                    .min_by_key(|t| (t.occurred_at, t.id))
                    .map(|t| t.partner_id);
                winner.into_iter().map(|p| (p, 1.0)).collect()
            }
            AttributionModel::LastClick => {
                let winner = ordered
                    .iter()
                    .min_by_key(|t| (Reverse(t.occurred_at), t.id))
                    .map(|t| t.partner_id);
                winner.into_iter().map(|p| (p, 1.0)).collect()
            }
            AttributionModel::Linear => {
                let share = 1.0 / ordered.len() as f64;
                ordered.iter().map(|t| (t.partner_id, share)).collect()
            }
            AttributionModel::TimeDecay => self.time_decay_weights(conversion, &ordered),
        };

        let mut by_partner: BTreeMap<Uuid, (f64, u32)> = BTreeMap::new();
        for (partner_id, weight) in per_touch {
            let slot = by_partner.entry(partner_id).or_insert((0.0, 0));
            slot.0 += weight;
            slot.1 += 1;
        }
        // Single-winner models still report how many touches each partner had.
        if matches!(model, AttributionModel::FirstClick | AttributionModel::LastClick) {
            for slot in by_partner.values_mut() {
                slot.1 = 0;
            }
            for t in &ordered {
                if let Some(slot) = by_partner.get_mut(&t.partner_id) {
                    slot.1 += 1;
                }
            }
        }

        let confidence = if ordered.len() == 1
            && matches!(model, AttributionModel::Linear | AttributionModel::TimeDecay)
        {
            AttributionConfidence::Low
        } else {
            AttributionConfidence::High
        };

        let credits: Vec<PartnerCredit> = by_partner
            .into_iter()
            .map(|(partner_id, (weight, touch_count))| PartnerCredit {
                partner_id,
                weight,
                touch_count,
            })
            .collect();

        metrics::counter!("attribution.conversions", "model" => model.as_str()).increment(1);
        debug!(
            conversion_id = %conversion.id,
            model = %model,
            touches = ordered.len(),
            partners = credits.len(),
            "Conversion attributed"
        );

        Ok(CreditDistribution {
            conversion_id: conversion.id,
            model,
            confidence,
            credits,
        })
    }

    /// `2^(-Δt / half_life)` per touch, anchored at conversion time, normalized.
    fn time_decay_weights(
        &self,
        conversion: &ConversionEvent,
        touches: &[&Touch],
    ) -> Vec<(Uuid, f64)> {
        let raw: Vec<(Uuid, f64)> = touches
            .iter()
            .map(|t| {
                let age_days = ((conversion.occurred_at - t.occurred_at).num_milliseconds() as f64
                    / MILLIS_PER_DAY)
                    .max(0.0);
                (t.partner_id, (-age_days / self.half_life_days).exp2())
            })
            .collect();
        let total: f64 = raw.iter().map(|(_, w)| w).sum();
        if total <= 0.0 || !total.is_finite() {
            // Every touch decayed to zero; fall back to an even split.
            let share = 1.0 / raw.len() as f64;
            return raw.into_iter().map(|(p, _)| (p, share)).collect();
        }
        raw.into_iter().map(|(p, w)| (p, w / total)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use rust_decimal_macros::dec;

    fn conversion(at: DateTime<Utc>) -> ConversionEvent {
        ConversionEvent {
            id: Uuid::from_u128(900),
            identity_key: "cookie-abc".into(),
            vendor_id: Uuid::from_u128(1),
            campaign_id: Uuid::from_u128(2),
            event_type: "purchase".into(),
            commissionable: true,
            value: dec!(100.00),
            currency: "USD".into(),
            status: ConversionStatus::Approved,
            occurred_at: at,
            attribution_model: None,
            attribution_confidence: None,
            review_reason: None,
        }
    }

    fn touch(id: u128, partner: u128, at: DateTime<Utc>) -> Touch {
        Touch {
            id: Uuid::from_u128(id),
            identity_key: "cookie-abc".into(),
            partner_id: Uuid::from_u128(partner),
            campaign_id: Uuid::from_u128(2),
            campaign_version: 1,
            kind: TouchKind::Click,
            occurred_at: at,
            value: None,
        }
    }

    fn engine() -> AttributionEngine {
        AttributionEngine::with_half_life(7.0)
    }

    #[test]
    fn test_empty_touches_fail() {
        let now = Utc::now();
        let err = engine()
            .attribute(&conversion(now), &[], AttributionModel::Linear)
            .unwrap_err();
        assert!(matches!(err, AffiliateError::NoTouches(_)));
    }

    #[test]
    fn test_unknown_model_name() {
        let now = Utc::now();
        let touches = vec![touch(1, 10, now - Duration::days(1))];
        let err = engine()
            .attribute_named(&conversion(now), &touches, "u_shaped")
            .unwrap_err();
        assert!(matches!(err, AffiliateError::InvalidModel(_)));
    }

    #[test]
    fn test_weights_sum_to_one_for_every_model() {
        let now = Utc::now();
        let touches = vec![
            touch(1, 10, now - Duration::days(20)),
            touch(2, 11, now - Duration::days(9)),
            touch(3, 10, now - Duration::hours(30)),
            touch(4, 12, now - Duration::minutes(5)),
        ];
        for model in AttributionModel::ALL {
            let dist = engine().attribute(&conversion(now), &touches, *model).unwrap();
            assert!((dist.total_weight() - 1.0).abs() < 1e-6, "model {model}");
            assert!(dist.credits.iter().all(|c| (0.0..=1.0).contains(&c.weight)));
        }
    }

    #[test]
    fn test_first_and_last_click_tie_break_on_lowest_id() {
        let now = Utc::now();
        let t0 = now - Duration::days(3);
        let t1 = now - Duration::days(1);
        // Two touches share the earliest and two share the latest timestamp.
        let touches = vec![
            touch(7, 20, t0),
            touch(5, 21, t0),
            touch(9, 22, t1),
            touch(8, 23, t1),
        ];
        let mut reversed = touches.clone();
        reversed.reverse();

        for input in [&touches, &reversed] {
            let first = engine()
                .attribute(&conversion(now), input, AttributionModel::FirstClick)
                .unwrap();
            assert_eq!(first.weight_for(&Uuid::from_u128(21)), Some(1.0));

            let last = engine()
                .attribute(&conversion(now), input, AttributionModel::LastClick)
                .unwrap();
            assert_eq!(last.weight_for(&Uuid::from_u128(23)), Some(1.0));
        }
    }

    #[test]
    fn test_linear_distinct_and_single_partner() {
        let now = Utc::now();
        let distinct = vec![
            touch(1, 10, now - Duration::days(3)),
            touch(2, 11, now - Duration::days(2)),
            touch(3, 12, now - Duration::days(1)),
        ];
        let dist = engine()
            .attribute(&conversion(now), &distinct, AttributionModel::Linear)
            .unwrap();
        for c in &dist.credits {
            assert!((c.weight - 1.0 / 3.0).abs() < 1e-9);
        }

        let same = vec![
            touch(1, 10, now - Duration::days(3)),
            touch(2, 10, now - Duration::days(2)),
        ];
        let dist = engine()
            .attribute(&conversion(now), &same, AttributionModel::Linear)
            .unwrap();
        assert_eq!(dist.credits.len(), 1);
        assert!((dist.credits[0].weight - 1.0).abs() < 1e-9);
        assert_eq!(dist.credits[0].touch_count, 2);
        assert_eq!(dist.confidence, AttributionConfidence::High);
    }

    #[test]
    fn test_time_decay_monotonic_and_half_life() {
        let now = Utc::now();
        let touches = vec![
            touch(1, 10, now - Duration::days(14)),
            touch(2, 11, now - Duration::days(7)),
            touch(3, 12, now),
        ];
        let dist = engine()
            .attribute(&conversion(now), &touches, AttributionModel::TimeDecay)
            .unwrap();
        let w14 = dist.weight_for(&Uuid::from_u128(10)).unwrap();
        let w7 = dist.weight_for(&Uuid::from_u128(11)).unwrap();
        let w0 = dist.weight_for(&Uuid::from_u128(12)).unwrap();
        assert!(w0 > w7 && w7 > w14);
        // Raw weights 1, 0.5, 0.25 normalize to 4/7, 2/7, 1/7.
        assert!((w0 - 4.0 / 7.0).abs() < 1e-9);
        assert!((w7 - 2.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_touch_confidence() {
        let now = Utc::now();
        let touches = vec![touch(1, 10, now - Duration::days(2))];
        let linear = engine()
            .attribute(&conversion(now), &touches, AttributionModel::Linear)
            .unwrap();
        assert_eq!(linear.confidence, AttributionConfidence::Low);
        let last = engine()
            .attribute(&conversion(now), &touches, AttributionModel::LastClick)
            .unwrap();
        assert_eq!(last.confidence, AttributionConfidence::High);
        assert_eq!(last.weight_for(&Uuid::from_u128(10)), Some(1.0));
    }
}
