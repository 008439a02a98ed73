//! Boundary stores owned by the tracking side: conversions and partners.
//! In-memory implementations are backed by `DashMap`; a database-backed
//! implementation plugs in behind the same traits.

use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AffiliateError, AffiliateResult};
use crate::types::*;

pub trait ConversionStore: Send + Sync {
    fn get(&self, id: &Uuid) -> Option<ConversionEvent>;

    fn insert(&self, conversion: ConversionEvent);

    /// Apply one status transition. Fails if the move is not allowed from the
    /// currently stored status.
    fn transition(&self, id: &Uuid, to: ConversionStatus) -> AffiliateResult<ConversionEvent>;

    fn record_attribution(
        &self,
        id: &Uuid,
        model: AttributionModel,
        confidence: AttributionConfidence,
    ) -> AffiliateResult<()>;

    fn flag_for_review(&self, id: &Uuid, reason: &str) -> AffiliateResult<()>;
}

pub trait PartnerDirectory: Send + Sync {
    fn get(&self, id: &Uuid) -> Option<Partner>;

    fn tier_of(&self, id: &Uuid) -> PartnerTier {
        self.get(id).map(|p| p.tier).unwrap_or_default()
    }
}

#[derive(Default)]
pub struct InMemoryConversionStore {
    conversions: DashMap<Uuid, ConversionEvent>,
}

impl InMemoryConversionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Vec<ConversionEvent> {
        self.conversions.iter().map(|e| e.value().clone()).collect()
    }
}

impl ConversionStore for InMemoryConversionStore {
    fn get(&self, id: &Uuid) -> Option<ConversionEvent> {
        self.conversions.get(id).map(|c| c.clone())
    }

    fn insert(&self, conversion: ConversionEvent) {
        debug!(conversion_id = %conversion.id, "Conversion recorded");
        self.conversions.insert(conversion.id, conversion);
    }

    fn transition(&self, id: &Uuid, to: ConversionStatus) -> AffiliateResult<ConversionEvent> {
        let mut entry = self
            .conversions
            .get_mut(id)
            .ok_or(AffiliateError::ConversionNotFound(*id))?;
        let from = entry.status;
        if !from.can_transition(to) {
            return Err(AffiliateError::InvalidTransition {
                entity: "conversion",
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        entry.status = to;
        info!(conversion_id = %id, from = %from, to = %to, "Conversion status changed");
        Ok(entry.clone())
    }

    fn record_attribution(
        &self,
        id: &Uuid,
        model: AttributionModel,
        confidence: AttributionConfidence,
    ) -> AffiliateResult<()> {
        let mut entry = self
            .conversions
            .get_mut(id)
            .ok_or(AffiliateError::ConversionNotFound(*id))?;
        entry.attribution_model = Some(model);
        entry.attribution_confidence = Some(confidence);
        Ok(())
    }

    fn flag_for_review(&self, id: &Uuid, reason: &str) -> AffiliateResult<()> {
        let mut entry = self
            .conversions
            .get_mut(id)
            .ok_or(AffiliateError::ConversionNotFound(*id))?;
        warn!(conversion_id = %id, reason, "Conversion flagged for review");
        entry.review_reason = Some(reason.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryPartnerDirectory {
    partners: DashMap<Uuid, Partner>,
}

impl InMemoryPartnerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, partner: Partner) {
        self.partners.insert(partner.id, partner);
    }
}

impl PartnerDirectory for InMemoryPartnerDirectory {
    fn get(&self, id: &Uuid) -> Option<Partner> {
        self.partners.get(id).map(|p| p.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn conversion() -> ConversionEvent {
        ConversionEvent {
            id: Uuid::new_v4(),
            identity_key: "cookie-1".into(),
            vendor_id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            event_type: "purchase".into(),
            commissionable: true,
            value: dec!(50.00),
            currency: "USD".into(),
            status: ConversionStatus::Pending,
            occurred_at: Utc::now(),
            attribution_model: None,
            attribution_confidence: None,
            review_reason: None,
        }
    }

    #[test]
    fn test_transition_rules_enforced() {
        let store = InMemoryConversionStore::new();
        let c = conversion();
        let id = c.id;
        store.insert(c);

        assert!(store.transition(&id, ConversionStatus::Paid).is_err());
        store.transition(&id, ConversionStatus::Approved).unwrap();
        store.transition(&id, ConversionStatus::Paid).unwrap();
        let err = store.transition(&id, ConversionStatus::Rejected).unwrap_err();
        assert_eq!(err.reason(), "invalid_transition");
        assert_eq!(store.get(&id).unwrap().status, ConversionStatus::Paid);
    }

    #[test]
    fn test_unknown_partner_is_standard_tier() {
        let dir = InMemoryPartnerDirectory::new();
        assert_eq!(dir.tier_of(&Uuid::new_v4()), PartnerTier::Standard);
    }
}
