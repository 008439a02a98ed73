//! Funnel journeys — the ordered touches behind one identity key, and the
//! eligible-touch lookup the attribution engine consumes.

use affiliate_core::error::{AffiliateError, AffiliateResult};
use affiliate_core::types::{ConversionEvent, FunnelJourney, Touch};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

/// Source of the touches eligible for a conversion.
pub trait TouchStore: Send + Sync {
    /// Touches of the conversion's identity that occurred before it and
    /// inside the active window, ascending by `(occurred_at, id)`.
    fn list_eligible_touches(&self, conversion: &ConversionEvent) -> Vec<Touch>;
}

/// Append-only journey tracker backed by `DashMap`.
pub struct JourneyTracker {
    journeys: DashMap<String, FunnelJourney>,
    touches: DashMap<String, Vec<Touch>>,
    window_days: u32,
}

impl JourneyTracker {
    pub fn new(window_days: u32) -> Self {
        Self {
            journeys: DashMap::new(),
            touches: DashMap::new(),
            window_days,
        }
    }

    /// Append a touch to its identity's journey, opening the journey if needed.
    pub fn record_touch(&self, touch: Touch) {
        let key = touch.identity_key.clone();
        let at = touch.occurred_at;

        {
            let mut journey = self
                .journeys
                .entry(key.clone())
                .or_insert_with(|| FunnelJourney {
                    id: Uuid::new_v4(),
                    identity_key: key.clone(),
                    started_at: at,
                    completed_at: None,
                    conversion_id: None,
                    touch_count: 0,
                    total_commission: Decimal::ZERO,
                });
            journey.touch_count += 1;
            if at < journey.started_at {
                journey.started_at = at;
            }
        }

        let mut list = self.touches.entry(key.clone()).or_default();
        let pos = list.partition_point(|t| (t.occurred_at, t.id) <= (at, touch.id));
        debug!(
            identity = %key,
            touch_id = %touch.id,
            partner_id = %touch.partner_id,
            "Touch recorded"
        );
        list.insert(pos, touch);
    }

    /// Close the journey with its terminal conversion. Returns `false` when the
    /// journey was already completed.
    pub fn mark_completed(&self, conversion: &ConversionEvent) -> AffiliateResult<bool> {
        let mut journey = self
            .journeys
            .get_mut(&conversion.identity_key)
            .ok_or(AffiliateError::NoTouches(conversion.id))?;
        if journey.completed_at.is_some() {
            return Ok(false);
        }
        journey.completed_at = Some(conversion.occurred_at);
        journey.conversion_id = Some(conversion.id);
        info!(
            identity = %conversion.identity_key,
            conversion_id = %conversion.id,
            touches = journey.touch_count,
            "Funnel journey completed"
        );
        Ok(true)
    }

    /// Add committed commission (negative for reversals) to the running total.
    pub fn add_commission(&self, identity_key: &str, amount: Decimal) {
        if let Some(mut journey) = self.journeys.get_mut(identity_key) {
            journey.total_commission += amount;
        }
    }

    pub fn journey(&self, identity_key: &str) -> Option<FunnelJourney> {
        self.journeys.get(identity_key).map(|j| j.clone())
    }

    pub fn touches_before(&self, identity_key: &str, before: DateTime<Utc>) -> Vec<Touch> {
        let cutoff = before - Duration::days(self.window_days as i64);
        self.touches
            .get(identity_key)
            .map(|list| {
                list.iter()
                    .filter(|t| t.occurred_at < before && t.occurred_at >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl TouchStore for JourneyTracker {
    fn list_eligible_touches(&self, conversion: &ConversionEvent) -> Vec<Touch> {
        self.touches_before(&conversion.identity_key, conversion.occurred_at)
    }
}
