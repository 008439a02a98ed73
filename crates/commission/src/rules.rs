//! Commission rules: tagged conditions evaluated by a small interpreter, and
//! the flat / percentage / tiered actions that turn a match into an amount.

use std::cmp::Reverse;

use affiliate_core::error::{AffiliateError, AffiliateResult};
use affiliate_core::money::{percentage_of, round_minor};
use affiliate_core::types::PartnerTier;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One predicate of a rule. A rule matches when all of its conditions do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RuleCondition {
    Campaign(Uuid),
    PartnerTier(PartnerTier),
    EventType(String),
    Vendor(Uuid),
}

/// The facts a rule is evaluated against.
#[derive(Debug, Clone)]
pub struct RuleContext {
    pub campaign_id: Uuid,
    pub partner_tier: PartnerTier,
    pub event_type: String,
    pub vendor_id: Uuid,
}

impl RuleCondition {
    pub fn matches(&self, ctx: &RuleContext) -> bool {
        match self {
            Self::Campaign(id) => *id == ctx.campaign_id,
            Self::PartnerTier(tier) => *tier == ctx.partner_tier,
            Self::EventType(kind) => kind.eq_ignore_ascii_case(&ctx.event_type),
            Self::Vendor(id) => *id == ctx.vendor_id,
        }
    }
}

/// `[min_total, max_total)` bracket over the partner's trailing commission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierBracket {
    pub min_total: Decimal,
    pub max_total: Option<Decimal>,
    pub rate: Decimal,
}

impl TierBracket {
    pub fn contains(&self, total: Decimal) -> bool {
        total >= self.min_total && self.max_total.map_or(true, |max| total < max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "commission_type", rename_all = "snake_case")]
pub enum CommissionAction {
    Flat { amount: Decimal },
    Percentage { rate: Decimal },
    Tiered { brackets: Vec<TierBracket> },
}

impl CommissionAction {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Flat { .. } => "flat",
            Self::Percentage { .. } => "percentage",
            Self::Tiered { .. } => "tiered",
        }
    }

    /// Resolve the amount owed. `trailing_total` is only read by tiered rules.
    pub fn resolve(
        &self,
        event_value: Decimal,
        weight: f64,
        currency: &str,
        trailing_total: Decimal,
    ) -> AffiliateResult<Decimal> {
        match self {
            Self::Flat { amount } => Ok(round_minor(*amount, currency)),
            Self::Percentage { rate } => percentage_of(event_value, *rate, weight, currency),
            Self::Tiered { brackets } => {
                let bracket = brackets
                    .iter()
                    .find(|b| b.contains(trailing_total))
                    .ok_or_else(|| {
                        AffiliateError::Config(format!(
                            "no tier bracket covers trailing total {trailing_total}"
                        ))
                    })?;
                percentage_of(event_value, bracket.rate, weight, currency)
            }
        }
    }
}

/// A versioned, time-bounded commission policy. Never mutated by evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionRule {
    /// Unique per published version.
    pub id: Uuid,
    /// Stable across versions of the same rule.
    pub rule_key: Uuid,
    pub version: u32,
    pub name: String,
    pub conditions: Vec<RuleCondition>,
    pub action: CommissionAction,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl CommissionRule {
    pub fn is_live(&self, as_of: DateTime<Utc>) -> bool {
        self.active && self.valid_from <= as_of && self.valid_until.map_or(true, |end| as_of < end)
    }

    pub fn matches(&self, ctx: &RuleContext) -> bool {
        self.conditions.iter().all(|c| c.matches(ctx))
    }

    pub fn specificity(&self) -> usize {
        self.conditions.len()
    }
}

/// Highest-priority live rule matching `ctx`: most conditions, then newest,
/// then lowest id.
pub fn select_rule<'a>(
    rules: &'a [CommissionRule],
    ctx: &RuleContext,
    as_of: DateTime<Utc>,
) -> Option<&'a CommissionRule> {
    rules
        .iter()
        .filter(|r| r.is_live(as_of) && r.matches(ctx))
        .max_by_key(|r| (r.specificity(), r.created_at, Reverse(r.id)))
}
