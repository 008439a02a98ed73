use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AffiliateError;

// ─── Attribution ────────────────────────────────────────────────────────────

/// Rule for splitting conversion credit among touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionModel {
    FirstClick,
    LastClick,
    Linear,
    TimeDecay,
}

impl AttributionModel {
    pub const ALL: &'static [AttributionModel] = &[
        Self::FirstClick,
        Self::LastClick,
        Self::Linear,
        Self::TimeDecay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstClick => "first_click",
            Self::LastClick => "last_click",
            Self::Linear => "linear",
            Self::TimeDecay => "time_decay",
        }
    }
}

impl fmt::Display for AttributionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttributionModel {
    type Err = AffiliateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| AffiliateError::InvalidModel(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributionConfidence {
    High,
    /// A single touch forced a degenerate split for a multi-touch model.
    Low,
}

/// Credit owed to one partner for one conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerCredit {
    pub partner_id: Uuid,
    pub weight: f64,
    pub touch_count: u32,
}

/// Output of the attribution engine: partner weights summing to 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditDistribution {
    pub conversion_id: Uuid,
    pub model: AttributionModel,
    pub confidence: AttributionConfidence,
    /// Ordered by partner id.
    pub credits: Vec<PartnerCredit>,
}

impl CreditDistribution {
    pub fn total_weight(&self) -> f64 {
        self.credits.iter().map(|c| c.weight).sum()
    }

    pub fn weight_for(&self, partner_id: &Uuid) -> Option<f64> {
        self.credits
            .iter()
            .find(|c| &c.partner_id == partner_id)
            .map(|c| c.weight)
    }
}

// ─── Tracking boundary ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TouchKind {
    Click,
    CookieVisit,
    /// An earlier conversion acting as a mid-funnel signal.
    Conversion,
}

/// One attribution-eligible event. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Touch {
    pub id: Uuid,
    pub identity_key: String,
    pub partner_id: Uuid,
    pub campaign_id: Uuid,
    pub campaign_version: u32,
    pub kind: TouchKind,
    pub occurred_at: DateTime<Utc>,
    pub value: Option<Decimal>,
}

/// Ordered touches sharing an identity key, leading to at most one conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelJourney {
    pub id: Uuid,
    pub identity_key: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub conversion_id: Option<Uuid>,
    pub touch_count: u32,
    pub total_commission: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionStatus {
    Pending,
    Approved,
    Rejected,
    Paid,
}

impl ConversionStatus {
    pub fn can_transition(&self, to: ConversionStatus) -> bool {
        use ConversionStatus::*;
        matches!(
            (self, to),
            (Pending, Approved) | (Pending, Rejected) | (Approved, Rejected) | (Approved, Paid)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Paid)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Paid => "paid",
        }
    }
}

impl fmt::Display for ConversionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A business event (purchase, signup, ...) that may earn commission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionEvent {
    pub id: Uuid,
    pub identity_key: String,
    pub vendor_id: Uuid,
    pub campaign_id: Uuid,
    pub event_type: String,
    pub commissionable: bool,
    pub value: Decimal,
    pub currency: String,
    pub status: ConversionStatus,
    pub occurred_at: DateTime<Utc>,
    pub attribution_model: Option<AttributionModel>,
    pub attribution_confidence: Option<AttributionConfidence>,
    /// Set when the conversion needs manual review (no touches, no rule).
    pub review_reason: Option<String>,
}

// ─── Partners ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartnerTier {
    #[default]
    Standard,
    Silver,
    Gold,
    Platinum,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partner {
    pub id: Uuid,
    pub name: String,
    pub tier: PartnerTier,
    /// Registry key of the processor used to pay this partner.
    pub payout_processor: Option<String>,
    pub payout_account: String,
}

// ─── Commission snapshots ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    Original,
    Reversal,
}

/// Immutable commission owed for one (conversion, partner) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventCommissionSnapshot {
    pub id: Uuid,
    pub conversion_id: Uuid,
    pub partner_id: Uuid,
    pub vendor_id: Uuid,
    pub campaign_id: Uuid,
    pub kind: SnapshotKind,
    /// The original snapshot this one compensates, for reversals.
    pub reverses: Option<Uuid>,
    pub rule_id: Uuid,
    pub rule_version: u32,
    pub attribution_model: AttributionModel,
    pub attribution_weight: f64,
    pub event_value: Decimal,
    pub amount: Decimal,
    pub currency: String,
    pub conversion_occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl EventCommissionSnapshot {
    pub fn is_reversal(&self) -> bool {
        self.kind == SnapshotKind::Reversal
    }
}
