use thiserror::Error;
use uuid::Uuid;

pub type AffiliateResult<T> = Result<T, AffiliateError>;

#[derive(Error, Debug)]
pub enum AffiliateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Conversion {0} has no eligible touches")]
    NoTouches(Uuid),

    #[error("Unknown attribution model: {0}")]
    InvalidModel(String),

    #[error("No active commission rule matches conversion {conversion_id} for partner {partner_id}")]
    NoMatchingRule { conversion_id: Uuid, partner_id: Uuid },

    #[error("No eligible commissions for partner {partner_id} in the requested period")]
    NoEligibleCommissions { partner_id: Uuid },

    #[error("Invalid payout period: {0}")]
    InvalidPeriod(String),

    #[error("Unknown payout processor: {0}")]
    UnknownProcessor(String),

    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Conversion not found: {0}")]
    ConversionNotFound(Uuid),

    #[error("Payout not found: {0}")]
    PayoutNotFound(String),

    #[error("Retry budget exhausted for payout {0}")]
    RetryBudgetExhausted(Uuid),

    #[error("Webhook rejected: {0}")]
    WebhookRejected(String),

    #[error("Integrity violation: {0}")]
    Integrity(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AffiliateError {
    /// Stable reason code surfaced to operators and stored on flagged records.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::NoTouches(_) => "no_touches",
            Self::InvalidModel(_) => "invalid_model",
            Self::NoMatchingRule { .. } => "no_matching_rule",
            Self::NoEligibleCommissions { .. } => "no_eligible_commissions",
            Self::InvalidPeriod(_) => "invalid_period",
            Self::UnknownProcessor(_) => "unknown_processor",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::ConversionNotFound(_) => "conversion_not_found",
            Self::PayoutNotFound(_) => "payout_not_found",
            Self::RetryBudgetExhausted(_) => "retry_budget_exhausted",
            Self::WebhookRejected(_) => "webhook_rejected",
            Self::Integrity(_) => "integrity_violation",
            Self::Serialization(_) => "serialization_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Integrity violations abort the operation and must be alerted on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }
}
