use affiliate_core::error::{AffiliateError, AffiliateResult};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PayoutStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Statuses whose claims block other payouts from the same snapshots.
    pub fn holds_claims(&self) -> bool {
        !matches!(self, Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutTrigger {
    Begin,
    Success,
    Failure,
    Retry,
    Cancel,
}

/// Describes a single valid payout transition.
#[derive(Debug, Clone, Copy)]
pub struct PayoutTransition {
    pub from: PayoutStatus,
    pub trigger: PayoutTrigger,
    pub to: PayoutStatus,
}

/// Every permitted payout transition. Anything else is rejected.
pub const TRANSITIONS: &[PayoutTransition] = &[
    PayoutTransition {
        from: PayoutStatus::Pending,
        trigger: PayoutTrigger::Begin,
        to: PayoutStatus::Processing,
    },
    PayoutTransition {
        from: PayoutStatus::Processing,
        trigger: PayoutTrigger::Success,
        to: PayoutStatus::Completed,
    },
    PayoutTransition {
        from: PayoutStatus::Processing,
        trigger: PayoutTrigger::Failure,
        to: PayoutStatus::Failed,
    },
    PayoutTransition {
        from: PayoutStatus::Failed,
        trigger: PayoutTrigger::Retry,
        to: PayoutStatus::Processing,
    },
    PayoutTransition {
        from: PayoutStatus::Pending,
        trigger: PayoutTrigger::Cancel,
        to: PayoutStatus::Failed,
    },
];

pub fn can_transition(from: PayoutStatus, trigger: PayoutTrigger) -> bool {
    TRANSITIONS
        .iter()
        .any(|t| t.from == from && t.trigger == trigger)
}

/// Resolve the status `trigger` moves `from` to.
pub fn next_status(from: PayoutStatus, trigger: PayoutTrigger) -> AffiliateResult<PayoutStatus> {
    TRANSITIONS
        .iter()
        .find(|t| t.from == from && t.trigger == trigger)
        .map(|t| t.to)
        .ok_or_else(|| AffiliateError::InvalidTransition {
            entity: "payout",
            from: from.to_string(),
            to: format!("{trigger:?}").to_lowercase(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let s = next_status(PayoutStatus::Pending, PayoutTrigger::Begin).unwrap();
        assert_eq!(s, PayoutStatus::Processing);
        let s = next_status(s, PayoutTrigger::Success).unwrap();
        assert_eq!(s, PayoutStatus::Completed);
    }

    #[test]
    fn test_retry_and_cancel() {
        let s = next_status(PayoutStatus::Processing, PayoutTrigger::Failure).unwrap();
        assert_eq!(next_status(s, PayoutTrigger::Retry).unwrap(), PayoutStatus::Processing);
        assert_eq!(
            next_status(PayoutStatus::Pending, PayoutTrigger::Cancel).unwrap(),
            PayoutStatus::Failed
        );
    }

    #[test]
    fn test_terminal_states_reject_everything_but_retry() {
        for trigger in [
            PayoutTrigger::Begin,
            PayoutTrigger::Success,
            PayoutTrigger::Failure,
            PayoutTrigger::Retry,
            PayoutTrigger::Cancel,
        ] {
            assert!(!can_transition(PayoutStatus::Completed, trigger));
        }
        assert!(!can_transition(PayoutStatus::Failed, PayoutTrigger::Success));
        assert!(!can_transition(PayoutStatus::Processing, PayoutTrigger::Cancel));
        assert!(next_status(PayoutStatus::Completed, PayoutTrigger::Failure).is_err());
    }
}
