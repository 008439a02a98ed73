//! Payouts — batches approved commission snapshots into per-partner payouts
//! and settles them through pluggable payment providers.
//!
//! Providers are selected by name from a [`ProcessorRegistry`]; adding one
//! means implementing [`PayoutProcessor`] and registering it. Webhooks are
//! authenticated with HMAC-SHA256 before any state changes.

pub mod ledger;
pub mod processor;
pub mod providers;
pub mod retry;
pub mod settlement;
pub mod signature;
pub mod state_machine;

pub use ledger::{Payout, PayoutEvent, PayoutLedger};
pub use processor::{
    PayoutProcessor, PayoutRequest, ProcessorRegistry, ProviderError, ProviderPayoutResult,
    ProviderPayoutStatus, ProviderWebhookEvent,
};
pub use providers::{
    register_configured, PayPalPayoutsProcessor, StripeConnectProcessor, WireTransferProcessor,
};
pub use retry::RetryPolicy;
pub use settlement::{CancelOutcome, PayoutResult, PayoutSettlement, WebhookOutcome};
pub use state_machine::PayoutStatus;
