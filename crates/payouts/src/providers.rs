//! Provider implementations for each payout rail.
//! Each provider translates a payout request to its platform's API and is
//! idempotent on the request's `reference`.

use std::sync::Arc;

use affiliate_core::config::{ProviderConfig, ProvidersConfig};
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::processor::*;
use crate::signature::verify_hmac_signature;

/// Bookkeeping shared by the simulated rails: transactions by id and the
/// reference → transaction map that makes submissions idempotent.
struct RailLedger {
    transactions: DashMap<String, ProviderPayoutResult>,
    by_reference: DashMap<String, String>,
}

impl RailLedger {
    fn new() -> Self {
        Self {
            transactions: DashMap::new(),
            by_reference: DashMap::new(),
        }
    }

    fn submit(
        &self,
        request: &PayoutRequest,
        tx_prefix: &str,
        initial: ProviderPayoutStatus,
    ) -> Result<ProviderPayoutResult, ProviderError> {
        if let Some(tx) = self.by_reference.get(&request.reference) {
            if let Some(existing) = self.transactions.get(tx.value()) {
                return Ok(existing.clone());
            }
        }
        if request.destination_account.trim().is_empty() {
            return Err(ProviderError::Permanent(
                "invalid destination account".to_string(),
            ));
        }
        if request.amount <= Decimal::ZERO {
            return Err(ProviderError::Permanent("amount must be positive".to_string()));
        }
        let result = ProviderPayoutResult {
            provider_transaction_id: format!("{tx_prefix}{}", Uuid::new_v4().simple()),
            status: initial,
            failure_reason: None,
        };
        self.by_reference
            .insert(request.reference.clone(), result.provider_transaction_id.clone());
        self.transactions
            .insert(result.provider_transaction_id.clone(), result.clone());
        Ok(result)
    }

    fn status(&self, tx: &str) -> Result<ProviderPayoutResult, ProviderError> {
        self.transactions
            .get(tx)
            .map(|r| r.clone())
            .ok_or_else(|| ProviderError::Permanent(format!("unknown transaction {tx}")))
    }

    fn cancel_if_pending(&self, tx: &str) -> Result<bool, ProviderError> {
        let mut entry = self
            .transactions
            .get_mut(tx)
            .ok_or_else(|| ProviderError::Permanent(format!("unknown transaction {tx}")))?;
        if entry.status != ProviderPayoutStatus::Pending {
            return Ok(false);
        }
        entry.status = ProviderPayoutStatus::Failed;
        entry.failure_reason = Some("cancelled".to_string());
        Ok(true)
    }

    fn settle(&self, tx: &str, status: ProviderPayoutStatus, reason: Option<String>) -> bool {
        match self.transactions.get_mut(tx) {
            Some(mut entry) => {
                entry.status = status;
                entry.failure_reason = reason;
                true
            }
            None => false,
        }
    }
}

// ─── Stripe Connect ─────────────────────────────────────────────────────────

/// Stripe Connect transfers settle synchronously and cannot be cancelled.
pub struct StripeConnectProcessor {
    config: ProviderConfig,
    ledger: RailLedger,
}

impl StripeConnectProcessor {
    pub const NAME: &'static str = "stripe_connect";

    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            ledger: RailLedger::new(),
        }
    }
}

#[async_trait]
impl PayoutProcessor for StripeConnectProcessor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn process_payout(
        &self,
        request: &PayoutRequest,
    ) -> Result<ProviderPayoutResult, ProviderError> {
        debug!(
            provider = Self::NAME,
            api_base = %self.config.api_base,
            reference = %request.reference,
            amount = %request.amount,
            "Creating Stripe Connect transfer"
        );
        // In production: POST {api_base}/transfers with Idempotency-Key = reference
        self.ledger
            .submit(request, "tr_", ProviderPayoutStatus::Completed)
    }

    async fn retrieve_payout_status(
        &self,
        provider_transaction_id: &str,
    ) -> Result<ProviderPayoutResult, ProviderError> {
        self.ledger.status(provider_transaction_id)
    }

    async fn cancel_payout(&self, provider_transaction_id: &str) -> Result<bool, ProviderError> {
        // Transfers are final once created; only a reversal could undo one.
        self.ledger.status(provider_transaction_id).map(|_| false)
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        verify_hmac_signature(&self.config.webhook_secret, payload, signature)
    }
}

// ─── PayPal Payouts ─────────────────────────────────────────────────────────

/// PayPal batch payouts are accepted as pending and settle by webhook.
pub struct PayPalPayoutsProcessor {
    config: ProviderConfig,
    ledger: RailLedger,
}

impl PayPalPayoutsProcessor {
    pub const NAME: &'static str = "paypal";

    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            ledger: RailLedger::new(),
        }
    }

    /// Simulate PayPal finishing a batch item.
    pub fn settle(&self, tx: &str, status: ProviderPayoutStatus, reason: Option<String>) -> bool {
        self.ledger.settle(tx, status, reason)
    }
}

#[async_trait]
impl PayoutProcessor for PayPalPayoutsProcessor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn process_payout(
        &self,
        request: &PayoutRequest,
    ) -> Result<ProviderPayoutResult, ProviderError> {
        debug!(
            provider = Self::NAME,
            api_base = %self.config.api_base,
            reference = %request.reference,
            amount = %request.amount,
            "Submitting PayPal payout batch"
        );
        // In production: POST {api_base}/payments/payouts with sender_batch_id = reference
        self.ledger
            .submit(request, "PAYOUTBATCH-", ProviderPayoutStatus::Pending)
    }

    async fn retrieve_payout_status(
        &self,
        provider_transaction_id: &str,
    ) -> Result<ProviderPayoutResult, ProviderError> {
        self.ledger.status(provider_transaction_id)
    }

    async fn cancel_payout(&self, provider_transaction_id: &str) -> Result<bool, ProviderError> {
        // Unclaimed items can be cancelled.
        self.ledger.cancel_if_pending(provider_transaction_id)
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        verify_hmac_signature(&self.config.webhook_secret, payload, signature)
    }
}

// ─── Wire transfer ──────────────────────────────────────────────────────────

/// Bank wires are queued, confirmed by the bank's webhook, and can be
/// recalled while still queued.
pub struct WireTransferProcessor {
    config: ProviderConfig,
    ledger: RailLedger,
}

impl WireTransferProcessor {
    pub const NAME: &'static str = "wire_transfer";

    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            ledger: RailLedger::new(),
        }
    }

    /// Simulate the bank confirming or returning a wire.
    pub fn settle(&self, tx: &str, status: ProviderPayoutStatus, reason: Option<String>) -> bool {
        self.ledger.settle(tx, status, reason)
    }
}

#[async_trait]
impl PayoutProcessor for WireTransferProcessor {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn process_payout(
        &self,
        request: &PayoutRequest,
    ) -> Result<ProviderPayoutResult, ProviderError> {
        debug!(
            provider = Self::NAME,
            reference = %request.reference,
            amount = %request.amount,
            currency = %request.currency,
            "Queueing wire transfer"
        );
        self.ledger
            .submit(request, "WIRE-", ProviderPayoutStatus::Pending)
    }

    async fn retrieve_payout_status(
        &self,
        provider_transaction_id: &str,
    ) -> Result<ProviderPayoutResult, ProviderError> {
        self.ledger.status(provider_transaction_id)
    }

    async fn cancel_payout(&self, provider_transaction_id: &str) -> Result<bool, ProviderError> {
        self.ledger.cancel_if_pending(provider_transaction_id)
    }

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool {
        verify_hmac_signature(&self.config.webhook_secret, payload, signature)
    }
}

/// Register every enabled provider from configuration.
pub fn register_configured(registry: &ProcessorRegistry, config: &ProvidersConfig) {
    for (name, provider) in [
        (StripeConnectProcessor::NAME, &config.stripe_connect),
        (PayPalPayoutsProcessor::NAME, &config.paypal),
        (WireTransferProcessor::NAME, &config.wire_transfer),
    ] {
        if provider.enabled && provider.webhook_secret.is_empty() {
            warn!(processor = name, "No webhook secret configured, webhooks will be rejected");
        }
    }
    if config.stripe_connect.enabled {
        registry.register(Arc::new(StripeConnectProcessor::new(
            config.stripe_connect.clone(),
        )));
    }
    if config.paypal.enabled {
        registry.register(Arc::new(PayPalPayoutsProcessor::new(config.paypal.clone())));
    }
    if config.wire_transfer.enabled {
        registry.register(Arc::new(WireTransferProcessor::new(
            config.wire_transfer.clone(),
        )));
    }
    info!(processors = ?registry.names(), "Payout processors configured");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::sign_payload;
    use rust_decimal_macros::dec;

    fn request(reference: &str, account: &str) -> PayoutRequest {
        PayoutRequest {
            payout_id: Uuid::new_v4(),
            reference: reference.into(),
            partner_id: Uuid::new_v4(),
            destination_account: account.into(),
            amount: dec!(25.00),
            currency: "USD".into(),
            memo: "test".into(),
        }
    }

    #[tokio::test]
    async fn test_submission_is_idempotent_on_reference() {
        let stripe = StripeConnectProcessor::new(ProvidersConfig::default().stripe_connect);
        let a = stripe.process_payout(&request("ref-1", "acct_1")).await.unwrap();
        let b = stripe.process_payout(&request("ref-1", "acct_1")).await.unwrap();
        assert_eq!(a.provider_transaction_id, b.provider_transaction_id);
        assert_eq!(a.status, ProviderPayoutStatus::Completed);
        assert!(!stripe.cancel_payout(&a.provider_transaction_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_account_is_permanent() {
        let paypal = PayPalPayoutsProcessor::new(ProvidersConfig::default().paypal);
        let err = paypal.process_payout(&request("ref-2", " ")).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "invalid destination account");
    }

    #[tokio::test]
    async fn test_pending_rails_cancel_and_settle() {
        let wire = WireTransferProcessor::new(ProvidersConfig::default().wire_transfer);
        let r = wire.process_payout(&request("ref-3", "DE89370400440532013000")).await.unwrap();
        assert_eq!(r.status, ProviderPayoutStatus::Pending);
        assert!(wire.cancel_payout(&r.provider_transaction_id).await.unwrap());
        assert!(!wire.cancel_payout(&r.provider_transaction_id).await.unwrap());

        let paypal = PayPalPayoutsProcessor::new(ProvidersConfig::default().paypal);
        let r = paypal.process_payout(&request("ref-4", "partner@example.com")).await.unwrap();
        assert!(paypal.settle(&r.provider_transaction_id, ProviderPayoutStatus::Completed, None));
        let status = paypal.retrieve_payout_status(&r.provider_transaction_id).await.unwrap();
        assert_eq!(status.status, ProviderPayoutStatus::Completed);
    }

    #[test]
    fn test_registry_and_webhook_parsing() {
        let registry = ProcessorRegistry::new();
        register_configured(&registry, &ProvidersConfig::default());
        assert_eq!(registry.names(), vec!["paypal", "stripe_connect", "wire_transfer"]);
        assert!(matches!(
            registry.get("venmo"),
            Err(affiliate_core::AffiliateError::UnknownProcessor(_))
        ));

        let body = br#"{"transaction_id":"PAYOUTBATCH-1","status":"failed","failure_reason":"RECEIVER_UNREGISTERED"}"#;
        // No secret configured: nothing verifies, not even an empty-key signature.
        let unconfigured = registry.get("paypal").unwrap();
        assert!(!unconfigured.verify_webhook_signature(body, &sign_payload("", body)));

        let mut config = ProvidersConfig::default();
        config.paypal.webhook_secret = "whsec_paypal".into();
        let paypal = PayPalPayoutsProcessor::new(config.paypal);
        let sig = sign_payload("whsec_paypal", body);
        assert!(paypal.verify_webhook_signature(body, &sig));
        let event = paypal.parse_webhook(body).unwrap();
        assert_eq!(event.status, ProviderPayoutStatus::Failed);
        assert_eq!(event.failure_reason.as_deref(), Some("RECEIVER_UNREGISTERED"));
        assert!(paypal.parse_webhook(b"not json").is_err());
    }
}
