//! Payout processor capability and the registry providers register into.

use std::sync::Arc;

use affiliate_core::error::{AffiliateError, AffiliateResult};
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// What the engine asks a provider to pay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub payout_id: Uuid,
    /// Idempotency key. Stable across network retries of one attempt.
    pub reference: String,
    pub partner_id: Uuid,
    pub destination_account: String,
    pub amount: Decimal,
    pub currency: String,
    pub memo: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderPayoutStatus {
    /// Accepted; the terminal status arrives later by webhook or polling.
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPayoutResult {
    pub provider_transaction_id: String,
    pub status: ProviderPayoutStatus,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Timeout, 5xx, rate limit. Safe to retry with the same reference.
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Invalid account, rejected by provider. Recorded verbatim.
    #[error("{0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Shared JSON envelope carried by provider webhooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderWebhookEvent {
    pub transaction_id: String,
    pub status: ProviderPayoutStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// A payment provider. One implementation per provider, selected by name
/// through [`ProcessorRegistry`].
#[async_trait]
pub trait PayoutProcessor: Send + Sync {
    /// Registry key, e.g. `stripe_connect`.
    fn name(&self) -> &str;

    async fn process_payout(
        &self,
        request: &PayoutRequest,
    ) -> Result<ProviderPayoutResult, ProviderError>;

    async fn retrieve_payout_status(
        &self,
        provider_transaction_id: &str,
    ) -> Result<ProviderPayoutResult, ProviderError>;

    /// `Ok(true)` once the provider confirms the payout will not settle.
    async fn cancel_payout(&self, provider_transaction_id: &str) -> Result<bool, ProviderError>;

    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> bool;

    fn parse_webhook(&self, payload: &[u8]) -> Result<ProviderWebhookEvent, ProviderError> {
        serde_json::from_slice(payload)
            .map_err(|e| ProviderError::Permanent(format!("malformed webhook payload: {e}")))
    }
}

/// Processors keyed by name.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: DashMap<String, Arc<dyn PayoutProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, processor: Arc<dyn PayoutProcessor>) {
        let name = processor.name().to_string();
        info!(processor = %name, "Payout processor registered");
        self.processors.insert(name, processor);
    }

    pub fn get(&self, name: &str) -> AffiliateResult<Arc<dyn PayoutProcessor>> {
        self.processors
            .get(name)
            .map(|p| p.value().clone())
            .ok_or_else(|| AffiliateError::UnknownProcessor(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.processors.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processors.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
