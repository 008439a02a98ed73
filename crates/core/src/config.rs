use serde::Deserialize;

use crate::types::AttributionModel;

/// Root application configuration. Loaded from environment variables
/// with the prefix `AFFILIATE_ENGINE__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub attribution: AttributionConfig,
    #[serde(default)]
    pub commission: CommissionConfig,
    #[serde(default)]
    pub payouts: PayoutConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttributionConfig {
    #[serde(default = "default_model")]
    pub default_model: AttributionModel,
    /// Half-life of the `time_decay` model, in days.
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
    /// Touches older than this relative to the conversion are not eligible.
    #[serde(default = "default_window_days")]
    pub window_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommissionConfig {
    /// Look-back used to place a partner in a tiered rule's bracket.
    #[serde(default = "default_tier_lookback_days")]
    pub tier_lookback_days: u32,
    #[serde(default = "default_weight_epsilon")]
    pub weight_epsilon: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayoutConfig {
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_processor")]
    pub default_processor: String,
    #[serde(default = "default_provider_timeout_ms")]
    pub provider_timeout_ms: u64,
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Number of administrative retries allowed after a payout fails.
    #[serde(default = "default_max_manual_retries")]
    pub max_manual_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default)]
    pub api_base: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_stripe_connect")]
    pub stripe_connect: ProviderConfig,
    #[serde(default = "default_paypal")]
    pub paypal: ProviderConfig,
    #[serde(default = "default_wire_transfer")]
    pub wire_transfer: ProviderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_payout_period_days")]
    pub payout_period_days: u32,
    #[serde(default = "default_payout_interval_secs")]
    pub payout_interval_secs: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// A `processing` payout older than this is polled at its provider.
    #[serde(default = "default_reconcile_after_secs")]
    pub reconcile_after_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "worker-01".to_string()
}
fn default_model() -> AttributionModel {
    AttributionModel::LastClick
}
fn default_half_life_days() -> f64 {
    7.0
}
fn default_window_days() -> u32 {
    30
}
fn default_tier_lookback_days() -> u32 {
    30
}
fn default_weight_epsilon() -> f64 {
    1e-6
}
fn default_currency() -> String {
    "USD".to_string()
}
fn default_processor() -> String {
    "stripe_connect".to_string()
}
fn default_provider_timeout_ms() -> u64 {
    10_000
}
fn default_max_transient_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_max_backoff_ms() -> u64 {
    5_000
}
fn default_max_manual_retries() -> u32 {
    3
}
fn default_provider_enabled() -> bool {
    true
}
fn default_payout_period_days() -> u32 {
    7
}
fn default_payout_interval_secs() -> u64 {
    86_400
}
fn default_reconcile_interval_secs() -> u64 {
    300
}
fn default_reconcile_after_secs() -> u64 {
    900
}
fn default_metrics_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

/// Webhook secrets have no default; an unset secret rejects every webhook.
fn provider_defaults(api_base: &str) -> ProviderConfig {
    ProviderConfig {
        enabled: true,
        webhook_secret: String::new(),
        api_base: api_base.to_string(),
    }
}
fn default_stripe_connect() -> ProviderConfig {
    provider_defaults("https://api.stripe.com/v1")
}
fn default_paypal() -> ProviderConfig {
    provider_defaults("https://api-m.paypal.com/v1")
}
fn default_wire_transfer() -> ProviderConfig {
    provider_defaults("https://wire.internal/v1")
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            half_life_days: default_half_life_days(),
            window_days: default_window_days(),
        }
    }
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self {
            tier_lookback_days: default_tier_lookback_days(),
            weight_epsilon: default_weight_epsilon(),
        }
    }
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            default_processor: default_processor(),
            provider_timeout_ms: default_provider_timeout_ms(),
            max_transient_retries: default_max_transient_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_manual_retries: default_max_manual_retries(),
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            stripe_connect: default_stripe_connect(),
            paypal: default_paypal(),
            wire_transfer: default_wire_transfer(),
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            payout_period_days: default_payout_period_days(),
            payout_interval_secs: default_payout_interval_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            reconcile_after_secs: default_reconcile_after_secs(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            host: default_metrics_host(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            attribution: AttributionConfig::default(),
            commission: CommissionConfig::default(),
            payouts: PayoutConfig::default(),
            providers: ProvidersConfig::default(),
            jobs: JobsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and an optional config file.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("AFFILIATE_ENGINE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
