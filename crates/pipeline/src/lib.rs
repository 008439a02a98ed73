//! Pipeline — the operations the affiliate core exposes to job runners and
//! the webhook edge, and the scheduled jobs that drive them.

pub mod jobs;
pub mod service;

pub use jobs::{BatchReport, PayoutBatchJob, ReconcileReport, ReconciliationJob};
pub use service::{AffiliateService, AttributionOutcome, Backend, InMemoryBackend};
