//! Scheduled tasks over the service's idempotent entry points. The tasks hold
//! no schedule themselves; the worker decides when each one runs.

use std::sync::Arc;

use affiliate_core::config::JobsConfig;
use affiliate_core::error::AffiliateError;
use affiliate_payouts::PayoutStatus;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::service::AffiliateService;

#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchReport {
    pub partners: usize,
    pub built: usize,
    pub completed: usize,
    pub processing: usize,
    pub failed: usize,
    /// Partners with nothing to pay this period.
    pub skipped: usize,
    pub errors: usize,
}

/// Builds and settles one payout per partner with live commission.
pub struct PayoutBatchJob {
    service: Arc<AffiliateService>,
    period_days: u32,
}

impl PayoutBatchJob {
    pub fn new(service: Arc<AffiliateService>, config: &JobsConfig) -> Self {
        Self {
            service,
            period_days: config.payout_period_days,
        }
    }

    /// The period of `period_days` ending at (and excluding) `today`.
    pub fn period_ending(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        (today - Duration::days(self.period_days as i64), today)
    }

    /// Partners run in parallel; one partner's error never aborts the batch.
    pub async fn run(&self, period_start: NaiveDate, period_end: NaiveDate) -> BatchReport {
        let partners = self.service.snapshots().partners_with_live_snapshots();
        let mut report = BatchReport {
            partners: partners.len(),
            ..BatchReport::default()
        };

        let mut tasks = JoinSet::new();
        for partner_id in partners {
            let service = self.service.clone();
            tasks.spawn(async move {
                let payout = service.build_payout(partner_id, period_start, period_end)?;
                service.settle_payout(payout.id).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(result)) => {
                    report.built += 1;
                    match result.status {
                        PayoutStatus::Completed => report.completed += 1,
                        PayoutStatus::Failed => report.failed += 1,
                        _ => report.processing += 1,
                    }
                }
                Ok(Err(AffiliateError::NoEligibleCommissions { .. })) => report.skipped += 1,
                Ok(Err(e)) => {
                    report.errors += 1;
                    if e.is_fatal() {
                        error!(error = %e, reason = e.reason(), "Payout batch integrity violation");
                    } else {
                        warn!(error = %e, reason = e.reason(), "Payout batch partner failed");
                    }
                }
                Err(e) => {
                    report.errors += 1;
                    error!(error = %e, "Payout batch task panicked");
                }
            }
        }

        metrics::counter!("jobs.payout_batch.runs").increment(1);
        info!(
            period_start = %period_start,
            period_end = %period_end,
            partners = report.partners,
            built = report.built,
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            errors = report.errors,
            "Payout batch finished"
        );
        report
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub completed: usize,
    pub failed: usize,
    pub still_processing: usize,
    pub errors: usize,
}

/// Polls providers for payouts stuck in `processing`, for rails whose
/// webhook never arrived.
pub struct ReconciliationJob {
    service: Arc<AffiliateService>,
    reconcile_after: Duration,
}

impl ReconciliationJob {
    pub fn new(service: Arc<AffiliateService>, config: &JobsConfig) -> Self {
        Self {
            service,
            reconcile_after: Duration::seconds(config.reconcile_after_secs as i64),
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> ReconcileReport {
        let cutoff = now - self.reconcile_after;
        let stale: Vec<_> = self
            .service
            .settlement()
            .ledger()
            .list_by_status(PayoutStatus::Processing)
            .into_iter()
            .filter(|p| p.processing_since.is_some_and(|since| since <= cutoff))
            .collect();

        let mut report = ReconcileReport {
            checked: stale.len(),
            ..ReconcileReport::default()
        };
        for payout in stale {
            match self.service.reconcile_payout(payout.id).await {
                Ok(result) => match result.status {
                    PayoutStatus::Completed => report.completed += 1,
                    PayoutStatus::Failed => report.failed += 1,
                    _ => report.still_processing += 1,
                },
                Err(e) => {
                    report.errors += 1;
                    warn!(payout_id = %payout.id, error = %e, "Reconciliation failed");
                }
            }
        }

        if report.checked > 0 {
            info!(
                checked = report.checked,
                completed = report.completed,
                failed = report.failed,
                still_processing = report.still_processing,
                "Reconciliation pass finished"
            );
        }
        report
    }
}
