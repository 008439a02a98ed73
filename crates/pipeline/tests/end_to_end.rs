use std::collections::HashSet;
use std::sync::Arc;

use affiliate_commission::{CommissionAction, CommissionRule};
use affiliate_core::error::AffiliateError;
use affiliate_core::types::{
    ConversionEvent, ConversionStatus, Partner, PartnerTier, Touch, TouchKind,
};
use affiliate_core::AppConfig;
use affiliate_payouts::signature::sign_payload;
use affiliate_payouts::{PayoutStatus, WebhookOutcome};
use affiliate_pipeline::{AffiliateService, InMemoryBackend, PayoutBatchJob, ReconciliationJob};
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn setup() -> (Arc<AffiliateService>, InMemoryBackend) {
    let mut config = AppConfig::default();
    config.providers.paypal.webhook_secret = "whsec_e2e_paypal".into();
    let (service, stores) = AffiliateService::in_memory(config);
    let since = at(2025, 1, 1);
    stores.rules.publish(CommissionRule {
        id: Uuid::new_v4(),
        rule_key: Uuid::new_v4(),
        version: 0,
        name: "10% on purchases".into(),
        conditions: vec![],
        action: CommissionAction::Percentage { rate: dec!(0.10) },
        valid_from: since,
        valid_until: None,
        active: true,
        created_at: since,
    });
    (Arc::new(service), stores)
}

fn partner(stores: &InMemoryBackend, processor: &str) -> Uuid {
    let id = Uuid::new_v4();
    stores.partners.upsert(Partner {
        id,
        name: format!("partner-{id}"),
        tier: PartnerTier::Standard,
        payout_processor: Some(processor.into()),
        payout_account: "acct_e2e".into(),
    });
    id
}

fn click(service: &AffiliateService, identity: &str, partner_id: Uuid, when: DateTime<Utc>) {
    service.record_touch(Touch {
        id: Uuid::new_v4(),
        identity_key: identity.into(),
        partner_id,
        campaign_id: Uuid::from_u128(7),
        campaign_version: 1,
        kind: TouchKind::Click,
        occurred_at: when,
        value: None,
    });
}

fn approved_conversion(
    service: &AffiliateService,
    identity: &str,
    value: Decimal,
    when: DateTime<Utc>,
) -> Uuid {
    let conversion = ConversionEvent {
        id: Uuid::new_v4(),
        identity_key: identity.into(),
        vendor_id: Uuid::from_u128(3),
        campaign_id: Uuid::from_u128(7),
        event_type: "purchase".into(),
        commissionable: true,
        value,
        currency: "USD".into(),
        status: ConversionStatus::Approved,
        occurred_at: when,
        attribution_model: None,
        attribution_confidence: None,
        review_reason: None,
    };
    let id = conversion.id;
    service.record_conversion(conversion);
    id
}

#[test]
fn single_touch_percentage_commission() {
    let (service, stores) = setup();
    let a = partner(&stores, "stripe_connect");
    let t = at(2026, 3, 10);
    click(&service, "visitor-1", a, t - Duration::hours(3));
    let conversion = approved_conversion(&service, "visitor-1", dec!(100.00), t);

    let outcome = service
        .attribute_and_commission(conversion, Some("last_click"))
        .unwrap();
    assert_eq!(outcome.distribution.weight_for(&a), Some(1.0));
    assert_eq!(outcome.snapshots.len(), 1);
    assert_eq!(outcome.snapshots[0].amount, dec!(10.00));
    assert_eq!(outcome.snapshots[0].partner_id, a);
}

#[test]
fn linear_split_across_two_partners() {
    let (service, stores) = setup();
    let a = partner(&stores, "stripe_connect");
    let b = partner(&stores, "stripe_connect");
    let t = at(2026, 3, 20);
    click(&service, "visitor-2", a, t - Duration::days(10));
    click(&service, "visitor-2", b, t - Duration::days(1));
    let conversion = approved_conversion(&service, "visitor-2", dec!(200.00), t);

    let outcome = service
        .attribute_and_commission(conversion, Some("linear"))
        .unwrap();
    assert_eq!(outcome.snapshots.len(), 2);
    for snapshot in &outcome.snapshots {
        assert_eq!(snapshot.amount, dec!(10.00));
        assert!((snapshot.attribution_weight - 0.5).abs() < 1e-9);
    }
    let partners: HashSet<Uuid> = outcome.snapshots.iter().map(|s| s.partner_id).collect();
    assert_eq!(partners, HashSet::from([a, b]));
}

#[test]
fn empty_payout_is_refused_without_a_row() {
    let (service, stores) = setup();
    let a = partner(&stores, "stripe_connect");

    let err = service
        .build_payout(a, date(2026, 3, 1), date(2026, 4, 1))
        .unwrap_err();
    assert!(matches!(err, AffiliateError::NoEligibleCommissions { .. }));
    assert!(stores.ledger.payouts_for_partner(&a).is_empty());
}

#[tokio::test]
async fn webhook_for_completed_payout_is_a_noop() {
    let (service, stores) = setup();
    let a = partner(&stores, "paypal");
    let t = at(2026, 3, 10);
    click(&service, "visitor-4", a, t - Duration::days(2));
    let conversion = approved_conversion(&service, "visitor-4", dec!(80.00), t);
    service.attribute_and_commission(conversion, None).unwrap();

    let payout = service
        .build_payout(a, date(2026, 3, 1), date(2026, 4, 1))
        .unwrap();
    assert_eq!(payout.amount, dec!(8.00));
    let settled = service.settle_payout(payout.id).await.unwrap();
    assert_eq!(settled.status, PayoutStatus::Processing);
    let tx = settled.provider_transaction_id.unwrap();

    let body = format!(r#"{{"transaction_id":"{tx}","status":"completed"}}"#);
    let secret = &service.config().providers.paypal.webhook_secret;
    let signature = sign_payload(secret, body.as_bytes());

    let first = service
        .handle_provider_webhook("paypal", body.as_bytes(), &signature)
        .unwrap();
    assert_eq!(first, WebhookOutcome::Applied(PayoutStatus::Completed));
    let after_first = service.payout(&payout.id).unwrap();

    let second = service
        .handle_provider_webhook("paypal", body.as_bytes(), &signature)
        .unwrap();
    assert_eq!(second, WebhookOutcome::Ignored);
    let after_second = service.payout(&payout.id).unwrap();
    assert_eq!(after_second.status, PayoutStatus::Completed);
    assert_eq!(after_second.updated_at, after_first.updated_at);
    assert_eq!(
        service.conversion(&conversion).unwrap().status,
        ConversionStatus::Paid
    );
}

#[test]
fn attribute_and_commission_is_idempotent() {
    let (service, stores) = setup();
    let a = partner(&stores, "stripe_connect");
    let t = at(2026, 3, 10);
    click(&service, "visitor-5", a, t - Duration::days(1));
    let conversion = approved_conversion(&service, "visitor-5", dec!(55.55), t);

    let first = service.attribute_and_commission(conversion, None).unwrap();
    let second = service.attribute_and_commission(conversion, None).unwrap();
    assert!(first.created);
    assert!(!second.created);
    assert_eq!(stores.snapshots.count(), 1);
    assert_eq!(first.snapshots[0].id, second.snapshots[0].id);
    assert_eq!(
        service.journey("visitor-5").unwrap().total_commission,
        dec!(5.56)
    );
}

#[test]
fn concurrent_commission_runs_write_one_set() {
    let (service, stores) = setup();
    let a = partner(&stores, "stripe_connect");
    let b = partner(&stores, "stripe_connect");
    let t = at(2026, 3, 10);
    click(&service, "visitor-6", a, t - Duration::days(3));
    click(&service, "visitor-6", b, t - Duration::days(2));
    let conversion = approved_conversion(&service, "visitor-6", dec!(300.00), t);

    let created: usize = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                s.spawn(move || {
                    service
                        .attribute_and_commission(conversion, Some("linear"))
                        .unwrap()
                        .created as usize
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    });
    assert_eq!(created, 1);
    assert_eq!(stores.snapshots.count(), 2);
}

#[test]
fn concurrent_overlapping_builds_never_double_claim() {
    let (service, stores) = setup();
    let a = partner(&stores, "stripe_connect");
    for day in 1..=20 {
        let identity = format!("visitor-7-{day}");
        let t = at(2026, 3, day);
        click(&service, &identity, a, t - Duration::hours(1));
        let conversion = approved_conversion(&service, &identity, dec!(10.00), t);
        service.attribute_and_commission(conversion, None).unwrap();
    }

    let periods = [
        (date(2026, 3, 1), date(2026, 3, 15)),
        (date(2026, 3, 5), date(2026, 3, 21)),
        (date(2026, 3, 1), date(2026, 4, 1)),
        (date(2026, 3, 10), date(2026, 3, 12)),
    ];
    let claimed: Vec<Vec<Uuid>> = std::thread::scope(|s| {
        let handles: Vec<_> = periods
            .iter()
            .map(|&(start, end)| {
                let service = service.clone();
                s.spawn(move || {
                    service
                        .build_payout(a, start, end)
                        .map(|p| p.snapshot_ids)
                        .unwrap_or_default()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut seen = HashSet::new();
    for ids in &claimed {
        for id in ids {
            assert!(seen.insert(*id), "snapshot {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 20);

    for payout in stores.ledger.payouts_for_partner(&a) {
        let total: Decimal = stores
            .ledger
            .events_for(&payout.id)
            .iter()
            .map(|e| e.amount)
            .sum();
        assert_eq!(payout.amount, total);
    }
}

#[tokio::test]
async fn batch_and_reconciliation_jobs() {
    let (service, stores) = setup();
    let card = partner(&stores, "stripe_connect");
    let wire = partner(&stores, "wire_transfer");
    let idle = partner(&stores, "stripe_connect");
    let t = at(2026, 3, 10);
    for (identity, p) in [("v-card", card), ("v-wire", wire)] {
        click(&service, identity, p, t - Duration::days(1));
        let conversion = approved_conversion(&service, identity, dec!(50.00), t);
        service.attribute_and_commission(conversion, None).unwrap();
    }

    let batch = PayoutBatchJob::new(service.clone(), &service.config().jobs);
    let (start, end) = batch.period_ending(date(2026, 3, 15));
    assert_eq!(start, date(2026, 3, 8));
    let report = batch.run(start, end).await;
    assert_eq!(report.partners, 2);
    assert_eq!(report.built, 2);
    assert_eq!(report.completed, 1);
    assert_eq!(report.processing, 1);
    assert!(stores.ledger.payouts_for_partner(&idle).is_empty());

    // A rerun finds everything claimed.
    let rerun = batch.run(start, end).await;
    assert_eq!(rerun.skipped, 2);

    let reconcile = ReconciliationJob::new(service.clone(), &service.config().jobs);
    let early = reconcile.run(Utc::now()).await;
    assert_eq!(early.checked, 0);
    let late = reconcile.run(Utc::now() + Duration::hours(1)).await;
    assert_eq!(late.checked, 1);
    assert_eq!(late.still_processing, 1);
}

#[tokio::test]
async fn rejected_conversion_is_never_paid_from_an_open_payout() {
    let (service, stores) = setup();
    let a = partner(&stores, "stripe_connect");
    let t = at(2026, 3, 10);
    click(&service, "visitor-8", a, t - Duration::days(1));
    click(&service, "visitor-9", a, t - Duration::days(1));
    let refunded = approved_conversion(&service, "visitor-8", dec!(100.00), t);
    let kept = approved_conversion(&service, "visitor-9", dec!(50.00), t);
    service.attribute_and_commission(refunded, None).unwrap();
    service.attribute_and_commission(kept, None).unwrap();

    let payout = service
        .build_payout(a, date(2026, 3, 1), date(2026, 4, 1))
        .unwrap();
    assert_eq!(payout.amount, dec!(15.00));

    let reversals = service.reject_conversion(refunded).unwrap();
    assert_eq!(reversals[0].amount, dec!(-10.00));

    let err = service.settle_payout(payout.id).await.unwrap_err();
    assert!(matches!(err, AffiliateError::Integrity(_)));
    assert!(err.is_fatal());
    let refused = service.payout(&payout.id).unwrap();
    assert_eq!(refused.status, PayoutStatus::Failed);
    assert!(refused.provider_transaction_id.is_none());

    let rebuilt = service
        .build_payout(a, date(2026, 3, 1), date(2026, 4, 1))
        .unwrap();
    assert_eq!(rebuilt.amount, dec!(5.00));
    let settled = service.settle_payout(rebuilt.id).await.unwrap();
    assert_eq!(settled.status, PayoutStatus::Completed);
    assert_eq!(
        service.conversion(&refunded).unwrap().status,
        ConversionStatus::Rejected
    );
    assert_eq!(service.conversion(&kept).unwrap().status, ConversionStatus::Paid);
}
