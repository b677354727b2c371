mod common;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::*;
use sea_orm::DatabaseConnection;
use vpnshop_backend::config::{AutoRenewalConfig, NotificationsConfig, PurchasesConfig};
use vpnshop_backend::error::AppError;
use vpnshop_backend::services::{
    AccountStore, AutoRenewalService, KIND_AUTO_RENEW_FAILED, KIND_PURCHASE_SETTLED,
    NotificationService,
};
use vpnshop_backend::utils::time;

fn auto_renewal(
    db: &DatabaseConnection,
    panel: &Arc<FakeProvisioning>,
    sink: &Arc<RecordingSink>,
    config: AutoRenewalConfig,
) -> AutoRenewalService {
    AutoRenewalService::new(
        db.clone(),
        purchase_service(db),
        finalizer(db, panel),
        NotificationService::new(db.clone(), sink.clone(), NotificationsConfig::default()),
        config,
        PurchasesConfig::default(),
    )
}

fn enabled() -> AutoRenewalConfig {
    AutoRenewalConfig {
        enabled: true,
        lead_hours: 24,
        plan_days: 30,
    }
}

/// Account 1 with auto-renew on and an entitlement lapsing in 12 hours.
async fn subscriber(db: &DatabaseConnection, panel: &FakeProvisioning, balance: i64) -> DateTime<Utc> {
    seed_account(db, 1, balance, None).await;
    AccountStore::set_auto_renew(db, 1, true).await.unwrap();
    let expiry = time::now() + Duration::hours(12);
    seed_entitlement(db, 1, "cred-1", expiry).await;
    panel.with_credential("cred-1", expiry);
    expiry
}

#[tokio::test]
async fn renews_from_balance_before_expiry() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let sink = RecordingSink::new();
    let expiry = subscriber(&db, &panel, 1000).await;
    let service = auto_renewal(&db, &panel, &sink, enabled());

    assert_eq!(service.run_once().await.unwrap(), 1);

    assert_eq!(balance_of(&db, 1).await, 700);
    let row = entitlement_of(&db, 1).await.unwrap();
    assert_eq!(row.credential_id, "cred-1");
    assert_eq!(row.expires_at, expiry + Duration::days(30));
    assert_eq!(panel.expiry_of("cred-1"), Some(row.expires_at));
    assert_eq!(sink.count_of(KIND_PURCHASE_SETTLED), 1);

    // now outside the lead window
    assert_eq!(service.run_once().await.unwrap(), 0);
    assert_eq!(balance_of(&db, 1).await, 700);
    assert_eq!(payment_count(&db).await, 1);
}

#[tokio::test]
async fn low_balance_sends_one_notice() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let sink = RecordingSink::new();
    let expiry = subscriber(&db, &panel, 100).await;
    let service = auto_renewal(&db, &panel, &sink, enabled());

    assert_eq!(service.run_once().await.unwrap(), 0);
    assert_eq!(service.run_once().await.unwrap(), 0);

    assert_eq!(sink.count_of(KIND_AUTO_RENEW_FAILED), 1);
    assert_eq!(balance_of(&db, 1).await, 100);
    assert_eq!(entitlement_of(&db, 1).await.unwrap().expires_at, expiry);
    assert_eq!(payment_count(&db).await, 0);
}

#[tokio::test]
async fn accounts_without_auto_renew_are_left_alone() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let sink = RecordingSink::new();
    subscriber(&db, &panel, 1000).await;
    AccountStore::set_auto_renew(&db, 1, false).await.unwrap();

    let service = auto_renewal(&db, &panel, &sink, enabled());
    assert_eq!(service.run_once().await.unwrap(), 0);
    assert_eq!(balance_of(&db, 1).await, 1000);
    assert!(sink.delivered().is_empty());
}

#[tokio::test]
async fn disabled_or_misconfigured_runs_do_nothing() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let sink = RecordingSink::new();
    subscriber(&db, &panel, 1000).await;

    let disabled = auto_renewal(&db, &panel, &sink, AutoRenewalConfig::default());
    assert_eq!(disabled.run_once().await.unwrap(), 0);

    let bad_plan = AutoRenewalConfig {
        plan_days: 7,
        ..enabled()
    };
    assert!(matches!(
        auto_renewal(&db, &panel, &sink, bad_plan).run_once().await,
        Err(AppError::ConfigError(_))
    ));
    assert_eq!(balance_of(&db, 1).await, 1000);
}
