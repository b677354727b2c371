mod common;

use chrono::Duration;
use common::*;
use vpnshop_backend::entities::{PurchaseFunding, PurchaseKind, PurchaseStatus};
use vpnshop_backend::error::AppError;
use vpnshop_backend::models::{CreatePurchaseRequest, PaginationParams};
use vpnshop_backend::services::AccountService;
use vpnshop_backend::utils::time;

fn topup(account_id: i64, amount: i64) -> CreatePurchaseRequest {
    CreatePurchaseRequest {
        account_id,
        kind: PurchaseKind::BalanceTopup,
        funding: None,
        duration_days: None,
        amount: Some(amount),
    }
}

#[tokio::test]
async fn create_purchase_prices_from_plan_and_opens_window() {
    let db = setup_db().await;
    let service = purchase_service(&db);

    let before = time::now();
    let purchase = service
        .create_purchase(CreatePurchaseRequest {
            account_id: 5,
            kind: PurchaseKind::Entitlement,
            funding: None,
            duration_days: Some(90),
            amount: None,
        })
        .await
        .unwrap();

    assert!(purchase.purchase_ref.starts_with("pur-"));
    assert_eq!(purchase.price, 800);
    assert_eq!(purchase.funding, PurchaseFunding::External);
    assert_eq!(purchase.status, PurchaseStatus::Pending);
    assert!(purchase.expires_at >= before + Duration::minutes(30));
    // the buyer account is created on first purchase
    assert_eq!(balance_of(&db, 5).await, 0);
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let db = setup_db().await;
    let service = purchase_service(&db);

    let no_plan = service
        .create_purchase(CreatePurchaseRequest {
            account_id: 1,
            kind: PurchaseKind::Entitlement,
            funding: None,
            duration_days: Some(7),
            amount: None,
        })
        .await;
    assert!(matches!(no_plan, Err(AppError::ValidationError(_))));

    assert!(matches!(
        service.create_purchase(topup(1, 50)).await,
        Err(AppError::ValidationError(_))
    ));
    let balance_topup = CreatePurchaseRequest {
        funding: Some(PurchaseFunding::Balance),
        ..topup(1, 500)
    };
    assert!(matches!(
        service.create_purchase(balance_topup).await,
        Err(AppError::ValidationError(_))
    ));
}

#[tokio::test]
async fn invoice_attaches_only_while_pending() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let service = purchase_service(&db);
    let purchase_ref = service.create_purchase(topup(1, 500)).await.unwrap().purchase_ref;

    let attached = service.attach_invoice(&purchase_ref, "inv-1").await.unwrap();
    assert_eq!(attached.invoice_ref.as_deref(), Some("inv-1"));

    assert!(matches!(
        service.attach_invoice(&purchase_ref, "  ").await,
        Err(AppError::ValidationError(_))
    ));
    assert!(matches!(
        service.attach_invoice("pur-missing", "inv-2").await,
        Err(AppError::NotFound(_))
    ));

    finalizer(&db, &panel)
        .finalize(confirmation(&purchase_ref, "ch-1", 500))
        .await
        .unwrap();
    assert!(matches!(
        service.attach_invoice(&purchase_ref, "inv-3").await,
        Err(AppError::PurchaseNotActionable(_))
    ));
}

#[tokio::test]
async fn stale_pending_purchases_expire() {
    let db = setup_db().await;
    let service = purchase_service(&db);
    let old = service.create_purchase(topup(1, 500)).await.unwrap().purchase_ref;
    let fresh = service.create_purchase(topup(1, 500)).await.unwrap().purchase_ref;
    backdate_purchase(&db, &old).await;

    assert_eq!(service.expire_stale_purchases().await.unwrap(), 1);
    assert_eq!(service.expire_stale_purchases().await.unwrap(), 0);

    assert_eq!(
        service.find_purchase(&old).await.unwrap().status,
        PurchaseStatus::Expired
    );
    assert_eq!(
        service.find_purchase(&fresh).await.unwrap().status,
        PurchaseStatus::Pending
    );
}

#[tokio::test]
async fn create_with_ref_returns_the_existing_row() {
    let db = setup_db().await;
    seed_account(&db, 1, 0, None).await;
    let service = purchase_service(&db);

    let first = service
        .create_with_ref("auto-1-1700000000", 1, 30, PurchaseFunding::Balance)
        .await
        .unwrap();
    let second = service
        .create_with_ref("auto-1-1700000000", 1, 30, PurchaseFunding::Balance)
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.kind, PurchaseKind::Entitlement);
    assert_eq!(first.funding, PurchaseFunding::Balance);
    assert_eq!(first.price, 300);
    assert_eq!(first.status, PurchaseStatus::Pending);
}

#[tokio::test]
async fn account_view_lists_payments_newest_first() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 1, 0, None).await;
    for i in 0..3 {
        let purchase_ref = topup_purchase(&db, 1, 100 * (i + 1)).await;
        finalizer
            .finalize(confirmation(&purchase_ref, &format!("ch-{i}"), 100 * (i + 1)))
            .await
            .unwrap();
    }

    let accounts = AccountService::new(db.clone());
    let account = accounts.get_account(1).await.unwrap();
    assert_eq!(account.balance, 600);
    assert!(account.entitlement.is_none());

    let page = accounts
        .list_payments(1, &PaginationParams::new(Some(1), Some(2)))
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.total_pages, 2);
    assert_eq!(page.data.len(), 2);
    assert_eq!(page.data[0].provider_charge_id, "ch-2");

    assert!(matches!(
        accounts.get_account(404).await,
        Err(AppError::NotFound(_))
    ));
}

#[tokio::test]
async fn referrer_must_exist_before_binding() {
    let db = setup_db().await;
    seed_account(&db, 2, 0, None).await;
    let accounts = AccountService::new(db.clone());

    assert!(matches!(
        accounts.bind_referrer(1, 99).await,
        Err(AppError::NotFound(_))
    ));
    let bound = accounts.bind_referrer(1, 2).await.unwrap();
    assert!(bound.bound);
    assert_eq!(bound.referrer_id, Some(2));
}
