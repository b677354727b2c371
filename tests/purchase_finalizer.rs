mod common;

use chrono::Duration;
use common::*;
use futures_util::future::join_all;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use vpnshop_backend::entities::{
    EntitlementStatus, PurchaseFunding, PurchaseStatus, referral_reward_entity as rewards,
};
use vpnshop_backend::error::AppError;
use vpnshop_backend::models::{FinalizationOutcome, GrantAction, RejectionReason};
use vpnshop_backend::services::PurchaseService;
use vpnshop_backend::utils::time;

#[tokio::test]
async fn topup_settles_once_and_redelivery_is_a_noop() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 1, 0, None).await;
    let purchase_ref = topup_purchase(&db, 1, 500).await;

    let first = finalizer
        .finalize(confirmation(&purchase_ref, "abc123", 500))
        .await
        .unwrap();
    match first {
        FinalizationOutcome::Settled(report) => {
            assert_eq!(report.balance_after, Some(500));
            assert!(report.entitlement.is_none());
        }
        other => panic!("expected settlement, got {other:?}"),
    }
    assert_eq!(balance_of(&db, 1).await, 500);
    assert_eq!(payment_count(&db).await, 1);

    let second = finalizer
        .finalize(confirmation(&purchase_ref, "abc123", 500))
        .await
        .unwrap();
    assert_eq!(
        second,
        FinalizationOutcome::AlreadyProcessed {
            purchase_ref: purchase_ref.clone()
        }
    );
    assert_eq!(balance_of(&db, 1).await, 500);
    assert_eq!(payment_count(&db).await, 1);
    assert_eq!(panel.creates(), 0);
}

#[tokio::test]
async fn concurrent_deliveries_apply_exactly_once() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 1, 0, None).await;
    let purchase_ref = entitlement_purchase(&db, 1, 30, PurchaseFunding::External).await;
    let price = price_of(&db, &purchase_ref).await;

    let outcomes = join_all((0..5).map(|_| {
        finalizer.finalize(confirmation(&purchase_ref, "charge-1", price))
    }))
    .await;

    let settled = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(FinalizationOutcome::Settled(_))))
        .count();
    let already = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(FinalizationOutcome::AlreadyProcessed { .. })))
        .count();
    assert_eq!(settled, 1);
    assert_eq!(already, 4);
    assert_eq!(payment_count(&db).await, 1);

    // every losing Phase 1 credential was cleaned up
    let entitlement = entitlement_of(&db, 1).await.unwrap();
    assert_eq!(panel.credential_ids(), vec![entitlement.credential_id.clone()]);
    assert_eq!(entitlement.status, EntitlementStatus::Active);
}

#[tokio::test]
async fn renewal_before_expiry_extends_from_old_expiry_and_keeps_credential() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 1, 0, None).await;
    let old_expiry = time::now() + Duration::days(2);
    seed_entitlement(&db, 1, "cred-1", old_expiry).await;
    panel.with_credential("cred-1", old_expiry);

    let purchase_ref = entitlement_purchase(&db, 1, 30, PurchaseFunding::External).await;
    let price = price_of(&db, &purchase_ref).await;
    let outcome = finalizer
        .finalize(confirmation(&purchase_ref, "ch-renew", price))
        .await
        .unwrap();

    let FinalizationOutcome::Settled(report) = outcome else {
        panic!("expected settlement");
    };
    let change = report.entitlement.unwrap();
    assert_eq!(change.action, GrantAction::Renewal);
    assert_eq!(change.credential_id, "cred-1");
    assert_eq!(change.expires_at, old_expiry + Duration::days(30));
    assert_eq!(change.previous_expires_at, Some(old_expiry));
    assert!(change.provisioning_synced);

    // no Phase 1 credential for a renewal
    assert_eq!(panel.creates(), 0);
    assert_eq!(panel.expiry_of("cred-1"), Some(old_expiry + Duration::days(30)));

    let row = entitlement_of(&db, 1).await.unwrap();
    assert_eq!(row.credential_id, "cred-1");
    assert_eq!(row.expires_at, old_expiry + Duration::days(30));
    assert!(row.is_in_sync());
}

#[tokio::test]
async fn renewal_after_expiry_extends_from_now() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 1, 0, None).await;
    let old_expiry = time::now() - Duration::days(1);
    seed_entitlement(&db, 1, "cred-1", old_expiry).await;
    panel.with_credential("cred-1", old_expiry);

    let before = time::now();
    let purchase_ref = entitlement_purchase(&db, 1, 30, PurchaseFunding::External).await;
    let price = price_of(&db, &purchase_ref).await;
    finalizer
        .finalize(confirmation(&purchase_ref, "ch-late", price))
        .await
        .unwrap();
    let after = time::now();

    let row = entitlement_of(&db, 1).await.unwrap();
    assert_eq!(row.credential_id, "cred-1");
    assert!(row.expires_at >= before + Duration::days(30));
    assert!(row.expires_at <= after + Duration::days(30));
}

#[tokio::test]
async fn credential_is_stable_across_renewals() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 1, 0, None).await;

    let mut credential = None;
    let mut last_expiry = None;
    for i in 0..4 {
        let purchase_ref = entitlement_purchase(&db, 1, 30, PurchaseFunding::External).await;
        let price = price_of(&db, &purchase_ref).await;
        let outcome = finalizer
            .finalize(confirmation(&purchase_ref, &format!("ch-{i}"), price))
            .await
            .unwrap();
        let FinalizationOutcome::Settled(report) = outcome else {
            panic!("purchase {i} did not settle");
        };
        let change = report.entitlement.unwrap();
        let expected_action = if i == 0 {
            GrantAction::NewIssuance
        } else {
            GrantAction::Renewal
        };
        assert_eq!(change.action, expected_action);

        match &credential {
            None => credential = Some(change.credential_id.clone()),
            Some(id) => assert_eq!(&change.credential_id, id),
        }
        if let Some(prev) = last_expiry {
            assert!(change.expires_at > prev);
        }
        last_expiry = Some(change.expires_at);
    }

    assert_eq!(panel.creates(), 1);
    assert_eq!(panel.credential_ids(), vec![credential.unwrap()]);
}

#[tokio::test]
async fn stale_entitlement_gets_a_new_credential() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 1, 0, None).await;
    let old_expiry = time::now() - Duration::days(5);
    seed_entitlement(&db, 1, "cred-old", old_expiry).await;
    panel.with_credential("cred-old", old_expiry);

    let purchase_ref = entitlement_purchase(&db, 1, 30, PurchaseFunding::External).await;
    let price = price_of(&db, &purchase_ref).await;
    let outcome = finalizer
        .finalize(confirmation(&purchase_ref, "ch-stale", price))
        .await
        .unwrap();

    let FinalizationOutcome::Settled(report) = outcome else {
        panic!("expected settlement");
    };
    let change = report.entitlement.unwrap();
    assert_eq!(change.action, GrantAction::NewIssuance);
    assert_ne!(change.credential_id, "cred-old");

    let row = entitlement_of(&db, 1).await.unwrap();
    assert_eq!(row.credential_id, change.credential_id);
    assert_eq!(row.status, EntitlementStatus::Active);
    assert_eq!(panel.credential_ids(), vec![change.credential_id]);
}

#[tokio::test]
async fn transaction_failure_after_phase_one_removes_the_credential() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 1, 0, None).await;
    let purchase_ref = entitlement_purchase(&db, 1, 30, PurchaseFunding::External).await;
    let price = price_of(&db, &purchase_ref).await;
    break_payment_inserts(&db).await;

    let result = finalizer
        .finalize(confirmation(&purchase_ref, "ch-boom", price))
        .await;

    assert!(matches!(result, Err(AppError::DatabaseError(_))));
    assert_eq!(panel.creates(), 1);
    assert_eq!(panel.removes(), 1);
    assert!(panel.credential_ids().is_empty());
    assert!(entitlement_of(&db, 1).await.is_none());
    let purchase = PurchaseService::find_model(&db, &purchase_ref)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(purchase.status, PurchaseStatus::Pending);
}

#[tokio::test]
async fn failed_compensation_is_escalated_as_orphaned_credential() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 1, 0, None).await;
    let purchase_ref = entitlement_purchase(&db, 1, 30, PurchaseFunding::External).await;
    let price = price_of(&db, &purchase_ref).await;
    break_payment_inserts(&db).await;
    panel.fail_remove.store(true, std::sync::atomic::Ordering::SeqCst);

    let result = finalizer
        .finalize(confirmation(&purchase_ref, "ch-orphan", price))
        .await;

    let err = result.unwrap_err();
    assert!(err.is_critical());
    let credential_id = match err {
        AppError::OrphanedCredential { credential_id, .. } => credential_id,
        other => panic!("expected orphaned credential, got {other:?}"),
    };
    assert_eq!(panel.credential_ids(), vec![credential_id]);
    // nothing in the database points at the orphan
    assert!(entitlement_of(&db, 1).await.is_none());
}

#[tokio::test]
async fn phase_one_failure_leaves_purchase_retryable() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 1, 0, None).await;
    let purchase_ref = entitlement_purchase(&db, 1, 30, PurchaseFunding::External).await;
    let price = price_of(&db, &purchase_ref).await;

    panel.fail_create.store(true, std::sync::atomic::Ordering::SeqCst);
    let result = finalizer
        .finalize(confirmation(&purchase_ref, "ch-retry", price))
        .await;
    let err = result.unwrap_err();
    assert!(matches!(err, AppError::ProvisioningFailed(_)));
    assert!(err.is_retryable());
    assert_eq!(payment_count(&db).await, 0);

    panel.fail_create.store(false, std::sync::atomic::Ordering::SeqCst);
    let retried = finalizer
        .finalize(confirmation(&purchase_ref, "ch-retry", price))
        .await
        .unwrap();
    assert!(retried.is_settled());
}

#[tokio::test]
async fn phase_two_failure_does_not_undo_the_renewal() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 1, 0, None).await;
    let old_expiry = time::now() + Duration::days(2);
    seed_entitlement(&db, 1, "cred-1", old_expiry).await;
    panel.with_credential("cred-1", old_expiry);
    panel.fail_update.store(true, std::sync::atomic::Ordering::SeqCst);

    let purchase_ref = entitlement_purchase(&db, 1, 30, PurchaseFunding::External).await;
    let price = price_of(&db, &purchase_ref).await;
    let outcome = finalizer
        .finalize(confirmation(&purchase_ref, "ch-p2", price))
        .await
        .unwrap();

    let FinalizationOutcome::Settled(report) = outcome else {
        panic!("expected settlement");
    };
    assert!(!report.entitlement.unwrap().provisioning_synced);
    let row = entitlement_of(&db, 1).await.unwrap();
    assert_eq!(row.expires_at, old_expiry + Duration::days(30));
    assert!(!row.is_in_sync());
    assert_eq!(panel.expiry_of("cred-1"), Some(old_expiry));
}

#[tokio::test]
async fn amount_mismatch_is_rejected_without_side_effects() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 1, 0, None).await;
    let purchase_ref = entitlement_purchase(&db, 1, 30, PurchaseFunding::External).await;
    let price = price_of(&db, &purchase_ref).await;

    let outcome = finalizer
        .finalize(confirmation(&purchase_ref, "ch-short", price - 1))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        FinalizationOutcome::Rejected(RejectionReason::AmountMismatch {
            expected: price,
            received: price - 1,
        })
    );
    assert_eq!(panel.creates(), 0);
    assert_eq!(payment_count(&db).await, 0);
}

#[tokio::test]
async fn unknown_and_expired_purchases_are_rejected() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 1, 0, None).await;

    let missing = finalizer
        .finalize(confirmation("pur-missing", "ch-x", 300))
        .await
        .unwrap();
    assert_eq!(
        missing,
        FinalizationOutcome::Rejected(RejectionReason::PurchaseNotFound)
    );

    let purchase_ref = entitlement_purchase(&db, 1, 30, PurchaseFunding::External).await;
    let price = price_of(&db, &purchase_ref).await;
    backdate_purchase(&db, &purchase_ref).await;
    purchase_service(&db).expire_stale_purchases().await.unwrap();

    let expired = finalizer
        .finalize(confirmation(&purchase_ref, "ch-y", price))
        .await
        .unwrap();
    assert_eq!(
        expired,
        FinalizationOutcome::Rejected(RejectionReason::PurchaseExpired)
    );
    assert_eq!(panel.creates(), 0);
}

#[tokio::test]
async fn charge_id_cannot_settle_a_second_purchase() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 1, 0, None).await;
    let first = topup_purchase(&db, 1, 500).await;
    let second = topup_purchase(&db, 1, 500).await;

    assert!(
        finalizer
            .finalize(confirmation(&first, "shared", 500))
            .await
            .unwrap()
            .is_settled()
    );
    let outcome = finalizer
        .finalize(confirmation(&second, "shared", 500))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        FinalizationOutcome::Rejected(RejectionReason::ChargeAlreadyUsed {
            purchase_ref: first
        })
    );
    assert_eq!(balance_of(&db, 1).await, 500);
}

#[tokio::test]
async fn balance_purchase_debits_and_skips_referral() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 2, 0, None).await;
    seed_account(&db, 1, 1000, Some(2)).await;
    let purchase_ref = entitlement_purchase(&db, 1, 30, PurchaseFunding::Balance).await;
    let price = price_of(&db, &purchase_ref).await;

    let outcome = finalizer.finalize_from_balance(&purchase_ref).await.unwrap();
    let FinalizationOutcome::Settled(report) = outcome else {
        panic!("expected settlement");
    };
    assert_eq!(report.balance_after, Some(1000 - price));
    assert!(report.referral.is_none());
    assert_eq!(balance_of(&db, 1).await, 1000 - price);
    assert_eq!(balance_of(&db, 2).await, 0);

    let again = finalizer.finalize_from_balance(&purchase_ref).await.unwrap();
    assert!(matches!(again, FinalizationOutcome::AlreadyProcessed { .. }));
    assert_eq!(balance_of(&db, 1).await, 1000 - price);
}

#[tokio::test]
async fn balance_purchase_with_low_balance_is_rejected_before_provisioning() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 1, 100, None).await;
    let purchase_ref = entitlement_purchase(&db, 1, 30, PurchaseFunding::Balance).await;
    let price = price_of(&db, &purchase_ref).await;

    let outcome = finalizer.finalize_from_balance(&purchase_ref).await.unwrap();
    assert_eq!(
        outcome,
        FinalizationOutcome::Rejected(RejectionReason::InsufficientBalance {
            required: price,
            available: 100,
        })
    );
    assert_eq!(panel.creates(), 0);
    assert_eq!(balance_of(&db, 1).await, 100);
}

#[tokio::test]
async fn external_purchase_cannot_be_paid_from_balance() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 1, 5000, None).await;
    let purchase_ref = entitlement_purchase(&db, 1, 30, PurchaseFunding::External).await;

    let outcome = finalizer.finalize_from_balance(&purchase_ref).await.unwrap();
    assert_eq!(
        outcome,
        FinalizationOutcome::Rejected(RejectionReason::FundingMismatch)
    );
}

#[tokio::test]
async fn external_purchase_rewards_referrer_once() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 2, 0, None).await;
    seed_account(&db, 1, 0, Some(2)).await;
    let purchase_ref = entitlement_purchase(&db, 1, 30, PurchaseFunding::External).await;
    let price = price_of(&db, &purchase_ref).await;

    let outcome = finalizer
        .finalize(confirmation(&purchase_ref, "ch-ref", price))
        .await
        .unwrap();
    let FinalizationOutcome::Settled(report) = outcome else {
        panic!("expected settlement");
    };
    let reward = report.referral.unwrap();
    assert_eq!(reward.referrer_id, 2);
    assert_eq!(reward.amount, price / 10);

    finalizer
        .finalize(confirmation(&purchase_ref, "ch-ref", price))
        .await
        .unwrap();
    assert_eq!(balance_of(&db, 2).await, price / 10);
    let rows = rewards::Entity::find()
        .filter(rewards::Column::PurchaseRef.eq(purchase_ref.as_str()))
        .count(&db)
        .await
        .unwrap();
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn concurrent_purchases_for_one_account_keep_one_credential() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 1, 0, None).await;
    let a = entitlement_purchase(&db, 1, 30, PurchaseFunding::External).await;
    let b = entitlement_purchase(&db, 1, 30, PurchaseFunding::External).await;
    let price = price_of(&db, &a).await;

    let before = time::now();
    let (ra, rb) = tokio::join!(
        finalizer.finalize(confirmation(&a, "ch-a", price)),
        finalizer.finalize(confirmation(&b, "ch-b", price)),
    );
    assert!(ra.unwrap().is_settled());
    assert!(rb.unwrap().is_settled());

    let row = entitlement_of(&db, 1).await.unwrap();
    assert_eq!(panel.credential_ids(), vec![row.credential_id.clone()]);
    assert!(row.expires_at >= before + Duration::days(60));
    assert_eq!(panel.expiry_of(&row.credential_id), Some(row.expires_at));
    assert_eq!(payment_count(&db).await, 2);
}

#[tokio::test]
async fn admin_grant_issues_without_payment() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);

    let change = finalizer.admin_grant(9, 7).await.unwrap();
    assert_eq!(change.action, GrantAction::NewIssuance);
    assert!(change.provisioning_synced);
    assert_eq!(panel.credential_ids(), vec![change.credential_id.clone()]);
    assert_eq!(payment_count(&db).await, 0);
    assert_eq!(balance_of(&db, 9).await, 0);

    let renewed = finalizer.admin_grant(9, 7).await.unwrap();
    assert_eq!(renewed.action, GrantAction::Renewal);
    assert_eq!(renewed.credential_id, change.credential_id);
    assert_eq!(renewed.expires_at, change.expires_at + Duration::days(7));

    assert!(matches!(
        finalizer.admin_grant(9, 0).await,
        Err(AppError::ValidationError(_))
    ));
}

#[tokio::test]
async fn reissue_swaps_credential_and_removes_the_old_one() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 1, 0, None).await;
    let expiry = time::now() + Duration::days(10);
    seed_entitlement(&db, 1, "cred-1", expiry).await;
    panel.with_credential("cred-1", expiry);

    let change = finalizer.reissue_credential(1).await.unwrap();
    assert_ne!(change.credential_id, "cred-1");
    assert_eq!(change.expires_at, expiry);
    assert_eq!(panel.credential_ids(), vec![change.credential_id.clone()]);
    assert_eq!(panel.expiry_of(&change.credential_id), Some(expiry));

    let row = entitlement_of(&db, 1).await.unwrap();
    assert_eq!(row.credential_id, change.credential_id);
    assert!(row.is_in_sync());
}

#[tokio::test]
async fn reissue_needs_an_active_entitlement() {
    let db = setup_db().await;
    let panel = FakeProvisioning::new();
    let finalizer = finalizer(&db, &panel);
    seed_account(&db, 1, 0, None).await;
    seed_entitlement(&db, 1, "cred-1", time::now() - Duration::days(1)).await;

    assert!(matches!(
        finalizer.reissue_credential(1).await,
        Err(AppError::NotFound(_))
    ));
    assert_eq!(panel.creates(), 0);
}
