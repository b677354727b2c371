use chrono::Duration;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};

use crate::config::{AutoRenewalConfig, PurchasesConfig};
use crate::entities::{EntitlementStatus, PurchaseFunding, entitlement_entity as entitlements};
use crate::error::{AppError, AppResult};
use crate::models::{FinalizationOutcome, RejectionReason};
use crate::services::{
    AccountStore, KIND_AUTO_RENEW_FAILED, Notification, NotificationService, PurchaseFinalizer,
    PurchaseService,
};
use crate::utils::{auto_renewal_ref, time};

/// Renews entitlements from the account balance shortly before they lapse.
#[derive(Clone)]
pub struct AutoRenewalService {
    pool: DatabaseConnection,
    purchases: PurchaseService,
    finalizer: PurchaseFinalizer,
    notifications: NotificationService,
    config: AutoRenewalConfig,
    catalog: PurchasesConfig,
}

impl AutoRenewalService {
    pub fn new(
        pool: DatabaseConnection,
        purchases: PurchaseService,
        finalizer: PurchaseFinalizer,
        notifications: NotificationService,
        config: AutoRenewalConfig,
        catalog: PurchasesConfig,
    ) -> Self {
        Self {
            pool,
            purchases,
            finalizer,
            notifications,
            config,
            catalog,
        }
    }

    /// One pass over expiring entitlements. Returns how many were renewed.
    pub async fn run_once(&self) -> AppResult<u64> {
        if !self.config.enabled {
            return Ok(0);
        }
        let plan = self.catalog.plan(self.config.plan_days).ok_or_else(|| {
            AppError::ConfigError(format!(
                "auto_renewal.plan_days {} has no matching plan",
                self.config.plan_days
            ))
        })?;

        let now = time::now();
        let horizon = now + Duration::hours(self.config.lead_hours);
        let expiring = entitlements::Entity::find()
            .filter(entitlements::Column::Status.is_in([
                EntitlementStatus::Active,
                EntitlementStatus::PendingActivation,
            ]))
            .filter(entitlements::Column::ExpiresAt.gt(now))
            .filter(entitlements::Column::ExpiresAt.lte(horizon))
            .order_by_asc(entitlements::Column::ExpiresAt)
            .all(&self.pool)
            .await?;

        let mut renewed = 0;
        for entitlement in expiring {
            let Some(account) = AccountStore::find(&self.pool, entitlement.account_id).await? else {
                continue;
            };
            if !account.auto_renew {
                continue;
            }
            let expiry_key = entitlement.expires_at.timestamp();
            if account.balance < plan.price {
                self.notify_low_balance(account.id, plan.price, account.balance, expiry_key)
                    .await;
                continue;
            }

            match self.renew(account.id, expiry_key).await {
                Ok(true) => renewed += 1,
                Ok(false) => {}
                Err(e) => log::error!("Auto-renewal for account {} failed: {e}", account.id),
            }
        }

        if renewed > 0 {
            log::info!("Auto-renewed {renewed} entitlements");
        }
        Ok(renewed)
    }

    async fn renew(&self, account_id: i64, expiry_key: i64) -> AppResult<bool> {
        // the same expiry always maps to the same purchase, so reruns collapse
        let purchase_ref = auto_renewal_ref(account_id, expiry_key);
        self.purchases
            .create_with_ref(
                &purchase_ref,
                account_id,
                self.config.plan_days,
                PurchaseFunding::Balance,
            )
            .await?;

        match self.finalizer.finalize_from_balance(&purchase_ref).await? {
            FinalizationOutcome::Settled(report) => {
                if let Err(e) = self.notifications.notify_settlement(&report).await {
                    log::warn!("Settlement notice for {purchase_ref} not sent: {e}");
                }
                Ok(true)
            }
            FinalizationOutcome::AlreadyProcessed { .. } => Ok(false),
            FinalizationOutcome::Rejected(RejectionReason::InsufficientBalance {
                required,
                available,
            }) => {
                self.notify_low_balance(account_id, required, available, expiry_key)
                    .await;
                Ok(false)
            }
            FinalizationOutcome::Rejected(reason) => {
                log::warn!("Auto-renewal {purchase_ref} rejected: {reason}");
                Ok(false)
            }
        }
    }

    async fn notify_low_balance(&self, account_id: i64, required: i64, available: i64, key: i64) {
        let notification = Notification {
            account_id,
            kind: KIND_AUTO_RENEW_FAILED,
            message: format!(
                "Auto-renewal needs {required} but your balance is {available}. Top up to keep access."
            ),
        };
        if let Err(e) = self
            .notifications
            .notify_once(notification, &key.to_string())
            .await
        {
            log::warn!("Low balance notice for account {account_id} not sent: {e}");
        }
    }
}
