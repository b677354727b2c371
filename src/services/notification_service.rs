use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use sea_orm::sea_query::{OnConflict, Query};
use sea_orm::{ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter};

use crate::config::NotificationsConfig;
use crate::entities::{
    EntitlementStatus, entitlement_entity as entitlements, notification_log_entity as log_entries,
};
use crate::error::{AppError, AppResult};
use crate::models::{GrantAction, SettlementReport};
use crate::utils::time;

pub const KIND_PURCHASE_SETTLED: &str = "purchase_settled";
pub const KIND_EXPIRY_REMINDER: &str = "expiry_reminder";
pub const KIND_AUTO_RENEW_FAILED: &str = "auto_renew_insufficient_balance";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub account_id: i64,
    pub kind: &'static str,
    pub message: String,
}

/// Where user-facing messages go. Delivery happens after commit and never
/// inside a transaction.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> AppResult<()>;
}

/// Writes notifications to the application log.
pub struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    async fn deliver(&self, notification: &Notification) -> AppResult<()> {
        log::info!(
            "Notify account {} [{}]: {}",
            notification.account_id,
            notification.kind,
            notification.message
        );
        Ok(())
    }
}

/// Sends each (account, kind, key) notification at most once, across restarts.
#[derive(Clone)]
pub struct NotificationService {
    pool: DatabaseConnection,
    sink: Arc<dyn NotificationSink>,
    config: NotificationsConfig,
}

impl NotificationService {
    pub fn new(
        pool: DatabaseConnection,
        sink: Arc<dyn NotificationSink>,
        config: NotificationsConfig,
    ) -> Self {
        Self { pool, sink, config }
    }

    /// Deliver unless this key was already claimed. Returns whether it was sent.
    pub async fn notify_once(&self, notification: Notification, dedup_key: &str) -> AppResult<bool> {
        if !self
            .claim(notification.account_id, notification.kind, dedup_key)
            .await?
        {
            return Ok(false);
        }
        if let Err(e) = self.sink.deliver(&notification).await {
            // give the key back so a later run can retry
            self.release(notification.account_id, notification.kind, dedup_key)
                .await?;
            return Err(e);
        }
        Ok(true)
    }

    pub async fn notify_settlement(&self, report: &SettlementReport) -> AppResult<bool> {
        let message = match &report.entitlement {
            Some(change) => {
                let action = match change.action {
                    GrantAction::Renewal => "renewed",
                    GrantAction::NewIssuance | GrantAction::PendingActivation => "activated",
                };
                format!(
                    "Your access was {action} until {}",
                    change.expires_at.format("%Y-%m-%d %H:%M UTC")
                )
            }
            None => format!(
                "Your balance was topped up by {}, now {}",
                report.amount,
                report.balance_after.unwrap_or_default()
            ),
        };
        self.notify_once(
            Notification {
                account_id: report.account_id,
                kind: KIND_PURCHASE_SETTLED,
                message,
            },
            &report.purchase_ref,
        )
        .await
    }

    /// Remind accounts whose entitlement runs out within the lead time.
    /// Keyed on the expiry so a renewal earns a fresh reminder.
    pub async fn send_expiry_reminders(&self) -> AppResult<u64> {
        let now = time::now();
        let horizon = now + Duration::hours(self.config.reminder_lead_hours);
        let expiring = entitlements::Entity::find()
            .filter(entitlements::Column::Status.eq(EntitlementStatus::Active))
            .filter(entitlements::Column::ExpiresAt.gt(now))
            .filter(entitlements::Column::ExpiresAt.lte(horizon))
            .all(&self.pool)
            .await?;

        let mut sent = 0;
        for entitlement in expiring {
            let notification = Notification {
                account_id: entitlement.account_id,
                kind: KIND_EXPIRY_REMINDER,
                message: format!(
                    "Your access expires at {}",
                    entitlement.expires_at.format("%Y-%m-%d %H:%M UTC")
                ),
            };
            let key = entitlement.expires_at.timestamp().to_string();
            match self.notify_once(notification, &key).await {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e) => log::warn!(
                    "Expiry reminder for account {} failed: {e}",
                    entitlement.account_id
                ),
            }
        }
        Ok(sent)
    }

    async fn claim(&self, account_id: i64, kind: &str, dedup_key: &str) -> AppResult<bool> {
        let mut insert = Query::insert();
        insert
            .into_table(log_entries::Entity)
            .columns([
                log_entries::Column::AccountId,
                log_entries::Column::Kind,
                log_entries::Column::DedupKey,
                log_entries::Column::CreatedAt,
            ])
            .values([
                account_id.into(),
                kind.into(),
                dedup_key.into(),
                time::now().into(),
            ])
            .map_err(|e| AppError::InternalError(e.to_string()))?
            .on_conflict(
                OnConflict::columns([
                    log_entries::Column::AccountId,
                    log_entries::Column::Kind,
                    log_entries::Column::DedupKey,
                ])
                .do_nothing()
                .to_owned(),
            );
        let stmt = self.pool.get_database_backend().build(&insert);
        let res = self.pool.execute(stmt).await?;
        Ok(res.rows_affected() == 1)
    }

    async fn release(&self, account_id: i64, kind: &str, dedup_key: &str) -> AppResult<()> {
        log_entries::Entity::delete_many()
            .filter(log_entries::Column::AccountId.eq(account_id))
            .filter(log_entries::Column::Kind.eq(kind))
            .filter(log_entries::Column::DedupKey.eq(dedup_key))
            .exec(&self.pool)
            .await?;
        Ok(())
    }
}
