use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait, QueryFilter,
    QuerySelect, Set, SqlErr,
};

use crate::entities::{PurchaseStatus, payment_entity as payments, pending_purchase_entity as purchases};
use crate::error::{AppError, AppResult};
use crate::utils::time;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleAttempt {
    /// This call moved the purchase from pending to settled.
    Settled,
    AlreadySettled,
    Expired,
    Missing,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub purchase_ref: String,
    pub account_id: i64,
    pub provider: String,
    pub provider_charge_id: String,
    pub amount: i64,
}

/// Durable record of which purchases and provider charges were applied.
pub struct IdempotencyLedger;

impl IdempotencyLedger {
    /// `pending -> settled`, exactly once per purchase.
    pub async fn mark_settled(
        txn: &DatabaseTransaction,
        purchase_ref: &str,
    ) -> AppResult<SettleAttempt> {
        let now = time::now();
        let res = purchases::Entity::update_many()
            .col_expr(
                purchases::Column::Status,
                Expr::value(PurchaseStatus::Settled),
            )
            .col_expr(purchases::Column::SettledAt, Expr::value(now))
            .col_expr(purchases::Column::UpdatedAt, Expr::value(now))
            .filter(purchases::Column::PurchaseRef.eq(purchase_ref))
            .filter(purchases::Column::Status.eq(PurchaseStatus::Pending))
            .exec(txn)
            .await?;
        if res.rows_affected == 1 {
            return Ok(SettleAttempt::Settled);
        }

        Ok(match Self::purchase_status(txn, purchase_ref).await? {
            Some(PurchaseStatus::Settled) => SettleAttempt::AlreadySettled,
            Some(PurchaseStatus::Expired) => SettleAttempt::Expired,
            Some(PurchaseStatus::Pending) => {
                return Err(AppError::InvariantBreach(format!(
                    "purchase {purchase_ref} still pending after conditional settle"
                )));
            }
            None => SettleAttempt::Missing,
        })
    }

    pub async fn purchase_status<C: ConnectionTrait>(
        db: &C,
        purchase_ref: &str,
    ) -> AppResult<Option<PurchaseStatus>> {
        Ok(purchases::Entity::find()
            .select_only()
            .column(purchases::Column::Status)
            .filter(purchases::Column::PurchaseRef.eq(purchase_ref))
            .into_tuple::<PurchaseStatus>()
            .one(db)
            .await?)
    }

    pub async fn find_payment_by_charge<C: ConnectionTrait>(
        db: &C,
        provider: &str,
        provider_charge_id: &str,
    ) -> AppResult<Option<payments::Model>> {
        Ok(payments::Entity::find()
            .filter(payments::Column::Provider.eq(provider))
            .filter(payments::Column::ProviderChargeId.eq(provider_charge_id))
            .one(db)
            .await?)
    }

    /// Insert the payment row. A key collision here means the application
    /// check was bypassed and the whole transaction must abort.
    pub async fn record_payment(
        txn: &DatabaseTransaction,
        payment: NewPayment,
    ) -> AppResult<payments::Model> {
        let inserted = payments::ActiveModel {
            purchase_ref: Set(payment.purchase_ref),
            account_id: Set(payment.account_id),
            provider: Set(payment.provider.clone()),
            provider_charge_id: Set(payment.provider_charge_id.clone()),
            amount: Set(payment.amount),
            created_at: Set(Some(time::now())),
            ..Default::default()
        }
        .insert(txn)
        .await;

        match inserted {
            Ok(model) => Ok(model),
            Err(err) => match err.sql_err() {
                Some(SqlErr::UniqueConstraintViolation(_)) => {
                    log::error!(
                        target: "critical",
                        "Duplicate payment key {}/{} reached storage",
                        payment.provider,
                        payment.provider_charge_id
                    );
                    Err(AppError::DuplicatePayment {
                        provider: payment.provider,
                        charge_id: payment.provider_charge_id,
                    })
                }
                _ => Err(err.into()),
            },
        }
    }
}
