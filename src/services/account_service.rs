use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, Order, PaginatorTrait, QueryFilter, QueryOrder,
    QuerySelect, TransactionTrait,
};

use crate::entities::payment_entity as payments;
use crate::error::{AppError, AppResult};
use crate::models::{
    AccountResponse, BindReferrerResponse, PaginatedResponse, PaginationParams, PaymentResponse,
};
use crate::services::{AccountStore, EntitlementGrantor};

/// Read side of accounts plus the few user-initiated account mutations.
#[derive(Clone)]
pub struct AccountService {
    pool: DatabaseConnection,
}

impl AccountService {
    pub fn new(pool: DatabaseConnection) -> Self {
        Self { pool }
    }

    pub async fn get_account(&self, account_id: i64) -> AppResult<AccountResponse> {
        let account = AccountStore::find(&self.pool, account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Account {account_id} not found")))?;
        let entitlement = EntitlementGrantor::find(&self.pool, account_id).await?;

        Ok(AccountResponse {
            id: account.id,
            balance: account.balance,
            referrer_id: account.referrer_id,
            auto_renew: account.auto_renew,
            entitlement: entitlement.map(Into::into),
        })
    }

    pub async fn list_payments(
        &self,
        account_id: i64,
        params: &PaginationParams,
    ) -> AppResult<PaginatedResponse<PaymentResponse>> {
        let base_query = payments::Entity::find().filter(payments::Column::AccountId.eq(account_id));
        let total = base_query.clone().count(&self.pool).await?;

        let items = base_query
            .order_by(payments::Column::CreatedAt, Order::Desc)
            .order_by(payments::Column::Id, Order::Desc)
            .limit(params.per_page())
            .offset(params.offset())
            .all(&self.pool)
            .await?;

        Ok(PaginatedResponse::new(
            items.into_iter().map(Into::into).collect(),
            params,
            total,
        ))
    }

    /// Bind a referrer once. A second bind keeps the first referrer.
    pub async fn bind_referrer(
        &self,
        account_id: i64,
        referrer_id: i64,
    ) -> AppResult<BindReferrerResponse> {
        if AccountStore::find(&self.pool, referrer_id).await?.is_none() {
            return Err(AppError::NotFound(format!(
                "Referrer {referrer_id} not found"
            )));
        }
        AccountStore::ensure_account(&self.pool, account_id).await?;
        let txn = self.pool.begin().await?;
        let bound = AccountStore::bind_referrer(&txn, account_id, referrer_id).await?;
        txn.commit().await?;
        let account = AccountStore::find(&self.pool, account_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Account {account_id} not found")))?;

        if bound {
            log::info!("Account {account_id} referred by {referrer_id}");
        }
        Ok(BindReferrerResponse {
            bound,
            referrer_id: account.referrer_id,
        })
    }

    pub async fn set_auto_renew(&self, account_id: i64, enabled: bool) -> AppResult<()> {
        AccountStore::set_auto_renew(&self.pool, account_id, enabled).await
    }
}
