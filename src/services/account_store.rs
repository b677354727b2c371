use std::collections::HashSet;

use sea_orm::sea_query::{Expr, OnConflict, Query};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseBackend, DatabaseTransaction, EntityTrait, QueryFilter,
    QuerySelect,
};

use crate::entities::account_entity as accounts;
use crate::error::{AppError, AppResult};
use crate::utils::time;

/// Balance and referrer mutations on the `accounts` row.
///
/// Everything that decides a balance change from a read must run inside a
/// transaction that called [`AccountStore::lock_account`] first.
pub struct AccountStore;

impl AccountStore {
    /// Row lock on the account for the rest of `txn`. Safe to call more than once.
    pub async fn lock_account(
        txn: &DatabaseTransaction,
        account_id: i64,
    ) -> AppResult<accounts::Model> {
        let mut query = accounts::Entity::find_by_id(account_id);
        // SQLite serializes writers on the database file instead
        if txn.get_database_backend() != DatabaseBackend::Sqlite {
            query = query.lock_exclusive();
        }
        query
            .one(txn)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Account {account_id} not found")))
    }

    /// Adds `amount` to the balance and returns the new balance.
    pub async fn increase_balance<C: ConnectionTrait>(
        db: &C,
        account_id: i64,
        amount: i64,
    ) -> AppResult<i64> {
        if amount <= 0 {
            return Err(AppError::InvalidAmount(amount));
        }
        let res = accounts::Entity::update_many()
            .col_expr(
                accounts::Column::Balance,
                Expr::col(accounts::Column::Balance).add(amount),
            )
            .col_expr(accounts::Column::UpdatedAt, Expr::value(time::now()))
            .filter(accounts::Column::Id.eq(account_id))
            .exec(db)
            .await?;
        if res.rows_affected == 0 {
            return Err(AppError::NotFound(format!("Account {account_id} not found")));
        }
        Self::balance(db, account_id).await
    }

    /// Subtracts `amount` guarded by `balance >= amount`; returns the new balance.
    pub async fn decrease_balance(
        txn: &DatabaseTransaction,
        account_id: i64,
        amount: i64,
    ) -> AppResult<i64> {
        if amount <= 0 {
            return Err(AppError::InvalidAmount(amount));
        }
        let res = accounts::Entity::update_many()
            .col_expr(
                accounts::Column::Balance,
                Expr::col(accounts::Column::Balance).sub(amount),
            )
            .col_expr(accounts::Column::UpdatedAt, Expr::value(time::now()))
            .filter(accounts::Column::Id.eq(account_id))
            .filter(accounts::Column::Balance.gte(amount))
            .exec(txn)
            .await?;
        if res.rows_affected == 0 {
            // either the account is missing or the guard failed
            Self::balance(txn, account_id).await?;
            return Err(AppError::InsufficientBalance);
        }
        Self::balance(txn, account_id).await
    }

    /// Sets the referrer only if none is bound yet. Returns whether this call bound it.
    ///
    /// Both rows are locked in ascending id order, and a referrer whose own
    /// chain leads back to `account_id` is refused: rewards flow up the chain
    /// under the buyer's lock, so a cycle would let two purchases lock each
    /// other's rows.
    pub async fn bind_referrer(
        txn: &DatabaseTransaction,
        account_id: i64,
        referrer_id: i64,
    ) -> AppResult<bool> {
        if account_id == referrer_id {
            return Err(AppError::ValidationError(
                "An account cannot refer itself".to_string(),
            ));
        }
        let (first, second) = if account_id < referrer_id {
            (account_id, referrer_id)
        } else {
            (referrer_id, account_id)
        };
        Self::lock_account(txn, first).await?;
        Self::lock_account(txn, second).await?;

        let mut seen = HashSet::from([referrer_id]);
        let mut cursor = Self::find(txn, referrer_id)
            .await?
            .and_then(|a| a.referrer_id);
        while let Some(next) = cursor {
            if next == account_id {
                return Err(AppError::ValidationError(format!(
                    "Account {referrer_id} is already referred through {account_id}"
                )));
            }
            if !seen.insert(next) {
                break;
            }
            cursor = Self::find(txn, next).await?.and_then(|a| a.referrer_id);
        }

        let res = accounts::Entity::update_many()
            .col_expr(accounts::Column::ReferrerId, Expr::value(referrer_id))
            .col_expr(accounts::Column::UpdatedAt, Expr::value(time::now()))
            .filter(accounts::Column::Id.eq(account_id))
            .filter(accounts::Column::ReferrerId.is_null())
            .exec(txn)
            .await?;
        Ok(res.rows_affected == 1)
    }

    /// Creates the account with a zero balance if it does not exist yet.
    pub async fn ensure_account<C: ConnectionTrait>(
        db: &C,
        account_id: i64,
    ) -> AppResult<accounts::Model> {
        let now = time::now();
        let mut insert = Query::insert();
        insert
            .into_table(accounts::Entity)
            .columns([
                accounts::Column::Id,
                accounts::Column::Balance,
                accounts::Column::AutoRenew,
                accounts::Column::CreatedAt,
                accounts::Column::UpdatedAt,
            ])
            .values([
                account_id.into(),
                0i64.into(),
                false.into(),
                now.into(),
                now.into(),
            ])
            .map_err(|e| AppError::InternalError(e.to_string()))?
            .on_conflict(
                OnConflict::column(accounts::Column::Id)
                    .do_nothing()
                    .to_owned(),
            );
        let stmt = db.get_database_backend().build(&insert);
        db.execute(stmt).await?;

        Self::find(db, account_id)
            .await?
            .ok_or_else(|| AppError::InternalError(format!("Account {account_id} vanished")))
    }

    pub async fn find<C: ConnectionTrait>(
        db: &C,
        account_id: i64,
    ) -> AppResult<Option<accounts::Model>> {
        Ok(accounts::Entity::find_by_id(account_id).one(db).await?)
    }

    pub async fn set_auto_renew<C: ConnectionTrait>(
        db: &C,
        account_id: i64,
        enabled: bool,
    ) -> AppResult<()> {
        let res = accounts::Entity::update_many()
            .col_expr(accounts::Column::AutoRenew, Expr::value(enabled))
            .col_expr(accounts::Column::UpdatedAt, Expr::value(time::now()))
            .filter(accounts::Column::Id.eq(account_id))
            .exec(db)
            .await?;
        if res.rows_affected == 0 {
            return Err(AppError::NotFound(format!("Account {account_id} not found")));
        }
        Ok(())
    }

    async fn balance<C: ConnectionTrait>(db: &C, account_id: i64) -> AppResult<i64> {
        accounts::Entity::find_by_id(account_id)
            .select_only()
            .column(accounts::Column::Balance)
            .into_tuple::<i64>()
            .one(db)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Account {account_id} not found")))
    }
}
