use chrono::Duration;
use sea_orm::sea_query::{Expr, OnConflict, Query};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set,
};

use crate::config::PurchasesConfig;
use crate::entities::{
    PurchaseFunding, PurchaseKind, PurchaseStatus, pending_purchase_entity as purchases,
};
use crate::error::{AppError, AppResult};
use crate::models::{CreatePurchaseRequest, PurchaseResponse};
use crate::services::AccountStore;
use crate::utils::{generate_purchase_ref, time};

/// Pending purchase lifecycle up to the point a payment arrives.
#[derive(Clone)]
pub struct PurchaseService {
    pool: DatabaseConnection,
    config: PurchasesConfig,
}

impl PurchaseService {
    pub fn new(pool: DatabaseConnection, config: PurchasesConfig) -> Self {
        Self { pool, config }
    }

    pub async fn create_purchase(&self, req: CreatePurchaseRequest) -> AppResult<PurchaseResponse> {
        let funding = req.funding.unwrap_or(PurchaseFunding::External);
        let (duration_days, price) = self
            .config
            .price_for(req.kind, funding, req.duration_days, req.amount)?;

        AccountStore::ensure_account(&self.pool, req.account_id).await?;
        let now = time::now();
        let model = purchases::ActiveModel {
            purchase_ref: Set(generate_purchase_ref()),
            account_id: Set(req.account_id),
            kind: Set(req.kind),
            funding: Set(funding),
            duration_days: Set(duration_days),
            price: Set(price),
            status: Set(PurchaseStatus::Pending),
            invoice_ref: Set(None),
            created_at: Set(Some(now)),
            expires_at: Set(now + Duration::minutes(self.config.pending_window_minutes)),
            settled_at: Set(None),
            updated_at: Set(Some(now)),
            ..Default::default()
        }
        .insert(&self.pool)
        .await?;

        log::info!(
            "Purchase {} created for account {}: {} {} at {}",
            model.purchase_ref,
            model.account_id,
            model.kind,
            model.funding,
            model.price
        );
        Ok(model.into())
    }

    /// Create a purchase under a caller-chosen reference. Returns the existing
    /// row when the reference was already used.
    pub async fn create_with_ref(
        &self,
        purchase_ref: &str,
        account_id: i64,
        duration_days: i32,
        funding: PurchaseFunding,
    ) -> AppResult<purchases::Model> {
        let (duration_days, price) =
            self.config
                .price_for(PurchaseKind::Entitlement, funding, Some(duration_days), None)?;
        let now = time::now();

        let mut insert = Query::insert();
        insert
            .into_table(purchases::Entity)
            .columns([
                purchases::Column::PurchaseRef,
                purchases::Column::AccountId,
                purchases::Column::Kind,
                purchases::Column::Funding,
                purchases::Column::DurationDays,
                purchases::Column::Price,
                purchases::Column::Status,
                purchases::Column::CreatedAt,
                purchases::Column::ExpiresAt,
                purchases::Column::UpdatedAt,
            ])
            .values([
                purchase_ref.into(),
                account_id.into(),
                PurchaseKind::Entitlement.to_string().into(),
                funding.to_string().into(),
                duration_days.into(),
                price.into(),
                PurchaseStatus::Pending.to_string().into(),
                now.into(),
                (now + Duration::minutes(self.config.pending_window_minutes)).into(),
                now.into(),
            ])
            .map_err(|e| AppError::InternalError(e.to_string()))?
            .on_conflict(
                OnConflict::column(purchases::Column::PurchaseRef)
                    .do_nothing()
                    .to_owned(),
            );
        let stmt = self.pool.get_database_backend().build(&insert);
        self.pool.execute(stmt).await?;

        Self::find_model(&self.pool, purchase_ref)
            .await?
            .ok_or_else(|| AppError::InternalError(format!("Purchase {purchase_ref} vanished")))
    }

    /// Record the provider invoice while the purchase is still payable.
    pub async fn attach_invoice(
        &self,
        purchase_ref: &str,
        invoice_ref: &str,
    ) -> AppResult<PurchaseResponse> {
        if invoice_ref.trim().is_empty() {
            return Err(AppError::ValidationError(
                "invoice_ref must not be empty".to_string(),
            ));
        }
        let res = purchases::Entity::update_many()
            .col_expr(purchases::Column::InvoiceRef, Expr::value(invoice_ref))
            .col_expr(purchases::Column::UpdatedAt, Expr::value(time::now()))
            .filter(purchases::Column::PurchaseRef.eq(purchase_ref))
            .filter(purchases::Column::Status.eq(PurchaseStatus::Pending))
            .exec(&self.pool)
            .await?;

        let purchase = Self::find_model(&self.pool, purchase_ref)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Purchase {purchase_ref} not found")))?;
        if res.rows_affected == 0 {
            return Err(AppError::PurchaseNotActionable(format!(
                "Purchase {purchase_ref} is {}",
                purchase.status
            )));
        }
        Ok(purchase.into())
    }

    pub async fn find_purchase(&self, purchase_ref: &str) -> AppResult<PurchaseResponse> {
        Self::find_model(&self.pool, purchase_ref)
            .await?
            .map(Into::into)
            .ok_or_else(|| AppError::NotFound(format!("Purchase {purchase_ref} not found")))
    }

    pub async fn find_model<C: ConnectionTrait>(
        db: &C,
        purchase_ref: &str,
    ) -> AppResult<Option<purchases::Model>> {
        Ok(purchases::Entity::find()
            .filter(purchases::Column::PurchaseRef.eq(purchase_ref))
            .one(db)
            .await?)
    }

    /// Pending purchases past their payment window become `expired`.
    pub async fn expire_stale_purchases(&self) -> AppResult<u64> {
        let now = time::now();
        let res = purchases::Entity::update_many()
            .col_expr(purchases::Column::Status, Expr::value(PurchaseStatus::Expired))
            .col_expr(purchases::Column::UpdatedAt, Expr::value(now))
            .filter(purchases::Column::Status.eq(PurchaseStatus::Pending))
            .filter(purchases::Column::ExpiresAt.lt(now))
            .exec(&self.pool)
            .await?;
        if res.rows_affected > 0 {
            log::info!("Expired {} pending purchases", res.rows_affected);
        }
        Ok(res.rows_affected)
    }
}
