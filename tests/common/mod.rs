#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, Set,
};

use migration::{Migrator, MigratorTrait};
use vpnshop_backend::config::{PurchasesConfig, ReferralConfig};
use vpnshop_backend::entities::{
    EntitlementStatus, PurchaseFunding, PurchaseKind, account_entity as accounts,
    entitlement_entity as entitlements, payment_entity as payments,
    pending_purchase_entity as purchases,
};
use vpnshop_backend::external::{ProvisioningError, ProvisioningPort, RemoteCredential};
use vpnshop_backend::models::{CreatePurchaseRequest, PaymentConfirmation};
use vpnshop_backend::error::{AppError, AppResult};
use vpnshop_backend::services::{
    EntitlementGrantor, Notification, NotificationSink, PurchaseFinalizer, PurchaseService,
};
use vpnshop_backend::utils::time;

/// Fresh in-memory database migrated with the production migrations. One
/// connection, so transactions serialize the way row locks would serialize
/// them on Postgres. SQLite enforces the foreign keys on this connection.
pub async fn setup_db() -> DatabaseConnection {
    let mut opts = ConnectOptions::new("sqlite::memory:".to_string());
    opts.max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    let db = Database::connect(opts).await.expect("connect sqlite");
    Migrator::up(&db, None).await.expect("run migrations");
    db
}

/// Makes every payment insert fail, forcing a rollback late in the transaction.
pub async fn break_payment_inserts(db: &DatabaseConnection) {
    db.execute_unprepared(
        "CREATE TRIGGER fail_payments BEFORE INSERT ON payments \
         BEGIN SELECT RAISE(ABORT, 'forced failure'); END",
    )
    .await
    .expect("create trigger");
}

/// In-memory panel with switchable failures.
#[derive(Default)]
pub struct FakeProvisioning {
    credentials: Mutex<HashMap<String, RemoteCredential>>,
    pub fail_create: AtomicBool,
    pub fail_update: AtomicBool,
    pub fail_remove: AtomicBool,
    pub fail_lookup: AtomicBool,
    creates: AtomicU32,
    updates: AtomicU32,
    removes: AtomicU32,
}

impl FakeProvisioning {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_credential(&self, credential_id: &str, expires_at: DateTime<Utc>) {
        self.credentials.lock().unwrap().insert(
            credential_id.to_string(),
            RemoteCredential {
                credential_id: credential_id.to_string(),
                expires_at,
            },
        );
    }

    pub fn expiry_of(&self, credential_id: &str) -> Option<DateTime<Utc>> {
        self.credentials
            .lock()
            .unwrap()
            .get(credential_id)
            .map(|c| c.expires_at)
    }

    pub fn credential_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.credentials.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn creates(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> u32 {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> u32 {
        self.removes.load(Ordering::SeqCst)
    }
}

fn down() -> ProvisioningError {
    ProvisioningError::Transport("panel down".to_string())
}

#[async_trait]
impl ProvisioningPort for FakeProvisioning {
    async fn create(
        &self,
        _account_id: i64,
        credential_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<String, ProvisioningError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(down());
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.credentials.lock().unwrap().insert(
            credential_id.to_string(),
            RemoteCredential {
                credential_id: credential_id.to_string(),
                expires_at,
            },
        );
        Ok(credential_id.to_string())
    }

    async fn update(
        &self,
        credential_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ProvisioningError> {
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(down());
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        match self.credentials.lock().unwrap().get_mut(credential_id) {
            Some(c) => {
                c.expires_at = expires_at;
                Ok(())
            }
            None => Err(ProvisioningError::NotFound(credential_id.to_string())),
        }
    }

    async fn remove(&self, credential_id: &str) -> Result<(), ProvisioningError> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(down());
        }
        self.removes.fetch_add(1, Ordering::SeqCst);
        match self.credentials.lock().unwrap().remove(credential_id) {
            Some(_) => Ok(()),
            None => Err(ProvisioningError::NotFound(credential_id.to_string())),
        }
    }

    async fn lookup(
        &self,
        credential_id: &str,
    ) -> Result<Option<RemoteCredential>, ProvisioningError> {
        if self.fail_lookup.load(Ordering::SeqCst) {
            return Err(down());
        }
        Ok(self.credentials.lock().unwrap().get(credential_id).cloned())
    }
}

/// Keeps every delivered notification; can be told to fail.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<Notification>>,
    pub fail: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn count_of(&self, kind: &str) -> usize {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.kind == kind)
            .count()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver(&self, notification: &Notification) -> AppResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::InternalError("sink down".to_string()));
        }
        self.delivered.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub fn finalizer(db: &DatabaseConnection, panel: &Arc<FakeProvisioning>) -> PurchaseFinalizer {
    PurchaseFinalizer::new(
        db.clone(),
        panel.clone(),
        EntitlementGrantor::new(3),
        ReferralConfig { reward_percent: 10 },
        0,
    )
}

pub fn purchase_service(db: &DatabaseConnection) -> PurchaseService {
    PurchaseService::new(db.clone(), PurchasesConfig::default())
}

pub async fn seed_account(
    db: &DatabaseConnection,
    id: i64,
    balance: i64,
    referrer_id: Option<i64>,
) -> accounts::Model {
    let now = time::now();
    accounts::ActiveModel {
        id: Set(id),
        balance: Set(balance),
        referrer_id: Set(referrer_id),
        auto_renew: Set(false),
        created_at: Set(Some(now)),
        updated_at: Set(Some(now)),
    }
    .insert(db)
    .await
    .expect("seed account")
}

/// An active entitlement the panel already agrees with.
pub async fn seed_entitlement(
    db: &DatabaseConnection,
    account_id: i64,
    credential_id: &str,
    expires_at: DateTime<Utc>,
) -> entitlements::Model {
    let now = time::now();
    entitlements::ActiveModel {
        account_id: Set(account_id),
        credential_id: Set(credential_id.to_string()),
        status: Set(EntitlementStatus::Active),
        expires_at: Set(expires_at),
        issued_at: Set(now - Duration::days(30)),
        renewed_at: Set(None),
        synced_at: Set(Some(now - Duration::days(30))),
        synced_expires_at: Set(Some(expires_at)),
        created_at: Set(Some(now)),
        updated_at: Set(Some(now)),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("seed entitlement")
}

pub async fn entitlement_purchase(
    db: &DatabaseConnection,
    account_id: i64,
    days: i32,
    funding: PurchaseFunding,
) -> String {
    purchase_service(db)
        .create_purchase(CreatePurchaseRequest {
            account_id,
            kind: PurchaseKind::Entitlement,
            funding: Some(funding),
            duration_days: Some(days),
            amount: None,
        })
        .await
        .expect("create entitlement purchase")
        .purchase_ref
}

pub async fn topup_purchase(db: &DatabaseConnection, account_id: i64, amount: i64) -> String {
    purchase_service(db)
        .create_purchase(CreatePurchaseRequest {
            account_id,
            kind: PurchaseKind::BalanceTopup,
            funding: None,
            duration_days: None,
            amount: Some(amount),
        })
        .await
        .expect("create top-up purchase")
        .purchase_ref
}

pub async fn price_of(db: &DatabaseConnection, purchase_ref: &str) -> i64 {
    PurchaseService::find_model(db, purchase_ref)
        .await
        .unwrap()
        .expect("purchase exists")
        .price
}

pub fn confirmation(purchase_ref: &str, charge_id: &str, amount: i64) -> PaymentConfirmation {
    PaymentConfirmation {
        provider: "cryptopay".to_string(),
        provider_charge_id: charge_id.to_string(),
        purchase_ref: purchase_ref.to_string(),
        amount,
    }
}

pub async fn balance_of(db: &DatabaseConnection, account_id: i64) -> i64 {
    accounts::Entity::find_by_id(account_id)
        .one(db)
        .await
        .unwrap()
        .expect("account exists")
        .balance
}

pub async fn entitlement_of(db: &DatabaseConnection, account_id: i64) -> Option<entitlements::Model> {
    EntitlementGrantor::find(db, account_id).await.unwrap()
}

pub async fn payment_count(db: &DatabaseConnection) -> u64 {
    payments::Entity::find().count(db).await.unwrap()
}

/// Push a pending purchase past its payment window.
pub async fn backdate_purchase(db: &DatabaseConnection, purchase_ref: &str) {
    purchases::Entity::update_many()
        .col_expr(
            purchases::Column::ExpiresAt,
            Expr::value(time::now() - Duration::minutes(1)),
        )
        .filter(purchases::Column::PurchaseRef.eq(purchase_ref))
        .exec(db)
        .await
        .unwrap();
}
