pub use sea_orm_migration::prelude::*;

mod m20261001_000001_create_accounts;
mod m20261001_000002_create_entitlements;
mod m20261001_000003_create_pending_purchases;
mod m20261001_000004_create_payments;
mod m20261001_000005_create_referral_rewards;
mod m20261001_000006_create_notification_log;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20261001_000001_create_accounts::Migration),
            Box::new(m20261001_000002_create_entitlements::Migration),
            Box::new(m20261001_000003_create_pending_purchases::Migration),
            Box::new(m20261001_000004_create_payments::Migration),
            Box::new(m20261001_000005_create_referral_rewards::Migration),
            Box::new(m20261001_000006_create_notification_log::Migration),
        ]
    }
}
