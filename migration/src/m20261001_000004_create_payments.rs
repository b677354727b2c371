use sea_orm_migration::prelude::*;

use crate::m20261001_000001_create_accounts::Accounts;

#[derive(DeriveIden)]
enum Payments {
    Table,
    Id,
    PurchaseRef,
    AccountId,
    Provider,
    ProviderChargeId,
    Amount,
    CreatedAt,
}

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Payments::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Payments::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Payments::PurchaseRef)
                            .string_len(64)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Payments::AccountId).big_integer().not_null())
                    .col(ColumnDef::new(Payments::Provider).string_len(64).not_null())
                    .col(
                        ColumnDef::new(Payments::ProviderChargeId)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Payments::Amount)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Payments::CreatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp())
                            .null(),
                    )
                    .check(Expr::col(Payments::Amount).gt(0))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_payments_account")
                            .from(Payments::Table, Payments::AccountId)
                            .to(Accounts::Table, Accounts::Id),
                    )
                    .to_owned(),
            )
            .await?;

        // hard backstop against double credit: one row per provider charge
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("uq_payments_provider_charge")
                    .table(Payments::Table)
                    .col(Payments::Provider)
                    .col(Payments::ProviderChargeId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_payments_account")
                    .table(Payments::Table)
                    .col(Payments::AccountId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().if_exists().table(Payments::Table).to_owned())
            .await?;
        Ok(())
    }
}
