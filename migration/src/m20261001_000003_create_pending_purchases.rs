use sea_orm_migration::prelude::*;

use crate::m20261001_000001_create_accounts::Accounts;

#[derive(DeriveIden)]
enum PendingPurchases {
    Table,
    Id,
    PurchaseRef,
    AccountId,
    Kind,
    Funding,
    DurationDays,
    Price,
    Status,
    InvoiceRef,
    CreatedAt,
    ExpiresAt,
    SettledAt,
    UpdatedAt,
}

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PendingPurchases::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PendingPurchases::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(PendingPurchases::PurchaseRef)
                            .string_len(64)
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(PendingPurchases::AccountId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PendingPurchases::Kind)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PendingPurchases::Funding)
                            .string_len(32)
                            .not_null()
                            .default("external"),
                    )
                    .col(
                        ColumnDef::new(PendingPurchases::DurationDays)
                            .integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(PendingPurchases::Price)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PendingPurchases::Status)
                            .string_len(32)
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(PendingPurchases::InvoiceRef)
                            .string_len(255)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(PendingPurchases::CreatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp())
                            .null(),
                    )
                    .col(
                        ColumnDef::new(PendingPurchases::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PendingPurchases::SettledAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(PendingPurchases::UpdatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp())
                            .null(),
                    )
                    .check(Expr::col(PendingPurchases::Price).gt(0))
                    .check(
                        Expr::col(PendingPurchases::Kind).is_in(["entitlement", "balance_topup"]),
                    )
                    .check(Expr::col(PendingPurchases::Funding).is_in(["external", "balance"]))
                    .check(
                        Expr::col(PendingPurchases::Status).is_in(["pending", "settled", "expired"]),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_pending_purchases_account")
                            .from(PendingPurchases::Table, PendingPurchases::AccountId)
                            .to(Accounts::Table, Accounts::Id),
                    )
                    .to_owned(),
            )
            .await?;

        for (name, col) in [
            ("idx_pending_purchases_account", PendingPurchases::AccountId),
            ("idx_pending_purchases_invoice", PendingPurchases::InvoiceRef),
        ] {
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name(name)
                        .table(PendingPurchases::Table)
                        .col(col)
                        .to_owned(),
                )
                .await?;
        }

        // expiry sweep only ever looks at pending rows
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_pending_purchases_status_expires")
                    .table(PendingPurchases::Table)
                    .col(PendingPurchases::Status)
                    .col(PendingPurchases::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(
                Table::drop()
                    .if_exists()
                    .table(PendingPurchases::Table)
                    .to_owned(),
            )
            .await?;
        Ok(())
    }
}
