use sea_orm_migration::prelude::*;

use crate::m20261001_000001_create_accounts::Accounts;

#[derive(DeriveIden)]
enum Entitlements {
    Table,
    Id,
    AccountId,
    CredentialId,
    Status,
    ExpiresAt,
    IssuedAt,
    RenewedAt,
    SyncedAt,
    SyncedExpiresAt,
    CreatedAt,
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
                    .table(Entitlements::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Entitlements::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Entitlements::AccountId)
                            .big_integer()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Entitlements::CredentialId)
                            .string_len(64)
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Entitlements::Status)
                            .string_len(32)
                            .not_null()
                            .default("pending_activation"),
                    )
                    .col(
                        ColumnDef::new(Entitlements::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Entitlements::IssuedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Entitlements::RenewedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Entitlements::SyncedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Entitlements::SyncedExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Entitlements::CreatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp())
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Entitlements::UpdatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp())
                            .null(),
                    )
                    .check(Expr::col(Entitlements::Status).is_in([
                        "pending_activation",
                        "active",
                        "expired",
                    ]))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_entitlements_account")
                            .from(Entitlements::Table, Entitlements::AccountId)
                            .to(Accounts::Table, Accounts::Id),
                    )
                    .to_owned(),
            )
            .await?;

        // reconciliation and expiry sweeps scan by status + expiry
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_entitlements_status_expires")
                    .table(Entitlements::Table)
                    .col(Entitlements::Status)
                    .col(Entitlements::ExpiresAt)
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
                    .table(Entitlements::Table)
                    .to_owned(),
            )
            .await?;
        Ok(())
    }
}
