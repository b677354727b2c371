use sea_orm_migration::prelude::*;

use crate::m20261001_000001_create_accounts::Accounts;

#[derive(DeriveIden)]
enum ReferralRewards {
    Table,
    Id,
    ReferrerId,
    ReferredId,
    PurchaseRef,
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
                    .table(ReferralRewards::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ReferralRewards::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ReferralRewards::ReferrerId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReferralRewards::ReferredId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReferralRewards::PurchaseRef)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReferralRewards::Amount)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ReferralRewards::CreatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp())
                            .null(),
                    )
                    .check(Expr::col(ReferralRewards::Amount).gt(0))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_referral_rewards_referrer")
                            .from(ReferralRewards::Table, ReferralRewards::ReferrerId)
                            .to(Accounts::Table, Accounts::Id),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_referral_rewards_referred")
                            .from(ReferralRewards::Table, ReferralRewards::ReferredId)
                            .to(Accounts::Table, Accounts::Id),
                    )
                    .to_owned(),
            )
            .await?;

        // unique (referrer_id, purchase_ref)
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("uq_referral_rewards_referrer_purchase")
                    .table(ReferralRewards::Table)
                    .col(ReferralRewards::ReferrerId)
                    .col(ReferralRewards::PurchaseRef)
                    .unique()
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
                    .table(ReferralRewards::Table)
                    .to_owned(),
            )
            .await?;
        Ok(())
    }
}
