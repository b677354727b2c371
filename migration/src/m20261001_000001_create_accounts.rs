use sea_orm_migration::prelude::*;

#[derive(DeriveIden)]
pub enum Accounts {
    Table,
    Id,
    Balance,
    ReferrerId,
    AutoRenew,
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
                    .table(Accounts::Table)
                    .if_not_exists()
                    // account ids are assigned by the chat platform, not by us
                    .col(
                        ColumnDef::new(Accounts::Id)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Accounts::Balance)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Accounts::ReferrerId)
                            .big_integer()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Accounts::AutoRenew)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Accounts::CreatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp())
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Accounts::UpdatedAt)
                            .timestamp_with_time_zone()
                            .default(Expr::current_timestamp())
                            .null(),
                    )
                    // last line of defence against a missed account lock
                    .check(Expr::col(Accounts::Balance).gte(0))
                    .check(Expr::col(Accounts::ReferrerId).ne(Expr::col(Accounts::Id)))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_accounts_referrer")
                            .from(Accounts::Table, Accounts::ReferrerId)
                            .to(Accounts::Table, Accounts::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_accounts_referrer")
                    .table(Accounts::Table)
                    .col(Accounts::ReferrerId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().if_exists().table(Accounts::Table).to_owned())
            .await?;
        Ok(())
    }
}
