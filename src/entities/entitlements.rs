use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{DeriveActiveEnum, EnumIter};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    ToSchema,
    DeriveActiveEnum,
    EnumIter,
)]
#[sea_orm(rs_type = "String", db_type = "String(Some(32))")]
#[serde(rename_all = "snake_case")]
pub enum EntitlementStatus {
    /// Row written, credential not yet confirmed by the panel.
    #[sea_orm(string_value = "pending_activation")]
    PendingActivation,
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "expired")]
    Expired,
}

impl std::fmt::Display for EntitlementStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntitlementStatus::PendingActivation => write!(f, "pending_activation"),
            EntitlementStatus::Active => write!(f, "active"),
            EntitlementStatus::Expired => write!(f, "expired"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "entitlements")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub account_id: i64,
    #[sea_orm(unique)]
    pub credential_id: String,
    pub status: EntitlementStatus,
    pub expires_at: DateTime<Utc>,
    /// Start of the current credential epoch.
    pub issued_at: DateTime<Utc>,
    pub renewed_at: Option<DateTime<Utc>>,
    /// Last time the panel confirmed `synced_expires_at` for this credential.
    pub synced_at: Option<DateTime<Utc>>,
    pub synced_expires_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Model {
    pub fn is_in_sync(&self) -> bool {
        self.synced_at.is_some() && self.synced_expires_at == Some(self.expires_at)
    }

    /// When the entitlement last changed shape (issuance or renewal).
    pub fn last_changed_at(&self) -> DateTime<Utc> {
        self.renewed_at.unwrap_or(self.issued_at)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
