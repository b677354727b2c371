use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::entities::{EntitlementStatus, entitlement_entity, payment_entity};

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EntitlementResponse {
    pub credential_id: String,
    pub status: EntitlementStatus,
    pub expires_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub renewed_at: Option<DateTime<Utc>>,
    pub provisioning_synced: bool,
}

impl From<entitlement_entity::Model> for EntitlementResponse {
    fn from(m: entitlement_entity::Model) -> Self {
        let provisioning_synced = m.is_in_sync();
        Self {
            credential_id: m.credential_id,
            status: m.status,
            expires_at: m.expires_at,
            issued_at: m.issued_at,
            renewed_at: m.renewed_at,
            provisioning_synced,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AccountResponse {
    pub id: i64,
    pub balance: i64,
    pub referrer_id: Option<i64>,
    pub auto_renew: bool,
    pub entitlement: Option<EntitlementResponse>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PaymentResponse {
    pub purchase_ref: String,
    pub provider: String,
    pub provider_charge_id: String,
    pub amount: i64,
    pub created_at: Option<DateTime<Utc>>,
}

impl From<payment_entity::Model> for PaymentResponse {
    fn from(m: payment_entity::Model) -> Self {
        Self {
            purchase_ref: m.purchase_ref,
            provider: m.provider,
            provider_charge_id: m.provider_charge_id,
            amount: m.amount,
            created_at: m.created_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct BindReferrerRequest {
    pub referrer_id: i64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BindReferrerResponse {
    /// False when a referrer was already bound; the existing one is kept.
    pub bound: bool,
    pub referrer_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct AutoRenewRequest {
    pub enabled: bool,
}
