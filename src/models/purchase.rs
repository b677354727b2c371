use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::entities::{PurchaseFunding, PurchaseKind, PurchaseStatus, pending_purchase_entity};

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreatePurchaseRequest {
    pub account_id: i64,
    pub kind: PurchaseKind,
    /// Defaults to `external`.
    pub funding: Option<PurchaseFunding>,
    /// Plan length, required for entitlement purchases.
    pub duration_days: Option<i32>,
    /// Top-up amount, required for balance top-ups.
    pub amount: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct AttachInvoiceRequest {
    pub invoice_ref: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PurchaseResponse {
    pub purchase_ref: String,
    pub account_id: i64,
    pub kind: PurchaseKind,
    pub funding: PurchaseFunding,
    pub duration_days: Option<i32>,
    pub price: i64,
    pub status: PurchaseStatus,
    pub invoice_ref: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl From<pending_purchase_entity::Model> for PurchaseResponse {
    fn from(m: pending_purchase_entity::Model) -> Self {
        Self {
            purchase_ref: m.purchase_ref,
            account_id: m.account_id,
            kind: m.kind,
            funding: m.funding,
            duration_days: m.duration_days,
            price: m.price,
            status: m.status,
            invoice_ref: m.invoice_ref,
            expires_at: m.expires_at,
            settled_at: m.settled_at,
        }
    }
}
