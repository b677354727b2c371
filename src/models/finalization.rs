use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::entities::PurchaseKind;
use crate::error::AppError;
use crate::models::ApiError;

/// Payment confirmation delivered by a provider webhook or poller.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentConfirmation {
    pub provider: String,
    pub provider_charge_id: String,
    pub purchase_ref: String,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GrantAction {
    NewIssuance,
    Renewal,
    /// Row written, credential creation deferred until after commit.
    PendingActivation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum GrantSource {
    Purchase,
    AutoRenewal,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct EntitlementChange {
    pub action: GrantAction,
    pub credential_id: String,
    pub expires_at: DateTime<Utc>,
    pub previous_expires_at: Option<DateTime<Utc>>,
    /// Whether the panel already reflects `expires_at`.
    pub provisioning_synced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ReferralRewardApplied {
    pub referrer_id: i64,
    pub amount: i64,
}

/// What a caller needs to tell the user after a settlement committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct SettlementReport {
    pub purchase_ref: String,
    pub account_id: i64,
    pub kind: PurchaseKind,
    pub amount: i64,
    pub entitlement: Option<EntitlementChange>,
    pub balance_after: Option<i64>,
    pub referral: Option<ReferralRewardApplied>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    PurchaseNotFound,
    PurchaseExpired,
    AmountMismatch { expected: i64, received: i64 },
    InsufficientBalance { required: i64, available: i64 },
    FundingMismatch,
    ChargeAlreadyUsed { purchase_ref: String },
}

impl RejectionReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::PurchaseNotFound => "PURCHASE_NOT_FOUND",
            RejectionReason::PurchaseExpired => "PURCHASE_EXPIRED",
            RejectionReason::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            RejectionReason::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            RejectionReason::FundingMismatch => "FUNDING_MISMATCH",
            RejectionReason::ChargeAlreadyUsed { .. } => "CHARGE_ALREADY_USED",
        }
    }

    /// Map onto the HTTP error taxonomy for endpoints that answer with a status code.
    pub fn into_error(self) -> AppError {
        match self {
            RejectionReason::PurchaseNotFound => {
                AppError::PurchaseNotActionable("Purchase not found".to_string())
            }
            RejectionReason::PurchaseExpired => {
                AppError::PurchaseNotActionable("Payment window expired".to_string())
            }
            RejectionReason::InsufficientBalance { .. } => AppError::InsufficientBalance,
            RejectionReason::ChargeAlreadyUsed { .. } => {
                AppError::ValidationError(self.to_string())
            }
            other => AppError::ValidationError(other.to_string()),
        }
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::PurchaseNotFound => write!(f, "purchase not found"),
            RejectionReason::PurchaseExpired => write!(f, "payment window expired"),
            RejectionReason::AmountMismatch { expected, received } => {
                write!(f, "amount mismatch: expected {expected}, received {received}")
            }
            RejectionReason::InsufficientBalance {
                required,
                available,
            } => write!(
                f,
                "insufficient balance: {required} required, {available} available"
            ),
            RejectionReason::FundingMismatch => {
                write!(f, "purchase cannot be paid this way")
            }
            RejectionReason::ChargeAlreadyUsed { purchase_ref } => {
                write!(f, "charge already applied to purchase {purchase_ref}")
            }
        }
    }
}

impl From<&RejectionReason> for ApiError {
    fn from(reason: &RejectionReason) -> Self {
        ApiError::new(reason.code(), reason.to_string())
    }
}

/// Result of a finalization attempt. Only `Settled` carries a new financial effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizationOutcome {
    Settled(SettlementReport),
    AlreadyProcessed { purchase_ref: String },
    Rejected(RejectionReason),
}

impl FinalizationOutcome {
    pub fn is_settled(&self) -> bool {
        matches!(self, FinalizationOutcome::Settled(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Settled,
    AlreadyProcessed,
    Rejected,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FinalizationResponse {
    pub outcome: OutcomeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<SettlementReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<ApiError>,
}

impl From<FinalizationOutcome> for FinalizationResponse {
    fn from(outcome: FinalizationOutcome) -> Self {
        match outcome {
            FinalizationOutcome::Settled(report) => Self {
                outcome: OutcomeKind::Settled,
                report: Some(report),
                rejection: None,
            },
            FinalizationOutcome::AlreadyProcessed { .. } => Self {
                outcome: OutcomeKind::AlreadyProcessed,
                report: None,
                rejection: None,
            },
            FinalizationOutcome::Rejected(reason) => Self {
                outcome: OutcomeKind::Rejected,
                report: None,
                rejection: Some(ApiError::from(&reason)),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct AdminGrantRequest {
    pub account_id: i64,
    pub days: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct ReconciliationReport {
    pub scanned: u64,
    pub recreated: u64,
    pub updated: u64,
    pub confirmed: u64,
    /// Rows that changed under the pass and were left for the next one.
    pub skipped: u64,
    pub failed: u64,
}
