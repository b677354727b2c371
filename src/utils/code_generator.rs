use uuid::Uuid;

/// Purchase reference handed to the payment provider (`pur-` + 24 hex chars).
pub fn generate_purchase_ref() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("pur-{}", &id[..24])
}

/// Stable credential id used as the panel's user key.
pub fn generate_credential_id() -> String {
    Uuid::new_v4().to_string()
}

/// Deterministic reference for an auto-renewal of the entitlement expiring at `expires_ts`,
/// so repeated sweeps collapse onto one purchase.
pub fn auto_renewal_ref(account_id: i64, expires_ts: i64) -> String {
    format!("auto-{account_id}-{expires_ts}")
}
