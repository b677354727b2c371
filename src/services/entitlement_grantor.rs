use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait,
    IntoActiveModel, QueryFilter, Set,
};

use crate::entities::{EntitlementStatus, entitlement_entity as entitlements};
use crate::error::{AppError, AppResult};
use crate::models::{GrantAction, GrantSource};
use crate::utils::{generate_credential_id, time};

/// A credential created on the panel before the transaction opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOneCredential {
    pub credential_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Panel work left for after the commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostCommitSync {
    Nothing,
    /// Push the new expiry onto the existing credential.
    UpdateExpiry,
    /// Create the credential; nothing exists on the panel yet.
    CreateCredential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantResult {
    pub account_id: i64,
    pub credential_id: String,
    pub expires_at: DateTime<Utc>,
    pub previous_expires_at: Option<DateTime<Utc>>,
    pub action: GrantAction,
    pub sync: PostCommitSync,
    /// Phase 1 credential the grant did not use; remove after commit.
    pub unused_credential: Option<String>,
    /// Credential of a stale entitlement that was replaced; remove after commit.
    pub replaced_credential: Option<String>,
}

/// Decides between new issuance and renewal and writes the entitlement row.
#[derive(Clone)]
pub struct EntitlementGrantor {
    stale_after: Duration,
}

impl EntitlementGrantor {
    pub fn new(stale_after_days: i64) -> Self {
        Self {
            stale_after: Duration::days(stale_after_days),
        }
    }

    /// Expired for longer than the stale threshold.
    pub fn is_stale(&self, entitlement: &entitlements::Model, now: DateTime<Utc>) -> bool {
        entitlement.expires_at + self.stale_after < now
    }

    pub fn requires_new_credential(
        &self,
        current: Option<&entitlements::Model>,
        now: DateTime<Utc>,
    ) -> bool {
        match current {
            None => true,
            Some(e) => self.is_stale(e, now),
        }
    }

    /// Renewals compound onto whichever is later, the current expiry or now.
    pub fn renewal_expiry(
        current_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> DateTime<Utc> {
        current_expiry.max(now) + duration
    }

    pub async fn find<C: ConnectionTrait>(
        db: &C,
        account_id: i64,
    ) -> AppResult<Option<entitlements::Model>> {
        Ok(entitlements::Entity::find()
            .filter(entitlements::Column::AccountId.eq(account_id))
            .one(db)
            .await?)
    }

    /// Apply `days` of entitlement to the account. The caller holds the account lock.
    pub async fn grant(
        &self,
        txn: &DatabaseTransaction,
        account_id: i64,
        days: i32,
        source: GrantSource,
        phase_one: Option<&PhaseOneCredential>,
    ) -> AppResult<GrantResult> {
        if days <= 0 {
            return Err(AppError::ValidationError(format!(
                "Entitlement duration must be positive, got {days}"
            )));
        }
        let duration = Duration::days(days as i64);
        let now = time::now();
        let current = Self::find(txn, account_id).await?;

        let result = match current {
            Some(existing) if !self.is_stale(&existing, now) => {
                self.renew(txn, existing, now, duration, phase_one).await?
            }
            stale_or_none => {
                self.issue(txn, account_id, stale_or_none, now, duration, phase_one)
                    .await?
            }
        };

        if let Some(previous) = result.previous_expires_at
            && result.expires_at <= previous
        {
            log::error!(
                target: "critical",
                "Expiry would not advance for account {account_id}: {previous} -> {}",
                result.expires_at
            );
            return Err(AppError::InvariantBreach(format!(
                "expiry for account {account_id} would move from {previous} to {}",
                result.expires_at
            )));
        }

        log::info!(
            "Entitlement {:?} for account {account_id} via {source:?}: credential {} until {}",
            result.action,
            result.credential_id,
            result.expires_at
        );
        Ok(result)
    }

    async fn renew(
        &self,
        txn: &DatabaseTransaction,
        existing: entitlements::Model,
        now: DateTime<Utc>,
        duration: Duration,
        phase_one: Option<&PhaseOneCredential>,
    ) -> AppResult<GrantResult> {
        let previous = existing.expires_at;
        let expires_at = Self::renewal_expiry(previous, now, duration);
        let account_id = existing.account_id;
        let credential_id = existing.credential_id.clone();
        // never confirmed on the panel: stays pending until a sync succeeds
        let status = match existing.status {
            EntitlementStatus::PendingActivation => EntitlementStatus::PendingActivation,
            _ => EntitlementStatus::Active,
        };

        let mut am = existing.into_active_model();
        am.expires_at = Set(expires_at);
        am.renewed_at = Set(Some(now));
        am.status = Set(status);
        am.updated_at = Set(Some(now));
        am.update(txn).await?;

        Ok(GrantResult {
            account_id,
            credential_id,
            expires_at,
            previous_expires_at: Some(previous),
            action: GrantAction::Renewal,
            sync: PostCommitSync::UpdateExpiry,
            unused_credential: phase_one.map(|p| p.credential_id.clone()),
            replaced_credential: None,
        })
    }

    async fn issue(
        &self,
        txn: &DatabaseTransaction,
        account_id: i64,
        stale: Option<entitlements::Model>,
        now: DateTime<Utc>,
        duration: Duration,
        phase_one: Option<&PhaseOneCredential>,
    ) -> AppResult<GrantResult> {
        let (credential_id, expires_at, status, synced, action, sync) = match phase_one {
            Some(p) => (
                p.credential_id.clone(),
                p.expires_at,
                EntitlementStatus::Active,
                Some(p.expires_at),
                GrantAction::NewIssuance,
                PostCommitSync::Nothing,
            ),
            // the peek saw a renewal, but the entitlement went stale before we got the lock
            None => (
                generate_credential_id(),
                now + duration,
                EntitlementStatus::PendingActivation,
                None,
                GrantAction::PendingActivation,
                PostCommitSync::CreateCredential,
            ),
        };

        let previous_expires_at = stale.as_ref().map(|e| e.expires_at);
        let replaced_credential = stale.as_ref().map(|e| e.credential_id.clone());

        match stale {
            Some(existing) => {
                let mut am = existing.into_active_model();
                am.credential_id = Set(credential_id.clone());
                am.status = Set(status);
                am.expires_at = Set(expires_at);
                am.issued_at = Set(now);
                am.renewed_at = Set(None);
                am.synced_at = Set(synced.map(|_| now));
                am.synced_expires_at = Set(synced);
                am.updated_at = Set(Some(now));
                am.update(txn).await?;
            }
            None => {
                entitlements::ActiveModel {
                    account_id: Set(account_id),
                    credential_id: Set(credential_id.clone()),
                    status: Set(status),
                    expires_at: Set(expires_at),
                    issued_at: Set(now),
                    renewed_at: Set(None),
                    synced_at: Set(synced.map(|_| now)),
                    synced_expires_at: Set(synced),
                    created_at: Set(Some(now)),
                    updated_at: Set(Some(now)),
                    ..Default::default()
                }
                .insert(txn)
                .await?;
            }
        }

        Ok(GrantResult {
            account_id,
            credential_id,
            expires_at,
            previous_expires_at,
            action,
            sync,
            unused_credential: None,
            replaced_credential,
        })
    }

    /// Record that the panel now holds `expires_at` for `credential_id`.
    pub async fn mark_synced<C: ConnectionTrait>(
        db: &C,
        account_id: i64,
        credential_id: &str,
        expires_at: DateTime<Utc>,
    ) -> AppResult<()> {
        let now = time::now();
        entitlements::Entity::update_many()
            .col_expr(entitlements::Column::SyncedAt, Expr::value(now))
            .col_expr(entitlements::Column::SyncedExpiresAt, Expr::value(expires_at))
            .col_expr(entitlements::Column::UpdatedAt, Expr::value(now))
            .filter(entitlements::Column::AccountId.eq(account_id))
            .filter(entitlements::Column::CredentialId.eq(credential_id))
            .exec(db)
            .await?;
        entitlements::Entity::update_many()
            .col_expr(
                entitlements::Column::Status,
                Expr::value(EntitlementStatus::Active),
            )
            .filter(entitlements::Column::AccountId.eq(account_id))
            .filter(entitlements::Column::CredentialId.eq(credential_id))
            .filter(entitlements::Column::Status.eq(EntitlementStatus::PendingActivation))
            .exec(db)
            .await?;
        Ok(())
    }

    /// `active`/`pending_activation` rows past their expiry become `expired`.
    pub async fn expire_lapsed<C: ConnectionTrait>(db: &C) -> AppResult<u64> {
        let now = time::now();
        let res = entitlements::Entity::update_many()
            .col_expr(
                entitlements::Column::Status,
                Expr::value(EntitlementStatus::Expired),
            )
            .col_expr(entitlements::Column::UpdatedAt, Expr::value(now))
            .filter(entitlements::Column::Status.is_in([
                EntitlementStatus::Active,
                EntitlementStatus::PendingActivation,
            ]))
            .filter(entitlements::Column::ExpiresAt.lt(now))
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }
}
