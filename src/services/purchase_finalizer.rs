//! Purchase settlement saga.
//!
//! 1. Peek at the entitlement without a lock. If a new credential is needed,
//!    create it on the panel now (Phase 1), outside any transaction.
//! 2. One transaction: lock account, `pending -> settled`, grant, balance
//!    mutation, payment row, referral reward.
//! 3. On failure after Phase 1, remove the Phase 1 credential (compensation).
//!    If that removal fails the credential is orphaned and we say so loudly.
//! 4. After commit, push renewed expiries to the panel (Phase 2). Failures
//!    there are left to the reconciliation worker.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ConnectionTrait, DatabaseBackend, DatabaseConnection, DatabaseTransaction,
    IntoActiveModel, Set, TransactionTrait,
};

use crate::config::ReferralConfig;
use crate::entities::{
    EntitlementStatus, PurchaseFunding, PurchaseKind, PurchaseStatus, pending_purchase_entity,
};
use crate::error::{AppError, AppResult};
use crate::external::{ProvisioningPort, remove_credential, sync_expiry};
use crate::models::{
    EntitlementChange, FinalizationOutcome, GrantAction, GrantSource, PaymentConfirmation,
    ReferralRewardApplied, RejectionReason, SettlementReport,
};
use crate::services::{
    AccountStore, EntitlementGrantor, GrantResult, IdempotencyLedger, NewPayment,
    PhaseOneCredential, PostCommitSync, PurchaseService, ReferralRewarder, SettleAttempt,
};
use crate::utils::{generate_credential_id, time};

/// Provider name recorded for purchases paid from the internal balance.
pub const BALANCE_PROVIDER: &str = "balance";

enum PaymentSource {
    External {
        provider: String,
        provider_charge_id: String,
    },
    Balance,
}

struct Committed {
    grant: Option<GrantResult>,
    balance_after: Option<i64>,
    referral: Option<ReferralRewardApplied>,
}

enum TxOutcome {
    Committed(Committed),
    AlreadySettled,
    Rejected(RejectionReason),
}

#[derive(Clone)]
pub struct PurchaseFinalizer {
    pool: DatabaseConnection,
    provisioning: Arc<dyn ProvisioningPort>,
    grantor: EntitlementGrantor,
    referral: ReferralConfig,
    statement_timeout_ms: u64,
}

impl PurchaseFinalizer {
    pub fn new(
        pool: DatabaseConnection,
        provisioning: Arc<dyn ProvisioningPort>,
        grantor: EntitlementGrantor,
        referral: ReferralConfig,
        statement_timeout_ms: u64,
    ) -> Self {
        Self {
            pool,
            provisioning,
            grantor,
            referral,
            statement_timeout_ms,
        }
    }

    /// Apply a provider payment confirmation. Safe to call any number of times.
    pub async fn finalize(
        &self,
        confirmation: PaymentConfirmation,
    ) -> AppResult<FinalizationOutcome> {
        let Some(purchase) =
            PurchaseService::find_model(&self.pool, &confirmation.purchase_ref).await?
        else {
            return Ok(FinalizationOutcome::Rejected(
                RejectionReason::PurchaseNotFound,
            ));
        };

        // a charge id may only ever settle one purchase
        if let Some(existing) = IdempotencyLedger::find_payment_by_charge(
            &self.pool,
            &confirmation.provider,
            &confirmation.provider_charge_id,
        )
        .await?
        {
            if existing.purchase_ref == purchase.purchase_ref {
                return Ok(FinalizationOutcome::AlreadyProcessed {
                    purchase_ref: purchase.purchase_ref,
                });
            }
            log::warn!(
                "Charge {}/{} already applied to {}, refusing it for {}",
                confirmation.provider,
                confirmation.provider_charge_id,
                existing.purchase_ref,
                purchase.purchase_ref
            );
            return Ok(FinalizationOutcome::Rejected(
                RejectionReason::ChargeAlreadyUsed {
                    purchase_ref: existing.purchase_ref,
                },
            ));
        }

        match purchase.status {
            PurchaseStatus::Settled => {
                return Ok(FinalizationOutcome::AlreadyProcessed {
                    purchase_ref: purchase.purchase_ref,
                });
            }
            PurchaseStatus::Expired => {
                return Ok(FinalizationOutcome::Rejected(
                    RejectionReason::PurchaseExpired,
                ));
            }
            PurchaseStatus::Pending => {}
        }
        if purchase.funding != PurchaseFunding::External {
            return Ok(FinalizationOutcome::Rejected(
                RejectionReason::FundingMismatch,
            ));
        }
        if confirmation.amount != purchase.price {
            log::warn!(
                "Amount mismatch for {}: expected {}, got {}",
                purchase.purchase_ref,
                purchase.price,
                confirmation.amount
            );
            return Ok(FinalizationOutcome::Rejected(
                RejectionReason::AmountMismatch {
                    expected: purchase.price,
                    received: confirmation.amount,
                },
            ));
        }

        self.settle(
            purchase,
            PaymentSource::External {
                provider: confirmation.provider,
                provider_charge_id: confirmation.provider_charge_id,
            },
            GrantSource::Purchase,
        )
        .await
    }

    /// Settle a balance-funded entitlement purchase.
    pub async fn finalize_from_balance(
        &self,
        purchase_ref: &str,
    ) -> AppResult<FinalizationOutcome> {
        let Some(purchase) = PurchaseService::find_model(&self.pool, purchase_ref).await? else {
            return Ok(FinalizationOutcome::Rejected(
                RejectionReason::PurchaseNotFound,
            ));
        };
        match purchase.status {
            PurchaseStatus::Settled => {
                return Ok(FinalizationOutcome::AlreadyProcessed {
                    purchase_ref: purchase.purchase_ref,
                });
            }
            PurchaseStatus::Expired => {
                return Ok(FinalizationOutcome::Rejected(
                    RejectionReason::PurchaseExpired,
                ));
            }
            PurchaseStatus::Pending => {}
        }
        if purchase.funding != PurchaseFunding::Balance || purchase.kind != PurchaseKind::Entitlement
        {
            return Ok(FinalizationOutcome::Rejected(
                RejectionReason::FundingMismatch,
            ));
        }

        // cheap pre-check so we do not provision for a purchase that cannot settle;
        // the guarded decrement under the lock stays authoritative
        let available = AccountStore::find(&self.pool, purchase.account_id)
            .await?
            .map(|a| a.balance)
            .unwrap_or(0);
        if available < purchase.price {
            return Ok(FinalizationOutcome::Rejected(
                RejectionReason::InsufficientBalance {
                    required: purchase.price,
                    available,
                },
            ));
        }

        let source = if purchase.purchase_ref.starts_with("auto-") {
            GrantSource::AutoRenewal
        } else {
            GrantSource::Purchase
        };
        self.settle(purchase, PaymentSource::Balance, source).await
    }

    /// Grant entitlement days without a payment.
    pub async fn admin_grant(&self, account_id: i64, days: i32) -> AppResult<EntitlementChange> {
        if days <= 0 {
            return Err(AppError::ValidationError(format!(
                "Grant duration must be positive, got {days}"
            )));
        }
        AccountStore::ensure_account(&self.pool, account_id).await?;
        let phase_one = self.phase_one(account_id, days).await?;

        let result = async {
            let txn = self.begin().await?;
            AccountStore::lock_account(&txn, account_id).await?;
            let grant = self
                .grantor
                .grant(&txn, account_id, days, GrantSource::Admin, phase_one.as_ref())
                .await?;
            txn.commit().await?;
            Ok::<_, AppError>(grant)
        }
        .await;

        match result {
            Ok(grant) => Ok(self.after_commit(&grant).await),
            Err(e) => {
                self.compensate(phase_one.as_ref(), &e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// Swap the account's credential for a freshly minted one.
    ///
    /// Serialized with purchases through the account row lock.
    pub async fn reissue_credential(&self, account_id: i64) -> AppResult<EntitlementChange> {
        let now = time::now();
        let current = EntitlementGrantor::find(&self.pool, account_id)
            .await?
            .filter(|e| e.status != EntitlementStatus::Expired && e.expires_at > now)
            .ok_or_else(|| {
                AppError::NotFound(format!("No active entitlement for account {account_id}"))
            })?;

        let phase_one = PhaseOneCredential {
            credential_id: generate_credential_id(),
            expires_at: current.expires_at,
        };
        self.provisioning
            .create(account_id, &phase_one.credential_id, phase_one.expires_at)
            .await?;

        let result = async {
            let txn = self.begin().await?;
            AccountStore::lock_account(&txn, account_id).await?;
            let Some(locked) = EntitlementGrantor::find(&txn, account_id).await? else {
                return Err(AppError::NotFound(format!(
                    "No entitlement for account {account_id}"
                )));
            };
            if locked.credential_id != current.credential_id {
                return Err(AppError::ValidationError(
                    "Credential changed concurrently, please retry".to_string(),
                ));
            }
            let expires_at = locked.expires_at;
            let now = time::now();
            let mut am = locked.into_active_model();
            am.credential_id = Set(phase_one.credential_id.clone());
            am.status = Set(EntitlementStatus::Active);
            am.synced_at = Set(Some(now));
            am.synced_expires_at = Set(Some(phase_one.expires_at));
            am.updated_at = Set(Some(now));
            am.update(&txn).await?;
            txn.commit().await?;
            Ok(expires_at)
        }
        .await;

        let expires_at = match result {
            Ok(expires_at) => expires_at,
            Err(e) => {
                self.compensate(Some(&phase_one), &e.to_string()).await?;
                return Err(e);
            }
        };

        log::info!(
            "Reissued credential for account {account_id}: {} -> {}",
            current.credential_id,
            phase_one.credential_id
        );
        if let Err(e) = remove_credential(&*self.provisioning, &current.credential_id).await {
            log::error!(
                target: "critical",
                "Old credential {} of account {account_id} still live on panel: {e}",
                current.credential_id
            );
        }

        let mut provisioning_synced = true;
        if expires_at != phase_one.expires_at {
            // renewed between Phase 1 and the lock
            provisioning_synced = self
                .push_expiry(
                    account_id,
                    &phase_one.credential_id,
                    expires_at,
                    PostCommitSync::UpdateExpiry,
                )
                .await;
        }

        Ok(EntitlementChange {
            action: GrantAction::NewIssuance,
            credential_id: phase_one.credential_id,
            expires_at,
            previous_expires_at: Some(current.expires_at),
            provisioning_synced,
        })
    }

    async fn settle(
        &self,
        purchase: pending_purchase_entity::Model,
        payment: PaymentSource,
        source: GrantSource,
    ) -> AppResult<FinalizationOutcome> {
        let phase_one = match (purchase.kind, purchase.duration_days) {
            (PurchaseKind::Entitlement, Some(days)) => {
                self.phase_one(purchase.account_id, days).await?
            }
            (PurchaseKind::Entitlement, None) => {
                return Err(AppError::InvariantBreach(format!(
                    "entitlement purchase {} has no duration",
                    purchase.purchase_ref
                )));
            }
            (PurchaseKind::BalanceTopup, _) => None,
        };

        let outcome = self
            .settle_in_tx(&purchase, &payment, source, phase_one.as_ref())
            .await;

        match outcome {
            Ok(TxOutcome::Committed(committed)) => {
                let entitlement = match &committed.grant {
                    Some(grant) => Some(self.after_commit(grant).await),
                    None => None,
                };
                log::info!(
                    "Purchase {} settled for account {} ({})",
                    purchase.purchase_ref,
                    purchase.account_id,
                    purchase.kind
                );
                Ok(FinalizationOutcome::Settled(SettlementReport {
                    purchase_ref: purchase.purchase_ref,
                    account_id: purchase.account_id,
                    kind: purchase.kind,
                    amount: purchase.price,
                    entitlement,
                    balance_after: committed.balance_after,
                    referral: committed.referral,
                }))
            }
            Ok(TxOutcome::AlreadySettled) => {
                // the financial outcome is correct either way; a failed cleanup is only logged
                let _ = self
                    .compensate(phase_one.as_ref(), "purchase already settled")
                    .await;
                Ok(FinalizationOutcome::AlreadyProcessed {
                    purchase_ref: purchase.purchase_ref,
                })
            }
            Ok(TxOutcome::Rejected(reason)) => {
                self.compensate(phase_one.as_ref(), &reason.to_string())
                    .await?;
                Ok(FinalizationOutcome::Rejected(reason))
            }
            Err(e) => {
                log::error!(
                    "Settlement of {} rolled back: {e}",
                    purchase.purchase_ref
                );
                self.compensate(phase_one.as_ref(), &e.to_string()).await?;
                Err(e)
            }
        }
    }

    async fn settle_in_tx(
        &self,
        purchase: &pending_purchase_entity::Model,
        payment: &PaymentSource,
        source: GrantSource,
        phase_one: Option<&PhaseOneCredential>,
    ) -> AppResult<TxOutcome> {
        let account_id = purchase.account_id;
        let txn = self.begin().await?;
        let account = AccountStore::lock_account(&txn, account_id).await?;

        match IdempotencyLedger::mark_settled(&txn, &purchase.purchase_ref).await? {
            SettleAttempt::Settled => {}
            SettleAttempt::AlreadySettled => {
                txn.rollback().await?;
                return Ok(TxOutcome::AlreadySettled);
            }
            SettleAttempt::Expired => {
                txn.rollback().await?;
                return Ok(TxOutcome::Rejected(RejectionReason::PurchaseExpired));
            }
            SettleAttempt::Missing => {
                txn.rollback().await?;
                return Ok(TxOutcome::Rejected(RejectionReason::PurchaseNotFound));
            }
        }

        let mut grant = None;
        let mut balance_after = None;
        match purchase.kind {
            PurchaseKind::Entitlement => {
                if matches!(payment, PaymentSource::Balance) {
                    match AccountStore::decrease_balance(&txn, account_id, purchase.price).await {
                        Ok(balance) => balance_after = Some(balance),
                        Err(AppError::InsufficientBalance) => {
                            txn.rollback().await?;
                            return Ok(TxOutcome::Rejected(
                                RejectionReason::InsufficientBalance {
                                    required: purchase.price,
                                    available: account.balance,
                                },
                            ));
                        }
                        Err(e) => return Err(e),
                    }
                }
                let days = purchase.duration_days.unwrap_or_default();
                grant = Some(
                    self.grantor
                        .grant(&txn, account_id, days, source, phase_one)
                        .await?,
                );
            }
            PurchaseKind::BalanceTopup => {
                balance_after =
                    Some(AccountStore::increase_balance(&txn, account_id, purchase.price).await?);
            }
        }

        let (provider, provider_charge_id) = match payment {
            PaymentSource::External {
                provider,
                provider_charge_id,
            } => (provider.clone(), provider_charge_id.clone()),
            PaymentSource::Balance => (BALANCE_PROVIDER.to_string(), purchase.purchase_ref.clone()),
        };
        IdempotencyLedger::record_payment(
            &txn,
            NewPayment {
                purchase_ref: purchase.purchase_ref.clone(),
                account_id,
                provider,
                provider_charge_id,
                amount: purchase.price,
            },
        )
        .await?;

        // only money entering the system earns a referral reward
        let referral = match payment {
            PaymentSource::External { .. } => {
                ReferralRewarder::apply(
                    &txn,
                    &purchase.purchase_ref,
                    account_id,
                    self.referral.reward_for(purchase.price),
                )
                .await?
            }
            PaymentSource::Balance => None,
        };

        txn.commit().await?;
        Ok(TxOutcome::Committed(Committed {
            grant,
            balance_after,
            referral,
        }))
    }

    /// Create a credential up front if the unlocked peek says one will be needed.
    async fn phase_one(&self, account_id: i64, days: i32) -> AppResult<Option<PhaseOneCredential>> {
        let now = time::now();
        let current = EntitlementGrantor::find(&self.pool, account_id).await?;
        if !self.grantor.requires_new_credential(current.as_ref(), now) {
            return Ok(None);
        }
        let credential = PhaseOneCredential {
            credential_id: generate_credential_id(),
            expires_at: now + Duration::days(days as i64),
        };
        self.provisioning
            .create(account_id, &credential.credential_id, credential.expires_at)
            .await?;
        log::info!(
            "Phase 1 credential {} created for account {account_id}",
            credential.credential_id
        );
        Ok(Some(credential))
    }

    /// Undo Phase 1. An error here means the credential is orphaned on the panel.
    async fn compensate(
        &self,
        phase_one: Option<&PhaseOneCredential>,
        cause: &str,
    ) -> AppResult<()> {
        let Some(credential) = phase_one else {
            return Ok(());
        };
        match remove_credential(&*self.provisioning, &credential.credential_id).await {
            Ok(()) => {
                log::warn!(
                    "Removed Phase 1 credential {} ({cause})",
                    credential.credential_id
                );
                Ok(())
            }
            Err(e) => {
                log::error!(
                    target: "critical",
                    "Orphaned credential {} on panel, manual cleanup required ({cause}): {e}",
                    credential.credential_id
                );
                Err(AppError::OrphanedCredential {
                    credential_id: credential.credential_id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Phase 2. Never fails the caller: the commit already happened.
    async fn after_commit(&self, grant: &GrantResult) -> EntitlementChange {
        if let Some(unused) = &grant.unused_credential {
            // a concurrent purchase issued the credential first
            if let Err(e) = remove_credential(&*self.provisioning, unused).await {
                log::error!(
                    target: "critical",
                    "Orphaned credential {unused} on panel, manual cleanup required: {e}"
                );
            }
        }
        if let Some(replaced) = &grant.replaced_credential
            && let Err(e) = remove_credential(&*self.provisioning, replaced).await
        {
            log::warn!("Failed to remove stale credential {replaced}: {e}");
        }

        let provisioning_synced = self
            .push_expiry(
                grant.account_id,
                &grant.credential_id,
                grant.expires_at,
                grant.sync,
            )
            .await;

        EntitlementChange {
            action: grant.action,
            credential_id: grant.credential_id.clone(),
            expires_at: grant.expires_at,
            previous_expires_at: grant.previous_expires_at,
            provisioning_synced,
        }
    }

    async fn push_expiry(
        &self,
        account_id: i64,
        credential_id: &str,
        expires_at: DateTime<Utc>,
        sync: PostCommitSync,
    ) -> bool {
        let pushed = match sync {
            PostCommitSync::Nothing => return true,
            PostCommitSync::UpdateExpiry => {
                sync_expiry(&*self.provisioning, account_id, credential_id, expires_at)
                    .await
                    .map(|_| ())
            }
            PostCommitSync::CreateCredential => self
                .provisioning
                .create(account_id, credential_id, expires_at)
                .await
                .map(|_| ()),
        };
        if let Err(e) = pushed {
            log::warn!(
                "Post-commit sync of {credential_id} failed, left for reconciliation: {e}"
            );
            return false;
        }
        if let Err(e) =
            EntitlementGrantor::mark_synced(&self.pool, account_id, credential_id, expires_at).await
        {
            log::error!("Failed to record sync of {credential_id}: {e}");
        }
        true
    }

    async fn begin(&self) -> AppResult<DatabaseTransaction> {
        let txn = self.pool.begin().await?;
        if txn.get_database_backend() == DatabaseBackend::Postgres && self.statement_timeout_ms > 0
        {
            txn.execute_unprepared(&format!(
                "SET LOCAL statement_timeout = {}",
                self.statement_timeout_ms
            ))
            .await?;
        }
        Ok(txn)
    }
}
