use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::{Condition, Expr};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
};

use crate::config::ReconciliationConfig;
use crate::entities::{EntitlementStatus, entitlement_entity as entitlements};
use crate::error::AppResult;
use crate::external::{ProvisioningPort, SyncAction, remove_credential, sync_expiry};
use crate::models::ReconciliationReport;
use crate::services::EntitlementGrantor;
use crate::utils::time;

enum Repair {
    Recreated,
    Updated,
    Confirmed,
    /// The row moved on (reissue, renewal, post-commit sync) since the scan.
    Superseded,
}

/// Brings the panel back in line with the entitlements table.
///
/// Read-only towards financial state. Rows touched within the grace window
/// are skipped so a post-commit sync still in flight is not raced.
#[derive(Clone)]
pub struct ReconciliationService {
    pool: DatabaseConnection,
    provisioning: Arc<dyn ProvisioningPort>,
    config: ReconciliationConfig,
}

impl ReconciliationService {
    pub fn new(
        pool: DatabaseConnection,
        provisioning: Arc<dyn ProvisioningPort>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            pool,
            provisioning,
            config,
        }
    }

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.interval_secs.max(1))
    }

    /// Entitlements whose panel state may lag the database.
    pub async fn find_candidates(&self) -> AppResult<Vec<entitlements::Model>> {
        let now = time::now();
        let cutoff = now - Duration::seconds(self.config.grace_secs);

        let drifted = Condition::any()
            .add(entitlements::Column::SyncedAt.is_null())
            .add(entitlements::Column::SyncedExpiresAt.is_null())
            .add(
                Expr::col(entitlements::Column::SyncedExpiresAt)
                    .ne(Expr::col(entitlements::Column::ExpiresAt)),
            );
        let settled_in = Condition::any()
            .add(
                Condition::all()
                    .add(entitlements::Column::RenewedAt.is_null())
                    .add(entitlements::Column::IssuedAt.lte(cutoff)),
            )
            .add(entitlements::Column::RenewedAt.lte(cutoff));

        Ok(entitlements::Entity::find()
            .filter(entitlements::Column::Status.is_in([
                EntitlementStatus::Active,
                EntitlementStatus::PendingActivation,
            ]))
            .filter(entitlements::Column::ExpiresAt.gt(now))
            .filter(drifted)
            .filter(settled_in)
            .order_by_asc(entitlements::Column::Id)
            .limit(self.config.batch_size)
            .all(&self.pool)
            .await?)
    }

    /// One reconciliation pass. Per-row failures are counted, not returned.
    pub async fn run_once(&self) -> AppResult<ReconciliationReport> {
        let candidates = self.find_candidates().await?;
        let mut report = ReconciliationReport {
            scanned: candidates.len() as u64,
            ..Default::default()
        };

        for entitlement in candidates {
            let synced_expiry = match self.repair(&entitlement).await {
                Ok((Repair::Recreated, expires_at)) => {
                    report.recreated += 1;
                    expires_at
                }
                Ok((Repair::Updated, expires_at)) => {
                    report.updated += 1;
                    expires_at
                }
                Ok((Repair::Confirmed, expires_at)) => {
                    report.confirmed += 1;
                    expires_at
                }
                Ok((Repair::Superseded, _)) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    report.failed += 1;
                    log::warn!(
                        "Reconciliation of credential {} (account {}) failed: {e}",
                        entitlement.credential_id,
                        entitlement.account_id
                    );
                    continue;
                }
            };
            if let Err(e) = EntitlementGrantor::mark_synced(
                &self.pool,
                entitlement.account_id,
                &entitlement.credential_id,
                synced_expiry,
            )
            .await
            {
                log::error!(
                    "Failed to record reconciliation of {}: {e}",
                    entitlement.credential_id
                );
            }
        }

        if report.scanned > 0 {
            log::info!(
                "Reconciliation pass: scanned={} recreated={} updated={} confirmed={} skipped={} failed={}",
                report.scanned,
                report.recreated,
                report.updated,
                report.confirmed,
                report.skipped,
                report.failed
            );
        }
        Ok(report)
    }

    /// The row as it is now, if it still matches what the scan picked up.
    async fn unchanged_since_scan(
        &self,
        scanned: &entitlements::Model,
    ) -> AppResult<Option<entitlements::Model>> {
        Ok(EntitlementGrantor::find(&self.pool, scanned.account_id)
            .await?
            .filter(|row| {
                row.credential_id == scanned.credential_id
                    && row.expires_at == scanned.expires_at
                    && row.updated_at == scanned.updated_at
                    && row.status != EntitlementStatus::Expired
            }))
    }

    /// Returns what was done and the expiry the panel now holds.
    async fn repair(
        &self,
        entitlement: &entitlements::Model,
    ) -> AppResult<(Repair, DateTime<Utc>)> {
        let port = &*self.provisioning;
        let remote = port.lookup(&entitlement.credential_id).await?;

        // the lookup can take a while; never act on a row that has since been replaced
        let Some(current) = self.unchanged_since_scan(entitlement).await? else {
            log::info!(
                "Entitlement of account {} changed during reconciliation, skipping",
                entitlement.account_id
            );
            return Ok((Repair::Superseded, entitlement.expires_at));
        };

        match remote {
            None => {
                // never mint a new id for a live entitlement
                port.create(current.account_id, &current.credential_id, current.expires_at)
                    .await?;

                let still_referenced = EntitlementGrantor::find(&self.pool, current.account_id)
                    .await?
                    .is_some_and(|row| row.credential_id == current.credential_id);
                if !still_referenced {
                    log::warn!(
                        "Credential {} was replaced while being re-created, removing it again",
                        current.credential_id
                    );
                    if let Err(e) = remove_credential(port, &current.credential_id).await {
                        log::error!(
                            target: "critical",
                            "Revoked credential {} of account {} is live on the panel: {e}",
                            current.credential_id,
                            current.account_id
                        );
                        return Err(e.into());
                    }
                    return Ok((Repair::Superseded, entitlement.expires_at));
                }

                log::info!(
                    "Re-created missing credential {} for account {}",
                    current.credential_id,
                    current.account_id
                );
                Ok((Repair::Recreated, current.expires_at))
            }
            Some(remote) if remote.expires_at != current.expires_at => {
                let action = sync_expiry(
                    port,
                    current.account_id,
                    &current.credential_id,
                    current.expires_at,
                )
                .await?;
                let repair = match action {
                    SyncAction::Updated => Repair::Updated,
                    SyncAction::Recreated => Repair::Recreated,
                };
                Ok((repair, current.expires_at))
            }
            Some(_) => Ok((Repair::Confirmed, current.expires_at)),
        }
    }
}
