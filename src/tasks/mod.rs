//! Background jobs. Call `spawn_all` once during startup.
//!
//! Every job is safe to run concurrently with request handling and with a
//! second instance of itself; each pass is idempotent.

use std::time::Duration;

use crate::services::{
    AutoRenewalService, EntitlementGrantor, NotificationService, PurchaseService,
    ReconciliationService,
};
use sea_orm::DatabaseConnection;

pub struct Workers {
    pub pool: DatabaseConnection,
    pub reconciliation: ReconciliationService,
    pub purchases: PurchaseService,
    pub notifications: NotificationService,
    pub auto_renewal: AutoRenewalService,
}

/// Detaches every background loop with `tokio::spawn`; does not block.
pub fn spawn_all(workers: Workers) {
    // reconciliation is always on: the saga relies on it for Phase 2 failures
    {
        let svc = workers.reconciliation.clone();
        tokio::spawn(async move {
            let interval = svc.interval();
            loop {
                if let Err(e) = svc.run_once().await {
                    log::error!("Reconciliation pass failed: {e:?}");
                }
                tokio::time::sleep(interval).await;
            }
        });
    }

    // pending purchase expiry (every minute)
    {
        let svc = workers.purchases.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = svc.expire_stale_purchases().await {
                    log::error!("Failed to expire pending purchases: {e:?}");
                }
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        });
    }

    // entitlement expiry (every 10 minutes)
    {
        let pool = workers.pool.clone();
        tokio::spawn(async move {
            loop {
                match EntitlementGrantor::expire_lapsed(&pool).await {
                    Ok(n) if n > 0 => log::info!("Entitlements expired: {n}"),
                    Ok(_) => {}
                    Err(e) => log::error!("Failed to expire entitlements: {e:?}"),
                }
                tokio::time::sleep(Duration::from_secs(600)).await;
            }
        });
    }

    // expiry reminders (hourly)
    {
        let svc = workers.notifications.clone();
        tokio::spawn(async move {
            loop {
                match svc.send_expiry_reminders().await {
                    Ok(n) if n > 0 => log::info!("Expiry reminders sent: {n}"),
                    Ok(_) => {}
                    Err(e) => log::error!("Failed to send expiry reminders: {e:?}"),
                }
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        });
    }

    // auto-renewal from balance (hourly, no-op unless enabled)
    {
        let svc = workers.auto_renewal.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = svc.run_once().await {
                    log::error!("Auto-renewal pass failed: {e:?}");
                }
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
        });
    }
}
