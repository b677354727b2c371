use actix_web::{App, HttpServer, middleware::Logger, web};
use anyhow::Context;
use chrono::Local; // timestamp in log lines
use env_logger::{Env, Target};
use std::io::Write; // for env_logger custom formatter
use std::sync::Arc;

use vpnshop_backend::{
    config::Config,
    database::{create_pool, run_migrations},
    external::{PanelClient, ProvisioningPort},
    handlers,
    middlewares::AuthMiddleware,
    services::*,
    swagger::swagger_config,
    tasks::{self, Workers},
};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let ts = Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z");
            let level = record.level().as_str().to_ascii_lowercase();
            let msg_json = serde_json::to_string(&format!("{}", record.args()))
                .unwrap_or_else(|_| "\"<invalid utf8>\"".to_string());
            writeln!(
                buf,
                "{{\"timestamp\":\"{}\",\"level\":\"{}\",\"message\":{},\"target\":\"{}\"}}",
                ts,
                level,
                msg_json,
                record.target(),
            )
        })
        .target(Target::Stdout)
        .init();

    let config = Config::from_toml().map_err(|e| anyhow::anyhow!("failed to load config: {e}"))?;

    let pool = create_pool(&config.database)
        .await
        .context("failed to create database connection pool")?;
    run_migrations(&pool)
        .await
        .context("failed to run database migrations")?;

    let provisioning: Arc<dyn ProvisioningPort> = Arc::new(
        PanelClient::new(&config.provisioning)
            .map_err(|e| anyhow::anyhow!("failed to build panel client: {e}"))?,
    );

    let grantor = EntitlementGrantor::new(config.entitlement.stale_after_days);
    let finalizer = PurchaseFinalizer::new(
        pool.clone(),
        provisioning.clone(),
        grantor,
        config.referral.clone(),
        config.database.statement_timeout_ms,
    );
    let purchase_service = PurchaseService::new(pool.clone(), config.purchases.clone());
    let account_service = AccountService::new(pool.clone());
    let notification_service = NotificationService::new(
        pool.clone(),
        Arc::new(LogNotificationSink),
        config.notifications.clone(),
    );
    let reconciliation_service = ReconciliationService::new(
        pool.clone(),
        provisioning.clone(),
        config.reconciliation.clone(),
    );
    let auto_renewal_service = AutoRenewalService::new(
        pool.clone(),
        purchase_service.clone(),
        finalizer.clone(),
        notification_service.clone(),
        config.auto_renewal.clone(),
        config.purchases.clone(),
    );

    tasks::spawn_all(Workers {
        pool: pool.clone(),
        reconciliation: reconciliation_service.clone(),
        purchases: purchase_service.clone(),
        notifications: notification_service.clone(),
        auto_renewal: auto_renewal_service,
    });

    log::info!(
        "Starting HTTP server at {}:{}",
        config.server.host,
        config.server.port
    );

    let auth = config.auth.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(AuthMiddleware::new(&auth.api_token))
            .app_data(web::Data::new(auth.clone()))
            .app_data(web::Data::new(finalizer.clone()))
            .app_data(web::Data::new(purchase_service.clone()))
            .app_data(web::Data::new(account_service.clone()))
            .app_data(web::Data::new(notification_service.clone()))
            .app_data(web::Data::new(reconciliation_service.clone()))
            .configure(swagger_config)
            .configure(handlers::webhook_config)
            .service(
                web::scope("/api/v1")
                    .configure(handlers::purchase_config)
                    .configure(handlers::account_config)
                    .configure(handlers::admin_config),
            )
    })
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await?;

    Ok(())
}
