use crate::models::*;
use crate::services::{PurchaseFinalizer, ReconciliationService};
use actix_web::{HttpResponse, ResponseError, Result, web};

#[utoipa::path(
    post,
    path = "/api/v1/admin/grants",
    tag = "admin",
    request_body = AdminGrantRequest,
    security(
        ("bearer_auth" = [])
    ),
    responses(
        (status = 200, description = "Entitlement granted", body = EntitlementChange),
        (status = 400, description = "Non-positive duration"),
        (status = 503, description = "Provisioning unavailable, retry later")
    )
)]
/// Grant entitlement days without a payment.
pub async fn grant(
    finalizer: web::Data<PurchaseFinalizer>,
    body: web::Json<AdminGrantRequest>,
) -> Result<HttpResponse> {
    let req = body.into_inner();
    log::info!("Admin grant of {} days to account {}", req.days, req.account_id);
    match finalizer.admin_grant(req.account_id, req.days).await {
        Ok(change) => Ok(HttpResponse::Ok().json(ApiResponse::success(change))),
        Err(e) => Ok(e.error_response()),
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/reconcile",
    tag = "admin",
    security(
        ("bearer_auth" = [])
    ),
    responses(
        (status = 200, description = "Reconciliation pass finished", body = ReconciliationReport)
    )
)]
/// Run a reconciliation pass now instead of waiting for the next tick.
pub async fn reconcile(service: web::Data<ReconciliationService>) -> Result<HttpResponse> {
    match service.run_once().await {
        Ok(report) => Ok(HttpResponse::Ok().json(ApiResponse::success(report))),
        Err(e) => Ok(e.error_response()),
    }
}

pub fn admin_config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/admin")
            .route("/grants", web::post().to(grant))
            .route("/reconcile", web::post().to(reconcile)),
    );
}
