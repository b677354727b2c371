use crate::models::*;
use crate::services::{NotificationService, PurchaseFinalizer, PurchaseService};
use actix_web::{HttpResponse, ResponseError, Result, web};

#[utoipa::path(
    post,
    path = "/api/v1/purchases",
    tag = "purchase",
    request_body = CreatePurchaseRequest,
    security(
        ("bearer_auth" = [])
    ),
    responses(
        (status = 200, description = "Pending purchase created", body = PurchaseResponse),
        (status = 400, description = "Unknown plan or top-up out of bounds"),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn create_purchase(
    service: web::Data<PurchaseService>,
    body: web::Json<CreatePurchaseRequest>,
) -> Result<HttpResponse> {
    match service.create_purchase(body.into_inner()).await {
        Ok(purchase) => Ok(HttpResponse::Ok().json(ApiResponse::success(purchase))),
        Err(e) => Ok(e.error_response()),
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/purchases/{purchase_ref}",
    tag = "purchase",
    params(
        ("purchase_ref" = String, Path, description = "Purchase reference")
    ),
    security(
        ("bearer_auth" = [])
    ),
    responses(
        (status = 200, description = "Purchase found", body = PurchaseResponse),
        (status = 404, description = "No such purchase")
    )
)]
pub async fn get_purchase(
    service: web::Data<PurchaseService>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    match service.find_purchase(&path.into_inner()).await {
        Ok(purchase) => Ok(HttpResponse::Ok().json(ApiResponse::success(purchase))),
        Err(e) => Ok(e.error_response()),
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/purchases/{purchase_ref}/invoice",
    tag = "purchase",
    request_body = AttachInvoiceRequest,
    params(
        ("purchase_ref" = String, Path, description = "Purchase reference")
    ),
    security(
        ("bearer_auth" = [])
    ),
    responses(
        (status = 200, description = "Invoice attached", body = PurchaseResponse),
        (status = 404, description = "No such purchase"),
        (status = 410, description = "Purchase no longer pending")
    )
)]
pub async fn attach_invoice(
    service: web::Data<PurchaseService>,
    path: web::Path<String>,
    body: web::Json<AttachInvoiceRequest>,
) -> Result<HttpResponse> {
    match service
        .attach_invoice(&path.into_inner(), &body.invoice_ref)
        .await
    {
        Ok(purchase) => Ok(HttpResponse::Ok().json(ApiResponse::success(purchase))),
        Err(e) => Ok(e.error_response()),
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/purchases/{purchase_ref}/pay-from-balance",
    tag = "purchase",
    params(
        ("purchase_ref" = String, Path, description = "Purchase reference")
    ),
    security(
        ("bearer_auth" = [])
    ),
    responses(
        (status = 200, description = "Settled or already processed", body = FinalizationResponse),
        (status = 400, description = "Purchase cannot be paid from balance"),
        (status = 402, description = "Insufficient balance"),
        (status = 410, description = "Purchase expired or missing"),
        (status = 503, description = "Provisioning unavailable, retry later")
    )
)]
/// Pay an entitlement purchase from the account balance.
pub async fn pay_from_balance(
    finalizer: web::Data<PurchaseFinalizer>,
    notifications: web::Data<NotificationService>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let purchase_ref = path.into_inner();
    match finalizer.finalize_from_balance(&purchase_ref).await {
        Ok(FinalizationOutcome::Rejected(reason)) => Ok(reason.into_error().error_response()),
        Ok(outcome) => {
            if let FinalizationOutcome::Settled(report) = &outcome
                && let Err(e) = notifications.notify_settlement(report).await
            {
                log::warn!("Settlement notice for {purchase_ref} not sent: {e}");
            }
            Ok(HttpResponse::Ok().json(ApiResponse::success(FinalizationResponse::from(outcome))))
        }
        Err(e) => Ok(e.error_response()),
    }
}

pub fn purchase_config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/purchases")
            .route("", web::post().to(create_purchase))
            .route("/{purchase_ref}", web::get().to(get_purchase))
            .route("/{purchase_ref}/invoice", web::post().to(attach_invoice))
            .route(
                "/{purchase_ref}/pay-from-balance",
                web::post().to(pay_from_balance),
            ),
    );
}
