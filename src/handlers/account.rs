use crate::models::*;
use crate::services::{AccountService, PurchaseFinalizer};
use actix_web::{HttpResponse, ResponseError, Result, web};

#[utoipa::path(
    get,
    path = "/api/v1/accounts/{account_id}",
    tag = "account",
    params(
        ("account_id" = i64, Path, description = "Account id")
    ),
    security(
        ("bearer_auth" = [])
    ),
    responses(
        (status = 200, description = "Balance, referrer and entitlement", body = AccountResponse),
        (status = 404, description = "Unknown account")
    )
)]
pub async fn get_account(
    service: web::Data<AccountService>,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    match service.get_account(path.into_inner()).await {
        Ok(account) => Ok(HttpResponse::Ok().json(ApiResponse::success(account))),
        Err(e) => Ok(e.error_response()),
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/accounts/{account_id}/payments",
    tag = "account",
    params(
        ("account_id" = i64, Path, description = "Account id"),
        PaginationParams
    ),
    security(
        ("bearer_auth" = [])
    ),
    responses(
        (status = 200, description = "Payments, newest first", body = [PaymentResponse])
    )
)]
pub async fn list_payments(
    service: web::Data<AccountService>,
    path: web::Path<i64>,
    query: web::Query<PaginationParams>,
) -> Result<HttpResponse> {
    match service.list_payments(path.into_inner(), &query).await {
        Ok(page) => Ok(HttpResponse::Ok().json(ApiResponse::success(page))),
        Err(e) => Ok(e.error_response()),
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/accounts/{account_id}/referrer",
    tag = "account",
    request_body = BindReferrerRequest,
    params(
        ("account_id" = i64, Path, description = "Account id")
    ),
    security(
        ("bearer_auth" = [])
    ),
    responses(
        (status = 200, description = "Referrer bound, or the existing one kept", body = BindReferrerResponse),
        (status = 400, description = "Self referral"),
        (status = 404, description = "Unknown referrer")
    )
)]
pub async fn bind_referrer(
    service: web::Data<AccountService>,
    path: web::Path<i64>,
    body: web::Json<BindReferrerRequest>,
) -> Result<HttpResponse> {
    match service
        .bind_referrer(path.into_inner(), body.referrer_id)
        .await
    {
        Ok(result) => Ok(HttpResponse::Ok().json(ApiResponse::success(result))),
        Err(e) => Ok(e.error_response()),
    }
}

#[utoipa::path(
    put,
    path = "/api/v1/accounts/{account_id}/auto-renew",
    tag = "account",
    request_body = AutoRenewRequest,
    params(
        ("account_id" = i64, Path, description = "Account id")
    ),
    security(
        ("bearer_auth" = [])
    ),
    responses(
        (status = 200, description = "Flag updated"),
        (status = 404, description = "Unknown account")
    )
)]
pub async fn set_auto_renew(
    service: web::Data<AccountService>,
    path: web::Path<i64>,
    body: web::Json<AutoRenewRequest>,
) -> Result<HttpResponse> {
    let enabled = body.enabled;
    match service.set_auto_renew(path.into_inner(), enabled).await {
        Ok(()) => Ok(HttpResponse::Ok().json(ApiResponse::with_message(
            enabled,
            if enabled {
                "Auto-renewal enabled"
            } else {
                "Auto-renewal disabled"
            },
        ))),
        Err(e) => Ok(e.error_response()),
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/accounts/{account_id}/reissue",
    tag = "account",
    params(
        ("account_id" = i64, Path, description = "Account id")
    ),
    security(
        ("bearer_auth" = [])
    ),
    responses(
        (status = 200, description = "New credential issued", body = EntitlementChange),
        (status = 404, description = "No active entitlement"),
        (status = 503, description = "Provisioning unavailable, retry later")
    )
)]
/// Replace the account's credential, e.g. after a leaked config.
pub async fn reissue_credential(
    finalizer: web::Data<PurchaseFinalizer>,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    match finalizer.reissue_credential(path.into_inner()).await {
        Ok(change) => Ok(HttpResponse::Ok().json(ApiResponse::success(change))),
        Err(e) => Ok(e.error_response()),
    }
}

pub fn account_config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/accounts")
            .route("/{account_id}", web::get().to(get_account))
            .route("/{account_id}/payments", web::get().to(list_payments))
            .route("/{account_id}/referrer", web::post().to(bind_referrer))
            .route("/{account_id}/auto-renew", web::put().to(set_auto_renew))
            .route("/{account_id}/reissue", web::post().to(reissue_credential)),
    );
}
