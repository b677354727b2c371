use crate::config::AuthConfig;
use crate::error::AppError;
use crate::models::{ApiResponse, FinalizationOutcome, FinalizationResponse, PaymentConfirmation};
use crate::services::{NotificationService, PurchaseFinalizer};
use crate::utils::secret_matches;
use actix_web::{HttpRequest, HttpResponse, ResponseError, Result, web};
use log::{error, info, warn};

pub const WEBHOOK_SECRET_HEADER: &str = "X-Webhook-Secret";

fn webhook_authorized(req: &HttpRequest, expected: &str) -> bool {
    req.headers()
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| secret_matches(v, expected))
}

#[utoipa::path(
    post,
    path = "/webhook/payments",
    tag = "webhook",
    request_body = PaymentConfirmation,
    params(
        ("X-Webhook-Secret" = String, Header, description = "Shared webhook secret")
    ),
    responses(
        (status = 200, description = "Settled, already processed or rejected", body = FinalizationResponse),
        (status = 401, description = "Bad webhook secret"),
        (status = 503, description = "Provisioning unavailable, retry later")
    )
)]
/// Payment confirmation from a provider.
///
/// Redelivery is safe. Business rejections still answer 200 so the provider
/// stops retrying; only transient failures answer 5xx.
pub async fn payment_webhook(
    req: HttpRequest,
    auth: web::Data<AuthConfig>,
    finalizer: web::Data<PurchaseFinalizer>,
    notifications: web::Data<NotificationService>,
    body: web::Json<PaymentConfirmation>,
) -> Result<HttpResponse> {
    if !webhook_authorized(&req, &auth.webhook_secret) {
        warn!("Rejected payment webhook with bad secret");
        return Ok(AppError::AuthError("Invalid webhook secret".to_string()).error_response());
    }

    let confirmation = body.into_inner();
    info!(
        "Payment webhook {}/{} for {}",
        confirmation.provider, confirmation.provider_charge_id, confirmation.purchase_ref
    );

    match finalizer.finalize(confirmation).await {
        Ok(outcome) => {
            if let FinalizationOutcome::Settled(report) = &outcome
                && let Err(e) = notifications.notify_settlement(report).await
            {
                warn!("Settlement notice for {} not sent: {e}", report.purchase_ref);
            }
            Ok(HttpResponse::Ok().json(ApiResponse::success(FinalizationResponse::from(outcome))))
        }
        Err(e) => {
            if e.is_retryable() {
                warn!("Payment webhook failed, provider will redeliver: {e}");
            } else if !e.is_critical() {
                error!("Payment webhook failed and needs attention: {e}");
            }
            Ok(e.error_response())
        }
    }
}

pub fn webhook_config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::scope("/webhook").route("/payments", web::post().to(payment_webhook)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn secret_must_match_exactly() {
        let req = TestRequest::default()
            .insert_header((WEBHOOK_SECRET_HEADER, "s3cret"))
            .to_http_request();
        assert!(webhook_authorized(&req, "s3cret"));
        assert!(!webhook_authorized(&req, "other"));
    }

    #[test]
    fn missing_header_or_unset_secret_is_rejected() {
        let req = TestRequest::default().to_http_request();
        assert!(!webhook_authorized(&req, "s3cret"));
        let req = TestRequest::default()
            .insert_header((WEBHOOK_SECRET_HEADER, ""))
            .to_http_request();
        assert!(!webhook_authorized(&req, ""));
    }
}
