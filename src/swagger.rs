use actix_web::web;
use utoipa::OpenApi;
use utoipa::{
    Modify,
    openapi::security::{Http, HttpAuthScheme, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::entities::{EntitlementStatus, PurchaseFunding, PurchaseKind, PurchaseStatus};
use crate::handlers;
use crate::models::*;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            )
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::webhook::payment_webhook,
        handlers::purchase::create_purchase,
        handlers::purchase::get_purchase,
        handlers::purchase::attach_invoice,
        handlers::purchase::pay_from_balance,
        handlers::account::get_account,
        handlers::account::list_payments,
        handlers::account::bind_referrer,
        handlers::account::set_auto_renew,
        handlers::account::reissue_credential,
        handlers::admin::grant,
        handlers::admin::reconcile,
    ),
    components(
        schemas(
            PaymentConfirmation,
            FinalizationResponse,
            OutcomeKind,
            SettlementReport,
            EntitlementChange,
            GrantAction,
            GrantSource,
            ReferralRewardApplied,
            CreatePurchaseRequest,
            AttachInvoiceRequest,
            PurchaseResponse,
            PurchaseKind,
            PurchaseFunding,
            PurchaseStatus,
            AccountResponse,
            EntitlementResponse,
            EntitlementStatus,
            PaymentResponse,
            BindReferrerRequest,
            BindReferrerResponse,
            AutoRenewRequest,
            AdminGrantRequest,
            ReconciliationReport,
            ApiError,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "webhook", description = "Payment provider callbacks"),
        (name = "purchase", description = "Purchase intents and balance payments"),
        (name = "account", description = "Balance, referrals and credentials"),
        (name = "admin", description = "Operator actions"),
    ),
    info(
        title = "VPN Shop Backend API",
        version = "1.0.0",
        description = "Purchase finalization and entitlement API"
    )
)]
pub struct ApiDoc;

pub fn swagger_config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", ApiDoc::openapi()),
    )
    .route(
        "/swagger-ui",
        web::get().to(|| async {
            actix_web::HttpResponse::Found()
                .append_header(("Location", "/swagger-ui/"))
                .finish()
        }),
    );
}
