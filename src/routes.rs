use axum::{
    routing::{get, post},
    Extension, Router,
};

use crate::billing::{self, BillingService};
use crate::webhooks;

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/billing/webhook", post(webhooks::billing_webhook))
        .route("/api/billing/plans", get(billing::api::list_plans))
        .route(
            "/api/workspaces/:id/entitlements/:metric",
            get(billing::api::check_entitlement),
        )
        .route("/api/workspaces/:id/usage", get(billing::api::usage_summary))
        .route(
            "/api/workspaces/:id/billing",
            get(billing::api::billing_overview),
        )
}

/// API routes with the billing service attached.
pub fn app(service: BillingService) -> Router {
    api_routes().layer(Extension(service))
}
