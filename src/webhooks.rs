use axum::{body::Bytes, extract::Extension, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::billing::BillingService;
use crate::error::AppResult;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// key: webhooks-billing -> ledger entrypoint
///
/// Answers 2xx only once the ledger has durably settled the event. Forged or malformed
/// deliveries get 400, deliveries racing an unsettled claim 409, and processing failures
/// 500, so the provider redelivers.
pub async fn billing_webhook(
    Extension(service): Extension<BillingService>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let outcome = service.ledger().handle(&body, signature).await?;
    Ok(Json(json!({ "received": true, "outcome": outcome })))
}
