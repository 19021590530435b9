use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration, Utc};
use decision_backend::billing::{
    BillingService, InMemoryBillingStore, LedgerStore, MemberRole, Metric, MonthKey,
    SignatureVerifier,
};
use decision_backend::routes;
use decision_backend::webhooks::SIGNATURE_HEADER;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`
use uuid::Uuid;

const WEBHOOK_SECRET: &str = "whsec_http_tests";

fn token_for(user_id: Uuid) -> String {
    std::env::set_var("JWT_SECRET", "secret");
    let claims = json!({ "sub": user_id, "exp": 9999999999u64 });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"secret"),
    )
    .unwrap()
}

fn setup() -> (Arc<InMemoryBillingStore>, axum::Router) {
    let store = Arc::new(InMemoryBillingStore::new());
    let service = BillingService::new(
        store.clone(),
        Some(SignatureVerifier::new(WEBHOOK_SECRET, 300)),
        HashMap::new(),
    );
    (store, routes::app(service))
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn webhook_rejects_forged_and_accepts_signed() {
    let (_store, app) = setup();
    let payload = json!({ "id": "evt_http", "type": "invoice.paid", "data": { "object": {} } })
        .to_string();

    let forged = SignatureVerifier::new("whsec_other", 300)
        .sign(payload.as_bytes(), Utc::now().timestamp());
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/billing/webhook")
                .header(SIGNATURE_HEADER, forged)
                .body(Body::from(payload.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "invalid_signature");

    let signed = SignatureVerifier::new(WEBHOOK_SECRET, 300)
        .sign(payload.as_bytes(), Utc::now().timestamp());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/billing/webhook")
                .header(SIGNATURE_HEADER, signed)
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["received"], true);
    assert_eq!(body["outcome"], "ignored");
}

#[tokio::test]
async fn webhook_for_unsettled_event_asks_for_redelivery() {
    let (store, app) = setup();
    store
        .claim_event("evt_live", "invoice.paid", Utc::now() - Duration::minutes(5))
        .await
        .unwrap();
    let payload = json!({ "id": "evt_live", "type": "invoice.paid", "data": { "object": {} } })
        .to_string();
    let signed = SignatureVerifier::new(WEBHOOK_SECRET, 300)
        .sign(payload.as_bytes(), Utc::now().timestamp());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/billing/webhook")
                .header(SIGNATURE_HEADER, signed)
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await["error"], "event_in_flight");
}

#[tokio::test]
async fn entitlement_check_requires_membership() {
    let (store, app) = setup();
    let owner = store.create_user("owner@example.com");
    let workspace = store.create_workspace(owner, "Hiring plan");
    store.set_usage(workspace.id, Metric::Meetings, &MonthKey::current(), 1);
    let uri = format!("/api/workspaces/{}/entitlements/meetings", workspace.id);

    let response = app.clone().oneshot(get(&uri, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let stranger = token_for(Uuid::new_v4());
    let response = app.clone().oneshot(get(&uri, Some(&stranger))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(get(&uri, Some(&token_for(owner))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["allowed"], true);
    assert_eq!(body["plan"]["plan_key"], "free");
    assert_eq!(body["used"], 1);
    assert_eq!(body["limit"], 2);
}

#[tokio::test]
async fn billing_overview_is_owner_only() {
    let (store, app) = setup();
    let owner = store.create_user("owner@example.com");
    let member = store.create_user("member@example.com");
    let workspace = store.create_workspace(owner, "Hiring plan");
    store.add_member(workspace.id, member, MemberRole::Member);
    let uri = format!("/api/workspaces/{}/billing", workspace.id);

    let response = app
        .clone()
        .oneshot(get(&uri, Some(&token_for(member))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(get(&uri, Some(&token_for(owner))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["workspace_id"], workspace.id.to_string());
    assert_eq!(body["plan"]["plan_key"], "free");
}

#[tokio::test]
async fn malformed_path_parameters_are_rejected() {
    let (store, app) = setup();
    let owner = store.create_user("owner@example.com");
    let workspace = store.create_workspace(owner, "Hiring plan");
    let token = token_for(owner);

    let response = app
        .clone()
        .oneshot(get(
            "/api/workspaces/not-a-uuid/entitlements/runs",
            Some(&token),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(get(
            &format!("/api/workspaces/{}/entitlements/seats", workspace.id),
            Some(&token),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(get(
            &format!("/api/workspaces/{}/usage?month=2026-13", workspace.id),
            Some(&token),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn plan_catalog_is_public() {
    let (_store, app) = setup();
    let response = app.oneshot(get("/api/billing/plans", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let plans = json_body(response).await;
    assert_eq!(plans.as_array().map(Vec::len), Some(4));
}
