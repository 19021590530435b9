use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use decision_backend::billing::{BillingService, InMemoryBillingStore};
use decision_backend::routes;
use tower::ServiceExt;

#[tokio::test]
async fn metrics_render_after_billing_traffic() {
    let service = BillingService::new(Arc::new(InMemoryBillingStore::new()), None, HashMap::new());
    let (layer, handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/metrics", get(move || async move { handle.render() }))
        .merge(routes::app(service))
        .layer(layer);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/billing/plans")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("http_requests"));
}
