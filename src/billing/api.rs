use axum::{
    extract::{Extension, Path, Query},
    Json,
};
use chrono::Utc;
use serde::Deserialize;

use super::models::{Metric, MonthKey, PlanDefinition, QuotaOutcome, UsageSummary};
use super::service::{BillingOverview, BillingService};
use crate::error::{parse_workspace_id, AppResult};
use crate::extractor::AuthUser;

/// key: billing-api -> rest endpoints
pub async fn list_plans(
    Extension(service): Extension<BillingService>,
) -> AppResult<Json<Vec<PlanDefinition>>> {
    Ok(Json(service.plan_catalog().await?))
}

#[derive(Debug, Deserialize)]
pub struct EntitlementQuery {
    #[serde(default)]
    pub amount: Option<i64>,
}

pub async fn check_entitlement(
    Extension(service): Extension<BillingService>,
    caller: Option<AuthUser>,
    Path((workspace_id, metric)): Path<(String, String)>,
    Query(query): Query<EntitlementQuery>,
) -> AppResult<Json<QuotaOutcome>> {
    let workspace_id = parse_workspace_id(&workspace_id)?;
    let metric: Metric = metric.parse()?;
    service
        .guard()
        .authorize_member(workspace_id, caller.as_ref())
        .await?;
    let outcome = service
        .gate()
        .check(workspace_id, metric, query.amount.unwrap_or(1), Utc::now())
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    #[serde(default)]
    pub month: Option<String>,
}

pub async fn usage_summary(
    Extension(service): Extension<BillingService>,
    caller: Option<AuthUser>,
    Path(workspace_id): Path<String>,
    Query(query): Query<UsageQuery>,
) -> AppResult<Json<UsageSummary>> {
    let workspace_id = parse_workspace_id(&workspace_id)?;
    let month = match query.month.as_deref() {
        Some(raw) => raw.parse::<MonthKey>()?,
        None => MonthKey::current(),
    };
    service
        .guard()
        .authorize_member(workspace_id, caller.as_ref())
        .await?;
    Ok(Json(
        service.recorder().usage_summary(workspace_id, &month).await?,
    ))
}

pub async fn billing_overview(
    Extension(service): Extension<BillingService>,
    caller: Option<AuthUser>,
    Path(workspace_id): Path<String>,
) -> AppResult<Json<BillingOverview>> {
    let workspace_id = parse_workspace_id(&workspace_id)?;
    Ok(Json(
        service
            .billing_overview(workspace_id, caller.as_ref())
            .await?,
    ))
}
