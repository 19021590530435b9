use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use super::models::{EffectivePlan, Limit, Metric, MonthKey, PlanKey, PlanSource, QuotaOutcome};
use super::store::EntitlementStore;
use crate::error::{AppError, AppResult};

/// key: billing-entitlement-gate -> per-period quota decisions
///
/// The gate only reads. Two concurrent checks may both pass on the same remaining
/// headroom; limits are soft by the number of in-flight requests.
#[derive(Clone)]
pub struct EntitlementGate {
    store: Arc<dyn EntitlementStore>,
}

impl EntitlementGate {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self { store }
    }

    /// Active provider subscription, then a current manual override, then the lowest plan.
    pub async fn effective_plan(
        &self,
        workspace_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<EffectivePlan> {
        if let Some(subscription) = self.store.subscription(workspace_id).await? {
            if subscription.is_active(now) {
                return Ok(EffectivePlan {
                    plan_key: subscription.plan_key,
                    source: PlanSource::Subscription,
                });
            }
        }

        if let Some(grant) = self.store.entitlement_override(workspace_id).await? {
            if grant.is_current(now) {
                return Ok(EffectivePlan {
                    plan_key: grant.plan_key,
                    source: PlanSource::Override,
                });
            }
        }

        Ok(EffectivePlan {
            plan_key: PlanKey::lowest(),
            source: PlanSource::Default,
        })
    }

    pub async fn check(
        &self,
        workspace_id: Uuid,
        metric: Metric,
        amount: i64,
        now: DateTime<Utc>,
    ) -> AppResult<QuotaOutcome> {
        if amount <= 0 {
            return Err(AppError::Validation(
                "requested amount must be positive".to_string(),
            ));
        }

        let plan = self.effective_plan(workspace_id, now).await?;
        let month = MonthKey::from_datetime(now);

        let Some(definition) = self.store.plan_definition(plan.plan_key).await? else {
            debug!(%workspace_id, plan = %plan.plan_key, "plan missing from catalog");
            return Ok(QuotaOutcome {
                allowed: false,
                metric,
                notes: vec![format!("billing:plan-missing:{}", plan.plan_key)],
                plan,
                month,
                limit: Some(0),
                used: 0,
                remaining: Some(0),
            });
        };

        let limit = match definition.limit_for(metric) {
            Limit::Unlimited => {
                return Ok(QuotaOutcome {
                    allowed: true,
                    metric,
                    plan,
                    month,
                    limit: None,
                    used: 0,
                    remaining: None,
                    notes: vec![format!("billing:quota:{metric}:unlimited")],
                });
            }
            Limit::Count(limit) => limit,
        };

        let used = self.store.usage_count(workspace_id, metric, &month).await?;
        let future_used = used.saturating_add(amount);
        let allowed = future_used <= limit;
        let (remaining, note) = if allowed {
            (
                limit - future_used,
                format!("billing:quota:{metric}:{future_used}/{limit}"),
            )
        } else {
            (
                limit.saturating_sub(used).max(0),
                format!("billing:quota-exceeded:{metric}"),
            )
        };

        Ok(QuotaOutcome {
            allowed,
            metric,
            plan,
            month,
            limit: Some(limit),
            used,
            remaining: Some(remaining),
            notes: vec![note],
        })
    }

    pub async fn can_consume(
        &self,
        workspace_id: Uuid,
        metric: Metric,
        amount: i64,
    ) -> AppResult<bool> {
        Ok(self
            .check(workspace_id, metric, amount, Utc::now())
            .await?
            .allowed)
    }

    /// Like [`check`](Self::check) but turns a denial into `LimitExceeded`.
    pub async fn require(
        &self,
        workspace_id: Uuid,
        metric: Metric,
        amount: i64,
        now: DateTime<Utc>,
    ) -> AppResult<QuotaOutcome> {
        let outcome = self.check(workspace_id, metric, amount, now).await?;
        if !outcome.allowed {
            return Err(AppError::LimitExceeded {
                metric,
                limit: outcome.limit.unwrap_or(0),
                used: outcome.used,
            });
        }
        Ok(outcome)
    }
}
