use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use super::models::{
    BillingEventRecord, BillingEventStatus, EntitlementOverride, Limit, MemberRole, Membership,
    Metric, MonthKey, PlanDefinition, PlanKey, SubscriptionStatus, SubscriptionUpdate, UsageEvent,
    Workspace, WorkspaceSubscription,
};
use super::store::{EventClaim, EntitlementStore, LedgerStore, UsageStore, WorkspaceStore};

/// key: billing-store-postgres -> sqlx-backed persistence
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn workspace_from_row(row: &PgRow) -> Workspace {
    Workspace {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        name: row.get("name"),
        created_at: row.get("created_at"),
    }
}

fn subscription_from_row(row: &PgRow) -> Result<WorkspaceSubscription> {
    let plan_key: String = row.get("plan_key");
    let status: String = row.get("status");
    Ok(WorkspaceSubscription {
        workspace_id: row.get("workspace_id"),
        plan_key: plan_key.parse()?,
        status: SubscriptionStatus::from_provider(&status),
        provider_subscription_id: row.get("provider_subscription_id"),
        current_period_end: row.get("current_period_end"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl WorkspaceStore for PgBillingStore {
    async fn workspace(&self, workspace_id: Uuid) -> Result<Option<Workspace>> {
        let row = sqlx::query("SELECT id, owner_id, name, created_at FROM workspaces WHERE id = $1")
            .bind(workspace_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(workspace_from_row))
    }

    async fn membership(&self, workspace_id: Uuid, user_id: Uuid) -> Result<Option<Membership>> {
        let role: Option<String> = sqlx::query_scalar(
            "SELECT role FROM workspace_members WHERE workspace_id = $1 AND user_id = $2",
        )
        .bind(workspace_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(role.map(|role| Membership {
            workspace_id,
            user_id,
            role: MemberRole::from_stored(&role),
        }))
    }

    async fn ensure_workspace_for_email(&self, email: &str) -> Result<Workspace> {
        let email = email.trim().to_ascii_lowercase();
        let mut tx = self.pool.begin().await?;

        let user_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO users (id, email) VALUES ($1, $2)
            ON CONFLICT (email) DO UPDATE SET email = EXCLUDED.email
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&email)
        .fetch_one(&mut tx)
        .await
        .context("upserting user for checkout email")?;

        let existing = sqlx::query(
            r#"
            SELECT id, owner_id, name, created_at FROM workspaces
            WHERE owner_id = $1
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut tx)
        .await?;

        let workspace = match existing {
            Some(row) => workspace_from_row(&row),
            None => {
                let row = sqlx::query(
                    r#"
                    INSERT INTO workspaces (id, owner_id, name) VALUES ($1, $2, $3)
                    RETURNING id, owner_id, name, created_at
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(user_id)
                .bind("Default workspace")
                .fetch_one(&mut tx)
                .await?;
                let workspace = workspace_from_row(&row);
                sqlx::query(
                    "INSERT INTO workspace_members (workspace_id, user_id, role) VALUES ($1, $2, 'owner') ON CONFLICT DO NOTHING",
                )
                .bind(workspace.id)
                .bind(user_id)
                .execute(&mut tx)
                .await?;
                workspace
            }
        };

        tx.commit().await?;
        Ok(workspace)
    }
}

#[async_trait]
impl EntitlementStore for PgBillingStore {
    async fn subscription(&self, workspace_id: Uuid) -> Result<Option<WorkspaceSubscription>> {
        let row = sqlx::query(
            r#"
            SELECT workspace_id, plan_key, status, provider_subscription_id,
                   current_period_end, updated_at
            FROM workspace_subscriptions
            WHERE workspace_id = $1
            "#,
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn entitlement_override(
        &self,
        workspace_id: Uuid,
    ) -> Result<Option<EntitlementOverride>> {
        let row = sqlx::query(
            "SELECT plan_key, reason, expires_at FROM entitlement_overrides WHERE workspace_id = $1",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let plan_key: String = row.get("plan_key");
        Ok(Some(EntitlementOverride {
            workspace_id,
            plan_key: plan_key.parse()?,
            reason: row.get("reason"),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn plan_definition(&self, plan_key: PlanKey) -> Result<Option<PlanDefinition>> {
        let rows = sqlx::query("SELECT metric, monthly_limit FROM plan_limits WHERE plan_key = $1")
            .bind(plan_key.as_str())
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut limits = Vec::with_capacity(rows.len());
        for row in rows {
            let metric: String = row.get("metric");
            let Ok(metric) = metric.parse::<Metric>() else {
                tracing::warn!(plan = %plan_key, metric, "skipping unknown metric in plan catalog");
                continue;
            };
            limits.push((metric, Limit::from_stored(row.get("monthly_limit"))));
        }
        Ok(Some(PlanDefinition::new(plan_key, limits)))
    }

    async fn plan_catalog(&self) -> Result<Vec<PlanDefinition>> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT plan_key FROM plan_limits ORDER BY plan_key")
                .fetch_all(&self.pool)
                .await?;
        let mut catalog = Vec::with_capacity(keys.len());
        for key in keys {
            let Ok(plan_key) = key.parse::<PlanKey>() else {
                continue;
            };
            if let Some(plan) = self.plan_definition(plan_key).await? {
                catalog.push(plan);
            }
        }
        catalog.sort_by_key(|plan| plan.plan_key);
        Ok(catalog)
    }

    async fn usage_count(
        &self,
        workspace_id: Uuid,
        metric: Metric,
        month: &MonthKey,
    ) -> Result<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT count FROM usage_counters
            WHERE workspace_id = $1 AND metric = $2 AND month_key = $3
            "#,
        )
        .bind(workspace_id)
        .bind(metric.as_str())
        .bind(month.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(count.unwrap_or(0))
    }
}

#[async_trait]
impl UsageStore for PgBillingStore {
    async fn append_usage_event(&self, event: &UsageEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_events (id, workspace_id, metric, month_key, amount, ref_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(event.workspace_id)
        .bind(event.metric.as_str())
        .bind(MonthKey::from_datetime(event.created_at).as_str())
        .bind(event.amount)
        .bind(event.ref_id.as_deref())
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_usage(
        &self,
        workspace_id: Uuid,
        metric: Metric,
        month: &MonthKey,
        amount: i64,
    ) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO usage_counters (workspace_id, metric, month_key, count)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (workspace_id, metric, month_key)
            DO UPDATE SET
                count = usage_counters.count + EXCLUDED.count,
                updated_at = NOW()
            RETURNING count
            "#,
        )
        .bind(workspace_id)
        .bind(metric.as_str())
        .bind(month.as_str())
        .bind(amount)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn usage_counters(
        &self,
        workspace_id: Uuid,
        month: &MonthKey,
    ) -> Result<Vec<(Metric, i64)>> {
        let rows = sqlx::query(
            "SELECT metric, count FROM usage_counters WHERE workspace_id = $1 AND month_key = $2",
        )
        .bind(workspace_id)
        .bind(month.as_str())
        .fetch_all(&self.pool)
        .await?;
        let mut counters = Vec::with_capacity(rows.len());
        for row in rows {
            let metric: String = row.get("metric");
            if let Ok(metric) = metric.parse::<Metric>() {
                counters.push((metric, row.get("count")));
            }
        }
        Ok(counters)
    }

    async fn audited_usage(
        &self,
        workspace_id: Uuid,
        metric: Metric,
        month: &MonthKey,
    ) -> Result<i64> {
        let total: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(amount)::BIGINT FROM usage_events
            WHERE workspace_id = $1 AND metric = $2 AND month_key = $3
            "#,
        )
        .bind(workspace_id)
        .bind(metric.as_str())
        .bind(month.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(total.unwrap_or(0))
    }
}

#[async_trait]
impl LedgerStore for PgBillingStore {
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<EventClaim> {
        let inserted: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO billing_events (event_id, event_type, status)
            VALUES ($1, $2, 'pending')
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await?;
        if inserted.is_some() {
            return Ok(EventClaim::Claimed);
        }

        let reclaimed: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE billing_events
            SET status = 'pending', attempts = attempts + 1, updated_at = NOW()
            WHERE event_id = $1
              AND (status = 'failed' OR (status = 'pending' AND updated_at < $2))
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;
        if reclaimed.is_some() {
            return Ok(EventClaim::Reclaimed);
        }

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM billing_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;
        match status.as_deref().map(BillingEventStatus::from_stored) {
            Some(BillingEventStatus::Processed) => Ok(EventClaim::AlreadyProcessed),
            Some(_) => Ok(EventClaim::InFlight),
            None => Err(anyhow!("billing event {event_id} disappeared while claiming")),
        }
    }

    async fn mark_event_processed(&self, event_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE billing_events
            SET status = 'processed', error = NULL, processed_at = $2, updated_at = NOW()
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_event_failed(&self, event_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE billing_events SET status = 'failed', error = $2, updated_at = NOW() WHERE event_id = $1",
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn billing_event(&self, event_id: &str) -> Result<Option<BillingEventRecord>> {
        let row = sqlx::query(
            r#"
            SELECT event_id, event_type, status, attempts, error, received_at, processed_at, updated_at
            FROM billing_events WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| {
            let status: String = row.get("status");
            BillingEventRecord {
                event_id: row.get("event_id"),
                event_type: row.get("event_type"),
                status: BillingEventStatus::from_stored(&status),
                attempts: row.get("attempts"),
                error: row.get("error"),
                received_at: row.get("received_at"),
                processed_at: row.get("processed_at"),
                updated_at: row.get("updated_at"),
            }
        }))
    }

    async fn upsert_billing_customer(&self, workspace_id: Uuid, customer_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let linked: Option<Uuid> = sqlx::query_scalar(
            "SELECT workspace_id FROM billing_customers WHERE customer_id = $1 FOR UPDATE",
        )
        .bind(customer_id)
        .fetch_optional(&mut tx)
        .await?;
        if let Some(other) = linked.filter(|other| *other != workspace_id) {
            return Err(anyhow!(
                "billing customer {customer_id} is already linked to workspace {other}"
            ));
        }
        sqlx::query(
            r#"
            INSERT INTO billing_customers (workspace_id, customer_id)
            VALUES ($1, $2)
            ON CONFLICT (workspace_id)
            DO UPDATE SET customer_id = EXCLUDED.customer_id, updated_at = NOW()
            "#,
        )
        .bind(workspace_id)
        .bind(customer_id)
        .execute(&mut tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn workspace_for_customer(&self, customer_id: &str) -> Result<Option<Uuid>> {
        let workspace_id: Option<Uuid> =
            sqlx::query_scalar("SELECT workspace_id FROM billing_customers WHERE customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(workspace_id)
    }

    async fn billing_customer(&self, workspace_id: Uuid) -> Result<Option<String>> {
        let customer_id: Option<String> =
            sqlx::query_scalar("SELECT customer_id FROM billing_customers WHERE workspace_id = $1")
                .bind(workspace_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(customer_id)
    }

    async fn upsert_subscription(
        &self,
        update: &SubscriptionUpdate,
    ) -> Result<WorkspaceSubscription> {
        let row = sqlx::query(
            r#"
            INSERT INTO workspace_subscriptions (
                workspace_id,
                plan_key,
                status,
                provider_subscription_id,
                current_period_end
            ) VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (workspace_id)
            DO UPDATE SET
                plan_key = EXCLUDED.plan_key,
                status = EXCLUDED.status,
                provider_subscription_id = COALESCE(
                    EXCLUDED.provider_subscription_id,
                    workspace_subscriptions.provider_subscription_id
                ),
                current_period_end = EXCLUDED.current_period_end,
                updated_at = NOW()
            RETURNING workspace_id, plan_key, status, provider_subscription_id,
                      current_period_end, updated_at
            "#,
        )
        .bind(update.workspace_id)
        .bind(update.plan_key.as_str())
        .bind(update.status.as_str())
        .bind(update.provider_subscription_id.as_deref())
        .bind(update.current_period_end)
        .fetch_one(&self.pool)
        .await?;
        subscription_from_row(&row)
    }
}
