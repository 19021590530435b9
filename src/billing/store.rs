use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{
    BillingEventRecord, EntitlementOverride, Membership, Metric, MonthKey, PlanDefinition,
    PlanKey, SubscriptionUpdate, UsageEvent, Workspace, WorkspaceSubscription,
};

/// key: billing-store-workspaces -> tenancy reads and checkout provisioning
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    async fn workspace(&self, workspace_id: Uuid) -> Result<Option<Workspace>>;

    async fn membership(&self, workspace_id: Uuid, user_id: Uuid) -> Result<Option<Membership>>;

    /// Returns the oldest workspace owned by the user with `email`, creating the user,
    /// a default workspace and its owner membership when none exist.
    async fn ensure_workspace_for_email(&self, email: &str) -> Result<Workspace>;
}

/// key: billing-store-entitlements -> plan resolution inputs
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    async fn subscription(&self, workspace_id: Uuid) -> Result<Option<WorkspaceSubscription>>;

    async fn entitlement_override(&self, workspace_id: Uuid)
        -> Result<Option<EntitlementOverride>>;

    async fn plan_definition(&self, plan_key: PlanKey) -> Result<Option<PlanDefinition>>;

    async fn plan_catalog(&self) -> Result<Vec<PlanDefinition>>;

    /// Missing counters read as zero.
    async fn usage_count(&self, workspace_id: Uuid, metric: Metric, month: &MonthKey)
        -> Result<i64>;
}

/// key: billing-store-usage -> audit log and atomic counters
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn append_usage_event(&self, event: &UsageEvent) -> Result<()>;

    /// Single server-side add; creates the counter at `amount` when absent. Returns the new total.
    async fn increment_usage(
        &self,
        workspace_id: Uuid,
        metric: Metric,
        month: &MonthKey,
        amount: i64,
    ) -> Result<i64>;

    async fn usage_counters(&self, workspace_id: Uuid, month: &MonthKey)
        -> Result<Vec<(Metric, i64)>>;

    async fn audited_usage(&self, workspace_id: Uuid, metric: Metric, month: &MonthKey)
        -> Result<i64>;
}

/// Result of trying to take ownership of a provider event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClaim {
    /// First receipt; the row was inserted as pending.
    Claimed,
    /// A previous attempt failed, or its pending lease lapsed; the row moved back to pending.
    Reclaimed,
    AlreadyProcessed,
    /// Another delivery holds a pending row that is still within its lease.
    InFlight,
}

/// key: billing-store-ledger -> provider event bookkeeping and plan writes
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Pending rows last touched before `stale_before` belong to a holder that never
    /// settled them and are re-claimed like failed ones.
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<EventClaim>;

    async fn mark_event_processed(&self, event_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn mark_event_failed(&self, event_id: &str, error: &str) -> Result<()>;

    async fn billing_event(&self, event_id: &str) -> Result<Option<BillingEventRecord>>;

    async fn upsert_billing_customer(&self, workspace_id: Uuid, customer_id: &str) -> Result<()>;

    async fn workspace_for_customer(&self, customer_id: &str) -> Result<Option<Uuid>>;

    async fn billing_customer(&self, workspace_id: Uuid) -> Result<Option<String>>;

    async fn upsert_subscription(&self, update: &SubscriptionUpdate)
        -> Result<WorkspaceSubscription>;
}

pub trait BillingStore: WorkspaceStore + EntitlementStore + UsageStore + LedgerStore {}

impl<T> BillingStore for T where T: WorkspaceStore + EntitlementStore + UsageStore + LedgerStore {}
