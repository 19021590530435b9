use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::models::{
    builtin_catalog, BillingEventRecord, BillingEventStatus, EntitlementOverride, MemberRole,
    Membership, Metric, MonthKey, PlanDefinition, PlanKey, SubscriptionUpdate, UsageEvent,
    Workspace, WorkspaceSubscription,
};
use super::store::{EventClaim, EntitlementStore, LedgerStore, UsageStore, WorkspaceStore};

type CounterKey = (Uuid, Metric, MonthKey);

/// key: billing-store-memory -> process-local store for tests and local runs
///
/// Every mutation goes through a single `DashMap` entry, so counter increments and event
/// claims keep the same one-winner semantics as the Postgres upserts.
#[derive(Default)]
pub struct InMemoryBillingStore {
    users: DashMap<String, Uuid>,
    workspaces: DashMap<Uuid, Workspace>,
    members: DashMap<(Uuid, Uuid), MemberRole>,
    plans: DashMap<PlanKey, PlanDefinition>,
    subscriptions: DashMap<Uuid, WorkspaceSubscription>,
    overrides: DashMap<Uuid, EntitlementOverride>,
    customers: DashMap<Uuid, String>,
    customer_index: DashMap<String, Uuid>,
    usage_events: DashMap<Uuid, UsageEvent>,
    counters: DashMap<CounterKey, i64>,
    events: DashMap<String, BillingEventRecord>,
    provisioning: Mutex<()>,
    fail_counter_increments: AtomicBool,
    fail_audit_appends: AtomicBool,
}

impl InMemoryBillingStore {
    /// Store seeded with the built-in plan catalog.
    pub fn new() -> Self {
        let store = Self::default();
        for plan in builtin_catalog() {
            store.plans.insert(plan.plan_key, plan);
        }
        store
    }

    pub fn create_user(&self, email: &str) -> Uuid {
        *self
            .users
            .entry(email.trim().to_ascii_lowercase())
            .or_insert_with(Uuid::new_v4)
    }

    pub fn create_workspace(&self, owner_id: Uuid, name: &str) -> Workspace {
        let workspace = Workspace {
            id: Uuid::new_v4(),
            owner_id,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.workspaces.insert(workspace.id, workspace.clone());
        self.members
            .insert((workspace.id, owner_id), MemberRole::Owner);
        workspace
    }

    pub fn add_member(&self, workspace_id: Uuid, user_id: Uuid, role: MemberRole) {
        self.members.insert((workspace_id, user_id), role);
    }

    pub fn set_plan(&self, plan: PlanDefinition) {
        self.plans.insert(plan.plan_key, plan);
    }

    pub fn remove_plan(&self, plan_key: PlanKey) {
        self.plans.remove(&plan_key);
    }

    pub fn set_subscription(&self, subscription: WorkspaceSubscription) {
        self.subscriptions
            .insert(subscription.workspace_id, subscription);
    }

    pub fn set_override(&self, grant: EntitlementOverride) {
        self.overrides.insert(grant.workspace_id, grant);
    }

    pub fn set_usage(&self, workspace_id: Uuid, metric: Metric, month: &MonthKey, count: i64) {
        self.counters
            .insert((workspace_id, metric, month.clone()), count);
    }

    pub fn usage_event_count(&self) -> usize {
        self.usage_events.len()
    }

    pub fn workspaces_owned_by(&self, email: &str) -> Vec<Workspace> {
        let Some(owner_id) = self
            .users
            .get(&email.trim().to_ascii_lowercase())
            .map(|entry| *entry)
        else {
            return Vec::new();
        };
        self.workspaces
            .iter()
            .filter(|entry| entry.owner_id == owner_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn fail_counter_increments(&self, enabled: bool) {
        self.fail_counter_increments
            .store(enabled, Ordering::SeqCst);
    }

    pub fn fail_audit_appends(&self, enabled: bool) {
        self.fail_audit_appends.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkspaceStore for InMemoryBillingStore {
    async fn workspace(&self, workspace_id: Uuid) -> Result<Option<Workspace>> {
        Ok(self
            .workspaces
            .get(&workspace_id)
            .map(|entry| entry.value().clone()))
    }

    async fn membership(&self, workspace_id: Uuid, user_id: Uuid) -> Result<Option<Membership>> {
        Ok(self
            .members
            .get(&(workspace_id, user_id))
            .map(|role| Membership {
                workspace_id,
                user_id,
                role: *role,
            }))
    }

    async fn ensure_workspace_for_email(&self, email: &str) -> Result<Workspace> {
        let _guard = self.provisioning.lock().await;
        let owner_id = self.create_user(email);
        let existing = self
            .workspaces
            .iter()
            .filter(|entry| entry.owner_id == owner_id)
            .min_by_key(|entry| entry.created_at)
            .map(|entry| entry.value().clone());
        Ok(match existing {
            Some(workspace) => workspace,
            None => self.create_workspace(owner_id, "Default workspace"),
        })
    }
}

#[async_trait]
impl EntitlementStore for InMemoryBillingStore {
    async fn subscription(&self, workspace_id: Uuid) -> Result<Option<WorkspaceSubscription>> {
        Ok(self
            .subscriptions
            .get(&workspace_id)
            .map(|entry| entry.value().clone()))
    }

    async fn entitlement_override(
        &self,
        workspace_id: Uuid,
    ) -> Result<Option<EntitlementOverride>> {
        Ok(self
            .overrides
            .get(&workspace_id)
            .map(|entry| entry.value().clone()))
    }

    async fn plan_definition(&self, plan_key: PlanKey) -> Result<Option<PlanDefinition>> {
        Ok(self.plans.get(&plan_key).map(|entry| entry.value().clone()))
    }

    async fn plan_catalog(&self) -> Result<Vec<PlanDefinition>> {
        let mut catalog: Vec<_> = self
            .plans
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        catalog.sort_by_key(|plan| plan.plan_key);
        Ok(catalog)
    }

    async fn usage_count(
        &self,
        workspace_id: Uuid,
        metric: Metric,
        month: &MonthKey,
    ) -> Result<i64> {
        Ok(self
            .counters
            .get(&(workspace_id, metric, month.clone()))
            .map(|count| *count)
            .unwrap_or(0))
    }
}

#[async_trait]
impl UsageStore for InMemoryBillingStore {
    async fn append_usage_event(&self, event: &UsageEvent) -> Result<()> {
        if self.fail_audit_appends.load(Ordering::SeqCst) {
            bail!("audit log unavailable");
        }
        self.usage_events.insert(event.id, event.clone());
        Ok(())
    }

    async fn increment_usage(
        &self,
        workspace_id: Uuid,
        metric: Metric,
        month: &MonthKey,
        amount: i64,
    ) -> Result<i64> {
        if self.fail_counter_increments.load(Ordering::SeqCst) {
            bail!("usage counter unavailable");
        }
        let mut count = self
            .counters
            .entry((workspace_id, metric, month.clone()))
            .or_insert(0);
        *count += amount;
        Ok(*count)
    }

    async fn usage_counters(
        &self,
        workspace_id: Uuid,
        month: &MonthKey,
    ) -> Result<Vec<(Metric, i64)>> {
        Ok(self
            .counters
            .iter()
            .filter(|entry| entry.key().0 == workspace_id && &entry.key().2 == month)
            .map(|entry| (entry.key().1, *entry.value()))
            .collect())
    }

    async fn audited_usage(
        &self,
        workspace_id: Uuid,
        metric: Metric,
        month: &MonthKey,
    ) -> Result<i64> {
        Ok(self
            .usage_events
            .iter()
            .filter(|entry| {
                entry.workspace_id == workspace_id
                    && entry.metric == metric
                    && &MonthKey::from_datetime(entry.created_at) == month
            })
            .map(|entry| entry.amount)
            .sum())
    }
}

#[async_trait]
impl LedgerStore for InMemoryBillingStore {
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<EventClaim> {
        let now = Utc::now();
        match self.events.entry(event_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(BillingEventRecord {
                    event_id: event_id.to_string(),
                    event_type: event_type.to_string(),
                    status: BillingEventStatus::Pending,
                    attempts: 1,
                    error: None,
                    received_at: now,
                    processed_at: None,
                    updated_at: now,
                });
                Ok(EventClaim::Claimed)
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                let abandoned = record.status == BillingEventStatus::Pending
                    && record.updated_at < stale_before;
                match record.status {
                    BillingEventStatus::Processed => Ok(EventClaim::AlreadyProcessed),
                    BillingEventStatus::Pending if !abandoned => Ok(EventClaim::InFlight),
                    BillingEventStatus::Failed | BillingEventStatus::Pending => {
                        record.status = BillingEventStatus::Pending;
                        record.attempts += 1;
                        record.updated_at = now;
                        Ok(EventClaim::Reclaimed)
                    }
                }
            }
        }
    }

    async fn mark_event_processed(&self, event_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut record = self
            .events
            .get_mut(event_id)
            .ok_or_else(|| anyhow!("billing event {event_id} not found"))?;
        record.status = BillingEventStatus::Processed;
        record.error = None;
        record.processed_at = Some(at);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_event_failed(&self, event_id: &str, error: &str) -> Result<()> {
        let mut record = self
            .events
            .get_mut(event_id)
            .ok_or_else(|| anyhow!("billing event {event_id} not found"))?;
        record.status = BillingEventStatus::Failed;
        record.error = Some(error.to_string());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn billing_event(&self, event_id: &str) -> Result<Option<BillingEventRecord>> {
        Ok(self
            .events
            .get(event_id)
            .map(|entry| entry.value().clone()))
    }

    async fn upsert_billing_customer(&self, workspace_id: Uuid, customer_id: &str) -> Result<()> {
        match self.customer_index.entry(customer_id.to_string()) {
            Entry::Occupied(slot) if *slot.get() != workspace_id => {
                bail!(
                    "billing customer {customer_id} is already linked to workspace {}",
                    slot.get()
                );
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(workspace_id);
            }
        }
        if let Some(previous) = self
            .customers
            .insert(workspace_id, customer_id.to_string())
        {
            if previous != customer_id {
                self.customer_index.remove(&previous);
            }
        }
        Ok(())
    }

    async fn workspace_for_customer(&self, customer_id: &str) -> Result<Option<Uuid>> {
        Ok(self.customer_index.get(customer_id).map(|entry| *entry))
    }

    async fn billing_customer(&self, workspace_id: Uuid) -> Result<Option<String>> {
        Ok(self
            .customers
            .get(&workspace_id)
            .map(|entry| entry.value().clone()))
    }

    async fn upsert_subscription(
        &self,
        update: &SubscriptionUpdate,
    ) -> Result<WorkspaceSubscription> {
        let mut entry = self
            .subscriptions
            .entry(update.workspace_id)
            .or_insert_with(|| WorkspaceSubscription {
                workspace_id: update.workspace_id,
                plan_key: update.plan_key,
                status: update.status,
                provider_subscription_id: None,
                current_period_end: None,
                updated_at: Utc::now(),
            });
        entry.plan_key = update.plan_key;
        entry.status = update.status;
        if update.provider_subscription_id.is_some() {
            entry.provider_subscription_id = update.provider_subscription_id.clone();
        }
        entry.current_period_end = update.current_period_end;
        entry.updated_at = Utc::now();
        Ok(entry.value().clone())
    }
}
