use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use super::entitlements::EntitlementGate;
use super::ledger::BillingEventLedger;
use super::models::{
    EffectivePlan, EntitlementOverride, Metric, PlanDefinition, PlanKey, QuotaOutcome,
    UsageReceipt, WorkspaceSubscription,
};
use super::postgres::PgBillingStore;
use super::signature::SignatureVerifier;
use super::store::{BillingStore, EntitlementStore, LedgerStore};
use super::usage::UsageRecorder;
use crate::config;
use crate::error::AppResult;
use crate::extractor::AuthUser;
use crate::workspaces::MembershipGuard;

/// Output of a gated action together with its metering records.
#[derive(Debug, Clone, Serialize)]
pub struct Metered<T> {
    pub output: T,
    pub quota: QuotaOutcome,
    pub usage: UsageReceipt,
}

#[derive(Debug, Clone, Serialize)]
pub struct BillingOverview {
    pub workspace_id: Uuid,
    pub plan: EffectivePlan,
    pub subscription: Option<WorkspaceSubscription>,
    pub entitlement_override: Option<EntitlementOverride>,
    pub customer_id: Option<String>,
}

/// key: billing-service -> guard, gate, recorder and ledger over one store
#[derive(Clone)]
pub struct BillingService {
    guard: MembershipGuard,
    gate: EntitlementGate,
    recorder: UsageRecorder,
    ledger: BillingEventLedger,
    entitlements: Arc<dyn EntitlementStore>,
    ledger_store: Arc<dyn LedgerStore>,
}

impl BillingService {
    pub fn new<S>(
        store: Arc<S>,
        verifier: Option<SignatureVerifier>,
        price_plans: HashMap<String, PlanKey>,
    ) -> Self
    where
        S: BillingStore + 'static,
    {
        Self {
            guard: MembershipGuard::new(store.clone()),
            gate: EntitlementGate::new(store.clone()),
            recorder: UsageRecorder::new(store.clone()),
            ledger: BillingEventLedger::new(store.clone(), store.clone(), verifier, price_plans),
            entitlements: store.clone(),
            ledger_store: store,
        }
    }

    /// Postgres-backed service configured from the environment.
    pub fn postgres(pool: PgPool) -> Self {
        let verifier = config::BILLING_WEBHOOK_SECRET.as_ref().map(|secret| {
            SignatureVerifier::new(secret.as_bytes(), *config::BILLING_WEBHOOK_TOLERANCE_SECS)
        });
        if verifier.is_none() {
            warn!("BILLING_WEBHOOK_SECRET not set; billing webhooks will be rejected");
        }
        let mut service = Self::new(
            Arc::new(PgBillingStore::new(pool)),
            verifier,
            config::BILLING_PRICE_PLANS.clone(),
        );
        service.ledger = service.ledger.with_lease(*config::BILLING_EVENT_LEASE_SECS);
        service
    }

    pub fn guard(&self) -> &MembershipGuard {
        &self.guard
    }

    pub fn gate(&self) -> &EntitlementGate {
        &self.gate
    }

    pub fn recorder(&self) -> &UsageRecorder {
        &self.recorder
    }

    pub fn ledger(&self) -> &BillingEventLedger {
        &self.ledger
    }

    pub async fn plan_catalog(&self) -> AppResult<Vec<PlanDefinition>> {
        Ok(self.entitlements.plan_catalog().await?)
    }

    /// Owner-only view of the workspace's billing state.
    pub async fn billing_overview(
        &self,
        workspace_id: Uuid,
        caller: Option<&AuthUser>,
    ) -> AppResult<BillingOverview> {
        self.guard.authorize_owner(workspace_id, caller).await?;
        let plan = self.gate.effective_plan(workspace_id, Utc::now()).await?;
        Ok(BillingOverview {
            workspace_id,
            plan,
            subscription: self.entitlements.subscription(workspace_id).await?,
            entitlement_override: self.entitlements.entitlement_override(workspace_id).await?,
            customer_id: self.ledger_store.billing_customer(workspace_id).await?,
        })
    }

    /// Authorizes the caller, gates on quota, runs `action`, then records usage.
    ///
    /// Denials surface before `action` runs. Once it has succeeded, accounting problems
    /// only show up in the returned receipt.
    pub async fn run_metered<F, Fut, T>(
        &self,
        workspace_id: Uuid,
        caller: Option<&AuthUser>,
        metric: Metric,
        amount: i64,
        ref_id: Option<String>,
        action: F,
    ) -> AppResult<Metered<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        self.guard.authorize_member(workspace_id, caller).await?;
        let quota = self
            .gate
            .require(workspace_id, metric, amount, Utc::now())
            .await?;
        let output = action().await?;
        let usage = self
            .recorder
            .record_usage(workspace_id, metric, amount, ref_id)
            .await?;
        Ok(Metered {
            output,
            quota,
            usage,
        })
    }
}
