use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use super::events::{
    CheckoutCompleted, EventEnvelope, ProviderEvent, ProviderSubscription, SubscriptionChange,
};
use super::models::{BillingEventRecord, PlanKey, SubscriptionStatus, SubscriptionUpdate};
use super::signature::SignatureVerifier;
use super::store::{EventClaim, LedgerStore, WorkspaceStore};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerOutcome {
    Processed,
    /// Verified and recorded, but the event kind carries no effect.
    Ignored,
    Duplicate,
}

/// How long a claimed event may stay pending before a redelivery takes it over.
pub const DEFAULT_EVENT_LEASE_SECS: i64 = 300;

/// key: billing-event-ledger -> verified, exactly-once provider event handling
#[derive(Clone)]
pub struct BillingEventLedger {
    workspaces: Arc<dyn WorkspaceStore>,
    store: Arc<dyn LedgerStore>,
    verifier: Option<SignatureVerifier>,
    price_plans: Arc<HashMap<String, PlanKey>>,
    lease: Duration,
}

impl BillingEventLedger {
    pub fn new(
        workspaces: Arc<dyn WorkspaceStore>,
        store: Arc<dyn LedgerStore>,
        verifier: Option<SignatureVerifier>,
        price_plans: HashMap<String, PlanKey>,
    ) -> Self {
        Self {
            workspaces,
            store,
            verifier,
            price_plans: Arc::new(price_plans),
            lease: Duration::seconds(DEFAULT_EVENT_LEASE_SECS),
        }
    }

    pub fn with_lease(mut self, lease_secs: i64) -> Self {
        self.lease = Duration::seconds(lease_secs);
        self
    }

    pub async fn event(&self, event_id: &str) -> AppResult<Option<BillingEventRecord>> {
        Ok(self.store.billing_event(event_id).await?)
    }

    pub async fn handle(&self, payload: &[u8], signature: Option<&str>) -> AppResult<LedgerOutcome> {
        self.handle_at(payload, signature, Utc::now()).await
    }

    pub async fn handle_at(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<LedgerOutcome> {
        self.verify(payload, signature, now)?;
        let envelope = EventEnvelope::parse(payload)?;
        let event_id = envelope.id.as_str();

        match self
            .store
            .claim_event(event_id, &envelope.event_type, now - self.lease)
            .await?
        {
            EventClaim::AlreadyProcessed => {
                info!(event_id, event_type = %envelope.event_type, "duplicate billing event skipped");
                return Ok(LedgerOutcome::Duplicate);
            }
            EventClaim::InFlight => {
                // Not settled yet; the provider must keep redelivering.
                info!(event_id, "billing event already being handled");
                return Err(AppError::EventInFlight(event_id.to_string()));
            }
            EventClaim::Reclaimed => {
                info!(event_id, "retrying unsettled billing event");
            }
            EventClaim::Claimed => {}
        }

        let applied = match self.apply(&envelope).await {
            Ok(outcome) => self
                .store
                .mark_event_processed(event_id, Utc::now())
                .await
                .map(|_| outcome),
            Err(err) => Err(err),
        };

        match applied {
            Ok(outcome) => {
                info!(event_id, event_type = %envelope.event_type, ?outcome, "billing event processed");
                Ok(outcome)
            }
            Err(err) => {
                let detail = format!("{err:#}");
                error!(event_id, event_type = %envelope.event_type, error = %detail, "billing event failed");
                if let Err(mark_err) = self.store.mark_event_failed(event_id, &detail).await {
                    error!(?mark_err, event_id, "failed to record billing event failure");
                }
                Err(AppError::BillingEvent {
                    event_id: event_id.to_string(),
                    detail,
                })
            }
        }
    }

    fn verify(
        &self,
        payload: &[u8],
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<()> {
        let reason = match (&self.verifier, signature) {
            (None, _) => "webhook secret not configured".to_string(),
            (Some(_), None) => "signature header missing".to_string(),
            (Some(verifier), Some(signature)) => match verifier.verify(payload, signature, now) {
                Ok(()) => return Ok(()),
                Err(err) => err.to_string(),
            },
        };
        warn!(security = true, reason = %reason, "rejected billing webhook");
        Err(AppError::ForgedEvent(reason))
    }

    async fn apply(&self, envelope: &EventEnvelope) -> Result<LedgerOutcome> {
        match ProviderEvent::from_envelope(envelope)? {
            ProviderEvent::CheckoutCompleted(checkout) => {
                self.apply_checkout(checkout).await?;
                Ok(LedgerOutcome::Processed)
            }
            ProviderEvent::SubscriptionChanged {
                change,
                subscription,
            } => {
                self.apply_subscription(change, subscription).await?;
                Ok(LedgerOutcome::Processed)
            }
            ProviderEvent::Ignored { event_type } => {
                info!(event_id = %envelope.id, event_type, "no handler for billing event type");
                Ok(LedgerOutcome::Ignored)
            }
        }
    }

    async fn apply_checkout(&self, checkout: CheckoutCompleted) -> Result<()> {
        let customer_id = checkout
            .customer_id
            .ok_or_else(|| anyhow!("checkout session has no customer id"))?;

        let workspace_id = match checkout.workspace_id {
            Some(workspace_id) => {
                self.workspaces
                    .workspace(workspace_id)
                    .await?
                    .ok_or_else(|| anyhow!("checkout references unknown workspace {workspace_id}"))?
                    .id
            }
            None => {
                let email = checkout.customer_email.ok_or_else(|| {
                    anyhow!("checkout carries neither a workspace reference nor a customer email")
                })?;
                self.workspaces.ensure_workspace_for_email(&email).await?.id
            }
        };

        self.store
            .upsert_billing_customer(workspace_id, &customer_id)
            .await?;
        info!(%workspace_id, customer_id, "linked billing customer to workspace");
        Ok(())
    }

    async fn apply_subscription(
        &self,
        change: SubscriptionChange,
        subscription: ProviderSubscription,
    ) -> Result<()> {
        let workspace_id = self
            .store
            .workspace_for_customer(&subscription.customer_id)
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "no workspace linked to billing customer {}",
                    subscription.customer_id
                )
            })?;

        let (plan_key, status) = match change {
            SubscriptionChange::Deleted => (PlanKey::Free, SubscriptionStatus::Canceled),
            SubscriptionChange::Created | SubscriptionChange::Updated => {
                let price_id = subscription
                    .price_id
                    .as_deref()
                    .ok_or_else(|| anyhow!("subscription carries no price"))?;
                let plan_key = self
                    .price_plans
                    .get(price_id)
                    .copied()
                    .ok_or_else(|| anyhow!("price {price_id} has no plan mapping"))?;
                (plan_key, SubscriptionStatus::from_provider(&subscription.status))
            }
        };

        let record = self
            .store
            .upsert_subscription(&SubscriptionUpdate {
                workspace_id,
                plan_key,
                status,
                provider_subscription_id: subscription.id,
                current_period_end: subscription.current_period_end,
            })
            .await?;
        info!(
            %workspace_id,
            plan = %record.plan_key,
            status = record.status.as_str(),
            ?change,
            "workspace subscription synced"
        );
        Ok(())
    }
}
