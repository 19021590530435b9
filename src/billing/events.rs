use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// key: billing-provider-envelope -> verified event identity
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: EnvelopeData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvelopeData {
    #[serde(default)]
    pub object: Value,
}

impl EventEnvelope {
    pub fn parse(body: &[u8]) -> AppResult<Self> {
        let envelope: EventEnvelope = serde_json::from_slice(body)
            .map_err(|err| AppError::Validation(format!("malformed billing event: {err}")))?;
        if envelope.id.trim().is_empty() {
            return Err(AppError::Validation("billing event id missing".to_string()));
        }
        Ok(envelope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionChange {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutCompleted {
    pub workspace_id: Option<Uuid>,
    pub customer_id: Option<String>,
    pub customer_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSubscription {
    pub id: Option<String>,
    pub customer_id: String,
    pub status: String,
    pub price_id: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
}

/// key: billing-provider-events -> known event kinds
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    CheckoutCompleted(CheckoutCompleted),
    SubscriptionChanged {
        change: SubscriptionChange,
        subscription: ProviderSubscription,
    },
    /// Verified but not acted upon.
    Ignored { event_type: String },
}

#[derive(Deserialize)]
struct CheckoutObject {
    client_reference_id: Option<String>,
    customer: Option<String>,
    customer_email: Option<String>,
    customer_details: Option<CustomerDetails>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct CustomerDetails {
    email: Option<String>,
}

#[derive(Deserialize)]
struct SubscriptionObject {
    id: Option<String>,
    customer: String,
    status: String,
    current_period_end: Option<i64>,
    items: Option<SubscriptionItems>,
}

#[derive(Deserialize)]
struct SubscriptionItems {
    #[serde(default)]
    data: Vec<SubscriptionItem>,
}

#[derive(Deserialize)]
struct SubscriptionItem {
    price: Option<Price>,
    current_period_end: Option<i64>,
}

#[derive(Deserialize)]
struct Price {
    id: String,
}

impl ProviderEvent {
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self> {
        let change = match envelope.event_type.as_str() {
            "checkout.session.completed" => {
                return checkout_from_object(&envelope.data.object)
                    .map(ProviderEvent::CheckoutCompleted);
            }
            "customer.subscription.created" => SubscriptionChange::Created,
            "customer.subscription.updated" => SubscriptionChange::Updated,
            "customer.subscription.deleted" => SubscriptionChange::Deleted,
            other => {
                return Ok(ProviderEvent::Ignored {
                    event_type: other.to_string(),
                })
            }
        };
        let subscription = subscription_from_object(&envelope.data.object)?;
        Ok(ProviderEvent::SubscriptionChanged {
            change,
            subscription,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn checkout_from_object(object: &Value) -> Result<CheckoutCompleted> {
    let mut object: CheckoutObject =
        serde_json::from_value(object.clone()).context("decoding checkout session")?;
    let reference = non_empty(object.client_reference_id.take())
        .or_else(|| non_empty(object.metadata.remove("workspace_id")));
    let workspace_id = reference
        .map(|raw| {
            Uuid::parse_str(&raw).map_err(|_| anyhow!("checkout reference `{raw}` is not a workspace id"))
        })
        .transpose()?;
    let customer_email = non_empty(object.customer_email.take()).or_else(|| {
        object
            .customer_details
            .take()
            .and_then(|details| non_empty(details.email))
    });
    Ok(CheckoutCompleted {
        workspace_id,
        customer_id: non_empty(object.customer.take()),
        customer_email,
    })
}

fn subscription_from_object(object: &Value) -> Result<ProviderSubscription> {
    let object: SubscriptionObject =
        serde_json::from_value(object.clone()).context("decoding subscription")?;
    let first_item = object
        .items
        .and_then(|items| items.data.into_iter().next());
    let item_period_end = first_item.as_ref().and_then(|item| item.current_period_end);
    let price_id = first_item.and_then(|item| item.price).map(|price| price.id);
    let current_period_end = object
        .current_period_end
        .or(item_period_end)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());
    Ok(ProviderSubscription {
        id: non_empty(object.id),
        customer_id: object.customer,
        status: object.status,
        price_id,
        current_period_end,
    })
}
