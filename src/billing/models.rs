use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Persisted value meaning "no monthly cap".
pub const UNLIMITED_SENTINEL: i64 = -1;

/// key: billing-metric -> closed set of metered actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Runs,
    Meetings,
    UploadMb,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Runs, Metric::Meetings, Metric::UploadMb];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Runs => "runs",
            Metric::Meetings => "meetings",
            Metric::UploadMb => "upload_mb",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "runs" => Ok(Metric::Runs),
            "meetings" => Ok(Metric::Meetings),
            "upload_mb" => Ok(Metric::UploadMb),
            other => Err(AppError::Validation(format!("unknown metric `{other}`"))),
        }
    }
}

/// key: billing-plan-key -> plan tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKey {
    Free,
    Starter,
    Pro,
    Team,
}

impl PlanKey {
    pub fn lowest() -> Self {
        PlanKey::Free
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKey::Free => "free",
            PlanKey::Starter => "starter",
            PlanKey::Pro => "pro",
            PlanKey::Team => "team",
        }
    }
}

impl fmt::Display for PlanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanKey {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "free" => Ok(PlanKey::Free),
            "starter" => Ok(PlanKey::Starter),
            "pro" => Ok(PlanKey::Pro),
            "team" => Ok(PlanKey::Team),
            other => Err(AppError::Validation(format!("unknown plan `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Limit {
    Count(i64),
    Unlimited,
}

impl Limit {
    pub fn from_stored(value: i64) -> Self {
        if value == UNLIMITED_SENTINEL {
            Limit::Unlimited
        } else {
            Limit::Count(value.max(0))
        }
    }

    pub fn to_stored(self) -> i64 {
        match self {
            Limit::Count(value) => value,
            Limit::Unlimited => UNLIMITED_SENTINEL,
        }
    }
}

/// key: billing-plan-definition -> per-metric monthly limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanDefinition {
    pub plan_key: PlanKey,
    pub limits: HashMap<Metric, Limit>,
}

impl PlanDefinition {
    pub fn new(plan_key: PlanKey, limits: impl IntoIterator<Item = (Metric, Limit)>) -> Self {
        Self {
            plan_key,
            limits: limits.into_iter().collect(),
        }
    }

    /// Metrics absent from a known plan grant nothing.
    pub fn limit_for(&self, metric: Metric) -> Limit {
        self.limits.get(&metric).copied().unwrap_or(Limit::Count(0))
    }
}

pub fn builtin_catalog() -> Vec<PlanDefinition> {
    use Limit::{Count, Unlimited};
    vec![
        PlanDefinition::new(
            PlanKey::Free,
            [
                (Metric::Runs, Count(5)),
                (Metric::Meetings, Count(2)),
                (Metric::UploadMb, Count(25)),
            ],
        ),
        PlanDefinition::new(
            PlanKey::Starter,
            [
                (Metric::Runs, Count(50)),
                (Metric::Meetings, Count(20)),
                (Metric::UploadMb, Count(250)),
            ],
        ),
        PlanDefinition::new(
            PlanKey::Pro,
            [
                (Metric::Runs, Unlimited),
                (Metric::Meetings, Count(200)),
                (Metric::UploadMb, Count(2048)),
            ],
        ),
        PlanDefinition::new(
            PlanKey::Team,
            [
                (Metric::Runs, Unlimited),
                (Metric::Meetings, Unlimited),
                (Metric::UploadMb, Unlimited),
            ],
        ),
    ]
}

/// Calendar month bucket (`YYYY-MM`) used to key usage counters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MonthKey(String);

impl MonthKey {
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        let iso = at.to_rfc3339();
        MonthKey(iso[..7].to_string())
    }

    pub fn current() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MonthKey {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let bytes = value.as_bytes();
        let shaped = bytes.len() == 7
            && bytes[4] == b'-'
            && bytes[..4].iter().all(u8::is_ascii_digit)
            && bytes[5..].iter().all(u8::is_ascii_digit);
        let month: u32 = if shaped {
            value[5..].parse().unwrap_or(0)
        } else {
            0
        };
        if !(1..=12).contains(&month) {
            return Err(AppError::Validation(format!(
                "month must look like YYYY-MM, got `{value}`"
            )));
        }
        Ok(MonthKey(value.to_string()))
    }
}

impl TryFrom<String> for MonthKey {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MonthKey> for String {
    fn from(value: MonthKey) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    Unpaid,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Unpaid => "unpaid",
        }
    }

    /// Provider status strings outside the known set are treated as lapsed.
    pub fn from_provider(value: &str) -> Self {
        match value {
            "active" => SubscriptionStatus::Active,
            "trialing" => SubscriptionStatus::Trialing,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" | "cancelled" => SubscriptionStatus::Canceled,
            "unpaid" => SubscriptionStatus::Unpaid,
            _ => SubscriptionStatus::Incomplete,
        }
    }
}

/// key: billing-subscription-model -> workspace plan state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSubscription {
    pub workspace_id: Uuid,
    pub plan_key: PlanKey,
    pub status: SubscriptionStatus,
    pub provider_subscription_id: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkspaceSubscription {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if !matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        ) {
            return false;
        }
        if let Some(end) = self.current_period_end {
            if end < now {
                return false;
            }
        }
        true
    }
}

/// Write request produced by subscription events.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionUpdate {
    pub workspace_id: Uuid,
    pub plan_key: PlanKey,
    pub status: SubscriptionStatus,
    pub provider_subscription_id: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
}

/// key: billing-override-model -> manual plan grants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitlementOverride {
    pub workspace_id: Uuid,
    pub plan_key: PlanKey,
    pub reason: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl EntitlementOverride {
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |end| end > now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Member,
}

impl MemberRole {
    pub fn from_stored(value: &str) -> Self {
        if value == "owner" {
            MemberRole::Owner
        } else {
            MemberRole::Member
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Owner => "owner",
            MemberRole::Member => "member",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub workspace_id: Uuid,
    pub user_id: Uuid,
    pub role: MemberRole,
}

/// key: billing-usage-audit -> append-only consumption log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub metric: Metric,
    pub amount: i64,
    pub ref_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventStatus {
    Pending,
    Processed,
    Failed,
}

impl BillingEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventStatus::Pending => "pending",
            BillingEventStatus::Processed => "processed",
            BillingEventStatus::Failed => "failed",
        }
    }

    pub fn from_stored(value: &str) -> Self {
        match value {
            "processed" => BillingEventStatus::Processed,
            "failed" => BillingEventStatus::Failed,
            _ => BillingEventStatus::Pending,
        }
    }
}

/// key: billing-event-ledger-model -> provider event receipts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub status: BillingEventStatus,
    pub attempts: i32,
    pub error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Subscription,
    Override,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectivePlan {
    pub plan_key: PlanKey,
    pub source: PlanSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaOutcome {
    pub allowed: bool,
    pub metric: Metric,
    pub plan: EffectivePlan,
    pub month: MonthKey,
    /// `None` means unlimited.
    pub limit: Option<i64>,
    pub used: i64,
    pub remaining: Option<i64>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageReceipt {
    pub workspace_id: Uuid,
    pub metric: Metric,
    pub amount: i64,
    pub month: MonthKey,
    /// Counter total after the increment; absent when accounting was deferred.
    pub total: Option<i64>,
    pub notes: Vec<String>,
}

impl UsageReceipt {
    pub fn is_complete(&self) -> bool {
        self.total.is_some() && self.notes.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub workspace_id: Uuid,
    pub month: MonthKey,
    pub counters: HashMap<Metric, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageDrift {
    pub workspace_id: Uuid,
    pub metric: Metric,
    pub month: MonthKey,
    pub counter: i64,
    pub audited: i64,
}

impl UsageDrift {
    pub fn delta(&self) -> i64 {
        self.counter - self.audited
    }

    pub fn is_consistent(&self) -> bool {
        self.delta() == 0
    }
}
