pub mod api;
pub mod entitlements;
pub mod events;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod service;
pub mod signature;
pub mod store;
pub mod usage;

pub use entitlements::EntitlementGate;
pub use events::{EventEnvelope, ProviderEvent, SubscriptionChange};
pub use ledger::{BillingEventLedger, LedgerOutcome, DEFAULT_EVENT_LEASE_SECS};
pub use memory::InMemoryBillingStore;
pub use models::{
    builtin_catalog, BillingEventRecord, BillingEventStatus, EffectivePlan, EntitlementOverride,
    Limit, MemberRole, Metric, MonthKey, PlanDefinition, PlanKey, PlanSource, QuotaOutcome,
    SubscriptionStatus, UsageDrift, UsageReceipt, UsageSummary, WorkspaceSubscription,
    UNLIMITED_SENTINEL,
};
pub use postgres::PgBillingStore;
pub use service::{BillingOverview, BillingService, Metered};
pub use signature::{SignatureError, SignatureVerifier};
pub use store::{BillingStore, EventClaim, EntitlementStore, LedgerStore, UsageStore, WorkspaceStore};
pub use usage::UsageRecorder;
