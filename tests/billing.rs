use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use decision_backend::billing::{
    BillingEventStatus, BillingService, EntitlementStore, EventClaim, LedgerStore, Limit, Metric,
    MonthKey, PgBillingStore, PlanKey, UsageStore, WorkspaceStore,
};
use decision_backend::error::AppError;
use decision_backend::extractor::AuthUser;
use futures_util::future::join_all;
use sqlx::PgPool;
use uuid::Uuid;

async fn seed_workspace(pool: &PgPool, email: &str) -> (Uuid, Uuid) {
    let user_id = Uuid::new_v4();
    sqlx::query("INSERT INTO users (id, email) VALUES ($1, $2)")
        .bind(user_id)
        .bind(email)
        .execute(pool)
        .await
        .unwrap();
    let workspace_id = Uuid::new_v4();
    sqlx::query("INSERT INTO workspaces (id, owner_id, name) VALUES ($1, $2, $3)")
        .bind(workspace_id)
        .bind(user_id)
        .bind("Roadmap review")
        .execute(pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO workspace_members (workspace_id, user_id, role) VALUES ($1, $2, 'owner')")
        .bind(workspace_id)
        .bind(user_id)
        .execute(pool)
        .await
        .unwrap();
    (user_id, workspace_id)
}

// key: billing-tests -> seeded catalog, unlimited sentinel
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn seeded_catalog_matches_plan_limits(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgBillingStore::new(pool);

    let catalog = store.plan_catalog().await.unwrap();
    assert_eq!(catalog.len(), 4);

    let free = store.plan_definition(PlanKey::Free).await.unwrap().unwrap();
    assert_eq!(free.limit_for(Metric::Runs), Limit::Count(5));
    let pro = store.plan_definition(PlanKey::Pro).await.unwrap().unwrap();
    assert_eq!(pro.limit_for(Metric::Runs), Limit::Unlimited);
}

// key: billing-tests -> atomic counters under concurrency
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn concurrent_increments_are_not_lost(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let (_, workspace_id) = seed_workspace(&pool, "counter@example.com").await;
    let store = Arc::new(PgBillingStore::new(pool));
    let month = MonthKey::current();

    let tasks = (0..20).map(|_| {
        let store = store.clone();
        let month = month.clone();
        tokio::spawn(async move {
            store
                .increment_usage(workspace_id, Metric::Runs, &month, 1)
                .await
        })
    });
    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    assert_eq!(
        store
            .usage_count(workspace_id, Metric::Runs, &month)
            .await
            .unwrap(),
        20
    );
    let other_month: MonthKey = "2000-01".parse().unwrap();
    assert_eq!(
        store
            .usage_count(workspace_id, Metric::Runs, &other_month)
            .await
            .unwrap(),
        0
    );
}

// key: billing-tests -> ledger claim transitions
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn event_claims_follow_ledger_states(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgBillingStore::new(pool);
    let kind = "customer.subscription.updated";

    let stale_before = Utc::now() - Duration::minutes(5);

    assert_eq!(
        store.claim_event("evt_pg", kind, stale_before).await.unwrap(),
        EventClaim::Claimed
    );
    assert_eq!(
        store.claim_event("evt_pg", kind, stale_before).await.unwrap(),
        EventClaim::InFlight
    );

    store.mark_event_failed("evt_pg", "no workspace").await.unwrap();
    let failed = store.billing_event("evt_pg").await.unwrap().unwrap();
    assert_eq!(failed.status, BillingEventStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("no workspace"));

    assert_eq!(
        store.claim_event("evt_pg", kind, stale_before).await.unwrap(),
        EventClaim::Reclaimed
    );
    store.mark_event_processed("evt_pg", Utc::now()).await.unwrap();

    let processed = store.billing_event("evt_pg").await.unwrap().unwrap();
    assert_eq!(processed.status, BillingEventStatus::Processed);
    assert_eq!(processed.attempts, 2);
    assert_eq!(processed.error, None);
    assert_eq!(
        store.claim_event("evt_pg", kind, stale_before).await.unwrap(),
        EventClaim::AlreadyProcessed
    );
}

// key: billing-tests -> pending claim lease
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn lapsed_pending_claim_is_reclaimed(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgBillingStore::new(pool);
    let kind = "checkout.session.completed";

    assert_eq!(
        store
            .claim_event("evt_stuck", kind, Utc::now() - Duration::minutes(5))
            .await
            .unwrap(),
        EventClaim::Claimed
    );
    // Every pending row is older than a cutoff in the future.
    assert_eq!(
        store
            .claim_event("evt_stuck", kind, Utc::now() + Duration::seconds(1))
            .await
            .unwrap(),
        EventClaim::Reclaimed
    );
    let record = store.billing_event("evt_stuck").await.unwrap().unwrap();
    assert_eq!(record.status, BillingEventStatus::Pending);
    assert_eq!(record.attempts, 2);
}

// key: billing-tests -> customer linked to one workspace
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn customer_stays_linked_to_first_workspace(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let (_, first) = seed_workspace(&pool, "first@example.com").await;
    let (_, second) = seed_workspace(&pool, "second@example.com").await;
    let store = PgBillingStore::new(pool);

    store.upsert_billing_customer(first, "cus_pg").await.unwrap();
    store.upsert_billing_customer(first, "cus_pg").await.unwrap();
    let err = store
        .upsert_billing_customer(second, "cus_pg")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already linked"));

    assert_eq!(
        store.workspace_for_customer("cus_pg").await.unwrap(),
        Some(first)
    );
    assert_eq!(store.billing_customer(second).await.unwrap(), None);
}

// key: billing-tests -> provisioning by email
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn provisioning_by_email_is_idempotent(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgBillingStore::new(pool);

    let first = store
        .ensure_workspace_for_email("Buyer@Example.com")
        .await
        .unwrap();
    let second = store
        .ensure_workspace_for_email("buyer@example.com")
        .await
        .unwrap();
    assert_eq!(first.id, second.id);

    let membership = store
        .membership(first.id, first.owner_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(membership.workspace_id, first.id);
}

// key: billing-tests -> metered action end to end
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn metered_action_stops_at_free_limit(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let (user_id, workspace_id) = seed_workspace(&pool, "meter@example.com").await;
    let store = Arc::new(PgBillingStore::new(pool));
    let service = BillingService::new(store.clone(), None, HashMap::new());
    let caller = AuthUser {
        user_id,
        email: None,
    };

    for _ in 0..2 {
        service
            .run_metered(workspace_id, Some(&caller), Metric::Meetings, 1, None, || async {
                Ok::<_, AppError>(())
            })
            .await
            .unwrap();
    }
    let denied = service
        .run_metered(workspace_id, Some(&caller), Metric::Meetings, 1, None, || async {
            Ok::<_, AppError>(())
        })
        .await;
    assert!(matches!(denied, Err(AppError::LimitExceeded { limit: 2, used: 2, .. })));

    let month = MonthKey::current();
    assert_eq!(
        store
            .audited_usage(workspace_id, Metric::Meetings, &month)
            .await
            .unwrap(),
        2
    );
}
