use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::models::{Metric, MonthKey, UsageDrift, UsageEvent, UsageReceipt, UsageSummary};
use super::store::UsageStore;
use crate::error::{AccountingFailure, AppError, AppResult};

/// key: billing-usage-recorder -> audit append + atomic counter increment
#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<dyn UsageStore>,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn UsageStore>) -> Self {
        Self { store }
    }

    pub async fn record_usage(
        &self,
        workspace_id: Uuid,
        metric: Metric,
        amount: i64,
        ref_id: Option<String>,
    ) -> AppResult<UsageReceipt> {
        self.record_usage_at(workspace_id, metric, amount, ref_id, Utc::now())
            .await
    }

    /// Only input validation is returned as an error. Storage failures are logged and
    /// reported through the receipt notes; the caller's action is never undone.
    pub async fn record_usage_at(
        &self,
        workspace_id: Uuid,
        metric: Metric,
        amount: i64,
        ref_id: Option<String>,
        now: DateTime<Utc>,
    ) -> AppResult<UsageReceipt> {
        if amount <= 0 {
            return Err(AppError::Validation(
                "usage amount must be positive".to_string(),
            ));
        }

        let month = MonthKey::from_datetime(now);
        let mut notes = Vec::new();

        let event = UsageEvent {
            id: Uuid::new_v4(),
            workspace_id,
            metric,
            amount,
            ref_id,
            created_at: now,
        };
        if let Err(err) = self.store.append_usage_event(&event).await {
            error!(
                ?err,
                %workspace_id,
                %metric,
                amount,
                ref_id = event.ref_id.as_deref(),
                "failed to append usage audit entry"
            );
            notes.push(format!("billing:audit-missing:{metric}"));
        }

        let total = match self
            .store
            .increment_usage(workspace_id, metric, &month, amount)
            .await
        {
            Ok(total) => {
                info!(%workspace_id, %metric, amount, total, month = %month, "usage recorded");
                Some(total)
            }
            Err(source) => {
                let failure = AccountingFailure {
                    workspace_id,
                    metric,
                    amount,
                    source,
                };
                error!(
                    error = %failure,
                    %workspace_id,
                    %metric,
                    amount,
                    month = %month,
                    "usage counter increment failed; queued for reconciliation"
                );
                notes.push(format!("billing:accounting-deferred:{metric}"));
                None
            }
        };

        Ok(UsageReceipt {
            workspace_id,
            metric,
            amount,
            month,
            total,
            notes,
        })
    }

    pub async fn usage_summary(
        &self,
        workspace_id: Uuid,
        month: &MonthKey,
    ) -> AppResult<UsageSummary> {
        let mut counters: HashMap<Metric, i64> =
            Metric::ALL.iter().map(|metric| (*metric, 0)).collect();
        for (metric, count) in self.store.usage_counters(workspace_id, month).await? {
            counters.insert(metric, count);
        }
        Ok(UsageSummary {
            workspace_id,
            month: month.clone(),
            counters,
        })
    }

    /// Compares the counter with the audit log for one bucket. Read only.
    pub async fn reconcile(
        &self,
        workspace_id: Uuid,
        metric: Metric,
        month: &MonthKey,
    ) -> AppResult<UsageDrift> {
        let counter = self
            .store
            .usage_counters(workspace_id, month)
            .await?
            .into_iter()
            .find_map(|(candidate, count)| (candidate == metric).then_some(count))
            .unwrap_or(0);
        let audited = self.store.audited_usage(workspace_id, metric, month).await?;
        let drift = UsageDrift {
            workspace_id,
            metric,
            month: month.clone(),
            counter,
            audited,
        };
        if !drift.is_consistent() {
            warn!(
                %workspace_id,
                %metric,
                month = %month,
                counter,
                audited,
                "usage counter drifted from audit log"
            );
        }
        Ok(drift)
    }
}
