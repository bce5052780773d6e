use crate::call::{
    CallAttempt, CallDirection, CallOutcome, CallRecord, CallSnapshot, CallStatus, CALLS_TABLE,
};
use crate::error::{Error, Result};
use crate::storage::{Filter, RecordStore};
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Converts one terminal provider snapshot into persisted state, exactly once
/// per provider call id. All writes are look-before-write upserts on the
/// natural key, so repeated reconciliation of the same terminal snapshot
/// (reload-reattach) updates rather than duplicates.
pub struct CallOutcomeReconciler {
    store: Arc<dyn RecordStore>,
}

impl CallOutcomeReconciler {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn reconcile(
        &self,
        attempt: &CallAttempt,
        snapshot: &CallSnapshot,
    ) -> Result<CallRecord> {
        let outcome = CallOutcome::from_terminal(snapshot.status).ok_or_else(|| {
            warn!(
                provider_call_id = attempt.provider_call_id,
                status = %snapshot.status,
                "refusing to reconcile non-terminal snapshot"
            );
            Error::Gateway {
                status: None,
                message: format!("snapshot status {} is not terminal", snapshot.status),
            }
        })?;

        let record = build_record(attempt, snapshot, outcome);
        let row = serde_json::to_value(&record)
            .map_err(|e| Error::store(CALLS_TABLE, anyhow!("serialize call record: {}", e)))?;

        let key = Filter::new().eq("provider_call_id", &attempt.provider_call_id);
        let existing = self.store.select_one(CALLS_TABLE, &key).await?;

        if existing.is_some() {
            // Last writer wins on the provider-truth fields; a prior operator
            // disposition is overwritten only by the same terminal facts it
            // was entered against.
            self.store.update(CALLS_TABLE, &key, row).await?;
            info!(
                provider_call_id = attempt.provider_call_id,
                outcome = %outcome,
                "call record updated from terminal snapshot"
            );
        } else {
            self.store.insert(CALLS_TABLE, row).await?;
            info!(
                provider_call_id = attempt.provider_call_id,
                outcome = %outcome,
                duration_secs = record.duration_secs,
                "call record created from terminal snapshot"
            );
        }

        self.audit_natural_key(&attempt.provider_call_id).await?;
        Ok(record)
    }

    /// Operator action: replace the provisional outcome of a completed call
    /// with the human-entered disposition.
    pub async fn record_disposition(
        &self,
        provider_call_id: &str,
        outcome: CallOutcome,
        notes: Option<String>,
        follow_up_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let key = Filter::new().eq("provider_call_id", provider_call_id);
        let mut patch = json!({ "outcome": outcome });
        if let Some(notes) = notes {
            patch["notes"] = json!(notes);
        }
        if let Some(follow_up_at) = follow_up_at {
            patch["follow_up_at"] = json!(follow_up_at);
        }
        let matched = self.store.update(CALLS_TABLE, &key, patch).await?;
        if matched == 0 {
            return Err(Error::store(
                CALLS_TABLE,
                anyhow!("no call record for provider call id {}", provider_call_id),
            ));
        }
        info!(provider_call_id, outcome = %outcome, "disposition recorded");
        Ok(())
    }

    /// Manual/offline call entry through the same look-before-write path.
    pub async fn record_manual(&self, record: &CallRecord) -> Result<()> {
        let row = serde_json::to_value(record)
            .map_err(|e| Error::store(CALLS_TABLE, anyhow!("serialize call record: {}", e)))?;
        let key = Filter::new().eq("provider_call_id", &record.provider_call_id);
        if self.store.select_one(CALLS_TABLE, &key).await?.is_some() {
            self.store.update(CALLS_TABLE, &key, row).await?;
        } else {
            self.store.insert(CALLS_TABLE, row).await?;
        }
        Ok(())
    }

    /// The upsert design makes a duplicate natural key unreachable; if one is
    /// observed anyway, something else wrote around the look-before-write
    /// path and it must be logged loudly.
    async fn audit_natural_key(&self, provider_call_id: &str) -> Result<()> {
        let rows = self
            .store
            .select(
                CALLS_TABLE,
                &Filter::new().eq("provider_call_id", provider_call_id),
            )
            .await?;
        if rows.len() > 1 {
            error!(
                provider_call_id,
                count = rows.len(),
                "NATURAL KEY COLLISION: multiple call records for one provider call id"
            );
            return Err(Error::ReconciliationConflict {
                provider_call_id: provider_call_id.to_string(),
            });
        }
        Ok(())
    }
}

fn build_record(attempt: &CallAttempt, snapshot: &CallSnapshot, outcome: CallOutcome) -> CallRecord {
    let notes = match snapshot.status {
        CallStatus::Completed => None,
        CallStatus::Busy => Some("Line busy".to_string()),
        CallStatus::NoAnswer => Some("No answer".to_string()),
        CallStatus::Failed => {
            let reason = snapshot
                .raw
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("Call failed");
            Some(reason.to_string())
        }
        _ => None,
    };

    CallRecord {
        provider_call_id: attempt.provider_call_id.clone(),
        lead_id: attempt.lead_id.clone(),
        employee_id: attempt.employee_id.clone(),
        company_id: attempt.company_id.clone(),
        outcome,
        notes,
        recording_url: snapshot.recording_url.clone(),
        duration_secs: snapshot.duration_secs.unwrap_or(0),
        started_at: snapshot.started_at.or(Some(attempt.started_at)),
        ended_at: snapshot.ended_at,
        answered_by: snapshot.answered_by.clone(),
        direction: snapshot.direction.unwrap_or(CallDirection::Outbound),
        follow_up_at: None,
        raw_response: snapshot.raw.clone(),
    }
}
