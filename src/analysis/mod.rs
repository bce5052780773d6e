use crate::call::{AnalysisStatus, CallRecord, ANALYSES_TABLE, RECORDINGS_TABLE};
use crate::error::{Error, Result};
use crate::event::{EventSender, SessionEvent};
use crate::get_timestamp;
use crate::storage::{Filter, RecordStore};
use anyhow::anyhow;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

mod dispatch;
pub use dispatch::{AnalysisJob, JobDispatcher, TieredDispatcher};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisHandle {
    pub analysis_id: String,
    pub recording_id: String,
    pub call_id: String,
}

/// Idempotent analysis submission pipeline. Every durable step is a
/// look-before-write on a natural key — (owner_id, source_url) for
/// recordings, call_id for analyses — so resubmitting a call reuses the
/// existing rows instead of creating siblings. The in-flight set is
/// process-local UI state only.
pub struct AnalysisPipeline {
    store: Arc<dyn RecordStore>,
    dispatcher: Arc<dyn JobDispatcher>,
    events: EventSender,
    in_flight: Mutex<HashSet<String>>,
}

impl AnalysisPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        dispatcher: Arc<dyn JobDispatcher>,
        events: EventSender,
    ) -> Self {
        Self {
            store,
            dispatcher,
            events,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub async fn submit(&self, call: &CallRecord) -> Result<AnalysisHandle> {
        let recording_url = call
            .recording_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| Error::NoRecording {
                call_id: call.provider_call_id.clone(),
            })?;
        let call_id = call.provider_call_id.as_str();
        let owner_id = call.employee_id.as_str();

        let recording = self.ensure_recording(owner_id, recording_url).await?;
        let recording_id = string_field(&recording, "id", RECORDINGS_TABLE)?;

        let analysis_id = self
            .ensure_analysis(call_id, owner_id, &recording_id, &recording)
            .await?;

        // in-flight membership flips before the network dispatch so UI
        // feedback is immediate and consistent even if the dispatch fails
        self.in_flight.lock().unwrap().insert(call_id.to_string());
        let _ = self.events.send(SessionEvent::AnalysisQueued {
            provider_call_id: call_id.to_string(),
            analysis_id: analysis_id.clone(),
            timestamp: get_timestamp(),
        });

        let job = AnalysisJob {
            recording_url: recording_url.to_string(),
            file_name: file_name_from_url(recording_url),
            recording_id: recording_id.clone(),
            analysis_id: analysis_id.clone(),
            owner_id: owner_id.to_string(),
            call_id: call_id.to_string(),
            timestamp: get_timestamp(),
        };

        if let Err(e) = self.dispatcher.dispatch(&job).await {
            // durable rows stay for resubmission, but the UI must not show
            // "processing" for a job that never left the client
            self.in_flight.lock().unwrap().remove(call_id);
            warn!(call_id, error = %e, "analysis dispatch failed, rows retained for resubmission");
            let _ = self.events.send(SessionEvent::Error {
                provider_call_id: Some(call_id.to_string()),
                message: e.to_string(),
                timestamp: get_timestamp(),
            });
            return Err(e);
        }

        info!(call_id, analysis_id, recording_id, "analysis submitted");
        Ok(AnalysisHandle {
            analysis_id,
            recording_id,
            call_id: call_id.to_string(),
        })
    }

    /// Step 1: exactly one recording row per (owner, source url).
    async fn ensure_recording(&self, owner_id: &str, source_url: &str) -> Result<Value> {
        let key = Filter::new()
            .eq("owner_id", owner_id)
            .eq("source_url", source_url);
        if let Some(existing) = self.store.select_one(RECORDINGS_TABLE, &key).await? {
            return Ok(existing);
        }
        self.store
            .insert(
                RECORDINGS_TABLE,
                json!({
                    "id": Uuid::new_v4().to_string(),
                    "owner_id": owner_id,
                    "source_url": source_url,
                    "file_name": file_name_from_url(source_url),
                    "status": "pending",
                    "transcript": null,
                    "created_at": Utc::now(),
                }),
            )
            .await
    }

    /// Step 2: exactly one analysis row per call id. An existing analysis
    /// whose recording is not `processing` marks a previously interrupted
    /// submission; advancing the recording repairs it.
    async fn ensure_analysis(
        &self,
        call_id: &str,
        owner_id: &str,
        recording_id: &str,
        recording: &Value,
    ) -> Result<String> {
        let key = Filter::new().eq("call_id", call_id);
        if let Some(existing) = self.store.select_one(ANALYSES_TABLE, &key).await? {
            let analysis_id = string_field(&existing, "id", ANALYSES_TABLE)?;
            if recording.get("status").and_then(|v| v.as_str()) != Some("processing") {
                self.store
                    .update(
                        RECORDINGS_TABLE,
                        &Filter::new().eq("id", recording_id),
                        json!({"status": "processing"}),
                    )
                    .await?;
                info!(call_id, recording_id, "repaired interrupted submission");
            }
            return Ok(analysis_id);
        }

        let analysis_id = Uuid::new_v4().to_string();
        self.store
            .insert(
                ANALYSES_TABLE,
                json!({
                    "id": analysis_id,
                    "recording_id": recording_id,
                    "call_id": call_id,
                    "owner_id": owner_id,
                    "status": "processing",
                    "scores": {},
                    "created_at": Utc::now(),
                }),
            )
            .await?;
        Ok(analysis_id)
    }

    pub fn is_in_flight(&self, call_id: &str) -> bool {
        self.in_flight.lock().unwrap().contains(call_id)
    }

    pub fn in_flight(&self) -> Vec<String> {
        self.in_flight.lock().unwrap().iter().cloned().collect()
    }

    /// Retire in-flight entries whose linked recording reached a terminal
    /// status. The processor writes terminal state back through channels
    /// outside this core; this observes it on refresh.
    pub async fn sync_in_flight(&self) -> Result<()> {
        let tracked = self.in_flight();
        for call_id in tracked {
            let analysis = self
                .store
                .select_one(ANALYSES_TABLE, &Filter::new().eq("call_id", &call_id))
                .await?;
            let analysis = match analysis {
                Some(a) => a,
                None => continue,
            };
            let recording_id = match analysis.get("recording_id").and_then(|v| v.as_str()) {
                Some(id) => id.to_string(),
                None => continue,
            };
            let recording = self
                .store
                .select_one(RECORDINGS_TABLE, &Filter::new().eq("id", &recording_id))
                .await?;
            let status = recording
                .as_ref()
                .and_then(|r| r.get("status"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if status == "completed" || status == "failed" {
                self.in_flight.lock().unwrap().remove(&call_id);
                let settled = if status == "completed" {
                    AnalysisStatus::Completed
                } else {
                    AnalysisStatus::Failed
                };
                let _ = self.events.send(SessionEvent::AnalysisSettled {
                    provider_call_id: call_id.clone(),
                    status: settled,
                    timestamp: get_timestamp(),
                });
            }
        }
        Ok(())
    }

    /// Repopulate the in-flight set from non-terminal analysis rows, e.g.
    /// after a restart. Returns the number of tracked calls.
    pub async fn rebuild_in_flight(&self) -> Result<usize> {
        let mut rebuilt = HashSet::new();
        for status in ["pending", "processing"] {
            let rows = self
                .store
                .select(ANALYSES_TABLE, &Filter::new().eq("status", status))
                .await?;
            for row in rows {
                if let Some(call_id) = row.get("call_id").and_then(|v| v.as_str()) {
                    rebuilt.insert(call_id.to_string());
                }
            }
        }
        let count = rebuilt.len();
        *self.in_flight.lock().unwrap() = rebuilt;
        Ok(count)
    }
}

fn string_field(row: &Value, field: &str, table: &str) -> Result<String> {
    row.get(field)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::store(table, anyhow!("row missing {} field", field)))
}

fn file_name_from_url(url: &str) -> String {
    url.rsplit('/')
        .next()
        .unwrap_or(url)
        .split('?')
        .next()
        .unwrap_or_default()
        .to_string()
}
