use crate::error::{Error, Result};
use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Job payload handed to the external analysis processor. Field names are the
/// processor's wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisJob {
    pub recording_url: String,
    pub file_name: String,
    pub recording_id: String,
    pub analysis_id: String,
    pub owner_id: String,
    pub call_id: String,
    pub timestamp: u64,
}

#[async_trait]
pub trait JobDispatcher: Send + Sync {
    /// Fire-and-forget submission to the processor ingress. Implementations
    /// own transport-layer escalation; business retries stay with the caller.
    async fn dispatch(&self, job: &AnalysisJob) -> Result<()>;
}

/// Three-tier transport escalation against ingress endpoints with
/// inconsistent cross-origin policies: a plain JSON POST, then a text/plain
/// POST carrying no preflight-sensitive headers, then a beacon-style GET with
/// the payload urlencoded into the query. Each escalation is logged, never
/// raised; only exhausting all three tiers is an error.
pub struct TieredDispatcher {
    client: reqwest::Client,
    ingress_url: String,
}

impl TieredDispatcher {
    pub fn new(ingress_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            ingress_url: ingress_url.into(),
        }
    }

    async fn post_json(&self, job: &AnalysisJob) -> anyhow::Result<()> {
        let resp = self.client.post(&self.ingress_url).json(job).send().await?;
        ensure_success(resp).await
    }

    async fn post_plain(&self, job: &AnalysisJob) -> anyhow::Result<()> {
        let body = serde_json::to_string(job)?;
        let resp = self
            .client
            .post(&self.ingress_url)
            .header("Content-Type", "text/plain")
            .body(body)
            .send()
            .await?;
        ensure_success(resp).await
    }

    async fn send_beacon(&self, job: &AnalysisJob) -> anyhow::Result<()> {
        let payload = serde_json::to_string(job)?;
        let url = format!("{}?job={}", self.ingress_url, urlencoding::encode(&payload));
        let resp = self.client.get(&url).send().await?;
        ensure_success(resp).await
    }
}

async fn ensure_success(resp: reqwest::Response) -> anyhow::Result<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(anyhow!("ingress returned {}: {}", status, body))
}

#[async_trait]
impl JobDispatcher for TieredDispatcher {
    async fn dispatch(&self, job: &AnalysisJob) -> Result<()> {
        match self.post_json(job).await {
            Ok(()) => {
                debug!(call_id = job.call_id, "analysis job dispatched");
                return Ok(());
            }
            Err(e) => {
                warn!(call_id = job.call_id, tier = "json_post", error = %e, "dispatch tier failed, escalating");
            }
        }
        match self.post_plain(job).await {
            Ok(()) => {
                debug!(call_id = job.call_id, tier = "plain_post", "analysis job dispatched");
                return Ok(());
            }
            Err(e) => {
                warn!(call_id = job.call_id, tier = "plain_post", error = %e, "dispatch tier failed, escalating");
            }
        }
        match self.send_beacon(job).await {
            Ok(()) => {
                debug!(call_id = job.call_id, tier = "beacon_get", "analysis job dispatched");
                Ok(())
            }
            Err(e) => {
                warn!(call_id = job.call_id, tier = "beacon_get", error = %e, "last dispatch tier failed");
                Err(Error::Dispatch {
                    last: e.to_string(),
                })
            }
        }
    }
}
