use crate::call::{CallDirection, CallSnapshot, CallStatus};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Request to place an outbound call. Numbers must already be in canonical
/// digit-only form (`utils::normalize_msisdn`); the gateway transmits them
/// as given.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaceCallRequest {
    pub from: String,
    pub to: String,
    pub caller_id: String,
}

/// Thin request/response wrapper around the telephony provider. No state,
/// no retries; retry policy belongs to the poller and the pipeline.
#[async_trait]
pub trait CallGateway: Send + Sync {
    /// Place an outbound call, returning the provider call id.
    async fn place_call(&self, req: &PlaceCallRequest) -> Result<String>;

    /// Fetch the provider's current view of a call.
    async fn call_status(&self, provider_call_id: &str) -> Result<CallSnapshot>;
}

/// Tenant-scoped authorization context passed with every provider request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TenantContext {
    pub account_id: String,
    pub auth_token: String,
}

#[derive(Debug, Deserialize)]
struct PlaceCallResponse {
    #[serde(alias = "sid", alias = "call_id")]
    provider_call_id: String,
}

pub struct HttpCallGateway {
    client: reqwest::Client,
    base_url: String,
    tenant: TenantContext,
}

impl HttpCallGateway {
    pub fn new(base_url: impl Into<String>, tenant: TenantContext) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tenant,
        }
    }

    fn calls_url(&self) -> String {
        format!("{}/accounts/{}/calls", self.base_url, self.tenant.account_id)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = resp.text().await.unwrap_or_default();
        Err(Error::Gateway {
            status: Some(status.as_u16()),
            message,
        })
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    Error::Gateway {
        status: e.status().map(|s| s.as_u16()),
        message: e.to_string(),
    }
}

#[async_trait]
impl CallGateway for HttpCallGateway {
    async fn place_call(&self, req: &PlaceCallRequest) -> Result<String> {
        let resp = self
            .client
            .post(self.calls_url())
            .bearer_auth(&self.tenant.auth_token)
            .json(req)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = Self::check(resp).await?;
        let body: PlaceCallResponse = resp.json().await.map_err(transport_error)?;
        debug!(
            provider_call_id = body.provider_call_id,
            to = req.to,
            "call placed"
        );
        Ok(body.provider_call_id)
    }

    async fn call_status(&self, provider_call_id: &str) -> Result<CallSnapshot> {
        let url = format!("{}/{}", self.calls_url(), provider_call_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.tenant.auth_token)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = Self::check(resp).await?;
        let raw: serde_json::Value = resp.json().await.map_err(transport_error)?;
        snapshot_from_provider(raw)
    }
}

/// Build a normalized snapshot from the provider's raw status payload.
/// Providers are inconsistent about casing and field spelling; everything is
/// normalized here, at the ingestion boundary, and the untouched payload is
/// kept alongside for audit.
pub fn snapshot_from_provider(raw: serde_json::Value) -> Result<CallSnapshot> {
    let status_str = raw
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let status = CallStatus::from_str(status_str).map_err(|message| Error::Gateway {
        status: None,
        message,
    })?;

    let duration_secs = raw
        .get("duration")
        .or_else(|| raw.get("duration_seconds"))
        .and_then(|v| match v {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        });

    let parse_time = |key: &str| -> Option<DateTime<Utc>> {
        raw.get(key)
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    };

    let direction = raw
        .get("direction")
        .and_then(|v| v.as_str())
        .map(|d| match d.to_ascii_lowercase().as_str() {
            "inbound" => CallDirection::Inbound,
            _ => CallDirection::Outbound,
        });

    Ok(CallSnapshot {
        status,
        duration_secs,
        recording_url: raw
            .get("recording_url")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
        started_at: parse_time("started_at"),
        ended_at: parse_time("ended_at"),
        answered_by: raw
            .get("answered_by")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        direction,
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_normalizes_provider_spellings() {
        let snap = snapshot_from_provider(json!({
            "status": "In-Progress",
            "duration": "17",
        }))
        .unwrap();
        assert_eq!(snap.status, CallStatus::InProgress);
        assert_eq!(snap.duration_secs, Some(17));
        assert!(snap.recording_url.is_none());

        let snap = snapshot_from_provider(json!({
            "status": "no-answer",
        }))
        .unwrap();
        assert_eq!(snap.status, CallStatus::NoAnswer);

        let snap = snapshot_from_provider(json!({
            "status": "queued",
        }))
        .unwrap();
        assert_eq!(snap.status, CallStatus::Initiating);
    }

    #[test]
    fn test_snapshot_keeps_raw_payload() {
        let raw = json!({
            "status": "completed",
            "duration": 42,
            "recording_url": "https://x/y.mp3",
            "answered_by": "human",
            "direction": "outbound",
            "vendor_extra": {"billing_units": 1},
        });
        let snap = snapshot_from_provider(raw.clone()).unwrap();
        assert_eq!(snap.status, CallStatus::Completed);
        assert_eq!(snap.duration_secs, Some(42));
        assert_eq!(snap.recording_url.as_deref(), Some("https://x/y.mp3"));
        assert_eq!(snap.answered_by.as_deref(), Some("human"));
        assert_eq!(snap.raw, raw);
    }

    #[test]
    fn test_snapshot_rejects_unknown_status() {
        let err = snapshot_from_provider(json!({"status": "exploded"})).unwrap_err();
        assert!(matches!(err, Error::Gateway { status: None, .. }));
    }
}
