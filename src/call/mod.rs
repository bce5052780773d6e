use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod reconciler;
pub mod session;

pub use reconciler::CallOutcomeReconciler;
pub use session::{CallSessionManager, DialRequest, PollerOptions};

pub const CALLS_TABLE: &str = "calls";
pub const RECORDINGS_TABLE: &str = "recordings";
pub const ANALYSES_TABLE: &str = "analyses";

/// Provider call status. One closed enumeration with a single canonical
/// casing; provider spellings (`"Failed"`, `"no-answer"`, `"in-progress"`,
/// `"queued"`) are normalized on ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiating,
    Ringing,
    InProgress,
    Completed,
    Failed,
    Busy,
    NoAnswer,
}

impl CallStatus {
    /// Terminal statuses end the poll session: no further provider state
    /// transition is expected.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Completed | CallStatus::Failed | CallStatus::Busy | CallStatus::NoAnswer
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiating => "initiating",
            CallStatus::Ringing => "ringing",
            CallStatus::InProgress => "in_progress",
            CallStatus::Completed => "completed",
            CallStatus::Failed => "failed",
            CallStatus::Busy => "busy",
            CallStatus::NoAnswer => "no_answer",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            // provider queue synonyms collapse into initiating
            "initiating" | "initiated" | "queued" | "accepted" => Ok(CallStatus::Initiating),
            "ringing" => Ok(CallStatus::Ringing),
            "in_progress" | "answered" => Ok(CallStatus::InProgress),
            "completed" => Ok(CallStatus::Completed),
            "failed" | "canceled" | "cancelled" => Ok(CallStatus::Failed),
            "busy" => Ok(CallStatus::Busy),
            "no_answer" => Ok(CallStatus::NoAnswer),
            other => Err(format!("unknown call status: {}", other)),
        }
    }
}

/// Durable call outcome: a superset covering both provider-terminal mapping
/// and the human-entered disposition recorded after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Completed,
    NotAnswered,
    Failed,
    Busy,
    FollowUp,
    Converted,
    NotInterested,
    Voicemail,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Completed => "completed",
            CallOutcome::NotAnswered => "not_answered",
            CallOutcome::Failed => "failed",
            CallOutcome::Busy => "busy",
            CallOutcome::FollowUp => "follow_up",
            CallOutcome::Converted => "converted",
            CallOutcome::NotInterested => "not_interested",
            CallOutcome::Voicemail => "voicemail",
        }
    }

    /// Mapping from a terminal provider status to the outcome the reconciler
    /// persists. `completed` records are provisional until the operator
    /// replaces the outcome with a real disposition.
    pub fn from_terminal(status: CallStatus) -> Option<Self> {
        match status {
            CallStatus::Completed => Some(CallOutcome::Completed),
            CallStatus::Failed => Some(CallOutcome::Failed),
            CallStatus::Busy => Some(CallOutcome::Busy),
            CallStatus::NoAnswer => Some(CallOutcome::NotAnswered),
            _ => None,
        }
    }
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RecordingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordingStatus::Completed | RecordingStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AnalysisStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisStatus::Completed | AnalysisStatus::Failed)
    }
}

/// One in-flight call attempt. Owned by its poll session and destroyed when
/// polling terminates; the durable record is the reconciler's business.
#[derive(Debug, Clone, Serialize)]
pub struct CallAttempt {
    pub provider_call_id: String,
    pub from_number: String,
    pub to_number: String,
    pub caller_id: String,
    pub lead_id: Option<String>,
    pub employee_id: String,
    pub company_id: String,
    pub started_at: DateTime<Utc>,
    pub status: CallStatus,
}

/// One durable call record, keyed by the provider call id (unique across the
/// store, enforced by look-before-write). Never deleted by this subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub provider_call_id: String,
    pub lead_id: Option<String>,
    pub employee_id: String,
    pub company_id: String,
    pub outcome: CallOutcome,
    pub notes: Option<String>,
    pub recording_url: Option<String>,
    pub duration_secs: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub answered_by: Option<String>,
    pub direction: CallDirection,
    pub follow_up_at: Option<DateTime<Utc>>,
    /// Complete raw provider response payload, stored opaque for audit/replay.
    pub raw_response: serde_json::Value,
}

/// Point-in-time provider view of a call, as returned by the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSnapshot {
    pub status: CallStatus,
    pub duration_secs: Option<u64>,
    pub recording_url: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub answered_by: Option<String>,
    pub direction: Option<CallDirection>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl CallSnapshot {
    /// Synthetic terminal snapshot used when the poll session deadline forces
    /// a call out of the live set without a provider-terminal status.
    pub fn synthetic_failure(reason: &str) -> Self {
        Self {
            status: CallStatus::Failed,
            duration_secs: None,
            recording_url: None,
            started_at: None,
            ended_at: Some(Utc::now()),
            answered_by: None,
            direction: Some(CallDirection::Outbound),
            raw: serde_json::json!({ "synthetic": true, "reason": reason }),
        }
    }
}
