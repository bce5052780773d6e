use crate::call::{AnalysisStatus, CallStatus};
use serde::{Deserialize, Serialize};

/// SessionEvent represents the observable signals the orchestration core
/// exposes to the UI/workflow layer: poll-tick status updates, terminal
/// outcomes, and in-flight analysis membership changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A non-terminal snapshot was observed for an in-flight call.
    StatusUpdate {
        provider_call_id: String,
        status: CallStatus,
        timestamp: u64,
    },

    /// The call reached a terminal status and was reconciled. When
    /// `disposition_required` is set the operator still owes a human
    /// disposition for this record.
    Terminal {
        provider_call_id: String,
        status: CallStatus,
        disposition_required: bool,
        timestamp: u64,
    },

    /// A call entered the in-flight analysis set.
    AnalysisQueued {
        provider_call_id: String,
        analysis_id: String,
        timestamp: u64,
    },

    /// A call left the in-flight analysis set.
    AnalysisSettled {
        provider_call_id: String,
        status: AnalysisStatus,
        timestamp: u64,
    },

    /// A periodic insight summary is available.
    Insight { headline: String, timestamp: u64 },

    /// Error event
    Error {
        provider_call_id: Option<String>,
        message: String,
        timestamp: u64,
    },
}

impl SessionEvent {
    pub fn timestamp(&self) -> u64 {
        match self {
            SessionEvent::StatusUpdate { timestamp, .. } => *timestamp,
            SessionEvent::Terminal { timestamp, .. } => *timestamp,
            SessionEvent::AnalysisQueued { timestamp, .. } => *timestamp,
            SessionEvent::AnalysisSettled { timestamp, .. } => *timestamp,
            SessionEvent::Insight { timestamp, .. } => *timestamp,
            SessionEvent::Error { timestamp, .. } => *timestamp,
        }
    }
}

/// Type alias for the event sender
pub type EventSender = tokio::sync::broadcast::Sender<SessionEvent>;

/// Type alias for the event receiver
pub type EventReceiver = tokio::sync::broadcast::Receiver<SessionEvent>;
