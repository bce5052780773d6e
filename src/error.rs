use thiserror::Error;

/// Errors surfaced by the orchestration core.
///
/// Transient gateway failures inside the poll loop are recovered locally and
/// never reach callers; everything here is either a precondition violation or
/// a give-up after the designed recovery steps ran out.
#[derive(Debug, Error)]
pub enum Error {
    /// The telephony provider rejected or failed a request. Carries the HTTP
    /// status when one was received.
    #[error("provider request failed: {message}")]
    Gateway {
        status: Option<u16>,
        message: String,
    },

    /// `submit` was called for a call that has no recording to analyze.
    /// Fails fast, no side effects.
    #[error("call {call_id} has no recording url")]
    NoRecording { call_id: String },

    /// Every dispatch transport tier failed. Durable rows are left in place
    /// for resubmission; the in-flight indicator has been cleared.
    #[error("analysis dispatch exhausted all transports: {last}")]
    Dispatch { last: String },

    /// More than one call record matched a provider call id. The upsert design
    /// makes this unreachable in normal operation; seeing it means a
    /// natural-key collision bug.
    #[error("duplicate call records for provider call id {provider_call_id}")]
    ReconciliationConflict { provider_call_id: String },

    /// A durable store operation failed after its retry policy ran out.
    #[error("store operation on {table} failed: {source}")]
    Store {
        table: String,
        #[source]
        source: anyhow::Error,
    },

    /// Every configured insight model variant failed or returned a malformed
    /// payload.
    #[error("insight backends exhausted: {last}")]
    InsightExhausted { last: String },
}

impl Error {
    pub fn store(table: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Error::Store {
            table: table.into(),
            source: source.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
