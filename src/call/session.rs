use crate::call::{CallAttempt, CallOutcomeReconciler, CallSnapshot, CallStatus};
use crate::error::Result;
use crate::event::{EventSender, SessionEvent};
use crate::gateway::{CallGateway, PlaceCallRequest};
use crate::get_timestamp;
use crate::utils::normalize_msisdn;
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerOptions {
    /// Fixed poll interval. No backoff: provider call durations are short and
    /// a missed cycle is cheap.
    pub interval_secs: u64,
    /// Safety cutoff for calls the provider never terminates; on expiry a
    /// synthetic failed snapshot is reconciled.
    pub max_session_secs: u64,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            interval_secs: 2,
            max_session_secs: 1800,
        }
    }
}

impl PollerOptions {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_session(&self) -> Duration {
        Duration::from_secs(self.max_session_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DialRequest {
    pub to_number: String,
    pub from_number: String,
    pub caller_id: String,
    pub lead_id: Option<String>,
    pub employee_id: String,
    pub company_id: String,
}

struct SessionHandle {
    session_id: Uuid,
    attempt: Arc<StdMutex<CallAttempt>>,
    cancel: CancellationToken,
}

type SessionMap = Arc<Mutex<HashMap<String, SessionHandle>>>;

/// Owns every live poll session. One session per provider call id: dialing or
/// re-attaching to an id that already has a session replaces (and cancels)
/// the previous one, so the terminal handler fires at most once per session.
pub struct CallSessionManager {
    gateway: Arc<dyn CallGateway>,
    sessions: SessionMap,
    worker: PollWorker,
    token: CancellationToken,
}

impl CallSessionManager {
    pub fn new(
        gateway: Arc<dyn CallGateway>,
        reconciler: Arc<CallOutcomeReconciler>,
        events: EventSender,
        options: PollerOptions,
        token: CancellationToken,
    ) -> Arc<Self> {
        let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));
        Arc::new(Self {
            worker: PollWorker {
                gateway: gateway.clone(),
                reconciler,
                sessions: sessions.clone(),
                events,
                options,
            },
            gateway,
            sessions,
            token,
        })
    }

    /// Place an outbound call and start polling it. Numbers are normalized
    /// here; the gateway transmits what it is given.
    pub async fn dial(&self, req: DialRequest) -> Result<String> {
        let from = normalize_msisdn(&req.from_number);
        let to = normalize_msisdn(&req.to_number);
        let provider_call_id = self
            .gateway
            .place_call(&PlaceCallRequest {
                from: from.clone(),
                to: to.clone(),
                caller_id: req.caller_id.clone(),
            })
            .await?;

        let attempt = CallAttempt {
            provider_call_id: provider_call_id.clone(),
            from_number: from,
            to_number: to,
            caller_id: req.caller_id,
            lead_id: req.lead_id,
            employee_id: req.employee_id,
            company_id: req.company_id,
            started_at: Utc::now(),
            status: CallStatus::Initiating,
        };
        self.spawn_session(attempt).await;
        Ok(provider_call_id)
    }

    /// Re-subscribe to an already-placed call (UI reload). The reconciler's
    /// idempotent upsert makes observing the same terminal snapshot from a
    /// new session safe.
    pub async fn attach(&self, attempt: CallAttempt) {
        self.spawn_session(attempt).await;
    }

    /// Stop polling without invoking the terminal handler. Returns false if
    /// no session is live for this id.
    pub async fn cancel(&self, provider_call_id: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.remove(provider_call_id) {
            handle.cancel.cancel();
            info!(provider_call_id, "poll session cancelled");
            true
        } else {
            false
        }
    }

    /// Snapshot of the attempts currently being polled.
    pub async fn active_calls(&self) -> Vec<CallAttempt> {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .map(|h| h.attempt.lock().unwrap().clone())
            .collect()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    async fn spawn_session(&self, attempt: CallAttempt) {
        let session_id = Uuid::new_v4();
        let cancel = self.token.child_token();
        let provider_call_id = attempt.provider_call_id.clone();
        let shared = Arc::new(StdMutex::new(attempt));

        {
            let mut sessions = self.sessions.lock().await;
            if let Some(previous) = sessions.insert(
                provider_call_id.clone(),
                SessionHandle {
                    session_id,
                    attempt: shared.clone(),
                    cancel: cancel.clone(),
                },
            ) {
                previous.cancel.cancel();
                info!(provider_call_id, "replaced previous poll session");
            }
        }

        let worker = self.worker.clone();
        tokio::spawn(async move {
            worker.poll_loop(session_id, shared, cancel).await;
        });
    }
}

/// The pieces one poll session needs, cloned into its task.
#[derive(Clone)]
struct PollWorker {
    gateway: Arc<dyn CallGateway>,
    reconciler: Arc<CallOutcomeReconciler>,
    sessions: SessionMap,
    events: EventSender,
    options: PollerOptions,
}

impl PollWorker {
    async fn poll_loop(
        self,
        session_id: Uuid,
        shared: Arc<StdMutex<CallAttempt>>,
        cancel: CancellationToken,
    ) {
        let provider_call_id = shared.lock().unwrap().provider_call_id.clone();
        let mut ticker = tokio::time::interval(self.options.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let deadline = tokio::time::sleep(self.options.max_session());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(provider_call_id, "poll session stopped by cancellation");
                    break;
                }
                _ = &mut deadline => {
                    warn!(
                        provider_call_id,
                        max_session_secs = self.options.max_session_secs,
                        "poll session deadline exceeded, forcing failed outcome"
                    );
                    let snapshot = CallSnapshot::synthetic_failure("poll session deadline exceeded");
                    let attempt = shared.lock().unwrap().clone();
                    self.finish(&attempt, &snapshot).await;
                    break;
                }
                _ = ticker.tick() => {
                    let snapshot = match self.gateway.call_status(&provider_call_id).await {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            // a single bad poll must not abort the session
                            warn!(provider_call_id, error = %e, "status poll failed, retrying next tick");
                            continue;
                        }
                    };
                    if cancel.is_cancelled() {
                        // response landed after cancellation, discard it
                        break;
                    }
                    if snapshot.status.is_terminal() {
                        let attempt = shared.lock().unwrap().clone();
                        self.finish(&attempt, &snapshot).await;
                        break;
                    }
                    shared.lock().unwrap().status = snapshot.status;
                    let _ = self.events.send(SessionEvent::StatusUpdate {
                        provider_call_id: provider_call_id.clone(),
                        status: snapshot.status,
                        timestamp: get_timestamp(),
                    });
                }
            }
        }

        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get(&provider_call_id) {
            // only remove our own entry; a replacement session may own the slot
            if handle.session_id == session_id {
                sessions.remove(&provider_call_id);
            }
        }
    }

    /// Terminal handler. Runs at most once per session: every `poll_loop`
    /// branch that reaches it breaks out of the loop immediately after.
    async fn finish(&self, attempt: &CallAttempt, snapshot: &CallSnapshot) {
        match self.reconciler.reconcile(attempt, snapshot).await {
            Ok(_record) => {
                let _ = self.events.send(SessionEvent::Terminal {
                    provider_call_id: attempt.provider_call_id.clone(),
                    status: snapshot.status,
                    disposition_required: snapshot.status == CallStatus::Completed,
                    timestamp: get_timestamp(),
                });
            }
            Err(e) => {
                error!(
                    provider_call_id = attempt.provider_call_id,
                    error = %e,
                    "terminal reconciliation failed"
                );
                let _ = self.events.send(SessionEvent::Error {
                    provider_call_id: Some(attempt.provider_call_id.clone()),
                    message: e.to_string(),
                    timestamp: get_timestamp(),
                });
            }
        }
    }
}
