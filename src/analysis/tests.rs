use super::*;
use crate::call::{CallDirection, CallOutcome, CallRecord};
use crate::storage::MemoryStore;
use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

fn call_record(call_id: &str, recording_url: Option<&str>) -> CallRecord {
    CallRecord {
        provider_call_id: call_id.to_string(),
        lead_id: Some("lead-1".to_string()),
        employee_id: "emp-1".to_string(),
        company_id: "co-1".to_string(),
        outcome: CallOutcome::Completed,
        notes: None,
        recording_url: recording_url.map(|s| s.to_string()),
        duration_secs: 42,
        started_at: None,
        ended_at: None,
        answered_by: Some("human".to_string()),
        direction: CallDirection::Outbound,
        follow_up_at: None,
        raw_response: serde_json::json!({}),
    }
}

struct MockDispatcher {
    fail: AtomicBool,
    jobs: Mutex<Vec<AnalysisJob>>,
}

impl MockDispatcher {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(fail),
            jobs: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl JobDispatcher for MockDispatcher {
    async fn dispatch(&self, job: &AnalysisJob) -> Result<()> {
        self.jobs.lock().unwrap().push(job.clone());
        if self.fail.load(Ordering::SeqCst) {
            Err(Error::Dispatch {
                last: "ingress unreachable".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

fn pipeline_with(
    store: Arc<MemoryStore>,
    dispatcher: Arc<dyn JobDispatcher>,
) -> (AnalysisPipeline, broadcast::Receiver<SessionEvent>) {
    let (events, rx) = broadcast::channel(32);
    (AnalysisPipeline::new(store, dispatcher, events), rx)
}

#[tokio::test]
async fn test_submit_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = MockDispatcher::new(false);
    let (pipeline, _rx) = pipeline_with(store.clone(), dispatcher.clone());

    let call = call_record("CA1", Some("https://x/y.mp3"));
    let first = pipeline.submit(&call).await.unwrap();
    let second = pipeline.submit(&call).await.unwrap();

    assert_eq!(store.row_count(RECORDINGS_TABLE), 1);
    assert_eq!(store.row_count(ANALYSES_TABLE), 1);
    assert_eq!(first.analysis_id, second.analysis_id);
    assert_eq!(first.recording_id, second.recording_id);
    assert_eq!(dispatcher.jobs.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_missing_recording_url_fails_fast_without_writes() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = MockDispatcher::new(false);
    let (pipeline, _rx) = pipeline_with(store.clone(), dispatcher.clone());

    for call in [call_record("CA1", None), call_record("CA1", Some(""))] {
        let err = pipeline.submit(&call).await.unwrap_err();
        assert!(matches!(err, Error::NoRecording { .. }));
    }
    assert!(store.is_empty());
    assert!(dispatcher.jobs.lock().unwrap().is_empty());
    assert!(!pipeline.is_in_flight("CA1"));
}

#[tokio::test]
async fn test_resubmission_repairs_interrupted_recording() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = MockDispatcher::new(false);
    let (pipeline, _rx) = pipeline_with(store.clone(), dispatcher.clone());

    // rows left behind by an earlier submission that never dispatched
    store
        .insert(
            RECORDINGS_TABLE,
            json!({
                "id": "rec-1",
                "owner_id": "emp-1",
                "source_url": "https://x/y.mp3",
                "file_name": "y.mp3",
                "status": "pending",
            }),
        )
        .await
        .unwrap();
    store
        .insert(
            ANALYSES_TABLE,
            json!({
                "id": "an-1",
                "recording_id": "rec-1",
                "call_id": "CA1",
                "owner_id": "emp-1",
                "status": "processing",
            }),
        )
        .await
        .unwrap();

    let handle = pipeline
        .submit(&call_record("CA1", Some("https://x/y.mp3")))
        .await
        .unwrap();

    assert_eq!(handle.analysis_id, "an-1");
    assert_eq!(handle.recording_id, "rec-1");
    assert_eq!(store.row_count(RECORDINGS_TABLE), 1);
    assert_eq!(store.row_count(ANALYSES_TABLE), 1);
    let recording = store
        .select_one(RECORDINGS_TABLE, &Filter::new().eq("id", "rec-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recording["status"], "processing");
}

#[tokio::test]
async fn test_dispatch_failure_keeps_rows_and_clears_in_flight() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = MockDispatcher::new(true);
    let (pipeline, mut rx) = pipeline_with(store.clone(), dispatcher.clone());

    let err = pipeline
        .submit(&call_record("CA1", Some("https://x/y.mp3")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Dispatch { .. }));

    // durable state retained for resubmission
    assert_eq!(store.row_count(RECORDINGS_TABLE), 1);
    assert_eq!(store.row_count(ANALYSES_TABLE), 1);
    // UI indicator cleared
    assert!(!pipeline.is_in_flight("CA1"));

    // queued then error, in that order
    assert!(matches!(
        rx.try_recv().unwrap(),
        SessionEvent::AnalysisQueued { .. }
    ));
    assert!(matches!(rx.try_recv().unwrap(), SessionEvent::Error { .. }));
}

#[tokio::test]
async fn test_in_flight_sync_and_rebuild() {
    let store = Arc::new(MemoryStore::new());
    let dispatcher = MockDispatcher::new(false);
    let (pipeline, mut rx) = pipeline_with(store.clone(), dispatcher.clone());

    pipeline
        .submit(&call_record("CA1", Some("https://x/y.mp3")))
        .await
        .unwrap();
    assert!(pipeline.is_in_flight("CA1"));

    // nothing terminal yet, sync is a no-op
    pipeline.sync_in_flight().await.unwrap();
    assert!(pipeline.is_in_flight("CA1"));

    // processor wrote back a terminal recording status
    store
        .update(
            RECORDINGS_TABLE,
            &Filter::new().eq("owner_id", "emp-1"),
            json!({"status": "completed"}),
        )
        .await
        .unwrap();
    while rx.try_recv().is_ok() {}
    pipeline.sync_in_flight().await.unwrap();
    assert!(!pipeline.is_in_flight("CA1"));
    assert!(matches!(
        rx.try_recv().unwrap(),
        SessionEvent::AnalysisSettled {
            status: AnalysisStatus::Completed,
            ..
        }
    ));

    // the processor also settles the analysis row itself
    store
        .update(
            ANALYSES_TABLE,
            &Filter::new().eq("call_id", "CA1"),
            json!({"status": "completed"}),
        )
        .await
        .unwrap();

    // a restart rebuilds membership from non-terminal analysis rows
    store
        .insert(
            ANALYSES_TABLE,
            json!({"id": "an-2", "call_id": "CA2", "recording_id": "rec-2", "status": "processing"}),
        )
        .await
        .unwrap();
    let count = pipeline.rebuild_in_flight().await.unwrap();
    assert_eq!(count, 1);
    assert!(pipeline.is_in_flight("CA2"));
    assert!(!pipeline.is_in_flight("CA1"));
}

/// In-process ingress stub. POST always fails; GET succeeds unless
/// `fail_all` is set. Returns the bound URL and the tier-hit log.
async fn spawn_ingress(fail_all: bool) -> (String, Arc<Mutex<Vec<String>>>) {
    let hits: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let post_hits = hits.clone();
    let get_hits = hits.clone();
    let app = Router::new().route(
        "/ingest",
        post(move |headers: HeaderMap, _body: String| {
            let hits = post_hits.clone();
            async move {
                let content_type = headers
                    .get("content-type")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                hits.lock().unwrap().push(content_type);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })
        .get(move || {
            let hits = get_hits.clone();
            async move {
                hits.lock().unwrap().push("get".to_string());
                if fail_all {
                    StatusCode::INTERNAL_SERVER_ERROR
                } else {
                    StatusCode::OK
                }
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/ingest", addr), hits)
}

#[tokio::test]
async fn test_dispatch_escalates_to_beacon_tier() {
    let (url, hits) = spawn_ingress(false).await;
    let store = Arc::new(MemoryStore::new());
    let dispatcher: Arc<dyn JobDispatcher> = Arc::new(TieredDispatcher::new(url));
    let (pipeline, _rx) = pipeline_with(store.clone(), dispatcher);

    // tiers (a) and (b) fail, (c) succeeds: no error surfaced to the caller
    pipeline
        .submit(&call_record("CA1", Some("https://x/y.mp3")))
        .await
        .unwrap();

    let hits = hits.lock().unwrap().clone();
    assert_eq!(hits.len(), 3);
    assert!(hits[0].starts_with("application/json"));
    assert!(hits[1].starts_with("text/plain"));
    assert_eq!(hits[2], "get");

    let analysis = store
        .select_one(ANALYSES_TABLE, &Filter::new().eq("call_id", "CA1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(analysis["status"], "processing");
    assert!(pipeline.is_in_flight("CA1"));
}

#[tokio::test]
async fn test_dispatch_exhausting_all_tiers_surfaces_one_error() {
    let (url, hits) = spawn_ingress(true).await;
    let store = Arc::new(MemoryStore::new());
    let dispatcher: Arc<dyn JobDispatcher> = Arc::new(TieredDispatcher::new(url));
    let (pipeline, mut rx) = pipeline_with(store.clone(), dispatcher);

    let err = pipeline
        .submit(&call_record("CA1", Some("https://x/y.mp3")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Dispatch { .. }));
    assert_eq!(hits.lock().unwrap().len(), 3);

    // rows remain for resubmission, indicator cleared, error surfaced once
    let recording = store
        .select_one(RECORDINGS_TABLE, &Filter::new().eq("owner_id", "emp-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recording["status"], "pending");
    let analysis = store
        .select_one(ANALYSES_TABLE, &Filter::new().eq("call_id", "CA1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(analysis["status"], "processing");
    assert!(!pipeline.is_in_flight("CA1"));

    let mut error_events = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, SessionEvent::Error { .. }) {
            error_events += 1;
        }
    }
    assert_eq!(error_events, 1);
}

#[test]
fn test_file_name_from_url() {
    assert_eq!(file_name_from_url("https://x/y.mp3"), "y.mp3");
    assert_eq!(file_name_from_url("https://x/a/b.wav?token=1"), "b.wav");
    assert_eq!(file_name_from_url("plain"), "plain");
}
