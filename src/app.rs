use crate::analysis::{AnalysisPipeline, JobDispatcher, TieredDispatcher};
use crate::call::{CallOutcomeReconciler, CallSessionManager};
use crate::config::Config;
use crate::event::EventSender;
use crate::gateway::{CallGateway, HttpCallGateway};
use crate::insight::{InsightService, InsightSummarizer, OpenAiBackend, SummaryBackend};
use crate::storage::{build_store, RecordStore};
use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tower_http::cors::{AllowOrigin, CorsLayer};

pub struct AppStateInner {
    pub config: Arc<Config>,
    pub token: CancellationToken,
    pub store: Arc<dyn RecordStore>,
    pub sessions: Arc<CallSessionManager>,
    pub reconciler: Arc<CallOutcomeReconciler>,
    pub pipeline: Arc<AnalysisPipeline>,
    pub insight: Arc<InsightService>,
    pub event_sender: EventSender,
}

pub type AppState = Arc<AppStateInner>;

pub struct AppStateBuilder {
    pub config: Option<Config>,
    store: Option<Arc<dyn RecordStore>>,
    gateway: Option<Arc<dyn CallGateway>>,
    dispatcher: Option<Arc<dyn JobDispatcher>>,
    summary_backend: Option<Arc<dyn SummaryBackend>>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            store: None,
            gateway: None,
            dispatcher: None,
            summary_backend: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn gateway(mut self, gateway: Arc<dyn CallGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn JobDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn summary_backend(mut self, backend: Arc<dyn SummaryBackend>) -> Self {
        self.summary_backend = Some(backend);
        self
    }

    pub async fn build(self) -> Result<AppState> {
        let config = Arc::new(self.config.unwrap_or_default());
        let token = CancellationToken::new();
        let (event_sender, _) = tokio::sync::broadcast::channel(256);

        let store = self.store.unwrap_or_else(|| build_store(&config.store));

        let gateway: Arc<dyn CallGateway> = self.gateway.unwrap_or_else(|| {
            Arc::new(HttpCallGateway::new(
                config.gateway.base_url.clone(),
                config.gateway.tenant(),
            ))
        });

        let reconciler = Arc::new(CallOutcomeReconciler::new(store.clone()));
        let sessions = CallSessionManager::new(
            gateway,
            reconciler.clone(),
            event_sender.clone(),
            config.poller.clone(),
            token.child_token(),
        );

        let dispatcher: Arc<dyn JobDispatcher> = self
            .dispatcher
            .unwrap_or_else(|| Arc::new(TieredDispatcher::new(config.analysis.ingress_url.clone())));
        let pipeline = Arc::new(AnalysisPipeline::new(
            store.clone(),
            dispatcher,
            event_sender.clone(),
        ));
        match pipeline.rebuild_in_flight().await {
            Ok(count) if count > 0 => info!(count, "rebuilt in-flight analysis set"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to rebuild in-flight analysis set"),
        }

        let summary_backend: Arc<dyn SummaryBackend> = match self.summary_backend {
            Some(backend) => backend,
            None => match OpenAiBackend::from_env() {
                Ok(backend) => Arc::new(backend),
                Err(e) => {
                    warn!(error = %e, "insight backend not configured, summaries will fail until it is");
                    Arc::new(OpenAiBackend::new("", None))
                }
            },
        };
        let summarizer = InsightSummarizer::new(summary_backend, config.insight.models.clone());
        let insight = InsightService::new(
            summarizer,
            store.clone(),
            event_sender.clone(),
            config.insight.clone(),
        );

        Ok(Arc::new(AppStateInner {
            config,
            token,
            store,
            sessions,
            reconciler,
            pipeline,
            insight,
            event_sender,
        }))
    }
}

impl Default for AppStateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn run(state: AppState) -> Result<()> {
    let token = state.token.clone();
    state.insight.clone().start(token.child_token());

    let app = create_router(state.clone());
    let addr: SocketAddr = state.config.http_addr.parse()?;
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            return Err(anyhow::anyhow!("Failed to bind to {}: {}", addr, e));
        }
    };

    let http_task = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    select! {
        http_result = http_task => {
            match http_result {
                Ok(_) => info!("Server shut down gracefully"),
                Err(e) => {
                    tracing::error!("Server error: {}", e);
                    return Err(anyhow::anyhow!("Server error: {}", e));
                }
            }
        }
        _ = token.cancelled() => {
            info!("Application shutting down due to cancellation");
        }
    }
    token.cancel();
    state.sessions.shutdown();
    Ok(())
}

fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::AUTHORIZATION,
            axum::http::header::ACCEPT,
            axum::http::header::ORIGIN,
        ]);

    crate::handler::router().with_state(state).layer(cors)
}
