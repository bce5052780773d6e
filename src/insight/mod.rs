use crate::call::CALLS_TABLE;
use crate::error::{Error, Result};
use crate::event::{EventSender, SessionEvent};
use crate::get_timestamp;
use crate::storage::{Filter, RecordStore};
use async_openai::{config::OpenAIConfig, types::CreateChatCompletionRequestArgs, Client};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Aggregate call/analysis statistics for one time window. Computed by the
/// caller (or `InsightService::collect_stats`); the summarizer only turns
/// them into prose.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallStats {
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub completed: u64,
    pub not_answered: u64,
    pub busy: u64,
    pub failed: u64,
    pub converted: u64,
    pub avg_duration_secs: f64,
}

/// Structured summary the generative backend must return. Responses that do
/// not parse into this shape, or parse with an empty headline, count as a
/// failed variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightSummary {
    pub headline: String,
    pub highlights: Vec<String>,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
}

#[async_trait]
pub trait SummaryBackend: Send + Sync {
    async fn complete(&self, model: &str, prompt: &str) -> anyhow::Result<String>;
}

/// OpenAI-compatible chat backend.
pub struct OpenAiBackend {
    client: Client<OpenAIConfig>,
}

impl OpenAiBackend {
    pub fn new(api_key: impl Into<String>, base_url: Option<String>) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base_url) = base_url {
            config = config.with_api_base(base_url);
        }
        Self {
            client: Client::with_config(config),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenv();
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY is required"))?;
        let base_url = std::env::var("OPENAI_BASE_URL").ok();
        Ok(Self::new(api_key, base_url))
    }
}

#[async_trait]
impl SummaryBackend for OpenAiBackend {
    async fn complete(&self, model: &str, prompt: &str) -> anyhow::Result<String> {
        let mut messages: Vec<async_openai::types::ChatCompletionRequestMessage> = Vec::new();
        messages.push(
            async_openai::types::ChatCompletionRequestUserMessageArgs::default()
                .content(prompt)
                .build()?
                .into(),
        );
        let request = CreateChatCompletionRequestArgs::default()
            .max_tokens(512u32)
            .model(model)
            .messages(messages)
            .temperature(0.3)
            .build()?;
        let response = self.client.chat().create(request).await?;
        let text = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        Ok(text)
    }
}

/// Ordered fallback across interchangeable model variants: every candidate
/// shares one request contract, any failure (network, malformed payload,
/// model unavailable) moves to the next, and only exhausting the list is an
/// error.
pub struct InsightSummarizer {
    backend: Arc<dyn SummaryBackend>,
    models: Vec<String>,
}

impl InsightSummarizer {
    pub fn new(backend: Arc<dyn SummaryBackend>, models: Vec<String>) -> Self {
        Self { backend, models }
    }

    pub async fn summarize(&self, stats: &CallStats) -> Result<InsightSummary> {
        let prompt = build_prompt(stats);
        let mut last = "no model variants configured".to_string();
        for model in &self.models {
            match self.backend.complete(model, &prompt).await {
                Ok(text) => match parse_summary(&text) {
                    Ok(summary) => {
                        info!(model, "insight summary generated");
                        return Ok(summary);
                    }
                    Err(e) => {
                        warn!(model, error = %e, "malformed insight payload, trying next variant");
                        last = format!("{}: {}", model, e);
                    }
                },
                Err(e) => {
                    warn!(model, error = %e, "insight request failed, trying next variant");
                    last = format!("{}: {}", model, e);
                }
            }
        }
        Err(Error::InsightExhausted { last })
    }
}

fn build_prompt(stats: &CallStats) -> String {
    let stats_json = serde_json::to_string_pretty(stats).unwrap_or_default();
    format!(
        "You are an analyst for an outbound call team. Given these aggregate \
         statistics, reply with ONLY a JSON object with fields \"headline\" \
         (one sentence), \"highlights\" (array of strings) and \
         \"recommended_actions\" (array of strings).\n\n{}",
        stats_json
    )
}

/// Parse and validate a backend response. Tolerates markdown code fences but
/// nothing else.
fn parse_summary(text: &str) -> anyhow::Result<InsightSummary> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();
    let summary: InsightSummary = serde_json::from_str(body)?;
    if summary.headline.trim().is_empty() {
        anyhow::bail!("summary has empty headline");
    }
    if summary.highlights.is_empty() {
        anyhow::bail!("summary has no highlights");
    }
    Ok(summary)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InsightOptions {
    pub models: Vec<String>,
    /// How often the periodic job runs.
    pub interval_secs: u64,
    /// Statistics window, counted back from each run.
    pub window_hours: i64,
}

impl Default for InsightOptions {
    fn default() -> Self {
        Self {
            models: vec![
                "gpt-4o-mini".to_string(),
                "gpt-4o".to_string(),
                "gpt-3.5-turbo".to_string(),
            ],
            interval_secs: 3600,
            window_hours: 24,
        }
    }
}

/// Periodic, best-effort insight job. Independent of the call lifecycle;
/// failures are logged and the next tick tries again.
pub struct InsightService {
    summarizer: InsightSummarizer,
    store: Arc<dyn RecordStore>,
    events: EventSender,
    options: InsightOptions,
}

impl InsightService {
    pub fn new(
        summarizer: InsightSummarizer,
        store: Arc<dyn RecordStore>,
        events: EventSender,
        options: InsightOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            summarizer,
            store,
            events,
            options,
        })
    }

    pub async fn collect_stats(&self, window_hours: i64) -> Result<CallStats> {
        let window_start = Utc::now() - ChronoDuration::hours(window_hours);
        let rows = self
            .store
            .select(
                CALLS_TABLE,
                &Filter::new().gte("started_at", window_start.to_rfc3339()),
            )
            .await?;

        let mut stats = CallStats {
            window_start: Some(window_start),
            window_end: Some(Utc::now()),
            ..Default::default()
        };
        let mut duration_total = 0u64;
        for row in &rows {
            stats.total_calls += 1;
            duration_total += row
                .get("duration_secs")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            match row.get("outcome").and_then(|v| v.as_str()) {
                Some("completed") => stats.completed += 1,
                Some("not_answered") => stats.not_answered += 1,
                Some("busy") => stats.busy += 1,
                Some("failed") => stats.failed += 1,
                Some("converted") => stats.converted += 1,
                _ => {}
            }
        }
        if stats.total_calls > 0 {
            stats.avg_duration_secs = duration_total as f64 / stats.total_calls as f64;
        }
        Ok(stats)
    }

    pub async fn run_loop(self: Arc<Self>, cancel_token: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.options.interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "insight run failed, will retry next interval");
                    }
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
    }

    pub fn start(self: Arc<Self>, cancel_token: CancellationToken) {
        tokio::spawn(async move {
            self.run_loop(cancel_token).await;
        });
    }

    async fn tick(&self) -> Result<()> {
        let stats = self.collect_stats(self.options.window_hours).await?;
        if stats.total_calls == 0 {
            return Ok(());
        }
        let summary = self.summarizer.summarize(&stats).await?;
        let _ = self.events.send(SessionEvent::Insight {
            headline: summary.headline.clone(),
            timestamp: get_timestamp(),
        });
        Ok(())
    }

    pub async fn summarize(&self, stats: &CallStats) -> Result<InsightSummary> {
        self.summarizer.summarize(stats).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedBackend {
        responses: Mutex<Vec<anyhow::Result<String>>>,
        attempts: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<anyhow::Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                attempts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SummaryBackend for ScriptedBackend {
        async fn complete(&self, model: &str, _prompt: &str) -> anyhow::Result<String> {
            self.attempts.lock().unwrap().push(model.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                anyhow::bail!("script exhausted");
            }
            responses.remove(0)
        }
    }

    fn good_payload() -> String {
        serde_json::json!({
            "headline": "Strong afternoon for conversions",
            "highlights": ["12 of 40 calls converted"],
            "recommended_actions": ["Call back the 6 busy numbers"],
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_falls_through_malformed_variants() {
        let backend = ScriptedBackend::new(vec![
            Ok("not json at all".to_string()),
            Ok(serde_json::json!({"headline": ""}).to_string()),
            Err(anyhow::anyhow!("model unavailable")),
            Ok(good_payload()),
        ]);
        let models = vec![
            "m1".to_string(),
            "m2".to_string(),
            "m3".to_string(),
            "m4".to_string(),
        ];
        let summarizer = InsightSummarizer::new(backend.clone(), models);

        let summary = summarizer.summarize(&CallStats::default()).await.unwrap();
        assert_eq!(summary.headline, "Strong afternoon for conversions");
        assert_eq!(
            backend.attempts.lock().unwrap().clone(),
            vec!["m1", "m2", "m3", "m4"]
        );
    }

    #[tokio::test]
    async fn test_all_variants_exhausted_surfaces_last_error() {
        let backend = ScriptedBackend::new(vec![
            Ok("garbage".to_string()),
            Err(anyhow::anyhow!("connection refused")),
        ]);
        let summarizer =
            InsightSummarizer::new(backend, vec!["m1".to_string(), "m2".to_string()]);

        let err = summarizer.summarize(&CallStats::default()).await.unwrap_err();
        match err {
            Error::InsightExhausted { last } => {
                assert!(last.contains("m2"));
                assert!(last.contains("connection refused"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stops_at_first_good_variant() {
        let backend = ScriptedBackend::new(vec![Ok(good_payload())]);
        let summarizer = InsightSummarizer::new(
            backend.clone(),
            vec!["m1".to_string(), "m2".to_string()],
        );
        summarizer.summarize(&CallStats::default()).await.unwrap();
        assert_eq!(backend.attempts.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_summary_tolerates_code_fences() {
        let fenced = format!("```json\n{}\n```", good_payload());
        let summary = parse_summary(&fenced).unwrap();
        assert!(!summary.highlights.is_empty());

        assert!(parse_summary("```json\n{}\n```").is_err());
        assert!(parse_summary("plain prose, no json").is_err());
    }
}
