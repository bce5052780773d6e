use crate::error::{Error, Result};
use anyhow::anyhow;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};

static DEFAULT_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .unwrap_or_default()
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    Memory,
    Rest {
        url: String,
        api_key: String,
        #[serde(default)]
        headers: Option<HashMap<String, String>>,
        #[serde(default)]
        retry: Option<RetryPolicy>,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory
    }
}

/// Explicit retry policy for transient store failures. Named parameters, not
/// re-invocation side effects: max attempts, base interval, random jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            interval_ms: 200,
            jitter_ms: 100,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::rng().random_range(0..self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.interval_ms + jitter)
    }
}

/// Column filter in the store's native operator form: `eq` / `neq` / `gte` /
/// `lte`, encoded PostgREST-style as `<op>.<operand>`.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    entries: Vec<(String, String)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, operand: impl ToString) -> Self {
        self.entries
            .push((column.into(), format!("eq.{}", operand.to_string())));
        self
    }

    pub fn neq(mut self, column: impl Into<String>, operand: impl ToString) -> Self {
        self.entries
            .push((column.into(), format!("neq.{}", operand.to_string())));
        self
    }

    pub fn gte(mut self, column: impl Into<String>, operand: impl ToString) -> Self {
        self.entries
            .push((column.into(), format!("gte.{}", operand.to_string())));
        self
    }

    pub fn lte(mut self, column: impl Into<String>, operand: impl ToString) -> Self {
        self.entries
            .push((column.into(), format!("lte.{}", operand.to_string())));
        self
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    fn matches(&self, row: &Value) -> bool {
        self.entries.iter().all(|(column, encoded)| {
            let (op, operand) = encoded.split_once('.').unwrap_or(("eq", encoded));
            let cell = match row.get(column) {
                Some(v) => v,
                None => return false,
            };
            compare(cell, op, operand)
        })
    }
}

/// Compare a JSON cell against a string operand. Numbers compare numerically
/// when both sides parse; everything else falls back to the string form,
/// which orders ISO-8601 timestamps correctly.
fn compare(cell: &Value, op: &str, operand: &str) -> bool {
    let cell_str = match cell {
        Value::String(s) => s.clone(),
        Value::Null => return op == "neq",
        other => other.to_string(),
    };
    match op {
        "eq" => cell_str == operand,
        "neq" => cell_str != operand,
        "gte" | "lte" => {
            if let (Ok(a), Ok(b)) = (cell_str.parse::<f64>(), operand.parse::<f64>()) {
                if op == "gte" {
                    a >= b
                } else {
                    a <= b
                }
            } else if op == "gte" {
                cell_str.as_str() >= operand
            } else {
                cell_str.as_str() <= operand
            }
        }
        _ => false,
    }
}

/// Generic record store. Natural-key uniqueness is NOT guaranteed here; the
/// caller enforces it via look-before-write (`select_one` then insert or
/// update).
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert one row, returning the stored representation.
    async fn insert(&self, table: &str, row: Value) -> Result<Value>;

    /// Patch every row matching the filter, returning the match count.
    async fn update(&self, table: &str, filter: &Filter, patch: Value) -> Result<u64>;

    /// First row matching the filter, if any.
    async fn select_one(&self, table: &str, filter: &Filter) -> Result<Option<Value>>;

    /// All rows matching the filter.
    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Value>>;
}

pub fn build_store(config: &StoreConfig) -> std::sync::Arc<dyn RecordStore> {
    match config {
        StoreConfig::Memory => std::sync::Arc::new(MemoryStore::new()),
        StoreConfig::Rest {
            url,
            api_key,
            headers,
            retry,
        } => std::sync::Arc::new(RestStore::new(
            url.clone(),
            api_key.clone(),
            headers.clone().unwrap_or_default(),
            retry.clone().unwrap_or_default(),
        )),
    }
}

/// In-process table map. Used by tests and standalone runs; shares the
/// trait's no-uniqueness contract so look-before-write bugs surface here too.
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .unwrap()
            .get(table)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().unwrap().values().all(|rows| rows.is_empty())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert(&self, table: &str, row: Value) -> Result<Value> {
        let mut tables = self.tables.write().unwrap();
        tables.entry(table.to_string()).or_default().push(row.clone());
        Ok(row)
    }

    async fn update(&self, table: &str, filter: &Filter, patch: Value) -> Result<u64> {
        let patch_map = patch
            .as_object()
            .ok_or_else(|| Error::store(table, anyhow!("update patch must be a JSON object")))?
            .clone();
        let mut tables = self.tables.write().unwrap();
        let rows = tables.entry(table.to_string()).or_default();
        let mut matched = 0u64;
        for row in rows.iter_mut() {
            if filter.matches(row) {
                if let Some(obj) = row.as_object_mut() {
                    for (k, v) in &patch_map {
                        obj.insert(k.clone(), v.clone());
                    }
                }
                matched += 1;
            }
        }
        Ok(matched)
    }

    async fn select_one(&self, table: &str, filter: &Filter) -> Result<Option<Value>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .get(table)
            .and_then(|rows| rows.iter().find(|row| filter.matches(row)).cloned()))
    }

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Value>> {
        let tables = self.tables.read().unwrap();
        Ok(tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filter.matches(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// REST record store speaking the PostgREST wire protocol: filters as
/// `?column=op.operand` query pairs, `Prefer: return=representation` to get
/// affected rows back, apikey + bearer auth headers.
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    extra_headers: HashMap<String, String>,
    retry: RetryPolicy,
}

impl RestStore {
    pub fn new(
        base_url: String,
        api_key: String,
        extra_headers: HashMap<String, String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client: DEFAULT_CLIENT.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            extra_headers,
            retry,
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.base_url, table)
    }

    fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req = req
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .header("Prefer", "return=representation");
        for (k, v) in &self.extra_headers {
            req = req.header(k, v);
        }
        req
    }

    /// Run one request builder under the retry policy. Retries connect errors
    /// and 5xx responses; 4xx is the caller's bug and fails immediately.
    async fn send_with_retry(
        &self,
        table: &str,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<Vec<Value>> {
        let mut last_err = anyhow!("no attempts made");
        for attempt in 1..=self.retry.max_attempts {
            let resp = match build().send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(table, attempt, error = %e, "store request failed");
                    last_err = e.into();
                    tokio::time::sleep(self.retry.backoff()).await;
                    continue;
                }
            };
            let status = resp.status();
            if status.is_success() {
                let rows: Vec<Value> = resp
                    .json()
                    .await
                    .map_err(|e| Error::store(table, anyhow!("decode response: {}", e)))?;
                return Ok(rows);
            }
            let body = resp.text().await.unwrap_or_default();
            if status.is_server_error() {
                warn!(table, attempt, %status, "store server error");
                last_err = anyhow!("{}: {}", status, body);
                tokio::time::sleep(self.retry.backoff()).await;
                continue;
            }
            return Err(Error::store(table, anyhow!("{}: {}", status, body)));
        }
        Err(Error::store(table, last_err))
    }
}

#[async_trait]
impl RecordStore for RestStore {
    async fn insert(&self, table: &str, row: Value) -> Result<Value> {
        let url = self.table_url(table);
        let rows = self
            .send_with_retry(table, || {
                self.apply_headers(self.client.post(&url)).json(&row)
            })
            .await?;
        debug!(table, "row inserted");
        rows.into_iter()
            .next()
            .ok_or_else(|| Error::store(table, anyhow!("insert returned no representation")))
    }

    async fn update(&self, table: &str, filter: &Filter, patch: Value) -> Result<u64> {
        let url = self.table_url(table);
        let rows = self
            .send_with_retry(table, || {
                self.apply_headers(
                    self.client
                        .patch(&url)
                        .query(filter.entries())
                        .json(&patch),
                )
            })
            .await?;
        Ok(rows.len() as u64)
    }

    async fn select_one(&self, table: &str, filter: &Filter) -> Result<Option<Value>> {
        let url = self.table_url(table);
        let rows = self
            .send_with_retry(table, || {
                self.apply_headers(
                    self.client
                        .get(&url)
                        .query(filter.entries())
                        .query(&[("limit", "1")]),
                )
            })
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Value>> {
        let url = self.table_url(table);
        self.send_with_retry(table, || {
            self.apply_headers(self.client.get(&url).query(filter.entries()))
        })
        .await
    }
}
