use crate::call::PollerOptions;
use crate::gateway::TenantContext;
use crate::insight::InsightOptions;
use crate::storage::StoreConfig;
use anyhow::Error;
use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "dialdesk.toml")]
    pub conf: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http_addr: String,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub gateway: GatewayConfig,
    pub store: StoreConfig,
    pub analysis: AnalysisConfig,
    pub insight: InsightOptions,
    pub poller: PollerOptions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub account_id: String,
    pub auth_token: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.telephony.example/v1".to_string(),
            account_id: "".to_string(),
            auth_token: "".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn tenant(&self) -> TenantContext {
        TenantContext {
            account_id: self.account_id.clone(),
            auth_token: self.auth_token.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Processor ingress the job payloads are dispatched to.
    pub ingress_url: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            ingress_url: "http://127.0.0.1:9000/ingest".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            log_level: Some("info".to_string()),
            log_file: None,
            gateway: GatewayConfig::default(),
            store: StoreConfig::default(),
            analysis: AnalysisConfig::default(),
            insight: InsightOptions::default(),
            poller: PollerOptions::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }
}
