use anyhow::{Context, Result};
use hyper::header::{HeaderName, HeaderValue};
use hyper::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::error::Error;
use crate::lb::{NodeFilter, NodeSelector, ResurrectStrategy, DEFAULT_SNIFF_ENDPOINT};
use crate::pool::{AgentOptions, BasicAuth, MemoryCircuitBreakerConfig, PoolOptions, TlsOptions};
use crate::serializer::PoisoningProtection;
use crate::transport::{Compression, TransportOptions};

/// Topology discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SniffConfig {
    /// Periodic sniff interval, disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,

    #[serde(default)]
    pub on_start: bool,

    #[serde(default)]
    pub on_connection_fault: bool,

    #[serde(default = "default_sniff_endpoint")]
    pub endpoint: String,
}

fn default_sniff_endpoint() -> String {
    DEFAULT_SNIFF_ENDPOINT.to_string()
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            interval_ms: None,
            on_start: false,
            on_connection_fault: false,
            endpoint: default_sniff_endpoint(),
        }
    }
}

/// `false`, `true`, `"proto"` or `"constructor"`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PoisoningSetting {
    Flag(bool),
    Named(String),
}

impl Default for PoisoningSetting {
    fn default() -> Self {
        PoisoningSetting::Flag(false)
    }
}

impl PoisoningSetting {
    pub fn resolve(&self) -> crate::Result<PoisoningProtection> {
        match self {
            PoisoningSetting::Flag(false) => Ok(PoisoningProtection::Enabled),
            PoisoningSetting::Flag(true) => Ok(PoisoningProtection::Disabled),
            PoisoningSetting::Named(name) => match name.as_str() {
                "proto" => Ok(PoisoningProtection::Proto),
                "constructor" => Ok(PoisoningProtection::Constructor),
                other => Err(Error::Configuration(format!(
                    "Invalid prototype poisoning setting: '{}'",
                    other
                ))),
            },
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node URLs
    #[serde(default)]
    pub nodes: Vec<String>,

    /// Basic auth applied to nodes whose URL carries no credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<BasicAuth>,

    /// Sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Timeout of resurrection probes
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    #[serde(default)]
    pub sniff: SniffConfig,

    /// ping, optimistic or none
    #[serde(default = "default_resurrect_strategy")]
    pub resurrect_strategy: String,

    /// default or all
    #[serde(default = "default_node_filter")]
    pub node_filter: String,

    /// round-robin or random
    #[serde(default = "default_node_selector")]
    pub node_selector: String,

    #[serde(default)]
    pub suggest_compression: bool,

    /// Request body compression, only "gzip" is supported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsOptions>,

    /// HTTP forward proxy URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentOptions>,

    #[serde(default)]
    pub memory_circuit_breaker: MemoryCircuitBreakerConfig,

    #[serde(default)]
    pub disable_prototype_poisoning_protection: PoisoningSetting,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opaque_id_prefix: Option<String>,

    #[serde(default = "default_name")]
    pub name: String,

    /// Expected `version.distribution` reported by `GET /`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_check: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_ping_timeout_ms() -> u64 {
    3_000
}

fn default_resurrect_strategy() -> String {
    "ping".to_string()
}

fn default_node_filter() -> String {
    "default".to_string()
}

fn default_node_selector() -> String {
    "round-robin".to_string()
}

fn default_name() -> String {
    "searchpool".to_string()
}

impl Config {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            auth: None,
            headers: BTreeMap::new(),
            max_retries: default_max_retries(),
            request_timeout_ms: default_request_timeout_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            sniff: SniffConfig::default(),
            resurrect_strategy: default_resurrect_strategy(),
            node_filter: default_node_filter(),
            node_selector: default_node_selector(),
            suggest_compression: false,
            compression: None,
            tls: None,
            proxy: None,
            agent: None,
            memory_circuit_breaker: MemoryCircuitBreakerConfig::default(),
            disable_prototype_poisoning_protection: PoisoningSetting::default(),
            opaque_id_prefix: None,
            name: default_name(),
            product_check: None,
        }
    }

    /// Configuration pointing at the given nodes, everything else default
    pub fn with_nodes<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: nodes.into_iter().map(Into::into).collect(),
            ..Self::new()
        }
    }

    pub fn header_map(&self) -> crate::Result<HeaderMap> {
        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Configuration(format!("Invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Configuration(format!("Invalid header value for '{}': {}", name, e)))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    pub fn pool_options(&self) -> crate::Result<PoolOptions> {
        let resurrect_strategy: ResurrectStrategy = self.resurrect_strategy.parse()?;
        let proxy = self
            .proxy
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| Error::Configuration(format!("Invalid proxy url: {}", e)))?;

        Ok(PoolOptions {
            resurrect_strategy,
            ping_timeout: Duration::from_millis(self.ping_timeout_ms),
            auth: self.auth.clone(),
            tls: self.tls.clone(),
            proxy,
            agent: self.agent.clone(),
            headers: self.header_map()?,
            name: self.name.clone(),
            ..PoolOptions::default()
        })
    }

    pub fn transport_options(&self) -> crate::Result<TransportOptions> {
        let compression = self
            .compression
            .as_deref()
            .map(str::parse::<Compression>)
            .transpose()?;

        Ok(TransportOptions {
            max_retries: self.max_retries,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            sniff_interval: self.sniff.interval_ms.map(Duration::from_millis),
            sniff_on_start: self.sniff.on_start,
            sniff_on_connection_fault: self.sniff.on_connection_fault,
            sniff_endpoint: self.sniff.endpoint.clone(),
            node_filter: NodeFilter::from_name(&self.node_filter)?,
            node_selector: NodeSelector::from_name(&self.node_selector)?,
            suggest_compression: self.suggest_compression,
            compression,
            opaque_id_prefix: self.opaque_id_prefix.clone(),
            memory_circuit_breaker: self.memory_circuit_breaker.clone(),
            name: self.name.clone(),
            product_check: self.product_check.clone(),
            ..TransportOptions::default()
        })
    }

    pub fn poisoning_protection(&self) -> crate::Result<PoisoningProtection> {
        self.disable_prototype_poisoning_protection.resolve()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    if config.nodes.is_empty() {
        anyhow::bail!("Config file lists no nodes");
    }

    Ok(config)
}

/// Load configuration from environment variables
///
/// - SEARCHPOOL_NODES (comma-separated node URLs)
/// - SEARCHPOOL_USERNAME / SEARCHPOOL_PASSWORD (optional, both required for auth)
/// - SEARCHPOOL_MAX_RETRIES
/// - SEARCHPOOL_REQUEST_TIMEOUT_MS
/// - SEARCHPOOL_SNIFF_INTERVAL_MS
/// - SEARCHPOOL_RESURRECT_STRATEGY
/// - SEARCHPOOL_NODE_SELECTOR
pub fn load_from_env() -> Result<Config> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let mut config = Config::new();

    let nodes = std::env::var("SEARCHPOOL_NODES")
        .context("SEARCHPOOL_NODES environment variable not set")?;
    config.nodes = nodes
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if config.nodes.is_empty() {
        anyhow::bail!("SEARCHPOOL_NODES contains no valid nodes");
    }

    if let (Ok(username), Ok(password)) = (
        std::env::var("SEARCHPOOL_USERNAME"),
        std::env::var("SEARCHPOOL_PASSWORD"),
    ) {
        config.auth = Some(BasicAuth { username, password });
    }

    if let Ok(retries) = std::env::var("SEARCHPOOL_MAX_RETRIES") {
        config.max_retries = retries
            .parse()
            .context("SEARCHPOOL_MAX_RETRIES must be a non-negative integer")?;
    }

    if let Ok(timeout) = std::env::var("SEARCHPOOL_REQUEST_TIMEOUT_MS") {
        config.request_timeout_ms = timeout
            .parse()
            .context("SEARCHPOOL_REQUEST_TIMEOUT_MS must be a number of milliseconds")?;
    }

    if let Ok(interval) = std::env::var("SEARCHPOOL_SNIFF_INTERVAL_MS") {
        config.sniff.interval_ms = Some(
            interval
                .parse()
                .context("SEARCHPOOL_SNIFF_INTERVAL_MS must be a number of milliseconds")?,
        );
    }

    if let Ok(strategy) = std::env::var("SEARCHPOOL_RESURRECT_STRATEGY") {
        config.resurrect_strategy = strategy;
    }

    if let Ok(selector) = std::env::var("SEARCHPOOL_NODE_SELECTOR") {
        config.node_selector = selector;
    }

    Ok(config)
}

/// Load configuration from a YAML file when a path is given, otherwise from
/// the environment. Nodes given explicitly replace the loaded ones.
pub fn load_config(config_path: Option<&str>, nodes: &[String]) -> Result<Config> {
    let mut config = match config_path {
        Some(path) => load_from_yaml(path)?,
        None if !nodes.is_empty() => Config::new(),
        None => load_from_env()?,
    };

    if !nodes.is_empty() {
        config.nodes = nodes.to_vec();
    }

    Ok(config)
}
