// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Sync Configuration Types
//
// Defines the configuration schema for the AEGIS sync daemon, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Provider endpoints and kinds
// - Circuit breaker thresholds
// - Rate limiter ceilings and bucket TTL
// - Per-resource-kind pipeline cadence and processing caps
// - Storage, knowledge store and observability settings

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::ingestion::ResourceKind;
use crate::domain::provider::ProviderKind;

pub const API_VERSION: &str = "100monkeys.ai/v1";
pub const KIND: &str = "SyncConfig";

/// Top-level Kubernetes-style sync configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfigManifest {
    /// API version (must be "100monkeys.ai/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "SyncConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: SyncConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfigSpec {
    /// Remote provider endpoints discovered at startup
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,

    /// One pipeline per resource kind
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,

    #[serde(default)]
    pub knowledge_store: KnowledgeStoreConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider name used for registry lookups
    pub name: String,

    pub kind: ProviderKind,

    /// Base URL of the provider service
    pub endpoint: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-call transport timeout
    #[serde(default = "default_provider_timeout")]
    pub timeout_seconds: u64,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, kind: ProviderKind, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            endpoint: endpoint.into(),
            enabled: true,
            timeout_seconds: default_provider_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the breaker stays OPEN before allowing a probe
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,
}

impl CircuitBreakerConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_duration_ms: default_open_duration_ms(),
        }
    }
}

/// Per-domain admission ceilings. Also used as a per-call override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Zero disables the short-window ceiling
    #[serde(default = "default_max_per_second")]
    pub max_requests_per_second: u32,

    /// Zero disables the long-window ceiling
    #[serde(default = "default_max_per_minute")]
    pub max_requests_per_minute: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl RateLimitConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: default_max_per_second(),
            max_requests_per_minute: default_max_per_minute(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(flatten)]
    pub defaults: RateLimitConfig,

    /// Idle buckets older than this are evicted
    #[serde(default = "default_bucket_ttl")]
    pub ttl_seconds: u64,

    /// Cadence of the background eviction sweep
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,

    /// First-party host suffixes that are never rate limited
    #[serde(default)]
    pub internal_domains: Vec<String>,
}

impl RateLimiterConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            defaults: RateLimitConfig::default(),
            ttl_seconds: default_bucket_ttl(),
            sweep_interval_seconds: default_sweep_interval(),
            internal_domains: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub resource_kind: ResourceKind,

    /// Registry name of the provider the processor talks to
    pub provider: String,

    /// Delay before the first cycle, letting dependent subsystems warm up
    #[serde(default = "default_startup_delay")]
    pub startup_delay_seconds: u64,

    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_seconds: u64,

    /// Records beyond this cap are indexed without enrichment
    #[serde(default = "default_max_per_cycle")]
    pub max_records_per_cycle: usize,

    /// INDEXING records older than this are considered abandoned and re-claimed
    #[serde(default = "default_claim_timeout")]
    pub claim_timeout_seconds: u64,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl PipelineConfig {
    pub fn new(resource_kind: ResourceKind, provider: impl Into<String>) -> Self {
        Self {
            resource_kind,
            provider: provider.into(),
            startup_delay_seconds: default_startup_delay(),
            cycle_interval_seconds: default_cycle_interval(),
            max_records_per_cycle: default_max_per_cycle(),
            claim_timeout_seconds: default_claim_timeout(),
            enabled: true,
        }
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_seconds)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_seconds)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeStoreConfig {
    /// HTTP endpoint of the knowledge store; in-memory when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Maximum characters per chunk
    #[serde(default = "default_chunk_chars")]
    pub max_chunk_chars: usize,
}

impl Default for KnowledgeStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            max_chunk_chars: default_chunk_chars(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackendKind {
    InMemory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackendKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            connection_string: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_provider_timeout() -> u64 {
    30
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_duration_ms() -> u64 {
    30_000
}

fn default_max_per_second() -> u32 {
    10
}

fn default_max_per_minute() -> u32 {
    300
}

fn default_bucket_ttl() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_startup_delay() -> u64 {
    10
}

fn default_cycle_interval() -> u64 {
    15
}

fn default_max_per_cycle() -> usize {
    20
}

fn default_claim_timeout() -> u64 {
    600
}

fn default_chunk_chars() -> usize {
    2_000
}

fn default_storage_backend() -> StorageBackendKind {
    StorageBackendKind::InMemory
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9091
}

impl Default for SyncConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "aegis-sync".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: SyncConfigSpec::default(),
        }
    }
}

impl SyncConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. AEGIS_SYNC_CONFIG_PATH environment variable
    /// 2. ./aegis-sync.yaml (working directory)
    /// 3. ~/.aegis/sync.yaml (user home)
    /// 4. /etc/aegis/sync.yaml (system, Unix)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("AEGIS_SYNC_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./aegis-sync.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".aegis").join("sync.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        {
            let system_config = PathBuf::from("/etc/aegis/sync.yaml");
            if system_config.exists() {
                return Some(system_config);
            }
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using empty defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("AEGIS_SYNC_DATABASE_URL") {
            tracing::info!("Environment override: AEGIS_SYNC_DATABASE_URL (storage backend -> postgres)");
            self.spec.storage.backend = StorageBackendKind::Postgres;
            self.spec.storage.connection_string = Some(url);
        }

        if let Ok(endpoint) = std::env::var("AEGIS_SYNC_KNOWLEDGE_ENDPOINT") {
            tracing::info!("Environment override: AEGIS_SYNC_KNOWLEDGE_ENDPOINT={}", endpoint);
            self.spec.knowledge_store.endpoint = Some(endpoint);
        }
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.spec.providers.iter().find(|p| p.name == name)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let mut seen = HashMap::new();
        for provider in &self.spec.providers {
            if provider.name.is_empty() {
                anyhow::bail!("Provider name cannot be empty");
            }
            if provider.endpoint.is_empty() {
                anyhow::bail!("Provider endpoint cannot be empty for: {}", provider.name);
            }
            if seen.insert(provider.name.as_str(), provider.kind).is_some() {
                anyhow::bail!("Duplicate provider name: {}", provider.name);
            }
        }

        if self.spec.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("circuit_breaker.failure_threshold must be at least 1");
        }

        let limits = &self.spec.rate_limiter.defaults;
        if limits.max_requests_per_minute > 0
            && limits.max_requests_per_second > limits.max_requests_per_minute
        {
            anyhow::bail!(
                "rate_limiter.max_requests_per_second ({}) exceeds max_requests_per_minute ({})",
                limits.max_requests_per_second,
                limits.max_requests_per_minute
            );
        }

        let mut kinds = HashSet::new();
        for pipeline in &self.spec.pipelines {
            let Some(provider_kind) = seen.get(pipeline.provider.as_str()) else {
                anyhow::bail!(
                    "Pipeline '{}' references unknown provider '{}'",
                    pipeline.resource_kind,
                    pipeline.provider
                );
            };
            let expected = serving_kind(pipeline.resource_kind);
            if *provider_kind != expected {
                anyhow::bail!(
                    "Pipeline '{}' needs a {} provider, but '{}' is a {}",
                    pipeline.resource_kind,
                    expected,
                    pipeline.provider,
                    provider_kind
                );
            }
            if pipeline.max_records_per_cycle == 0 {
                anyhow::bail!(
                    "Pipeline '{}' max_records_per_cycle must be at least 1",
                    pipeline.resource_kind
                );
            }
            if !kinds.insert(pipeline.resource_kind) {
                anyhow::bail!("Duplicate pipeline for resource kind: {}", pipeline.resource_kind);
            }
        }

        if self.spec.storage.backend == StorageBackendKind::Postgres
            && self.spec.storage.connection_string.is_none()
        {
            anyhow::bail!("storage.connection_string is required for the postgres backend");
        }

        Ok(())
    }
}

/// Provider kind that can enrich records of `kind`
fn serving_kind(kind: ResourceKind) -> ProviderKind {
    match kind {
        ResourceKind::Issue => ProviderKind::IssueTracker,
        ResourceKind::Commit => ProviderKind::SourceRepository,
    }
}
