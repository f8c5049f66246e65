/// Load-time configuration. All values are constants for the process
/// lifetime; there is no hot reload.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One external AI vendor: credentials, endpoint override, call timeout.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl VendorConfig {
    pub fn timeout_or(&self, default_secs: u64) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs.unwrap_or(default_secs))
    }
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: None,
            timeout_secs: None,
        }
    }
}

impl std::fmt::Debug for VendorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VendorConfig")
            .field(
                "api_key",
                &if self.api_key.is_empty() {
                    "[empty]"
                } else {
                    "[REDACTED]"
                },
            )
            .field("api_base", &self.api_base)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersConfig {
    /// Plant identification vendor (Plant.id-class API).
    #[serde(default)]
    pub plant_id: VendorConfig,
    /// Vision fallback for identification (Gemini-class API).
    #[serde(default)]
    pub gemini: VendorConfig,
    /// Conversational primary (Anthropic-class API), both model tiers.
    #[serde(default)]
    pub anthropic: VendorConfig,
    /// Conversational fallback and embeddings (OpenAI-class API).
    #[serde(default)]
    pub openai: VendorConfig,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Monthly per-task caps for one tier. `-1` means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierQuotas {
    pub identification: i64,
    pub health: i64,
    pub chat: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaConfig {
    #[serde(default = "QuotaConfig::default_free")]
    pub free: TierQuotas,
    #[serde(default = "QuotaConfig::default_premium")]
    pub premium: TierQuotas,
}

impl QuotaConfig {
    fn default_free() -> TierQuotas {
        TierQuotas {
            identification: 5,
            health: 2,
            chat: 10,
        }
    }

    fn default_premium() -> TierQuotas {
        TierQuotas {
            identification: -1,
            health: -1,
            chat: -1,
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free: Self::default_free(),
            premium: Self::default_premium(),
        }
    }
}

/// Token-budget slices for chat context assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextBudget {
    pub user: usize,
    pub plant: usize,
    pub history: usize,
    pub memories: usize,
    pub reserve: usize,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            user: 200,
            plant: 500,
            history: 2000,
            memories: 1000,
            reserve: 300,
        }
    }
}

fn default_low_confidence() -> f64 {
    0.70
}

fn default_semantic_threshold() -> f64 {
    0.70
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    /// Below this top-confidence, identification responses include alternatives.
    #[serde(default = "default_low_confidence")]
    pub low_confidence: f64,
    /// Minimum cosine similarity for semantic memory retrieval.
    #[serde(default = "default_semantic_threshold")]
    pub semantic_search: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low_confidence: default_low_confidence(),
            semantic_search: default_semantic_threshold(),
        }
    }
}

fn default_signed_url_ttl() -> u64 {
    3600
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default = "StorageConfig::default_root")]
    pub root_dir: String,
    #[serde(default)]
    pub signing_secret: String,
    #[serde(default = "default_signed_url_ttl")]
    pub signed_url_ttl_secs: u64,
    #[serde(default = "StorageConfig::default_public_base")]
    pub public_base_url: String,
}

impl StorageConfig {
    fn default_root() -> String {
        "data/photos".to_string()
    }

    fn default_public_base() -> String {
        "http://localhost:8080/photos".to_string()
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: Self::default_root(),
            signing_secret: String::new(),
            signed_url_ttl_secs: default_signed_url_ttl(),
            public_base_url: Self::default_public_base(),
        }
    }
}

impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("root_dir", &self.root_dir)
            .field(
                "signing_secret",
                &if self.signing_secret.is_empty() {
                    "[empty]"
                } else {
                    "[REDACTED]"
                },
            )
            .field("signed_url_ttl_secs", &self.signed_url_ttl_secs)
            .field("public_base_url", &self.public_base_url)
            .finish()
    }
}

fn default_pool_size() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    #[serde(default = "DatabaseConfig::default_path")]
    pub path: String,
    /// Kept at 1 when running in a serverless environment.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl DatabaseConfig {
    fn default_path() -> String {
        "data/leafwise.db".to_string()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            pool_size: default_pool_size(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub quotas: QuotaConfig,
    #[serde(default)]
    pub context_budget: ContextBudget,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Load config from a JSON file (missing file yields defaults), then apply
/// environment overrides for secrets so keys never need to live on disk.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(p) if p.exists() => {
            let content = fs::read_to_string(p)
                .with_context(|| format!("failed to read config from {}", p.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse config JSON from {}", p.display()))?
        }
        _ => Config::default(),
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) {
    let overrides = [
        ("LEAFWISE_PLANT_ID_API_KEY", &mut config.providers.plant_id),
        ("LEAFWISE_GEMINI_API_KEY", &mut config.providers.gemini),
        ("LEAFWISE_ANTHROPIC_API_KEY", &mut config.providers.anthropic),
        ("LEAFWISE_OPENAI_API_KEY", &mut config.providers.openai),
    ];
    for (var, vendor) in overrides {
        if let Ok(value) = std::env::var(var)
            && !value.is_empty()
        {
            vendor.api_key = value;
        }
    }
    if let Ok(secret) = std::env::var("LEAFWISE_STORAGE_SIGNING_SECRET")
        && !secret.is_empty()
    {
        config.storage.signing_secret = secret;
    }
}
