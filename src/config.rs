//! Configuration loaded from `prompt_vault.toml` and environment variables,
//! following the teacher's dotenvy → TOML → env-override → validate layering.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub store: StoreConfig,
    /// The other backend's store config, present only when
    /// `SyncEngine` should reconcile two stores (§4.8) — e.g. an embedded
    /// primary paired with a hosted mirror.
    #[serde(default)]
    pub remote_store: Option<StoreConfig>,
    pub vector: VectorConfig,
    pub cache: CacheConfig,
    pub concurrency: ConcurrencyConfig,
    /// Runtime configuration loaded from environment variables.
    #[serde(skip)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Embedded,
    Hosted,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(rename = "type")]
    pub kind: StoreKind,
    /// Embedded file path; ignored when `kind = hosted`.
    pub path: Option<String>,
    pub hosted_url: Option<String>,
    pub hosted_key: Option<String>,
    pub connection_string: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderPriorityConfig {
    RemoteFirst,
    LocalFirst,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VectorConfig {
    pub enabled: bool,
    pub dimension: Option<usize>,
    pub embedding_model: String,
    pub embedding_api_key: Option<String>,
    pub local_model_id: Option<String>,
    pub use_modelscope: bool,
    pub provider_priority: ProviderPriorityConfig,
    pub batch_size: usize,
    pub max_length: usize,
    pub result_cache_enabled: bool,
    pub result_cache_capacity: usize,
    pub result_cache_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Memory,
    Filesystem,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: CacheKind,
    pub max_capacity: usize,
    pub ttl_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub dir: Option<String>,
    pub invalidation_channel: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConcurrencyConfig {
    pub queue_max_size: usize,
    pub queue_timeout_secs: u64,
}

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub database_user: String,
    pub database_pass: String,
    pub database_ns: String,
    pub database_db: String,
    pub redis_url: String,
    pub embed_retries: u32,
    pub embed_strict: bool,
    pub log_level: String,
    pub time_sync_url: String,
    pub time_sync_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database_user: "root".to_string(),
            database_pass: "root".to_string(),
            database_ns: "prompt_vault".to_string(),
            database_db: "prompt_vault".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            embed_retries: 3,
            embed_strict: false,
            log_level: "prompt_vault=info".to_string(),
            time_sync_url: "https://www.google.com".to_string(),
            time_sync_interval_secs: 45,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                kind: StoreKind::Embedded,
                path: Some("127.0.0.1:8000".to_string()),
                hosted_url: None,
                hosted_key: None,
                connection_string: None,
            },
            remote_store: None,
            vector: VectorConfig {
                enabled: true,
                dimension: None,
                embedding_model: "text-embedding-3-small".to_string(),
                embedding_api_key: None,
                local_model_id: Some("BAAI/bge-small-en-v1.5".to_string()),
                use_modelscope: false,
                provider_priority: ProviderPriorityConfig::RemoteFirst,
                batch_size: 16,
                max_length: 512,
                result_cache_enabled: true,
                result_cache_capacity: 1000,
                result_cache_ttl_seconds: 3600,
            },
            cache: CacheConfig {
                enabled: true,
                kind: CacheKind::Memory,
                max_capacity: 1000,
                ttl_seconds: 3600,
                idle_timeout_seconds: 1800,
                dir: None,
                invalidation_channel: "prompt-cache-invalidation".to_string(),
            },
            concurrency: ConcurrencyConfig {
                queue_max_size: 100,
                queue_timeout_secs: 30,
            },
            runtime: RuntimeConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file and environment variables.
    /// Uses `PROMPT_VAULT_CONFIG` or defaults to `prompt_vault.toml`.
    pub fn load() -> anyhow::Result<Self> {
        if let Ok(env_path) = std::env::var("PROMPT_VAULT_ENV_FILE") {
            let _ = dotenvy::from_path(env_path);
        } else {
            let _ = dotenvy::from_path(".env");
            let core_present = std::env::var("PROMPT_VAULT_DB_URL").is_ok()
                || std::env::var("OPENAI_API_KEY").is_ok();
            if !core_present {
                let _ = dotenvy::from_path("../.env");
            }
        }

        let config_path = std::env::var("PROMPT_VAULT_CONFIG")
            .unwrap_or_else(|_| "prompt_vault.toml".to_string());

        let mut config: Config = if let Ok(content) = std::fs::read_to_string(&config_path) {
            toml::from_str(&content)?
        } else {
            tracing::warn!("config file {} not found, using defaults", config_path);
            Self::default()
        };

        if let Ok(url) = std::env::var("PROMPT_VAULT_DB_URL") {
            config.store.path = Some(url);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.vector.embedding_api_key = Some(key);
        }

        config.runtime = RuntimeConfig::load_from_env();

        // Clamp embed_retries into [1, 10], mirroring the teacher's own
        // clamp for the same field.
        if config.runtime.embed_retries == 0 {
            config.runtime.embed_retries = 1;
        } else if config.runtime.embed_retries > 10 {
            tracing::warn!(
                "embed_retries {} exceeds max 10, clamping to 10",
                config.runtime.embed_retries
            );
            config.runtime.embed_retries = 10;
        }

        // Provider/dimension coherence, same spirit as the teacher's
        // openai-model-name ↔ dimensions check.
        if let Some(d) = config.vector.dimension {
            match config.vector.embedding_model.as_str() {
                "text-embedding-3-small" if d != 1536 => {
                    if config.runtime.embed_strict {
                        anyhow::bail!(
                            "text-embedding-3-small requires 1536 dimensions, got {d}"
                        );
                    }
                    tracing::warn!(
                        "text-embedding-3-small should use 1536 dimensions, got {}",
                        d
                    );
                }
                "text-embedding-3-large" if d != 3072 => {
                    if config.runtime.embed_strict {
                        anyhow::bail!(
                            "text-embedding-3-large requires 3072 dimensions, got {d}"
                        );
                    }
                    tracing::warn!(
                        "text-embedding-3-large should use 3072 dimensions, got {}",
                        d
                    );
                }
                _ => {}
            }
        }

        Ok(config)
    }
}

impl RuntimeConfig {
    pub fn load_from_env() -> Self {
        Self {
            database_user: std::env::var("PROMPT_VAULT_DB_USER")
                .unwrap_or_else(|_| "root".to_string()),
            database_pass: std::env::var("PROMPT_VAULT_DB_PASS")
                .unwrap_or_else(|_| "root".to_string()),
            database_ns: std::env::var("PROMPT_VAULT_DB_NS")
                .unwrap_or_else(|_| "prompt_vault".to_string()),
            database_db: std::env::var("PROMPT_VAULT_DB_DB")
                .unwrap_or_else(|_| "prompt_vault".to_string()),
            redis_url: std::env::var("PROMPT_VAULT_REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            embed_retries: std::env::var("PROMPT_VAULT_EMBED_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            embed_strict: std::env::var("PROMPT_VAULT_EMBED_STRICT")
                .ok()
                .is_some_and(|v| v == "true" || v == "1"),
            log_level: std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "prompt_vault=info".to_string()),
            time_sync_url: std::env::var("PROMPT_VAULT_TIME_SYNC_URL")
                .unwrap_or_else(|_| "https://www.google.com".to_string()),
            time_sync_interval_secs: std::env::var("PROMPT_VAULT_TIME_SYNC_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(45),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_embedded_store() {
        let config = Config::default();
        matches!(config.store.kind, StoreKind::Embedded);
        assert_eq!(config.concurrency.queue_max_size, 100);
    }

    #[test]
    fn config_load_does_not_panic_without_a_file() {
        let config = Config::load();
        assert!(config.is_ok() || config.is_err());
    }
}
