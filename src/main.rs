//! Binary entry point: loads `Config`, wires up a `Store` + `VectorIndex` +
//! `EmbeddingProvider` + `Cache` + `UpdateQueue` into a `PromptManager`, and
//! exposes its operations as CLI subcommands. The HTTP surface named in
//! SPEC_FULL.md §6 is out of scope; this binary is the process-lifecycle
//! wiring the core needs to run at all, in the teacher's own
//! `main_modular.rs` style (load env, init tracing, build components, run).

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use prompt_vault::cache::Cache;
use prompt_vault::config::{CacheKind, Config, ProviderPriorityConfig, StoreKind};
use prompt_vault::embeddings::{
    Embedder, EmbeddingProvider, LocalEmbedder, NullEmbedder, OpenAIEmbedder, ProviderPriority,
};
use prompt_vault::manager::{
    CreateRequest, OutputFormat, PrincipleRefInput, PromptManager, RoleInput, SearchLogic,
    SearchRequest, VersionFilter,
};
use prompt_vault::model::{RoleType, TemplateVarDef, Version, VersionType};
use prompt_vault::queue::UpdateQueue;
use prompt_vault::registry;
use prompt_vault::store::Store;
use prompt_vault::store::embedded::EmbeddedStore;
use prompt_vault::store::hosted::HostedStore;
use prompt_vault::sync::SyncEngine;
use prompt_vault::time_sync::PreciseTime;
use prompt_vault::vector::{EmbeddedVectorIndex, HostedVectorIndex, NoopVectorIndex, VectorIndex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "prompt-vault", about = "Prompt Version Store and Retrieval Engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a prompt, or the next version of an existing one.
    Create {
        name: String,
        #[arg(long)]
        description: String,
        /// Repeatable `role_type:content`, e.g. `system:You are helpful.`
        #[arg(long = "role", required = true)]
        roles: Vec<String>,
        #[arg(long, default_value = "minor")]
        version_type: String,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long)]
        client_type: Option<String>,
        /// Repeatable `principle_name:ref_version`, e.g. `safety:latest`.
        #[arg(long = "principle")]
        principles: Vec<String>,
        #[arg(long)]
        change_log: Option<String>,
    },
    /// Enqueue the next version of an existing prompt under optimistic
    /// locking; same fields as `create` plus the expected version number.
    Update {
        name: String,
        #[arg(long)]
        expected_version_number: i64,
        #[arg(long)]
        description: String,
        #[arg(long = "role", required = true)]
        roles: Vec<String>,
        #[arg(long, default_value = "minor")]
        version_type: String,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },
    /// Render a prompt to its openai/formatted/both shape.
    Get {
        name: String,
        #[arg(long)]
        version: Option<String>,
        #[arg(long, default_value = "openai")]
        format: String,
        /// Repeatable `key=value` template variable overrides.
        #[arg(long = "var")]
        vars: Vec<String>,
    },
    /// Deactivate a version (or, if omitted, every active version but the
    /// best remaining candidate).
    Delete {
        name: String,
        #[arg(long)]
        version: Option<String>,
    },
    /// Promote a version to active + latest.
    Activate { name: String, version: String },
    /// Hybrid semantic + tag search.
    Search {
        #[arg(long)]
        query: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long, default_value = "or")]
        logic: String,
        #[arg(long, default_value = "latest")]
        version_filter: String,
        #[arg(long)]
        specific_version: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Register a `PrinciplePrompt` version.
    CreatePrinciple {
        name: String,
        version: String,
        content: String,
        #[arg(long, default_value_t = true)]
        is_active: bool,
        #[arg(long, default_value_t = true)]
        is_latest: bool,
    },
    /// Run one pull-then-push reconciliation pass against `remote_store`.
    Sync,
    /// Report required-index coverage for the embedded backend's tables.
    CheckIndexes,
}

fn parse_role(spec: &str) -> Result<RoleInput> {
    let (kind, content) = spec
        .split_once(':')
        .context("role must be formatted as role_type:content")?;
    let role_type = match kind {
        "system" => RoleType::System,
        "user" => RoleType::User,
        "assistant" => RoleType::Assistant,
        "principle" => RoleType::Principle,
        other => bail!("unknown role_type '{other}'"),
    };
    Ok(RoleInput {
        role_type,
        content: content.to_string(),
        order: 0,
        template_variables: None::<HashMap<String, TemplateVarDef>>,
    })
}

fn parse_principle_ref(spec: &str) -> Result<PrincipleRefInput> {
    let (name, version) = spec
        .split_once(':')
        .context("principle must be formatted as name:ref_version")?;
    Ok(PrincipleRefInput {
        principle_name: name.to_string(),
        ref_version: version.to_string(),
    })
}

fn parse_version_type(s: &str) -> Result<VersionType> {
    match s {
        "major" => Ok(VersionType::Major),
        "minor" => Ok(VersionType::Minor),
        other => bail!("version_type must be 'major' or 'minor', got '{other}'"),
    }
}

fn parse_output_format(s: &str) -> Result<OutputFormat> {
    match s {
        "openai" => Ok(OutputFormat::Openai),
        "formatted" => Ok(OutputFormat::Formatted),
        "both" => Ok(OutputFormat::Both),
        other => bail!("format must be one of openai|formatted|both, got '{other}'"),
    }
}

fn parse_search_logic(s: &str) -> Result<SearchLogic> {
    match s {
        "and" | "AND" => Ok(SearchLogic::And),
        "or" | "OR" => Ok(SearchLogic::Or),
        other => bail!("logic must be 'and' or 'or', got '{other}'"),
    }
}

fn parse_version_filter(kind: &str, specific: Option<&str>) -> Result<VersionFilter> {
    match kind {
        "latest" => Ok(VersionFilter::Latest),
        "all" => Ok(VersionFilter::All),
        "specific" => {
            let raw = specific.context("version_filter=specific requires --specific-version")?;
            let version = Version::parse(raw).context("specific_version must be MAJOR.MINOR")?;
            Ok(VersionFilter::Specific(version))
        }
        other => bail!("version_filter must be latest|all|specific, got '{other}'"),
    }
}

/// Builds the `Store` + `VectorIndex` pair for one side of the
/// configuration (local or, when present, `remote_store`), sharing the
/// underlying connection/pool between the two the way
/// `EmbeddedVectorIndex`/`HostedVectorIndex` are documented to.
async fn build_store_and_index(
    store_config: &prompt_vault::config::StoreConfig,
    runtime: &prompt_vault::config::RuntimeConfig,
) -> Result<(Arc<dyn Store>, Arc<dyn VectorIndex>)> {
    let mut cfg = Config::default();
    cfg.store = store_config.clone();
    cfg.runtime = runtime.clone();

    match store_config.kind {
        StoreKind::Embedded => {
            let store = EmbeddedStore::connect(&cfg)
                .await
                .context("connecting embedded store")?;
            let db = store.db();
            Ok((Arc::new(store), Arc::new(EmbeddedVectorIndex::new(db))))
        }
        StoreKind::Hosted => {
            let store = HostedStore::connect(&cfg)
                .await
                .context("connecting hosted store")?;
            let pool = Arc::new(store.pool());
            Ok((Arc::new(store), Arc::new(HostedVectorIndex::new(pool))))
        }
    }
}

fn build_embedder(
    config: &Config,
) -> Result<(Arc<dyn Embedder>, Option<Arc<dyn Embedder>>, ProviderPriority)> {
    let local: Arc<dyn Embedder> = Arc::new(LocalEmbedder::new(
        config
            .vector
            .local_model_id
            .clone()
            .unwrap_or_else(|| "BAAI/bge-small-en-v1.5".to_string()),
        config.vector.dimension.unwrap_or(1536),
    ));
    let remote: Option<Arc<dyn Embedder>> = match &config.vector.embedding_api_key {
        Some(key) if !key.is_empty() => Some(Arc::new(OpenAIEmbedder::new(
            key.clone(),
            config.vector.embedding_model.clone(),
            config.vector.dimension,
            config.runtime.embed_retries,
        )?)),
        _ => None,
    };
    let priority = match config.vector.provider_priority {
        ProviderPriorityConfig::RemoteFirst => ProviderPriority::RemoteFirst,
        ProviderPriorityConfig::LocalFirst => ProviderPriority::LocalFirst,
    };
    Ok((local, remote, priority))
}

/// Assembles a `PromptManager` from `Config`, honoring `vector.enabled` by
/// swapping in no-op stand-ins (§6: disabled vector search degrades to
/// empty results, never an error) instead of branching inside the
/// orchestrator.
async fn build_manager(config: &Config) -> Result<PromptManager> {
    let clock = PreciseTime::new();
    let monitor_handle = clock.spawn_monitor(
        config.runtime.time_sync_url.clone(),
        Duration::from_secs(config.runtime.time_sync_interval_secs),
    );
    registry::register_job("time-sync-monitor".to_string(), monitor_handle);

    let (store, vector_index): (Arc<dyn Store>, Arc<dyn VectorIndex>) = if config.vector.enabled {
        build_store_and_index(&config.store, &config.runtime).await?
    } else {
        let (store, _unused) = build_store_and_index(&config.store, &config.runtime).await?;
        (store, Arc::new(NoopVectorIndex))
    };

    let embeddings = if config.vector.enabled {
        let (local, remote, priority) = build_embedder(config)?;
        EmbeddingProvider::new(
            remote,
            local,
            priority,
            config.vector.dimension,
            config.vector.embedding_model.clone(),
            if config.vector.result_cache_enabled {
                config.vector.result_cache_capacity
            } else {
                0
            },
            Duration::from_secs(config.vector.result_cache_ttl_seconds),
        )
    } else {
        let dim = config.vector.dimension.unwrap_or(1536);
        EmbeddingProvider::new(
            None,
            Arc::new(NullEmbedder::new(dim)),
            ProviderPriority::LocalFirst,
            Some(dim),
            "disabled".to_string(),
            0,
            Duration::from_secs(60),
        )
    };
    let embeddings = Arc::new(embeddings);

    let dimension = embeddings.dimension().await;
    vector_index
        .ensure_index(dimension)
        .await
        .context("initializing vector index")?;

    let cache = if !config.cache.enabled {
        Arc::new(Cache::l1_only(
            config.cache.max_capacity,
            Duration::from_secs(config.cache.ttl_seconds),
        ))
    } else {
        match config.cache.kind {
            CacheKind::Memory => {
                let cache = Arc::new(
                    Cache::connect(
                        &config.runtime.redis_url,
                        config.cache.max_capacity,
                        Duration::from_secs(config.cache.ttl_seconds),
                        config.cache.ttl_seconds.max(60),
                        config.cache.invalidation_channel.clone(),
                        true,
                    )
                    .await,
                );
                cache.spawn_invalidation_listener(&config.runtime.redis_url);
                cache
            }
            CacheKind::Filesystem => {
                warn!(
                    "cache.type=filesystem is not backed by a dedicated store yet, running L1-only"
                );
                Arc::new(Cache::l1_only(
                    config.cache.max_capacity,
                    Duration::from_secs(config.cache.ttl_seconds),
                ))
            }
        }
    };

    let queue = UpdateQueue::spawn(config.concurrency.queue_max_size, "update-queue");

    Ok(PromptManager::new(
        store,
        vector_index,
        embeddings,
        cache,
        queue,
        clock,
    ))
}

async fn maybe_build_sync_engine(config: &Config) -> Result<Option<SyncEngine>> {
    let Some(remote_config) = &config.remote_store else {
        return Ok(None);
    };
    let (local, _) = build_store_and_index(&config.store, &config.runtime).await?;
    let (remote, _) = build_store_and_index(remote_config, &config.runtime).await?;
    Ok(Some(SyncEngine::new(local, remote, PreciseTime::new())))
}

#[tokio::main]
async fn main() -> Result<()> {
    prompt_vault::load_env();
    let config = Config::load().context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(
            config.runtime.log_level.clone(),
        ))
        .init();

    let cli = Cli::parse();

    if matches!(cli.command, Command::Sync) {
        let Some(engine) = maybe_build_sync_engine(&config).await? else {
            bail!("sync requires both `store` and `remote_store` to be configured");
        };
        let report = engine.sync().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if matches!(cli.command, Command::CheckIndexes) {
        if config.store.kind != StoreKind::Embedded {
            bail!("check-indexes only applies to the embedded (SurrealDB) backend");
        }
        let store = EmbeddedStore::connect(&config)
            .await
            .context("connecting embedded store")?;
        let report = store.check_indexes().await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let manager = build_manager(&config).await?;
    info!("prompt-vault manager ready");

    match cli.command {
        Command::Sync => unreachable!("handled above"),
        Command::CheckIndexes => unreachable!("handled above"),
        Command::Create {
            name,
            description,
            roles,
            version_type,
            tags,
            client_type,
            principles,
            change_log,
        } => {
            let request = CreateRequest {
                name,
                description,
                roles: roles.iter().map(|r| parse_role(r)).collect::<Result<_>>()?,
                version_type: parse_version_type(&version_type)?,
                tags: if tags.is_empty() { None } else { Some(tags) },
                llm_config: None,
                client_type,
                principle_refs: if principles.is_empty() {
                    None
                } else {
                    Some(
                        principles
                            .iter()
                            .map(|p| parse_principle_ref(p))
                            .collect::<Result<_>>()?,
                    )
                },
                change_log,
            };
            let outcome = manager.create(request).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Update {
            name,
            expected_version_number,
            description,
            roles,
            version_type,
            tags,
        } => {
            let request = CreateRequest {
                name: name.clone(),
                description,
                roles: roles.iter().map(|r| parse_role(r)).collect::<Result<_>>()?,
                version_type: parse_version_type(&version_type)?,
                tags: if tags.is_empty() { None } else { Some(tags) },
                llm_config: None,
                client_type: None,
                principle_refs: None,
                change_log: None,
            };
            let outcome = manager
                .update(name, expected_version_number, request)
                .await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Get {
            name,
            version,
            format,
            vars,
        } => {
            let parsed_vars: HashMap<String, String> = vars
                .iter()
                .filter_map(|kv| kv.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
                .collect();
            let output = manager
                .get(
                    &name,
                    version.as_deref(),
                    parse_output_format(&format)?,
                    if parsed_vars.is_empty() {
                        None
                    } else {
                        Some(parsed_vars)
                    },
                    None,
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Delete { name, version } => {
            let version = match version.as_deref() {
                Some(v) => Some(Version::parse(v).context("version must be MAJOR.MINOR")?),
                None => None,
            };
            manager.delete(&name, version).await?;
            println!("{{\"ok\": true}}");
        }
        Command::Activate { name, version } => {
            let version = Version::parse(&version).context("version must be MAJOR.MINOR")?;
            manager.activate(&name, version).await?;
            println!("{{\"ok\": true}}");
        }
        Command::Search {
            query,
            tags,
            logic,
            version_filter,
            specific_version,
            limit,
            offset,
        } => {
            let request = SearchRequest {
                query,
                tags: if tags.is_empty() { None } else { Some(tags) },
                logic: parse_search_logic(&logic)?,
                version_filter: parse_version_filter(&version_filter, specific_version.as_deref())?,
                limit,
                offset,
            };
            let result = manager.search(request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::CreatePrinciple {
            name,
            version,
            content,
            is_active,
            is_latest,
        } => {
            let version = Version::parse(&version).context("version must be MAJOR.MINOR")?;
            let summary = manager
                .create_principle(&name, version, &content, is_active, is_latest)
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
