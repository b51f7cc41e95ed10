//! Hosted `Store` realization over a managed Postgres + `pgvector`
//! instance, per SPEC_FULL.md §4.1. Shares the exact `Store`/`Transaction`
//! contract that [`super::embedded`] implements so `PromptManager` never
//! knows which backend it is talking to.
//!
//! Unlike the embedded realization's buffer-then-submit SurrealQL block,
//! Postgres gives us a real session-scoped transaction: `begin()` checks
//! out a pooled connection, issues `BEGIN`, and every `Transaction` method
//! runs its statement immediately on that same connection until
//! `commit`/`rollback` closes it out.

use super::{
    LatestVersionInfo, NewClientMapping, NewPrincipleRef, NewVersion, PromptRootUpdate, Store,
    Transaction, VersionSummary, conflict, not_found,
};
use crate::config::Config;
use crate::error::{PromptError, Result, StoreError};
use crate::model::{
    DefaultPrincipleEntry, FullVersion, LlmConfig, Prompt, PromptRole, ResolvedPrinciple,
    RoleType, TemplateVarDef, Version,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config as PoolConfig, Object, Pool, Runtime};
use std::collections::HashMap;
use tokio_postgres::NoTls;
use tokio_postgres::Row;
use uuid::Uuid;

pub struct HostedStore {
    pool: Pool,
}

impl HostedStore {
    /// Builds a connection pool from `store.connection_string` and runs
    /// the DDL for the logical schema in SPEC_FULL.md §6, translated to
    /// Postgres types (the principle/client link tables store
    /// `principle_name`/`ref_version`/`client_name` directly rather than
    /// through a surrogate id, matching what the orchestrator actually
    /// passes across the `Store` trait).
    pub async fn connect(config: &Config) -> Result<Self> {
        let conn_str = config.store.connection_string.as_deref().ok_or_else(|| {
            StoreError::Transient("hosted store requires database.connection_string".into())
        })?;

        let mut pool_config = PoolConfig::new();
        pool_config.url = Some(conn_str.to_string());
        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Transient(format!("failed to build postgres pool: {e}")))?;

        let store = HostedStore { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn client(&self) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Transient(format!("postgres pool exhausted: {e}")).into())
    }

    /// Hands out a clone of the pool for [`crate::vector::HostedVectorIndex`]
    /// to share — `deadpool_postgres::Pool` is an `Arc` handle internally, so
    /// this is cheap.
    pub fn pool(&self) -> Pool {
        self.pool.clone()
    }

    async fn initialize_schema(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS prompts (
                    id UUID PRIMARY KEY,
                    name TEXT UNIQUE NOT NULL,
                    content TEXT NOT NULL DEFAULT '',
                    sync_hash TEXT NOT NULL DEFAULT '',
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL,
                    is_deleted BOOLEAN NOT NULL DEFAULT false
                );
                CREATE TABLE IF NOT EXISTS prompt_versions (
                    id UUID PRIMARY KEY,
                    prompt_id UUID NOT NULL REFERENCES prompts(id),
                    version TEXT NOT NULL,
                    version_number BIGINT NOT NULL,
                    description TEXT NOT NULL,
                    is_active BOOLEAN NOT NULL,
                    is_latest BOOLEAN NOT NULL,
                    change_log TEXT,
                    created_at TIMESTAMPTZ NOT NULL,
                    UNIQUE (prompt_id, version)
                );
                CREATE TABLE IF NOT EXISTS prompt_roles (
                    id UUID PRIMARY KEY,
                    version_id UUID NOT NULL REFERENCES prompt_versions(id),
                    role_type TEXT NOT NULL,
                    content TEXT NOT NULL,
                    "order" INTEGER NOT NULL,
                    template_variables TEXT
                );
                CREATE TABLE IF NOT EXISTS llm_configs (
                    version_id UUID PRIMARY KEY REFERENCES prompt_versions(id),
                    model TEXT,
                    temperature REAL,
                    max_tokens INTEGER,
                    top_p REAL,
                    top_k INTEGER,
                    frequency_penalty REAL,
                    presence_penalty REAL,
                    stop_sequences TEXT[],
                    other_params TEXT
                );
                CREATE TABLE IF NOT EXISTS tags (
                    id UUID PRIMARY KEY,
                    name TEXT UNIQUE NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL
                );
                CREATE TABLE IF NOT EXISTS prompt_tags (
                    version_id UUID NOT NULL REFERENCES prompt_versions(id),
                    tag_id UUID NOT NULL REFERENCES tags(id),
                    PRIMARY KEY (version_id, tag_id)
                );
                CREATE TABLE IF NOT EXISTS principle_prompts (
                    id UUID PRIMARY KEY,
                    name TEXT NOT NULL,
                    version TEXT NOT NULL,
                    content TEXT NOT NULL,
                    is_active BOOLEAN NOT NULL,
                    is_latest BOOLEAN NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL,
                    UNIQUE (name, version)
                );
                CREATE TABLE IF NOT EXISTS version_principle_refs (
                    version_id UUID NOT NULL REFERENCES prompt_versions(id),
                    principle_name TEXT NOT NULL,
                    ref_version TEXT NOT NULL,
                    "order" INTEGER NOT NULL,
                    PRIMARY KEY (version_id, principle_name)
                );
                CREATE TABLE IF NOT EXISTS llm_clients (
                    id UUID PRIMARY KEY,
                    name TEXT UNIQUE NOT NULL,
                    default_principles TEXT NOT NULL DEFAULT '[]'
                );
                CREATE TABLE IF NOT EXISTS version_client_mapping (
                    version_id UUID NOT NULL REFERENCES prompt_versions(id),
                    client_id UUID NOT NULL REFERENCES llm_clients(id),
                    PRIMARY KEY (version_id, client_id)
                );
                CREATE TABLE IF NOT EXISTS app_config (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                CREATE EXTENSION IF NOT EXISTS vector;
                CREATE TABLE IF NOT EXISTS vector_records (
                    version_id UUID PRIMARY KEY REFERENCES prompt_versions(id),
                    vector vector NOT NULL
                );
                CREATE OR REPLACE FUNCTION match_prompt_versions(query vector, threshold real, match_count int)
                RETURNS TABLE (version_id uuid, similarity real)
                LANGUAGE sql STABLE
                AS $func$
                    SELECT vr.version_id, 1 - (vr.vector <=> query) AS similarity
                    FROM vector_records vr
                    WHERE 1 - (vr.vector <=> query) > threshold
                    ORDER BY vr.vector <=> query ASC
                    LIMIT match_count
                $func$;
                "#,
            )
            .await
            .map_err(|e| StoreError::Transient(format!("hosted schema init failed: {e}")))?;
        Ok(())
    }
}

fn row_to_prompt(row: &Row) -> Prompt {
    Prompt {
        id: row.get("id"),
        name: row.get("name"),
        content: row.get("content"),
        sync_hash: row.get("sync_hash"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        is_deleted: row.get("is_deleted"),
    }
}

fn row_to_version_summary(row: &Row) -> VersionSummary {
    let version_str: String = row.get("version");
    VersionSummary {
        version_id: row.get("id"),
        version: Version::parse(&version_str).unwrap_or(Version::INITIAL),
        version_number: row.get("version_number"),
        description: row.get("description"),
        is_active: row.get("is_active"),
        is_latest: row.get("is_latest"),
        created_at: row.get("created_at"),
    }
}

async fn load_tags_for(client: &Object, version_id: Uuid) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT t.name FROM prompt_tags pt JOIN tags t ON t.id = pt.tag_id WHERE pt.version_id = $1",
            &[&version_id],
        )
        .await?;
    Ok(rows.iter().map(|r| r.get("name")).collect())
}

#[async_trait]
impl Store for HostedStore {
    async fn get_prompt_by_name(&self, name: &str) -> Result<Option<Prompt>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT * FROM prompts WHERE name = $1 AND is_deleted = false LIMIT 1",
                &[&name],
            )
            .await?;
        Ok(rows.first().map(row_to_prompt))
    }

    async fn get_latest_version_info(&self, prompt_id: Uuid) -> Result<Option<LatestVersionInfo>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT id, version, version_number FROM prompt_versions \
                 WHERE prompt_id = $1 AND is_latest = true LIMIT 1",
                &[&prompt_id],
            )
            .await?;
        Ok(rows.first().map(|r| {
            let version_str: String = r.get("version");
            LatestVersionInfo {
                version_id: r.get("id"),
                version: Version::parse(&version_str).unwrap_or(Version::INITIAL),
                version_number: r.get("version_number"),
            }
        }))
    }

    async fn list_versions_of(&self, prompt_id: Uuid) -> Result<Vec<VersionSummary>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT * FROM prompt_versions WHERE prompt_id = $1 ORDER BY version_number ASC",
                &[&prompt_id],
            )
            .await?;
        Ok(rows.iter().map(row_to_version_summary).collect())
    }

    async fn load_full_version(
        &self,
        name: &str,
        version_or_latest: &str,
    ) -> Result<Option<FullVersion>> {
        let client = self.client().await?;
        let Some(prompt) = self.get_prompt_by_name(name).await? else {
            return Ok(None);
        };

        let version_row = if version_or_latest == "latest" {
            client
                .query_opt(
                    "SELECT * FROM prompt_versions WHERE prompt_id = $1 AND is_latest = true LIMIT 1",
                    &[&prompt.id],
                )
                .await?
        } else {
            client
                .query_opt(
                    "SELECT * FROM prompt_versions WHERE prompt_id = $1 AND version = $2 AND is_active = true LIMIT 1",
                    &[&prompt.id, &version_or_latest],
                )
                .await?
        };
        let Some(version_row) = version_row else {
            return Ok(None);
        };
        let version_id: Uuid = version_row.get("id");

        let role_rows = client
            .query(
                "SELECT * FROM prompt_roles WHERE version_id = $1 ORDER BY \"order\" ASC",
                &[&version_id],
            )
            .await?;
        let roles: Vec<PromptRole> = role_rows
            .iter()
            .map(|r| {
                let role_type_str: String = r.get("role_type");
                let vars_json: Option<String> = r.get("template_variables");
                PromptRole {
                    version_id,
                    role_type: parse_role_type(&role_type_str),
                    content: r.get("content"),
                    order: r.get("order"),
                    template_variables: vars_json
                        .and_then(|s| serde_json::from_str::<HashMap<String, TemplateVarDef>>(&s).ok()),
                }
            })
            .collect();

        let ref_rows = client
            .query(
                "SELECT * FROM version_principle_refs WHERE version_id = $1 ORDER BY \"order\" ASC",
                &[&version_id],
            )
            .await?;
        let mut principles = Vec::with_capacity(ref_rows.len());
        for r in &ref_rows {
            let principle_name: String = r.get("principle_name");
            let ref_version: String = r.get("ref_version");
            let order: i32 = r.get("order");
            let content_row = if ref_version == "latest" {
                client
                    .query_opt(
                        "SELECT content FROM principle_prompts WHERE name = $1 AND is_latest = true LIMIT 1",
                        &[&principle_name],
                    )
                    .await?
            } else {
                client
                    .query_opt(
                        "SELECT content FROM principle_prompts WHERE name = $1 AND version = $2 LIMIT 1",
                        &[&principle_name, &ref_version],
                    )
                    .await?
            };
            let Some(content_row) = content_row else {
                return Err(not_found(format!(
                    "principle '{principle_name}' version '{ref_version}' not found"
                )));
            };
            principles.push(ResolvedPrinciple {
                order,
                content: content_row.get("content"),
            });
        }

        let config_row = client
            .query_opt("SELECT * FROM llm_configs WHERE version_id = $1 LIMIT 1", &[&version_id])
            .await?;
        let llm_config = config_row
            .map(|r| {
                let other_params: Option<String> = r.get("other_params");
                LlmConfig {
                    model: r.get("model"),
                    temperature: r.get("temperature"),
                    max_tokens: r.get::<_, Option<i32>>("max_tokens").map(|v| v as u32),
                    top_p: r.get("top_p"),
                    top_k: r.get::<_, Option<i32>>("top_k").map(|v| v as u32),
                    frequency_penalty: r.get("frequency_penalty"),
                    presence_penalty: r.get("presence_penalty"),
                    stop_sequences: r.get("stop_sequences"),
                    other_params: other_params.and_then(|s| serde_json::from_str(&s).ok()),
                }
            })
            .unwrap_or_default();

        let tags = load_tags_for(&client, version_id).await?;

        Ok(Some(FullVersion {
            prompt,
            version: crate::model::PromptVersion {
                id: version_id,
                prompt_id: version_row.get("prompt_id"),
                version: Version::parse(&version_row.get::<_, String>("version"))
                    .unwrap_or(Version::INITIAL),
                version_number: version_row.get("version_number"),
                description: version_row.get("description"),
                is_active: version_row.get("is_active"),
                is_latest: version_row.get("is_latest"),
                change_log: version_row.get("change_log"),
                created_at: version_row.get("created_at"),
            },
            roles,
            principles,
            llm_config,
            tags,
        }))
    }

    async fn search_versions_with_all_tags(&self, tags: &[String]) -> Result<Vec<Uuid>> {
        if tags.is_empty() {
            return Ok(vec![]);
        }
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT pt.version_id FROM prompt_tags pt JOIN tags t ON t.id = pt.tag_id \
                 WHERE t.name = ANY($1) \
                 GROUP BY pt.version_id HAVING COUNT(DISTINCT t.name) = $2",
                &[&tags, &(tags.len() as i64)],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get("version_id")).collect())
    }

    async fn search_versions_by_keyword(&self, text: &str) -> Result<Vec<Uuid>> {
        let client = self.client().await?;
        let needle = format!("%{}%", text.to_lowercase());
        let rows = client
            .query(
                "SELECT pv.id FROM prompt_versions pv JOIN prompts p ON p.id = pv.prompt_id \
                 WHERE lower(p.name) LIKE $1 OR lower(pv.description) LIKE $1",
                &[&needle],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn list_all_latest_versions(&self) -> Result<Vec<(Prompt, VersionSummary, Vec<String>)>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT pv.*, p.name AS p_name, p.content AS p_content, p.sync_hash AS p_sync_hash, \
                        p.created_at AS p_created_at, p.updated_at AS p_updated_at, p.is_deleted AS p_is_deleted \
                 FROM prompt_versions pv JOIN prompts p ON p.id = pv.prompt_id \
                 WHERE pv.is_latest = true AND pv.is_active = true \
                 ORDER BY pv.created_at DESC",
                &[],
            )
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in &rows {
            let prompt = Prompt {
                id: r.get("prompt_id"),
                name: r.get("p_name"),
                content: r.get("p_content"),
                sync_hash: r.get("p_sync_hash"),
                created_at: r.get("p_created_at"),
                updated_at: r.get("p_updated_at"),
                is_deleted: r.get("p_is_deleted"),
            };
            let version_id: Uuid = r.get("id");
            let tags = load_tags_for(&client, version_id).await?;
            out.push((prompt, row_to_version_summary(r), tags));
        }
        Ok(out)
    }

    async fn find_version(&self, name: &str, version: Version) -> Result<Option<VersionSummary>> {
        let client = self.client().await?;
        let Some(prompt) = self.get_prompt_by_name(name).await? else {
            return Ok(None);
        };
        let version_str = version.to_string();
        let rows = client
            .query(
                "SELECT * FROM prompt_versions WHERE prompt_id = $1 AND version = $2 LIMIT 1",
                &[&prompt.id, &version_str],
            )
            .await?;
        Ok(rows.first().map(row_to_version_summary))
    }

    async fn load_version_rows(&self, version_ids: &[Uuid]) -> Result<Vec<(Prompt, VersionSummary, Vec<String>)>> {
        if version_ids.is_empty() {
            return Ok(vec![]);
        }
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT pv.*, p.name AS p_name, p.content AS p_content, p.sync_hash AS p_sync_hash, \
                        p.created_at AS p_created_at, p.updated_at AS p_updated_at, p.is_deleted AS p_is_deleted \
                 FROM prompt_versions pv JOIN prompts p ON p.id = pv.prompt_id \
                 WHERE pv.id = ANY($1)",
                &[&version_ids],
            )
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in &rows {
            let prompt = Prompt {
                id: r.get("prompt_id"),
                name: r.get("p_name"),
                content: r.get("p_content"),
                sync_hash: r.get("p_sync_hash"),
                created_at: r.get("p_created_at"),
                updated_at: r.get("p_updated_at"),
                is_deleted: r.get("p_is_deleted"),
            };
            let version_id: Uuid = r.get("id");
            let tags = load_tags_for(&client, version_id).await?;
            out.push((prompt, row_to_version_summary(r), tags));
        }
        Ok(out)
    }

    async fn get_app_config(&self, key: &str) -> Result<Option<String>> {
        let client = self.client().await?;
        let rows = client
            .query("SELECT value FROM app_config WHERE key = $1", &[&key])
            .await?;
        Ok(rows.first().map(|r| r.get("value")))
    }

    async fn list_prompts_updated_after(&self, since: DateTime<Utc>) -> Result<Vec<Prompt>> {
        let client = self.client().await?;
        let rows = client
            .query("SELECT * FROM prompts WHERE updated_at > $1", &[&since])
            .await?;
        Ok(rows.iter().map(row_to_prompt).collect())
    }

    async fn upsert_prompt_verbatim(&self, prompt: &Prompt) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO prompts (id, name, content, sync_hash, created_at, updated_at, is_deleted) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, content = EXCLUDED.content, \
                 sync_hash = EXCLUDED.sync_hash, updated_at = EXCLUDED.updated_at, is_deleted = EXCLUDED.is_deleted",
                &[
                    &prompt.id,
                    &prompt.name,
                    &prompt.content,
                    &prompt.sync_hash,
                    &prompt.created_at,
                    &prompt.updated_at,
                    &prompt.is_deleted,
                ],
            )
            .await?;
        Ok(())
    }

    async fn set_app_config(&self, key: &str, value: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO app_config (key, value) VALUES ($1, $2) \
                 ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
                &[&key, &value],
            )
            .await?;
        Ok(())
    }

    async fn resolve_principle_version(&self, name: &str, ref_version: &str) -> Result<Option<Version>> {
        let client = self.client().await?;
        let row = if ref_version == "latest" {
            client
                .query_opt(
                    "SELECT version FROM principle_prompts WHERE name = $1 AND is_latest = true LIMIT 1",
                    &[&name],
                )
                .await?
        } else {
            client
                .query_opt(
                    "SELECT version FROM principle_prompts WHERE name = $1 AND version = $2 LIMIT 1",
                    &[&name, &ref_version],
                )
                .await?
        };
        Ok(row.and_then(|r| Version::parse(&r.get::<_, String>("version"))))
    }

    async fn create_principle(
        &self,
        name: &str,
        version: Version,
        content: &str,
        is_active: bool,
        is_latest: bool,
        created_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let client = self.client().await?;
        let id = Uuid::new_v4();
        if is_latest {
            client
                .execute(
                    "UPDATE principle_prompts SET is_latest = false WHERE name = $1",
                    &[&name],
                )
                .await?;
        }
        let version_str = version.to_string();
        client
            .execute(
                "INSERT INTO principle_prompts (id, name, version, content, is_active, is_latest, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[&id, &name, &version_str, &content, &is_active, &is_latest, &created_at],
            )
            .await
            .map_err(|e| conflict(format!("principle_prompts insert failed: {e}")))?;
        Ok(id)
    }

    async fn get_client_defaults(&self, name: &str) -> Result<Vec<DefaultPrincipleEntry>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT default_principles FROM llm_clients WHERE name = $1 LIMIT 1",
                &[&name],
            )
            .await?;
        Ok(row
            .and_then(|r| serde_json::from_str(&r.get::<_, String>("default_principles")).ok())
            .unwrap_or_default())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let client = self.client().await?;
        client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| StoreError::Transient(format!("failed to start postgres transaction: {e}")))?;
        Ok(Box::new(HostedTransaction {
            conn: Some(client),
        }))
    }
}

fn parse_role_type(s: &str) -> RoleType {
    match s {
        "system" => RoleType::System,
        "user" => RoleType::User,
        "assistant" => RoleType::Assistant,
        _ => RoleType::Principle,
    }
}

fn role_type_str(role_type: RoleType) -> &'static str {
    match role_type {
        RoleType::System => "system",
        RoleType::User => "user",
        RoleType::Assistant => "assistant",
        RoleType::Principle => "principle",
    }
}

/// One real Postgres transaction: the pooled connection stays checked out
/// (wrapped in `Option` so `commit`/`rollback` can consume it) from `BEGIN`
/// through `COMMIT`/`ROLLBACK`.
pub struct HostedTransaction {
    conn: Option<Object>,
}

impl HostedTransaction {
    fn conn(&self) -> &Object {
        self.conn.as_ref().expect("transaction used after commit/rollback")
    }
}

#[async_trait]
impl Transaction for HostedTransaction {
    async fn insert_prompt(&mut self, name: &str, created_at: DateTime<Utc>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.conn()
            .execute(
                "INSERT INTO prompts (id, name, content, sync_hash, created_at, updated_at, is_deleted) \
                 VALUES ($1, $2, '', '', $3, $3, false)",
                &[&id, &name, &created_at],
            )
            .await
            .map_err(|e| conflict(format!("prompts insert failed: {e}")))?;
        Ok(id)
    }

    async fn insert_version(&mut self, version: &NewVersion) -> Result<()> {
        let version_str = version.version.to_string();
        self.conn()
            .execute(
                "INSERT INTO prompt_versions \
                 (id, prompt_id, version, version_number, description, is_active, is_latest, change_log, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
                &[
                    &version.id,
                    &version.prompt_id,
                    &version_str,
                    &version.version_number,
                    &version.description,
                    &version.is_active,
                    &version.is_latest,
                    &version.change_log,
                    &version.created_at,
                ],
            )
            .await
            .map_err(|e| conflict(format!("prompt_versions insert failed: {e}")))?;
        Ok(())
    }

    async fn insert_roles(&mut self, roles: &[PromptRole]) -> Result<()> {
        for role in roles {
            let id = Uuid::new_v4();
            let vars_json = role
                .template_variables
                .as_ref()
                .map(|v| serde_json::to_string(v).unwrap_or_default());
            self.conn()
                .execute(
                    "INSERT INTO prompt_roles (id, version_id, role_type, content, \"order\", template_variables) \
                     VALUES ($1, $2, $3, $4, $5, $6)",
                    &[
                        &id,
                        &role.version_id,
                        &role_type_str(role.role_type),
                        &role.content,
                        &role.order,
                        &vars_json,
                    ],
                )
                .await?;
        }
        Ok(())
    }

    async fn insert_llm_config(&mut self, version_id: Uuid, config: &LlmConfig) -> Result<()> {
        let top_k = config.top_k.map(|v| v as i32);
        let other_params = config
            .other_params
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_default());
        self.conn()
            .execute(
                "INSERT INTO llm_configs \
                 (version_id, model, temperature, max_tokens, top_p, top_k, frequency_penalty, presence_penalty, stop_sequences, other_params) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                &[
                    &version_id,
                    &config.model,
                    &config.temperature,
                    &config.max_tokens.map(|v| v as i32),
                    &config.top_p,
                    &top_k,
                    &config.frequency_penalty,
                    &config.presence_penalty,
                    &config.stop_sequences,
                    &other_params,
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_tag(&mut self, name: &str) -> Result<Uuid> {
        if let Some(row) = self
            .conn()
            .query_opt("SELECT id FROM tags WHERE name = $1", &[&name])
            .await?
        {
            return Ok(row.get("id"));
        }
        let id = Uuid::new_v4();
        self.conn()
            .execute(
                "INSERT INTO tags (id, name, created_at) VALUES ($1, $2, now())",
                &[&id, &name],
            )
            .await?;
        Ok(id)
    }

    async fn insert_prompt_tag(&mut self, version_id: Uuid, tag_id: Uuid) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO prompt_tags (version_id, tag_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                &[&version_id, &tag_id],
            )
            .await?;
        Ok(())
    }

    async fn insert_principle_ref(&mut self, reference: &NewPrincipleRef) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO version_principle_refs (version_id, principle_name, ref_version, \"order\") \
                 VALUES ($1, $2, $3, $4)",
                &[
                    &reference.version_id,
                    &reference.principle_name,
                    &reference.ref_version,
                    &reference.order,
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_client(&mut self, name: &str) -> Result<Uuid> {
        if let Some(row) = self
            .conn()
            .query_opt("SELECT id FROM llm_clients WHERE name = $1", &[&name])
            .await?
        {
            return Ok(row.get("id"));
        }
        let id = Uuid::new_v4();
        self.conn()
            .execute(
                "INSERT INTO llm_clients (id, name, default_principles) VALUES ($1, $2, '[]')",
                &[&id, &name],
            )
            .await?;
        Ok(id)
    }

    async fn insert_client_mapping(&mut self, mapping: &NewClientMapping) -> Result<()> {
        let client_id = self.upsert_client(&mapping.client_name).await?;
        self.conn()
            .execute(
                "INSERT INTO version_client_mapping (version_id, client_id) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
                &[&mapping.version_id, &client_id],
            )
            .await?;
        Ok(())
    }

    async fn clear_latest_flag(&mut self, prompt_id: Uuid, except_version_id: Uuid) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE prompt_versions SET is_latest = false WHERE prompt_id = $1 AND id != $2",
                &[&prompt_id, &except_version_id],
            )
            .await?;
        Ok(())
    }

    async fn set_version_flags(&mut self, version_id: Uuid, is_active: bool, is_latest: bool) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE prompt_versions SET is_active = $2, is_latest = $3 WHERE id = $1",
                &[&version_id, &is_active, &is_latest],
            )
            .await?;
        Ok(())
    }

    async fn delete_vector(&mut self, version_id: Uuid) -> Result<()> {
        self.conn()
            .execute("DELETE FROM vector_records WHERE version_id = $1", &[&version_id])
            .await?;
        Ok(())
    }

    async fn update_prompt_root(&mut self, prompt_id: Uuid, update: &PromptRootUpdate) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE prompts SET content = $2, sync_hash = $3, updated_at = $4, is_deleted = $5 WHERE id = $1",
                &[
                    &prompt_id,
                    &update.content,
                    &update.sync_hash,
                    &update.updated_at,
                    &update.is_deleted,
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_vector(&mut self, version_id: Uuid, vector: &[f32]) -> Result<()> {
        let vec = pgvector::Vector::from(vector.to_vec());
        self.conn()
            .execute(
                "INSERT INTO vector_records (version_id, vector) VALUES ($1, $2) \
                 ON CONFLICT (version_id) DO UPDATE SET vector = EXCLUDED.vector",
                &[&version_id, &vec],
            )
            .await?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let conn = self.conn.take().expect("commit called twice");
        conn.batch_execute("COMMIT")
            .await
            .map_err(|e| StoreError::Transient(format!("commit failed: {e}")))?;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        let conn = self.conn.take().expect("rollback called twice");
        let _ = conn.batch_execute("ROLLBACK").await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_type_round_trips_through_string() {
        for rt in [RoleType::System, RoleType::User, RoleType::Assistant, RoleType::Principle] {
            assert_eq!(parse_role_type(role_type_str(rt)), rt);
        }
    }
}
