//! Embedded `Store` realization over SurrealDB, grounded in the teacher's
//! own `server/db.rs` connect sequence (retry/backoff, signin, use_ns/use_db)
//! and `utils/db.rs`'s `LET $x = (...); IF ...; END;` transaction idiom.

use super::{
    LatestVersionInfo, NewClientMapping, NewPrincipleRef, NewVersion, PromptRootUpdate, Store,
    Transaction, VersionSummary, conflict, not_found,
};
use crate::config::Config;
use crate::error::{PromptError, Result, StoreError};
use crate::model::{
    FullVersion, LlmConfig, Prompt, PromptRole, ResolvedPrinciple, RoleType, Version,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::{Client, Ws};
use tracing::{info, warn};
use uuid::Uuid;

fn normalize_ws_url(s: &str) -> String {
    s.strip_prefix("ws://")
        .or_else(|| s.strip_prefix("wss://"))
        .or_else(|| s.strip_prefix("http://"))
        .or_else(|| s.strip_prefix("https://"))
        .unwrap_or(s)
        .to_string()
}

pub struct EmbeddedStore {
    db: Surreal<Client>,
}

impl EmbeddedStore {
    pub async fn connect(config: &Config) -> Result<Self> {
        let url = normalize_ws_url(config.store.path.as_deref().unwrap_or("127.0.0.1:8000"));
        let user = &config.runtime.database_user;
        let pass = &config.runtime.database_pass;
        let ns = &config.runtime.database_ns;
        let dbname = &config.runtime.database_db;

        let reconnect = std::env::var("PROMPT_VAULT_DB_RECONNECT")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let max_retries = if reconnect { 5 } else { 0 };

        let mut conn = None;
        for attempt in 0..=max_retries {
            match Surreal::new::<Ws>(url.clone()).await {
                Ok(c) => {
                    conn = Some(c);
                    if attempt > 0 {
                        info!(attempt, "reconnected to embedded store");
                    }
                    break;
                }
                Err(e) if attempt == max_retries => {
                    return Err(StoreError::Transient(format!(
                        "failed to connect to embedded store at {url} after {} attempts: {e}",
                        attempt + 1
                    ))
                    .into());
                }
                Err(e) => {
                    let delay_ms = (1000u64 * (1u64 << attempt.min(5))).min(60_000);
                    warn!(attempt, error = %e, "embedded store connect failed, retrying in {delay_ms}ms");
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                }
            }
        }
        let db = conn.expect("connection loop always sets conn or returns");

        db.signin(surrealdb::opt::auth::Root {
            username: user.as_str(),
            password: pass.as_str(),
        })
        .await
        .map_err(|e| StoreError::Transient(format!("signin failed: {e}")))?;
        db.use_ns(ns.as_str())
            .use_db(dbname.as_str())
            .await
            .map_err(|e| StoreError::Transient(format!("use_ns/use_db failed: {e}")))?;

        let store = EmbeddedStore { db };
        store.initialize_schema().await?;
        Ok(store)
    }

    /// Hands out a clone of the underlying connection handle so
    /// [`crate::vector::EmbeddedVectorIndex`] can share it — `Surreal<Client>`
    /// is a cheap, reference-counted handle.
    pub fn db(&self) -> Surreal<Client> {
        self.db.clone()
    }

    /// Runs `INFO FOR TABLE` against every table in
    /// [`crate::indexes::get_expected_indexes`] and reports which required
    /// indexes are missing. A maintenance check, not part of the request
    /// path — never called from `PromptManager`.
    pub async fn check_indexes(&self) -> Result<Vec<crate::indexes::IndexHealth>> {
        use crate::indexes::{IndexHealth, TableInfo, get_expected_indexes};

        let mut report = Vec::new();
        for table_def in get_expected_indexes() {
            let mut resp = self
                .db
                .query(format!("INFO FOR TABLE {}", table_def.table))
                .await
                .map_err(|e| StoreError::Transient(e.to_string()))?;
            let info: Option<TableInfo> =
                resp.take(0).map_err(|e| StoreError::Transient(e.to_string()))?;
            let info = info.unwrap_or(TableInfo { indexes: Default::default() });
            report.push(IndexHealth::evaluate(&table_def, &info));
        }
        Ok(report)
    }

    async fn initialize_schema(&self) -> Result<()> {
        let ddl = r#"
            DEFINE TABLE IF NOT EXISTS prompt SCHEMALESS;
            DEFINE FIELD IF NOT EXISTS name ON prompt TYPE string;
            DEFINE FIELD IF NOT EXISTS content ON prompt TYPE string;
            DEFINE FIELD IF NOT EXISTS sync_hash ON prompt TYPE string;
            DEFINE FIELD IF NOT EXISTS created_at ON prompt TYPE datetime;
            DEFINE FIELD IF NOT EXISTS updated_at ON prompt TYPE datetime;
            DEFINE FIELD IF NOT EXISTS is_deleted ON prompt TYPE bool;
            DEFINE INDEX IF NOT EXISTS prompt_name_unique ON prompt FIELDS name UNIQUE;

            DEFINE TABLE IF NOT EXISTS prompt_version SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS prompt_version_prompt_idx ON prompt_version FIELDS prompt_id;

            DEFINE TABLE IF NOT EXISTS prompt_role SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS prompt_role_version_idx ON prompt_role FIELDS version_id;

            DEFINE TABLE IF NOT EXISTS llm_config SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS llm_config_version_unique ON llm_config FIELDS version_id UNIQUE;

            DEFINE TABLE IF NOT EXISTS tag SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS tag_name_unique ON tag FIELDS name UNIQUE;

            DEFINE TABLE IF NOT EXISTS prompt_tag SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS prompt_tag_link_unique ON prompt_tag FIELDS version_id, tag_id UNIQUE;

            DEFINE TABLE IF NOT EXISTS principle_ref SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS principle_ref_version_idx ON principle_ref FIELDS version_id;

            DEFINE TABLE IF NOT EXISTS principle_prompt SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS principle_prompt_name_idx ON principle_prompt FIELDS name;

            DEFINE TABLE IF NOT EXISTS llm_client SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS llm_client_name_unique ON llm_client FIELDS name UNIQUE;

            DEFINE TABLE IF NOT EXISTS client_mapping SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS client_mapping_link_unique ON client_mapping FIELDS version_id, client_id UNIQUE;

            DEFINE TABLE IF NOT EXISTS vector_record SCHEMALESS;
            DEFINE INDEX IF NOT EXISTS vector_record_version_unique ON vector_record FIELDS version_id UNIQUE;

            DEFINE TABLE IF NOT EXISTS app_config SCHEMALESS;
        "#;
        self.db
            .query(ddl)
            .await
            .map_err(|e| StoreError::Transient(format!("schema init failed: {e}")))?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PromptRow {
    id: surrealdb::sql::Thing,
    name: String,
    content: String,
    sync_hash: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    is_deleted: bool,
}

fn thing_to_uuid(thing: &surrealdb::sql::Thing) -> Uuid {
    Uuid::parse_str(&thing.id.to_raw()).unwrap_or_else(|_| Uuid::nil())
}

impl From<PromptRow> for Prompt {
    fn from(row: PromptRow) -> Self {
        Prompt {
            id: thing_to_uuid(&row.id),
            name: row.name,
            content: row.content,
            sync_hash: row.sync_hash,
            created_at: row.created_at,
            updated_at: row.updated_at,
            is_deleted: row.is_deleted,
        }
    }
}

#[async_trait]
impl Store for EmbeddedStore {
    async fn get_prompt_by_name(&self, name: &str) -> Result<Option<Prompt>> {
        let mut resp = self
            .db
            .query("SELECT * FROM prompt WHERE name = $name AND is_deleted = false LIMIT 1")
            .bind(("name", name.to_string()))
            .await?;
        let rows: Vec<PromptRow> = resp.take(0)?;
        Ok(rows.into_iter().next().map(Into::into))
    }

    async fn get_latest_version_info(&self, prompt_id: Uuid) -> Result<Option<LatestVersionInfo>> {
        #[derive(Deserialize)]
        struct Row {
            id: surrealdb::sql::Thing,
            version: String,
            version_number: i64,
        }
        let mut resp = self
            .db
            .query(
                "SELECT * FROM prompt_version WHERE prompt_id = $pid AND is_latest = true LIMIT 1",
            )
            .bind(("pid", prompt_id.to_string()))
            .await?;
        let rows: Vec<Row> = resp.take(0)?;
        Ok(rows.into_iter().next().map(|r| LatestVersionInfo {
            version_id: thing_to_uuid(&r.id),
            version: Version::parse(&r.version).unwrap_or(Version::INITIAL),
            version_number: r.version_number,
        }))
    }

    async fn list_versions_of(&self, prompt_id: Uuid) -> Result<Vec<VersionSummary>> {
        #[derive(Deserialize)]
        struct Row {
            id: surrealdb::sql::Thing,
            version: String,
            version_number: i64,
            description: String,
            is_active: bool,
            is_latest: bool,
            created_at: DateTime<Utc>,
        }
        let mut resp = self
            .db
            .query("SELECT * FROM prompt_version WHERE prompt_id = $pid ORDER BY version_number ASC")
            .bind(("pid", prompt_id.to_string()))
            .await?;
        let rows: Vec<Row> = resp.take(0)?;
        Ok(rows
            .into_iter()
            .map(|r| VersionSummary {
                version_id: thing_to_uuid(&r.id),
                version: Version::parse(&r.version).unwrap_or(Version::INITIAL),
                version_number: r.version_number,
                description: r.description,
                is_active: r.is_active,
                is_latest: r.is_latest,
                created_at: r.created_at,
            })
            .collect())
    }

    async fn load_full_version(
        &self,
        name: &str,
        version_or_latest: &str,
    ) -> Result<Option<FullVersion>> {
        let Some(prompt) = self.get_prompt_by_name(name).await? else {
            return Ok(None);
        };

        #[derive(Deserialize)]
        struct VersionRow {
            id: surrealdb::sql::Thing,
            prompt_id: String,
            version: String,
            version_number: i64,
            description: String,
            is_active: bool,
            is_latest: bool,
            change_log: Option<String>,
            created_at: DateTime<Utc>,
        }
        let version_row: Option<VersionRow> = if version_or_latest == "latest" {
            let mut resp = self
                .db
                .query("SELECT * FROM prompt_version WHERE prompt_id = $pid AND is_latest = true LIMIT 1")
                .bind(("pid", prompt.id.to_string()))
                .await?;
            resp.take::<Vec<VersionRow>>(0)?.into_iter().next()
        } else {
            let mut resp = self
                .db
                .query("SELECT * FROM prompt_version WHERE prompt_id = $pid AND version = $v AND is_active = true LIMIT 1")
                .bind(("pid", prompt.id.to_string()))
                .bind(("v", version_or_latest.to_string()))
                .await?;
            resp.take::<Vec<VersionRow>>(0)?.into_iter().next()
        };
        let Some(version_row) = version_row else {
            return Ok(None);
        };
        let version_id = thing_to_uuid(&version_row.id);

        #[derive(Deserialize)]
        struct RoleRow {
            role_type: String,
            content: String,
            order: i32,
            template_variables:
                Option<std::collections::HashMap<String, crate::model::TemplateVarDef>>,
        }
        let mut resp = self
            .db
            .query("SELECT * FROM prompt_role WHERE version_id = $vid ORDER BY order ASC")
            .bind(("vid", version_id.to_string()))
            .await?;
        let role_rows: Vec<RoleRow> = resp.take(0)?;
        let roles = role_rows
            .into_iter()
            .map(|r| PromptRole {
                version_id,
                role_type: match r.role_type.as_str() {
                    "system" => RoleType::System,
                    "user" => RoleType::User,
                    "assistant" => RoleType::Assistant,
                    _ => RoleType::Principle,
                },
                content: r.content,
                order: r.order,
                template_variables: r.template_variables,
            })
            .collect();

        #[derive(Deserialize)]
        struct RefRow {
            principle_name: String,
            ref_version: String,
            order: i32,
        }
        let mut resp = self
            .db
            .query("SELECT * FROM principle_ref WHERE version_id = $vid ORDER BY order ASC")
            .bind(("vid", version_id.to_string()))
            .await?;
        let ref_rows: Vec<RefRow> = resp.take(0)?;
        let mut principles = Vec::with_capacity(ref_rows.len());
        for r in ref_rows {
            #[derive(Deserialize)]
            struct PrincipleContentRow {
                content: String,
            }
            let content_row: Option<PrincipleContentRow> = if r.ref_version == "latest" {
                let mut resp = self
                    .db
                    .query("SELECT content FROM principle_prompt WHERE name = $name AND is_latest = true LIMIT 1")
                    .bind(("name", r.principle_name.clone()))
                    .await?;
                resp.take(0)?
            } else {
                let mut resp = self
                    .db
                    .query("SELECT content FROM principle_prompt WHERE name = $name AND version = $v LIMIT 1")
                    .bind(("name", r.principle_name.clone()))
                    .bind(("v", r.ref_version.clone()))
                    .await?;
                resp.take::<Vec<PrincipleContentRow>>(0)?.into_iter().next()
            };
            let Some(content_row) = content_row else {
                return Err(not_found(format!(
                    "principle '{}' version '{}' not found",
                    r.principle_name, r.ref_version
                )));
            };
            principles.push(ResolvedPrinciple {
                order: r.order,
                content: content_row.content,
            });
        }

        #[derive(Deserialize)]
        struct ConfigRow {
            model: Option<String>,
            temperature: Option<f32>,
            max_tokens: Option<u32>,
            top_p: Option<f32>,
            top_k: Option<u32>,
            frequency_penalty: Option<f32>,
            presence_penalty: Option<f32>,
            stop_sequences: Option<Vec<String>>,
            other_params: Option<serde_json::Value>,
        }
        let mut resp = self
            .db
            .query("SELECT * FROM llm_config WHERE version_id = $vid LIMIT 1")
            .bind(("vid", version_id.to_string()))
            .await?;
        let config_row: Option<ConfigRow> = resp.take(0)?;
        let llm_config = config_row
            .map(|c| LlmConfig {
                model: c.model,
                temperature: c.temperature,
                max_tokens: c.max_tokens,
                top_p: c.top_p,
                top_k: c.top_k,
                frequency_penalty: c.frequency_penalty,
                presence_penalty: c.presence_penalty,
                stop_sequences: c.stop_sequences,
                other_params: c.other_params,
            })
            .unwrap_or_default();

        #[derive(Deserialize)]
        struct TagNameRow {
            name: String,
        }
        let mut resp = self
            .db
            .query(
                "SELECT tag.name AS name FROM prompt_tag \
                 WHERE version_id = $vid FETCH tag",
            )
            .bind(("vid", version_id.to_string()))
            .await?;
        let tags: Vec<TagNameRow> = resp.take(0).unwrap_or_default();

        Ok(Some(FullVersion {
            prompt,
            version: crate::model::PromptVersion {
                id: version_id,
                prompt_id: Uuid::parse_str(&version_row.prompt_id).unwrap_or_else(|_| Uuid::nil()),
                version: Version::parse(&version_row.version).unwrap_or(Version::INITIAL),
                version_number: version_row.version_number,
                description: version_row.description,
                is_active: version_row.is_active,
                is_latest: version_row.is_latest,
                change_log: version_row.change_log,
                created_at: version_row.created_at,
            },
            roles,
            principles,
            llm_config,
            tags: tags.into_iter().map(|t| t.name).collect(),
        }))
    }

    async fn search_versions_with_all_tags(&self, tags: &[String]) -> Result<Vec<Uuid>> {
        if tags.is_empty() {
            return Ok(vec![]);
        }
        #[derive(Deserialize)]
        struct Row {
            version_id: String,
        }
        let mut resp = self
            .db
            .query(
                "SELECT version_id FROM prompt_tag \
                 WHERE tag_id IN (SELECT VALUE id FROM tag WHERE name IN $names) \
                 GROUP BY version_id \
                 HAVING count(tag_id) = $n",
            )
            .bind(("names", tags.to_vec()))
            .bind(("n", tags.len() as i64))
            .await?;
        let rows: Vec<Row> = resp.take(0).unwrap_or_default();
        Ok(rows
            .into_iter()
            .filter_map(|r| Uuid::parse_str(&r.version_id).ok())
            .collect())
    }

    async fn search_versions_by_keyword(&self, text: &str) -> Result<Vec<Uuid>> {
        #[derive(Deserialize)]
        struct Row {
            id: surrealdb::sql::Thing,
        }
        let needle = text.to_lowercase();
        let mut resp = self
            .db
            .query(
                "SELECT prompt_version.id AS id FROM prompt_version \
                 INNER JOIN prompt ON prompt.id = prompt_version.prompt_id \
                 WHERE string::lowercase(prompt.name) CONTAINS $needle \
                    OR string::lowercase(prompt_version.description) CONTAINS $needle",
            )
            .bind(("needle", needle))
            .await?;
        let rows: Vec<Row> = resp.take(0).unwrap_or_default();
        Ok(rows.iter().map(thing_to_uuid).collect())
    }

    async fn list_all_latest_versions(&self) -> Result<Vec<(Prompt, VersionSummary, Vec<String>)>> {
        #[derive(Deserialize)]
        struct Row {
            id: surrealdb::sql::Thing,
            prompt_id: String,
            version: String,
            version_number: i64,
            description: String,
            is_active: bool,
            is_latest: bool,
            created_at: DateTime<Utc>,
        }
        let mut resp = self
            .db
            .query(
                "SELECT * FROM prompt_version WHERE is_latest = true AND is_active = true \
                 ORDER BY created_at DESC",
            )
            .await?;
        let rows: Vec<Row> = resp.take(0).unwrap_or_default();

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let Ok(prompt_id) = Uuid::parse_str(&r.prompt_id) else {
                continue;
            };
            let mut presp = self
                .db
                .query(format!("SELECT * FROM prompt:{} LIMIT 1", prompt_id.as_simple()))
                .await?;
            let prompt_rows: Vec<PromptRow> = presp.take(0).unwrap_or_default();
            let Some(prompt_row) = prompt_rows.into_iter().next() else {
                continue;
            };
            let version_id = thing_to_uuid(&r.id);
            #[derive(Deserialize)]
            struct TagNameRow {
                name: String,
            }
            let mut tresp = self
                .db
                .query("SELECT tag.name AS name FROM prompt_tag WHERE version_id = $vid FETCH tag")
                .bind(("vid", version_id.to_string()))
                .await?;
            let tags: Vec<TagNameRow> = tresp.take(0).unwrap_or_default();
            out.push((
                prompt_row.into(),
                VersionSummary {
                    version_id,
                    version: Version::parse(&r.version).unwrap_or(Version::INITIAL),
                    version_number: r.version_number,
                    description: r.description.clone(),
                    is_active: r.is_active,
                    is_latest: r.is_latest,
                    created_at: r.created_at,
                },
                tags.into_iter().map(|t| t.name).collect(),
            ));
        }
        Ok(out)
    }

    async fn load_version_rows(&self, version_ids: &[Uuid]) -> Result<Vec<(Prompt, VersionSummary, Vec<String>)>> {
        if version_ids.is_empty() {
            return Ok(vec![]);
        }
        #[derive(Deserialize)]
        struct Row {
            id: surrealdb::sql::Thing,
            prompt_id: String,
            version: String,
            version_number: i64,
            description: String,
            is_active: bool,
            is_latest: bool,
            created_at: DateTime<Utc>,
        }
        let mut out = Vec::with_capacity(version_ids.len());
        for vid in version_ids {
            let mut resp = self
                .db
                .query(format!("SELECT * FROM prompt_version:{} LIMIT 1", vid.as_simple()))
                .await?;
            let rows: Vec<Row> = resp.take(0).unwrap_or_default();
            let Some(r) = rows.into_iter().next() else {
                continue;
            };
            let Ok(prompt_id) = Uuid::parse_str(&r.prompt_id) else {
                continue;
            };
            let mut presp = self
                .db
                .query(format!("SELECT * FROM prompt:{} LIMIT 1", prompt_id.as_simple()))
                .await?;
            let prompt_rows: Vec<PromptRow> = presp.take(0).unwrap_or_default();
            let Some(prompt_row) = prompt_rows.into_iter().next() else {
                continue;
            };
            #[derive(Deserialize)]
            struct TagNameRow {
                name: String,
            }
            let mut tresp = self
                .db
                .query("SELECT tag.name AS name FROM prompt_tag WHERE version_id = $vid FETCH tag")
                .bind(("vid", vid.to_string()))
                .await?;
            let tags: Vec<TagNameRow> = tresp.take(0).unwrap_or_default();
            out.push((
                prompt_row.into(),
                VersionSummary {
                    version_id: *vid,
                    version: Version::parse(&r.version).unwrap_or(Version::INITIAL),
                    version_number: r.version_number,
                    description: r.description.clone(),
                    is_active: r.is_active,
                    is_latest: r.is_latest,
                    created_at: r.created_at,
                },
                tags.into_iter().map(|t| t.name).collect(),
            ));
        }
        Ok(out)
    }

    async fn find_version(&self, name: &str, version: Version) -> Result<Option<VersionSummary>> {
        let Some(prompt) = self.get_prompt_by_name(name).await? else {
            return Ok(None);
        };
        #[derive(Deserialize)]
        struct Row {
            id: surrealdb::sql::Thing,
            version: String,
            version_number: i64,
            description: String,
            is_active: bool,
            is_latest: bool,
            created_at: DateTime<Utc>,
        }
        let mut resp = self
            .db
            .query("SELECT * FROM prompt_version WHERE prompt_id = $pid AND version = $v LIMIT 1")
            .bind(("pid", prompt.id.to_string()))
            .bind(("v", version.to_string()))
            .await?;
        let rows: Vec<Row> = resp.take(0).unwrap_or_default();
        Ok(rows.into_iter().next().map(|r| VersionSummary {
            version_id: thing_to_uuid(&r.id),
            version: Version::parse(&r.version).unwrap_or(Version::INITIAL),
            version_number: r.version_number,
            description: r.description,
            is_active: r.is_active,
            is_latest: r.is_latest,
            created_at: r.created_at,
        }))
    }

    async fn get_app_config(&self, key: &str) -> Result<Option<String>> {
        #[derive(Deserialize)]
        struct Row {
            value: String,
        }
        let mut resp = self
            .db
            .query("SELECT value FROM app_config WHERE key = $key LIMIT 1")
            .bind(("key", key.to_string()))
            .await?;
        let rows: Vec<Row> = resp.take(0).unwrap_or_default();
        Ok(rows.into_iter().next().map(|r| r.value))
    }

    async fn list_prompts_updated_after(&self, since: DateTime<Utc>) -> Result<Vec<Prompt>> {
        let mut resp = self
            .db
            .query("SELECT * FROM prompt WHERE updated_at > $since ORDER BY updated_at ASC")
            .bind(("since", since.to_rfc3339()))
            .await?;
        let rows: Vec<PromptRow> = resp.take(0).unwrap_or_default();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn upsert_prompt_verbatim(&self, prompt: &Prompt) -> Result<()> {
        self.db
            .query(format!(
                "UPDATE prompt:{} CONTENT $p ELSE CREATE prompt:{} CONTENT $p;",
                prompt.id.as_simple(),
                prompt.id.as_simple(),
            ))
            .bind((
                "p",
                serde_json::json!({
                    "name": prompt.name,
                    "content": prompt.content,
                    "sync_hash": prompt.sync_hash,
                    "created_at": prompt.created_at.to_rfc3339(),
                    "updated_at": prompt.updated_at.to_rfc3339(),
                    "is_deleted": prompt.is_deleted,
                }),
            ))
            .await?;
        Ok(())
    }

    async fn set_app_config(&self, key: &str, value: &str) -> Result<()> {
        self.db
            .query(
                "UPDATE app_config SET value = $value WHERE key = $key \
                 ELSE CREATE app_config CONTENT { key: $key, value: $value };",
            )
            .bind(("key", key.to_string()))
            .bind(("value", value.to_string()))
            .await?;
        Ok(())
    }

    async fn resolve_principle_version(
        &self,
        name: &str,
        ref_version: &str,
    ) -> Result<Option<Version>> {
        #[derive(Deserialize)]
        struct Row {
            version: String,
        }
        let rows: Vec<Row> = if ref_version == "latest" {
            let mut resp = self
                .db
                .query("SELECT version FROM principle_prompt WHERE name = $name AND is_latest = true LIMIT 1")
                .bind(("name", name.to_string()))
                .await?;
            resp.take(0).unwrap_or_default()
        } else {
            let mut resp = self
                .db
                .query("SELECT version FROM principle_prompt WHERE name = $name AND version = $v LIMIT 1")
                .bind(("name", name.to_string()))
                .bind(("v", ref_version.to_string()))
                .await?;
            resp.take(0).unwrap_or_default()
        };
        Ok(rows.into_iter().next().and_then(|r| Version::parse(&r.version)))
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
        let id = Uuid::new_v4();
        if is_latest {
            self.db
                .query("UPDATE principle_prompt SET is_latest = false WHERE name = $name")
                .bind(("name", name.to_string()))
                .await?;
        }
        self.db
            .query(format!(
                "CREATE principle_prompt:{} CONTENT {{ name: $name, version: $version, \
                 content: $content, is_active: $active, is_latest: $latest, created_at: $created }};",
                id.as_simple()
            ))
            .bind(("name", name.to_string()))
            .bind(("version", version.to_string()))
            .bind(("content", content.to_string()))
            .bind(("active", is_active))
            .bind(("latest", is_latest))
            .bind(("created", created_at.to_rfc3339()))
            .await
            .map_err(|e| conflict(format!("principle_prompt insert failed: {e}")))?;
        Ok(id)
    }

    async fn get_client_defaults(&self, name: &str) -> Result<Vec<crate::model::DefaultPrincipleEntry>> {
        #[derive(Deserialize)]
        struct Row {
            default_principles: Vec<crate::model::DefaultPrincipleEntry>,
        }
        let mut resp = self
            .db
            .query("SELECT default_principles FROM llm_client WHERE name = $name LIMIT 1")
            .bind(("name", name.to_string()))
            .await?;
        let rows: Vec<Row> = resp.take(0).unwrap_or_default();
        Ok(rows.into_iter().next().map(|r| r.default_principles).unwrap_or_default())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(EmbeddedTransaction {
            db: self.db.clone(),
            statements: Vec::new(),
        }))
    }
}

/// Statements accumulated client-side and submitted as one
/// `BEGIN TRANSACTION; ...; COMMIT TRANSACTION;` SurrealQL block on
/// `commit` — SurrealDB's WS client has no interactive transaction handle,
/// so this buffer-then-submit shape is the idiomatic equivalent of the
/// teacher's own multi-statement `LET $x = (...); IF ...; END;` pattern.
pub struct EmbeddedTransaction {
    db: Surreal<Client>,
    statements: Vec<(String, Vec<(String, serde_json::Value)>)>,
}

impl EmbeddedTransaction {
    fn push(&mut self, sql: impl Into<String>, binds: Vec<(String, serde_json::Value)>) {
        self.statements.push((sql.into(), binds));
    }
}

#[async_trait]
impl Transaction for EmbeddedTransaction {
    async fn insert_prompt(&mut self, name: &str, created_at: DateTime<Utc>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.push(
            format!(
                "CREATE prompt:{} CONTENT {{ name: $p{id}_name, content: '', sync_hash: '', \
                 created_at: $p{id}_created, updated_at: $p{id}_created, is_deleted: false }};",
                id.as_simple()
            ),
            vec![
                (format!("p{id}_name"), name.into()),
                (format!("p{id}_created"), created_at.to_rfc3339().into()),
            ],
        );
        Ok(id)
    }

    async fn insert_version(&mut self, version: &NewVersion) -> Result<()> {
        self.push(
            format!(
                "CREATE prompt_version:{} CONTENT {{ prompt_id: '{}', version: '{}', \
                 version_number: {}, description: $d{id}, is_active: {}, is_latest: {}, \
                 change_log: {}, created_at: $c{id} }};",
                version.id.as_simple(),
                version.prompt_id,
                version.version,
                version.version_number,
                version.is_active,
                version.is_latest,
                version
                    .change_log
                    .as_ref()
                    .map(|c| format!("'{}'", c.replace('\'', "\\'")))
                    .unwrap_or_else(|| "NONE".to_string()),
                id = version.id.as_simple(),
            ),
            vec![
                (
                    format!("d{}", version.id.as_simple()),
                    version.description.clone().into(),
                ),
                (
                    format!("c{}", version.id.as_simple()),
                    version.created_at.to_rfc3339().into(),
                ),
            ],
        );
        Ok(())
    }

    async fn insert_roles(&mut self, roles: &[PromptRole]) -> Result<()> {
        for role in roles {
            let id = Uuid::new_v4();
            let vars = serde_json::to_string(&role.template_variables).unwrap_or("null".into());
            self.push(
                format!(
                    "CREATE prompt_role:{} CONTENT {{ version_id: '{}', role_type: '{:?}', \
                     content: $c{id}, order: {}, template_variables: {} }};",
                    id.as_simple(),
                    role.version_id,
                    role.role_type,
                    role.order,
                    vars,
                    id = id.as_simple(),
                ),
                vec![(format!("c{}", id.as_simple()), role.content.clone().into())],
            );
        }
        Ok(())
    }

    async fn insert_llm_config(&mut self, version_id: Uuid, config: &LlmConfig) -> Result<()> {
        let payload = serde_json::to_value(config).map_err(PromptError::from)?;
        self.push(
            format!(
                "CREATE llm_config:{} CONTENT $cfg{id};",
                version_id.as_simple(),
                id = version_id.as_simple(),
            ),
            vec![(
                format!("cfg{}", version_id.as_simple()),
                {
                    let mut obj = payload.as_object().cloned().unwrap_or_default();
                    obj.insert("version_id".into(), version_id.to_string().into());
                    serde_json::Value::Object(obj)
                },
            )],
        );
        Ok(())
    }

    async fn upsert_tag(&mut self, name: &str) -> Result<Uuid> {
        let mut resp = self
            .db
            .query("SELECT * FROM tag WHERE name = $name LIMIT 1")
            .bind(("name", name.to_string()))
            .await?;
        #[derive(Deserialize)]
        struct Row {
            id: surrealdb::sql::Thing,
        }
        if let Some(row) = resp.take::<Vec<Row>>(0)?.into_iter().next() {
            return Ok(thing_to_uuid(&row.id));
        }
        let id = Uuid::new_v4();
        self.db
            .query(format!(
                "CREATE tag:{} CONTENT {{ name: $name, created_at: time::now() }};",
                id.as_simple()
            ))
            .bind(("name", name.to_string()))
            .await?;
        Ok(id)
    }

    async fn insert_prompt_tag(&mut self, version_id: Uuid, tag_id: Uuid) -> Result<()> {
        self.push(
            format!(
                "CREATE prompt_tag CONTENT {{ version_id: '{version_id}', tag_id: '{tag_id}' }};"
            ),
            vec![],
        );
        Ok(())
    }

    async fn insert_principle_ref(&mut self, reference: &NewPrincipleRef) -> Result<()> {
        self.push(
            format!(
                "CREATE principle_ref CONTENT {{ version_id: '{}', principle_name: $n{id}, \
                 ref_version: $r{id}, order: {} }};",
                reference.version_id,
                reference.order,
                id = reference.version_id.as_simple(),
            ),
            vec![
                (
                    format!("n{}", reference.version_id.as_simple()),
                    reference.principle_name.clone().into(),
                ),
                (
                    format!("r{}", reference.version_id.as_simple()),
                    reference.ref_version.clone().into(),
                ),
            ],
        );
        Ok(())
    }

    async fn upsert_client(&mut self, name: &str) -> Result<Uuid> {
        let mut resp = self
            .db
            .query("SELECT * FROM llm_client WHERE name = $name LIMIT 1")
            .bind(("name", name.to_string()))
            .await?;
        #[derive(Deserialize)]
        struct Row {
            id: surrealdb::sql::Thing,
        }
        if let Some(row) = resp.take::<Vec<Row>>(0)?.into_iter().next() {
            return Ok(thing_to_uuid(&row.id));
        }
        let id = Uuid::new_v4();
        self.db
            .query(format!(
                "CREATE llm_client:{} CONTENT {{ name: $name, default_principles: [] }};",
                id.as_simple()
            ))
            .bind(("name", name.to_string()))
            .await?;
        Ok(id)
    }

    async fn insert_client_mapping(&mut self, mapping: &NewClientMapping) -> Result<()> {
        let client_id = self.upsert_client(&mapping.client_name).await?;
        self.push(
            format!(
                "CREATE client_mapping CONTENT {{ version_id: '{}', client_id: '{}' }};",
                mapping.version_id, client_id
            ),
            vec![],
        );
        Ok(())
    }

    async fn clear_latest_flag(&mut self, prompt_id: Uuid, except_version_id: Uuid) -> Result<()> {
        self.push(
            format!(
                "UPDATE prompt_version SET is_latest = false \
                 WHERE prompt_id = '{prompt_id}' AND id != prompt_version:{};",
                except_version_id.as_simple()
            ),
            vec![],
        );
        Ok(())
    }

    async fn set_version_flags(
        &mut self,
        version_id: Uuid,
        is_active: bool,
        is_latest: bool,
    ) -> Result<()> {
        self.push(
            format!(
                "UPDATE prompt_version:{} SET is_active = {is_active}, is_latest = {is_latest};",
                version_id.as_simple()
            ),
            vec![],
        );
        Ok(())
    }

    async fn delete_vector(&mut self, version_id: Uuid) -> Result<()> {
        self.push(
            format!("DELETE vector_record WHERE version_id = '{version_id}';"),
            vec![],
        );
        Ok(())
    }

    async fn update_prompt_root(&mut self, prompt_id: Uuid, update: &PromptRootUpdate) -> Result<()> {
        self.push(
            format!(
                "UPDATE prompt:{} SET content = $content{id}, sync_hash = $hash{id}, \
                 updated_at = $updated{id}, is_deleted = {};",
                prompt_id.as_simple(),
                update.is_deleted,
                id = prompt_id.as_simple(),
            ),
            vec![
                (
                    format!("content{}", prompt_id.as_simple()),
                    update.content.clone().into(),
                ),
                (
                    format!("hash{}", prompt_id.as_simple()),
                    update.sync_hash.clone().into(),
                ),
                (
                    format!("updated{}", prompt_id.as_simple()),
                    update.updated_at.to_rfc3339().into(),
                ),
            ],
        );
        Ok(())
    }

    async fn upsert_vector(&mut self, version_id: Uuid, vector: &[f32]) -> Result<()> {
        self.push(
            format!(
                "UPDATE vector_record CONTENT {{ version_id: '{version_id}', vector: $vec{id} }} \
                 WHERE version_id = '{version_id}' \
                 ELSE CREATE vector_record CONTENT {{ version_id: '{version_id}', vector: $vec{id} }};",
                id = version_id.as_simple(),
            ),
            vec![(
                format!("vec{}", version_id.as_simple()),
                serde_json::to_value(vector).unwrap_or_default(),
            )],
        );
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.statements.is_empty() {
            return Ok(());
        }
        let mut sql = String::from("BEGIN TRANSACTION;\n");
        for (stmt, _) in &self.statements {
            sql.push_str(stmt);
            sql.push('\n');
        }
        sql.push_str("COMMIT TRANSACTION;");

        let mut query = self.db.query(sql);
        for (_, binds) in &self.statements {
            for (key, value) in binds {
                query = query.bind((key.clone(), value.clone()));
            }
        }
        query.await.map_err(|e| {
            if e.to_string().to_lowercase().contains("unique") {
                conflict(e.to_string())
            } else {
                StoreError::Transient(e.to_string()).into()
            }
        })?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
