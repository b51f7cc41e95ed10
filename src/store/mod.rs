//! `Store`: transactional CRUD over the prompt entity graph, per
//! SPEC_FULL.md §4.1. Two realizations share this contract: [`embedded`]
//! (SurrealDB, the teacher's own transport) and [`hosted`] (Postgres +
//! pgvector).

pub mod embedded;
pub mod hosted;
pub mod memory;

use crate::error::{Result, StoreError};
use crate::model::{DefaultPrincipleEntry, LlmConfig, Prompt, PromptRole, Version};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// `{version, version_number}` for the current `is_latest=true` row of a
/// prompt, or `None` if the prompt has no versions (or doesn't exist).
#[derive(Debug, Clone)]
pub struct LatestVersionInfo {
    pub version_id: Uuid,
    pub version: Version,
    pub version_number: i64,
}

/// One row as returned by `list_versions_of`.
#[derive(Debug, Clone)]
pub struct VersionSummary {
    pub version_id: Uuid,
    pub version: Version,
    pub version_number: i64,
    pub description: String,
    pub is_active: bool,
    pub is_latest: bool,
    pub created_at: DateTime<Utc>,
}

/// Input to `insert_version`; `id` is minted by the caller so role/tag/etc.
/// inserts within the same transaction can reference it before commit.
#[derive(Debug, Clone)]
pub struct NewVersion {
    pub id: Uuid,
    pub prompt_id: Uuid,
    pub version: Version,
    pub version_number: i64,
    pub description: String,
    pub is_active: bool,
    pub is_latest: bool,
    pub change_log: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPrincipleRef {
    pub version_id: Uuid,
    pub principle_name: String,
    pub ref_version: String,
    pub order: i32,
}

#[derive(Debug, Clone)]
pub struct NewClientMapping {
    pub version_id: Uuid,
    pub client_name: String,
}

#[derive(Debug, Clone)]
pub struct PromptRootUpdate {
    pub content: String,
    pub sync_hash: String,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

/// Read-only lookups that don't require transactional isolation — used by
/// the orchestrator both outside and inside a write transaction.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_prompt_by_name(&self, name: &str) -> Result<Option<Prompt>>;
    async fn get_latest_version_info(&self, prompt_id: Uuid) -> Result<Option<LatestVersionInfo>>;
    async fn list_versions_of(&self, prompt_id: Uuid) -> Result<Vec<VersionSummary>>;
    async fn load_full_version(
        &self,
        name: &str,
        version_or_latest: &str,
    ) -> Result<Option<crate::model::FullVersion>>;
    async fn search_versions_with_all_tags(&self, tags: &[String]) -> Result<Vec<Uuid>>;
    async fn search_versions_by_keyword(&self, text: &str) -> Result<Vec<Uuid>>;
    /// Lists the "active latest" version row for every prompt, used by
    /// `search` when neither a query nor tags are supplied (§4.7 search,
    /// "no id filter" branch / §8 property 14).
    async fn list_all_latest_versions(&self) -> Result<Vec<(Prompt, VersionSummary, Vec<String>)>>;
    /// Finds a specific version by prompt name and exact version string
    /// (not `"latest"`); used by `activate`/`delete`.
    async fn find_version(&self, name: &str, version: Version) -> Result<Option<VersionSummary>>;
    /// Loads `{prompt, version, tags}` rows for an arbitrary set of version
    /// ids, used by `search` once a candidate id set has been computed from
    /// vector/keyword/tag matching.
    async fn load_version_rows(&self, version_ids: &[Uuid]) -> Result<Vec<(Prompt, VersionSummary, Vec<String>)>>;

    /// `AppConfig` single-key lookup, e.g. `last_sync_time` (§4.8 sync).
    async fn get_app_config(&self, key: &str) -> Result<Option<String>>;
    /// Prompt rows with `updated_at` strictly after `since`, used by
    /// `SyncEngine`'s pull/push phases.
    async fn list_prompts_updated_after(&self, since: DateTime<Utc>) -> Result<Vec<Prompt>>;
    /// Inserts or overwrites a `Prompt` root row verbatim (id preserved),
    /// distinct from `update_prompt_root` which mutates fields of an
    /// existing local row by id. Used only by `SyncEngine`'s pull phase.
    async fn upsert_prompt_verbatim(&self, prompt: &Prompt) -> Result<()>;
    /// Sets a single `AppConfig` key/value pair, e.g. `last_sync_time`.
    async fn set_app_config(&self, key: &str, value: &str) -> Result<()>;

    /// Finds the concrete `Version` a principle ref resolves to — `"latest"`
    /// resolves to whichever row currently has `is_latest = true`, anything
    /// else must parse and match an existing row exactly. `None` means the
    /// ref does not resolve, which the caller turns into a `ValidationError`
    /// at `create` time (§9 Open Question 2).
    async fn resolve_principle_version(
        &self,
        name: &str,
        ref_version: &str,
    ) -> Result<Option<Version>>;

    /// Inserts a new `PrinciplePrompt` row. If `is_latest` is set, every
    /// other row sharing `name` has its `is_latest` flag cleared first, in
    /// the same spirit as a `PromptVersion`'s `is_latest` flip.
    async fn create_principle(
        &self,
        name: &str,
        version: Version,
        content: &str,
        is_active: bool,
        is_latest: bool,
        created_at: DateTime<Utc>,
    ) -> Result<Uuid>;

    /// `LlmClient.default_principles` for `name`, or empty if the client is
    /// unknown — `create`'s client-merge step treats an unregistered client
    /// name as "no defaults" rather than an error.
    async fn get_client_defaults(&self, name: &str) -> Result<Vec<DefaultPrincipleEntry>>;

    /// Opens a new write transaction. The embedded realization buffers
    /// statements client-side and submits one multi-statement SurrealQL
    /// block on `commit`; the hosted realization wraps a real
    /// `tokio_postgres` transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// One write transaction. All mutating `Store` operations live here so a
/// single `create`/`update`/`delete`/`activate` call commits atomically.
#[async_trait]
pub trait Transaction: Send {
    async fn insert_prompt(&mut self, name: &str, created_at: DateTime<Utc>) -> Result<Uuid>;
    async fn insert_version(&mut self, version: &NewVersion) -> Result<()>;
    async fn insert_roles(&mut self, roles: &[PromptRole]) -> Result<()>;
    async fn insert_llm_config(&mut self, version_id: Uuid, config: &LlmConfig) -> Result<()>;
    async fn upsert_tag(&mut self, name: &str) -> Result<Uuid>;
    async fn insert_prompt_tag(&mut self, version_id: Uuid, tag_id: Uuid) -> Result<()>;
    async fn insert_principle_ref(&mut self, reference: &NewPrincipleRef) -> Result<()>;
    async fn upsert_client(&mut self, name: &str) -> Result<Uuid>;
    async fn insert_client_mapping(&mut self, mapping: &NewClientMapping) -> Result<()>;
    async fn clear_latest_flag(&mut self, prompt_id: Uuid, except_version_id: Uuid) -> Result<()>;
    async fn set_version_flags(
        &mut self,
        version_id: Uuid,
        is_active: bool,
        is_latest: bool,
    ) -> Result<()>;
    async fn delete_vector(&mut self, version_id: Uuid) -> Result<()>;
    async fn update_prompt_root(&mut self, prompt_id: Uuid, update: &PromptRootUpdate) -> Result<()>;
    async fn upsert_vector(&mut self, version_id: Uuid, vector: &[f32]) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

pub(crate) fn conflict(msg: impl Into<String>) -> crate::error::PromptError {
    StoreError::Conflict(msg.into()).into()
}

pub(crate) fn not_found(msg: impl Into<String>) -> crate::error::PromptError {
    StoreError::NotFound(msg.into()).into()
}
