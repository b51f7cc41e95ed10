//! `PromptManager`: the orchestrator tying `Store`, `VectorIndex`,
//! `EmbeddingProvider`, `TemplateRenderer`, `Cache`, and `UpdateQueue`
//! together into the public `create`/`update`/`delete`/`activate`/`get`/
//! `search`/`create_principle` operations.

use crate::cache::{self, Cache};
use crate::embeddings::EmbeddingProvider;
use crate::error::{PromptError, Result};
use crate::model::{
    LlmConfig, Prompt, PromptRole, ResolvedLlmParams, ResolvedPrinciple, RoleType, Version,
    VersionType, calculate_version,
};
use crate::queue::UpdateQueue;
use crate::store::{NewClientMapping, NewPrincipleRef, NewVersion, PromptRootUpdate, Store, Transaction, VersionSummary};
use crate::template;
use crate::time_sync::PreciseTime;
use crate::utils::sha256_hex;
use crate::vector::VectorIndex;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

static PROMPT_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid regex"));

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 200 || !PROMPT_NAME.is_match(name) {
        return Err(PromptError::Validation(format!(
            "invalid prompt name '{name}': must match {}",
            PROMPT_NAME.as_str()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Request/response shapes
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleInput {
    pub role_type: RoleType,
    pub content: String,
    pub order: i32,
    pub template_variables: Option<HashMap<String, crate::model::TemplateVarDef>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipleRefInput {
    pub principle_name: String,
    /// `"latest"` or an exact `"MAJOR.MINOR"` string.
    pub ref_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRequest {
    pub name: String,
    pub description: String,
    pub roles: Vec<RoleInput>,
    pub version_type: VersionType,
    pub tags: Option<Vec<String>>,
    pub llm_config: Option<LlmConfig>,
    pub client_type: Option<String>,
    pub principle_refs: Option<Vec<PrincipleRefInput>>,
    pub change_log: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOutcome {
    pub prompt_id: Uuid,
    pub version: Version,
    pub version_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipleSummary {
    pub id: Uuid,
    pub name: String,
    pub version: Version,
    pub is_active: bool,
    pub is_latest: bool,
    pub created_at: DateTime<Utc>,
}

/// One principle/role reference resolved (existence-checked) against the
/// store, ready to persist verbatim as a `NewPrincipleRef`.
struct ResolvedRef {
    principle_name: String,
    ref_version: String,
    order: i32,
}

// ---------------------------------------------------------------------
// get() output shapes
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Openai,
    Formatted,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiRequest {
    pub messages: Vec<Message>,
    #[serde(flatten)]
    pub params: ResolvedLlmParams,
}

/// Union of the three shapes `get` can hand back. The `Both` case carries
/// `source_version` for telemetry, exposed only through
/// [`RenderedOutput::source_version`] rather than a field callers might
/// stumble onto.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RenderedOutput {
    Openai(OpenAiRequest),
    Formatted(Vec<Message>),
    Both {
        openai: OpenAiRequest,
        formatted: Vec<Message>,
        source_version: String,
    },
}

impl RenderedOutput {
    pub fn source_version(&self) -> Option<&str> {
        match self {
            RenderedOutput::Both { source_version, .. } => Some(source_version),
            _ => None,
        }
    }
}

/// The JSON-serializable shape actually stored in the cache; `get` rebuilds
/// the requested `RenderedOutput` variant from this on a cache hit so a
/// single cached render serves any output format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedRender {
    messages: Vec<Message>,
    params: ResolvedLlmParams,
    version: String,
}

impl CachedRender {
    fn into_output(self, format: OutputFormat) -> RenderedOutput {
        match format {
            OutputFormat::Openai => RenderedOutput::Openai(OpenAiRequest {
                messages: self.messages,
                params: self.params,
            }),
            OutputFormat::Formatted => RenderedOutput::Formatted(self.messages),
            OutputFormat::Both => RenderedOutput::Both {
                openai: OpenAiRequest {
                    messages: self.messages.clone(),
                    params: self.params,
                },
                formatted: self.messages,
                source_version: self.version,
            },
        }
    }
}

// ---------------------------------------------------------------------
// search() request/response shapes
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchLogic {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionFilter {
    Latest,
    All,
    Specific(Version),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: Option<String>,
    pub tags: Option<Vec<String>>,
    pub logic: SearchLogic,
    pub version_filter: VersionFilter,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchItem {
    pub prompt_id: Uuid,
    pub name: String,
    pub version: Version,
    pub description: String,
    pub tags: Vec<String>,
    pub similarity: Option<f32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub total: usize,
    pub items: Vec<SearchItem>,
}

fn union(a: &[Uuid], b: &[Uuid]) -> Vec<Uuid> {
    let mut seen: HashSet<Uuid> = HashSet::new();
    let mut out = Vec::new();
    for id in a.iter().chain(b.iter()) {
        if seen.insert(*id) {
            out.push(*id);
        }
    }
    out
}

fn intersect(a: &[Uuid], b: &[Uuid]) -> Vec<Uuid> {
    let b_set: HashSet<Uuid> = b.iter().copied().collect();
    a.iter().copied().filter(|id| b_set.contains(id)).collect()
}

// ---------------------------------------------------------------------
// PromptManager
// ---------------------------------------------------------------------

#[derive(Clone)]
pub struct PromptManager {
    store: Arc<dyn Store>,
    vector_index: Arc<dyn VectorIndex>,
    embeddings: Arc<EmbeddingProvider>,
    cache: Arc<Cache>,
    queue: UpdateQueue,
    clock: PreciseTime,
}

impl PromptManager {
    pub fn new(
        store: Arc<dyn Store>,
        vector_index: Arc<dyn VectorIndex>,
        embeddings: Arc<EmbeddingProvider>,
        cache: Arc<Cache>,
        queue: UpdateQueue,
        clock: PreciseTime,
    ) -> Self {
        Self {
            store,
            vector_index,
            embeddings,
            cache,
            queue,
            clock,
        }
    }

    async fn invalidate_cache(&self, name: &str) {
        self.cache.invalidate(&cache::cache_key(name, "latest")).await;
        self.cache.invalidate_pattern(name).await;
    }

    // -------------------------------------------------------------
    // create
    // -------------------------------------------------------------

    pub async fn create(&self, request: CreateRequest) -> Result<CreateOutcome> {
        self.create_inner(request).await
    }

    async fn create_inner(&self, request: CreateRequest) -> Result<CreateOutcome> {
        validate_name(&request.name)?;
        if request.roles.is_empty() {
            return Err(PromptError::Validation(
                "at least one role is required".into(),
            ));
        }

        let existing_prompt = self.store.get_prompt_by_name(&request.name).await?;
        let latest_info = match &existing_prompt {
            Some(p) => self.store.get_latest_version_info(p.id).await?,
            None => None,
        };
        let new_version = calculate_version(latest_info.as_ref().map(|l| l.version), request.version_type);
        let version_number = latest_info.as_ref().map(|l| l.version_number).unwrap_or(0) + 1;
        let version_id = Uuid::new_v4();

        let refs = self.resolve_principle_refs(&request).await?;
        let embedding = self.embeddings.generate(&request.description).await;
        let now = self.clock.now();

        let mut tx = self.store.begin().await?;
        let apply_result = self
            .apply_create(
                tx.as_mut(),
                existing_prompt.as_ref().map(|p| p.id),
                &request,
                new_version,
                version_number,
                version_id,
                &refs,
                &embedding,
                now,
            )
            .await;

        let prompt_id = match apply_result {
            Ok(id) => {
                tx.commit().await?;
                id
            }
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        };

        self.invalidate_cache(&request.name).await;

        Ok(CreateOutcome {
            prompt_id,
            version: new_version,
            version_id,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_create(
        &self,
        tx: &mut dyn Transaction,
        existing_prompt_id: Option<Uuid>,
        request: &CreateRequest,
        new_version: Version,
        version_number: i64,
        version_id: Uuid,
        refs: &[ResolvedRef],
        embedding: &[f32],
        now: DateTime<Utc>,
    ) -> Result<Uuid> {
        let prompt_id = match existing_prompt_id {
            Some(id) => id,
            None => tx.insert_prompt(&request.name, now).await?,
        };

        tx.insert_version(&NewVersion {
            id: version_id,
            prompt_id,
            version: new_version,
            version_number,
            description: request.description.clone(),
            is_active: true,
            is_latest: true,
            change_log: request.change_log.clone(),
            created_at: now,
        })
        .await?;

        let roles: Vec<PromptRole> = request
            .roles
            .iter()
            .map(|r| PromptRole {
                version_id,
                role_type: r.role_type,
                content: r.content.clone(),
                order: r.order,
                template_variables: r.template_variables.clone(),
            })
            .collect();
        tx.insert_roles(&roles).await?;

        let default_config = LlmConfig::default();
        tx.insert_llm_config(version_id, request.llm_config.as_ref().unwrap_or(&default_config))
            .await?;

        for tag in request.tags.iter().flatten() {
            let tag_id = tx.upsert_tag(tag).await?;
            tx.insert_prompt_tag(version_id, tag_id).await?;
        }

        for r in refs {
            tx.insert_principle_ref(&NewPrincipleRef {
                version_id,
                principle_name: r.principle_name.clone(),
                ref_version: r.ref_version.clone(),
                order: r.order,
            })
            .await?;
        }

        if let Some(client_name) = &request.client_type {
            tx.upsert_client(client_name).await?;
            tx.insert_client_mapping(&NewClientMapping {
                version_id,
                client_name: client_name.clone(),
            })
            .await?;
        }

        tx.clear_latest_flag(prompt_id, version_id).await?;
        tx.upsert_vector(version_id, embedding).await?;
        tx.update_prompt_root(
            prompt_id,
            &PromptRootUpdate {
                content: request.description.clone(),
                sync_hash: sha256_hex(&request.description),
                updated_at: now,
                is_deleted: false,
            },
        )
        .await?;

        Ok(prompt_id)
    }

    /// Validates and flattens `principle_refs`, then merges in the named
    /// client's `default_principles` (skipping names already referenced,
    /// appending with monotonically increasing `order`).
    async fn resolve_principle_refs(&self, request: &CreateRequest) -> Result<Vec<ResolvedRef>> {
        let mut refs = Vec::new();
        for (idx, r) in request.principle_refs.iter().flatten().enumerate() {
            let resolved = self
                .store
                .resolve_principle_version(&r.principle_name, &r.ref_version)
                .await?;
            if resolved.is_none() {
                return Err(PromptError::Validation(format!(
                    "principle '{}' has no version matching '{}'",
                    r.principle_name, r.ref_version
                )));
            }
            refs.push(ResolvedRef {
                principle_name: r.principle_name.clone(),
                ref_version: r.ref_version.clone(),
                order: idx as i32,
            });
        }

        if let Some(client_name) = &request.client_type {
            let defaults = self.store.get_client_defaults(client_name).await?;
            let mut next_order = refs.iter().map(|r| r.order).max().map(|m| m + 1).unwrap_or(0);
            for d in defaults {
                if refs.iter().any(|r| r.principle_name == d.principle_name) {
                    continue;
                }
                let resolved = self
                    .store
                    .resolve_principle_version(&d.principle_name, &d.version)
                    .await?;
                if resolved.is_none() {
                    return Err(PromptError::Validation(format!(
                        "client default principle '{}' has no version matching '{}'",
                        d.principle_name, d.version
                    )));
                }
                refs.push(ResolvedRef {
                    principle_name: d.principle_name,
                    ref_version: d.version,
                    order: next_order,
                });
                next_order += 1;
            }
        }
        Ok(refs)
    }

    // -------------------------------------------------------------
    // update
    // -------------------------------------------------------------

    /// Enqueues the update and returns its eventual outcome. Runs serially
    /// against every other `create`/`update` through the `UpdateQueue`.
    pub async fn update(
        &self,
        name: String,
        expected_version_number: i64,
        request: CreateRequest,
    ) -> Result<CreateOutcome> {
        let manager = self.clone();
        self.queue
            .enqueue(move || {
                Box::pin(async move {
                    manager
                        .execute_update(name, expected_version_number, request)
                        .await
                })
            })
            .await
    }

    async fn execute_update(
        &self,
        name: String,
        expected_version_number: i64,
        mut request: CreateRequest,
    ) -> Result<CreateOutcome> {
        request.name = name.clone();
        let mut expected = expected_version_number;
        let mut rebased = false;
        loop {
            let current_number = self.current_version_number(&name).await?;
            if current_number == expected {
                return self.create_inner(request).await;
            }
            if rebased {
                return Err(PromptError::OptimisticLock {
                    expected,
                    found: current_number,
                });
            }
            rebased = true;
            expected = current_number;
            request.version_type = VersionType::Minor;
        }
    }

    async fn current_version_number(&self, name: &str) -> Result<i64> {
        let Some(prompt) = self.store.get_prompt_by_name(name).await? else {
            return Ok(0);
        };
        Ok(self
            .store
            .get_latest_version_info(prompt.id)
            .await?
            .map(|l| l.version_number)
            .unwrap_or(0))
    }

    // -------------------------------------------------------------
    // delete
    // -------------------------------------------------------------

    pub async fn delete(&self, name: &str, version: Option<Version>) -> Result<()> {
        let prompt = self
            .store
            .get_prompt_by_name(name)
            .await?
            .ok_or_else(|| PromptError::NotFound(format!("prompt '{name}' not found")))?;
        let versions = self.store.list_versions_of(prompt.id).await?;

        let mut tx = self.store.begin().await?;
        let result = self.apply_delete(tx.as_mut(), &versions, version).await;
        match result {
            Ok(()) => tx.commit().await?,
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        }

        self.invalidate_cache(name).await;
        Ok(())
    }

    async fn apply_delete(
        &self,
        tx: &mut dyn Transaction,
        versions: &[VersionSummary],
        version: Option<Version>,
    ) -> Result<()> {
        let active: Vec<&VersionSummary> = versions.iter().filter(|v| v.is_active).collect();

        match version {
            Some(v) => {
                let target = active
                    .iter()
                    .find(|x| x.version == v)
                    .copied()
                    .ok_or_else(|| PromptError::NotFound(format!("version '{v}' not found")))?;
                if active.len() == 1 {
                    return Err(PromptError::Validation(
                        "cannot delete the only active version".into(),
                    ));
                }
                tx.set_version_flags(target.version_id, false, false).await?;
                tx.delete_vector(target.version_id).await?;
            }
            None => {
                if active.is_empty() {
                    return Err(PromptError::Validation("no active version to delete".into()));
                }
                if active.len() == 1 {
                    return Err(PromptError::Validation(
                        "cannot delete the only active version".into(),
                    ));
                }
                let keep = active
                    .iter()
                    .find(|v| v.is_latest)
                    .copied()
                    .unwrap_or_else(|| active.iter().max_by_key(|v| v.created_at).expect("active is non-empty"));
                for v in &active {
                    if v.version_id != keep.version_id {
                        tx.set_version_flags(v.version_id, false, false).await?;
                        tx.delete_vector(v.version_id).await?;
                    }
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------
    // activate
    // -------------------------------------------------------------

    pub async fn activate(&self, name: &str, version: Version) -> Result<()> {
        let prompt = self
            .store
            .get_prompt_by_name(name)
            .await?
            .ok_or_else(|| PromptError::NotFound(format!("prompt '{name}' not found")))?;
        let target = self
            .store
            .find_version(name, version)
            .await?
            .ok_or_else(|| PromptError::NotFound(format!("version '{version}' not found")))?;
        let versions = self.store.list_versions_of(prompt.id).await?;

        let mut tx = self.store.begin().await?;
        let result = self.apply_activate(tx.as_mut(), &versions, target.version_id).await;
        match result {
            Ok(()) => tx.commit().await?,
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        }

        self.invalidate_cache(name).await;
        Ok(())
    }

    async fn apply_activate(
        &self,
        tx: &mut dyn Transaction,
        versions: &[VersionSummary],
        target_id: Uuid,
    ) -> Result<()> {
        for v in versions {
            if v.version_id != target_id {
                tx.set_version_flags(v.version_id, false, false).await?;
            }
        }
        tx.set_version_flags(target_id, true, true).await?;
        Ok(())
    }

    // -------------------------------------------------------------
    // create_principle
    // -------------------------------------------------------------

    pub async fn create_principle(
        &self,
        name: &str,
        version: Version,
        content: &str,
        is_active: bool,
        is_latest: bool,
    ) -> Result<PrincipleSummary> {
        if name.is_empty() {
            return Err(PromptError::Validation("principle name must not be empty".into()));
        }
        let now = self.clock.now();
        let id = self
            .store
            .create_principle(name, version, content, is_active, is_latest, now)
            .await?;
        Ok(PrincipleSummary {
            id,
            name: name.to_string(),
            version,
            is_active,
            is_latest,
            created_at: now,
        })
    }

    // -------------------------------------------------------------
    // get
    // -------------------------------------------------------------

    pub async fn get(
        &self,
        name: &str,
        version: Option<&str>,
        format: OutputFormat,
        template_vars: Option<HashMap<String, String>>,
        runtime_params: Option<serde_json::Value>,
    ) -> Result<RenderedOutput> {
        let version_or_latest = version.unwrap_or("latest");
        let key = cache::cache_key(name, version_or_latest);

        if let Some(bytes) = self.cache.get(&key).await {
            if let Ok(cached) = serde_json::from_slice::<CachedRender>(&bytes) {
                return Ok(cached.into_output(format));
            }
            warn!(name, version_or_latest, "failed to deserialize cached render, re-rendering");
        }

        let full = self
            .store
            .load_full_version(name, version_or_latest)
            .await?
            .ok_or_else(|| PromptError::NotFound(format!("prompt '{name}' ({version_or_latest}) not found")))?;

        let mut messages = Vec::with_capacity(full.principles.len() + full.roles.len());

        let mut principles: Vec<&ResolvedPrinciple> = full.principles.iter().collect();
        principles.sort_by_key(|p| p.order);
        for p in principles {
            messages.push(Message {
                role: "system".to_string(),
                content: format!("[Principle] {}", p.content),
            });
        }

        let vars = template_vars.unwrap_or_default();
        let mut roles: Vec<&PromptRole> = full.roles.iter().collect();
        roles.sort_by_key(|r| r.order);
        for role in roles {
            let var_defs = role.template_variables.clone().unwrap_or_default();
            let rendered = template::render(&role.content, &vars, &var_defs)?;
            messages.push(Message {
                role: role_type_label(role.role_type).to_string(),
                content: rendered,
            });
        }

        let mut params = ResolvedLlmParams::from_config(&full.llm_config);
        if let Some(runtime) = &runtime_params {
            params = params.overlay(runtime);
        }

        let cached = CachedRender {
            messages,
            params,
            version: full.version.version.to_string(),
        };

        if let Ok(bytes) = serde_json::to_vec(&cached) {
            self.cache.insert(&key, bytes).await;
        }

        Ok(cached.into_output(format))
    }

    // -------------------------------------------------------------
    // search
    // -------------------------------------------------------------

    pub async fn search(&self, request: SearchRequest) -> Result<SearchResult> {
        let mut similarity: HashMap<Uuid, f32> = HashMap::new();

        let v_set: Option<Vec<Uuid>> = if let Some(query) = &request.query {
            let query_vector = self.embeddings.generate(query).await;
            let k = (request.limit * 2).max(1);
            match self.vector_index.search(&query_vector, k).await {
                Ok(hits) => {
                    let ids: Vec<Uuid> = hits
                        .into_iter()
                        .map(|(id, sim)| {
                            similarity.insert(id, sim);
                            id
                        })
                        .collect();
                    Some(ids)
                }
                Err(e) => {
                    warn!(error = %e, "vector search degraded, falling back to keyword search");
                    Some(Vec::new())
                }
            }
        } else {
            None
        };

        let t_set: Option<Vec<Uuid>> = match &request.tags {
            Some(tags) if !tags.is_empty() => {
                Some(self.store.search_versions_with_all_tags(tags).await?)
            }
            _ => None,
        };

        let needs_keyword = request
            .query
            .as_ref()
            .is_some_and(|_| v_set.as_ref().is_some_and(|v| v.is_empty()));
        let k_set: Option<Vec<Uuid>> = if needs_keyword {
            Some(
                self.store
                    .search_versions_by_keyword(request.query.as_deref().unwrap_or(""))
                    .await?,
            )
        } else {
            None
        };

        let vk_union: Option<Vec<Uuid>> = match (&v_set, &k_set) {
            (Some(v), Some(k)) => Some(union(v, k)),
            (Some(v), None) => Some(v.clone()),
            (None, Some(k)) => Some(k.clone()),
            (None, None) => None,
        };

        let candidate_ids: Option<Vec<Uuid>> = match (&vk_union, &t_set) {
            (Some(vk), Some(t)) => Some(match request.logic {
                SearchLogic::And => intersect(vk, t),
                SearchLogic::Or => union(vk, t),
            }),
            (Some(vk), None) => Some(vk.clone()),
            (None, Some(t)) => Some(t.clone()),
            (None, None) => None,
        };

        if let Some(ids) = &candidate_ids {
            if ids.is_empty() {
                return Ok(SearchResult { total: 0, items: vec![] });
            }
        }

        let rows: Vec<(Prompt, VersionSummary, Vec<String>)> = match &candidate_ids {
            Some(ids) => self.store.load_version_rows(ids).await?,
            None => self.store.list_all_latest_versions().await?,
        };

        let mut filtered: Vec<(Prompt, VersionSummary, Vec<String>)> = rows
            .into_iter()
            .filter(|(_, v, _)| {
                if !v.is_active {
                    return false;
                }
                match &request.version_filter {
                    VersionFilter::Latest => v.is_latest,
                    VersionFilter::All => true,
                    VersionFilter::Specific(ver) => v.version == *ver,
                }
            })
            .collect();

        let ranking_by_similarity = v_set.as_ref().is_some_and(|v| !v.is_empty());
        if ranking_by_similarity {
            filtered.sort_by(|a, b| {
                let sa = similarity.get(&a.1.version_id).copied().unwrap_or(0.0);
                let sb = similarity.get(&b.1.version_id).copied().unwrap_or(0.0);
                sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
            });
        } else {
            filtered.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at));
        }

        let total = filtered.len();
        let items = filtered
            .into_iter()
            .skip(request.offset)
            .take(request.limit)
            .map(|(prompt, v, tags)| SearchItem {
                prompt_id: prompt.id,
                name: prompt.name,
                version: v.version,
                description: v.description,
                tags,
                similarity: similarity.get(&v.version_id).copied(),
                created_at: v.created_at,
            })
            .collect();

        Ok(SearchResult { total, items })
    }
}

fn role_type_label(role_type: RoleType) -> &'static str {
    match role_type {
        RoleType::System => "system",
        RoleType::User => "user",
        RoleType::Assistant => "assistant",
        RoleType::Principle => "system",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names_accept_common_shapes() {
        assert!(validate_name("greet").is_ok());
        assert!(validate_name("greet_v2").is_ok());
        assert!(validate_name("Greet_V2_special").is_ok());
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(validate_name("").is_err());
        assert!(validate_name(" leading-space").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("greet-v2").is_err());
        assert!(validate_name("greet.special").is_err());
    }

    #[test]
    fn union_dedupes_preserving_first_occurrence() {
        let a = vec![Uuid::nil(), Uuid::max()];
        let b = vec![Uuid::max()];
        let result = union(&a, &b);
        assert_eq!(result, vec![Uuid::nil(), Uuid::max()]);
    }

    #[test]
    fn intersect_keeps_only_common_ids() {
        let one = Uuid::new_v4();
        let two = Uuid::new_v4();
        let a = vec![one, two];
        let b = vec![two];
        assert_eq!(intersect(&a, &b), vec![two]);
    }

    #[test]
    fn cached_render_into_output_both_carries_source_version() {
        let cached = CachedRender {
            messages: vec![Message {
                role: "system".into(),
                content: "hi".into(),
            }],
            params: ResolvedLlmParams::defaults(),
            version: "1.2".to_string(),
        };
        let output = cached.into_output(OutputFormat::Both);
        assert_eq!(output.source_version(), Some("1.2"));
    }

    #[test]
    fn cached_render_into_output_openai_has_no_source_version() {
        let cached = CachedRender {
            messages: vec![],
            params: ResolvedLlmParams::defaults(),
            version: "1.0".to_string(),
        };
        let output = cached.into_output(OutputFormat::Openai);
        assert_eq!(output.source_version(), None);
    }
}
