//! Deterministic in-memory `Store`/`Transaction` test double, grounded in
//! the same test-double convention as [`crate::vector::InMemoryVectorIndex`]
//! and [`crate::embeddings::FakeEmbedder`]: a plain public type (not
//! `#[cfg(test)]`-gated) so integration tests in `tests/` can exercise
//! `PromptManager` end to end without a live SurrealDB or Postgres
//! instance.
//!
//! `begin()` snapshots the whole data set; `rollback` restores it;
//! `commit` is a no-op since every write already lands directly in the
//! shared store (there is no client/server boundary to buffer across).

use super::{
    LatestVersionInfo, NewClientMapping, NewPrincipleRef, NewVersion, PromptRootUpdate, Store,
    Transaction, VersionSummary, conflict, not_found,
};
use crate::error::Result;
use crate::model::{
    DefaultPrincipleEntry, FullVersion, LlmConfig, Prompt, PromptRole, ResolvedPrinciple, Version,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct VersionRow {
    prompt_id: Uuid,
    version: Version,
    version_number: i64,
    description: String,
    is_active: bool,
    is_latest: bool,
    change_log: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct PrincipleRow {
    id: Uuid,
    version: Version,
    content: String,
    is_active: bool,
    is_latest: bool,
}

#[derive(Debug, Clone, Default)]
struct MemoryData {
    prompts: HashMap<Uuid, Prompt>,
    versions: HashMap<Uuid, VersionRow>,
    roles: HashMap<Uuid, Vec<PromptRole>>,
    llm_configs: HashMap<Uuid, LlmConfig>,
    tags: HashMap<Uuid, String>,
    prompt_tags: HashMap<Uuid, Vec<Uuid>>,
    principle_refs: HashMap<Uuid, Vec<NewPrincipleRef>>,
    // keyed by (name, version string)
    principles: HashMap<(String, String), PrincipleRow>,
    clients: HashMap<String, Uuid>,
    client_defaults: HashMap<String, Vec<DefaultPrincipleEntry>>,
    app_config: HashMap<String, String>,
}

impl MemoryData {
    fn find_prompt_by_name(&self, name: &str) -> Option<&Prompt> {
        self.prompts.values().find(|p| p.name == name && !p.is_deleted)
    }

    fn tags_for(&self, version_id: Uuid) -> Vec<String> {
        self.prompt_tags
            .get(&version_id)
            .map(|ids| ids.iter().filter_map(|id| self.tags.get(id).cloned()).collect())
            .unwrap_or_default()
    }
}

#[derive(Clone, Default)]
pub struct InMemoryStore {
    data: Arc<Mutex<MemoryData>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn version_summary(id: Uuid, row: &VersionRow) -> VersionSummary {
    VersionSummary {
        version_id: id,
        version: row.version,
        version_number: row.version_number,
        description: row.description.clone(),
        is_active: row.is_active,
        is_latest: row.is_latest,
        created_at: row.created_at,
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_prompt_by_name(&self, name: &str) -> Result<Option<Prompt>> {
        Ok(self.data.lock().unwrap().find_prompt_by_name(name).cloned())
    }

    async fn get_latest_version_info(&self, prompt_id: Uuid) -> Result<Option<LatestVersionInfo>> {
        let data = self.data.lock().unwrap();
        Ok(data
            .versions
            .iter()
            .find(|(_, v)| v.prompt_id == prompt_id && v.is_latest)
            .map(|(id, v)| LatestVersionInfo {
                version_id: *id,
                version: v.version,
                version_number: v.version_number,
            }))
    }

    async fn list_versions_of(&self, prompt_id: Uuid) -> Result<Vec<VersionSummary>> {
        let data = self.data.lock().unwrap();
        let mut rows: Vec<_> = data
            .versions
            .iter()
            .filter(|(_, v)| v.prompt_id == prompt_id)
            .map(|(id, v)| version_summary(*id, v))
            .collect();
        rows.sort_by_key(|v| v.version_number);
        Ok(rows)
    }

    async fn load_full_version(
        &self,
        name: &str,
        version_or_latest: &str,
    ) -> Result<Option<FullVersion>> {
        let data = self.data.lock().unwrap();
        let Some(prompt) = data.find_prompt_by_name(name).cloned() else {
            return Ok(None);
        };

        let found = if version_or_latest == "latest" {
            data.versions.iter().find(|(_, v)| v.prompt_id == prompt.id && v.is_latest)
        } else {
            let Some(target) = Version::parse(version_or_latest) else {
                return Ok(None);
            };
            data.versions
                .iter()
                .find(|(_, v)| v.prompt_id == prompt.id && v.version == target && v.is_active)
        };
        let Some((version_id, row)) = found else {
            return Ok(None);
        };
        let version_id = *version_id;

        let mut roles = data.roles.get(&version_id).cloned().unwrap_or_default();
        roles.sort_by_key(|r| r.order);

        let mut principles = Vec::new();
        if let Some(refs) = data.principle_refs.get(&version_id) {
            let mut refs = refs.clone();
            refs.sort_by_key(|r| r.order);
            for reference in refs {
                let resolved = if reference.ref_version == "latest" {
                    data.principles
                        .iter()
                        .find(|((n, _), p)| *n == reference.principle_name && p.is_latest)
                        .map(|(_, p)| p)
                } else {
                    data.principles.get(&(reference.principle_name.clone(), reference.ref_version.clone()))
                };
                let Some(resolved) = resolved else {
                    return Err(not_found(format!(
                        "principle '{}' version '{}' not found",
                        reference.principle_name, reference.ref_version
                    )));
                };
                principles.push(ResolvedPrinciple {
                    order: reference.order,
                    content: resolved.content.clone(),
                });
            }
        }

        let llm_config = data.llm_configs.get(&version_id).cloned().unwrap_or_default();
        let tags = data.tags_for(version_id);

        Ok(Some(FullVersion {
            prompt,
            version: crate::model::PromptVersion {
                id: version_id,
                prompt_id: row.prompt_id,
                version: row.version,
                version_number: row.version_number,
                description: row.description.clone(),
                is_active: row.is_active,
                is_latest: row.is_latest,
                change_log: row.change_log.clone(),
                created_at: row.created_at,
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
        let data = self.data.lock().unwrap();
        Ok(data
            .prompt_tags
            .iter()
            .filter(|(_, tag_ids)| {
                let names: Vec<&String> = tag_ids.iter().filter_map(|id| data.tags.get(id)).collect();
                tags.iter().all(|t| names.contains(&t))
            })
            .map(|(version_id, _)| *version_id)
            .collect())
    }

    async fn search_versions_by_keyword(&self, text: &str) -> Result<Vec<Uuid>> {
        let needle = text.to_lowercase();
        let data = self.data.lock().unwrap();
        Ok(data
            .versions
            .iter()
            .filter(|(_, v)| {
                let prompt_name = data
                    .prompts
                    .get(&v.prompt_id)
                    .map(|p| p.name.to_lowercase())
                    .unwrap_or_default();
                prompt_name.contains(&needle) || v.description.to_lowercase().contains(&needle)
            })
            .map(|(id, _)| *id)
            .collect())
    }

    async fn list_all_latest_versions(&self) -> Result<Vec<(Prompt, VersionSummary, Vec<String>)>> {
        let data = self.data.lock().unwrap();
        Ok(data
            .versions
            .iter()
            .filter(|(_, v)| v.is_latest && v.is_active)
            .filter_map(|(id, v)| {
                let prompt = data.prompts.get(&v.prompt_id)?.clone();
                Some((prompt, version_summary(*id, v), data.tags_for(*id)))
            })
            .collect())
    }

    async fn find_version(&self, name: &str, version: Version) -> Result<Option<VersionSummary>> {
        let data = self.data.lock().unwrap();
        let Some(prompt) = data.find_prompt_by_name(name) else {
            return Ok(None);
        };
        Ok(data
            .versions
            .iter()
            .find(|(_, v)| v.prompt_id == prompt.id && v.version == version)
            .map(|(id, v)| version_summary(*id, v)))
    }

    async fn load_version_rows(&self, version_ids: &[Uuid]) -> Result<Vec<(Prompt, VersionSummary, Vec<String>)>> {
        let data = self.data.lock().unwrap();
        Ok(version_ids
            .iter()
            .filter_map(|id| {
                let v = data.versions.get(id)?;
                let prompt = data.prompts.get(&v.prompt_id)?.clone();
                Some((prompt, version_summary(*id, v), data.tags_for(*id)))
            })
            .collect())
    }

    async fn get_app_config(&self, key: &str) -> Result<Option<String>> {
        Ok(self.data.lock().unwrap().app_config.get(key).cloned())
    }

    async fn list_prompts_updated_after(&self, since: DateTime<Utc>) -> Result<Vec<Prompt>> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .prompts
            .values()
            .filter(|p| p.updated_at > since)
            .cloned()
            .collect())
    }

    async fn upsert_prompt_verbatim(&self, prompt: &Prompt) -> Result<()> {
        self.data.lock().unwrap().prompts.insert(prompt.id, prompt.clone());
        Ok(())
    }

    async fn set_app_config(&self, key: &str, value: &str) -> Result<()> {
        self.data
            .lock()
            .unwrap()
            .app_config
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn resolve_principle_version(&self, name: &str, ref_version: &str) -> Result<Option<Version>> {
        let data = self.data.lock().unwrap();
        if ref_version == "latest" {
            Ok(data
                .principles
                .iter()
                .find(|((n, _), p)| n == name && p.is_latest)
                .map(|(_, p)| p.version))
        } else {
            let Some(target) = Version::parse(ref_version) else {
                return Ok(None);
            };
            Ok(data
                .principles
                .get(&(name.to_string(), target.to_string()))
                .map(|p| p.version))
        }
    }

    async fn create_principle(
        &self,
        name: &str,
        version: Version,
        content: &str,
        is_active: bool,
        is_latest: bool,
        _created_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let mut data = self.data.lock().unwrap();
        if is_latest {
            for ((n, _), p) in data.principles.iter_mut() {
                if n == name {
                    p.is_latest = false;
                }
            }
        }
        let id = Uuid::new_v4();
        data.principles.insert(
            (name.to_string(), version.to_string()),
            PrincipleRow {
                id,
                version,
                content: content.to_string(),
                is_active,
                is_latest,
            },
        );
        Ok(id)
    }

    async fn get_client_defaults(&self, name: &str) -> Result<Vec<DefaultPrincipleEntry>> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .client_defaults
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let snapshot = self.data.lock().unwrap().clone();
        Ok(Box::new(InMemoryTransaction {
            store: self.data.clone(),
            snapshot: Some(snapshot),
        }))
    }
}

pub struct InMemoryTransaction {
    store: Arc<Mutex<MemoryData>>,
    snapshot: Option<MemoryData>,
}

impl InMemoryTransaction {
    fn with_data<T>(&self, f: impl FnOnce(&mut MemoryData) -> T) -> T {
        let mut guard = self.store.lock().unwrap();
        f(&mut guard)
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn insert_prompt(&mut self, name: &str, created_at: DateTime<Utc>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let name = name.to_string();
        self.with_data(|data| {
            data.prompts.insert(
                id,
                Prompt {
                    id,
                    name,
                    content: String::new(),
                    sync_hash: String::new(),
                    created_at,
                    updated_at: created_at,
                    is_deleted: false,
                },
            );
        });
        Ok(id)
    }

    async fn insert_version(&mut self, version: &NewVersion) -> Result<()> {
        let version = version.clone();
        self.with_data(|data| {
            data.versions.insert(
                version.id,
                VersionRow {
                    prompt_id: version.prompt_id,
                    version: version.version,
                    version_number: version.version_number,
                    description: version.description,
                    is_active: version.is_active,
                    is_latest: version.is_latest,
                    change_log: version.change_log,
                    created_at: version.created_at,
                },
            );
        });
        Ok(())
    }

    async fn insert_roles(&mut self, roles: &[PromptRole]) -> Result<()> {
        let roles = roles.to_vec();
        self.with_data(|data| {
            for role in roles {
                data.roles.entry(role.version_id).or_default().push(role);
            }
        });
        Ok(())
    }

    async fn insert_llm_config(&mut self, version_id: Uuid, config: &LlmConfig) -> Result<()> {
        let config = config.clone();
        self.with_data(|data| {
            data.llm_configs.insert(version_id, config);
        });
        Ok(())
    }

    async fn upsert_tag(&mut self, name: &str) -> Result<Uuid> {
        let name = name.to_string();
        Ok(self.with_data(|data| {
            if let Some((id, _)) = data.tags.iter().find(|(_, n)| **n == name) {
                return *id;
            }
            let id = Uuid::new_v4();
            data.tags.insert(id, name);
            id
        }))
    }

    async fn insert_prompt_tag(&mut self, version_id: Uuid, tag_id: Uuid) -> Result<()> {
        self.with_data(|data| {
            let entry = data.prompt_tags.entry(version_id).or_default();
            if !entry.contains(&tag_id) {
                entry.push(tag_id);
            }
        });
        Ok(())
    }

    async fn insert_principle_ref(&mut self, reference: &NewPrincipleRef) -> Result<()> {
        let reference = reference.clone();
        self.with_data(|data| {
            data.principle_refs.entry(reference.version_id).or_default().push(reference);
        });
        Ok(())
    }

    async fn upsert_client(&mut self, name: &str) -> Result<Uuid> {
        let name = name.to_string();
        Ok(self.with_data(|data| {
            *data.clients.entry(name).or_insert_with(Uuid::new_v4)
        }))
    }

    async fn insert_client_mapping(&mut self, mapping: &NewClientMapping) -> Result<()> {
        // Mappings are not read back by any Store method in the current
        // contract; recording the client is enough for `get_client_defaults`
        // lookups to work against names set up via configuration/fixtures.
        let _ = self.upsert_client(&mapping.client_name).await?;
        Ok(())
    }

    async fn clear_latest_flag(&mut self, prompt_id: Uuid, except_version_id: Uuid) -> Result<()> {
        self.with_data(|data| {
            for (id, v) in data.versions.iter_mut() {
                if v.prompt_id == prompt_id && *id != except_version_id {
                    v.is_latest = false;
                }
            }
        });
        Ok(())
    }

    async fn set_version_flags(&mut self, version_id: Uuid, is_active: bool, is_latest: bool) -> Result<()> {
        self.with_data(|data| {
            if let Some(v) = data.versions.get_mut(&version_id) {
                v.is_active = is_active;
                v.is_latest = is_latest;
            }
        });
        Ok(())
    }

    async fn delete_vector(&mut self, _version_id: Uuid) -> Result<()> {
        // The in-memory store only models the entity graph; vector storage
        // is exercised separately via `InMemoryVectorIndex`.
        Ok(())
    }

    async fn update_prompt_root(&mut self, prompt_id: Uuid, update: &PromptRootUpdate) -> Result<()> {
        let update = update.clone();
        self.with_data(|data| {
            if let Some(p) = data.prompts.get_mut(&prompt_id) {
                p.content = update.content;
                p.sync_hash = update.sync_hash;
                p.updated_at = update.updated_at;
                p.is_deleted = update.is_deleted;
            }
        });
        Ok(())
    }

    async fn upsert_vector(&mut self, _version_id: Uuid, _vector: &[f32]) -> Result<()> {
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        if let Some(snapshot) = self.snapshot.take() {
            *self.store.lock().unwrap() = snapshot;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_prompt_then_lookup_by_name() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let id = tx.insert_prompt("greeter", Utc::now()).await.unwrap();
        tx.commit().await.unwrap();

        let found = store.get_prompt_by_name("greeter").await.unwrap().unwrap();
        assert_eq!(found.id, id);
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert_prompt("ghost", Utc::now()).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.get_prompt_by_name("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deleted_prompt_is_invisible_to_lookup() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let id = tx.insert_prompt("soon-gone", Utc::now()).await.unwrap();
        tx.update_prompt_root(
            id,
            &PromptRootUpdate {
                content: String::new(),
                sync_hash: String::new(),
                updated_at: Utc::now(),
                is_deleted: true,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        assert!(store.get_prompt_by_name("soon-gone").await.unwrap().is_none());
    }
}
