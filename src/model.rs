//! Entity graph for the Prompt Version Store: `Prompt`, `PromptVersion`,
//! their attached roles/config/tags/principles, and the aggregate shapes
//! the `Store` loads them into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A named, long-lived entity grouping an ordered history of versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    pub id: Uuid,
    pub name: String,
    pub content: String,
    pub sync_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

/// `"MAJOR.MINOR"`, compared numerically by `(major, minor)`, never
/// lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub const INITIAL: Version = Version { major: 1, minor: 0 };

    pub fn major_bump(self) -> Version {
        Version {
            major: self.major + 1,
            minor: 0,
        }
    }

    pub fn minor_bump(self) -> Version {
        Version {
            major: self.major,
            minor: self.minor + 1,
        }
    }

    pub fn parse(s: &str) -> Option<Version> {
        let (maj, min) = s.split_once('.')?;
        Some(Version {
            major: maj.parse().ok()?,
            minor: min.parse().ok()?,
        })
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionType {
    Major,
    Minor,
}

/// Computes the next version string per invariant 3 of the data model:
/// no prior version → `1.0`; major bump → `{major+1}.0`; minor bump →
/// `{major}.{minor+1}`.
pub fn calculate_version(previous: Option<Version>, version_type: VersionType) -> Version {
    match (previous, version_type) {
        (None, _) => Version::INITIAL,
        (Some(v), VersionType::Major) => v.major_bump(),
        (Some(v), VersionType::Minor) => v.minor_bump(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleType {
    System,
    User,
    Assistant,
    Principle,
}

/// One message slot attached to a version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRole {
    pub version_id: Uuid,
    pub role_type: RoleType,
    pub content: String,
    pub order: i32,
    pub template_variables: Option<HashMap<String, TemplateVarDef>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateVarDef {
    #[serde(default)]
    pub required: bool,
    pub default: Option<String>,
}

/// 1:1 with a `PromptVersion`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub stop_sequences: Option<Vec<String>>,
    pub other_params: Option<serde_json::Value>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            model: None,
            temperature: None,
            max_tokens: None,
            top_p: None,
            top_k: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop_sequences: None,
            other_params: None,
        }
    }
}

/// Resolved LLM call parameters after overlaying `LlmConfig` defaults and
/// `runtime_params`, per §4.7 `get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedLlmParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub top_k: Option<u32>,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub stop: Option<Vec<String>>,
    pub other_params: Option<serde_json::Value>,
}

impl ResolvedLlmParams {
    /// Defaults from `core/manager.py::_render_output`.
    pub fn defaults() -> Self {
        ResolvedLlmParams {
            model: "gpt-3.5-turbo".to_string(),
            temperature: 0.7,
            max_tokens: 1000,
            top_p: 1.0,
            top_k: None,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            stop: None,
            other_params: None,
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        let mut params = ResolvedLlmParams::defaults();
        if let Some(m) = &config.model {
            params.model = m.clone();
        }
        if let Some(t) = config.temperature {
            params.temperature = t;
        }
        if let Some(mt) = config.max_tokens {
            params.max_tokens = mt;
        }
        if let Some(tp) = config.top_p {
            params.top_p = tp;
        }
        if config.top_k.is_some() {
            params.top_k = config.top_k;
        }
        if let Some(fp) = config.frequency_penalty {
            params.frequency_penalty = fp;
        }
        if let Some(pp) = config.presence_penalty {
            params.presence_penalty = pp;
        }
        if config.stop_sequences.is_some() {
            params.stop = config.stop_sequences.clone();
        }
        if config.other_params.is_some() {
            params.other_params = config.other_params.clone();
        }
        params
    }

    /// Overlay `runtime_params` field by field, never wholesale-replace.
    pub fn overlay(mut self, runtime_params: &serde_json::Value) -> Self {
        let Some(obj) = runtime_params.as_object() else {
            return self;
        };
        if let Some(v) = obj.get("model").and_then(|v| v.as_str()) {
            self.model = v.to_string();
        }
        if let Some(v) = obj.get("temperature").and_then(|v| v.as_f64()) {
            self.temperature = v as f32;
        }
        if let Some(v) = obj.get("max_tokens").and_then(|v| v.as_u64()) {
            self.max_tokens = v as u32;
        }
        if let Some(v) = obj.get("top_p").and_then(|v| v.as_f64()) {
            self.top_p = v as f32;
        }
        if let Some(v) = obj.get("frequency_penalty").and_then(|v| v.as_f64()) {
            self.frequency_penalty = v as f32;
        }
        if let Some(v) = obj.get("presence_penalty").and_then(|v| v.as_f64()) {
            self.presence_penalty = v as f32;
        }
        if let Some(v) = obj.get("top_k").and_then(|v| v.as_u64()) {
            self.top_k = Some(v as u32);
        }
        if let Some(v) = obj.get("stop") {
            self.stop = v
                .as_array()
                .map(|arr| arr.iter().filter_map(|s| s.as_str().map(String::from)).collect());
        }
        self
    }
}

/// One immutable snapshot of a `Prompt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptVersion {
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

/// Uniquely named label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Reusable guideline text with its own name+version+is_latest history,
/// independent of `Prompt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinciplePrompt {
    pub id: Uuid,
    pub name: String,
    pub version: Version,
    pub content: String,
    pub is_active: bool,
    pub is_latest: bool,
    pub created_at: DateTime<Utc>,
}

/// `"latest"` or a concrete version string, as requested by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PrincipleVersionRef {
    Latest,
    Exact(Version),
}

impl PrincipleVersionRef {
    pub fn parse(s: &str) -> Option<PrincipleVersionRef> {
        if s == "latest" {
            Some(PrincipleVersionRef::Latest)
        } else {
            Version::parse(s).map(PrincipleVersionRef::Exact)
        }
    }
}

/// Ordered reference from a `PromptVersion` to a `PrinciplePrompt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipleRef {
    pub version_id: Uuid,
    pub principle_name: String,
    pub ref_version: PrincipleVersionRef,
    pub order: i32,
}

/// Named consumer profile carrying default principles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmClient {
    pub id: Uuid,
    pub name: String,
    pub default_principles: Vec<DefaultPrincipleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultPrincipleEntry {
    pub principle_name: String,
    pub version: String,
}

/// Link from a `PromptVersion` to a client that should see its defaults
/// merged in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMapping {
    pub version_id: Uuid,
    pub client_id: Uuid,
}

/// One dense vector of dimension `D`, keyed by `version_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub version_id: Uuid,
    pub vector: Vec<f32>,
}

/// A fully populated aggregate for one `PromptVersion`: roles sorted by
/// `order`, principles resolved and sorted by ref `order`, llm_config, and
/// client mapping. Loaded in one query rather than many small lookups, per
/// §9's re-architecture hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullVersion {
    pub prompt: Prompt,
    pub version: PromptVersion,
    pub roles: Vec<PromptRole>,
    pub principles: Vec<ResolvedPrinciple>,
    pub llm_config: LlmConfig,
    pub tags: Vec<String>,
}

/// A principle reference resolved to its concrete content at read time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedPrinciple {
    pub order: i32,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_prompt_gets_1_0() {
        assert_eq!(
            calculate_version(None, VersionType::Minor),
            Version { major: 1, minor: 0 }
        );
        assert_eq!(
            calculate_version(None, VersionType::Major),
            Version { major: 1, minor: 0 }
        );
    }

    #[test]
    fn minor_then_major_bump() {
        let v1 = calculate_version(None, VersionType::Minor);
        let v1_1 = calculate_version(Some(v1), VersionType::Minor);
        assert_eq!(v1_1, Version { major: 1, minor: 1 });
        let v2_0 = calculate_version(Some(v1_1), VersionType::Major);
        assert_eq!(v2_0, Version { major: 2, minor: 0 });
    }

    #[test]
    fn versions_compare_numerically_not_lexicographically() {
        let v1_9 = Version { major: 1, minor: 9 };
        let v1_10 = Version { major: 1, minor: 10 };
        assert!(v1_10 > v1_9);
    }

    #[test]
    fn version_display_and_parse_round_trip() {
        let v = Version { major: 2, minor: 3 };
        assert_eq!(v.to_string(), "2.3");
        assert_eq!(Version::parse("2.3"), Some(v));
    }

    #[test]
    fn overlay_applies_stop_and_top_k_from_runtime_params() {
        let params = ResolvedLlmParams::defaults().overlay(&serde_json::json!({
            "stop": ["###", "END"],
            "top_k": 40,
        }));
        assert_eq!(params.stop, Some(vec!["###".to_string(), "END".to_string()]));
        assert_eq!(params.top_k, Some(40));
    }
}
