//! Index definitions and validation for the embedded backend's tables.
//!
//! A declarative list of expected indexes per table, separate from the
//! inline DDL in
//! [`store::embedded`](crate::store::embedded), used by maintenance/health
//! checks to confirm a running instance's schema hasn't drifted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Types of indexes supported by SurrealDB.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum IndexType {
    /// Single-field index.
    Single(String),
    /// Multi-field composite index.
    Composite(Vec<String>),
    /// Unique single-field index.
    Unique(String),
}

impl IndexType {
    /// Convert the index into its SurrealDB definition string for `table`.
    pub fn to_definition(&self, table: &str) -> String {
        match self {
            IndexType::Single(field) => {
                format!("DEFINE INDEX idx_{field} ON TABLE {table} FIELDS {field}")
            }
            IndexType::Unique(field) => {
                format!("DEFINE INDEX idx_{field}_unique ON TABLE {table} FIELDS {field} UNIQUE")
            }
            IndexType::Composite(fields) => {
                let field_list = fields.join(", ");
                let name = fields.join("_");
                format!("DEFINE INDEX idx_{name} ON TABLE {table} FIELDS {field_list}")
            }
        }
    }

    /// Fields this index covers, in definition order.
    pub fn fields(&self) -> Vec<String> {
        match self {
            IndexType::Single(field) | IndexType::Unique(field) => vec![field.clone()],
            IndexType::Composite(fields) => fields.clone(),
        }
    }
}

/// Extracts the `FIELDS a, b` clause out of a raw `DEFINE INDEX ...`
/// statement as returned by `INFO FOR TABLE`, ignoring index name and
/// `UNIQUE` suffix. Used to check coverage rather than exact statement
/// text, since a running instance is free to name its indexes however
/// its schema DDL does.
fn fields_in_definition(definition: &str) -> Vec<String> {
    let upper = definition.to_ascii_uppercase();
    let Some(start) = upper.find("FIELDS") else {
        return Vec::new();
    };
    let rest = &definition[start + "FIELDS".len()..];
    let end = rest.to_ascii_uppercase().find("UNIQUE").unwrap_or(rest.len());
    rest[..end]
        .trim_end_matches(';')
        .split(',')
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect()
}

/// Expected indexes per table.
#[derive(Debug)]
pub struct TableIndexes {
    pub table: String,
    pub required: Vec<IndexType>,
    pub optional: Vec<IndexType>,
}

/// Expected indexes for every table in the prompt entity graph. Used to
/// validate a running embedded store hasn't drifted
/// from [`store::embedded::EmbeddedStore::initialize_schema`].
pub fn get_expected_indexes() -> Vec<TableIndexes> {
    vec![
        TableIndexes {
            table: "prompt".into(),
            required: vec![IndexType::Unique("name".into())],
            optional: vec![],
        },
        TableIndexes {
            table: "prompt_version".into(),
            required: vec![
                IndexType::Single("prompt_id".into()),
                IndexType::Composite(vec!["prompt_id".into(), "version".into()]),
            ],
            optional: vec![IndexType::Single("is_latest".into())],
        },
        TableIndexes {
            table: "prompt_role".into(),
            required: vec![IndexType::Single("version_id".into())],
            optional: vec![],
        },
        TableIndexes {
            table: "llm_config".into(),
            required: vec![IndexType::Unique("version_id".into())],
            optional: vec![],
        },
        TableIndexes {
            table: "tag".into(),
            required: vec![IndexType::Unique("name".into())],
            optional: vec![],
        },
        TableIndexes {
            table: "prompt_tag".into(),
            required: vec![IndexType::Composite(vec!["version_id".into(), "tag_id".into()])],
            optional: vec![],
        },
        TableIndexes {
            table: "principle_prompt".into(),
            required: vec![
                IndexType::Single("name".into()),
                IndexType::Composite(vec!["name".into(), "version".into()]),
            ],
            optional: vec![],
        },
        TableIndexes {
            table: "principle_ref".into(),
            required: vec![IndexType::Single("version_id".into())],
            optional: vec![],
        },
        TableIndexes {
            table: "llm_client".into(),
            required: vec![IndexType::Unique("name".into())],
            optional: vec![],
        },
        TableIndexes {
            table: "client_mapping".into(),
            required: vec![IndexType::Composite(vec!["version_id".into(), "client_id".into()])],
            optional: vec![],
        },
        TableIndexes {
            table: "vector_record".into(),
            required: vec![IndexType::Unique("version_id".into())],
            optional: vec![],
        },
    ]
}

/// Response from `INFO FOR TABLE`: index name → raw `DEFINE INDEX ...`
/// statement string.
#[derive(Debug, Serialize, Deserialize)]
pub struct TableInfo {
    #[serde(default)]
    pub indexes: HashMap<String, String>,
}

/// Result of an index health check.
#[derive(Debug, Serialize)]
pub struct IndexHealth {
    pub table: String,
    pub present_index_names: Vec<String>,
    pub missing_required_fields: Vec<Vec<String>>,
}

impl IndexHealth {
    pub fn is_healthy(&self) -> bool {
        self.missing_required_fields.is_empty()
    }

    /// Checks `table_def.required` against indexes actually present on
    /// `table_info`, matching by field coverage rather than index name
    /// (schema DDL and this catalog are free to name indexes differently).
    pub fn evaluate(table_def: &TableIndexes, table_info: &TableInfo) -> Self {
        let present_field_sets: Vec<Vec<String>> = table_info
            .indexes
            .values()
            .map(|def| fields_in_definition(def))
            .collect();

        let missing_required_fields: Vec<Vec<String>> = table_def
            .required
            .iter()
            .map(|idx| idx.fields())
            .filter(|fields| !present_field_sets.contains(fields))
            .collect();

        IndexHealth {
            table: table_def.table.clone(),
            present_index_names: table_info.indexes.keys().cloned().collect(),
            missing_required_fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_index_definition_names_by_field_join() {
        let idx = IndexType::Composite(vec!["version_id".into(), "tag_id".into()]);
        assert_eq!(
            idx.to_definition("prompt_tag"),
            "DEFINE INDEX idx_version_id_tag_id ON TABLE prompt_tag FIELDS version_id, tag_id"
        );
    }

    #[test]
    fn evaluate_flags_missing_required_field_coverage() {
        let table_def = TableIndexes {
            table: "prompt".into(),
            required: vec![IndexType::Unique("name".into())],
            optional: vec![],
        };
        let empty = TableInfo { indexes: HashMap::new() };
        let health = IndexHealth::evaluate(&table_def, &empty);
        assert!(!health.is_healthy());
        assert_eq!(health.missing_required_fields, vec![vec!["name".to_string()]]);

        let mut present = HashMap::new();
        present.insert(
            "prompt_name_unique".to_string(),
            "DEFINE INDEX prompt_name_unique ON prompt FIELDS name UNIQUE".to_string(),
        );
        let healthy = IndexHealth::evaluate(&table_def, &TableInfo { indexes: present });
        assert!(healthy.is_healthy());
    }

    #[test]
    fn expected_indexes_cover_every_persisted_table() {
        let tables: Vec<String> = get_expected_indexes().into_iter().map(|t| t.table).collect();
        for expected in [
            "prompt",
            "prompt_version",
            "prompt_role",
            "llm_config",
            "tag",
            "prompt_tag",
            "principle_prompt",
            "principle_ref",
            "llm_client",
            "client_mapping",
            "vector_record",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing table {expected}");
        }
    }
}
