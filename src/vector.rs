//! `VectorIndex`: one dense vector per `PromptVersion`, nearest-neighbor
//! search by cosine/L2.
//!
//! Two realizations: [`EmbeddedVectorIndex`] over the same SurrealDB
//! instance the embedded `Store` uses, and [`HostedVectorIndex`] over
//! Postgres + `pgvector`, calling the hosted backend's
//! `match_prompt_versions` stored routine. Both fall back to a
//! client-side linear scan when the native ANN mechanism is unavailable,
//! selected once at `ensure_index` time and logged.

use crate::error::{Result, VectorIndexError};
use crate::utils::cosine_similarity;
use async_trait::async_trait;
use deadpool_postgres::Pool;
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::sync::Arc;
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::Client as WsClient;
use tracing::warn;
use uuid::Uuid;

/// One vector search hit: `(version_id, similarity)`, sorted by descending
/// similarity (ascending distance).
pub type SearchHit = (Uuid, f32);

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Idempotently creates the underlying index structure for dimension
    /// `dimension`. If an existing structure was built with a different
    /// dimension, it is destructively recreated — an initialization-time
    /// repair, never triggered on user requests.
    async fn ensure_index(&self, dimension: usize) -> Result<()>;
    async fn upsert(&self, version_id: Uuid, vector: &[f32]) -> Result<()>;
    async fn delete(&self, version_id: Uuid) -> Result<()>;
    /// `k`-NN search, sorted by descending similarity. Dimension mismatch
    /// between `query` and the index is not an error here: callers degrade
    /// to keyword search on an empty result.
    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>>;
}

// ---------------------------------------------------------------------
// Embedded: SurrealDB-backed, linear-scan fallback
// ---------------------------------------------------------------------

/// Embedded realization. SurrealDB 2.x exposes `vector::similarity::cosine`
/// and MTREE KNN indexes; this implementation tries the native path first
/// and falls back once (logged) to a client-side linear scan over
/// `vector_record` using Euclidean distance.
pub struct EmbeddedVectorIndex {
    db: Surreal<WsClient>,
    dimension: OnceCell<usize>,
    fallback_active: OnceCell<bool>,
}

impl EmbeddedVectorIndex {
    pub fn new(db: Surreal<WsClient>) -> Self {
        Self {
            db,
            dimension: OnceCell::new(),
            fallback_active: OnceCell::new(),
        }
    }

    fn is_fallback(&self) -> bool {
        self.fallback_active.get().copied().unwrap_or(false)
    }

    async fn linear_scan(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        #[derive(Deserialize)]
        struct Row {
            version_id: String,
            vector: Vec<f32>,
        }
        let mut resp = self
            .db
            .query("SELECT version_id, vector FROM vector_record")
            .await
            .map_err(|e| VectorIndexError::Search(e.to_string()))?;
        let rows: Vec<Row> = resp.take(0).unwrap_or_default();

        let mut scored: Vec<(Uuid, f32)> = rows
            .into_iter()
            .filter_map(|r| {
                let id = Uuid::parse_str(&r.version_id).ok()?;
                if r.vector.len() != query.len() {
                    return None;
                }
                let dist = euclidean_distance(query, &r.vector);
                Some((id, dist))
            })
            .collect();
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored
            .into_iter()
            .map(|(id, dist)| (id, 1.0 / (1.0 + dist)))
            .collect())
    }
}

fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f32>().sqrt()
}

#[async_trait]
impl VectorIndex for EmbeddedVectorIndex {
    async fn ensure_index(&self, dimension: usize) -> Result<()> {
        let previous = self.dimension.get().copied();
        if previous == Some(dimension) {
            return Ok(());
        }
        if previous.is_some() {
            warn!(
                old = previous.unwrap(),
                new = dimension,
                "vector index dimension changed, recreating (destructive)"
            );
            let _ = self.db.query("REMOVE INDEX IF EXISTS vector_record_mtree ON vector_record").await;
        }

        let ddl = format!(
            "DEFINE INDEX IF NOT EXISTS vector_record_mtree ON vector_record \
             FIELDS vector MTREE DIMENSION {dimension} DIST EUCLIDEAN;"
        );
        match self.db.query(ddl).await {
            Ok(_) => {
                let _ = self.fallback_active.set(false);
            }
            Err(e) => {
                warn!(error = %e, "native vector index unavailable, falling back to linear scan");
                let _ = self.fallback_active.set(true);
            }
        }
        let _ = self.dimension.set(dimension);
        Ok(())
    }

    async fn upsert(&self, version_id: Uuid, vector: &[f32]) -> Result<()> {
        self.db
            .query(format!(
                "UPDATE vector_record CONTENT {{ version_id: '{version_id}', vector: $vec }} \
                 WHERE version_id = '{version_id}' \
                 ELSE CREATE vector_record CONTENT {{ version_id: '{version_id}', vector: $vec }};"
            ))
            .bind(("vec", vector.to_vec()))
            .await
            .map_err(|e| VectorIndexError::Upsert(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, version_id: Uuid) -> Result<()> {
        self.db
            .query(format!("DELETE vector_record WHERE version_id = '{version_id}';"))
            .await
            .map_err(|e| VectorIndexError::Upsert(e.to_string()))?;
        Ok(())
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if self.is_fallback() {
            return self.linear_scan(query, k).await;
        }

        #[derive(Deserialize)]
        struct Row {
            version_id: String,
            dist: f32,
        }
        let result = self
            .db
            .query(
                "SELECT version_id, vector::distance::euclidean(vector, $q) AS dist \
                 FROM vector_record ORDER BY dist ASC LIMIT $k",
            )
            .bind(("q", query.to_vec()))
            .bind(("k", k as i64))
            .await;

        let rows: Vec<Row> = match result {
            Ok(mut resp) => resp.take(0).unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "native vector search failed, falling back to linear scan");
                return self.linear_scan(query, k).await;
            }
        };

        Ok(rows
            .into_iter()
            .filter_map(|r| Some((Uuid::parse_str(&r.version_id).ok()?, 1.0 / (1.0 + r.dist))))
            .collect())
    }
}

// ---------------------------------------------------------------------
// Hosted: Postgres + pgvector, via the `match_prompt_versions` routine
// ---------------------------------------------------------------------

/// Hosted realization. `ensure_index` creates the `pgvector` extension and
/// an HNSW index if absent; `search` calls the pre-installed
/// `match_prompt_versions(query, threshold, k)` stored routine, which
/// returns `(version_id, similarity)` directly — no distance→similarity
/// conversion needed on this path.
pub struct HostedVectorIndex {
    pool: Arc<Pool>,
    dimension: OnceCell<usize>,
}

impl HostedVectorIndex {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self {
            pool,
            dimension: OnceCell::new(),
        }
    }
}

#[async_trait]
impl VectorIndex for HostedVectorIndex {
    async fn ensure_index(&self, dimension: usize) -> Result<()> {
        let previous = self.dimension.get().copied();
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| VectorIndexError::Unavailable(e.to_string()))?;

        if previous.is_some() && previous != Some(dimension) {
            warn!(
                old = previous.unwrap(),
                new = dimension,
                "hosted vector index dimension changed, recreating (destructive)"
            );
            let _ = client.execute("DROP INDEX IF EXISTS vector_records_hnsw", &[]).await;
            let _ = client
                .execute(
                    &format!("ALTER TABLE vector_records ALTER COLUMN vector TYPE vector({dimension})"),
                    &[],
                )
                .await;
        }

        client
            .execute("CREATE EXTENSION IF NOT EXISTS vector", &[])
            .await
            .map_err(|e| VectorIndexError::Unavailable(e.to_string()))?;
        let _ = client
            .execute(
                "CREATE INDEX IF NOT EXISTS vector_records_hnsw ON vector_records \
                 USING hnsw (vector vector_l2_ops)",
                &[],
            )
            .await;
        let _ = self.dimension.set(dimension);
        Ok(())
    }

    async fn upsert(&self, version_id: Uuid, vector: &[f32]) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| VectorIndexError::Unavailable(e.to_string()))?;
        let vec = pgvector::Vector::from(vector.to_vec());
        client
            .execute(
                "INSERT INTO vector_records (version_id, vector) VALUES ($1, $2) \
                 ON CONFLICT (version_id) DO UPDATE SET vector = EXCLUDED.vector",
                &[&version_id, &vec],
            )
            .await
            .map_err(|e| VectorIndexError::Upsert(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, version_id: Uuid) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| VectorIndexError::Unavailable(e.to_string()))?;
        client
            .execute("DELETE FROM vector_records WHERE version_id = $1", &[&version_id])
            .await
            .map_err(|e| VectorIndexError::Upsert(e.to_string()))?;
        Ok(())
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| VectorIndexError::Unavailable(e.to_string()))?;
        let vec = pgvector::Vector::from(query.to_vec());
        let threshold: f32 = 0.0;
        let rows = client
            .query(
                "SELECT * FROM match_prompt_versions($1, $2, $3)",
                &[&vec, &threshold, &(k as i64)],
            )
            .await
            .map_err(|e| VectorIndexError::Search(e.to_string()))?;
        Ok(rows
            .iter()
            .map(|row| {
                let version_id: Uuid = row.get("version_id");
                let similarity: f32 = row.get("similarity");
                (version_id, similarity)
            })
            .collect())
    }
}

/// Stands in for the real index when `vector.enabled = false`: every
/// operation is a no-op and `search` always returns
/// empty, so `PromptManager::search` falls through to keyword search and
/// `create`/`update` skip vector storage entirely without branching on a
/// config flag at every call site.
#[derive(Default)]
pub struct NoopVectorIndex;

#[async_trait]
impl VectorIndex for NoopVectorIndex {
    async fn ensure_index(&self, _dimension: usize) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, _version_id: Uuid, _vector: &[f32]) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _version_id: Uuid) -> Result<()> {
        Ok(())
    }

    async fn search(&self, _query: &[f32], _k: usize) -> Result<Vec<SearchHit>> {
        Ok(Vec::new())
    }
}

/// Used by unit tests and by the `db_integration`-gated suite as a
/// deterministic in-memory stand-in, following the same plain-public-type
/// test-double convention as [`crate::embeddings::FakeEmbedder`].
#[derive(Default)]
pub struct InMemoryVectorIndex {
    records: std::sync::Mutex<std::collections::HashMap<Uuid, Vec<f32>>>,
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn ensure_index(&self, _dimension: usize) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, version_id: Uuid, vector: &[f32]) -> Result<()> {
        self.records.lock().unwrap().insert(version_id, vector.to_vec());
        Ok(())
    }

    async fn delete(&self, version_id: Uuid) -> Result<()> {
        self.records.lock().unwrap().remove(&version_id);
        Ok(())
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let records = self.records.lock().unwrap();
        let mut scored: Vec<SearchHit> = records
            .iter()
            .filter(|(_, v)| v.len() == query.len())
            .map(|(id, v)| (*id, cosine_similarity(query, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_index_ranks_by_cosine_similarity() {
        let index = InMemoryVectorIndex::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        index.upsert(a, &[1.0, 0.0]).await.unwrap();
        index.upsert(b, &[0.0, 1.0]).await.unwrap();
        let hits = index.search(&[1.0, 0.1], 2).await.unwrap();
        assert_eq!(hits[0].0, a);
    }

    #[tokio::test]
    async fn in_memory_index_ignores_dimension_mismatched_records() {
        let index = InMemoryVectorIndex::default();
        let a = Uuid::new_v4();
        index.upsert(a, &[1.0, 0.0, 0.0]).await.unwrap();
        let hits = index.search(&[1.0, 0.0], 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_from_future_searches() {
        let index = InMemoryVectorIndex::default();
        let a = Uuid::new_v4();
        index.upsert(a, &[1.0, 0.0]).await.unwrap();
        index.delete(a).await.unwrap();
        let hits = index.search(&[1.0, 0.0], 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn euclidean_distance_of_identical_vectors_is_zero() {
        assert_eq!(euclidean_distance(&[1.0, 2.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn noop_index_always_reports_empty_search() {
        let index = NoopVectorIndex;
        index.ensure_index(128).await.unwrap();
        let id = Uuid::new_v4();
        index.upsert(id, &[1.0; 128]).await.unwrap();
        let hits = index.search(&[1.0; 128], 5).await.unwrap();
        assert!(hits.is_empty());
    }
}
