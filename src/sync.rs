//! `SyncEngine`: bidirectional reconciliation of the `Prompt` root entity
//! between a local and a remote `Store`, per SPEC_FULL.md §4.8. Only
//! instantiated when both an embedded and a hosted backend are configured
//! — most deployments run a single backend and never construct this.
//!
//! Versions are never synced here: they are immutable and always created
//! through `PromptManager::create`, never mutated, so syncing the `Prompt`
//! root (name, content, sync_hash, is_deleted, updated_at) is sufficient
//! to keep both sides eventually consistent.

use crate::error::Result;
use crate::model::Prompt;
use crate::store::Store;
use crate::time_sync::PreciseTime;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

const LAST_SYNC_TIME_KEY: &str = "last_sync_time";

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SyncReport {
    pub pulled: usize,
    pub inserted_local: usize,
    pub updated_local: usize,
    pub pushed: usize,
}

pub struct SyncEngine {
    local: Arc<dyn Store>,
    remote: Arc<dyn Store>,
    clock: PreciseTime,
}

impl SyncEngine {
    pub fn new(local: Arc<dyn Store>, remote: Arc<dyn Store>, clock: PreciseTime) -> Self {
        Self { local, remote, clock }
    }

    /// Runs one pull-then-push reconciliation pass and advances
    /// `last_sync_time` to the run's start time.
    pub async fn sync(&self) -> Result<SyncReport> {
        let last_sync_time = self.read_last_sync_time().await?;
        let run_started_at = self.clock.now();

        let mut report = SyncReport::default();

        let remote_rows = self.remote.list_prompts_updated_after(last_sync_time).await?;
        report.pulled = remote_rows.len();
        for remote_prompt in &remote_rows {
            match self.local.get_prompt_by_name(&remote_prompt.name).await? {
                None => {
                    self.local.upsert_prompt_verbatim(remote_prompt).await?;
                    report.inserted_local += 1;
                }
                Some(local_prompt) => {
                    if remote_prompt.updated_at > local_prompt.updated_at {
                        self.local.upsert_prompt_verbatim(remote_prompt).await?;
                        report.updated_local += 1;
                    }
                    // Equal or older: remote is stale relative to local, skip.
                }
            }
        }

        let local_rows = self.local.list_prompts_updated_after(last_sync_time).await?;
        for local_prompt in &local_rows {
            self.remote.upsert_prompt_verbatim(local_prompt).await?;
        }
        report.pushed = local_rows.len();

        self.write_last_sync_time(run_started_at).await?;

        info!(
            pulled = report.pulled,
            inserted_local = report.inserted_local,
            updated_local = report.updated_local,
            pushed = report.pushed,
            "sync pass complete"
        );
        Ok(report)
    }

    /// Defaults to the Unix epoch when absent or unparseable — an empty
    /// local store must pull everything remote has, not just future
    /// writes. Naive/unzoned timestamps are treated as UTC.
    async fn read_last_sync_time(&self) -> Result<DateTime<Utc>> {
        let stored = self.local.get_app_config(LAST_SYNC_TIME_KEY).await?;
        Ok(stored
            .and_then(|s| parse_as_utc(&s))
            .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).expect("epoch is valid")))
    }

    async fn write_last_sync_time(&self, at: DateTime<Utc>) -> Result<()> {
        self.local
            .set_app_config(LAST_SYNC_TIME_KEY, &at.to_rfc3339())
            .await
    }
}

fn parse_as_utc(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_last_sync_time_defaults_to_epoch() {
        assert!(parse_as_utc("garbage").is_none());
    }

    #[test]
    fn rfc3339_parses_and_normalizes_to_utc() {
        let parsed = parse_as_utc("2024-01-01T00:00:00+00:00").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    fn prompt_fixture(name: &str, updated_at: DateTime<Utc>) -> Prompt {
        Prompt {
            id: uuid::Uuid::new_v4(),
            name: name.to_string(),
            content: String::new(),
            sync_hash: String::new(),
            created_at: updated_at,
            updated_at,
            is_deleted: false,
        }
    }

    #[tokio::test]
    async fn pull_inserts_prompts_missing_locally() {
        use crate::store::memory::InMemoryStore;

        let local = Arc::new(InMemoryStore::new());
        let remote = Arc::new(InMemoryStore::new());
        let remote_prompt = prompt_fixture("greet", Utc::now());
        remote.upsert_prompt_verbatim(&remote_prompt).await.unwrap();

        let engine = SyncEngine::new(local.clone(), remote, PreciseTime::new());
        let report = engine.sync().await.unwrap();

        assert_eq!(report.pulled, 1);
        assert_eq!(report.inserted_local, 1);
        assert_eq!(report.updated_local, 0);
        assert!(local.get_prompt_by_name("greet").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn newer_remote_overwrites_older_local() {
        use crate::store::memory::InMemoryStore;

        let local = Arc::new(InMemoryStore::new());
        let remote = Arc::new(InMemoryStore::new());

        let older = prompt_fixture("greet", Utc::now() - chrono::Duration::hours(1));
        local.upsert_prompt_verbatim(&older).await.unwrap();

        let mut newer = older.clone();
        newer.content = "updated remotely".to_string();
        newer.updated_at = Utc::now();
        remote.upsert_prompt_verbatim(&newer).await.unwrap();

        let engine = SyncEngine::new(local.clone(), remote, PreciseTime::new());
        let report = engine.sync().await.unwrap();

        assert_eq!(report.updated_local, 1);
        let stored = local.get_prompt_by_name("greet").await.unwrap().unwrap();
        assert_eq!(stored.content, "updated remotely");
    }

    #[tokio::test]
    async fn older_or_equal_remote_is_skipped() {
        use crate::store::memory::InMemoryStore;

        let local = Arc::new(InMemoryStore::new());
        let remote = Arc::new(InMemoryStore::new());

        let current = prompt_fixture("greet", Utc::now());
        local.upsert_prompt_verbatim(&current).await.unwrap();

        let mut stale = current.clone();
        stale.content = "stale remote write".to_string();
        stale.updated_at = current.updated_at - chrono::Duration::hours(1);
        remote.upsert_prompt_verbatim(&stale).await.unwrap();

        let engine = SyncEngine::new(local.clone(), remote, PreciseTime::new());
        let report = engine.sync().await.unwrap();

        assert_eq!(report.updated_local, 0);
        let stored = local.get_prompt_by_name("greet").await.unwrap().unwrap();
        assert_ne!(stored.content, "stale remote write");
    }

    #[tokio::test]
    async fn push_propagates_local_changes_to_remote() {
        use crate::store::memory::InMemoryStore;

        let local = Arc::new(InMemoryStore::new());
        let remote = Arc::new(InMemoryStore::new());
        let local_prompt = prompt_fixture("only-local", Utc::now());
        local.upsert_prompt_verbatim(&local_prompt).await.unwrap();

        let engine = SyncEngine::new(local, remote.clone(), PreciseTime::new());
        let report = engine.sync().await.unwrap();

        assert_eq!(report.pushed, 1);
        assert!(remote.get_prompt_by_name("only-local").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn repeated_sync_with_no_intermediate_writes_is_a_no_op() {
        use crate::store::memory::InMemoryStore;

        let local = Arc::new(InMemoryStore::new());
        let remote = Arc::new(InMemoryStore::new());
        let prompt = prompt_fixture("greet", Utc::now());
        local.upsert_prompt_verbatim(&prompt).await.unwrap();
        remote.upsert_prompt_verbatim(&prompt).await.unwrap();

        let engine = SyncEngine::new(local, remote, PreciseTime::new());
        let first = engine.sync().await.unwrap();
        assert_eq!(first.pushed, 1);

        let second = engine.sync().await.unwrap();
        assert_eq!(second.pulled, 0);
        assert_eq!(second.pushed, 0);
        assert_eq!(second.inserted_local, 0);
        assert_eq!(second.updated_local, 0);
    }
}
