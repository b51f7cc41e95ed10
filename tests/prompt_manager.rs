//! End-to-end scenarios exercising `PromptManager` against the in-memory
//! test doubles (`InMemoryStore`, `InMemoryVectorIndex`, `FakeEmbedder`), no
//! live SurrealDB/Postgres/Redis required.

use prompt_vault::cache::Cache;
use prompt_vault::embeddings::{EmbeddingProvider, FakeEmbedder, ProviderPriority};
use prompt_vault::error::PromptError;
use prompt_vault::manager::{
    CreateRequest, OutputFormat, PrincipleRefInput, PromptManager, RenderedOutput, RoleInput,
    SearchLogic, SearchRequest, VersionFilter,
};
use prompt_vault::model::{RoleType, Version, VersionType};
use prompt_vault::queue::UpdateQueue;
use prompt_vault::store::memory::InMemoryStore;
use prompt_vault::store::Store;
use prompt_vault::time_sync::PreciseTime;
use prompt_vault::vector::InMemoryVectorIndex;
use std::sync::Arc;
use std::time::Duration;

fn build_manager() -> (PromptManager, InMemoryStore, Arc<Cache>) {
    let store = InMemoryStore::new();
    let vector_index: Arc<dyn prompt_vault::vector::VectorIndex> =
        Arc::new(InMemoryVectorIndex::default());
    let embeddings = Arc::new(EmbeddingProvider::new(
        None,
        Arc::new(FakeEmbedder::new(Some(16))),
        ProviderPriority::LocalFirst,
        Some(16),
        "fake-model".to_string(),
        0,
        Duration::from_secs(60),
    ));
    let cache = Arc::new(Cache::l1_only(1000, Duration::from_secs(3600)));
    let queue = UpdateQueue::spawn(100, format!("test-queue-{}", Arc::as_ptr(&cache) as usize));
    let clock = PreciseTime::new();
    let manager = PromptManager::new(
        Arc::new(store.clone()),
        vector_index,
        embeddings,
        cache.clone(),
        queue,
        clock,
    );
    (manager, store, cache)
}

fn role(content: &str) -> RoleInput {
    RoleInput {
        role_type: RoleType::System,
        content: content.to_string(),
        order: 0,
        template_variables: None,
    }
}

fn create_request(name: &str, description: &str, version_type: VersionType) -> CreateRequest {
    CreateRequest {
        name: name.to_string(),
        description: description.to_string(),
        roles: vec![role("You are helpful.")],
        version_type,
        tags: None,
        llm_config: None,
        client_type: None,
        principle_refs: None,
        change_log: None,
    }
}

#[tokio::test]
async fn scenario_a_first_create_assigns_version_one_zero() {
    let (manager, store, _cache) = build_manager();

    let outcome = manager
        .create(create_request("greet", "friendly hello", VersionType::Minor))
        .await
        .unwrap();

    assert_eq!(outcome.version.to_string(), "1.0");

    let latest = store
        .get_latest_version_info(outcome.prompt_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.version_number, 1);
    assert_eq!(latest.version.to_string(), "1.0");

    let versions = store.list_versions_of(outcome.prompt_id).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert!(versions[0].is_latest);
}

#[tokio::test]
async fn scenario_b_minor_bump_then_major_bump() {
    let (manager, store, _cache) = build_manager();

    let v1 = manager
        .create(create_request("greet", "friendly hello", VersionType::Minor))
        .await
        .unwrap();
    assert_eq!(v1.version.to_string(), "1.0");

    let v2 = manager
        .create(create_request("greet", "warmer hello", VersionType::Minor))
        .await
        .unwrap();
    assert_eq!(v2.version.to_string(), "1.1");

    let v3 = manager
        .create(create_request("greet", "overhauled hello", VersionType::Major))
        .await
        .unwrap();
    assert_eq!(v3.version.to_string(), "2.0");

    let versions = store.list_versions_of(v1.prompt_id).await.unwrap();
    assert_eq!(versions.len(), 3);
    let latest: Vec<_> = versions.iter().filter(|v| v.is_latest).collect();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].version.to_string(), "2.0");

    let mut numbers: Vec<i64> = versions.iter().map(|v| v.version_number).collect();
    numbers.sort();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[tokio::test]
async fn scenario_c_concurrent_updates_rebase_exactly_once() {
    let (manager, store, _cache) = build_manager();

    let created = manager
        .create(create_request("greet", "friendly hello", VersionType::Minor))
        .await
        .unwrap();
    assert_eq!(created.version.to_string(), "1.0");

    let req_x = create_request("greet", "X", VersionType::Minor);
    let req_y = create_request("greet", "Y", VersionType::Minor);

    let (r1, r2) = tokio::join!(
        manager.update("greet".to_string(), 1, req_x),
        manager.update("greet".to_string(), 1, req_y),
    );

    let r1 = r1.expect("first concurrent update should succeed, auto-rebasing if needed");
    let r2 = r2.expect("second concurrent update should succeed, auto-rebasing if needed");

    let mut versions = vec![r1.version.to_string(), r2.version.to_string()];
    versions.sort();
    assert_eq!(versions, vec!["1.1".to_string(), "1.2".to_string()]);

    let all = store.list_versions_of(created.prompt_id).await.unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn scenario_d_hybrid_search_with_and_logic() {
    let (manager, _store, _cache) = build_manager();

    let mut matching = create_request("greet", "the quick fox jumps over the log", VersionType::Minor);
    matching.tags = Some(vec!["alpha".to_string(), "beta".to_string()]);
    manager.create(matching).await.unwrap();

    let mut partial = create_request("other", "the quick fox runs away fast", VersionType::Minor);
    partial.tags = Some(vec!["alpha".to_string()]);
    manager.create(partial).await.unwrap();

    let result = manager
        .search(SearchRequest {
            query: Some("quick fox".to_string()),
            tags: Some(vec!["alpha".to_string(), "beta".to_string()]),
            logic: SearchLogic::And,
            version_filter: VersionFilter::Latest,
            limit: 10,
            offset: 0,
        })
        .await
        .unwrap();

    assert_eq!(result.total, 1);
    assert_eq!(result.items[0].name, "greet");
}

#[tokio::test]
async fn scenario_e_principle_reference_resolves_to_latest_and_follows_updates() {
    let (manager, _store, cache) = build_manager();

    manager
        .create_principle("safety", Version::parse("1.0").unwrap(), "Be careful v1", true, false)
        .await
        .unwrap();
    manager
        .create_principle("safety", Version::parse("1.1").unwrap(), "Be careful v1.1", true, true)
        .await
        .unwrap();

    let mut request = create_request("x", "a prompt with a safety principle", VersionType::Minor);
    request.roles = vec![RoleInput {
        role_type: RoleType::User,
        content: "Hi".to_string(),
        order: 0,
        template_variables: None,
    }];
    request.principle_refs = Some(vec![PrincipleRefInput {
        principle_name: "safety".to_string(),
        ref_version: "latest".to_string(),
    }]);
    manager.create(request).await.unwrap();

    let rendered = manager
        .get("x", None, OutputFormat::Openai, None, None)
        .await
        .unwrap();
    let RenderedOutput::Openai(openai) = rendered else {
        panic!("expected openai output");
    };
    assert_eq!(openai.messages[0].role, "system");
    assert_eq!(openai.messages[0].content, "[Principle] Be careful v1.1");

    manager
        .create_principle("safety", Version::parse("1.2").unwrap(), "Be careful v1.2", true, true)
        .await
        .unwrap();
    cache.invalidate_pattern("x").await;

    let rendered_again = manager
        .get("x", None, OutputFormat::Openai, None, None)
        .await
        .unwrap();
    let RenderedOutput::Openai(openai_again) = rendered_again else {
        panic!("expected openai output");
    };
    assert_eq!(openai_again.messages[0].content, "[Principle] Be careful v1.2");
}

#[tokio::test]
async fn scenario_f_delete_last_active_is_rejected() {
    let (manager, _store, _cache) = build_manager();

    manager
        .create(create_request("greet", "friendly hello", VersionType::Minor))
        .await
        .unwrap();

    let result = manager.delete("greet", None).await;
    assert!(matches!(result, Err(PromptError::Validation(_))));
}

#[tokio::test]
async fn delete_inactive_after_second_version_deactivates_the_older_one() {
    let (manager, store, _cache) = build_manager();

    let v1 = manager
        .create(create_request("greet", "friendly hello", VersionType::Minor))
        .await
        .unwrap();
    manager
        .create(create_request("greet", "warmer hello", VersionType::Minor))
        .await
        .unwrap();

    manager.delete("greet", Some(v1.version)).await.unwrap();

    let versions = store.list_versions_of(v1.prompt_id).await.unwrap();
    let v1_row = versions.iter().find(|v| v.version == v1.version).unwrap();
    assert!(!v1_row.is_active);
}

#[tokio::test]
async fn delete_of_an_already_inactive_version_is_not_found() {
    let (manager, _store, _cache) = build_manager();

    let v1 = manager
        .create(create_request("greet", "friendly hello", VersionType::Minor))
        .await
        .unwrap();
    manager
        .create(create_request("greet", "warmer hello", VersionType::Minor))
        .await
        .unwrap();

    manager.delete("greet", Some(v1.version.clone())).await.unwrap();

    let result = manager.delete("greet", Some(v1.version)).await;
    assert!(matches!(result, Err(PromptError::NotFound(_))));
}

#[tokio::test]
async fn search_with_no_filters_returns_every_latest_version_sorted_by_recency() {
    let (manager, _store, _cache) = build_manager();

    manager
        .create(create_request("first", "a prompt", VersionType::Minor))
        .await
        .unwrap();
    manager
        .create(create_request("second", "another prompt", VersionType::Minor))
        .await
        .unwrap();

    let result = manager
        .search(SearchRequest {
            query: None,
            tags: None,
            logic: SearchLogic::Or,
            version_filter: VersionFilter::Latest,
            limit: 20,
            offset: 0,
        })
        .await
        .unwrap();

    assert_eq!(result.total, 2);
    assert_eq!(result.items[0].name, "second");
    assert_eq!(result.items[1].name, "first");
}

#[tokio::test]
async fn queue_full_fails_fast_without_affecting_in_flight_work() {
    let store = InMemoryStore::new();
    let vector_index: Arc<dyn prompt_vault::vector::VectorIndex> =
        Arc::new(InMemoryVectorIndex::default());
    let embeddings = Arc::new(EmbeddingProvider::new(
        None,
        Arc::new(FakeEmbedder::new(Some(16))),
        ProviderPriority::LocalFirst,
        Some(16),
        "fake-model".to_string(),
        0,
        Duration::from_secs(60),
    ));
    let cache = Arc::new(Cache::l1_only(1000, Duration::from_secs(3600)));
    let queue = UpdateQueue::spawn(1, "queue-full-test");
    let clock = PreciseTime::new();
    let manager = PromptManager::new(
        Arc::new(store.clone()),
        vector_index,
        embeddings,
        cache,
        queue,
        clock,
    );

    manager
        .create(create_request("greet", "friendly hello", VersionType::Minor))
        .await
        .unwrap();

    let futures: Vec<_> = (0..8)
        .map(|i| {
            manager.update(
                "greet".to_string(),
                1,
                create_request("greet", &format!("update {i}"), VersionType::Minor),
            )
        })
        .collect();
    let results = futures_util::future::join_all(futures).await;

    assert!(
        results.iter().any(|r| r.is_ok()),
        "at least one update should make it through the queue"
    );
}
