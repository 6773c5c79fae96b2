//! End-to-end tests of the index synchronizer with in-memory doubles for
//! Polarion and the embedding service.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;

use polarion_copilot::cache;
use polarion_copilot::catalog;
use polarion_copilot::config::Config;
use polarion_copilot::db;
use polarion_copilot::embedding::Embedder;
use polarion_copilot::error::{EmbeddingError, PipelineError, SourceError};
use polarion_copilot::index::FlatIndex;
use polarion_copilot::migrate::migrate_pool;
use polarion_copilot::models::{
    CatalogEntry, CustomFields, FormattedRecord, IndexKey, Link, LocationType, Reference, TypeSet, WorkItem,
    WorkItemType,
};
use polarion_copilot::progress::NoProgress;
use polarion_copilot::source::WorkItemSource;
use polarion_copilot::sync::{SyncRequest, SyncState, Synchronizer};

// ============ Test doubles ============

/// Serves `initial` to full queries and `changed` to date-filtered ones.
struct FakeSource {
    initial: Vec<WorkItem>,
    changed: Mutex<Vec<WorkItem>>,
    linked: HashMap<String, WorkItem>,
    query_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

impl FakeSource {
    fn new(initial: Vec<WorkItem>, linked: Vec<WorkItem>) -> Self {
        Self {
            initial,
            changed: Mutex::new(Vec::new()),
            linked: linked.into_iter().map(|i| (i.id.clone(), i)).collect(),
            query_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
        }
    }

    fn set_changed(&self, items: Vec<WorkItem>) {
        *self.changed.lock().unwrap() = items;
    }

    fn calls(&self) -> (usize, usize) {
        (
            self.query_calls.load(Ordering::SeqCst),
            self.get_calls.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl WorkItemSource for FakeSource {
    async fn query(&self, _project_id: &str, query: &str) -> Result<Vec<WorkItem>, SourceError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        if query.contains("updated:[") {
            Ok(self.changed.lock().unwrap().clone())
        } else {
            Ok(self.initial.clone())
        }
    }

    async fn get_work_item(&self, project_id: &str, id: &str) -> Result<WorkItem, SourceError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.linked
            .get(id)
            .cloned()
            .ok_or_else(|| SourceError::NotRetrievable {
                project: project_id.to_string(),
                id: id.to_string(),
            })
    }

    async fn group_projects(&self, group_id: &str) -> Result<Vec<String>, SourceError> {
        Err(SourceError::UnknownLocation(group_id.to_string()))
    }
}

/// Deterministic 3-dimensional vectors; can be switched to fail.
struct FakeEmbedder {
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl FakeEmbedder {
    fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake-3d"
    }

    fn dims(&self) -> Option<usize> {
        Some(3)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Unavailable("connection refused".to_string()));
        }
        Ok(texts
            .iter()
            .map(|t| vec![t.len() as f32, t.split_whitespace().count() as f32, 1.0])
            .collect())
    }
}

// ============ Fixtures ============

fn test_config(tmp: &TempDir) -> Config {
    toml::from_str(&format!(
        r#"
[data]
db_path = "{0}/data/copilot.sqlite"
index_dir = "{0}/faiss"

[source]
base_url = "https://polarion.example.com/polarion"

[chunking]
chunk_size = 1000
batch_size = 2
"#,
        tmp.path().display()
    ))
    .unwrap()
}

async fn test_pool(config: &Config) -> SqlitePool {
    let pool = db::connect(config).await.unwrap();
    migrate_pool(&pool).await.unwrap();
    pool
}

fn requirement(id: &str, external_id: &str, description: &str) -> WorkItem {
    WorkItem {
        id: id.to_string(),
        project_id: "TSS".to_string(),
        title: None,
        item_type: Some(WorkItemType::Requirement),
        description: Some(description.to_string()),
        fields: CustomFields {
            external_id: Some(external_id.to_string()),
            ..Default::default()
        },
        links: vec![],
    }
}

fn key() -> IndexKey {
    IndexKey {
        location: "TSS".to_string(),
        location_type: LocationType::Project,
        release: None,
        item_types: TypeSet::new([WorkItemType::Requirement]),
    }
}

/// One head requirement with a continuation fragment behind a link.
fn continuation_source() -> FakeSource {
    let mut head = requirement("TSS-1", "SYS-1", "Stop the beam");
    head.links = vec![Link::new("parent", "TSS", "TSS-2")];
    let fragment = requirement("TSS-2", "SYS-1 (cont'd)", "close the shutter.");
    FakeSource::new(vec![head], vec![fragment])
}

// ============ Tests ============

#[tokio::test]
async fn end_to_end_merges_continuation_into_one_chunk() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let pool = test_pool(&config).await;
    let source = continuation_source();
    let embedder = FakeEmbedder::new();
    let sync = Synchronizer::new(&config, &pool, &embedder, &NoProgress);

    let outcome = sync.run(&source, &SyncRequest::Create(key())).await.unwrap();

    assert_eq!(
        outcome.states,
        vec![
            SyncState::NoCache,
            SyncState::Fetched,
            SyncState::Cached,
            SyncState::Embedding,
            SyncState::Persisted
        ]
    );
    assert!(!outcome.resumed);
    assert_eq!(outcome.records, 1);
    assert_eq!(outcome.chunks, 1);

    let index = FlatIndex::load(&config.data.index_path(&outcome.db_id)).unwrap();
    assert_eq!(index.len(), 1);
    assert_eq!(index.model(), "fake-3d");
    let entry = &index.entries()[0];
    assert_eq!(entry.text, "Stop the beam, close the shutter.");
    assert_eq!(entry.reference.external_id, "SYS-1");
    assert_eq!(
        entry.reference.url,
        "https://polarion.example.com/polarion/#/project/TSS/workitem?id=TSS-1"
    );

    let cataloged = catalog::get_entry(&pool, &outcome.db_id).await.unwrap().unwrap();
    assert_eq!(cataloged.key, key());
    assert!(cache::list_pending(&pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn pending_cache_resumes_without_touching_source() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let pool = test_pool(&config).await;

    let records = vec![FormattedRecord {
        text: "Stop the beam.".to_string(),
        reference: Reference {
            external_id: "SYS-1".to_string(),
            url: "https://polarion.example.com/polarion/#/project/TSS/workitem?id=TSS-1"
                .to_string(),
        },
    }];
    cache::stage(&pool, "staged01", &key(), false, &records)
        .await
        .unwrap();

    let source = continuation_source();
    let embedder = FakeEmbedder::new();
    let sync = Synchronizer::new(&config, &pool, &embedder, &NoProgress);
    let outcome = sync.run(&source, &SyncRequest::Create(key())).await.unwrap();

    assert_eq!(source.calls(), (0, 0));
    assert!(outcome.resumed);
    assert_eq!(outcome.db_id, "staged01");
    assert!(!outcome.states.contains(&SyncState::Fetched));
    assert_eq!(outcome.states.last(), Some(&SyncState::Persisted));
    assert!(catalog::get_entry(&pool, "staged01").await.unwrap().is_some());
    assert!(cache::get_pending(&pool, "staged01").await.unwrap().is_none());
}

#[tokio::test]
async fn embedding_failure_keeps_cache_for_retry() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let pool = test_pool(&config).await;
    let source = continuation_source();
    let embedder = FakeEmbedder::new();
    embedder.fail.store(true, Ordering::SeqCst);
    let sync = Synchronizer::new(&config, &pool, &embedder, &NoProgress);

    let err = sync
        .run(&source, &SyncRequest::Create(key()))
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    let PipelineError::EmbeddingUnavailable { db_id, .. } = err else {
        panic!("expected EmbeddingUnavailable");
    };

    assert!(cache::get_pending(&pool, &db_id).await.unwrap().is_some());
    assert!(catalog::get_entry(&pool, &db_id).await.unwrap().is_none());
    assert!(!FlatIndex::exists(&config.data.index_path(&db_id)));
    let calls_after_failure = source.calls();

    embedder.fail.store(false, Ordering::SeqCst);
    let outcome = sync.run(&source, &SyncRequest::Create(key())).await.unwrap();

    assert_eq!(source.calls(), calls_after_failure);
    assert!(outcome.resumed);
    assert_eq!(outcome.db_id, db_id);
    assert!(cache::list_pending(&pool).await.unwrap().is_empty());
    assert!(FlatIndex::exists(&config.data.index_path(&db_id)));
}

#[tokio::test]
async fn incremental_update_without_changes_is_a_no_op() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let pool = test_pool(&config).await;
    let source = continuation_source();
    let embedder = FakeEmbedder::new();
    let sync = Synchronizer::new(&config, &pool, &embedder, &NoProgress);

    let created = sync.run(&source, &SyncRequest::Create(key())).await.unwrap();
    let index_file = FlatIndex::file_path(&config.data.index_path(&created.db_id));
    let bytes_before = std::fs::read(&index_file).unwrap();
    let entry_before = catalog::get_entry(&pool, &created.db_id).await.unwrap();
    let embed_calls = embedder.calls.load(Ordering::SeqCst);

    let outcome = sync
        .run(
            &source,
            &SyncRequest::Update {
                db_id: created.db_id.clone(),
            },
        )
        .await
        .unwrap();

    assert!(outcome.up_to_date);
    assert_eq!(outcome.records, 0);
    assert_eq!(std::fs::read(&index_file).unwrap(), bytes_before);
    assert_eq!(
        catalog::get_entry(&pool, &created.db_id).await.unwrap(),
        entry_before
    );
    assert_eq!(embedder.calls.load(Ordering::SeqCst), embed_calls);
    assert!(cache::list_pending(&pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn incremental_update_appends_changed_items() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let pool = test_pool(&config).await;
    let source = continuation_source();
    let embedder = FakeEmbedder::new();
    let sync = Synchronizer::new(&config, &pool, &embedder, &NoProgress);

    let created = sync.run(&source, &SyncRequest::Create(key())).await.unwrap();
    source.set_changed(vec![
        requirement("TSS-3", "SYS-3", "Log every interlock."),
        requirement("TSS-4", "SYS-4", "Display the dose."),
        requirement("TSS-5", "SYS-5", "Sound an alarm."),
    ]);

    let outcome = sync
        .run(
            &source,
            &SyncRequest::Update {
                db_id: created.db_id.clone(),
            },
        )
        .await
        .unwrap();

    assert!(!outcome.up_to_date);
    assert_eq!(outcome.db_id, created.db_id);
    assert_eq!(outcome.records, 3);

    let index = FlatIndex::load(&config.data.index_path(&created.db_id)).unwrap();
    let ids: Vec<&str> = index
        .entries()
        .iter()
        .map(|e| e.reference.external_id.as_str())
        .collect();
    assert_eq!(ids, vec!["SYS-1", "SYS-3", "SYS-4", "SYS-5"]);
    assert_eq!(catalog::list_entries(&pool).await.unwrap().len(), 1);
}

/// Create an index, move its last update a day back, and stage three
/// changed items behind a failing embedder.
async fn failed_update(
    config: &Config,
    pool: &SqlitePool,
    source: &FakeSource,
    embedder: &FakeEmbedder,
) -> CatalogEntry {
    let sync = Synchronizer::new(config, pool, embedder, &NoProgress);
    let created = sync.run(source, &SyncRequest::Create(key())).await.unwrap();

    let mut entry = catalog::get_entry(pool, &created.db_id).await.unwrap().unwrap();
    entry.last_update = entry.last_update - Duration::days(1);
    let mut conn = pool.acquire().await.unwrap();
    catalog::upsert_entry(&mut conn, &entry).await.unwrap();
    drop(conn);

    source.set_changed(vec![
        requirement("TSS-3", "SYS-3", "Log every interlock."),
        requirement("TSS-4", "SYS-4", "Display the dose."),
        requirement("TSS-5", "SYS-5", "Sound an alarm."),
    ]);
    embedder.fail.store(true, Ordering::SeqCst);

    let err = sync
        .run(
            source,
            &SyncRequest::Update {
                db_id: created.db_id.clone(),
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_retryable());

    let pending = cache::get_pending(pool, &created.db_id).await.unwrap().unwrap();
    assert!(pending.is_update);
    assert_eq!(pending.record_count, 3);
    assert_eq!(
        catalog::get_entry(pool, &created.db_id).await.unwrap(),
        Some(entry.clone())
    );
    let index = FlatIndex::load(&config.data.index_path(&created.db_id)).unwrap();
    assert_eq!(index.len(), 1);

    embedder.fail.store(false, Ordering::SeqCst);
    entry
}

fn external_ids(index: &FlatIndex) -> Vec<String> {
    index
        .entries()
        .iter()
        .map(|e| e.reference.external_id.clone())
        .collect()
}

#[tokio::test]
async fn failed_update_is_resumed_by_rerunning_the_update() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let pool = test_pool(&config).await;
    let source = continuation_source();
    let embedder = FakeEmbedder::new();

    let before = failed_update(&config, &pool, &source, &embedder).await;
    let calls_after_failure = source.calls();

    let sync = Synchronizer::new(&config, &pool, &embedder, &NoProgress);
    let outcome = sync
        .run(
            &source,
            &SyncRequest::Update {
                db_id: before.db_id.clone(),
            },
        )
        .await
        .unwrap();

    assert_eq!(source.calls(), calls_after_failure);
    assert!(outcome.resumed);
    assert_eq!(outcome.db_id, before.db_id);
    assert_eq!(outcome.records, 3);
    assert_eq!(
        outcome.states,
        vec![
            SyncState::NoCache,
            SyncState::Cached,
            SyncState::Embedding,
            SyncState::Persisted
        ]
    );

    let index = FlatIndex::load(&config.data.index_path(&before.db_id)).unwrap();
    assert_eq!(external_ids(&index), vec!["SYS-1", "SYS-3", "SYS-4", "SYS-5"]);

    let after = catalog::get_entry(&pool, &before.db_id).await.unwrap().unwrap();
    assert_eq!(after.key, before.key);
    assert!(after.last_update > before.last_update);
    assert!(after.last_update <= Utc::now());
    assert!(cache::list_pending(&pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn resume_appends_pending_update_to_existing_index() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let pool = test_pool(&config).await;
    let source = continuation_source();
    let embedder = FakeEmbedder::new();

    let before = failed_update(&config, &pool, &source, &embedder).await;
    let calls_after_failure = source.calls();
    let pending = cache::list_pending(&pool).await.unwrap();
    assert_eq!(pending.len(), 1);

    let sync = Synchronizer::new(&config, &pool, &embedder, &NoProgress);
    let outcome = sync.resume(&pending[0]).await.unwrap();

    assert_eq!(source.calls(), calls_after_failure);
    assert!(outcome.resumed);
    assert_eq!(outcome.db_id, before.db_id);

    let index = FlatIndex::load(&config.data.index_path(&before.db_id)).unwrap();
    assert_eq!(external_ids(&index), vec!["SYS-1", "SYS-3", "SYS-4", "SYS-5"]);
    assert_eq!(catalog::list_entries(&pool).await.unwrap().len(), 1);
    assert!(
        catalog::get_entry(&pool, &before.db_id)
            .await
            .unwrap()
            .unwrap()
            .last_update
            > before.last_update
    );
    assert!(cache::list_pending(&pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn new_index_with_no_items_fails() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let pool = test_pool(&config).await;
    let source = FakeSource::new(vec![], vec![]);
    let embedder = FakeEmbedder::new();
    let sync = Synchronizer::new(&config, &pool, &embedder, &NoProgress);

    let err = sync
        .run(&source, &SyncRequest::Create(key()))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::EmptyResult(_)));
    assert!(!err.is_retryable());
    assert!(catalog::list_entries(&pool).await.unwrap().is_empty());
    assert!(cache::list_pending(&pool).await.unwrap().is_empty());
}

#[tokio::test]
async fn update_of_unknown_index_fails() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let pool = test_pool(&config).await;
    let source = FakeSource::new(vec![], vec![]);
    let embedder = FakeEmbedder::new();
    let sync = Synchronizer::new(&config, &pool, &embedder, &NoProgress);

    let err = sync
        .run(
            &source,
            &SyncRequest::Update {
                db_id: "missing".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::UnknownIndex(id) if id == "missing"));
    assert_eq!(source.calls(), (0, 0));
}

#[tokio::test]
async fn cleanup_reconciles_catalog_and_index_dir() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let pool = test_pool(&config).await;
    let source = continuation_source();
    let embedder = FakeEmbedder::new();
    let sync = Synchronizer::new(&config, &pool, &embedder, &NoProgress);

    let kept = sync.run(&source, &SyncRequest::Create(key())).await.unwrap();

    let mut other_key = key();
    other_key.location = "PTS".to_string();
    let lost = sync.run(&source, &SyncRequest::Create(other_key)).await.unwrap();
    std::fs::remove_dir_all(config.data.index_path(&lost.db_id)).unwrap();

    let orphan = config.data.index_path("orphan01");
    std::fs::create_dir_all(&orphan).unwrap();

    let report = catalog::cleanup(&pool, &config.data.index_dir, false)
        .await
        .unwrap();
    assert_eq!(report.removed_entries, vec![lost.db_id.clone()]);
    assert_eq!(report.orphan_dirs, vec![orphan.clone()]);
    assert!(orphan.exists());

    let report = catalog::cleanup(&pool, &config.data.index_dir, true)
        .await
        .unwrap();
    assert!(report.removed_entries.is_empty());
    assert!(report.pruned);
    assert!(!orphan.exists());
    assert!(catalog::get_entry(&pool, &kept.db_id).await.unwrap().is_some());
}
