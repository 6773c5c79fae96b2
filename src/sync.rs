//! Vector index synchronizer.
//!
//! Drives one index through
//!
//! ```text
//! NoCache ─▶ Fetched ─▶ Cached ─▶ Embedding ─▶ Persisted
//!    └──────(pending cache entry)──▲
//! ```
//!
//! Records are staged in the cache before any embedding call. A run that
//! finds staged records for its key skips the source entirely, so a crash
//! or an embedding outage never causes a re-fetch. The index file is only
//! written after every batch has been embedded, and the catalog update and
//! cache removal commit together.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache;
use crate::catalog;
use crate::chunk::chunk_and_batch;
use crate::config::Config;
use crate::db;
use crate::embedding::{create_embedder, Embedder};
use crate::error::{EmbeddingError, PipelineError, PipelineResult};
use crate::format::format_records;
use crate::index::FlatIndex;
use crate::merge::{merge, MergePolicy};
use crate::models::{CacheEntry, CatalogEntry, FormattedRecord, IndexKey};
use crate::polarion::PolarionClient;
use crate::progress::{PipelineEvent, ProgressReporter};
use crate::source::{fetch, WorkItemSource};

/// What to synchronize.
#[derive(Debug, Clone)]
pub enum SyncRequest {
    /// Build a new index for a key.
    Create(IndexKey),
    /// Append items changed since the last update to a cataloged index.
    Update { db_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    NoCache,
    Fetched,
    Cached,
    Embedding,
    Persisted,
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub db_id: String,
    /// States visited, in order.
    pub states: Vec<SyncState>,
    /// True when the records came from the pending cache.
    pub resumed: bool,
    pub records: usize,
    pub chunks: usize,
    /// Update found nothing new; index and catalog untouched.
    pub up_to_date: bool,
}

pub struct Synchronizer<'a> {
    config: &'a Config,
    pool: &'a SqlitePool,
    embedder: &'a dyn Embedder,
    progress: &'a dyn ProgressReporter,
}

impl<'a> Synchronizer<'a> {
    pub fn new(
        config: &'a Config,
        pool: &'a SqlitePool,
        embedder: &'a dyn Embedder,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            config,
            pool,
            embedder,
            progress,
        }
    }

    /// Run one request to completion.
    ///
    /// # Errors
    ///
    /// [`PipelineError::EmbeddingUnavailable`] is retryable: the staged
    /// records stay in the cache and the next run for the same key resumes
    /// from them. Every other error leaves the index and catalog as they
    /// were.
    pub async fn run(
        &self,
        source: &dyn WorkItemSource,
        request: &SyncRequest,
    ) -> PipelineResult<SyncOutcome> {
        let (key, existing) = match request {
            SyncRequest::Create(key) => (key.clone(), None),
            SyncRequest::Update { db_id } => {
                let entry = catalog::get_entry(self.pool, db_id)
                    .await?
                    .ok_or_else(|| PipelineError::UnknownIndex(db_id.clone()))?;
                (entry.key.clone(), Some(entry))
            }
        };
        let mut states = vec![SyncState::NoCache];

        let pending = match &existing {
            None => cache::find_pending(self.pool, &key).await?,
            Some(entry) => cache::get_pending(self.pool, &entry.db_id).await?,
        };
        if let Some(pending) = pending {
            info!(db_id = %pending.db_id, records = pending.record_count, "resuming from pending cache");
            let records = cache::load_records(self.pool, &pending).await?;
            return self.embed_staged(&pending, records, states, true).await;
        }

        self.progress.report(PipelineEvent::Fetching {
            location: key.location.clone(),
        });
        let since = existing.as_ref().map(|entry| entry.last_update);
        let items = fetch(source, &self.config.source, &key, since).await?;

        let records = if items.is_empty() {
            Vec::new()
        } else {
            let policy = MergePolicy::from_config(self.config);
            let merged = merge(source, items, &policy, &key.location, self.progress).await?;
            format_records(&merged, &self.config.source.base_url)
        };
        states.push(SyncState::Fetched);

        if records.is_empty() {
            return match existing {
                Some(entry) => {
                    info!(db_id = %entry.db_id, since = %entry.last_update, "index is up to date");
                    Ok(SyncOutcome {
                        db_id: entry.db_id,
                        states,
                        resumed: false,
                        records: 0,
                        chunks: 0,
                        up_to_date: true,
                    })
                }
                None => Err(PipelineError::EmptyResult(key.location.clone())),
            };
        }

        let is_update = existing.is_some();
        let db_id = existing.map(|entry| entry.db_id).unwrap_or_else(new_db_id);
        let staged = cache::stage(self.pool, &db_id, &key, is_update, &records).await?;
        info!(db_id = %db_id, records = records.len(), is_update, "staged records");

        self.embed_staged(&staged, records, states, false).await
    }

    /// Embed a pending cache entry without touching the source.
    pub async fn resume(&self, entry: &CacheEntry) -> PipelineResult<SyncOutcome> {
        let records = cache::load_records(self.pool, entry).await?;
        self.embed_staged(entry, records, vec![SyncState::NoCache], true)
            .await
    }

    async fn embed_staged(
        &self,
        entry: &CacheEntry,
        records: Vec<FormattedRecord>,
        mut states: Vec<SyncState>,
        resumed: bool,
    ) -> PipelineResult<SyncOutcome> {
        states.push(SyncState::Cached);

        let batches = chunk_and_batch(
            &records,
            self.config.chunking.chunk_size,
            self.config.chunking.batch_size,
        );
        let total = batches.len() as u64;
        let chunks: usize = batches.iter().map(Vec::len).sum();
        let dir = self.config.data.index_path(&entry.db_id);
        let in_catalog = catalog::get_entry(self.pool, &entry.db_id).await?.is_some();

        states.push(SyncState::Embedding);
        let mut remaining = batches.iter();
        let mut done = 0u64;

        let mut index = if in_catalog {
            let index = FlatIndex::load(&dir)?;
            if index.model() != self.embedder.model_name() {
                warn!(
                    db_id = %entry.db_id,
                    index_model = %index.model(),
                    embedder_model = %self.embedder.model_name(),
                    "appending with a different embedding model"
                );
            }
            index
        } else {
            let Some(first) = remaining.next() else {
                return Err(PipelineError::EmptyResult(entry.key.location.clone()));
            };
            let index = FlatIndex::from_batch(self.embedder, first)
                .await
                .map_err(|e| embedding_failed(&entry.db_id, e))?;
            done += 1;
            self.report_embedding(&entry.db_id, done, total);
            index
        };

        for batch in remaining {
            index
                .add_batch(self.embedder, batch)
                .await
                .map_err(|e| embedding_failed(&entry.db_id, e))?;
            done += 1;
            self.report_embedding(&entry.db_id, done, total);
        }

        index.save(&dir)?;

        let mut tx = self.pool.begin().await?;
        catalog::upsert_entry(
            &mut tx,
            &CatalogEntry {
                db_id: entry.db_id.clone(),
                key: entry.key.clone(),
                last_update: Utc::now(),
            },
        )
        .await?;
        cache::discard(&mut tx, &entry.db_id).await?;
        tx.commit().await?;
        states.push(SyncState::Persisted);

        info!(
            db_id = %entry.db_id,
            records = records.len(),
            chunks,
            entries = index.len(),
            "index persisted"
        );

        Ok(SyncOutcome {
            db_id: entry.db_id.clone(),
            states,
            resumed,
            records: records.len(),
            chunks,
            up_to_date: false,
        })
    }

    fn report_embedding(&self, db_id: &str, n: u64, total: u64) {
        self.progress.report(PipelineEvent::Embedding {
            db_id: db_id.to_string(),
            n,
            total,
        });
    }
}

fn embedding_failed(db_id: &str, source: EmbeddingError) -> PipelineError {
    warn!(db_id = %db_id, error = %source, "embedding failed; records kept in cache");
    PipelineError::EmbeddingUnavailable {
        db_id: db_id.to_string(),
        source,
    }
}

fn new_db_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// `copilot save` and `copilot update`.
pub async fn run_sync(
    config: &Config,
    request: SyncRequest,
    progress: &dyn ProgressReporter,
) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let source = PolarionClient::new(&config.source)?;
    let embedder = create_embedder(&config.embedding)?;
    let sync = Synchronizer::new(config, &pool, embedder.as_ref(), progress);

    let result = sync.run(&source, &request).await;
    pool.close().await;
    let outcome = result?;

    if outcome.up_to_date {
        println!("{} is up to date", outcome.db_id);
    } else {
        print_outcome(&outcome);
    }
    Ok(())
}

/// `copilot resume`: embed every pending cache entry, oldest first.
pub async fn run_resume(config: &Config, progress: &dyn ProgressReporter) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let pending = cache::list_pending(&pool).await?;
    if pending.is_empty() {
        println!("No pending cache entries.");
        pool.close().await;
        return Ok(());
    }

    let embedder = create_embedder(&config.embedding)?;
    let sync = Synchronizer::new(config, &pool, embedder.as_ref(), progress);
    for entry in &pending {
        match sync.resume(entry).await {
            Ok(outcome) => print_outcome(&outcome),
            Err(e) => {
                pool.close().await;
                return Err(e.into());
            }
        }
    }

    pool.close().await;
    Ok(())
}

fn print_outcome(outcome: &SyncOutcome) {
    println!(
        "{} {}",
        if outcome.resumed { "resumed" } else { "embedded" },
        outcome.db_id
    );
    println!("  records: {}", outcome.records);
    println!("  chunks:  {}", outcome.chunks);
    println!("ok");
}
