//! Retrieval over a persisted index.

use anyhow::{bail, Context, Result};

use crate::catalog;
use crate::config::Config;
use crate::db;
use crate::embedding::{create_embedder, embed_query, Embedder};
use crate::index::{FlatIndex, SearchHit};

/// Top `k` chunks of index `db_id` for `query`, filtered by the configured
/// score threshold, best first.
pub async fn retrieve(
    config: &Config,
    embedder: &dyn Embedder,
    db_id: &str,
    query: &str,
    k: usize,
) -> Result<Vec<SearchHit>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }

    let dir = config.data.index_path(db_id);
    if !FlatIndex::exists(&dir) {
        bail!("No index found for '{}' in {}", db_id, config.data.index_dir.display());
    }
    let index = FlatIndex::load(&dir).with_context(|| format!("Failed to load index {}", db_id))?;
    if index.model() != embedder.model_name() {
        tracing::warn!(
            db_id = %db_id,
            index_model = %index.model(),
            embedder_model = %embedder.model_name(),
            "query embedded with a different model than the index"
        );
    }

    let vector = embed_query(embedder, query).await?;
    Ok(index.search(&vector, k, config.retrieval.score_threshold))
}

/// `copilot search <db_id> <query>`.
pub async fn run_search(config: &Config, db_id: &str, query: &str, k: Option<usize>) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Search requires embeddings. Set [embedding] provider in config.");
    }

    let pool = db::connect(config).await?;
    let entry = catalog::get_entry(&pool, db_id).await?;
    pool.close().await;
    if entry.is_none() {
        bail!("Index '{}' is not in the catalog", db_id);
    }

    let embedder = create_embedder(&config.embedding)?;
    let hits = retrieve(
        config,
        embedder.as_ref(),
        db_id,
        query,
        k.unwrap_or(config.retrieval.k),
    )
    .await?;

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.2}] {}",
            i + 1,
            hit.score,
            hit.reference.external_id
        );
        println!("    {}", hit.reference.url);
        println!("    > {}", snippet(&hit.text, 240));
        println!();
    }

    Ok(())
}

fn snippet(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}
