//! Configuration and storage overview.
//!
//! `copilot status` prints where things live, which services are
//! configured, and how many indexes and pending cache entries exist. Useful
//! as a first check before running `save` or `update`.

use anyhow::Result;
use std::path::Path;

use crate::cache;
use crate::catalog::{self, format_ts_relative};
use crate::config::Config;
use crate::db;
use crate::index::FlatIndex;

/// Run the status command.
pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let entries = catalog::list_entries(&pool).await?;
    let pending = cache::list_pending(&pool).await?;
    pool.close().await;

    let db_size = std::fs::metadata(&config.data.db_path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Polarion Copilot Status");
    println!("=======================");
    println!();
    println!("  Source:      {}", config.source.base_url);
    println!("  Releases:    {} (by title)", config.source.config_project);
    println!("  Groups:      {}", config.source.groups.len());
    println!(
        "  Embedding:   {}{}",
        config.embedding.provider,
        config
            .embedding
            .model
            .as_deref()
            .map(|m| format!(" ({})", m))
            .unwrap_or_default()
    );
    println!("  Chat:        {} ({})", config.chat.url, config.chat.model);
    println!();
    println!("  Database:    {}", config.data.db_path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Index dir:   {}", config.data.index_dir.display());
    println!("  Index size:  {}", format_bytes(dir_size(&config.data.index_dir)));
    println!();
    println!("  Indexes:     {}", entries.len());
    println!("  Pending:     {}", pending.len());

    let missing: Vec<&str> = entries
        .iter()
        .filter(|e| !FlatIndex::exists(&config.data.index_path(&e.db_id)))
        .map(|e| e.db_id.as_str())
        .collect();
    if !missing.is_empty() {
        println!();
        println!(
            "  {} cataloged index(es) have no index file; run `copilot catalog clean`.",
            missing.len()
        );
    }

    if let Some(latest) = entries.first() {
        println!();
        println!(
            "  Last update: {} ({})",
            format_ts_relative(latest.last_update.timestamp()),
            latest.key.location
        );
    }
    if !pending.is_empty() {
        println!();
        println!("  Pending cache entries found; run `copilot resume` to embed them.");
    }

    println!();
    Ok(())
}

fn dir_size(path: &Path) -> u64 {
    let Ok(read_dir) = std::fs::read_dir(path) else {
        return 0;
    };
    read_dir
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                dir_size(&path)
            } else {
                entry.metadata().map(|m| m.len()).unwrap_or(0)
            }
        })
        .sum()
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
