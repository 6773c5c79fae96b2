//! Catalog of persisted vector indexes.
//!
//! One row per `db_id` in the `catalog` table records what the index covers
//! (location, location type, release, work-item types) and when it was last
//! embedded. Entries are created on the first successful embed, updated in
//! place by incremental embeds, and removed only by [`cleanup`].

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::db;
use crate::index::FlatIndex;
use crate::models::{CatalogEntry, IndexKey, LocationType, TypeSet};

pub async fn get_entry(pool: &SqlitePool, db_id: &str) -> Result<Option<CatalogEntry>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT db_id, location, location_type, release, workitem_types, last_update \
         FROM catalog WHERE db_id = ?",
    )
    .bind(db_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(decode_entry).transpose()
}

/// All entries, most recently updated first.
pub async fn list_entries(pool: &SqlitePool) -> Result<Vec<CatalogEntry>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT db_id, location, location_type, release, workitem_types, last_update \
         FROM catalog ORDER BY last_update DESC, db_id",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(decode_entry).collect()
}

pub async fn upsert_entry(
    conn: &mut SqliteConnection,
    entry: &CatalogEntry,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO catalog (db_id, location, location_type, release, workitem_types, last_update)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(db_id) DO UPDATE SET
            location = excluded.location,
            location_type = excluded.location_type,
            release = excluded.release,
            workitem_types = excluded.workitem_types,
            last_update = excluded.last_update
        "#,
    )
    .bind(&entry.db_id)
    .bind(&entry.key.location)
    .bind(entry.key.location_type.as_str())
    .bind(entry.key.release_label())
    .bind(entry.key.item_types.to_key())
    .bind(entry.last_update.timestamp())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn remove_entry(pool: &SqlitePool, db_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM catalog WHERE db_id = ?")
        .bind(db_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) fn decode_key(row: &SqliteRow) -> Result<IndexKey, sqlx::Error> {
    let location_type: String = row.try_get("location_type")?;
    let release: String = row.try_get("release")?;
    let types: String = row.try_get("workitem_types")?;

    Ok(IndexKey {
        location: row.try_get("location")?,
        location_type: location_type
            .parse::<LocationType>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?,
        release: IndexKey::release_from_label(&release),
        item_types: TypeSet::from_key(&types).map_err(|e| sqlx::Error::Decode(e.into()))?,
    })
}

pub(crate) fn decode_timestamp(ts: i64) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| sqlx::Error::Decode(format!("invalid timestamp {ts}").into()))
}

fn decode_entry(row: &SqliteRow) -> Result<CatalogEntry, sqlx::Error> {
    Ok(CatalogEntry {
        db_id: row.try_get("db_id")?,
        key: decode_key(row)?,
        last_update: decode_timestamp(row.try_get("last_update")?)?,
    })
}

/// Outcome of reconciling the catalog with the index directory.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Entries dropped because their index artifact is missing.
    pub removed_entries: Vec<String>,
    /// Index directories with no catalog entry and no pending cache entry.
    pub orphan_dirs: Vec<PathBuf>,
    /// Whether the orphan directories were deleted.
    pub pruned: bool,
}

/// Remove catalog entries whose index is missing, and find (optionally
/// delete) index directories nothing refers to.
///
/// Directories belonging to a pending cache entry are never orphans.
pub async fn cleanup(
    pool: &SqlitePool,
    index_dir: &Path,
    prune_orphans: bool,
) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    let entries = list_entries(pool).await?;

    for entry in &entries {
        let dir = index_dir.join(&entry.db_id);
        if !FlatIndex::exists(&dir) {
            remove_entry(pool, &entry.db_id).await?;
            tracing::warn!(db_id = %entry.db_id, "removed catalog entry without index");
            report.removed_entries.push(entry.db_id.clone());
        }
    }

    let mut known: HashSet<String> = entries.into_iter().map(|e| e.db_id).collect();
    let pending: Vec<String> = sqlx::query_scalar("SELECT db_id FROM pending_cache")
        .fetch_all(pool)
        .await?;
    known.extend(pending);

    if index_dir.is_dir() {
        for dir_entry in std::fs::read_dir(index_dir)? {
            let path = dir_entry?.path();
            if !path.is_dir() {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if !known.contains(&name) {
                report.orphan_dirs.push(path);
            }
        }
    }
    report.orphan_dirs.sort();

    if prune_orphans {
        for dir in &report.orphan_dirs {
            std::fs::remove_dir_all(dir)?;
        }
        report.pruned = true;
    }

    Ok(report)
}

/// `copilot catalog list`: print every index with its coverage.
pub async fn run_list(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let entries = list_entries(&pool).await?;

    if entries.is_empty() {
        println!("No indexes in catalog.");
        pool.close().await;
        return Ok(());
    }

    println!(
        "{:<34} {:<26} {:<8} {:<16} {:<28} LAST UPDATE",
        "DB_ID", "LOCATION", "TYPE", "RELEASE", "WORK ITEMS"
    );
    println!("{}", "-".repeat(126));
    for entry in &entries {
        println!(
            "{:<34} {:<26} {:<8} {:<16} {:<28} {}",
            entry.db_id,
            entry.key.location,
            entry.key.location_type,
            entry.key.release_label(),
            entry.key.item_types.to_key(),
            format_ts_relative(entry.last_update.timestamp())
        );
    }

    pool.close().await;
    Ok(())
}

/// `copilot catalog clean`.
pub async fn run_clean(config: &Config, prune_orphans: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let report = cleanup(&pool, &config.data.index_dir, prune_orphans).await?;

    println!("catalog clean");
    println!("  removed entries: {}", report.removed_entries.len());
    for db_id in &report.removed_entries {
        println!("    {}", db_id);
    }
    println!(
        "  orphan indexes:  {}{}",
        report.orphan_dirs.len(),
        if report.pruned { " (deleted)" } else { "" }
    );
    for dir in &report.orphan_dirs {
        println!("    {}", dir.display());
    }
    if !report.orphan_dirs.is_empty() && !report.pruned {
        println!("  re-run with --prune-orphans to delete them");
    }
    println!("ok");

    pool.close().await;
    Ok(())
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub(crate) fn format_ts_relative(ts: i64) -> String {
    let now = Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_timestamps() {
        let now = Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 3600), "1 hour ago");
        assert_eq!(format_ts_relative(now - 86400 * 3), "3 days ago");
        assert_eq!(format_ts_iso(0), "1970-01-01 00:00");
    }
}
