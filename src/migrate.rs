use anyhow::{bail, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Version of the catalog/cache schema created below.
pub const SCHEMA_VERSION: i64 = 1;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables on an open pool. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .execute(pool)
        .await?;

    let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await?;
    if let Some(version) = current {
        if version > SCHEMA_VERSION {
            bail!(
                "database schema version {} is newer than supported version {}",
                version,
                SCHEMA_VERSION
            );
        }
    }

    // One row per persisted vector index
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS catalog (
            db_id TEXT PRIMARY KEY,
            location TEXT NOT NULL,
            location_type TEXT NOT NULL,
            release TEXT NOT NULL,
            workitem_types TEXT NOT NULL,
            last_update INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Formatted records waiting to be embedded, at most one entry per db_id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pending_cache (
            db_id TEXT PRIMARY KEY,
            location TEXT NOT NULL,
            location_type TEXT NOT NULL,
            release TEXT NOT NULL,
            workitem_types TEXT NOT NULL,
            is_update INTEGER NOT NULL,
            record_count INTEGER NOT NULL,
            digest TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_records (
            db_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            text TEXT NOT NULL,
            external_id TEXT NOT NULL,
            url TEXT NOT NULL,
            PRIMARY KEY (db_id, position),
            FOREIGN KEY (db_id) REFERENCES pending_cache(db_id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pending_cache_key \
         ON pending_cache(location, location_type, release, workitem_types)",
    )
    .execute(pool)
    .await?;

    if current.is_none() {
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(SCHEMA_VERSION)
            .execute(pool)
            .await?;
    }

    Ok(())
}
