//! Pending cache of formatted records.
//!
//! Records are staged here after fetch/merge/format and stay until the
//! index they belong to has been saved and cataloged. A pending entry is
//! addressed by its `db_id` and looked up by its [`IndexKey`], so a crashed
//! or failed run resumes from the staged records without touching the
//! source again.
//!
//! Each entry stores a SHA-256 digest over its records; [`load_records`]
//! refuses to hand out records that no longer match it.

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::catalog::{decode_key, decode_timestamp, format_ts_relative};
use crate::config::Config;
use crate::db;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{CacheEntry, FormattedRecord, IndexKey, Reference};

const ENTRY_COLUMNS: &str = "db_id, location, location_type, release, workitem_types, \
                             is_update, record_count, digest, created_at";

/// Digest over the records in order. Fields are NUL-separated so that
/// moving text between fields changes the digest.
pub fn digest(records: &[FormattedRecord]) -> String {
    let mut hasher = Sha256::new();
    for record in records {
        hasher.update(record.text.as_bytes());
        hasher.update([0u8]);
        hasher.update(record.reference.external_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(record.reference.url.as_bytes());
        hasher.update([b'\n']);
    }
    format!("{:x}", hasher.finalize())
}

/// The most recent pending entry that will create a new index for `key`.
///
/// Pending updates are addressed by their `db_id` instead, see
/// [`get_pending`].
pub async fn find_pending(
    pool: &SqlitePool,
    key: &IndexKey,
) -> Result<Option<CacheEntry>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM pending_cache \
         WHERE location = ? AND location_type = ? AND release = ? AND workitem_types = ? \
         AND is_update = 0 ORDER BY created_at DESC LIMIT 1"
    ))
    .bind(&key.location)
    .bind(key.location_type.as_str())
    .bind(key.release_label())
    .bind(key.item_types.to_key())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(decode_entry).transpose()
}

pub async fn get_pending(pool: &SqlitePool, db_id: &str) -> Result<Option<CacheEntry>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM pending_cache WHERE db_id = ?"
    ))
    .bind(db_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(decode_entry).transpose()
}

/// Every pending entry, oldest first.
pub async fn list_pending(pool: &SqlitePool) -> Result<Vec<CacheEntry>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM pending_cache ORDER BY created_at, db_id"
    ))
    .fetch_all(pool)
    .await?;

    rows.iter().map(decode_entry).collect()
}

/// Stage `records` under `db_id`, replacing anything previously staged for
/// it. Runs in one transaction.
pub async fn stage(
    pool: &SqlitePool,
    db_id: &str,
    key: &IndexKey,
    is_update: bool,
    records: &[FormattedRecord],
) -> Result<CacheEntry, sqlx::Error> {
    let entry = CacheEntry {
        db_id: db_id.to_string(),
        key: key.clone(),
        is_update,
        created_at: Utc::now(),
        record_count: records.len(),
        digest: digest(records),
    };

    let mut tx = pool.begin().await?;
    discard(&mut tx, db_id).await?;

    sqlx::query(&format!(
        "INSERT INTO pending_cache ({ENTRY_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&entry.db_id)
    .bind(&key.location)
    .bind(key.location_type.as_str())
    .bind(key.release_label())
    .bind(key.item_types.to_key())
    .bind(is_update)
    .bind(entry.record_count as i64)
    .bind(&entry.digest)
    .bind(entry.created_at.timestamp())
    .execute(&mut *tx)
    .await?;

    for (position, record) in records.iter().enumerate() {
        sqlx::query(
            "INSERT INTO cache_records (db_id, position, text, external_id, url) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(db_id)
        .bind(position as i64)
        .bind(&record.text)
        .bind(&record.reference.external_id)
        .bind(&record.reference.url)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(entry)
}

/// Staged records for `entry`, in staging order.
///
/// # Errors
///
/// [`PipelineError::CacheCorrupt`] if the stored rows no longer match the
/// entry's record count or digest.
pub async fn load_records(
    pool: &SqlitePool,
    entry: &CacheEntry,
) -> PipelineResult<Vec<FormattedRecord>> {
    let rows = sqlx::query(
        "SELECT text, external_id, url FROM cache_records WHERE db_id = ? ORDER BY position",
    )
    .bind(&entry.db_id)
    .fetch_all(pool)
    .await?;

    let records = rows
        .iter()
        .map(|row| {
            Ok(FormattedRecord {
                text: row.try_get("text")?,
                reference: Reference {
                    external_id: row.try_get("external_id")?,
                    url: row.try_get("url")?,
                },
            })
        })
        .collect::<Result<Vec<_>, sqlx::Error>>()?;

    if records.len() != entry.record_count || digest(&records) != entry.digest {
        return Err(PipelineError::CacheCorrupt(entry.db_id.clone()));
    }
    Ok(records)
}

/// Remove the pending entry for `db_id` and its records. Returns whether
/// an entry existed.
pub async fn discard(conn: &mut SqliteConnection, db_id: &str) -> Result<bool, sqlx::Error> {
    sqlx::query("DELETE FROM cache_records WHERE db_id = ?")
        .bind(db_id)
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query("DELETE FROM pending_cache WHERE db_id = ?")
        .bind(db_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// `copilot cache list`: print every pending entry.
pub async fn run_list(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let entries = list_pending(&pool).await?;

    if entries.is_empty() {
        println!("No pending cache entries.");
        pool.close().await;
        return Ok(());
    }

    println!(
        "{:<34} {:<26} {:<16} {:<8} {:>8}  STAGED",
        "DB_ID", "LOCATION", "RELEASE", "MODE", "RECORDS"
    );
    println!("{}", "-".repeat(110));
    for entry in &entries {
        println!(
            "{:<34} {:<26} {:<16} {:<8} {:>8}  {}",
            entry.db_id,
            entry.key.location,
            entry.key.release_label(),
            if entry.is_update { "update" } else { "create" },
            entry.record_count,
            format_ts_relative(entry.created_at.timestamp())
        );
    }
    println!();
    println!("Run `copilot resume` to embed them.");

    pool.close().await;
    Ok(())
}

/// `copilot cache drop <db_id>`.
pub async fn run_drop(config: &Config, db_id: &str) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let mut conn = pool.acquire().await?;
    let removed = discard(&mut conn, db_id).await?;
    drop(conn);
    pool.close().await;

    if !removed {
        anyhow::bail!("No pending cache entry '{}'", db_id);
    }
    println!("Dropped pending cache entry {}", db_id);
    Ok(())
}

fn decode_entry(row: &SqliteRow) -> Result<CacheEntry, sqlx::Error> {
    let record_count: i64 = row.try_get("record_count")?;
    Ok(CacheEntry {
        db_id: row.try_get("db_id")?,
        key: decode_key(row)?,
        is_update: row.try_get("is_update")?,
        created_at: decode_timestamp(row.try_get("created_at")?)?,
        record_count: usize::try_from(record_count)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        digest: row.try_get("digest")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use crate::models::{LocationType, TypeSet, WorkItemType};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        pool
    }

    fn key(location: &str) -> IndexKey {
        IndexKey {
            location: location.to_string(),
            location_type: LocationType::Project,
            release: Some("R2".to_string()),
            item_types: TypeSet::new([WorkItemType::Requirement]),
        }
    }

    fn record(text: &str) -> FormattedRecord {
        FormattedRecord {
            text: text.to_string(),
            reference: Reference {
                external_id: format!("SYS-{text}"),
                url: "https://polarion/#/project/TSS/workitem?id=TSS-1".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn stage_find_and_load() {
        let pool = memory_pool().await;
        let records = vec![record("one"), record("two")];
        let staged = stage(&pool, "db1", &key("TSS"), false, &records)
            .await
            .unwrap();
        assert_eq!(staged.record_count, 2);

        let found = find_pending(&pool, &key("TSS")).await.unwrap().unwrap();
        assert_eq!(found.db_id, "db1");
        assert!(!found.is_update);
        assert_eq!(found.key, key("TSS"));
        assert!(find_pending(&pool, &key("OTHER")).await.unwrap().is_none());

        assert_eq!(load_records(&pool, &found).await.unwrap(), records);
    }

    #[tokio::test]
    async fn restaging_replaces_records() {
        let pool = memory_pool().await;
        stage(&pool, "db1", &key("TSS"), false, &[record("a"), record("b")])
            .await
            .unwrap();
        let entry = stage(&pool, "db1", &key("TSS"), true, &[record("c")])
            .await
            .unwrap();

        assert_eq!(list_pending(&pool).await.unwrap().len(), 1);
        assert_eq!(load_records(&pool, &entry).await.unwrap(), vec![record("c")]);
    }

    #[tokio::test]
    async fn tampered_records_are_rejected() {
        let pool = memory_pool().await;
        let entry = stage(&pool, "db1", &key("TSS"), false, &[record("a")])
            .await
            .unwrap();
        sqlx::query("UPDATE cache_records SET text = 'changed'")
            .execute(&pool)
            .await
            .unwrap();

        assert!(matches!(
            load_records(&pool, &entry).await,
            Err(PipelineError::CacheCorrupt(_))
        ));
    }

    #[tokio::test]
    async fn discard_removes_entry() {
        let pool = memory_pool().await;
        stage(&pool, "db1", &key("TSS"), false, &[record("a")])
            .await
            .unwrap();

        let mut conn = pool.acquire().await.unwrap();
        assert!(discard(&mut conn, "db1").await.unwrap());
        assert!(!discard(&mut conn, "db1").await.unwrap());
        drop(conn);

        assert!(get_pending(&pool, "db1").await.unwrap().is_none());
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_records")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn digest_depends_on_field_boundaries() {
        let a = FormattedRecord {
            text: "ab".to_string(),
            reference: Reference {
                external_id: "c".to_string(),
                url: "u".to_string(),
            },
        };
        let b = FormattedRecord {
            text: "a".to_string(),
            reference: Reference {
                external_id: "bc".to_string(),
                url: "u".to_string(),
            },
        };
        assert_ne!(digest(&[a]), digest(&[b]));
    }
}
