use std::collections::BTreeMap;
use std::path::Path;

use memosync_core::{Item, ItemError, ItemStatus};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const LAST_SYNC_TIME: &str = "lastSyncTime";

#[derive(Debug, Error)]
pub enum ChangeLogError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("change record has an empty key")]
    EmptyKey,
    #[error("stored record is invalid: {0}")]
    InvalidRecord(#[from] ItemError),
}

/// Pending local changes (`file` table) plus the `lastSyncTime` scalar (`state` table).
///
/// The pool holds a single connection, so every statement is serialized.
#[derive(Clone)]
pub struct ChangeLog {
    pool: SqlitePool,
}

impl ChangeLog {
    pub async fn open(path: &Path) -> Result<Self, ChangeLogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let log = Self { pool };
        log.init().await?;
        Ok(log)
    }

    pub async fn in_memory() -> Result<Self, ChangeLogError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let log = Self { pool };
        log.init().await?;
        Ok(log)
    }

    pub async fn init(&self) -> Result<(), ChangeLogError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Inserts or overwrites the pending record for `item.key`.
    pub async fn record_change(&self, item: &Item) -> Result<(), ChangeLogError> {
        if item.key.is_empty() {
            return Err(ChangeLogError::EmptyKey);
        }
        sqlx::query(
            "INSERT INTO file (key, status, c_time, m_time, size)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                status = excluded.status,
                c_time = excluded.c_time,
                m_time = excluded.m_time,
                size = excluded.size",
        )
        .bind(&item.key)
        .bind(item.status.as_code())
        .bind(item.c_time)
        .bind(item.m_time)
        .bind(item.size as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Removes and returns every pending record in one statement. Records written
    /// afterwards stay in the table for the next drain.
    pub async fn drain_all(&self) -> Result<BTreeMap<String, Item>, ChangeLogError> {
        let rows = sqlx::query("DELETE FROM file RETURNING key, status, c_time, m_time, size")
            .fetch_all(&self.pool)
            .await?;
        let mut out = BTreeMap::new();
        for row in rows {
            let item = item_from_row(&row)?;
            out.insert(item.key.clone(), item);
        }
        Ok(out)
    }

    /// Puts back drained records that were never executed. A key that received a new
    /// record in the meantime keeps the newer one.
    pub async fn restore_unprocessed<'a, I>(&self, items: I) -> Result<usize, ChangeLogError>
    where
        I: IntoIterator<Item = &'a Item>,
    {
        let mut restored = 0;
        for item in items {
            let result = sqlx::query(
                "INSERT INTO file (key, status, c_time, m_time, size)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(key) DO NOTHING",
            )
            .bind(&item.key)
            .bind(item.status.as_code())
            .bind(item.c_time)
            .bind(item.m_time)
            .bind(item.size as i64)
            .execute(&self.pool)
            .await?;
            restored += result.rows_affected() as usize;
        }
        Ok(restored)
    }

    pub async fn pending(&self) -> Result<Vec<Item>, ChangeLogError> {
        let rows = sqlx::query("SELECT key, status, c_time, m_time, size FROM file ORDER BY key ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(item_from_row).collect()
    }

    pub async fn pending_count(&self) -> Result<u64, ChangeLogError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    pub async fn last_sync_time(&self) -> Result<Option<i64>, ChangeLogError> {
        let value = sqlx::query_scalar("SELECT value FROM state WHERE key = ?1")
            .bind(LAST_SYNC_TIME)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_last_sync_time(&self, millis: i64) -> Result<(), ChangeLogError> {
        sqlx::query(
            "INSERT INTO state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(LAST_SYNC_TIME)
        .bind(millis)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn item_from_row(row: &SqliteRow) -> Result<Item, ChangeLogError> {
    let status: String = row.try_get("status")?;
    let size: i64 = row.try_get("size")?;
    Ok(Item {
        key: row.try_get("key")?,
        status: ItemStatus::parse(&status)?,
        c_time: row.try_get("c_time")?,
        m_time: row.try_get("m_time")?,
        size: size.max(0) as u64,
    })
}
