//! Embedded SQLite store: WAL mode, a writer pool capped at one
//! connection and a reader pool capped at four.
//!
//! The single-connection writer pool serializes every write path
//! (batch insert, mark-synced, retention, checkpoints) inside the
//! driver, so callers never take an application-level lock.

mod insert;
mod maintenance;
mod push;
mod schema;

pub use insert::{ErrorInsert, MetricInsert, TraceInsert, TraceRow};
pub use maintenance::CleanupOutcome;
pub(crate) use maintenance::statvfs;
pub use push::{EventTable, PushEvent};

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::SqlitePool;

/// Failure kinds the rest of the pipeline distinguishes.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The pool is closed or the database cannot be reached at all.
    #[error("store unavailable: {0}")]
    Unavailable(sqlx::Error),
    /// A uniqueness violation (duplicate trace_id).
    #[error("uniqueness conflict: {0}")]
    Conflict(sqlx::Error),
    /// Any other driver or underlying storage fault.
    #[error("storage fault: {0}")]
    Io(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolClosed => StoreError::Unavailable(e),
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(e),
            _ => StoreError::Io(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Pragma values read back for the startup log.
#[derive(Debug, Clone)]
pub struct PragmaInfo {
    pub journal_mode: String,
    pub busy_timeout_ms: i64,
    pub auto_vacuum: i64,
}

/// Liveness and on-disk size figures for the health surface.
#[derive(Debug, Clone)]
pub struct HealthStats {
    pub db_status: &'static str,
    pub db_size_bytes: i64,
    pub wal_size_bytes: i64,
}

pub struct Store {
    path: PathBuf,
    writer: SqlitePool,
    reader: SqlitePool,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// Every connection in both pools carries the full pragma set; the
    /// writer pool is capped at 1 so the driver serializes all writes.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError::Unavailable(sqlx::Error::Io(e)))?;
            }
        }

        let opts = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10))
            .auto_vacuum(SqliteAutoVacuum::Incremental)
            .foreign_keys(true)
            .pragma("cache_size", "-8000")
            .pragma("temp_store", "MEMORY");

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts.clone())
            .await?;
        let reader = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        let store = Self {
            path,
            writer,
            reader,
        };
        store.ensure_auto_vacuum().await?;
        store.apply_schema().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn writer(&self) -> &SqlitePool {
        &self.writer
    }

    pub(crate) fn reader(&self) -> &SqlitePool {
        &self.reader
    }

    async fn apply_schema(&self) -> Result<()> {
        for stmt in schema::SCHEMA.split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(&self.writer).await?;
            }
        }
        Ok(())
    }

    /// `auto_vacuum` only takes effect on databases that were created
    /// with it. For a pre-existing file the pragma must be set and the
    /// database rebuilt once with VACUUM.
    async fn ensure_auto_vacuum(&self) -> Result<()> {
        let mode: i64 = sqlx::query_scalar("PRAGMA auto_vacuum")
            .fetch_one(&self.writer)
            .await?;
        if mode == 2 {
            return Ok(());
        }
        sqlx::query("PRAGMA auto_vacuum = INCREMENTAL")
            .execute(&self.writer)
            .await?;
        sqlx::query("VACUUM").execute(&self.writer).await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.writer).await?;
        Ok(())
    }

    /// Read back the effective pragmas for operator visibility.
    pub async fn pragmas(&self) -> Result<PragmaInfo> {
        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&self.writer)
            .await?;
        let busy_timeout_ms: i64 = sqlx::query_scalar("PRAGMA busy_timeout")
            .fetch_one(&self.writer)
            .await?;
        let auto_vacuum: i64 = sqlx::query_scalar("PRAGMA auto_vacuum")
            .fetch_one(&self.writer)
            .await?;
        Ok(PragmaInfo {
            journal_mode,
            busy_timeout_ms,
            auto_vacuum,
        })
    }

    pub async fn stats(&self) -> HealthStats {
        let db_status = if self.ping().await.is_ok() {
            "ok"
        } else {
            "error"
        };
        HealthStats {
            db_status,
            db_size_bytes: self.db_size_bytes(),
            wal_size_bytes: self.wal_size_bytes(),
        }
    }

    /// Total rows across the three event tables that are still unsynced.
    pub async fn unsynced_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT
               (SELECT COUNT(*) FROM llm_traces WHERE synced = 0) +
               (SELECT COUNT(*) FROM error_events WHERE synced = 0) +
               (SELECT COUNT(*) FROM system_metrics WHERE synced = 0)",
        )
        .fetch_one(&self.reader)
        .await?;
        Ok(count)
    }

    /// Unconditional TRUNCATE checkpoint. Only called at shutdown, when
    /// no writer can be concurrent.
    pub async fn checkpoint_truncate(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.writer)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.writer.close().await;
        self.reader.close().await;
    }
}
