//! SQLite persistence for the PACS client: the store, schema migrations,
//! a generic repository over an entity-mapping trait, and the per-entity
//! repositories with their domain queries.
//!
//! Timestamps are stored as ISO-8601 text at second precision; vectors and
//! maps are JSON text columns. Every table carries an integer `pk` and a
//! unique domain-id column.

mod migrations;
mod repository;

mod jobs;
mod nodes;
mod prefetch;
mod recent;
mod routing;
mod sync;

pub use jobs::{JobMapping, JobQueryOptions, JobRepository};
pub use nodes::{NodeMapping, NodeRepository};
pub use prefetch::{
    PrefetchHistoryMapping, PrefetchHistoryRepository, PrefetchRuleMapping, PrefetchRuleRepository,
};
pub use recent::{RecentStudyMapping, RecentStudyRepository};
pub use repository::{
    format_opt_ts, format_ts, parse_opt_ts, parse_ts, truncate_to_seconds, CmpOp, EntityMapping,
    Repository, SqlValue,
};
pub use routing::{RoutingRuleMapping, RoutingRuleRepository};
pub use sync::{
    SyncConfigMapping, SyncConfigRepository, SyncConflictMapping, SyncConflictRepository,
    SyncHistoryMapping, SyncHistoryRepository,
};

use std::path::Path;
use std::str::FromStr;

use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("malformed row in {table}: {detail}")]
    MalformedRow { table: &'static str, detail: String },
    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },
}

impl Error {
    pub(crate) fn malformed(table: &'static str, detail: impl std::fmt::Display) -> Self {
        Self::MalformedRow {
            table,
            detail: detail.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Handle to the client database. Cheap to clone; all repositories share
/// the underlying pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) an on-disk database and bring its schema
    /// up to date.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        migrations::apply(&pool).await?;
        Ok(Self { pool })
    }

    /// An in-memory database, for tests. Pinned to a single connection so
    /// the database outlives individual acquires.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(sqlx::Error::from)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        migrations::apply(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run `f` inside a transaction: committed when it returns `Ok`,
    /// rolled back when it returns `Err`. Transactions do not nest.
    pub async fn in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut sqlx::SqliteConnection) -> BoxFuture<'c, Result<T>>,
    {
        let mut txn = self.pool.begin().await?;
        match f(&mut *txn).await {
            Ok(value) => {
                txn.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = txn.rollback().await {
                    tracing::warn!(error = %rollback, "transaction rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Schema version currently on disk.
    pub async fn schema_version(&self) -> Result<i64> {
        migrations::current_version(&self.pool).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_applies_migrations() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(store.schema_version().await.unwrap(), migrations::LATEST);
    }

    #[tokio::test]
    async fn open_on_disk_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.db");

        let store = Store::open(&path).await.unwrap();
        drop(store);
        let store = Store::open(&path).await.unwrap();
        assert_eq!(store.schema_version().await.unwrap(), migrations::LATEST);
    }

    #[tokio::test]
    async fn transactions_roll_back_on_error() {
        let store = Store::open_in_memory().await.unwrap();

        let out: Result<()> = store
            .in_transaction(|txn| {
                Box::pin(async move {
                    sqlx::query("INSERT INTO recent_studies (study_uid, patient_id, accessed_at) VALUES ('1.2.3', 'P-1', '2025-01-01 00:00:00')")
                        .execute(&mut *txn)
                        .await?;
                    Err(Error::malformed("recent_studies", "forced failure"))
                })
            })
            .await;
        assert!(out.is_err());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM recent_studies")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
