mod config;
mod context;
mod error;
mod metrics;
mod model_versions;
mod registered_models;
mod rows;
mod tracking;

pub use config::{JournalMode, StoreConfig, IN_MEMORY_PATH};
pub use context::RequestContext;
pub use error::{ErrorCode, StoreError};
pub use model_versions::NewModelVersion;

use error::is_busy;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::Path;
use tracing::debug;

pub const META_SCHEMA_VERSION: i64 = 2;

/// Transactional store over one SQLite connection.
///
/// Writers take the database write lock when their transaction begins, so every read made
/// inside a writing unit (the latest-metric lookup in particular) sees rows no other writer
/// can change before commit. Open one store per thread to run units concurrently.
pub struct MetaStore {
    conn: Connection,
    config: StoreConfig,
}

impl MetaStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_config(StoreConfig::new(path))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_config(StoreConfig::in_memory())
    }

    pub fn with_config(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let conn = if config.is_in_memory() {
            Connection::open_in_memory()
        } else {
            Connection::open(&config.path)
        }
        .map_err(|err| {
            StoreError::internal(format!("failed to open {}", config.path.display()), err)
        })?;

        conn.busy_timeout(config.busy_timeout())?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        if !config.is_in_memory() {
            conn.pragma_update_and_check(None, "journal_mode", config.journal_mode.as_str(), |row| {
                row.get::<_, String>(0)
            })?;
        }

        let store = Self { conn, config };
        store.migrate()?;
        Ok(store)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StoreError> {
        let mut current = self.schema_version()?;
        if current > META_SCHEMA_VERSION {
            return Err(StoreError::internal_message(format!(
                "unsupported schema version {current}, max supported {META_SCHEMA_VERSION}"
            )));
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_tracking_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_model_registry_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 2", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Runs `f` as one unit of work under the database write lock.
    ///
    /// Any error returned by `f`, and a context that fires before commit, leaves the
    /// transaction uncommitted; dropping it rolls every statement back.
    pub fn transaction<T, F>(
        &mut self,
        ctx: &RequestContext,
        operation: &str,
        f: F,
    ) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        ctx.check(operation)?;
        self.conn
            .busy_timeout(ctx.lock_wait(self.config.busy_timeout()))?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| {
                if is_busy(&err) {
                    StoreError::internal(
                        format!("{operation} timed out waiting for the write lock"),
                        err,
                    )
                } else {
                    StoreError::internal(format!("failed to begin {operation}"), err)
                }
            })?;

        let value = f(&tx)?;

        ctx.check(operation)?;
        tx.commit()
            .map_err(|err| StoreError::internal(format!("failed to commit {operation}"), err))?;
        debug!(event = "transaction_committed", operation = operation);
        Ok(value)
    }

    /// Read-only unit: a deferred transaction so multi-statement reads see one snapshot.
    pub(crate) fn read<T, F>(
        &self,
        ctx: &RequestContext,
        operation: &str,
        f: F,
    ) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        ctx.check(operation)?;
        self.conn
            .busy_timeout(ctx.lock_wait(self.config.busy_timeout()))?;
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|err| StoreError::internal(format!("failed to begin {operation}"), err))?;
        let value = f(&tx)?;
        tx.commit()
            .map_err(|err| StoreError::internal(format!("failed to finish {operation}"), err))?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn table_names(store: &MetaStore) -> Vec<String> {
        let mut statement = store
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .expect("prepare");
        let rows = statement
            .query_map([], |row| row.get::<_, String>(0))
            .expect("query");
        let mut names = Vec::new();
        for row in rows {
            names.push(row.expect("row"));
        }
        names
    }

    #[test]
    fn migrate_creates_every_table() {
        let store = MetaStore::open_in_memory().expect("open db");
        assert_eq!(
            store.schema_version().expect("schema version"),
            META_SCHEMA_VERSION
        );

        let tables = table_names(&store);
        for table in [
            "experiments",
            "runs",
            "metrics",
            "latest_metrics",
            "logged_model_metrics",
            "registered_models",
            "model_versions",
            "registered_model_tags",
            "model_version_tags",
            "registered_model_aliases",
        ] {
            assert!(tables.iter().any(|name| name == table), "missing {table}");
        }
    }

    #[test]
    fn reopening_a_file_keeps_the_schema_version() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let store = MetaStore::open(file.path()).expect("open db");
            store.migrate().expect("migrate twice");
        }
        let reopened = MetaStore::open(file.path()).expect("reopen db");
        assert_eq!(
            reopened.schema_version().expect("schema version"),
            META_SCHEMA_VERSION
        );
    }

    #[test]
    fn newer_schema_is_rejected() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let conn = Connection::open(file.path()).expect("open raw");
            conn.execute("PRAGMA user_version = 99", [])
                .expect("bump version");
        }
        let err = MetaStore::open(file.path())
            .err()
            .expect("newer schema must fail");
        assert_eq!(err.code(), ErrorCode::InternalError);
        assert!(err.to_string().contains("unsupported schema version 99"));
    }

    #[test]
    fn failing_unit_rolls_back() {
        let mut store = MetaStore::open_in_memory().expect("open db");
        let ctx = RequestContext::background();
        let err = store
            .transaction(&ctx, "seed", |tx| {
                tx.execute(
                    "INSERT INTO registered_models (name, creation_time, last_updated_time) VALUES ('a', 1, 1)",
                    [],
                )?;
                Err::<(), _>(StoreError::InvalidState("abort".to_string()))
            })
            .expect_err("unit fails");
        assert_eq!(err.code(), ErrorCode::InvalidState);

        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM registered_models", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 0);
    }

    #[test]
    fn cancellation_before_commit_rolls_back() {
        let mut store = MetaStore::open_in_memory().expect("open db");
        let ctx = RequestContext::background();
        let err = store
            .transaction(&ctx, "seed", |tx| {
                tx.execute(
                    "INSERT INTO registered_models (name, creation_time, last_updated_time) VALUES ('a', 1, 1)",
                    [],
                )?;
                ctx.cancel();
                Ok(())
            })
            .expect_err("cancelled before commit");
        assert_eq!(err.code(), ErrorCode::InternalError);

        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM registered_models", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 0);
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let store = MetaStore::open_in_memory().expect("open db");
        let err = store
            .conn
            .execute(
                "INSERT INTO model_versions (name, version, creation_time, last_updated_time) VALUES ('ghost', 1, 1, 1)",
                [],
            )
            .expect_err("orphan version");
        assert!(err.to_string().contains("FOREIGN KEY"));
    }
}
