//! SQLite persistence layer
//!
//! All pool, lesson and recording state lives in one sqlite database so it
//! survives process restarts. Blocking worker threads go through the `Db`
//! wrapper, which embeds a current-thread runtime for sqlx calls.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::runtime::Runtime;

use crate::constants::EXPECTED_DB_VERSION;
use crate::queries::{ddl, metadata};

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Synchronous database wrapper that owns a runtime for blocking operations.
pub struct Db {
    pool: SqlitePool,
    runtime: Runtime,
}

impl Db {
    /// Open the database at `path` with an embedded runtime, creating the
    /// file and schema if needed.
    pub fn connect(path: &Path) -> Result<Self, DynError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let pool = runtime.block_on(async {
            let pool = open_database(path).await?;
            init_database_schema(&pool).await?;
            Ok::<_, DynError>(pool)
        })?;
        Ok(Self { pool, runtime })
    }

    /// Block on an async future using the embedded runtime
    pub fn block_on<F, T>(&self, fut: F) -> Result<T, DynError>
    where
        F: Future<Output = Result<T, DynError>>,
    {
        self.runtime.block_on(fut)
    }

    /// Get a reference to the underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Execute a single SQL statement and return the affected row count
    pub fn execute(&self, sql: &str) -> Result<u64, DynError> {
        self.block_on(async {
            let result = sqlx::query(sql).execute(&self.pool).await?;
            Ok(result.rows_affected())
        })
    }

    /// Query a single optional scalar
    pub fn query_one_optional<T>(&self, sql: &str) -> Result<Option<T>, DynError>
    where
        T: for<'r> sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite> + Send + Unpin,
    {
        self.block_on(async {
            let result = sqlx::query_scalar::<_, T>(sql)
                .fetch_optional(&self.pool)
                .await?;
            Ok(result)
        })
    }
}

/// Open a file-based database pool for production use
/// Enables WAL mode, foreign keys and a busy timeout
pub async fn open_database(path: &Path) -> Result<SqlitePool, DynError> {
    let url = format!("sqlite://{}", path.display());
    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Initialize database schema (idempotent)
pub async fn init_database_schema(pool: &SqlitePool) -> Result<(), DynError> {
    sqlx::query(&ddl::create_metadata_table())
        .execute(pool)
        .await?;
    sqlx::query(&ddl::create_accounts_table())
        .execute(pool)
        .await?;
    sqlx::query(&ddl::create_lessons_table())
        .execute(pool)
        .await?;
    sqlx::query(&ddl::create_recordings_table())
        .execute(pool)
        .await?;
    sqlx::query(&ddl::create_recording_parts_table())
        .execute(pool)
        .await?;

    sqlx::query(&ddl::create_lessons_account_id_index())
        .execute(pool)
        .await?;
    sqlx::query(&ddl::create_lessons_status_end_index())
        .execute(pool)
        .await?;
    sqlx::query(&ddl::create_recordings_status_due_index())
        .execute(pool)
        .await?;
    sqlx::query(&ddl::create_recording_parts_recording_id_index())
        .execute(pool)
        .await?;

    // Stamp the schema version on first creation, refuse mismatches after
    let existing = query_metadata(pool, "version").await?;
    match existing {
        Some(version) => {
            if version != EXPECTED_DB_VERSION {
                return Err(format!(
                    "Database has unsupported schema version '{}' (expected '{}')",
                    version, EXPECTED_DB_VERSION
                )
                .into());
            }
        }
        None => {
            let sql = metadata::insert("version", EXPECTED_DB_VERSION);
            sqlx::query(&sql).execute(pool).await?;
        }
    }

    Ok(())
}

/// Query a single metadata value by key
pub async fn query_metadata(pool: &SqlitePool, key: &str) -> Result<Option<String>, DynError> {
    let sql = metadata::select_by_key(key);
    let result = sqlx::query(&sql).fetch_optional(pool).await?;
    Ok(result.map(|row| row.get::<String, _>(0)))
}


/// Create a database in a temporary directory for testing
/// Returns (db, guard) - keep the guard alive to prevent temp file deletion
pub fn create_test_db() -> Result<(Db, tempfile::TempDir), DynError> {
    let guard = tempfile::tempdir()?;
    let db_path = guard.path().join("test.sqlite");
    let db = Db::connect(&db_path)?;
    Ok((db, guard))
}
