use crate::error::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use std::{path::Path, str::FromStr, time::Duration};
use tracing::instrument;

/// Initialize the database connection pool
///
/// WAL mode lets the API, the reconciler and concurrent orchestration runs
/// read while another connection commits a transition.
#[instrument(fields(db_path = %db_path.display()))]
pub async fn create_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(options).await?;

    Ok(pool)
}

/// In-memory database on a single, never-recycled connection.
///
/// Every SQLite `:memory:` connection is its own database, so the pool must
/// not open a second one.
pub async fn create_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Run database migrations
#[instrument(skip(pool))]
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;

    Ok(())
}

/// Backup database before migrations (returns backup path)
pub fn backup_database(db_path: &Path) -> Result<std::path::PathBuf> {
    let timestamp = chrono::Utc::now().timestamp();
    let backup_path = db_path.with_extension(format!("db.backup.{timestamp}"));

    if db_path.exists() {
        std::fs::copy(db_path, &backup_path)?;
    }

    Ok(backup_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_pool_creates_parent_dirs_and_migrates() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("sandbox.db");

        let pool = create_pool(&db_path).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM projects")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn backup_copies_existing_database() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("sandbox.db");
        std::fs::write(&db_path, b"sqlite bytes").unwrap();

        let backup = backup_database(&db_path).unwrap();

        assert_ne!(backup, db_path);
        assert_eq!(std::fs::read(&backup).unwrap(), b"sqlite bytes");
    }

    #[test]
    fn backup_of_missing_database_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("absent.db");

        let backup = backup_database(&db_path).unwrap();

        assert!(!backup.exists());
    }
}
