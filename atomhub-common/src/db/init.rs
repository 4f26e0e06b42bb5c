//! Database initialization
//!
//! Opens (or creates) the SQLite database and ensures the schema exists.
//! Table creation is idempotent so every process entry point can call it.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL allows concurrent readers while one consumer task writes
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create all tables (idempotent); exposed so tests can run it against
/// an in-memory pool
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_import_jobs_table(pool).await?;
    create_deferred_payloads_table(pool).await?;
    create_cached_commissions_table(pool).await?;
    create_linked_projects_table(pool).await?;
    Ok(())
}

/// The job ledger: one row per import attempt
pub async fn create_import_jobs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            item_id TEXT,
            job_id TEXT,
            atom_id TEXT NOT NULL,
            atom_title TEXT NOT NULL DEFAULT 'Unknown title',
            user_email TEXT NOT NULL DEFAULT 'Unknown user',
            source_path TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'STARTED',
            processing INTEGER NOT NULL DEFAULT 0,
            retry_number INTEGER NOT NULL DEFAULT 0,
            source_size INTEGER,
            started_at TEXT NOT NULL,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_import_jobs_item ON import_jobs(item_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_import_jobs_job ON import_jobs(job_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_import_jobs_atom ON import_jobs(atom_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Holding area for auxiliary payloads that arrive before their item
pub async fn create_deferred_payloads_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS deferred_payloads (
            atom_id TEXT PRIMARY KEY,
            payload_location TEXT NOT NULL,
            received_at TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'UNPROCESSED',
            last_error TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Commission data mirrored from upstream domain events
pub async fn create_cached_commissions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cached_commissions (
            commission_id INTEGER PRIMARY KEY,
            title TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Live project -> commission association, one row per project
pub async fn create_linked_projects_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS linked_projects (
            project_id INTEGER PRIMARY KEY,
            commission_id INTEGER NOT NULL
                REFERENCES cached_commissions(commission_id)
                ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_creation_is_idempotent() {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");

        create_schema(&pool).await.unwrap();
        create_schema(&pool).await.unwrap();

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM import_jobs")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 0);
    }
}
