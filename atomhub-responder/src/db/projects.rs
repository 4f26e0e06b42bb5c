//! Commission/project link cache
//!
//! Commission rows are written strictly by commission domain events.
//! Linked projects hold exactly one live commission association each and
//! are read (never written) by the import path, so commission attribution
//! never blocks on a remote call.

use atomhub_common::Result;
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone)]
pub struct CachedCommission {
    pub commission_id: i64,
    pub title: String,
}

/// Insert or update a commission from a domain event
pub async fn upsert_commission(pool: &SqlitePool, commission_id: i64, title: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO cached_commissions (commission_id, title)
        VALUES (?, ?)
        ON CONFLICT(commission_id) DO UPDATE SET title = excluded.title
        "#,
    )
    .bind(commission_id)
    .bind(title)
    .execute(pool)
    .await?;
    Ok(())
}

/// Remove a commission; linked projects referencing it cascade away
pub async fn delete_commission(pool: &SqlitePool, commission_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM cached_commissions WHERE commission_id = ?")
        .bind(commission_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn find_commission(pool: &SqlitePool, commission_id: i64) -> Result<Option<CachedCommission>> {
    let row = sqlx::query("SELECT commission_id, title FROM cached_commissions WHERE commission_id = ?")
        .bind(commission_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|row| CachedCommission {
        commission_id: row.get("commission_id"),
        title: row.get("title"),
    }))
}

/// Associate a project with a commission, replacing any prior link.
/// Returns false (and writes nothing) when the commission is not cached
/// yet; the caller decides whether to wait for redelivery.
pub async fn link_project(pool: &SqlitePool, project_id: i64, commission_id: i64) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let known: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM cached_commissions WHERE commission_id = ?")
            .bind(commission_id)
            .fetch_one(&mut *tx)
            .await?;
    if known == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(
        r#"
        INSERT INTO linked_projects (project_id, commission_id)
        VALUES (?, ?)
        ON CONFLICT(project_id) DO UPDATE SET commission_id = excluded.commission_id
        "#,
    )
    .bind(project_id)
    .bind(commission_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

/// Hot-path lookup used when attributing an import to a commission
pub async fn commission_for_project(pool: &SqlitePool, project_id: i64) -> Result<Option<i64>> {
    let commission =
        sqlx::query_scalar("SELECT commission_id FROM linked_projects WHERE project_id = ?")
            .bind(project_id)
            .fetch_optional(pool)
            .await?;
    Ok(commission)
}
