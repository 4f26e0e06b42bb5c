//! Deferred-data cache
//!
//! Auxiliary payloads can arrive before the item they attach to exists.
//! They are parked here keyed by atom id; redelivery is last-write-wins,
//! not an error.

use atomhub_common::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredStatus {
    Unprocessed,
    Processed,
}

impl DeferredStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Unprocessed => "UNPROCESSED",
            Self::Processed => "PROCESSED",
        }
    }

    fn from_str(s: &str) -> Self {
        if s == "PROCESSED" {
            Self::Processed
        } else {
            Self::Unprocessed
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeferredPayload {
    pub atom_id: String,
    pub payload_location: String,
    pub received_at: DateTime<Utc>,
    pub status: DeferredStatus,
    pub last_error: String,
}

/// Register a payload for an atom, overwriting any prior entry and
/// resetting it to UNPROCESSED. Returns true when an entry was replaced.
pub async fn upsert(pool: &SqlitePool, atom_id: &str, payload_location: &str) -> Result<bool> {
    let existing: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM deferred_payloads WHERE atom_id = ?")
            .bind(atom_id)
            .fetch_one(pool)
            .await?;

    sqlx::query(
        r#"
        INSERT INTO deferred_payloads (atom_id, payload_location, received_at, status, last_error)
        VALUES (?, ?, ?, 'UNPROCESSED', '')
        ON CONFLICT(atom_id) DO UPDATE SET
            payload_location = excluded.payload_location,
            received_at = excluded.received_at,
            status = 'UNPROCESSED',
            last_error = ''
        "#,
    )
    .bind(atom_id)
    .bind(payload_location)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(existing > 0)
}

/// Look up a payload still waiting to be attached
pub async fn find_unprocessed(pool: &SqlitePool, atom_id: &str) -> Result<Option<DeferredPayload>> {
    let row = sqlx::query(
        "SELECT * FROM deferred_payloads WHERE atom_id = ? AND status = 'UNPROCESSED'",
    )
    .bind(atom_id)
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let received_at: String = row.get("received_at");
            let status: String = row.get("status");
            Ok(Some(DeferredPayload {
                atom_id: row.get("atom_id"),
                payload_location: row.get("payload_location"),
                received_at: DateTime::parse_from_rfc3339(&received_at)
                    .map_err(|e| atomhub_common::Error::Internal(e.to_string()))?
                    .with_timezone(&Utc),
                status: DeferredStatus::from_str(&status),
                last_error: row.get("last_error"),
            }))
        }
        None => Ok(None),
    }
}

pub async fn mark_processed(pool: &SqlitePool, atom_id: &str) -> Result<()> {
    sqlx::query("UPDATE deferred_payloads SET status = 'PROCESSED', last_error = '' WHERE atom_id = ?")
        .bind(atom_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn record_error(pool: &SqlitePool, atom_id: &str, error: &str) -> Result<()> {
    sqlx::query("UPDATE deferred_payloads SET last_error = ? WHERE atom_id = ?")
        .bind(error)
        .bind(atom_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        atomhub_common::db::init::create_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_upsert_is_last_write_wins() {
        let pool = test_pool().await;

        let replaced = upsert(&pool, "atom-1", "s3://bucket/one.xml").await.unwrap();
        assert!(!replaced);
        mark_processed(&pool, "atom-1").await.unwrap();

        // Redelivery overwrites and resets to UNPROCESSED
        let replaced = upsert(&pool, "atom-1", "s3://bucket/two.xml").await.unwrap();
        assert!(replaced);

        let entry = find_unprocessed(&pool, "atom-1").await.unwrap().unwrap();
        assert_eq!(entry.payload_location, "s3://bucket/two.xml");
        assert_eq!(entry.status, DeferredStatus::Unprocessed);
        assert!(entry.last_error.is_empty());
    }

    #[tokio::test]
    async fn test_processed_entries_are_not_returned() {
        let pool = test_pool().await;

        upsert(&pool, "atom-1", "s3://bucket/one.xml").await.unwrap();
        mark_processed(&pool, "atom-1").await.unwrap();

        assert!(find_unprocessed(&pool, "atom-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_record_error_keeps_entry_unprocessed() {
        let pool = test_pool().await;

        upsert(&pool, "atom-1", "s3://bucket/one.xml").await.unwrap();
        record_error(&pool, "atom-1", "item not reachable").await.unwrap();

        let entry = find_unprocessed(&pool, "atom-1").await.unwrap().unwrap();
        assert_eq!(entry.last_error, "item not reachable");
    }
}
