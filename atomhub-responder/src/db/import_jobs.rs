//! Job ledger operations
//!
//! One row per import attempt. The claim path is the idempotency gate:
//! the duplicate checks and the insert of the new attempt run inside a
//! single transaction so two workers handling duplicate deliveries can
//! never both pass.

use atomhub_common::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

/// Lifecycle status of an import attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Started,
    Finished,
    FinishedWarning,
    Failed,
    FailedTotal,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Finished => "FINISHED",
            Self::FinishedWarning => "FINISHED_WARNING",
            Self::Failed => "FAILED",
            Self::FailedTotal => "FAILED_TOTAL",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "FINISHED" => Self::Finished,
            "FINISHED_WARNING" => Self::FinishedWarning,
            "FAILED" => Self::Failed,
            "FAILED_TOTAL" => Self::FailedTotal,
            _ => Self::Started,
        }
    }

    /// Map a terminal status reported by the processing feed onto the
    /// ledger's vocabulary. Unknown failure-ish statuses land on FAILED.
    pub fn from_notification(status: &str) -> Self {
        match status {
            "FINISHED" => Self::Finished,
            "FINISHED_WARNING" => Self::FinishedWarning,
            "FAILED_TOTAL" | "FAILED" | "ABORTED" => Self::Failed,
            other => {
                tracing::warn!("Unrecognised job status {}, recording as FAILED", other);
                Self::Failed
            }
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed | Self::FailedTotal)
    }
}

/// A job ledger entry
#[derive(Debug, Clone)]
pub struct ImportJob {
    pub id: i64,
    pub item_id: Option<String>,
    pub job_id: Option<String>,
    pub atom_id: String,
    pub atom_title: String,
    pub user_email: String,
    pub source_path: String,
    pub status: JobStatus,
    pub processing: bool,
    pub retry_number: u32,
    pub source_size: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input for a new import attempt
#[derive(Debug, Clone)]
pub struct NewImport {
    pub item_id: String,
    pub atom_id: String,
    pub atom_title: String,
    pub user_email: String,
    pub source_path: String,
}

/// Result of the idempotency gate
#[derive(Debug)]
pub enum ClaimOutcome {
    /// No duplicate found; the new attempt row was inserted
    Claimed(ImportJob),
    /// A FINISHED job exists for the item and a prior job used this key
    AlreadyCompleted,
    /// Another attempt for the item is still in flight
    AlreadyProcessing,
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<ImportJob> {
    let status: String = row.get("status");
    let started_at: String = row.get("started_at");
    let completed_at: Option<String> = row.get("completed_at");

    Ok(ImportJob {
        id: row.get("id"),
        item_id: row.get("item_id"),
        job_id: row.get("job_id"),
        atom_id: row.get("atom_id"),
        atom_title: row.get("atom_title"),
        user_email: row.get("user_email"),
        source_path: row.get("source_path"),
        status: JobStatus::from_str(&status),
        processing: row.get::<i64, _>("processing") != 0,
        retry_number: row.get::<i64, _>("retry_number") as u32,
        source_size: row.get("source_size"),
        started_at: parse_timestamp(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| atomhub_common::Error::Internal(format!("bad timestamp {}: {}", s, e)))
}

/// Evaluate the idempotency gate for a resolved item and, when clear,
/// insert the new STARTED attempt in the same transaction.
///
/// The skip conditions are values, not errors: a FINISHED job for the
/// item combined with a prior job for the identical source key means the
/// upload already happened; a processing attempt means one is in flight.
pub async fn claim_import(pool: &SqlitePool, new: &NewImport) -> Result<ClaimOutcome> {
    let mut tx = pool.begin().await?;

    let finished: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM import_jobs WHERE item_id = ? AND status = 'FINISHED'",
    )
    .bind(&new.item_id)
    .fetch_one(&mut *tx)
    .await?;

    let same_key: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM import_jobs WHERE item_id = ? AND source_path = ?",
    )
    .bind(&new.item_id)
    .bind(&new.source_path)
    .fetch_one(&mut *tx)
    .await?;

    if finished > 0 && same_key > 0 {
        tx.rollback().await?;
        return Ok(ClaimOutcome::AlreadyCompleted);
    }

    let processing: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM import_jobs WHERE item_id = ? AND processing = 1",
    )
    .bind(&new.item_id)
    .fetch_one(&mut *tx)
    .await?;

    if processing > 0 {
        tx.rollback().await?;
        return Ok(ClaimOutcome::AlreadyProcessing);
    }

    // Retry number continues the lineage of attempts for this atom
    let previous: Option<i64> =
        sqlx::query_scalar("SELECT MAX(retry_number) FROM import_jobs WHERE atom_id = ?")
            .bind(&new.atom_id)
            .fetch_one(&mut *tx)
            .await?;
    let retry_number = previous.map(|n| n + 1).unwrap_or(0);

    let started_at = Utc::now();
    let result = sqlx::query(
        r#"
        INSERT INTO import_jobs
            (item_id, atom_id, atom_title, user_email, source_path,
             status, processing, retry_number, started_at)
        VALUES (?, ?, ?, ?, ?, 'STARTED', 1, ?, ?)
        "#,
    )
    .bind(&new.item_id)
    .bind(&new.atom_id)
    .bind(&new.atom_title)
    .bind(&new.user_email)
    .bind(&new.source_path)
    .bind(retry_number)
    .bind(started_at.to_rfc3339())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(ClaimOutcome::Claimed(ImportJob {
        id: result.last_insert_rowid(),
        item_id: Some(new.item_id.clone()),
        job_id: None,
        atom_id: new.atom_id.clone(),
        atom_title: new.atom_title.clone(),
        user_email: new.user_email.clone(),
        source_path: new.source_path.clone(),
        status: JobStatus::Started,
        processing: true,
        retry_number: retry_number as u32,
        source_size: None,
        started_at,
        completed_at: None,
    }))
}

/// Record the external job id (and source size) once the job has started
pub async fn assign_job(
    pool: &SqlitePool,
    ledger_id: i64,
    job_id: &str,
    source_size: Option<i64>,
) -> Result<()> {
    sqlx::query("UPDATE import_jobs SET job_id = ?, source_size = ? WHERE id = ?")
        .bind(job_id)
        .bind(source_size)
        .bind(ledger_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Release a claim whose external job never started, so redelivery of the
/// triggering message is not mistaken for a concurrent duplicate
pub async fn release_failed_start(pool: &SqlitePool, ledger_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE import_jobs SET status = 'FAILED', processing = 0, completed_at = ? WHERE id = ?",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(ledger_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Look up a ledger entry by its external processing-job id
pub async fn find_by_job_id(pool: &SqlitePool, job_id: &str) -> Result<Option<ImportJob>> {
    let row = sqlx::query("SELECT * FROM import_jobs WHERE job_id = ?")
        .bind(job_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_job).transpose()
}

/// Close out an attempt with its terminal status
pub async fn complete(pool: &SqlitePool, ledger_id: i64, status: JobStatus) -> Result<()> {
    sqlx::query(
        "UPDATE import_jobs SET status = ?, processing = 0, completed_at = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(Utc::now().to_rfc3339())
    .bind(ledger_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Persist an incremented retry counter ahead of the resend request
pub async fn set_retry_number(pool: &SqlitePool, ledger_id: i64, retry_number: u32) -> Result<()> {
    sqlx::query("UPDATE import_jobs SET retry_number = ? WHERE id = ?")
        .bind(retry_number as i64)
        .bind(ledger_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Terminally close an attempt that exhausted its retry budget
pub async fn mark_failed_total(pool: &SqlitePool, ledger_id: i64) -> Result<()> {
    complete(pool, ledger_id, JobStatus::FailedTotal).await
}

/// Count of attempts recorded for an item (test and admin use)
pub async fn count_for_item(pool: &SqlitePool, item_id: &str) -> Result<i64> {
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM import_jobs WHERE item_id = ?")
        .bind(item_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");
        atomhub_common::db::init::create_schema(&pool).await.unwrap();
        pool
    }

    fn new_import(item: &str, key: &str) -> NewImport {
        NewImport {
            item_id: item.to_string(),
            atom_id: "6f91aa9e-23b2-45c0-9e6c-50ee34b1a2ff".to_string(),
            atom_title: "Test atom".to_string(),
            user_email: "fred@example.com".to_string(),
            source_path: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_first_claim_succeeds_with_retry_zero() {
        let pool = test_pool().await;

        match claim_import(&pool, &new_import("VX-100", "uploads/a.mp4")).await.unwrap() {
            ClaimOutcome::Claimed(job) => {
                assert_eq!(job.retry_number, 0);
                assert!(job.processing);
                assert!(job.job_id.is_none());
            }
            other => panic!("expected claim, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_processing_attempt_blocks_second_claim() {
        let pool = test_pool().await;
        let new = new_import("VX-100", "uploads/a.mp4");

        claim_import(&pool, &new).await.unwrap();
        match claim_import(&pool, &new).await.unwrap() {
            ClaimOutcome::AlreadyProcessing => {}
            other => panic!("expected AlreadyProcessing, got {:?}", other),
        }
        assert_eq!(count_for_item(&pool, "VX-100").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_finished_job_with_same_key_blocks() {
        let pool = test_pool().await;
        let new = new_import("VX-100", "uploads/a.mp4");

        let job = match claim_import(&pool, &new).await.unwrap() {
            ClaimOutcome::Claimed(job) => job,
            other => panic!("expected claim, got {:?}", other),
        };
        assign_job(&pool, job.id, "VX-JOB-1", None).await.unwrap();
        complete(&pool, job.id, JobStatus::Finished).await.unwrap();

        match claim_import(&pool, &new).await.unwrap() {
            ClaimOutcome::AlreadyCompleted => {}
            other => panic!("expected AlreadyCompleted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_finished_job_with_different_key_does_not_block() {
        let pool = test_pool().await;

        let job = match claim_import(&pool, &new_import("VX-100", "uploads/a.mp4"))
            .await
            .unwrap()
        {
            ClaimOutcome::Claimed(job) => job,
            other => panic!("expected claim, got {:?}", other),
        };
        complete(&pool, job.id, JobStatus::Finished).await.unwrap();

        // New file for the same item: lineage continues instead of skipping
        match claim_import(&pool, &new_import("VX-100", "uploads/b.mp4"))
            .await
            .unwrap()
        {
            ClaimOutcome::Claimed(job) => assert_eq!(job.retry_number, 1),
            other => panic!("expected claim, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_released_claim_allows_retry() {
        let pool = test_pool().await;
        let new = new_import("VX-100", "uploads/a.mp4");

        let job = match claim_import(&pool, &new).await.unwrap() {
            ClaimOutcome::Claimed(job) => job,
            other => panic!("expected claim, got {:?}", other),
        };
        release_failed_start(&pool, job.id).await.unwrap();

        // jobs for the same key exist, but none FINISHED and none in flight
        match claim_import(&pool, &new).await.unwrap() {
            ClaimOutcome::Claimed(job) => assert_eq!(job.retry_number, 1),
            other => panic!("expected claim, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_find_by_job_id_round_trip() {
        let pool = test_pool().await;

        let job = match claim_import(&pool, &new_import("VX-100", "uploads/a.mp4"))
            .await
            .unwrap()
        {
            ClaimOutcome::Claimed(job) => job,
            other => panic!("expected claim, got {:?}", other),
        };
        assign_job(&pool, job.id, "VX-JOB-9", Some(1_048_576)).await.unwrap();

        let found = find_by_job_id(&pool, "VX-JOB-9").await.unwrap().unwrap();
        assert_eq!(found.id, job.id);
        assert_eq!(found.source_size, Some(1_048_576));
        assert_eq!(found.status, JobStatus::Started);

        assert!(find_by_job_id(&pool, "VX-NOPE").await.unwrap().is_none());
    }
}
