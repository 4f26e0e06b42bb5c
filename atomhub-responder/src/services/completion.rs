//! Completion reactor
//!
//! Consumes job notifications from the processing feed, closes the
//! matching ledger entry and follows up: failed jobs go to the retry
//! policy, successful ones get their proxy checked. Notifications for
//! jobs this service never started are acknowledged and dropped, since
//! the feed carries every job in the facility.

use crate::db::import_jobs::{self, ImportJob, JobStatus};
use crate::error::ProcessError;
use crate::messages::JobNotification;
use crate::services::retry::{RetryOutcome, RetryPolicy};
use crate::services::storage::StorageSystem;
use atomhub_common::events::{EventBus, HubEvent};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};

/// What a notification amounted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The job id matched nothing in the ledger
    UnknownJob,
    /// The job closed successfully
    Completed(JobStatus),
    /// The job failed and was handed to the retry policy
    FailureHandled(RetryOutcome),
}

pub struct CompletionReactor {
    db: SqlitePool,
    storage: Arc<dyn StorageSystem>,
    retry: RetryPolicy,
    proxy_shape_tag: String,
    events: EventBus,
}

impl CompletionReactor {
    pub fn new(
        db: SqlitePool,
        storage: Arc<dyn StorageSystem>,
        retry: RetryPolicy,
        proxy_shape_tag: &str,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            storage,
            retry,
            proxy_shape_tag: proxy_shape_tag.to_string(),
            events,
        }
    }

    pub async fn on_notification(
        &self,
        notification: &JobNotification,
    ) -> Result<CompletionOutcome, ProcessError> {
        let job_id = notification.job_id();

        let Some(job) = import_jobs::find_by_job_id(&self.db, job_id).await? else {
            // most feed traffic is other systems' jobs
            self.events.emit(HubEvent::UnknownJob {
                job_id: job_id.to_string(),
                timestamp: chrono::Utc::now(),
            });
            return Ok(CompletionOutcome::UnknownJob);
        };

        let status = JobStatus::from_notification(notification.status());
        import_jobs::complete(&self.db, job.id, status).await?;
        info!(
            "{} ({}): job {} finished with status {}",
            job.item_id.as_deref().unwrap_or("-"),
            job.atom_id,
            job_id,
            status.as_str()
        );
        self.events.emit(HubEvent::JobCompleted {
            job_id: job_id.to_string(),
            status: status.as_str().to_string(),
            timestamp: chrono::Utc::now(),
        });

        if status.is_failed() {
            let outcome = self.retry.on_job_failed(&job).await?;
            return Ok(CompletionOutcome::FailureHandled(outcome));
        }

        if let Some(paths) = notification.file_paths() {
            info!("Job {} delivered {} file(s)", job_id, paths.len());
        }

        self.verify_proxy(&job).await;
        Ok(CompletionOutcome::Completed(status))
    }

    /// Check the proxy produced for a finished import and kick off a
    /// regeneration if it is missing or corrupt. This is best-effort: the
    /// import already succeeded, so nothing here may fail the message.
    async fn verify_proxy(&self, job: &ImportJob) {
        let Some(item_id) = job.item_id.as_deref() else {
            warn!("Job {:?} has no item recorded, skipping proxy check", job.job_id);
            return;
        };

        if let Err(detail) = self.try_verify_proxy(item_id).await {
            warn!("{}: proxy check failed: {}", item_id, detail);
            self.events.emit(HubEvent::ProxyCheckFailed {
                item_id: item_id.to_string(),
                detail,
                timestamp: chrono::Utc::now(),
            });
        }
    }

    async fn try_verify_proxy(&self, item_id: &str) -> Result<(), String> {
        let check = self
            .storage
            .check_proxy(item_id)
            .await
            .map_err(|e| e.to_string())?;
        if !check.needs_regen {
            return Ok(());
        }

        if let Some(shape_id) = &check.shape_id {
            info!("{}: deleting corrupt proxy shape {}", item_id, shape_id);
            self.storage
                .delete_proxy(item_id, shape_id)
                .await
                .map_err(|e| e.to_string())?;
        }

        info!("{}: requesting proxy regeneration", item_id);
        self.storage
            .request_transcode(item_id, &self.proxy_shape_tag)
            .await
            .map_err(|e| e.to_string())
    }
}
