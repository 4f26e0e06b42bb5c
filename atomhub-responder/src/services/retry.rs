//! Retry policy for failed import jobs
//!
//! Two strategies, selected per deployment: request an immediate resend
//! with a bounded attempt count, or schedule the resend after an
//! exponential backoff. In both, the ledger row is saved with the
//! updated counter before the resend request goes out, so a crash in
//! between leaves a reconcilable history.

use crate::db::import_jobs::{self, ImportJob};
use crate::error::ProcessError;
use crate::services::resend::ResendRequester;
use atomhub_common::config::{RetryConfig, RetryStrategy};
use atomhub_common::events::{EventBus, HubEvent};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// What the policy decided for one failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Retry ceiling exceeded; job closed as FAILED_TOTAL
    Exhausted,
    /// A resend was requested (delay 0 for the immediate strategy)
    Requested { retry_number: u32, delay_secs: u64 },
}

/// Backoff delay in seconds: min(cap, base^(retry_number+1))
pub fn backoff_delay(retry_number: u32, base: u64, cap: u64) -> u64 {
    let exponent = retry_number.saturating_add(1);
    let mut delay: u64 = 1;
    for _ in 0..exponent {
        delay = delay.saturating_mul(base);
        if delay >= cap {
            return cap;
        }
    }
    delay.min(cap)
}

pub struct RetryPolicy {
    db: SqlitePool,
    config: RetryConfig,
    resend: Arc<dyn ResendRequester>,
    events: EventBus,
}

impl RetryPolicy {
    pub fn new(
        db: SqlitePool,
        config: RetryConfig,
        resend: Arc<dyn ResendRequester>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            config,
            resend,
            events,
        }
    }

    /// React to a failure notification for a ledger entry
    pub async fn on_job_failed(&self, job: &ImportJob) -> Result<RetryOutcome, ProcessError> {
        info!(
            "{} ({}): failed on attempt {}",
            job.item_id.as_deref().unwrap_or("-"),
            job.atom_id,
            job.retry_number
        );

        if job.retry_number >= self.config.max_retries {
            error!(
                "{}: Have already retried {} times, giving up",
                job.atom_id, job.retry_number
            );
            import_jobs::mark_failed_total(&self.db, job.id).await?;
            self.events.emit(HubEvent::RetryExhausted {
                atom_id: job.atom_id.clone(),
                retry_number: job.retry_number,
                timestamp: chrono::Utc::now(),
            });
            return Ok(RetryOutcome::Exhausted);
        }

        let next_retry = job.retry_number + 1;
        // ledger first: the counter must survive a crash before the resend
        import_jobs::set_retry_number(&self.db, job.id, next_retry).await?;

        let delay_secs = match self.config.strategy {
            RetryStrategy::Immediate => {
                if let Err(e) = self.resend.request_resend(&job.atom_id).await {
                    // the ledger already reflects the attempt; a failed
                    // resend is reported, not re-raised
                    error!("{}: Could not request resend: {}", job.atom_id, e);
                }
                0
            }
            RetryStrategy::Backoff => {
                let delay = backoff_delay(
                    job.retry_number,
                    self.config.backoff_base,
                    self.config.backoff_cap,
                );
                let resend = Arc::clone(&self.resend);
                let atom_id = job.atom_id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    if let Err(e) = resend.request_resend(&atom_id).await {
                        warn!("{}: Deferred resend failed: {}", atom_id, e);
                    }
                });
                delay
            }
        };

        self.events.emit(HubEvent::RetryRequested {
            atom_id: job.atom_id.clone(),
            retry_number: next_retry,
            delay_secs,
            timestamp: chrono::Utc::now(),
        });

        Ok(RetryOutcome::Requested {
            retry_number: next_retry,
            delay_secs,
        })
    }
}
