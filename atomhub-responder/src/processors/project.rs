//! Processor for project domain events

use crate::db::projects;
use crate::error::ProcessError;
use crate::messages::{ProjectRecord, RouteIntent};
use crate::router::{Delivery, MessageProcessor};
use crate::services::resend::ResendRequester;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ProjectProcessor {
    db: SqlitePool,
    resend: Arc<dyn ResendRequester>,
}

impl ProjectProcessor {
    pub fn new(db: SqlitePool, resend: Arc<dyn ResendRequester>) -> Self {
        Self { db, resend }
    }
}

#[async_trait]
impl MessageProcessor for ProjectProcessor {
    async fn process(&self, delivery: &Delivery, payload: &Value) -> Result<(), ProcessError> {
        let intent = RouteIntent::from_routing_key(&delivery.routing_key)?;

        match intent {
            RouteIntent::Create | RouteIntent::Update => {
                let record = ProjectRecord::parse(payload)?;
                let linked =
                    projects::link_project(&self.db, record.id, record.commission_id).await?;
                if !linked {
                    // the commission event may not have arrived yet; ask the
                    // origin to replay it, then wait for redelivery
                    warn!(
                        "Project {} references unknown commission {}, requesting resync",
                        record.id, record.commission_id
                    );
                    if let Err(e) = self.resend.request_commission_resend(record.commission_id).await
                    {
                        warn!("Resync request for commission {} failed: {}", record.commission_id, e);
                    }
                    return Err(ProcessError::transient(format!(
                        "commission {} not cached yet",
                        record.commission_id
                    )));
                }
                info!("Linked project {} to commission {}", record.id, record.commission_id);
            }
            RouteIntent::Delete => {
                // projects are never deleted upstream; a delete here means a
                // misrouted or forged message
                return Err(ProcessError::business(format!(
                    "refusing project delete on routing key {}",
                    delivery.routing_key
                )));
            }
        }
        Ok(())
    }
}
