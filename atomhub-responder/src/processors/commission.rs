//! Processor for commission domain events

use crate::db::projects;
use crate::error::ProcessError;
use crate::messages::{CommissionRecord, RouteIntent};
use crate::router::{Delivery, MessageProcessor};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::info;

pub struct CommissionProcessor {
    db: SqlitePool,
}

impl CommissionProcessor {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageProcessor for CommissionProcessor {
    async fn process(&self, delivery: &Delivery, payload: &Value) -> Result<(), ProcessError> {
        let intent = RouteIntent::from_routing_key(&delivery.routing_key)?;
        let record = CommissionRecord::parse(payload)?;

        match intent {
            RouteIntent::Create | RouteIntent::Update => {
                projects::upsert_commission(&self.db, record.id, &record.title).await?;
                info!("Cached commission {} ({})", record.id, record.title);
            }
            RouteIntent::Delete => {
                projects::delete_commission(&self.db, record.id).await?;
                info!("Removed commission {}", record.id);
            }
        }
        Ok(())
    }
}
