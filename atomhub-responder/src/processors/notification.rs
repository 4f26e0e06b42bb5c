//! Processor for the job-completion feed

use crate::error::ProcessError;
use crate::messages::JobNotification;
use crate::router::{Delivery, MessageProcessor};
use crate::services::completion::CompletionReactor;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub struct JobNotificationProcessor {
    reactor: Arc<CompletionReactor>,
}

impl JobNotificationProcessor {
    pub fn new(reactor: Arc<CompletionReactor>) -> Self {
        Self { reactor }
    }
}

#[async_trait]
impl MessageProcessor for JobNotificationProcessor {
    async fn process(&self, _delivery: &Delivery, payload: &Value) -> Result<(), ProcessError> {
        let notification = JobNotification::parse(payload)?;
        self.reactor.on_notification(&notification).await?;
        Ok(())
    }
}
