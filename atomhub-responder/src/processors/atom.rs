//! Processor for the upload event stream

use crate::error::ProcessError;
use crate::messages::AtomMessage;
use crate::router::{Delivery, MessageProcessor};
use crate::services::importer::ImportCoordinator;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub struct AtomEventProcessor {
    coordinator: Arc<ImportCoordinator>,
}

impl AtomEventProcessor {
    pub fn new(coordinator: Arc<ImportCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl MessageProcessor for AtomEventProcessor {
    async fn process(&self, delivery: &Delivery, payload: &Value) -> Result<(), ProcessError> {
        let message = AtomMessage::parse(payload)?;
        debug!("Atom {}: handling {:?}", message.atom_id(), delivery.routing_key);

        let outcome = match &message {
            AtomMessage::VideoUpload(upload) | AtomMessage::VideoUploadResync(upload) => {
                self.coordinator.handle_media_upload(upload, payload).await?
            }
            AtomMessage::AuxiliaryUpload(upload) => {
                self.coordinator.handle_auxiliary_upload(upload).await?
            }
            AtomMessage::ProjectAssigned(assigned) => {
                self.coordinator
                    .handle_project_assigned(assigned, payload, delivery.retry_count)
                    .await?
            }
        };
        debug!("Atom {}: {:?}", message.atom_id(), outcome);
        Ok(())
    }
}
