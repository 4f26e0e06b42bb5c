//! Service assembly
//!
//! Builds the concrete adapters from configuration and wires them into
//! the router and its consumers. The routing table lives here: it is the
//! one place that says which stream feeds which processor and what
//! happens to a message that transiently fails.

use crate::processors::{
    AtomEventProcessor, CommissionProcessor, JobNotificationProcessor, ProjectProcessor,
};
use crate::router::{DispatchRouter, FailurePolicy};
use crate::services::completion::CompletionReactor;
use crate::services::importer::ImportCoordinator;
use crate::services::media_store::HttpMediaStore;
use crate::services::publisher::{HttpBrokerSink, NotificationSink, RetryingPublisher};
use crate::services::resend::ResendClient;
use crate::services::retry::RetryPolicy;
use crate::services::storage::HttpStorageSystem;
use crate::worker::{DeliverySource, PollingQueueSource, QueueBinding};
use atomhub_common::config::HubConfig;
use atomhub_common::db::init_database;
use atomhub_common::events::EventBus;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Upload event stream from the atom tool
pub const SOURCE_MEDIA_ATOM: &str = "media-atom";
/// Project/commission domain events
pub const SOURCE_PLUTO_CORE: &str = "pluto-core";
/// Job notifications from the storage system
pub const SOURCE_STORAGE_EVENTS: &str = "storage-events";

/// Everything `run` needs, fully wired
pub struct App {
    pub db: SqlitePool,
    pub events: EventBus,
    pub router: Arc<DispatchRouter>,
    pub sources: Vec<Arc<dyn DeliverySource>>,
}

pub async fn build(config: &HubConfig) -> anyhow::Result<App> {
    let db = init_database(&config.database_path).await?;
    let events = EventBus::new(256);

    let storage = Arc::new(HttpStorageSystem::new(
        &config.storage.base_url,
        &config.storage.username,
        &config.storage.password,
    ));
    let media = Arc::new(HttpMediaStore::new(
        &config.download.bucket_endpoint,
        &config.download.local_path,
    ));
    let sink: Arc<dyn NotificationSink> = Arc::new(HttpBrokerSink::new(
        &config.broker.api_url,
        &config.broker.vhost,
        &config.broker.exchange,
        &config.broker.username,
        &config.broker.password,
    ));
    let resend = Arc::new(ResendClient::new(
        &config.origin.host,
        &config.origin.shared_secret,
    ));

    let coordinator = Arc::new(ImportCoordinator::new(
        db.clone(),
        storage.clone(),
        media,
        RetryingPublisher::new(Arc::clone(&sink)),
        resend.clone(),
        config.import.clone(),
        events.clone(),
    ));
    let retry = RetryPolicy::new(db.clone(), config.retry.clone(), resend.clone(), events.clone());
    let reactor = Arc::new(CompletionReactor::new(
        db.clone(),
        storage,
        retry,
        &config.import.shape_tag,
        events.clone(),
    ));

    let router = Arc::new(
        DispatchRouter::new(
            sink,
            config.broker.delivery_retry_limit,
            &config.broker.dead_letter_destination,
        )
        .route(
            SOURCE_MEDIA_ATOM,
            "*",
            FailurePolicy::RetryRepublish,
            Arc::new(AtomEventProcessor::new(coordinator)),
        )
        .route(
            SOURCE_PLUTO_CORE,
            "core.project.*",
            FailurePolicy::Requeue,
            Arc::new(ProjectProcessor::new(db.clone(), resend)),
        )
        .route(
            SOURCE_PLUTO_CORE,
            "core.commission.*",
            FailurePolicy::Requeue,
            Arc::new(CommissionProcessor::new(db.clone())),
        )
        .route(
            SOURCE_STORAGE_EVENTS,
            "storage.job.*.stop",
            FailurePolicy::RetryRepublish,
            Arc::new(JobNotificationProcessor::new(reactor)),
        ),
    );

    let sources = [SOURCE_MEDIA_ATOM, SOURCE_PLUTO_CORE, SOURCE_STORAGE_EVENTS]
        .into_iter()
        .map(|source| {
            Arc::new(PollingQueueSource::new(
                &config.broker.api_url,
                &config.broker.vhost,
                &config.broker.username,
                &config.broker.password,
                QueueBinding {
                    source: source.to_string(),
                    queue: format!("{}-atomhub", source),
                },
            )) as Arc<dyn DeliverySource>
        })
        .collect();

    Ok(App {
        db,
        events,
        router,
        sources,
    })
}
