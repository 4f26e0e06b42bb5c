//! Import coordinator
//!
//! Drives one upload-stream message end to end: resolve or create the
//! storage item, pass the idempotency gate, fetch the media, start the
//! import job and announce it downstream. Auxiliary payloads and project
//! assignments are handled here too since they share the item-resolution
//! step.

use crate::db::{deferred, import_jobs, projects};
use crate::db::import_jobs::{ClaimOutcome, NewImport};
use crate::error::ProcessError;
use crate::messages::{AuxiliaryUpload, MediaUpload, ProjectAssigned};
use crate::services::media_store::{self, MediaStore};
use crate::services::publisher::RetryingPublisher;
use crate::services::resend::{ResendError, ResendRequester};
use crate::services::storage::{
    resolve_item, ImportSpec, ItemRef, ItemResolution, PlaceholderSpec, StorageError,
    StorageSystem,
};
use atomhub_common::config::ImportConfig;
use atomhub_common::events::{EventBus, HubEvent, SkipReason};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};

/// Retries of a missing-item assignment are abandoned after this many
/// deliveries; by then the upload announcement is clearly never coming.
const ASSIGNMENT_RESEND_LIMIT: u32 = 10;

const UNKNOWN_USER: &str = "unknown_user";

/// Ledger title when an upload for an existing item carries none
const UNKNOWN_TITLE: &str = "Unknown title";

/// Sentinel published when no commission is known for the project
const NO_COMMISSION: i64 = -1;

/// What a handled message amounted to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// An import job was started against the item
    Started { item_id: String, job_id: String },
    /// The idempotency gate refused the duplicate
    Skipped(SkipReason),
    /// The auxiliary payload was attached to an existing item
    Attached { item_id: String },
    /// No item yet; the auxiliary payload waits in the cache
    Deferred,
    /// The project assignment was applied to an existing item
    Linked { item_id: String },
    /// The origin no longer knows the atom and retries are exhausted
    Abandoned,
}

pub struct ImportCoordinator {
    db: SqlitePool,
    storage: Arc<dyn StorageSystem>,
    media: Arc<dyn MediaStore>,
    publisher: RetryingPublisher,
    resend: Arc<dyn ResendRequester>,
    import: ImportConfig,
    events: EventBus,
}

fn storage_failure(e: StorageError) -> ProcessError {
    ProcessError::transient(e.to_string())
}

impl ImportCoordinator {
    pub fn new(
        db: SqlitePool,
        storage: Arc<dyn StorageSystem>,
        media: Arc<dyn MediaStore>,
        publisher: RetryingPublisher,
        resend: Arc<dyn ResendRequester>,
        import: ImportConfig,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            storage,
            media,
            publisher,
            resend,
            import,
            events,
        }
    }

    /// Handle a video-upload (or resync) announcement
    pub async fn handle_media_upload(
        &self,
        upload: &MediaUpload,
        raw: &Value,
    ) -> Result<Outcome, ProcessError> {
        // a title is only mandatory when a placeholder has to be created
        let title = upload.title.as_deref().filter(|t| !t.is_empty());
        let user = match upload.user.as_deref().filter(|u| !u.is_empty()) {
            Some(user) => user,
            None => {
                warn!("Atom {} has no user, recording {}", upload.atom_id, UNKNOWN_USER);
                UNKNOWN_USER
            }
        };

        let item = self.find_or_create_item(upload, title, user).await?;
        info!("{}: mapped atom {} for import", item.id, upload.atom_id);

        let claim = import_jobs::claim_import(
            &self.db,
            &NewImport {
                item_id: item.id.clone(),
                atom_id: upload.atom_id.clone(),
                atom_title: title.unwrap_or(UNKNOWN_TITLE).to_string(),
                user_email: user.to_string(),
                source_path: upload.s3_key.clone(),
            },
        )
        .await?;

        let job = match claim {
            ClaimOutcome::Claimed(job) => job,
            ClaimOutcome::AlreadyCompleted => {
                info!(
                    "{}: media {} has already been imported, nothing to do",
                    item.id, upload.s3_key
                );
                self.emit_skip(&item.id, &upload.atom_id, SkipReason::AlreadyCompleted);
                return Ok(Outcome::Skipped(SkipReason::AlreadyCompleted));
            }
            ClaimOutcome::AlreadyProcessing => {
                info!(
                    "{}: an import for atom {} is still in progress, nothing to do",
                    item.id, upload.atom_id
                );
                self.emit_skip(&item.id, &upload.atom_id, SkipReason::AlreadyProcessing);
                return Ok(Outcome::Skipped(SkipReason::AlreadyProcessing));
            }
        };

        let downloaded = match self.media.download(&upload.s3_key, title).await {
            Ok(media) => media,
            Err(e) => {
                import_jobs::release_failed_start(&self.db, job.id).await?;
                return Err(ProcessError::transient(format!(
                    "Could not fetch media {}: {}",
                    upload.s3_key, e
                )));
            }
        };

        let spec = ImportSpec {
            uri: downloaded.file_uri(),
            shape_tag: self.import.shape_tag.clone(),
            priority: self.import.priority.clone(),
        };
        let job_id = match self.storage.start_import(&item, &spec).await {
            Ok(job_id) => job_id,
            Err(e) => {
                import_jobs::release_failed_start(&self.db, job.id).await?;
                return Err(storage_failure(e));
            }
        };

        import_jobs::assign_job(&self.db, job.id, &job_id, Some(downloaded.size as i64)).await?;
        info!("{}: started import job {}", item.id, job_id);

        let commission_id = self.commission_for(upload.project_id.as_deref()).await?;
        let mut payload = merged_payload(raw);
        if let Value::Object(ref mut map) = payload {
            map.insert("itemId".to_string(), json!(item.id));
            map.insert("jobId".to_string(), json!(job_id));
            map.insert("commissionId".to_string(), json!(commission_id));
            map.insert("size".to_string(), json!(downloaded.size));
            map.insert("atime".to_string(), json!(downloaded.atime));
            map.insert("mtime".to_string(), json!(downloaded.mtime));
            map.insert("ctime".to_string(), json!(downloaded.ctime));
        }
        self.publisher
            .publish(&format!("atomhub.atom.{}", upload.kind), &payload)
            .await;

        self.attach_pending_auxiliary(&item, &upload.atom_id).await;

        self.events.emit(HubEvent::ImportStarted {
            item_id: item.id.clone(),
            job_id: job_id.clone(),
            atom_id: upload.atom_id.clone(),
            retry_number: job.retry_number,
            timestamp: chrono::Utc::now(),
        });

        Ok(Outcome::Started {
            item_id: item.id,
            job_id,
        })
    }

    /// Handle an auxiliary payload. The payload location is cached first,
    /// so the attach survives arriving before the upload event.
    pub async fn handle_auxiliary_upload(
        &self,
        upload: &AuxiliaryUpload,
    ) -> Result<Outcome, ProcessError> {
        let location = upload.payload_location();
        let replaced = deferred::upsert(&self.db, &upload.atom_id, &location).await?;
        if replaced {
            info!(
                "Atom {}: replacing previously cached auxiliary payload",
                upload.atom_id
            );
        }

        let item = match resolve_item(self.storage.as_ref(), &upload.atom_id)
            .await
            .map_err(storage_failure)?
        {
            ItemResolution::Found(item) => item,
            ItemResolution::Ambiguous(mut candidates) => candidates.remove(0),
            ItemResolution::NotFound => {
                info!(
                    "Atom {}: no item yet, auxiliary payload deferred",
                    upload.atom_id
                );
                return Ok(Outcome::Deferred);
            }
        };

        if let Err(e) = self.storage.attach_auxiliary(&item.id, &location).await {
            deferred::record_error(&self.db, &upload.atom_id, &e.to_string()).await?;
            return Err(storage_failure(e));
        }
        deferred::mark_processed(&self.db, &upload.atom_id).await?;
        self.events.emit(HubEvent::DeferredAttached {
            atom_id: upload.atom_id.clone(),
            item_id: item.id.clone(),
            timestamp: chrono::Utc::now(),
        });
        Ok(Outcome::Attached { item_id: item.id })
    }

    /// Handle a project assignment. `attempt` is the delivery retry count
    /// reported by the transport for this message.
    pub async fn handle_project_assigned(
        &self,
        assigned: &ProjectAssigned,
        raw: &Value,
        attempt: u32,
    ) -> Result<Outcome, ProcessError> {
        let item = match resolve_item(self.storage.as_ref(), &assigned.atom_id)
            .await
            .map_err(storage_failure)?
        {
            ItemResolution::Found(item) => Some(item),
            ItemResolution::Ambiguous(mut candidates) => Some(candidates.remove(0)),
            ItemResolution::NotFound => None,
        };

        if let Some(item) = item {
            let mut payload = merged_payload(raw);
            if let Value::Object(ref mut map) = payload {
                map.insert("itemId".to_string(), json!(item.id));
            }
            self.publisher
                .publish(&format!("atomhub.atom.{}", assigned.kind), &payload)
                .await;
            info!("{}: applied project {} assignment", item.id, assigned.project_id);
            return Ok(Outcome::Linked { item_id: item.id });
        }

        // No item means the upload event never arrived (or predates us).
        // Ask the origin to replay it; the assignment is retried by
        // redelivery until the replayed upload has created the item.
        match self.resend.request_resend(&assigned.atom_id).await {
            Ok(()) => {
                info!("Atom {}: requested upload resend", assigned.atom_id);
                Err(ProcessError::transient(format!(
                    "Atom {} has no item yet, resend requested",
                    assigned.atom_id
                )))
            }
            Err(ResendError::NotFound) if attempt >= ASSIGNMENT_RESEND_LIMIT => {
                warn!(
                    "Atom {} unknown at origin after {} attempts, giving up",
                    assigned.atom_id, attempt
                );
                Ok(Outcome::Abandoned)
            }
            Err(ResendError::NotFound) => Err(ProcessError::transient(format!(
                "Atom {} unknown at origin, attempt {}",
                assigned.atom_id, attempt
            ))),
            Err(e) => Err(ProcessError::transient(format!(
                "Resend request for atom {} failed: {}",
                assigned.atom_id, e
            ))),
        }
    }

    async fn find_or_create_item(
        &self,
        upload: &MediaUpload,
        title: Option<&str>,
        user: &str,
    ) -> Result<ItemRef, ProcessError> {
        match resolve_item(self.storage.as_ref(), &upload.atom_id)
            .await
            .map_err(storage_failure)?
        {
            ItemResolution::Found(item) => Ok(item),
            ItemResolution::Ambiguous(mut candidates) => Ok(candidates.remove(0)),
            ItemResolution::NotFound => {
                let title = title.ok_or_else(|| {
                    ProcessError::business(format!("Atom {} has no title", upload.atom_id))
                })?;
                let spec = PlaceholderSpec {
                    atom_id: upload.atom_id.clone(),
                    title: title.to_string(),
                    filename: media_store::local_filename(&upload.s3_key, Some(title)),
                    project_id: upload.project_id.clone(),
                    user: user.to_string(),
                };
                let item = self
                    .storage
                    .create_placeholder(&spec)
                    .await
                    .map_err(storage_failure)?;
                info!("{}: created placeholder for atom {}", item.id, upload.atom_id);
                Ok(item)
            }
        }
    }

    /// Attach a cached auxiliary payload, if one is waiting. Failures are
    /// recorded against the cache entry but never fail the import.
    async fn attach_pending_auxiliary(&self, item: &ItemRef, atom_id: &str) {
        let pending = match deferred::find_unprocessed(&self.db, atom_id).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Atom {}: deferred-cache lookup failed: {}", atom_id, e);
                return;
            }
        };
        let Some(payload) = pending else { return };

        match self
            .storage
            .attach_auxiliary(&item.id, &payload.payload_location)
            .await
        {
            Ok(()) => {
                if let Err(e) = deferred::mark_processed(&self.db, atom_id).await {
                    warn!("Atom {}: could not mark payload processed: {}", atom_id, e);
                }
                self.events.emit(HubEvent::DeferredAttached {
                    atom_id: atom_id.to_string(),
                    item_id: item.id.clone(),
                    timestamp: chrono::Utc::now(),
                });
            }
            Err(e) => {
                warn!("Atom {}: could not attach cached payload: {}", atom_id, e);
                if let Err(db_err) =
                    deferred::record_error(&self.db, atom_id, &e.to_string()).await
                {
                    warn!("Atom {}: could not record attach error: {}", atom_id, db_err);
                }
            }
        }
    }

    async fn commission_for(&self, project_id: Option<&str>) -> Result<i64, ProcessError> {
        let Some(raw) = project_id else {
            return Ok(NO_COMMISSION);
        };
        let Ok(project_id) = raw.parse::<i64>() else {
            warn!("Unparseable project id {:?}, omitting commission", raw);
            return Ok(NO_COMMISSION);
        };
        Ok(projects::commission_for_project(&self.db, project_id)
            .await?
            .unwrap_or(NO_COMMISSION))
    }

    fn emit_skip(&self, item_id: &str, atom_id: &str, reason: SkipReason) {
        self.events.emit(HubEvent::ImportSkipped {
            item_id: item_id.to_string(),
            atom_id: atom_id.to_string(),
            reason,
            timestamp: chrono::Utc::now(),
        });
    }
}

/// Start from the raw inbound payload so downstream consumers see every
/// field the origin sent, then overlay our own.
fn merged_payload(raw: &Value) -> Value {
    match raw {
        Value::Object(_) => raw.clone(),
        _ => json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::media_store::{DownloadedMedia, MediaStoreError};
    use crate::services::publisher::test_support::RecordingSink;
    use crate::services::resend::test_support::RecordingResend;
    use crate::services::storage::ProxyCheck;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// In-memory storage system for coordinator tests
    #[derive(Default)]
    struct FakeStorage {
        items: Mutex<Vec<String>>,
        imports: Mutex<Vec<(String, String)>>,
        attached: Mutex<Vec<(String, String)>>,
        fail_attach: Mutex<bool>,
    }

    impl FakeStorage {
        fn with_item(id: &str) -> Self {
            let storage = Self::default();
            storage.items.lock().unwrap().push(id.to_string());
            storage
        }
    }

    #[async_trait]
    impl StorageSystem for FakeStorage {
        async fn lookup_by_external_id(
            &self,
            _atom_id: &str,
        ) -> Result<Option<ItemRef>, StorageError> {
            Ok(self
                .items
                .lock()
                .unwrap()
                .first()
                .map(|id| ItemRef { id: id.clone() }))
        }

        async fn search_by_deliverable(
            &self,
            _atom_id: &str,
        ) -> Result<Vec<ItemRef>, StorageError> {
            Ok(vec![])
        }

        async fn create_placeholder(
            &self,
            spec: &PlaceholderSpec,
        ) -> Result<ItemRef, StorageError> {
            let id = format!("VX-{}", spec.atom_id);
            self.items.lock().unwrap().push(id.clone());
            Ok(ItemRef { id })
        }

        async fn start_import(
            &self,
            item: &ItemRef,
            spec: &ImportSpec,
        ) -> Result<String, StorageError> {
            let job_id = format!("JOB-{}", self.imports.lock().unwrap().len() + 1);
            self.imports
                .lock()
                .unwrap()
                .push((item.id.clone(), spec.uri.clone()));
            Ok(job_id)
        }

        async fn check_proxy(&self, _item_id: &str) -> Result<ProxyCheck, StorageError> {
            unimplemented!()
        }

        async fn delete_proxy(&self, _item_id: &str, _shape_id: &str) -> Result<(), StorageError> {
            unimplemented!()
        }

        async fn request_transcode(
            &self,
            _item_id: &str,
            _shape_tag: &str,
        ) -> Result<(), StorageError> {
            unimplemented!()
        }

        async fn attach_auxiliary(
            &self,
            item_id: &str,
            payload_location: &str,
        ) -> Result<(), StorageError> {
            if *self.fail_attach.lock().unwrap() {
                return Err(StorageError::Network("attach refused".to_string()));
            }
            self.attached
                .lock()
                .unwrap()
                .push((item_id.to_string(), payload_location.to_string()));
            Ok(())
        }
    }

    struct FakeMediaStore;

    #[async_trait]
    impl MediaStore for FakeMediaStore {
        async fn download(
            &self,
            key: &str,
            _preferred_name: Option<&str>,
        ) -> Result<DownloadedMedia, MediaStoreError> {
            Ok(DownloadedMedia {
                path: PathBuf::from(format!("/media/{}", key)),
                size: 2048,
                atime: Some(1_700_000_000),
                mtime: Some(1_700_000_100),
                ctime: None,
            })
        }
    }

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        atomhub_common::db::init::create_schema(&pool).await.unwrap();
        pool
    }

    struct Harness {
        coordinator: ImportCoordinator,
        storage: Arc<FakeStorage>,
        sink: Arc<RecordingSink>,
        resend: Arc<RecordingResend>,
        pool: SqlitePool,
    }

    async fn harness(storage: FakeStorage) -> Harness {
        let pool = test_pool().await;
        let storage = Arc::new(storage);
        let sink = RecordingSink::new();
        let resend = RecordingResend::new();
        let coordinator = ImportCoordinator::new(
            pool.clone(),
            storage.clone(),
            Arc::new(FakeMediaStore),
            RetryingPublisher::new(sink.clone()),
            resend.clone(),
            ImportConfig::default(),
            EventBus::new(16),
        );
        Harness {
            coordinator,
            storage,
            sink,
            resend,
            pool,
        }
    }

    fn upload(atom_id: &str) -> (MediaUpload, Value) {
        let raw = json!({
            "type": "video-upload",
            "atomId": atom_id,
            "s3Key": format!("uploads/{}/master.mp4", atom_id),
            "title": "Launch film",
            "user": "fred@example.com",
            "projectId": "42"
        });
        let parsed = serde_json::from_value(raw.clone()).unwrap();
        (parsed, raw)
    }

    #[tokio::test]
    async fn test_first_upload_creates_item_and_starts_import() {
        let h = harness(FakeStorage::default()).await;
        let (msg, raw) = upload("atom-1");

        let outcome = h.coordinator.handle_media_upload(&msg, &raw).await.unwrap();

        match outcome {
            Outcome::Started { item_id, job_id } => {
                assert_eq!(item_id, "VX-atom-1");
                assert_eq!(job_id, "JOB-1");
            }
            other => panic!("expected Started, got {:?}", other),
        }
        assert_eq!(h.storage.imports.lock().unwrap().len(), 1);

        let published = h.sink.take();
        assert_eq!(published.len(), 1);
        let (key, payload) = &published[0];
        assert_eq!(key, "atomhub.atom.video-upload");
        assert_eq!(payload["itemId"], "VX-atom-1");
        assert_eq!(payload["jobId"], "JOB-1");
        assert_eq!(payload["commissionId"], -1);
        assert_eq!(payload["size"], 2048);
        // raw fields survive the merge
        assert_eq!(payload["atomId"], "atom-1");
    }

    #[tokio::test]
    async fn test_duplicate_while_processing_is_skipped() {
        let h = harness(FakeStorage::default()).await;
        let (msg, raw) = upload("atom-1");

        h.coordinator.handle_media_upload(&msg, &raw).await.unwrap();
        let second = h.coordinator.handle_media_upload(&msg, &raw).await.unwrap();

        assert_eq!(second, Outcome::Skipped(SkipReason::AlreadyProcessing));
        assert_eq!(h.storage.imports.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_finished_same_media_is_skipped() {
        let h = harness(FakeStorage::default()).await;
        let (msg, raw) = upload("atom-1");

        h.coordinator.handle_media_upload(&msg, &raw).await.unwrap();
        let job = import_jobs::find_by_job_id(&h.pool, "JOB-1").await.unwrap().unwrap();
        import_jobs::complete(&h.pool, job.id, import_jobs::JobStatus::Finished)
            .await
            .unwrap();

        let replay = h.coordinator.handle_media_upload(&msg, &raw).await.unwrap();
        assert_eq!(replay, Outcome::Skipped(SkipReason::AlreadyCompleted));
    }

    #[tokio::test]
    async fn test_finished_different_media_imports_again() {
        let h = harness(FakeStorage::default()).await;
        let (msg, raw) = upload("atom-1");

        h.coordinator.handle_media_upload(&msg, &raw).await.unwrap();
        let job = import_jobs::find_by_job_id(&h.pool, "JOB-1").await.unwrap().unwrap();
        import_jobs::complete(&h.pool, job.id, import_jobs::JobStatus::Finished)
            .await
            .unwrap();

        let raw2 = json!({
            "type": "video-upload",
            "atomId": "atom-1",
            "s3Key": "uploads/atom-1/master-v2.mp4",
            "title": "Launch film (recut)",
            "user": "fred@example.com"
        });
        let msg2 = serde_json::from_value(raw2.clone()).unwrap();

        match h.coordinator.handle_media_upload(&msg2, &raw2).await.unwrap() {
            Outcome::Started { job_id, .. } => assert_eq!(job_id, "JOB-2"),
            other => panic!("expected Started, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_placeholder_creation_requires_title() {
        let h = harness(FakeStorage::default()).await;
        let raw = json!({
            "type": "video-upload",
            "atomId": "atom-1",
            "s3Key": "uploads/atom-1/master.mp4"
        });
        let msg = serde_json::from_value(raw.clone()).unwrap();

        let err = h.coordinator.handle_media_upload(&msg, &raw).await.unwrap_err();
        assert!(matches!(err, ProcessError::Business(_)));
        assert!(h.storage.imports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_existing_item_imports_without_title() {
        let h = harness(FakeStorage::with_item("VX-9")).await;
        let raw = json!({
            "type": "video-upload",
            "atomId": "atom-9",
            "s3Key": "uploads/atom-9/master.mp4",
            "user": "fred@example.com"
        });
        let msg = serde_json::from_value(raw.clone()).unwrap();

        match h.coordinator.handle_media_upload(&msg, &raw).await.unwrap() {
            Outcome::Started { item_id, .. } => assert_eq!(item_id, "VX-9"),
            other => panic!("expected Started, got {:?}", other),
        }

        // ledger carries the fallback title
        let title: String = sqlx::query_scalar("SELECT atom_title FROM import_jobs")
            .fetch_one(&h.pool)
            .await
            .unwrap();
        assert_eq!(title, "Unknown title");
    }

    #[tokio::test]
    async fn test_known_commission_is_published() {
        let h = harness(FakeStorage::default()).await;
        projects::upsert_commission(&h.pool, 7, "Docs 2026").await.unwrap();
        assert!(projects::link_project(&h.pool, 42, 7).await.unwrap());

        let (msg, raw) = upload("atom-1");
        h.coordinator.handle_media_upload(&msg, &raw).await.unwrap();

        let published = h.sink.take();
        assert_eq!(published[0].1["commissionId"], 7);
    }

    #[tokio::test]
    async fn test_auxiliary_before_upload_is_deferred_then_attached() {
        let h = harness(FakeStorage::default()).await;
        let aux = AuxiliaryUpload {
            kind: "pac-file-upload".to_string(),
            atom_id: "atom-1".to_string(),
            s3_bucket: "aux-bucket".to_string(),
            s3_path: "forms/atom-1.xml".to_string(),
        };

        let first = h.coordinator.handle_auxiliary_upload(&aux).await.unwrap();
        assert_eq!(first, Outcome::Deferred);

        let (msg, raw) = upload("atom-1");
        h.coordinator.handle_media_upload(&msg, &raw).await.unwrap();

        let attached = h.storage.attached.lock().unwrap();
        assert_eq!(
            attached.as_slice(),
            &[(
                "VX-atom-1".to_string(),
                "s3://aux-bucket/forms/atom-1.xml".to_string()
            )]
        );
        drop(attached);

        assert!(deferred::find_unprocessed(&h.pool, "atom-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_auxiliary_with_existing_item_attaches_now() {
        let h = harness(FakeStorage::with_item("VX-9")).await;
        let aux = AuxiliaryUpload {
            kind: "pac-file-upload".to_string(),
            atom_id: "atom-9".to_string(),
            s3_bucket: "aux-bucket".to_string(),
            s3_path: "forms/atom-9.xml".to_string(),
        };

        let outcome = h.coordinator.handle_auxiliary_upload(&aux).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Attached {
                item_id: "VX-9".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_failed_attach_keeps_payload_cached() {
        let h = harness(FakeStorage::with_item("VX-9")).await;
        *h.storage.fail_attach.lock().unwrap() = true;
        let aux = AuxiliaryUpload {
            kind: "pac-file-upload".to_string(),
            atom_id: "atom-9".to_string(),
            s3_bucket: "aux-bucket".to_string(),
            s3_path: "forms/atom-9.xml".to_string(),
        };

        let err = h.coordinator.handle_auxiliary_upload(&aux).await.unwrap_err();
        assert!(err.is_retryable());

        let pending = deferred::find_unprocessed(&h.pool, "atom-9").await.unwrap().unwrap();
        assert!(pending.last_error.contains("attach refused"));
    }

    fn assignment(atom_id: &str) -> (ProjectAssigned, Value) {
        let raw = json!({
            "type": "project-assigned",
            "atomId": atom_id,
            "projectId": "42",
            "commissionId": "7"
        });
        let parsed = serde_json::from_value(raw.clone()).unwrap();
        (parsed, raw)
    }

    #[tokio::test]
    async fn test_assignment_with_item_publishes_linkage() {
        let h = harness(FakeStorage::with_item("VX-9")).await;
        let (msg, raw) = assignment("atom-9");

        let outcome = h
            .coordinator
            .handle_project_assigned(&msg, &raw, 0)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Linked {
                item_id: "VX-9".to_string()
            }
        );

        let published = h.sink.take();
        assert_eq!(published[0].0, "atomhub.atom.project-assigned");
        assert_eq!(published[0].1["itemId"], "VX-9");
        assert_eq!(h.resend.count(), 0);
    }

    #[tokio::test]
    async fn test_assignment_without_item_requests_resend() {
        let h = harness(FakeStorage::default()).await;
        let (msg, raw) = assignment("atom-9");

        let err = h
            .coordinator
            .handle_project_assigned(&msg, &raw, 0)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.resend.count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_atom_is_abandoned_after_limit() {
        let pool = test_pool().await;
        let coordinator = ImportCoordinator::new(
            pool,
            Arc::new(FakeStorage::default()),
            Arc::new(FakeMediaStore),
            RetryingPublisher::new(RecordingSink::new()),
            RecordingResend::not_found(),
            ImportConfig::default(),
            EventBus::new(16),
        );
        let (msg, raw) = assignment("atom-9");

        let early = coordinator.handle_project_assigned(&msg, &raw, 3).await;
        assert!(early.is_err());

        let outcome = coordinator
            .handle_project_assigned(&msg, &raw, 10)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Abandoned);
    }
}
