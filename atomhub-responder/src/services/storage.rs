//! Storage-system adapter
//!
//! A narrow interface over the asset-management system: exactly the
//! operations the import coordinator and completion reactor need, no
//! more. The expected "no item yet" case is a value (`ItemResolution`),
//! not an error; errors are reserved for the system being unreachable or
//! answering nonsense.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

/// Reference to a storage-system item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRef {
    pub id: String,
}

/// Result of resolving an atom id to an item
#[derive(Debug, Clone)]
pub enum ItemResolution {
    Found(ItemRef),
    NotFound,
    /// More than one candidate matched the metadata search
    Ambiguous(Vec<ItemRef>),
}

/// Fields needed to create a placeholder item
#[derive(Debug, Clone)]
pub struct PlaceholderSpec {
    pub atom_id: String,
    pub title: String,
    pub filename: String,
    pub project_id: Option<String>,
    pub user: String,
}

/// Parameters for starting an import job against an item
#[derive(Debug, Clone)]
pub struct ImportSpec {
    /// file:// URI of the downloaded media
    pub uri: String,
    pub shape_tag: String,
    pub priority: String,
}

/// Outcome of the proxy integrity check
#[derive(Debug, Clone)]
pub struct ProxyCheck {
    pub needs_regen: bool,
    /// Shape id of a corrupt proxy that should be deleted first, if any
    pub shape_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage system unreachable: {0}")]
    Network(String),

    #[error("Storage system returned {status}: {detail}")]
    Api { status: u16, detail: String },

    #[error("Unexpected storage response: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// The operations the hub needs from the storage system
#[async_trait]
pub trait StorageSystem: Send + Sync {
    /// Direct lookup by the external correlation id set at placeholder
    /// creation time
    async fn lookup_by_external_id(&self, atom_id: &str)
        -> Result<Option<ItemRef>, StorageError>;

    /// Fallback metadata search treating the atom id as a deliverable id,
    /// in collection order
    async fn search_by_deliverable(&self, atom_id: &str) -> Result<Vec<ItemRef>, StorageError>;

    /// Create a placeholder item tagged with the atom id as external id
    async fn create_placeholder(&self, spec: &PlaceholderSpec) -> Result<ItemRef, StorageError>;

    /// Start an import job; returns the external job id
    async fn start_import(&self, item: &ItemRef, spec: &ImportSpec) -> Result<String, StorageError>;

    /// Inspect the low-resolution proxy produced for an item
    async fn check_proxy(&self, item_id: &str) -> Result<ProxyCheck, StorageError>;

    /// Delete a corrupt proxy shape
    async fn delete_proxy(&self, item_id: &str, shape_id: &str) -> Result<(), StorageError>;

    /// Ask for the proxy to be (re-)generated
    async fn request_transcode(&self, item_id: &str, shape_tag: &str) -> Result<(), StorageError>;

    /// Attach an auxiliary payload (by location reference) to an item
    async fn attach_auxiliary(
        &self,
        item_id: &str,
        payload_location: &str,
    ) -> Result<(), StorageError>;
}

/// Resolve an atom id to an item: direct external-id lookup first, then
/// the metadata search. An ambiguous search is tolerated; the caller
/// picks the first candidate.
pub async fn resolve_item(
    storage: &dyn StorageSystem,
    atom_id: &str,
) -> Result<ItemResolution, StorageError> {
    if let Some(item) = storage.lookup_by_external_id(atom_id).await? {
        return Ok(ItemResolution::Found(item));
    }

    let mut candidates = storage.search_by_deliverable(atom_id).await?;
    if candidates.len() > 1 {
        warn!(
            "Multiple items returned for atom {}: {} candidates. Using the first.",
            atom_id,
            candidates.len()
        );
        return Ok(ItemResolution::Ambiguous(candidates));
    }
    match candidates.pop() {
        Some(item) => Ok(ItemResolution::Found(item)),
        None => Ok(ItemResolution::NotFound),
    }
}

#[derive(Debug, Deserialize)]
struct ItemResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    items: Vec<ItemResponse>,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    #[serde(rename = "jobId")]
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct ShapeResponse {
    #[serde(rename = "shapeId")]
    shape_id: Option<String>,
    healthy: bool,
}

/// Concrete adapter speaking the storage system's REST API
pub struct HttpStorageSystem {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpStorageSystem {
    pub fn new(base_url: &str, username: &str, password: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, StorageError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        Err(StorageError::Api {
            status: status.as_u16(),
            detail,
        })
    }
}

#[async_trait]
impl StorageSystem for HttpStorageSystem {
    async fn lookup_by_external_id(
        &self,
        atom_id: &str,
    ) -> Result<Option<ItemRef>, StorageError> {
        let response = self
            .client
            .get(self.url(&format!("/api/item/by-external-id/{}", atom_id)))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let item: ItemResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| StorageError::Parse(e.to_string()))?;
        Ok(Some(ItemRef { id: item.id }))
    }

    async fn search_by_deliverable(&self, atom_id: &str) -> Result<Vec<ItemRef>, StorageError> {
        let response = self
            .client
            .get(self.url("/api/item/search"))
            .query(&[("deliverableId", atom_id), ("category", "Deliverable")])
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        let result: SearchResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| StorageError::Parse(e.to_string()))?;
        Ok(result.items.into_iter().map(|i| ItemRef { id: i.id }).collect())
    }

    async fn create_placeholder(&self, spec: &PlaceholderSpec) -> Result<ItemRef, StorageError> {
        let body = json!({
            "title": spec.title,
            "externalId": spec.atom_id,
            "originalFilename": spec.filename,
            "owner": spec.user,
            "containingProjects": spec.project_id.as_deref().map(|p| vec![p]).unwrap_or_default(),
            "category": "Deliverable",
        });

        let response = self
            .client
            .post(self.url("/api/item/placeholder"))
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;

        let item: ItemResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| StorageError::Parse(e.to_string()))?;
        Ok(ItemRef { id: item.id })
    }

    async fn start_import(
        &self,
        item: &ItemRef,
        spec: &ImportSpec,
    ) -> Result<String, StorageError> {
        let body = json!({
            "uri": spec.uri,
            "shapeTag": spec.shape_tag,
            "priority": spec.priority,
            "jobMetadata": {"source": "media_atom"},
        });

        let response = self
            .client
            .post(self.url(&format!("/api/item/{}/import", item.id)))
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;

        let job: JobResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| StorageError::Parse(e.to_string()))?;
        Ok(job.job_id)
    }

    async fn check_proxy(&self, item_id: &str) -> Result<ProxyCheck, StorageError> {
        let response = self
            .client
            .get(self.url(&format!("/api/item/{}/proxy", item_id)))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // no proxy at all: needs generating, nothing to delete
            return Ok(ProxyCheck {
                needs_regen: true,
                shape_id: None,
            });
        }

        let shape: ShapeResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| StorageError::Parse(e.to_string()))?;
        Ok(ProxyCheck {
            needs_regen: !shape.healthy,
            shape_id: shape.shape_id,
        })
    }

    async fn delete_proxy(&self, item_id: &str, shape_id: &str) -> Result<(), StorageError> {
        let response = self
            .client
            .delete(self.url(&format!("/api/item/{}/shape/{}", item_id, shape_id)))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn request_transcode(&self, item_id: &str, shape_tag: &str) -> Result<(), StorageError> {
        let response = self
            .client
            .post(self.url(&format!("/api/item/{}/transcode", item_id)))
            .query(&[("shapeTag", shape_tag)])
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn attach_auxiliary(
        &self,
        item_id: &str,
        payload_location: &str,
    ) -> Result<(), StorageError> {
        let response = self
            .client
            .post(self.url(&format!("/api/item/{}/auxiliary", item_id)))
            .basic_auth(&self.username, Some(&self.password))
            .json(&json!({"location": payload_location}))
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Test double with scripted resolution answers
    struct ScriptedStorage {
        direct: Option<ItemRef>,
        search: Vec<ItemRef>,
        searches: Mutex<u32>,
    }

    #[async_trait]
    impl StorageSystem for ScriptedStorage {
        async fn lookup_by_external_id(
            &self,
            _atom_id: &str,
        ) -> Result<Option<ItemRef>, StorageError> {
            Ok(self.direct.clone())
        }

        async fn search_by_deliverable(
            &self,
            _atom_id: &str,
        ) -> Result<Vec<ItemRef>, StorageError> {
            *self.searches.lock().unwrap() += 1;
            Ok(self.search.clone())
        }

        async fn create_placeholder(
            &self,
            _spec: &PlaceholderSpec,
        ) -> Result<ItemRef, StorageError> {
            unimplemented!()
        }

        async fn start_import(
            &self,
            _item: &ItemRef,
            _spec: &ImportSpec,
        ) -> Result<String, StorageError> {
            unimplemented!()
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
            _item_id: &str,
            _payload_location: &str,
        ) -> Result<(), StorageError> {
            unimplemented!()
        }
    }

    fn item(id: &str) -> ItemRef {
        ItemRef { id: id.to_string() }
    }

    #[tokio::test]
    async fn test_direct_hit_skips_search() {
        let storage = ScriptedStorage {
            direct: Some(item("VX-1")),
            search: vec![],
            searches: Mutex::new(0),
        };

        match resolve_item(&storage, "atom-1").await.unwrap() {
            ItemResolution::Found(i) => assert_eq!(i.id, "VX-1"),
            other => panic!("expected Found, got {:?}", other),
        }
        assert_eq!(*storage.searches.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_miss_falls_back_to_search() {
        let storage = ScriptedStorage {
            direct: None,
            search: vec![item("VX-2")],
            searches: Mutex::new(0),
        };

        match resolve_item(&storage, "atom-1").await.unwrap() {
            ItemResolution::Found(i) => assert_eq!(i.id, "VX-2"),
            other => panic!("expected Found, got {:?}", other),
        }
        assert_eq!(*storage.searches.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_search_is_not_found() {
        let storage = ScriptedStorage {
            direct: None,
            search: vec![],
            searches: Mutex::new(0),
        };

        assert!(matches!(
            resolve_item(&storage, "atom-1").await.unwrap(),
            ItemResolution::NotFound
        ));
    }

    #[tokio::test]
    async fn test_multiple_candidates_are_ambiguous_in_order() {
        let storage = ScriptedStorage {
            direct: None,
            search: vec![item("VX-3"), item("VX-4")],
            searches: Mutex::new(0),
        };

        match resolve_item(&storage, "atom-1").await.unwrap() {
            ItemResolution::Ambiguous(candidates) => {
                assert_eq!(candidates[0].id, "VX-3");
                assert_eq!(candidates.len(), 2);
            }
            other => panic!("expected Ambiguous, got {:?}", other),
        }
    }
}
