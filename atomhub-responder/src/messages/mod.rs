//! Inbound message shapes and structural validation
//!
//! Every message kind has a fixed required-field set enforced here by
//! serde before anything reaches business logic. Validation is structural
//! only; referenced commissions, projects or items are not checked.

mod domain;
mod notification;

pub use domain::{CommissionRecord, ProjectRecord, RouteIntent};
pub use notification::JobNotification;

use crate::error::SchemaError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message kinds carried on the upload stream. These values must stay in
/// sync with the origin system's integration contract.
pub const TYPE_VIDEO_UPLOAD: &str = "video-upload";
pub const TYPE_VIDEO_UPLOAD_RESYNC: &str = "video-upload-resync";
pub const TYPE_AUXILIARY_UPLOAD: &str = "pac-file-upload";
pub const TYPE_PROJECT_ASSIGNED: &str = "project-assigned";

/// A new (or resynced) media upload descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaUpload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "atomId")]
    pub atom_id: String,
    #[serde(rename = "s3Key")]
    pub s3_key: String,
    pub title: Option<String>,
    pub user: Option<String>,
    #[serde(rename = "projectId")]
    pub project_id: Option<String>,
    #[serde(rename = "posterImageUrl")]
    pub poster_image_url: Option<String>,
}

/// Auxiliary (linking document) upload that attaches to an item later
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuxiliaryUpload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "atomId")]
    pub atom_id: String,
    #[serde(rename = "s3Bucket")]
    pub s3_bucket: String,
    #[serde(rename = "s3Path")]
    pub s3_path: String,
}

impl AuxiliaryUpload {
    /// Opaque location reference for the deferred-data cache
    pub fn payload_location(&self) -> String {
        format!("s3://{}/{}", self.s3_bucket, self.s3_path)
    }
}

/// Project (re-)assignment notice for an atom
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectAssigned {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "atomId")]
    pub atom_id: String,
    #[serde(rename = "projectId")]
    pub project_id: String,
    #[serde(rename = "commissionId")]
    pub commission_id: Option<String>,
    pub title: Option<String>,
    pub user: Option<String>,
}

/// A validated message from the upload stream
#[derive(Debug, Clone)]
pub enum AtomMessage {
    VideoUpload(MediaUpload),
    VideoUploadResync(MediaUpload),
    AuxiliaryUpload(AuxiliaryUpload),
    ProjectAssigned(ProjectAssigned),
}

impl AtomMessage {
    /// Validate a decoded payload against the shape its declared kind
    /// requires. Unknown kinds and missing required fields both fail.
    pub fn parse(raw: &Value) -> Result<Self, SchemaError> {
        let kind = raw
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SchemaError::Invalid("missing \"type\" field".to_string()))?;

        match kind {
            TYPE_VIDEO_UPLOAD => {
                let msg: MediaUpload = deserialize_shape(raw)?;
                Ok(Self::VideoUpload(msg))
            }
            TYPE_VIDEO_UPLOAD_RESYNC => {
                let msg: MediaUpload = deserialize_shape(raw)?;
                Ok(Self::VideoUploadResync(msg))
            }
            TYPE_AUXILIARY_UPLOAD => {
                let msg: AuxiliaryUpload = deserialize_shape(raw)?;
                Ok(Self::AuxiliaryUpload(msg))
            }
            TYPE_PROJECT_ASSIGNED => {
                let msg: ProjectAssigned = deserialize_shape(raw)?;
                Ok(Self::ProjectAssigned(msg))
            }
            other => Err(SchemaError::UnrecognizedKind(other.to_string())),
        }
    }

    pub fn atom_id(&self) -> &str {
        match self {
            Self::VideoUpload(m) | Self::VideoUploadResync(m) => &m.atom_id,
            Self::AuxiliaryUpload(m) => &m.atom_id,
            Self::ProjectAssigned(m) => &m.atom_id,
        }
    }
}

fn deserialize_shape<T: serde::de::DeserializeOwned>(raw: &Value) -> Result<T, SchemaError> {
    serde_json::from_value(raw.clone()).map_err(|e| SchemaError::Invalid(e.to_string()))
}
