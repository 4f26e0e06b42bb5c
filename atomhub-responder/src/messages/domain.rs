//! Project and commission domain event shapes (topic broker)

use crate::error::SchemaError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Full project record as sent by the project-management system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: i64,
    #[serde(rename = "projectTypeId")]
    pub project_type_id: i64,
    pub title: String,
    pub created: String,
    pub user: String,
    #[serde(rename = "workingGroupId")]
    pub working_group_id: i64,
    #[serde(rename = "commissionId")]
    pub commission_id: i64,
    pub deletable: bool,
    pub sensitive: bool,
    pub status: String,
    #[serde(rename = "productionOffice")]
    pub production_office: String,
}

impl ProjectRecord {
    pub fn parse(raw: &Value) -> Result<Self, SchemaError> {
        serde_json::from_value(raw.clone()).map_err(|e| SchemaError::Invalid(e.to_string()))
    }
}

/// Commission record; only the fields the hub caches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionRecord {
    pub id: i64,
    pub title: String,
}

impl CommissionRecord {
    pub fn parse(raw: &Value) -> Result<Self, SchemaError> {
        serde_json::from_value(raw.clone()).map_err(|e| SchemaError::Invalid(e.to_string()))
    }
}

/// Intent carried by a domain event's routing key suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteIntent {
    Create,
    Update,
    Delete,
}

impl RouteIntent {
    /// Read the intent from the final routing-key segment.
    /// Suffixes other than create/update/delete are rejected.
    pub fn from_routing_key(routing_key: &str) -> Result<Self, SchemaError> {
        match routing_key.rsplit('.').next() {
            Some("create") => Ok(Self::Create),
            Some("update") => Ok(Self::Update),
            Some("delete") => Ok(Self::Delete),
            _ => Err(SchemaError::Invalid(format!(
                "unsupported routing key: {}",
                routing_key
            ))),
        }
    }
}
