//! Job-completion notification normalization
//!
//! The processing feed delivers a vendor key/value list shape:
//! `{"field": [{"key": "...", "value": "..."}, ...]}`. This is walked once
//! into a fixed-key map so absent keys resolve to an explicit `None`
//! instead of a dynamic fallback.

use crate::error::SchemaError;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
struct KvPair {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct KvDocument {
    field: Vec<KvPair>,
}

/// Normalized job notification
#[derive(Debug, Clone)]
pub struct JobNotification {
    fields: HashMap<String, String>,
    job_id: String,
    status: String,
}

impl JobNotification {
    /// Normalize a decoded key/value document. `jobId` and `status` are
    /// required logical fields; everything else is free-form.
    pub fn parse(raw: &Value) -> Result<Self, SchemaError> {
        let doc: KvDocument =
            serde_json::from_value(raw.clone()).map_err(|e| SchemaError::Invalid(e.to_string()))?;

        let mut fields = HashMap::with_capacity(doc.field.len());
        for pair in doc.field {
            fields.insert(pair.key, pair.value);
        }

        let job_id = fields
            .get("jobId")
            .cloned()
            .ok_or_else(|| SchemaError::Invalid("notification has no jobId field".to_string()))?;
        let status = fields
            .get("status")
            .cloned()
            .ok_or_else(|| SchemaError::Invalid("notification has no status field".to_string()))?;

        Ok(Self {
            fields,
            job_id,
            status,
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    /// Whether the terminal status denotes failure
    pub fn is_failed(&self) -> bool {
        matches!(self.status.as_str(), "FAILED" | "FAILED_TOTAL" | "ABORTED")
    }

    /// Any other normalized field by name
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Parse the `filePathMap` field (comma-separated `id=path` pairs)
    /// into a mapping. Pairs lacking an `=` are silently dropped.
    pub fn file_paths(&self) -> Option<HashMap<String, String>> {
        let raw = self.fields.get("filePathMap")?;

        let mut map = HashMap::new();
        for pair in raw.split(',') {
            if let Some((id, path)) = pair.split_once('=') {
                if !id.is_empty() {
                    map.insert(id.to_string(), path.to_string());
                }
            }
        }
        Some(map)
    }
}
