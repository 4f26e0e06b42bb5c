//! Object-store download helper
//!
//! Media is downloaded to local durable storage before the import job is
//! started; the storage system ingests from a file:// URI. Filenames are
//! derived from the title (or the object key) with unsafe characters
//! collapsed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// A downloaded object plus its filesystem attributes
#[derive(Debug, Clone)]
pub struct DownloadedMedia {
    pub path: PathBuf,
    pub size: u64,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
    pub ctime: Option<i64>,
}

impl DownloadedMedia {
    pub fn file_uri(&self) -> String {
        format!("file://{}", self.path.display())
    }
}

#[derive(Debug, Error)]
pub enum MediaStoreError {
    #[error("Object store unreachable: {0}")]
    Network(String),

    #[error("Object {0} not available: status {1}")]
    Unavailable(String, u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for MediaStoreError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

/// Download capability for source media objects
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Download the object for `key`, naming the local file after
    /// `preferred_name` when given (the object key otherwise)
    async fn download(
        &self,
        key: &str,
        preferred_name: Option<&str>,
    ) -> Result<DownloadedMedia, MediaStoreError>;
}

/// Collapse anything outside `[A-Za-z0-9_.]` to an underscore, then
/// collapse runs of underscores
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_underscore = false;

    for c in name.chars() {
        let mapped = if c.is_ascii_alphanumeric() || c == '.' {
            c
        } else {
            '_'
        };
        if mapped == '_' {
            if !last_was_underscore {
                out.push('_');
            }
            last_was_underscore = true;
        } else {
            out.push(mapped);
            last_was_underscore = false;
        }
    }
    out
}

/// Build the local filename: sanitized preferred name, carrying over the
/// object key's extension when the preferred name has none
pub fn local_filename(key: &str, preferred_name: Option<&str>) -> String {
    let key_basename = key.rsplit('/').next().unwrap_or(key);
    let base = preferred_name.unwrap_or(key_basename);
    let mut name = sanitize_filename(base);

    if !name.contains('.') {
        if let Some((_, extension)) = key_basename.rsplit_once('.') {
            name.push('.');
            name.push_str(extension);
        }
    }
    name
}

fn stat_times(metadata: &std::fs::Metadata) -> (Option<i64>, Option<i64>, Option<i64>) {
    let to_secs = |t: std::io::Result<std::time::SystemTime>| {
        t.ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
    };
    (
        to_secs(metadata.accessed()),
        to_secs(metadata.modified()),
        to_secs(metadata.created()),
    )
}

/// Fetches objects over HTTP from the configured bucket endpoint
pub struct HttpMediaStore {
    client: reqwest::Client,
    endpoint: String,
    local_path: PathBuf,
}

impl HttpMediaStore {
    pub fn new(endpoint: &str, local_path: &Path) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            local_path: local_path.to_path_buf(),
        }
    }
}

#[async_trait]
impl MediaStore for HttpMediaStore {
    async fn download(
        &self,
        key: &str,
        preferred_name: Option<&str>,
    ) -> Result<DownloadedMedia, MediaStoreError> {
        let url = format!("{}/{}", self.endpoint, key);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(MediaStoreError::Unavailable(
                key.to_string(),
                response.status().as_u16(),
            ));
        }

        tokio::fs::create_dir_all(&self.local_path).await?;
        let target = self.local_path.join(local_filename(key, preferred_name));

        let mut file = tokio::fs::File::create(&target).await?;
        let mut response = response;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let metadata = std::fs::metadata(&target)?;
        let (atime, mtime, ctime) = stat_times(&metadata);

        info!("Downloaded {} to {}", key, target.display());

        Ok(DownloadedMedia {
            path: target,
            size: metadata.len(),
            atime,
            mtime,
            ctime,
        })
    }
}
