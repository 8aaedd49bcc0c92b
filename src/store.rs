//! Object storage backends for code packages and detached signatures.

use crate::{EngineError, Result};
use async_trait::async_trait;
use log::{debug, trace};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::fs;

pub(crate) const USER_AGENT_VALUE: &str =
    concat!("function-integrity/", env!("CARGO_PKG_VERSION"));

/// Read-only access to a keyed blob store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Get the store type name for logging
    fn store_type(&self) -> &'static str;
}

/// Map a non-success HTTP status to the engine's failure classes.
pub(crate) fn classify_status(status: StatusCode, what: &str) -> Result<()> {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(EngineError::ArtifactUnavailable(format!(
            "{} returned {}",
            what, status
        )));
    }
    Err(EngineError::ArtifactNotFound(format!(
        "{} returned {}",
        what, status
    )))
}

/// Transport failures are transient from the engine's point of view.
pub(crate) fn unavailable(what: &str) -> impl FnOnce(reqwest::Error) -> EngineError + '_ {
    move |e| EngineError::ArtifactUnavailable(format!("{}: {}", what, e))
}

/// Objects served over HTTP(S), e.g. a bucket endpoint or presigned URLs.
///
/// Keys that are already absolute URLs are fetched as-is; others are joined
/// onto the base URL.
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>, token: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        if let Some(token) = token {
            let auth_value = format!("Bearer {}", token);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| EngineError::InvalidConfig(e.to_string()))?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Store for an S3-style bucket in `region`.
    pub fn for_bucket(bucket: &str, region: &str) -> Result<Self> {
        Self::new(format!("https://{}.s3.{}.amazonaws.com", bucket, region), None)
    }

    fn url_for(&self, key: &str) -> String {
        if key.starts_with("https://") || key.starts_with("http://") {
            key.to_string()
        } else {
            format!("{}/{}", self.base_url, key.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let url = self.url_for(key);
        debug!("Fetching object {}", key);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(unavailable(key))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            classify_status(status, key)?;
        }

        let bytes = response.bytes().await.map_err(unavailable(key))?;
        trace!("Fetched {} bytes for {}", bytes.len(), key);
        Ok(Some(bytes.to_vec()))
    }

    fn store_type(&self) -> &'static str {
        "HTTP"
    }
}

/// Objects stored as files under a root directory.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(EngineError::ArtifactNotFound(format!(
                "refusing object key outside the store: {}",
                key
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::Io(e)),
        }
    }

    fn store_type(&self) -> &'static str {
        "file"
    }
}

/// In-process store for local runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        objects.insert(key.into(), bytes.into());
    }

    pub fn delete(&self, key: &str) {
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        objects.remove(key);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        Ok(objects.get(key).cloned())
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}
