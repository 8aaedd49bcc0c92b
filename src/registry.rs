//! Container image registries speaking the OCI distribution API.

use crate::digest::ArtifactDigest;
use crate::model::ImageReference;
use crate::store::{USER_AGENT_VALUE, classify_status, unavailable};
use crate::{EngineError, Result};
use async_trait::async_trait;
use log::{debug, trace};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT, WWW_AUTHENTICATE};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// Raw manifest as served by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedManifest {
    pub bytes: Vec<u8>,
    pub media_type: Option<String>,
    /// Digest the registry claims for these bytes, if it sent one.
    pub reported_digest: Option<ArtifactDigest>,
}

#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Fetch a manifest by tag or digest. `Ok(None)` when it does not exist.
    async fn manifest(&self, image: &ImageReference, reference: &str)
    -> Result<Option<FetchedManifest>>;

    /// Fetch a blob by digest. `Ok(None)` when it does not exist.
    async fn blob(&self, image: &ImageReference, digest: &ArtifactDigest)
    -> Result<Option<Vec<u8>>>;
}

/// Subset of an OCI image manifest needed to walk signature layers.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Registry client over HTTPS.
///
/// Uses a static `Authorization` value when given (e.g. an ECR basic token),
/// otherwise answers bearer challenges with an anonymous pull token.
pub struct OciRegistry {
    client: reqwest::Client,
    authorization: Option<String>,
    insecure: bool,
    tokens: RwLock<HashMap<String, String>>,
}

impl OciRegistry {
    pub fn new(authorization: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            authorization: authorization.map(str::to_string),
            insecure: false,
            tokens: RwLock::new(HashMap::new()),
        })
    }

    /// Talk plain HTTP, for local test registries.
    pub fn insecure(mut self) -> Self {
        self.insecure = true;
        self
    }

    fn base_url(&self, image: &ImageReference) -> String {
        let scheme = if self.insecure { "http" } else { "https" };
        format!("{}://{}/v2/{}", scheme, image.registry, image.repository)
    }

    fn cached_token(&self, repository: &str) -> Option<String> {
        let tokens = self.tokens.read().unwrap_or_else(|e| e.into_inner());
        tokens.get(repository).cloned()
    }

    async fn send(&self, url: &str, image: &ImageReference, accept: Option<&str>) -> Result<reqwest::Response> {
        let mut retried_with_token = false;
        loop {
            let mut request = self.client.get(url);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            if let Some(auth) = &self.authorization {
                request = request.header(AUTHORIZATION, auth);
            } else if let Some(token) = self.cached_token(&image.repository) {
                request = request.header(AUTHORIZATION, format!("Bearer {}", token));
            }

            let response = request.send().await.map_err(unavailable(url))?;
            if response.status() != StatusCode::UNAUTHORIZED
                || self.authorization.is_some()
                || retried_with_token
            {
                return Ok(response);
            }

            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let Some(challenge) = challenge else {
                return Ok(response);
            };
            let token = self.fetch_token(&challenge, &image.repository).await?;
            {
                let mut tokens = self.tokens.write().unwrap_or_else(|e| e.into_inner());
                tokens.insert(image.repository.clone(), token);
            }
            retried_with_token = true;
        }
    }

    async fn fetch_token(&self, challenge: &str, repository: &str) -> Result<String> {
        let params = parse_bearer_challenge(challenge).ok_or_else(|| {
            EngineError::ArtifactNotFound(format!("unsupported auth challenge: {}", challenge))
        })?;
        let realm = params
            .get("realm")
            .ok_or_else(|| EngineError::ArtifactNotFound("auth challenge without realm".into()))?;

        let mut query = vec![(
            "scope",
            params
                .get("scope")
                .cloned()
                .unwrap_or_else(|| format!("repository:{}:pull", repository)),
        )];
        if let Some(service) = params.get("service") {
            query.push(("service", service.clone()));
        }

        debug!("Requesting anonymous pull token from {}", realm);
        let response = self
            .client
            .get(realm)
            .query(&query)
            .send()
            .await
            .map_err(unavailable(realm))?;
        if !response.status().is_success() {
            classify_status(response.status(), realm)?;
        }
        let token: TokenResponse = response.json().await.map_err(unavailable(realm))?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| EngineError::ArtifactNotFound("token endpoint returned no token".into()))
    }
}

/// Parse `Bearer realm="...",service="...",scope="..."`.
fn parse_bearer_challenge(header: &str) -> Option<HashMap<String, String>> {
    let rest = header.trim().strip_prefix("Bearer ")?;
    let mut params = HashMap::new();
    let mut remaining = rest.trim();
    while !remaining.is_empty() {
        let (key, after) = remaining.split_once('=')?;
        let after = after.strip_prefix('"')?;
        let (value, tail) = after.split_once('"')?;
        params.insert(key.trim().to_string(), value.to_string());
        remaining = tail.trim_start_matches(',').trim();
    }
    Some(params)
}

#[async_trait]
impl ImageRegistry for OciRegistry {
    async fn manifest(
        &self,
        image: &ImageReference,
        reference: &str,
    ) -> Result<Option<FetchedManifest>> {
        let url = format!("{}/manifests/{}", self.base_url(image), reference);
        let accept = [OCI_MANIFEST, OCI_INDEX, DOCKER_MANIFEST, DOCKER_MANIFEST_LIST].join(", ");
        debug!("Fetching manifest {}", url);

        let response = self.send(&url, image, Some(&accept)).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            classify_status(status, &url)?;
        }

        let headers = response.headers().clone();
        let media_type = headers
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        let reported_digest = headers
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|h| h.to_str().ok())
            .map(ArtifactDigest::parse)
            .transpose()?;

        let bytes = response.bytes().await.map_err(unavailable(&url))?;
        trace!("Manifest {} is {} bytes", reference, bytes.len());
        Ok(Some(FetchedManifest {
            bytes: bytes.to_vec(),
            media_type,
            reported_digest,
        }))
    }

    async fn blob(
        &self,
        image: &ImageReference,
        digest: &ArtifactDigest,
    ) -> Result<Option<Vec<u8>>> {
        let url = format!("{}/blobs/{}", self.base_url(image), digest);
        let response = self.send(&url, image, None).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            classify_status(status, &url)?;
        }
        let bytes = response.bytes().await.map_err(unavailable(&url))?;
        Ok(Some(bytes.to_vec()))
    }
}

#[derive(Debug, Default)]
struct MemoryRegistryState {
    /// (registry/repository, tag or digest) -> manifest
    manifests: HashMap<(String, String), FetchedManifest>,
    blobs: HashMap<ArtifactDigest, Vec<u8>>,
}

/// In-process registry for local runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    state: Arc<RwLock<MemoryRegistryState>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn repo_key(image: &ImageReference) -> String {
        format!("{}/{}", image.registry, image.repository)
    }

    /// Store a manifest, addressable by its digest and by `tag` when given.
    pub fn put_manifest(
        &self,
        image: &ImageReference,
        tag: Option<&str>,
        bytes: impl Into<Vec<u8>>,
        media_type: &str,
    ) -> ArtifactDigest {
        let bytes = bytes.into();
        let digest = ArtifactDigest::of_bytes(&bytes);
        let manifest = FetchedManifest {
            bytes,
            media_type: Some(media_type.to_string()),
            reported_digest: Some(digest.clone()),
        };

        let repo = Self::repo_key(image);
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if let Some(tag) = tag {
            state
                .manifests
                .insert((repo.clone(), tag.to_string()), manifest.clone());
        }
        state
            .manifests
            .insert((repo, digest.to_string()), manifest);
        digest
    }

    pub fn put_blob(&self, bytes: impl Into<Vec<u8>>) -> ArtifactDigest {
        let bytes = bytes.into();
        let digest = ArtifactDigest::of_bytes(&bytes);
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.blobs.insert(digest.clone(), bytes);
        digest
    }
}

#[async_trait]
impl ImageRegistry for MemoryRegistry {
    async fn manifest(
        &self,
        image: &ImageReference,
        reference: &str,
    ) -> Result<Option<FetchedManifest>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .manifests
            .get(&(Self::repo_key(image), reference.to_string()))
            .cloned())
    }

    async fn blob(
        &self,
        _image: &ImageReference,
        digest: &ArtifactDigest,
    ) -> Result<Option<Vec<u8>>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.blobs.get(digest).cloned())
    }
}
