//! Core data model shared by every stage of a verification cycle.

use crate::digest::ArtifactDigest;
use crate::enforce::ResultTag;
use crate::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a deployed function (name or ARN).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionIdentity(String);

impl FunctionIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short function name: the ARN resource segment, or the identity itself.
    ///
    /// `arn:aws:lambda:us-east-1:123:function:my-fn:3` yields `my-fn`.
    pub fn name(&self) -> &str {
        let mut parts = self.0.split(':');
        if parts.next() != Some("arn") {
            return &self.0;
        }
        let rest: Vec<&str> = parts.collect();
        match rest.iter().position(|p| *p == "function") {
            Some(idx) if idx + 1 < rest.len() => rest[idx + 1],
            _ => &self.0,
        }
    }
}

impl fmt::Display for FunctionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    CodePackage,
    ContainerImage,
}

/// Registry, repository and tag/digest of a container image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<ArtifactDigest>,
}

const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

impl ImageReference {
    /// Parse `registry/repo[:tag][@sha256:hex]`.
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(EngineError::MalformedEvent("empty image reference".into()));
        }

        let (name, digest) = match uri.split_once('@') {
            Some((name, digest)) => (name, Some(ArtifactDigest::parse(digest)?)),
            None => (uri, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones belong to a registry port.
        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(i) => (
                &name[..last_slash + i],
                Some(name[last_slash + i + 1..].to_string()),
            ),
            None => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ if name.contains('/') => (DEFAULT_REGISTRY.to_string(), name.to_string()),
            _ => (DEFAULT_REGISTRY.to_string(), format!("library/{}", name)),
        };

        if repository.is_empty() || tag.as_deref() == Some("") {
            return Err(EngineError::MalformedEvent(format!(
                "invalid image reference: {}",
                uri
            )));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The reference to resolve against the registry: the digest when pinned, else the tag.
    pub fn reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => "latest".to_string(),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Kind-specific pointer to the deployed artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLocator {
    CodePackage {
        /// Location of the deployed package bytes (object key or URL).
        location: String,
        /// Platform-reported SHA-256 of the package, base64 encoded.
        reported_sha256: Option<String>,
    },
    ContainerImage(ImageReference),
}

impl ArtifactLocator {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactLocator::CodePackage { .. } => ArtifactKind::CodePackage,
            ArtifactLocator::ContainerImage(_) => ArtifactKind::ContainerImage,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub function_identity: FunctionIdentity,
    pub artifact_locator: ArtifactLocator,
    pub observed_at: DateTime<Utc>,
    /// Upstream event id, when the provider supplies one.
    pub event_id: Option<String>,
}

impl VerificationRequest {
    pub fn artifact_kind(&self) -> ArtifactKind {
        self.artifact_locator.kind()
    }

    /// Stable correlation id for one cycle over this request.
    pub fn cycle_id(&self) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(self.function_identity.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.observed_at.to_rfc3339().as_bytes());
        hasher.update([0]);
        hasher.update(self.event_id.as_deref().unwrap_or("").as_bytes());
        hex::encode(&hasher.finalize()[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationStatus {
    Signed,
    NotSigned,
    SignatureInvalid,
}

impl VerificationStatus {
    pub fn is_signed(self) -> bool {
        self == VerificationStatus::Signed
    }

    pub fn result_tag(self) -> ResultTag {
        match self {
            VerificationStatus::Signed => ResultTag::SignedAndVerified,
            VerificationStatus::NotSigned => ResultTag::NotSigned,
            VerificationStatus::SignatureInvalid => ResultTag::SignatureInvalid,
        }
    }
}

/// Transparency-log entry consulted during keyless verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TlogEvidence {
    pub log_index: i64,
    pub log_id: String,
    pub integrated_time: i64,
    pub inclusion_proof_verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    pub digest: Option<ArtifactDigest>,
    /// PEM of the leaf certificate (keyless only).
    pub certificate: Option<String>,
    pub tlog: Option<TlogEvidence>,
    /// Why the artifact did not verify, when it did not.
    pub reason: Option<String>,
}

/// What a verifier concludes about one artifact, before request context is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: VerificationStatus,
    pub evidence: Evidence,
}

impl Verdict {
    pub fn not_signed(digest: &ArtifactDigest) -> Self {
        Self {
            status: VerificationStatus::NotSigned,
            evidence: Evidence {
                digest: Some(digest.clone()),
                ..Default::default()
            },
        }
    }

    pub fn invalid(digest: Option<&ArtifactDigest>, reason: impl Into<String>) -> Self {
        Self {
            status: VerificationStatus::SignatureInvalid,
            evidence: Evidence {
                digest: digest.cloned(),
                reason: Some(reason.into()),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub status: VerificationStatus,
    pub evidence: Evidence,
    pub function_identity: FunctionIdentity,
    pub observed_at: DateTime<Utc>,
}

impl VerificationOutcome {
    pub fn new(request: &VerificationRequest, verdict: Verdict) -> Self {
        Self {
            status: verdict.status,
            evidence: verdict.evidence,
            function_identity: request.function_identity.clone(),
            observed_at: request.observed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyChange {
    Untouched,
    /// Reserved concurrency set to zero.
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnforcementRecord {
    pub concurrency: ConcurrencyChange,
    pub result_tag: ResultTag,
}
