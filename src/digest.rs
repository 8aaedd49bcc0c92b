use crate::fetch::FetchedArtifact;
use crate::{EngineError, Result};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Canonical SHA-256 content digest, rendered as `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactDigest {
    bytes: [u8; 32],
}

impl ArtifactDigest {
    pub fn of_bytes(data: &[u8]) -> Self {
        Self {
            bytes: Sha256::digest(data).into(),
        }
    }

    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Parse `sha256:<hex>` or bare hex.
    pub fn parse(s: &str) -> Result<Self> {
        let hex_part = match s.split_once(':') {
            Some(("sha256", rest)) => rest,
            Some((algo, _)) => {
                return Err(EngineError::Verification(format!(
                    "unsupported digest algorithm: {}",
                    algo
                )));
            }
            None => s,
        };
        let raw = hex::decode(hex_part)
            .map_err(|e| EngineError::Verification(format!("invalid digest hex: {}", e)))?;
        Self::from_slice(&raw)
    }

    /// Parse the base64 SHA-256 form platforms report for code packages.
    pub fn from_base64(s: &str) -> Result<Self> {
        let raw = BASE64
            .decode(s.trim())
            .map_err(|e| EngineError::Verification(format!("invalid base64 digest: {}", e)))?;
        Self::from_slice(&raw)
    }

    fn from_slice(raw: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = raw.try_into().map_err(|_| {
            EngineError::Verification(format!("digest must be 32 bytes, got {}", raw.len()))
        })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Name of the cosign signature tag attached to an image with this digest.
    pub fn cosign_signature_tag(&self) -> String {
        format!("sha256-{}.sig", self.hex())
    }
}

impl fmt::Display for ArtifactDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.hex())
    }
}

impl Serialize for ArtifactDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Canonical digest of a fetched artifact.
///
/// Code packages hash the exact deployed bytes. Images use the manifest digest the
/// fetcher already checked against the manifest bytes, never a tag.
pub fn compute_digest(artifact: &FetchedArtifact) -> ArtifactDigest {
    match artifact {
        FetchedArtifact::CodePackage { bytes } => ArtifactDigest::of_bytes(bytes),
        FetchedArtifact::ContainerImage { manifest_digest, .. } => manifest_digest.clone(),
    }
}

/// SHA-256 of a file on disk, streamed.
pub fn file_digest(path: &Path) -> Result<ArtifactDigest> {
    use std::fs::File;
    use std::io::Read;

    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(ArtifactDigest {
        bytes: hasher.finalize().into(),
    })
}
