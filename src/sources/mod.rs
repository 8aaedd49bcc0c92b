pub mod object_store;
pub mod oci;

pub use object_store::ObjectStoreSource;
pub use oci::OciSource;

use crate::bundle::{RekorBundle, simple_signing_digest};
use crate::digest::ArtifactDigest;
use crate::model::{ArtifactKind, ImageReference};
use crate::{EngineError, Result};
use async_trait::async_trait;

/// Reference to an artifact whose signatures are being looked up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub digest: ArtifactDigest,
    pub kind: ArtifactKind,
    /// Repository the image lives in (images only)
    pub image: Option<ImageReference>,
}

impl ArtifactRef {
    pub fn code_package(digest: ArtifactDigest) -> Self {
        Self {
            digest,
            kind: ArtifactKind::CodePackage,
            image: None,
        }
    }

    pub fn container_image(digest: ArtifactDigest, image: ImageReference) -> Self {
        Self {
            digest,
            kind: ArtifactKind::ContainerImage,
            image: Some(image),
        }
    }
}

/// What a signature was computed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignedPayload {
    /// The artifact itself; its digest is the prehash.
    Digest,
    /// A cosign simple-signing document naming the artifact digest.
    SimpleSigning(Vec<u8>),
}

/// One signature found attached to an artifact, with its verification material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedSignature {
    pub signature: Vec<u8>,
    pub payload: SignedPayload,
    /// PEM signing certificate (keyless).
    pub certificate: Option<String>,
    /// PEM intermediates, leaf-most first.
    pub chain: Vec<String>,
    pub rekor_bundle: Option<RekorBundle>,
}

impl AttachedSignature {
    /// A signature over the artifact bytes.
    pub fn over_digest(signature: Vec<u8>) -> Self {
        Self {
            signature,
            payload: SignedPayload::Digest,
            certificate: None,
            chain: Vec::new(),
            rekor_bundle: None,
        }
    }

    /// The 32-byte message hash the signature must verify over.
    ///
    /// Fails when a simple-signing payload names a different artifact.
    pub fn prehash(&self, digest: &ArtifactDigest) -> Result<ArtifactDigest> {
        match &self.payload {
            SignedPayload::Digest => Ok(digest.clone()),
            SignedPayload::SimpleSigning(payload) => {
                let named = simple_signing_digest(payload)?;
                if named != *digest {
                    return Err(EngineError::Verification(format!(
                        "signature payload is for {}, not {}",
                        named, digest
                    )));
                }
                Ok(ArtifactDigest::of_bytes(payload))
            }
        }
    }
}

/// Where signatures for an artifact are discovered
#[async_trait]
pub trait SignatureSource: Send + Sync {
    /// All signatures attached to the artifact; empty when it is unsigned.
    ///
    /// A `Verification` error means signature material exists but is unusable.
    async fn fetch_signatures(&self, artifact: &ArtifactRef) -> Result<Vec<AttachedSignature>>;

    /// Get the source type name for logging
    fn source_type(&self) -> &'static str;
}
