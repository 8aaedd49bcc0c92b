use crate::bundle::{RekorBundle, decode_base64};
use crate::digest::ArtifactDigest;
use crate::model::ImageReference;
use crate::registry::{Descriptor, ImageManifest, ImageRegistry};
use crate::sources::{ArtifactRef, AttachedSignature, SignatureSource, SignedPayload};
use crate::{EngineError, Result};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;

pub const SIGNATURE_ANNOTATION: &str = "dev.cosignproject.cosign/signature";
pub const CERTIFICATE_ANNOTATION: &str = "dev.sigstore.cosign/certificate";
pub const CHAIN_ANNOTATION: &str = "dev.sigstore.cosign/chain";
pub const BUNDLE_ANNOTATION: &str = "dev.sigstore.cosign/bundle";

/// OCI registry source for signatures attached per the cosign convention:
/// a `sha256-<hex>.sig` tag in the image's repository, one layer per signature.
pub struct OciSource {
    registry: Arc<dyn ImageRegistry>,
}

impl OciSource {
    pub fn new(registry: Arc<dyn ImageRegistry>) -> Self {
        Self { registry }
    }

    async fn signature_from_layer(
        &self,
        repository: &ImageReference,
        layer: &Descriptor,
    ) -> Result<Option<AttachedSignature>> {
        let Some(signature) = layer.annotations.get(SIGNATURE_ANNOTATION) else {
            warn!("Skipping signature layer {} without a signature annotation", layer.digest);
            return Ok(None);
        };

        let layer_digest = ArtifactDigest::parse(&layer.digest)?;
        let payload = self
            .registry
            .blob(repository, &layer_digest)
            .await?
            .ok_or_else(|| {
                EngineError::Verification(format!("signed payload {} is missing", layer.digest))
            })?;
        if ArtifactDigest::of_bytes(&payload) != layer_digest {
            return Err(EngineError::Verification(format!(
                "signed payload does not match layer digest {}",
                layer.digest
            )));
        }

        let rekor_bundle = layer
            .annotations
            .get(BUNDLE_ANNOTATION)
            .map(|b| serde_json::from_str::<RekorBundle>(b))
            .transpose()
            .map_err(|e| EngineError::Verification(format!("Failed to parse Rekor bundle: {}", e)))?;

        Ok(Some(AttachedSignature {
            signature: decode_base64(signature, "signature")?,
            payload: SignedPayload::SimpleSigning(payload),
            certificate: layer.annotations.get(CERTIFICATE_ANNOTATION).cloned(),
            chain: layer
                .annotations
                .get(CHAIN_ANNOTATION)
                .map(|c| split_pem_chain(c))
                .unwrap_or_default(),
            rekor_bundle,
        }))
    }
}

/// Split concatenated PEM blocks.
pub(crate) fn split_pem_chain(chain: &str) -> Vec<String> {
    const END: &str = "-----END CERTIFICATE-----";
    chain
        .split_inclusive(END)
        .map(str::trim)
        .filter(|block| block.starts_with("-----BEGIN") && block.ends_with(END))
        .map(|block| format!("{}\n", block))
        .collect()
}

#[async_trait]
impl SignatureSource for OciSource {
    async fn fetch_signatures(&self, artifact: &ArtifactRef) -> Result<Vec<AttachedSignature>> {
        let image = artifact.image.as_ref().ok_or_else(|| {
            EngineError::Verification("image signatures need a repository reference".into())
        })?;
        let sig_tag = artifact.digest.cosign_signature_tag();
        let repository = ImageReference {
            tag: Some(sig_tag.clone()),
            digest: None,
            ..image.clone()
        };

        let Some(manifest) = self.registry.manifest(&repository, &sig_tag).await? else {
            debug!("No signature tag {} in {}", sig_tag, image.repository);
            return Ok(Vec::new());
        };
        let manifest: ImageManifest = serde_json::from_slice(&manifest.bytes).map_err(|e| {
            EngineError::Verification(format!("Failed to parse signature manifest: {}", e))
        })?;

        // An unusable layer is skipped; the remaining layers still count.
        let mut signatures = Vec::with_capacity(manifest.layers.len());
        let mut rejected = Vec::new();
        let mut transient = None;
        for layer in &manifest.layers {
            match self.signature_from_layer(&repository, layer).await {
                Ok(Some(signature)) => signatures.push(signature),
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    warn!("Signature layer {} unavailable: {}", layer.digest, e);
                    transient.get_or_insert(e);
                }
                Err(e) => {
                    warn!("Skipping unusable signature layer {}: {}", layer.digest, e);
                    rejected.push(e.to_string());
                }
            }
        }
        debug!(
            "Found {} signature(s) for {} in {}",
            signatures.len(),
            artifact.digest,
            image.repository
        );

        if signatures.is_empty() {
            if let Some(e) = transient {
                return Err(e);
            }
            if !rejected.is_empty() {
                return Err(EngineError::Verification(rejected.join("; ")));
            }
        }
        Ok(signatures)
    }

    fn source_type(&self) -> &'static str {
        "OCI"
    }
}
