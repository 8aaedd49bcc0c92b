use crate::bundle::{CosignBundle, decode_base64, decode_pem_text};
use crate::sources::{ArtifactRef, AttachedSignature, SignatureSource};
use crate::store::ObjectStore;
use crate::Result;
use async_trait::async_trait;
use log::{debug, trace};
use std::sync::Arc;

/// Detached blob signatures stored next to the package digest.
///
/// Looks for `<hex>.bundle` first, then `<hex>.sig` with an optional
/// `<hex>.crt.base64` certificate.
pub struct ObjectStoreSource {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectStoreSource {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            prefix: String::new(),
        }
    }

    /// Look under `prefix` instead of the store root.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn key(&self, artifact: &ArtifactRef, suffix: &str) -> String {
        format!("{}{}.{}", self.prefix, artifact.digest.hex(), suffix)
    }
}

#[async_trait]
impl SignatureSource for ObjectStoreSource {
    async fn fetch_signatures(&self, artifact: &ArtifactRef) -> Result<Vec<AttachedSignature>> {
        let bundle_key = self.key(artifact, "bundle");
        if let Some(bytes) = self.store.get(&bundle_key).await? {
            debug!("Found signature bundle {}", bundle_key);
            let bundle = CosignBundle::parse(&bytes)?;
            return Ok(vec![AttachedSignature {
                certificate: bundle.certificate_pem()?,
                rekor_bundle: bundle.rekor_bundle.clone(),
                ..AttachedSignature::over_digest(bundle.signature()?)
            }]);
        }

        let sig_key = self.key(artifact, "sig");
        let Some(sig) = self.store.get(&sig_key).await? else {
            trace!("No signature objects for {}", artifact.digest);
            return Ok(Vec::new());
        };
        let sig_text = String::from_utf8_lossy(&sig);
        let signature = decode_base64(&sig_text, "signature")?;

        let cert_key = self.key(artifact, "crt.base64");
        let certificate = match self.store.get(&cert_key).await? {
            Some(cert) => Some(decode_pem_text(&String::from_utf8_lossy(&cert))?),
            None => None,
        };

        debug!(
            "Found detached signature {} (certificate: {})",
            sig_key,
            certificate.is_some()
        );
        Ok(vec![AttachedSignature {
            certificate,
            ..AttachedSignature::over_digest(signature)
        }])
    }

    fn source_type(&self) -> &'static str {
        "object store"
    }
}
