use crate::config::PublicKey;
use crate::digest::ArtifactDigest;
use crate::model::Evidence;
use crate::sources::AttachedSignature;
use crate::verifiers::{Verifier, parse_signature};
use crate::{EngineError, Result};
use async_trait::async_trait;
use p256::ecdsa::signature::hazmat::PrehashVerifier;

/// Verifies signatures against one configured public key.
pub struct KeyedVerifier {
    key: PublicKey,
}

impl KeyedVerifier {
    pub fn new(key: PublicKey) -> Self {
        Self { key }
    }
}

#[async_trait]
impl Verifier for KeyedVerifier {
    async fn verify_signature(
        &self,
        digest: &ArtifactDigest,
        signature: &AttachedSignature,
    ) -> Result<Evidence> {
        let prehash = signature.prehash(digest)?;
        let sig = parse_signature(&signature.signature)?;
        self.key
            .key
            .verify_prehash(prehash.as_bytes(), &sig)
            .map_err(|e| {
                EngineError::Verification(format!("signature does not match public key: {}", e))
            })?;

        Ok(Evidence {
            digest: Some(digest.clone()),
            ..Default::default()
        })
    }

    fn verifier_type(&self) -> &'static str {
        "keyed"
    }
}
