pub mod identity;
pub mod keyed;
pub mod keyless;
pub mod tlog;
pub mod trust;

pub use keyed::KeyedVerifier;
pub use keyless::KeylessVerifier;
pub use tlog::{RekorClient, TransparencyLog};
pub use trust::TrustRoots;

use crate::Result;
use crate::config::{IdentityConstraints, Mode, PublicKey};
use crate::digest::ArtifactDigest;
use crate::model::{Evidence, Verdict, VerificationStatus};
use crate::sources::AttachedSignature;
use crate::EngineError;
use async_trait::async_trait;
use log::debug;
use p256::ecdsa::Signature as P256Signature;
use std::sync::Arc;

/// Trait for different verification strategies
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Check one attached signature against the artifact digest.
    ///
    /// A `Verification` error means this signature does not validate; other
    /// errors are failures to reach the evidence.
    async fn verify_signature(
        &self,
        digest: &ArtifactDigest,
        signature: &AttachedSignature,
    ) -> Result<Evidence>;

    /// Get the verifier type name for logging
    fn verifier_type(&self) -> &'static str;
}

/// The verification strategy selected by the policy's trust mode.
pub enum Strategy {
    Keyed(KeyedVerifier),
    Keyless(KeylessVerifier),
}

impl Strategy {
    pub fn keyed(key: PublicKey) -> Self {
        Strategy::Keyed(KeyedVerifier::new(key))
    }

    pub fn keyless(
        constraints: IdentityConstraints,
        roots: TrustRoots,
        log: Arc<dyn TransparencyLog>,
    ) -> Self {
        Strategy::Keyless(KeylessVerifier::new(constraints, roots, log))
    }

    pub fn mode(&self) -> Mode {
        match self {
            Strategy::Keyed(_) => Mode::Keyed,
            Strategy::Keyless(_) => Mode::Keyless,
        }
    }

    fn verifier(&self) -> &dyn Verifier {
        match self {
            Strategy::Keyed(v) => v,
            Strategy::Keyless(v) => v,
        }
    }

    /// Classify an artifact from the signatures attached to it.
    ///
    /// No signatures is `NotSigned`; any valid one is `Signed`; otherwise
    /// `SignatureInvalid`. Transient failures are returned as errors when no
    /// signature validated, so the caller can retry.
    pub async fn verify(
        &self,
        digest: &ArtifactDigest,
        signatures: &[AttachedSignature],
    ) -> Result<Verdict> {
        if signatures.is_empty() {
            debug!("No signatures attached to {}", digest);
            return Ok(Verdict::not_signed(digest));
        }

        let verifier = self.verifier();
        let mut reasons = Vec::new();
        let mut transient = None;

        for (i, signature) in signatures.iter().enumerate() {
            match verifier.verify_signature(digest, signature).await {
                Ok(evidence) => {
                    debug!(
                        "Signature {} over {} verified ({})",
                        i,
                        digest,
                        verifier.verifier_type()
                    );
                    return Ok(Verdict {
                        status: VerificationStatus::Signed,
                        evidence,
                    });
                }
                Err(e) if e.is_retryable() => {
                    debug!("Signature {} could not be checked: {}", i, e);
                    transient.get_or_insert(e);
                }
                Err(e) => {
                    debug!("Signature {} rejected: {}", i, e);
                    reasons.push(e.to_string());
                }
            }
        }

        if let Some(e) = transient {
            return Err(e);
        }
        Ok(Verdict::invalid(Some(digest), reasons.join("; ")))
    }
}

/// Accept DER or fixed-size (r || s) ECDSA P-256 signatures.
pub(crate) fn parse_signature(bytes: &[u8]) -> Result<P256Signature> {
    P256Signature::from_der(bytes)
        .or_else(|_| P256Signature::from_slice(bytes))
        .map_err(|e| EngineError::Verification(format!("Failed to parse P-256 signature: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::SigningKey;
    use p256::ecdsa::signature::hazmat::PrehashSigner;
    use p256::pkcs8::{EncodePublicKey, LineEnding};

    fn strategy(signer: &SigningKey) -> Strategy {
        let pem = signer
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        Strategy::keyed(PublicKey::parse(&pem).unwrap())
    }

    fn sign(signer: &SigningKey, digest: &ArtifactDigest) -> AttachedSignature {
        let sig: P256Signature = signer.sign_prehash(digest.as_bytes()).unwrap();
        AttachedSignature::over_digest(sig.to_der().as_bytes().to_vec())
    }

    #[tokio::test]
    async fn no_signatures_is_not_signed() {
        let signer = SigningKey::from_slice(&[1u8; 32]).unwrap();
        let digest = ArtifactDigest::of_bytes(b"pkg");
        let verdict = strategy(&signer).verify(&digest, &[]).await.unwrap();
        assert_eq!(verdict.status, VerificationStatus::NotSigned);
    }

    #[tokio::test]
    async fn any_valid_signature_wins() {
        let signer = SigningKey::from_slice(&[1u8; 32]).unwrap();
        let stranger = SigningKey::from_slice(&[2u8; 32]).unwrap();
        let digest = ArtifactDigest::of_bytes(b"pkg");

        let sigs = [sign(&stranger, &digest), sign(&signer, &digest)];
        let verdict = strategy(&signer).verify(&digest, &sigs).await.unwrap();
        assert_eq!(verdict.status, VerificationStatus::Signed);
    }

    #[tokio::test]
    async fn only_foreign_signatures_is_invalid() {
        let signer = SigningKey::from_slice(&[1u8; 32]).unwrap();
        let stranger = SigningKey::from_slice(&[2u8; 32]).unwrap();
        let digest = ArtifactDigest::of_bytes(b"pkg");

        let verdict = strategy(&signer)
            .verify(&digest, &[sign(&stranger, &digest)])
            .await
            .unwrap();
        assert_eq!(verdict.status, VerificationStatus::SignatureInvalid);
        assert!(verdict.evidence.reason.is_some());
    }

    #[test]
    fn accepts_fixed_size_signatures() {
        let signer = SigningKey::from_slice(&[1u8; 32]).unwrap();
        let digest = ArtifactDigest::of_bytes(b"pkg");
        let sig: P256Signature = signer.sign_prehash(digest.as_bytes()).unwrap();
        assert_eq!(parse_signature(&sig.to_bytes()).unwrap(), sig);
        assert_eq!(parse_signature(sig.to_der().as_bytes()).unwrap(), sig);
        assert!(parse_signature(b"junk").is_err());
    }
}
