use crate::bundle::{HashedRekord, TlogEntry};
use crate::config::IdentityConstraints;
use crate::digest::ArtifactDigest;
use crate::model::{Evidence, TlogEvidence};
use crate::sources::AttachedSignature;
use crate::verifiers::identity::{oidc_issuer, san_identities, subject_matches};
use crate::verifiers::tlog::{TransparencyLog, verify_inclusion_proof, verify_signed_entry_timestamp};
use crate::verifiers::trust::TrustRoots;
use crate::verifiers::{Verifier, parse_signature};
use crate::{EngineError, Result};
use async_trait::async_trait;
use log::debug;
use p256::ecdsa::VerifyingKey as P256VerifyingKey;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use std::sync::Arc;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::*;

const MAX_CHAIN_DEPTH: usize = 8;

/// Verifies signatures made with short-lived certificates bound to an OIDC
/// identity and recorded in a transparency log.
pub struct KeylessVerifier {
    constraints: IdentityConstraints,
    roots: TrustRoots,
    log: Arc<dyn TransparencyLog>,
}

/// What survives of the certificate checks once the parsed certificate is dropped.
struct CheckedCertificate {
    pem: String,
    der: Vec<u8>,
    /// Validity shared by every certificate on the path to the root.
    not_before: i64,
    not_after: i64,
}

impl KeylessVerifier {
    pub fn new(
        constraints: IdentityConstraints,
        roots: TrustRoots,
        log: Arc<dyn TransparencyLog>,
    ) -> Self {
        Self {
            constraints,
            roots,
            log,
        }
    }

    /// Chain, identity and signature checks; everything that needs no network.
    fn check_certificate(
        &self,
        signature: &AttachedSignature,
        prehash: &ArtifactDigest,
    ) -> Result<CheckedCertificate> {
        let pem = signature.certificate.as_deref().ok_or_else(|| {
            EngineError::Verification("keyless signature carries no certificate".into())
        })?;
        let der = pem_to_der(pem)?;
        let (_, leaf) = X509Certificate::from_der(&der).map_err(|e| {
            EngineError::Verification(format!("Failed to parse certificate: {}", e))
        })?;

        let intermediates = signature
            .chain
            .iter()
            .map(|c| pem_to_der(c))
            .collect::<Result<Vec<_>>>()?;
        let (not_before, not_after) =
            verify_chain(&leaf, &intermediates, &self.roots.certificate_authorities)?;

        let issuer = oidc_issuer(&leaf).ok_or_else(|| {
            EngineError::Verification("certificate has no OIDC issuer extension".into())
        })?;
        if issuer != self.constraints.issuer {
            return Err(EngineError::Verification(format!(
                "certificate issuer {} is not {}",
                issuer, self.constraints.issuer
            )));
        }
        let identities = san_identities(&leaf);
        if !subject_matches(&identities, &self.constraints.subject_patterns) {
            return Err(EngineError::Verification(format!(
                "certificate subject {:?} matches no allowed pattern",
                identities
            )));
        }

        let key = P256VerifyingKey::from_sec1_bytes(leaf.public_key().subject_public_key.data.as_ref())
            .map_err(|e| {
                EngineError::Verification(format!("Failed to parse P-256 public key: {}", e))
            })?;
        let sig = parse_signature(&signature.signature)?;
        key.verify_prehash(prehash.as_bytes(), &sig).map_err(|e| {
            EngineError::Verification(format!("signature does not match certificate: {}", e))
        })?;

        Ok(CheckedCertificate {
            pem: pem.to_string(),
            not_before,
            not_after,
            der,
        })
    }

    /// Check one log entry binds this signature and certificate to the prehash.
    fn check_entry(
        &self,
        entry: &TlogEntry,
        prehash: &ArtifactDigest,
        signature: &AttachedSignature,
        cert: &CheckedCertificate,
    ) -> Result<TlogEvidence> {
        let rekord = HashedRekord::from_body(&entry.body)?;
        if rekord.digest != *prehash {
            return Err(EngineError::Verification("log entry records a different hash".into()));
        }
        if parse_signature(&rekord.signature)? != parse_signature(&signature.signature)? {
            return Err(EngineError::Verification(
                "log entry records a different signature".into(),
            ));
        }
        if pem_to_der(&rekord.verifier_pem)? != cert.der {
            return Err(EngineError::Verification(
                "log entry records a different certificate".into(),
            ));
        }

        verify_signed_entry_timestamp(entry, &self.roots.log_keys)?;

        let inclusion_proof_verified = match &entry.inclusion_proof {
            Some(proof) => {
                verify_inclusion_proof(entry, proof)?;
                true
            }
            None => false,
        };

        if entry.integrated_time < cert.not_before || entry.integrated_time > cert.not_after {
            return Err(EngineError::Verification(format!(
                "certificate chain was not valid at log time {}",
                entry.integrated_time
            )));
        }

        Ok(TlogEvidence {
            log_index: entry.log_index,
            log_id: entry.log_id.clone(),
            integrated_time: entry.integrated_time,
            inclusion_proof_verified,
        })
    }
}

#[async_trait]
impl Verifier for KeylessVerifier {
    async fn verify_signature(
        &self,
        digest: &ArtifactDigest,
        signature: &AttachedSignature,
    ) -> Result<Evidence> {
        let prehash = signature.prehash(digest)?;
        let cert = self.check_certificate(signature, &prehash)?;

        let entries = match &signature.rekor_bundle {
            Some(bundle) => vec![TlogEntry::from(bundle)],
            None => {
                debug!("No attached log bundle, searching the transparency log");
                self.log.find_entries(&prehash).await?
            }
        };
        if entries.is_empty() {
            return Err(EngineError::Verification(
                "signature is not recorded in the transparency log".into(),
            ));
        }

        let mut last_error = None;
        for entry in &entries {
            match self.check_entry(entry, &prehash, signature, &cert) {
                Ok(tlog) => {
                    debug!("Log entry {} verified", tlog.log_index);
                    return Ok(Evidence {
                        digest: Some(digest.clone()),
                        certificate: Some(cert.pem),
                        tlog: Some(tlog),
                        reason: None,
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            EngineError::Verification("no transparency log entry matched".into())
        }))
    }

    fn verifier_type(&self) -> &'static str {
        "keyless"
    }
}

fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let (_, block) = parse_x509_pem(pem.trim().as_bytes())
        .map_err(|e| EngineError::Verification(format!("Failed to parse PEM: {}", e)))?;
    Ok(block.contents)
}

fn is_self_signed(cert: &X509Certificate<'_>) -> bool {
    cert.subject().as_raw() == cert.issuer().as_raw() && cert.verify_signature(None).is_ok()
}

/// Walk from `leaf` to a self-signed trust anchor, checking every signature.
///
/// Every certificate above the leaf must be a CA allowed to sign
/// certificates, within its path length. Returns the window in which all
/// certificates on the path are valid.
fn verify_chain(
    leaf: &X509Certificate<'_>,
    intermediates: &[Vec<u8>],
    anchors: &[Vec<u8>],
) -> Result<(i64, i64)> {
    let mut pool = Vec::with_capacity(intermediates.len() + anchors.len());
    for der in intermediates.iter().chain(anchors) {
        let (_, cert) = X509Certificate::from_der(der).map_err(|e| {
            EngineError::Verification(format!("Failed to parse chain certificate: {}", e))
        })?;
        pool.push((der.as_slice(), cert));
    }
    let is_anchor = |der: &[u8]| anchors.iter().any(|a| a.as_slice() == der);

    let mut window = validity_window(leaf);
    let mut current = leaf;
    for cas_below in 0..MAX_CHAIN_DEPTH {
        let issuer = pool.iter().find(|(_, candidate)| {
            candidate.subject().as_raw() == current.issuer().as_raw()
                && current.verify_signature(Some(candidate.public_key())).is_ok()
        });
        let Some((issuer_der, issuer)) = issuer else {
            return Err(EngineError::Verification(format!(
                "no trusted issuer for {}",
                current.subject()
            )));
        };
        check_issuer(issuer, cas_below)?;

        let (not_before, not_after) = validity_window(issuer);
        window = (window.0.max(not_before), window.1.min(not_after));

        if is_anchor(*issuer_der) && is_self_signed(issuer) {
            debug!("Certificate chain verified to {}", issuer.subject());
            return Ok(window);
        }
        if std::ptr::eq(issuer, current) {
            break;
        }
        current = issuer;
    }
    Err(EngineError::Verification(
        "certificate does not chain to a trusted root".into(),
    ))
}

/// An issuing certificate must be a CA that may sign certificates and that
/// allows `cas_below` CA certificates between itself and the leaf.
fn check_issuer(issuer: &X509Certificate<'_>, cas_below: usize) -> Result<()> {
    let constraints = issuer
        .basic_constraints()
        .map_err(|e| EngineError::Verification(format!("Failed to parse basic constraints: {}", e)))?;
    let Some(constraints) = constraints.filter(|c| c.value.ca) else {
        return Err(EngineError::Verification(format!(
            "{} is not a certificate authority",
            issuer.subject()
        )));
    };
    if let Some(limit) = constraints.value.path_len_constraint {
        if cas_below > limit as usize {
            return Err(EngineError::Verification(format!(
                "{} allows {} intermediate(s), chain has {}",
                issuer.subject(),
                limit,
                cas_below
            )));
        }
    }

    let usage = issuer
        .key_usage()
        .map_err(|e| EngineError::Verification(format!("Failed to parse key usage: {}", e)))?;
    if let Some(usage) = usage {
        if !usage.value.key_cert_sign() {
            return Err(EngineError::Verification(format!(
                "{} may not sign certificates",
                issuer.subject()
            )));
        }
    }
    Ok(())
}

fn validity_window(cert: &X509Certificate<'_>) -> (i64, i64) {
    let validity = cert.validity();
    (validity.not_before.timestamp(), validity.not_after.timestamp())
}
