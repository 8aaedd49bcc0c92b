//! Trust anchors for keyless verification: certificate authority roots and
//! transparency-log keys.

use crate::config::IdentityConstraints;
use crate::{EngineError, Result};
use log::debug;
use p256::ecdsa::VerifyingKey as P256VerifyingKey;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use sha2::{Digest, Sha256};
use sigstore::trust::TrustRoot;
use sigstore::trust::sigstore::SigstoreTrustRoot;
use x509_parser::pem::Pem;

/// A transparency-log signing key and the log id derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogKey {
    pub key: P256VerifyingKey,
    /// Hex SHA-256 of the DER public key.
    pub log_id: String,
}

impl LogKey {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let key = P256VerifyingKey::from_public_key_der(der).map_err(|e| {
            EngineError::Verification(format!("Failed to parse log public key: {}", e))
        })?;
        Ok(Self {
            key,
            log_id: hex::encode(Sha256::digest(der)),
        })
    }

    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = P256VerifyingKey::from_public_key_pem(pem.trim()).map_err(|e| {
            EngineError::Verification(format!("Failed to parse log public key PEM: {}", e))
        })?;
        let der = key.to_public_key_der().map_err(|e| {
            EngineError::Verification(format!("Failed to encode log public key: {}", e))
        })?;
        Ok(Self {
            key,
            log_id: hex::encode(Sha256::digest(der.as_bytes())),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrustRoots {
    /// DER certificates accepted as chain anchors or intermediates.
    pub certificate_authorities: Vec<Vec<u8>>,
    pub log_keys: Vec<LogKey>,
}

impl TrustRoots {
    /// Build from PEM bundles: one or more CA certificates and one or more log keys.
    pub fn from_pems(ca_pem: &str, log_keys_pem: &str) -> Result<Self> {
        let mut roots = Self::default();
        roots.add_ca_pem(ca_pem)?;
        roots.add_log_key_pem(log_keys_pem)?;
        Ok(roots)
    }

    pub fn add_ca_pem(&mut self, pem: &str) -> Result<()> {
        let before = self.certificate_authorities.len();
        for block in Pem::iter_from_buffer(pem.as_bytes()) {
            let block = block.map_err(|e| {
                EngineError::InvalidConfig(format!("Failed to parse CA certificate PEM: {}", e))
            })?;
            self.certificate_authorities.push(block.contents);
        }
        if self.certificate_authorities.len() == before {
            return Err(EngineError::InvalidConfig(
                "CA bundle contains no certificates".into(),
            ));
        }
        Ok(())
    }

    pub fn add_log_key_pem(&mut self, pem: &str) -> Result<()> {
        const END: &str = "-----END PUBLIC KEY-----";
        let mut added = 0;
        for block in pem.split_inclusive(END).map(str::trim) {
            if block.ends_with(END) {
                self.log_keys.push(LogKey::from_pem(block)?);
                added += 1;
            }
        }
        if added == 0 {
            return Err(EngineError::InvalidConfig(
                "log key bundle contains no public keys".into(),
            ));
        }
        Ok(())
    }

    /// Fetch the public-good Sigstore roots via TUF.
    pub async fn sigstore_public_good() -> Result<Self> {
        let root = SigstoreTrustRoot::new(None)
            .await
            .map_err(|e| EngineError::Provider(format!("Failed to fetch trust root: {}", e)))?;
        Self::from_trust_root(&root)
    }

    /// Fulcio CA certificates and Rekor keys from a Sigstore trust root.
    /// Log keys that are not P-256 are skipped.
    pub fn from_trust_root(root: &impl TrustRoot) -> Result<Self> {
        let certificate_authorities: Vec<Vec<u8>> = root
            .fulcio_certs()
            .map_err(|e| EngineError::Verification(format!("Failed to get Fulcio certs: {}", e)))?
            .iter()
            .map(|cert| cert.to_vec())
            .collect();

        let mut log_keys = Vec::new();
        let rekor_keys = root
            .rekor_keys()
            .map_err(|e| EngineError::Verification(format!("Failed to get Rekor keys: {}", e)))?;
        for der in rekor_keys {
            match LogKey::from_der(der) {
                Ok(key) => log_keys.push(key),
                Err(e) => debug!("Skipping unsupported Rekor key: {}", e),
            }
        }

        debug!(
            "Loaded {} CA certificate(s) and {} log key(s) from the Sigstore trust root",
            certificate_authorities.len(),
            log_keys.len()
        );
        Ok(Self {
            certificate_authorities,
            log_keys,
        })
    }

    /// Configured anchors when both are given, otherwise the public-good roots
    /// extended with whichever one was configured.
    pub async fn resolve(constraints: &IdentityConstraints) -> Result<Self> {
        match (
            constraints.fulcio_root_pem.as_deref(),
            constraints.rekor_public_key_pem.as_deref(),
        ) {
            (Some(ca), Some(log)) => Self::from_pems(ca, log),
            (ca, log) => {
                let mut roots = Self::sigstore_public_good().await?;
                if let Some(ca) = ca {
                    roots.add_ca_pem(ca)?;
                }
                if let Some(log) = log {
                    roots.add_log_key_pem(log)?;
                }
                Ok(roots)
            }
        }
    }
}
