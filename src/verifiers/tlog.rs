//! Transparency-log evidence: signed entry timestamps, inclusion proofs and
//! online entry lookup.

use crate::bundle::{InclusionProof, TlogEntry, decode_base64, parse_log_entries};
use crate::digest::ArtifactDigest;
use crate::store::{USER_AGENT_VALUE, classify_status, unavailable};
use crate::verifiers::trust::LogKey;
use crate::{EngineError, Result};
use async_trait::async_trait;
use log::debug;
use p256::ecdsa::Signature as P256Signature;
use p256::ecdsa::signature::Verifier as _;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};

/// Search a transparency log for entries recording a signature over `prehash`.
#[async_trait]
pub trait TransparencyLog: Send + Sync {
    async fn find_entries(&self, prehash: &ArtifactDigest) -> Result<Vec<TlogEntry>>;
}

/// Rekor REST client.
pub struct RekorClient {
    client: reqwest::Client,
    base_url: String,
}

impl RekorClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TransparencyLog for RekorClient {
    async fn find_entries(&self, prehash: &ArtifactDigest) -> Result<Vec<TlogEntry>> {
        let url = format!("{}/api/v1/index/retrieve", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "hash": prehash.to_string() }))
            .send()
            .await
            .map_err(unavailable(&url))?;
        if !response.status().is_success() {
            classify_status(response.status(), &url)?;
        }
        let uuids: Vec<String> = response.json().await.map_err(unavailable(&url))?;
        debug!("Rekor index lists {} entr(ies) for {}", uuids.len(), prehash);

        let mut entries = Vec::new();
        for uuid in uuids {
            let url = format!("{}/api/v1/log/entries/{}", self.base_url, uuid);
            let response = self.client.get(&url).send().await.map_err(unavailable(&url))?;
            if response.status() == StatusCode::NOT_FOUND {
                continue;
            }
            if !response.status().is_success() {
                classify_status(response.status(), &url)?;
            }
            let body: serde_json::Value = response.json().await.map_err(unavailable(&url))?;
            entries.extend(parse_log_entries(&body)?);
        }
        Ok(entries)
    }
}

/// The document a Signed Entry Timestamp signs: canonical JSON with keys in
/// lexicographic order and no whitespace.
#[derive(Serialize)]
struct SignedEntryPayload<'a> {
    body: &'a str,
    #[serde(rename = "integratedTime")]
    integrated_time: i64,
    #[serde(rename = "logID")]
    log_id: &'a str,
    #[serde(rename = "logIndex")]
    log_index: i64,
}

pub fn signed_entry_payload(entry: &TlogEntry) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&SignedEntryPayload {
        body: &entry.body,
        integrated_time: entry.integrated_time,
        log_id: &entry.log_id,
        log_index: entry.log_index,
    })?)
}

/// Verify the entry's Signed Entry Timestamp with any trusted log key.
pub fn verify_signed_entry_timestamp(entry: &TlogEntry, keys: &[LogKey]) -> Result<()> {
    let signature = decode_base64(&entry.signed_entry_timestamp, "signed entry timestamp")?;
    let signature = P256Signature::from_der(&signature)
        .or_else(|_| P256Signature::from_slice(&signature))
        .map_err(|e| EngineError::Verification(format!("Failed to parse SET: {}", e)))?;
    let message = signed_entry_payload(entry)?;

    // Try the key matching the entry's log id first.
    let mut ordered: Vec<&LogKey> = keys.iter().filter(|k| k.log_id == entry.log_id).collect();
    ordered.extend(keys.iter().filter(|k| k.log_id != entry.log_id));

    for key in ordered {
        if key.key.verify(&message, &signature).is_ok() {
            debug!("SET verified with log key {}", key.log_id);
            return Ok(());
        }
    }
    Err(EngineError::Verification(
        "Failed to verify Signed Entry Timestamp with any log key".into(),
    ))
}

pub fn leaf_hash(entry_body: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update(entry_body);
    hasher.finalize().into()
}

fn node_hash(left: &[u8], right: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Recompute a Merkle root from an audit path (RFC 9162 section 2.1.3.2).
pub fn root_from_inclusion_proof(
    index: u64,
    tree_size: u64,
    leaf: [u8; 32],
    proof: &[[u8; 32]],
) -> Option<[u8; 32]> {
    if index >= tree_size {
        return None;
    }
    let inner = (u64::BITS - (index ^ (tree_size - 1)).leading_zeros()) as usize;
    let border = index.checked_shr(inner as u32).unwrap_or(0).count_ones() as usize;
    if proof.len() != inner + border {
        return None;
    }

    let mut hash = leaf;
    for (i, sibling) in proof[..inner].iter().enumerate() {
        hash = if (index >> i) & 1 == 0 {
            node_hash(&hash, sibling)
        } else {
            node_hash(sibling, &hash)
        };
    }
    for sibling in &proof[inner..] {
        hash = node_hash(sibling, &hash);
    }
    Some(hash)
}

/// Check that the entry body is included under the proof's root hash.
pub fn verify_inclusion_proof(entry: &TlogEntry, proof: &InclusionProof) -> Result<()> {
    let body = decode_base64(&entry.body, "log entry body")?;
    let expected = decode_hash(&proof.root_hash)?;
    let hashes = proof
        .hashes
        .iter()
        .map(|h| decode_hash(h))
        .collect::<Result<Vec<_>>>()?;

    let root = root_from_inclusion_proof(proof.log_index, proof.tree_size, leaf_hash(&body), &hashes)
        .ok_or_else(|| EngineError::Verification("inclusion proof has the wrong shape".into()))?;
    if root != expected {
        return Err(EngineError::Verification(
            "Merkle inclusion proof verification failed: root hash mismatch".into(),
        ));
    }
    debug!("Merkle inclusion proof verified successfully");
    Ok(())
}

fn decode_hash(value: &str) -> Result<[u8; 32]> {
    let raw = hex::decode(value)
        .map_err(|e| EngineError::Verification(format!("Failed to decode proof hash: {}", e)))?;
    raw.try_into()
        .map_err(|_| EngineError::Verification("proof hash must be 32 bytes".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use p256::ecdsa::{SigningKey, signature::Signer};
    use p256::pkcs8::EncodePublicKey;

    fn entry(body: &[u8]) -> TlogEntry {
        TlogEntry {
            body: BASE64.encode(body),
            integrated_time: 1_700_000_000,
            log_index: 3,
            log_id: String::new(),
            signed_entry_timestamp: String::new(),
            inclusion_proof: None,
        }
    }

    #[test]
    fn canonical_payload_has_sorted_compact_keys() {
        let payload = signed_entry_payload(&TlogEntry {
            log_id: "ab".into(),
            ..entry(b"{}")
        })
        .unwrap();
        assert_eq!(
            String::from_utf8(payload).unwrap(),
            r#"{"body":"e30=","integratedTime":1700000000,"logID":"ab","logIndex":3}"#
        );
    }

    #[test]
    fn set_verifies_with_matching_key_only() {
        let signer = SigningKey::from_slice(&[5u8; 32]).unwrap();
        let der = signer.verifying_key().to_public_key_der().unwrap();
        let key = LogKey::from_der(der.as_bytes()).unwrap();

        let mut e = TlogEntry {
            log_id: key.log_id.clone(),
            ..entry(b"{}")
        };
        let sig: P256Signature = signer.sign(&signed_entry_payload(&e).unwrap());
        e.signed_entry_timestamp = BASE64.encode(sig.to_der().as_bytes());
        verify_signed_entry_timestamp(&e, &[key.clone()]).unwrap();

        let other = SigningKey::from_slice(&[6u8; 32]).unwrap();
        let other_der = other.verifying_key().to_public_key_der().unwrap();
        let other_key = LogKey::from_der(other_der.as_bytes()).unwrap();
        assert!(verify_signed_entry_timestamp(&e, &[other_key]).is_err());

        e.log_index += 1;
        assert!(verify_signed_entry_timestamp(&e, &[key]).is_err());
    }

    /// Build a tree over `leaves` and return (root, audit path for `index`).
    fn tree(leaves: &[[u8; 32]], index: usize) -> ([u8; 32], Vec<[u8; 32]>) {
        if leaves.len() == 1 {
            return (leaves[0], Vec::new());
        }
        let split = leaves.len().next_power_of_two() / 2;
        let (left, right) = leaves.split_at(split);
        if index < split {
            let (l, mut path) = tree(left, index);
            let (r, _) = tree(right, 0);
            path.push(r);
            (node_hash(&l, &r), path)
        } else {
            let (l, _) = tree(left, 0);
            let (r, mut path) = tree(right, index - split);
            path.push(l);
            (node_hash(&l, &r), path)
        }
    }

    #[test]
    fn inclusion_proofs_verify_for_every_leaf() {
        for size in 1..=9usize {
            let leaves: Vec<[u8; 32]> = (0..size).map(|i| leaf_hash(&[i as u8])).collect();
            for index in 0..size {
                let (root, path) = tree(&leaves, index);
                assert_eq!(
                    root_from_inclusion_proof(index as u64, size as u64, leaves[index], &path),
                    Some(root),
                    "size {} index {}",
                    size,
                    index
                );
            }
        }
    }

    #[test]
    fn inclusion_proof_rejects_wrong_root_and_shape() {
        let body = b"entry";
        let leaves = [leaf_hash(b"other"), leaf_hash(body)];
        let (root, path) = tree(&leaves, 1);

        let proof = InclusionProof {
            log_index: 1,
            root_hash: hex::encode(root),
            tree_size: 2,
            hashes: path.iter().map(hex::encode).collect(),
        };
        verify_inclusion_proof(&entry(body), &proof).unwrap();

        let wrong_root = InclusionProof {
            root_hash: hex::encode([0u8; 32]),
            ..proof.clone()
        };
        assert!(verify_inclusion_proof(&entry(body), &wrong_root).is_err());

        let wrong_shape = InclusionProof {
            hashes: Vec::new(),
            ..proof
        };
        assert!(verify_inclusion_proof(&entry(body), &wrong_shape).is_err());
    }
}
