//! Parsing of cosign signature material: bundles, Rekor entries and
//! simple-signing payloads.

use crate::digest::ArtifactDigest;
use crate::{EngineError, Result};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `cosign sign-blob --bundle` output.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CosignBundle {
    pub base64_signature: String,
    /// Signing certificate, PEM or base64 of PEM.
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub rekor_bundle: Option<RekorBundle>,
}

impl CosignBundle {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| EngineError::Verification(format!("Failed to parse cosign bundle: {}", e)))
    }

    pub fn signature(&self) -> Result<Vec<u8>> {
        decode_base64(&self.base64_signature, "signature")
    }

    pub fn certificate_pem(&self) -> Result<Option<String>> {
        self.cert.as_deref().map(decode_pem_text).transpose()
    }
}

/// Offline proof of inclusion as attached by cosign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekorBundle {
    #[serde(rename = "SignedEntryTimestamp")]
    pub signed_entry_timestamp: String,
    #[serde(rename = "Payload")]
    pub payload: RekorPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RekorPayload {
    pub body: String,
    pub integrated_time: i64,
    pub log_index: i64,
    #[serde(rename = "logID")]
    pub log_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InclusionProof {
    pub log_index: u64,
    pub root_hash: String,
    pub tree_size: u64,
    #[serde(default)]
    pub hashes: Vec<String>,
}

/// A transparency-log entry in the shape verification works on, whether it
/// came from an attached bundle or from the log's API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlogEntry {
    /// Base64 canonicalized entry body.
    pub body: String,
    pub integrated_time: i64,
    pub log_index: i64,
    pub log_id: String,
    /// Base64 signature over the canonical entry.
    pub signed_entry_timestamp: String,
    pub inclusion_proof: Option<InclusionProof>,
}

impl From<&RekorBundle> for TlogEntry {
    fn from(bundle: &RekorBundle) -> Self {
        Self {
            body: bundle.payload.body.clone(),
            integrated_time: bundle.payload.integrated_time,
            log_index: bundle.payload.log_index,
            log_id: bundle.payload.log_id.clone(),
            signed_entry_timestamp: bundle.signed_entry_timestamp.clone(),
            inclusion_proof: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiLogEntry {
    body: String,
    integrated_time: i64,
    log_index: i64,
    #[serde(rename = "logID")]
    log_id: String,
    verification: Option<ApiVerification>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiVerification {
    signed_entry_timestamp: Option<String>,
    inclusion_proof: Option<InclusionProof>,
}

/// Parse a `GET /api/v1/log/entries/{uuid}` response (`{uuid: entry}`).
pub fn parse_log_entries(response: &Value) -> Result<Vec<TlogEntry>> {
    let entries = response
        .as_object()
        .ok_or_else(|| EngineError::Verification("log entry response is not an object".into()))?;

    let mut parsed = Vec::with_capacity(entries.len());
    for (uuid, entry) in entries {
        let entry: ApiLogEntry = serde_json::from_value(entry.clone()).map_err(|e| {
            EngineError::Verification(format!("Failed to parse log entry {}: {}", uuid, e))
        })?;
        let verification = entry.verification.ok_or_else(|| {
            EngineError::Verification(format!("log entry {} has no verification data", uuid))
        })?;
        let signed_entry_timestamp = verification.signed_entry_timestamp.ok_or_else(|| {
            EngineError::Verification(format!("log entry {} has no signed entry timestamp", uuid))
        })?;
        parsed.push(TlogEntry {
            body: entry.body,
            integrated_time: entry.integrated_time,
            log_index: entry.log_index,
            log_id: entry.log_id,
            signed_entry_timestamp,
            inclusion_proof: verification.inclusion_proof,
        });
    }
    Ok(parsed)
}

/// The fields of a `hashedrekord` entry that bind it to an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedRekord {
    pub digest: ArtifactDigest,
    pub signature: Vec<u8>,
    /// PEM certificate or public key recorded with the signature.
    pub verifier_pem: String,
}

impl HashedRekord {
    /// Decode a base64 entry body.
    pub fn from_body(body: &str) -> Result<Self> {
        let raw = decode_base64(body, "log entry body")?;
        let entry: Value = serde_json::from_slice(&raw)
            .map_err(|e| EngineError::Verification(format!("Failed to parse log entry body: {}", e)))?;

        let kind = entry.get("kind").and_then(|k| k.as_str()).unwrap_or("");
        if kind != "hashedrekord" {
            return Err(EngineError::Verification(format!(
                "unsupported log entry kind: {}",
                kind
            )));
        }

        let spec = entry
            .get("spec")
            .ok_or_else(|| EngineError::Verification("log entry has no spec".into()))?;

        let hash = spec
            .pointer("/data/hash")
            .ok_or_else(|| EngineError::Verification("log entry has no data hash".into()))?;
        let algorithm = hash.get("algorithm").and_then(|a| a.as_str()).unwrap_or("");
        let value = hash.get("value").and_then(|v| v.as_str()).unwrap_or("");
        let digest = ArtifactDigest::parse(&format!("{}:{}", algorithm, value))?;

        let signature = spec
            .pointer("/signature/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| EngineError::Verification("log entry has no signature".into()))?;
        let verifier = spec
            .pointer("/signature/publicKey/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| EngineError::Verification("log entry has no public key".into()))?;

        Ok(Self {
            digest,
            signature: decode_base64(signature, "log entry signature")?,
            verifier_pem: decode_pem_text(verifier)?,
        })
    }
}

/// Extract `critical.image.docker-manifest-digest` from a simple-signing payload.
pub fn simple_signing_digest(payload: &[u8]) -> Result<ArtifactDigest> {
    let payload: Value = serde_json::from_slice(payload).map_err(|e| {
        EngineError::Verification(format!("Failed to parse simple-signing payload: {}", e))
    })?;
    let digest = payload
        .pointer("/critical/image/docker-manifest-digest")
        .and_then(|d| d.as_str())
        .ok_or_else(|| {
            EngineError::Verification("simple-signing payload has no manifest digest".into())
        })?;
    ArtifactDigest::parse(digest)
}

pub(crate) fn decode_base64(value: &str, what: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value.trim())
        .map_err(|e| EngineError::Verification(format!("Failed to decode {}: {}", what, e)))
}

/// Accept PEM text as-is, or base64 that decodes to PEM.
pub(crate) fn decode_pem_text(value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.starts_with("-----BEGIN") {
        return Ok(trimmed.to_string());
    }
    let raw = decode_base64(trimmed, "PEM")?;
    let text = String::from_utf8(raw)
        .map_err(|e| EngineError::Verification(format!("PEM is not UTF-8: {}", e)))?;
    if !text.trim_start().starts_with("-----BEGIN") {
        return Err(EngineError::Verification("value is not PEM encoded".into()));
    }
    Ok(text)
}
