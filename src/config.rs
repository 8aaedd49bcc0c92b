//! Runtime policy configuration.
//!
//! The engine is configured through a base64-encoded YAML document, normally in the
//! `CONFIGURATION` environment variable. A fresh [`TrustPolicy`] is resolved at the
//! start of every verification cycle, so rewriting the blob reconfigures the next
//! cycle without a restart.

use crate::retry::RetryPolicy;
use crate::{EngineError, Result};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use p256::ecdsa::VerifyingKey as P256VerifyingKey;
use p256::pkcs8::DecodePublicKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

pub const CONFIGURATION_ENV: &str = "CONFIGURATION";
pub const DEFAULT_REKOR_URL: &str = "https://rekor.sigstore.dev";
const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

/// Where the encoded configuration blob comes from.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Return the current base64-encoded configuration blob.
    async fn load(&self) -> Result<String>;
}

/// Reads the blob from an environment variable on every load.
#[derive(Debug, Clone)]
pub struct EnvConfigSource {
    var: String,
}

impl EnvConfigSource {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvConfigSource {
    fn default() -> Self {
        Self::new(CONFIGURATION_ENV)
    }
}

#[async_trait]
impl ConfigSource for EnvConfigSource {
    async fn load(&self) -> Result<String> {
        std::env::var(&self.var)
            .map_err(|e| EngineError::InvalidConfig(format!("{}: {}", self.var, e)))
    }
}

/// In-process blob that operators (or tests) can rewrite at runtime.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigSource {
    blob: Arc<RwLock<String>>,
}

impl MemoryConfigSource {
    pub fn new(blob: impl Into<String>) -> Self {
        Self {
            blob: Arc::new(RwLock::new(blob.into())),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Ok(Self::new(config.encode()?))
    }

    /// Replace the blob; the next cycle picks it up.
    pub fn set(&self, blob: impl Into<String>) {
        let mut guard = self.blob.write().unwrap_or_else(|e| e.into_inner());
        *guard = blob.into();
    }

    /// Rewrite the configuration through its decoded form.
    pub fn update(&self, f: impl FnOnce(&mut EngineConfig)) -> Result<()> {
        let current = self.blob.read().unwrap_or_else(|e| e.into_inner()).clone();
        let mut config = EngineConfig::decode(&current)?;
        f(&mut config);
        self.set(config.encode()?);
        Ok(())
    }
}

#[async_trait]
impl ConfigSource for MemoryConfigSource {
    async fn load(&self) -> Result<String> {
        Ok(self.blob.read().unwrap_or_else(|e| e.into_inner()).clone())
    }
}

/// Wire form of the configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub region: String,
    /// Bucket holding detached code-package signatures.
    pub bucket: String,
    pub action: EnforcementAction,
    pub is_keyless: bool,
    pub public_key: String,
    pub sns_topic_arn: String,
    pub included_func_tag_keys: Vec<String>,
    pub oidc_issuer: String,
    pub subject_patterns: Vec<String>,
    pub rekor_url: String,
    pub fulcio_root_pem: String,
    pub rekor_public_key_pem: String,
    pub timeout_seconds: Option<u64>,
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_millis: u64,
    pub max_delay_millis: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_millis: policy.base_delay.as_millis() as u64,
            max_delay_millis: policy.max_delay.as_millis() as u64,
        }
    }
}

impl EngineConfig {
    pub fn decode(blob: &str) -> Result<Self> {
        let yaml = BASE64
            .decode(blob.trim())
            .map_err(|e| EngineError::InvalidConfig(format!("configuration is not base64: {}", e)))?;
        serde_yaml::from_slice(&yaml)
            .map_err(|e| EngineError::InvalidConfig(format!("configuration is not valid YAML: {}", e)))
    }

    pub fn encode(&self) -> Result<String> {
        let yaml = serde_yaml::to_string(self)?;
        Ok(BASE64.encode(yaml.as_bytes()))
    }

    /// Validate and convert into the policy a cycle runs under.
    pub fn into_policy(self) -> Result<TrustPolicy> {
        let public_key = self.public_key.trim();
        let trust = if self.is_keyless {
            if !public_key.is_empty() {
                return Err(EngineError::InvalidConfig(
                    "publicKey must be empty in keyless mode".into(),
                ));
            }
            let issuer = self.oidc_issuer.trim();
            if issuer.is_empty() {
                return Err(EngineError::InvalidConfig(
                    "oidcIssuer is required in keyless mode".into(),
                ));
            }
            let subject_patterns: Vec<String> = self
                .subject_patterns
                .iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if subject_patterns.is_empty() {
                return Err(EngineError::InvalidConfig(
                    "at least one subjectPatterns entry is required in keyless mode".into(),
                ));
            }
            let rekor_url = match self.rekor_url.trim() {
                "" => DEFAULT_REKOR_URL.to_string(),
                url => url.trim_end_matches('/').to_string(),
            };
            TrustMode::Keyless {
                constraints: IdentityConstraints {
                    issuer: issuer.to_string(),
                    subject_patterns,
                    rekor_url,
                    fulcio_root_pem: non_empty(&self.fulcio_root_pem),
                    rekor_public_key_pem: non_empty(&self.rekor_public_key_pem),
                },
            }
        } else {
            if public_key.is_empty() {
                return Err(EngineError::InvalidConfig(
                    "publicKey is required when isKeyless is false".into(),
                ));
            }
            TrustMode::Keyed {
                key: PublicKey::parse(public_key)?,
            }
        };

        let timeout_seconds = self.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS);
        if timeout_seconds == 0 {
            return Err(EngineError::InvalidConfig("timeoutSeconds must be positive".into()));
        }

        let retry = self.retry.unwrap_or_default();
        if retry.max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "retry.maxAttempts must be at least 1".into(),
            ));
        }

        Ok(TrustPolicy {
            region: self.region,
            signature_bucket: non_empty(&self.bucket),
            trust,
            action: self.action,
            scope: ScopeFilter::new(self.included_func_tag_keys),
            notification_channel: non_empty(&self.sns_topic_arn),
            cycle_timeout: Duration::from_secs(timeout_seconds),
            retry: RetryPolicy {
                max_attempts: retry.max_attempts,
                base_delay: Duration::from_millis(retry.base_delay_millis),
                max_delay: Duration::from_millis(retry.max_delay_millis),
            },
        })
    }
}

fn non_empty(s: &str) -> Option<String> {
    match s.trim() {
        "" => None,
        v => Some(v.to_string()),
    }
}

/// What to do when an artifact does not verify.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementAction {
    Block,
    #[default]
    #[serde(alias = "detect")]
    Alert,
    Allow,
}

impl EnforcementAction {
    /// Whether infrastructure failures must be treated as verification failures.
    pub fn fails_closed(self) -> bool {
        self == EnforcementAction::Block
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Keyed,
    Keyless,
}

/// A static ECDSA P-256 verification key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub key: P256VerifyingKey,
    pub pem: String,
}

impl PublicKey {
    /// Parse a PEM key, or base64 of a PEM key.
    pub fn parse(input: &str) -> Result<Self> {
        let pem = if input.contains("-----BEGIN") {
            input.to_string()
        } else {
            let decoded = BASE64.decode(input).map_err(|e| {
                EngineError::InvalidConfig(format!("publicKey is neither PEM nor base64: {}", e))
            })?;
            String::from_utf8(decoded)
                .map_err(|e| EngineError::InvalidConfig(format!("publicKey is not UTF-8: {}", e)))?
        };
        let key = P256VerifyingKey::from_public_key_pem(pem.trim()).map_err(|e| {
            EngineError::InvalidConfig(format!("publicKey is not a P-256 public key: {}", e))
        })?;
        Ok(Self { key, pem })
    }
}

/// Who may sign in keyless mode, and where signatures must be logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConstraints {
    pub issuer: String,
    /// Certificate subject patterns; `*` matches any substring.
    pub subject_patterns: Vec<String>,
    pub rekor_url: String,
    pub fulcio_root_pem: Option<String>,
    pub rekor_public_key_pem: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustMode {
    Keyed { key: PublicKey },
    Keyless { constraints: IdentityConstraints },
}

/// Selects which functions this engine instance monitors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFilter {
    included_tag_keys: Vec<String>,
}

impl ScopeFilter {
    pub fn new(keys: Vec<String>) -> Self {
        let included_tag_keys = keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        Self { included_tag_keys }
    }

    /// In scope when no keys are configured, or the function carries any of them.
    pub fn includes(&self, tags: &BTreeMap<String, String>) -> bool {
        self.included_tag_keys.is_empty()
            || self.included_tag_keys.iter().any(|k| tags.contains_key(k))
    }
}

/// Immutable policy snapshot for one verification cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustPolicy {
    pub region: String,
    pub signature_bucket: Option<String>,
    pub trust: TrustMode,
    pub action: EnforcementAction,
    pub scope: ScopeFilter,
    pub notification_channel: Option<String>,
    pub cycle_timeout: Duration,
    pub retry: RetryPolicy,
}

impl TrustPolicy {
    pub fn mode(&self) -> Mode {
        match self.trust {
            TrustMode::Keyed { .. } => Mode::Keyed,
            TrustMode::Keyless { .. } => Mode::Keyless,
        }
    }
}

/// Resolve a fresh policy snapshot from `source`.
pub async fn resolve_policy(source: &dyn ConfigSource) -> Result<TrustPolicy> {
    let blob = source.load().await?;
    EngineConfig::decode(&blob)?.into_policy()
}
