#![allow(dead_code)]

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use function_integrity::bundle::{InclusionProof, RekorBundle, RekorPayload, TlogEntry};
use function_integrity::config::{EngineConfig, MemoryConfigSource, RetryConfig};
use function_integrity::digest::ArtifactDigest;
use function_integrity::enforce::{
    FunctionControl, FunctionDescriptor, MemoryFunctions, PackageType, current_result,
};
use function_integrity::model::{FunctionIdentity, ImageReference};
use function_integrity::publish::MemoryNotifier;
use function_integrity::registry::{MemoryRegistry, OCI_MANIFEST};
use function_integrity::sources::oci::{BUNDLE_ANNOTATION, CERTIFICATE_ANNOTATION, SIGNATURE_ANNOTATION};
use function_integrity::store::{MemoryObjectStore, ObjectStore};
use function_integrity::verifiers::tlog::{leaf_hash, signed_entry_payload};
use function_integrity::verifiers::trust::LogKey;
use function_integrity::verifiers::{TransparencyLog, TrustRoots};
use function_integrity::{EnforcementAction, EngineError, ResultTag, Result};
use function_integrity::Engine;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};
use p256::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
use rcgen::{
    BasicConstraints, CertificateParams, CustomExtension, DistinguishedName, DnType, IsCa, KeyPair,
    SanType,
};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const ACCOUNT: &str = "123456789012";
pub const REGION: &str = "us-east-1";
pub const TOPIC: &str = "arn:aws:sns:us-east-1:123456789012:function-integrity";
pub const ISSUER: &str = "https://token.actions.githubusercontent.com";
pub const REGISTRY_HOST: &str = "123456789012.dkr.ecr.us-east-1.amazonaws.com";

pub fn arn(name: &str) -> String {
    format!("arn:aws:lambda:{}:{}:function:{}", REGION, ACCOUNT, name)
}

pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_slice(&[seed; 32]).unwrap()
}

pub fn public_key_pem(key: &SigningKey) -> String {
    key.verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap()
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay_millis: 10,
        max_delay_millis: 100,
    }
}

pub fn keyed_config(key: &SigningKey, action: EnforcementAction) -> EngineConfig {
    EngineConfig {
        region: REGION.into(),
        action,
        public_key: public_key_pem(key),
        sns_topic_arn: TOPIC.into(),
        retry: Some(fast_retry()),
        ..Default::default()
    }
}

pub fn keyless_config(patterns: &[&str], action: EnforcementAction) -> EngineConfig {
    EngineConfig {
        region: REGION.into(),
        action,
        is_keyless: true,
        oidc_issuer: ISSUER.into(),
        subject_patterns: patterns.iter().map(|p| p.to_string()).collect(),
        sns_topic_arn: TOPIC.into(),
        retry: Some(fast_retry()),
        ..Default::default()
    }
}

/// A CloudTrail code-update record as delivered by the event bus.
pub fn deployment_event(function: &FunctionIdentity, event_id: &str) -> Value {
    json!({
        "version": "0",
        "id": event_id,
        "detail-type": "AWS API Call via CloudTrail",
        "source": "aws.lambda",
        "time": "2024-05-01T10:00:05Z",
        "region": REGION,
        "detail": {
            "eventName": "UpdateFunctionCode20150331v2",
            "eventTime": "2024-05-01T10:00:00Z",
            "eventID": format!("trail-{}", event_id),
            "requestParameters": { "functionName": function.name() },
            "responseElements": { "functionArn": function.as_str() }
        }
    })
}

/// Wrap events the way a queue delivers them.
pub fn queue_envelope(events: &[Value]) -> Value {
    let records: Vec<Value> = events
        .iter()
        .enumerate()
        .map(|(i, e)| {
            json!({
                "messageId": format!("msg-{}", i),
                "body": serde_json::to_string(e).unwrap(),
            })
        })
        .collect();
    json!({ "Records": records })
}

/// Object store that fails with a transient error a set number of times.
pub struct FlakyStore {
    inner: MemoryObjectStore,
    failures_left: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: MemoryObjectStore, failures: u32) -> Self {
        Self {
            inner,
            failures_left: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(EngineError::ArtifactUnavailable(format!("{}: 503", key)));
        }
        self.inner.get(key).await
    }

    fn store_type(&self) -> &'static str {
        "flaky"
    }
}

/// Object store whose reads never complete.
pub struct StalledStore;

#[async_trait]
impl ObjectStore for StalledStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        std::future::pending().await
    }

    fn store_type(&self) -> &'static str {
        "stalled"
    }
}

/// Everything an engine under test talks to, in memory.
pub struct Harness {
    pub config: MemoryConfigSource,
    pub functions: MemoryFunctions,
    pub packages: MemoryObjectStore,
    pub signatures: MemoryObjectStore,
    pub registry: MemoryRegistry,
    pub notifier: MemoryNotifier,
    pub engine: Arc<Engine>,
}

impl Harness {
    pub fn new(config: &EngineConfig) -> Self {
        Self::build(config, shared_packages, |b| b)
    }

    pub fn keyless(config: &EngineConfig, roots: TrustRoots, log: Arc<dyn TransparencyLog>) -> Self {
        Self::build(config, shared_packages, move |b| {
            b.with_trust_roots(roots).with_transparency_log(log)
        })
    }

    /// Serve code packages through `wrap`, applied to the harness package store.
    pub fn with_package_store(
        config: &EngineConfig,
        wrap: impl FnOnce(MemoryObjectStore) -> Arc<dyn ObjectStore>,
    ) -> Self {
        Self::build(config, wrap, |b| b)
    }

    fn build(
        config: &EngineConfig,
        wrap_packages: impl FnOnce(MemoryObjectStore) -> Arc<dyn ObjectStore>,
        customize: impl FnOnce(function_integrity::EngineBuilder) -> function_integrity::EngineBuilder,
    ) -> Self {
        let config = MemoryConfigSource::from_config(config).unwrap();
        let functions = MemoryFunctions::new();
        let packages = MemoryObjectStore::new();
        let signatures = MemoryObjectStore::new();
        let registry = MemoryRegistry::new();
        let notifier = MemoryNotifier::new();

        let package_store = wrap_packages(packages.clone());
        let builder = Engine::builder(
            Arc::new(config.clone()),
            Arc::new(functions.clone()),
            Arc::new(notifier.clone()),
        )
        .with_packages(package_store)
        .with_signatures(Arc::new(signatures.clone()))
        .with_registry(Arc::new(registry.clone()));
        let engine = Arc::new(customize(builder).build().unwrap());

        Self {
            config,
            functions,
            packages,
            signatures,
            registry,
            notifier,
            engine,
        }
    }

    /// Deploy a zip function whose package holds `package`.
    pub fn deploy_zip(&self, name: &str, package: &[u8], tags: &[&str]) -> FunctionIdentity {
        let identity = FunctionIdentity::new(arn(name));
        let location = format!("packages/{}.zip", name);
        self.packages.put(location.clone(), package.to_vec());
        self.functions.deploy(FunctionDescriptor {
            identity: identity.clone(),
            package_type: PackageType::Zip,
            code_location: Some(location),
            code_sha256: Some(BASE64.encode(ArtifactDigest::of_bytes(package).as_bytes())),
            image_uri: None,
            resolved_image_uri: None,
            tags: tag_map(tags),
        });
        identity
    }

    /// Deploy an image function; returns its identity and manifest digest.
    pub fn deploy_image(&self, name: &str, tags: &[&str]) -> (FunctionIdentity, ArtifactDigest) {
        let identity = FunctionIdentity::new(arn(name));
        let uri = format!("{}/{}:v1", REGISTRY_HOST, name);
        let image = ImageReference::parse(&uri).unwrap();

        let config = self.registry.put_blob(format!("{{\"app\":\"{}\"}}", name));
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config.to_string(),
                "size": 12
            },
            "layers": []
        });
        let digest = self.registry.put_manifest(
            &image,
            Some("v1"),
            serde_json::to_vec(&manifest).unwrap(),
            OCI_MANIFEST,
        );

        self.functions.deploy(FunctionDescriptor {
            identity: identity.clone(),
            package_type: PackageType::Image,
            code_location: None,
            code_sha256: None,
            image_uri: Some(uri),
            resolved_image_uri: None,
            tags: tag_map(tags),
        });
        (identity, digest)
    }

    /// Store a detached keyed signature over `package`, as `cosign sign-blob` would.
    pub fn sign_package(&self, key: &SigningKey, package: &[u8]) {
        let (object, signature) = detached_signature(key, package);
        self.signatures.put(object, signature);
    }

    /// Attach a simple-signing signature to an image, as `cosign sign` would.
    pub fn sign_image(
        &self,
        name: &str,
        digest: &ArtifactDigest,
        key: &SigningKey,
        certificate: Option<&str>,
        bundle: Option<&RekorBundle>,
    ) {
        let layer = self.signature_layer(name, digest, key, certificate, bundle);
        self.put_signature_layers(name, digest, vec![layer]);
    }

    /// One cosign signature layer over the simple-signing payload for `digest`.
    pub fn signature_layer(
        &self,
        name: &str,
        digest: &ArtifactDigest,
        key: &SigningKey,
        certificate: Option<&str>,
        bundle: Option<&RekorBundle>,
    ) -> Value {
        let image = ImageReference::parse(&format!("{}/{}", REGISTRY_HOST, name)).unwrap();
        let payload = simple_signing_payload(&image, digest);
        let signature: Signature = key.sign(&payload);
        let layer = self.registry.put_blob(payload.clone());

        let mut annotations = serde_json::Map::new();
        annotations.insert(
            SIGNATURE_ANNOTATION.into(),
            BASE64.encode(signature.to_der().as_bytes()).into(),
        );
        if let Some(cert) = certificate {
            annotations.insert(CERTIFICATE_ANNOTATION.into(), cert.into());
        }
        if let Some(bundle) = bundle {
            annotations.insert(
                BUNDLE_ANNOTATION.into(),
                serde_json::to_string(bundle).unwrap().into(),
            );
        }

        json!({
            "mediaType": "application/vnd.dev.cosign.simplesigning.v1+json",
            "digest": layer.to_string(),
            "size": payload.len(),
            "annotations": annotations
        })
    }

    /// Publish `layers` under the cosign signature tag of `digest`.
    pub fn put_signature_layers(&self, name: &str, digest: &ArtifactDigest, layers: Vec<Value>) {
        let image = ImageReference::parse(&format!("{}/{}", REGISTRY_HOST, name)).unwrap();
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "layers": layers
        });
        self.registry.put_manifest(
            &image,
            Some(&digest.cosign_signature_tag()),
            serde_json::to_vec(&manifest).unwrap(),
            OCI_MANIFEST,
        );
    }

    pub async fn concurrency(&self, function: &FunctionIdentity) -> Option<u32> {
        self.functions.reserved_concurrency(function).await.unwrap()
    }

    pub async fn result_tag(&self, function: &FunctionIdentity) -> Option<ResultTag> {
        current_result(&self.functions, function).await.unwrap()
    }
}

/// Object key and base64 body of a detached signature over `package`.
pub fn detached_signature(key: &SigningKey, package: &[u8]) -> (String, String) {
    let signature: Signature = key.sign(package);
    let digest = ArtifactDigest::of_bytes(package);
    (
        format!("{}.sig", digest.hex()),
        BASE64.encode(signature.to_der().as_bytes()),
    )
}

fn shared_packages(store: MemoryObjectStore) -> Arc<dyn ObjectStore> {
    Arc::new(store)
}

fn tag_map(keys: &[&str]) -> BTreeMap<String, String> {
    keys.iter()
        .map(|k| (k.to_string(), "true".to_string()))
        .collect()
}

pub fn simple_signing_payload(image: &ImageReference, digest: &ArtifactDigest) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "critical": {
            "identity": { "docker-reference": format!("{}/{}", image.registry, image.repository) },
            "image": { "docker-manifest-digest": digest.to_string() },
            "type": "cosign container image signature"
        },
        "optional": null
    }))
    .unwrap()
}

fn der_utf8_string(value: &str) -> Vec<u8> {
    assert!(value.len() < 128, "short-form length only");
    let mut der = vec![0x0c, value.len() as u8];
    der.extend_from_slice(value.as_bytes());
    der
}

fn name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "function-integrity tests");
    dn.push(DnType::CommonName, common_name);
    dn
}

/// A throwaway certificate authority issuing short-lived signing certificates.
pub struct TestCa {
    key: KeyPair,
    cert: rcgen::Certificate,
}

/// A signing certificate and its private key.
pub struct SigningIdentity {
    pub certificate_pem: String,
    pub key: SigningKey,
}

impl SigningIdentity {
    pub fn sign_digest(&self, digest: &ArtifactDigest) -> Vec<u8> {
        let signature: Signature = self.key.sign_prehash(digest.as_bytes()).unwrap();
        signature.to_der().as_bytes().to_vec()
    }
}

impl TestCa {
    pub fn new() -> Self {
        Self::root(BasicConstraints::Unconstrained)
    }

    /// A root that allows at most `path_len` intermediates below it.
    pub fn constrained(path_len: u8) -> Self {
        Self::root(BasicConstraints::Constrained(path_len))
    }

    fn root(constraints: BasicConstraints) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name = name("sigstore");
        params.is_ca = IsCa::Ca(constraints);
        let cert = params.self_signed(&key).unwrap();
        Self { key, cert }
    }

    /// An intermediate CA signed by this one.
    pub fn intermediate(&self) -> TestCa {
        self.child("sigstore-intermediate", IsCa::Ca(BasicConstraints::Unconstrained))
    }

    /// An ordinary end-entity certificate and its key, wrapped so it can try
    /// to issue certificates of its own.
    pub fn end_entity(&self) -> TestCa {
        self.child("workload", IsCa::ExplicitNoCa)
    }

    fn child(&self, common_name: &str, is_ca: IsCa) -> TestCa {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name = name(common_name);
        params.is_ca = is_ca;
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        TestCa { key, cert }
    }

    pub fn pem(&self) -> String {
        self.cert.pem()
    }

    /// Issue a certificate for `email`, minted by OIDC `issuer`.
    pub fn issue(&self, issuer: &str, email: &str) -> SigningIdentity {
        let leaf_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name = name("signer");
        params.subject_alt_names = vec![SanType::Rfc822Name(email.try_into().unwrap())];
        params.custom_extensions = vec![CustomExtension::from_oid_content(
            &[1, 3, 6, 1, 4, 1, 57264, 1, 8],
            der_utf8_string(issuer),
        )];
        let cert = params.signed_by(&leaf_key, &self.cert, &self.key).unwrap();

        SigningIdentity {
            certificate_pem: cert.pem(),
            key: SigningKey::from_pkcs8_der(&leaf_key.serialize_der()).unwrap(),
        }
    }
}

/// In-memory transparency log that signs its entries like Rekor does.
pub struct FakeRekor {
    key: SigningKey,
    entries: Mutex<Vec<(ArtifactDigest, TlogEntry)>>,
    pub lookups: AtomicUsize,
}

impl FakeRekor {
    pub fn new() -> Self {
        Self {
            key: signing_key(42),
            entries: Mutex::new(Vec::new()),
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn public_key_pem(&self) -> String {
        public_key_pem(&self.key)
    }

    pub fn trust_roots(&self, ca: &TestCa) -> TrustRoots {
        TrustRoots::from_pems(&ca.pem(), &self.public_key_pem()).unwrap()
    }

    /// Record a hashedrekord entry and return the offline bundle for it.
    pub fn record(&self, prehash: &ArtifactDigest, signature: &[u8], certificate_pem: &str) -> RekorBundle {
        let body = json!({
            "apiVersion": "0.0.1",
            "kind": "hashedrekord",
            "spec": {
                "data": { "hash": { "algorithm": "sha256", "value": prehash.hex() } },
                "signature": {
                    "content": BASE64.encode(signature),
                    "publicKey": { "content": BASE64.encode(certificate_pem) }
                }
            }
        });
        let body_bytes = serde_json::to_vec(&body).unwrap();
        let log_id = LogKey::from_pem(&self.public_key_pem()).unwrap().log_id;

        let mut entries = self.entries.lock().unwrap();
        let mut entry = TlogEntry {
            body: BASE64.encode(&body_bytes),
            integrated_time: chrono::Utc::now().timestamp(),
            log_index: entries.len() as i64,
            log_id,
            signed_entry_timestamp: String::new(),
            inclusion_proof: Some(InclusionProof {
                log_index: 0,
                root_hash: hex::encode(leaf_hash(&body_bytes)),
                tree_size: 1,
                hashes: Vec::new(),
            }),
        };
        let set: Signature = self.key.sign(&signed_entry_payload(&entry).unwrap());
        entry.signed_entry_timestamp = BASE64.encode(set.to_der().as_bytes());
        entries.push((prehash.clone(), entry.clone()));

        RekorBundle {
            signed_entry_timestamp: entry.signed_entry_timestamp.clone(),
            payload: RekorPayload {
                body: entry.body.clone(),
                integrated_time: entry.integrated_time,
                log_index: entry.log_index,
                log_id: entry.log_id.clone(),
            },
        }
    }
}

#[async_trait]
impl TransparencyLog for FakeRekor {
    async fn find_entries(&self, prehash: &ArtifactDigest) -> Result<Vec<TlogEntry>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .filter(|(hash, _)| hash == prehash)
            .map(|(_, entry)| entry.clone())
            .collect())
    }
}

/// Unpack an enforced cycle, panicking on any other report.
pub fn expect_enforced(
    result: Result<function_integrity::CycleReport>,
) -> (
    function_integrity::VerificationOutcome,
    function_integrity::EnforcementRecord,
    bool,
) {
    match result.unwrap() {
        function_integrity::CycleReport::Enforced {
            outcome,
            record,
            published,
        } => (outcome, record, published),
        other => panic!("expected an enforced cycle, got {:?}", other),
    }
}
