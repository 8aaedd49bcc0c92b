//! The verification cycle: intake, fetch, digest, verify, enforce, publish.
//!
//! Every event runs as an independent cycle under a fresh policy snapshot. The
//! engine holds no state shared between cycles beyond its collaborators and a
//! cache of resolved trust roots.

use crate::config::{ConfigSource, IdentityConstraints, TrustMode, TrustPolicy, resolve_policy};
use crate::digest::compute_digest;
use crate::enforce::{FunctionControl, PolicyEnforcer};
use crate::event::{EventIntake, parse_event, unwrap_envelope};
use crate::fetch::{ArtifactFetcher, FetchedArtifact};
use crate::model::{
    EnforcementRecord, FunctionIdentity, Verdict, VerificationOutcome, VerificationRequest,
};
use crate::publish::{Notifier, ResultMessage};
use crate::registry::{ImageRegistry, OciRegistry};
use crate::retry::{Clock, TokioClock, with_backoff};
use crate::sources::{ArtifactRef, ObjectStoreSource, OciSource, SignatureSource};
use crate::store::{HttpObjectStore, ObjectStore};
use crate::verifiers::{RekorClient, Strategy, TransparencyLog, TrustRoots};
use crate::{EngineError, Result};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

/// How one event was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleReport {
    /// Not a deployment event, or the function is outside the monitored scope.
    Skipped {
        function: Option<FunctionIdentity>,
        reason: String,
    },
    /// An outcome was reached and enforced.
    Enforced {
        outcome: VerificationOutcome,
        record: EnforcementRecord,
        /// Whether the result notification was delivered.
        published: bool,
    },
    /// Verification could not complete and the policy does not fail closed.
    Dropped {
        function: FunctionIdentity,
        reason: String,
    },
}

type TrustKey = (Option<String>, Option<String>);

pub struct Engine {
    config: Arc<dyn ConfigSource>,
    functions: Arc<dyn FunctionControl>,
    notifier: Arc<dyn Notifier>,
    packages: Arc<dyn ObjectStore>,
    signatures: Option<Arc<dyn ObjectStore>>,
    /// An explicitly configured package store, also searched for signatures.
    package_store: Option<Arc<dyn ObjectStore>>,
    registry: Arc<dyn ImageRegistry>,
    transparency_log: Option<Arc<dyn TransparencyLog>>,
    trust_roots: Option<TrustRoots>,
    trust_cache: Mutex<Option<(TrustKey, TrustRoots)>>,
    clock: Arc<dyn Clock>,
}

pub struct EngineBuilder {
    config: Arc<dyn ConfigSource>,
    functions: Arc<dyn FunctionControl>,
    notifier: Arc<dyn Notifier>,
    packages: Option<Arc<dyn ObjectStore>>,
    signatures: Option<Arc<dyn ObjectStore>>,
    registry: Option<Arc<dyn ImageRegistry>>,
    transparency_log: Option<Arc<dyn TransparencyLog>>,
    trust_roots: Option<TrustRoots>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    /// Where code packages are downloaded from. Defaults to plain HTTP(S)
    /// fetches of the platform-provided package URL.
    pub fn with_packages(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.packages = Some(store);
        self
    }

    /// Where detached code-package signatures live. Defaults to the policy's
    /// signature bucket, then to a package store set with `with_packages`.
    pub fn with_signatures(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.signatures = Some(store);
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn ImageRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use this log instead of the policy's Rekor endpoint.
    pub fn with_transparency_log(mut self, log: Arc<dyn TransparencyLog>) -> Self {
        self.transparency_log = Some(log);
        self
    }

    /// Use these anchors instead of resolving them from the policy.
    pub fn with_trust_roots(mut self, roots: TrustRoots) -> Self {
        self.trust_roots = Some(roots);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let package_store = self.packages;
        let packages = match &package_store {
            Some(store) => Arc::clone(store),
            None => Arc::new(HttpObjectStore::new("", None)?),
        };
        let registry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(OciRegistry::new(None)?),
        };
        Ok(Engine {
            config: self.config,
            functions: self.functions,
            notifier: self.notifier,
            packages,
            signatures: self.signatures,
            package_store,
            registry,
            transparency_log: self.transparency_log,
            trust_roots: self.trust_roots,
            trust_cache: Mutex::new(None),
            clock: self.clock.unwrap_or_else(|| Arc::new(TokioClock)),
        })
    }
}

impl Engine {
    pub fn builder(
        config: Arc<dyn ConfigSource>,
        functions: Arc<dyn FunctionControl>,
        notifier: Arc<dyn Notifier>,
    ) -> EngineBuilder {
        EngineBuilder {
            config,
            functions,
            notifier,
            packages: None,
            signatures: None,
            registry: None,
            transparency_log: None,
            trust_roots: None,
            clock: None,
        }
    }

    /// Handle a raw payload: one event, or a queue envelope of many.
    ///
    /// Envelope records run as concurrent, independent cycles; results are
    /// returned in record order.
    pub async fn handle_payload(self: &Arc<Self>, payload: &Value) -> Vec<Result<CycleReport>> {
        let events = unwrap_envelope(payload);
        let mut results: Vec<Option<Result<CycleReport>>> = Vec::with_capacity(events.len());

        let mut set = JoinSet::new();
        for (index, event) in events.into_iter().enumerate() {
            match event {
                Ok(event) => {
                    let engine = Arc::clone(self);
                    set.spawn(async move { (index, engine.handle_event(&event).await) });
                    results.push(None);
                }
                Err(e) => {
                    warn!("Skipping queue record {}: {}", index, e);
                    results.push(Some(Err(e)));
                }
            }
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => error!("Verification cycle task failed: {}", e),
            }
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(EngineError::Provider("cycle task aborted".into()))))
            .collect()
    }

    /// Handle one deployment event.
    pub async fn handle_event(&self, event: &Value) -> Result<CycleReport> {
        let Some(deployment) = parse_event(event)? else {
            return Ok(CycleReport::Skipped {
                function: None,
                reason: "not a deployment event".into(),
            });
        };
        let intake_id = deployment.event_id.as_deref().unwrap_or("intake");

        let policy = resolve_policy(self.config.as_ref())
            .await
            .map_err(|e| e.in_cycle(&deployment.function, intake_id))?;

        let intake = EventIntake::new(self.functions.as_ref());
        let request = with_backoff(&policy.retry, self.clock.as_ref(), "describe function", || {
            intake.intake(&deployment, &policy)
        })
        .await
        .map_err(|e| e.in_cycle(&deployment.function, intake_id))?;

        match request {
            Some(request) => self.run_cycle(&request, &policy).await,
            None => Ok(CycleReport::Skipped {
                function: Some(deployment.function),
                reason: "outside the monitored scope".into(),
            }),
        }
    }

    /// Verify, enforce and publish for one request under `policy`.
    pub async fn run_cycle(
        &self,
        request: &VerificationRequest,
        policy: &TrustPolicy,
    ) -> Result<CycleReport> {
        let cycle_id = request.cycle_id();
        info!(
            "Cycle {}: verifying {} ({:?}, {:?} mode, action {:?})",
            cycle_id,
            request.function_identity,
            request.artifact_kind(),
            policy.mode(),
            policy.action
        );

        let verdict = match tokio::time::timeout(policy.cycle_timeout, self.verify(request, policy)).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) if e.is_retryable() => return self.escalate(request, policy, e).await,
            Ok(Err(e)) => return Err(e.in_cycle(&request.function_identity, &cycle_id)),
            Err(_) => {
                let e = EngineError::VerificationTimedOut(policy.cycle_timeout);
                return self.escalate(request, policy, e).await;
            }
        };
        self.conclude(request, policy, verdict).await
    }

    async fn verify(&self, request: &VerificationRequest, policy: &TrustPolicy) -> Result<Verdict> {
        let retry = &policy.retry;
        let clock = self.clock.as_ref();

        let fetcher = ArtifactFetcher::new(self.packages.as_ref(), self.registry.as_ref());
        let artifact = match with_backoff(retry, clock, "fetch artifact", || {
            fetcher.fetch(&request.artifact_locator)
        })
        .await
        {
            Ok(artifact) => artifact,
            Err(EngineError::ArtifactNotFound(reason)) => {
                return Ok(Verdict::invalid(None, format!("artifact not found: {}", reason)));
            }
            Err(e) => return Err(e),
        };

        let digest = compute_digest(&artifact);
        debug!("{} has digest {}", request.function_identity, digest);

        let (source, artifact_ref): (Box<dyn SignatureSource>, ArtifactRef) = match artifact {
            FetchedArtifact::CodePackage { .. } => (
                Box::new(ObjectStoreSource::new(self.signature_store(policy)?)),
                ArtifactRef::code_package(digest.clone()),
            ),
            FetchedArtifact::ContainerImage { image, .. } => (
                Box::new(OciSource::new(Arc::clone(&self.registry))),
                ArtifactRef::container_image(digest.clone(), image),
            ),
        };

        let signatures = match with_backoff(retry, clock, "fetch signatures", || {
            source.fetch_signatures(&artifact_ref)
        })
        .await
        {
            Ok(signatures) => signatures,
            Err(EngineError::Verification(reason) | EngineError::ArtifactNotFound(reason)) => {
                return Ok(Verdict::invalid(Some(&digest), reason));
            }
            Err(e) => return Err(e),
        };
        debug!(
            "Found {} signature(s) via {}",
            signatures.len(),
            source.source_type()
        );

        let strategy = self.strategy(policy).await?;
        with_backoff(retry, clock, "verify signatures", || {
            strategy.verify(&digest, &signatures)
        })
        .await
    }

    /// Enforce and publish a verdict.
    async fn conclude(
        &self,
        request: &VerificationRequest,
        policy: &TrustPolicy,
        verdict: Verdict,
    ) -> Result<CycleReport> {
        let cycle_id = request.cycle_id();
        let outcome = VerificationOutcome::new(request, verdict);
        info!(
            "Cycle {}: {} is {:?}",
            cycle_id, outcome.function_identity, outcome.status
        );

        let enforcer = PolicyEnforcer::new(self.functions.as_ref(), &policy.retry, self.clock.as_ref());
        let record = enforcer
            .enforce(&outcome, policy.action)
            .await
            .map_err(|e| e.in_cycle(&request.function_identity, &cycle_id))?;

        let message = ResultMessage::new(request, &outcome, &record, policy);
        let channel = policy.notification_channel.as_deref();
        let published = match with_backoff(&policy.retry, self.clock.as_ref(), "publish result", || {
            self.notifier.publish(channel, &message)
        })
        .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Cycle {}: enforcement applied but the {} notification failed: {}",
                    cycle_id,
                    self.notifier.notifier_type(),
                    e
                );
                false
            }
        };

        Ok(CycleReport::Enforced {
            outcome,
            record,
            published,
        })
    }

    /// Verification could not finish: fail closed under Block, otherwise drop.
    async fn escalate(
        &self,
        request: &VerificationRequest,
        policy: &TrustPolicy,
        error: EngineError,
    ) -> Result<CycleReport> {
        let cycle_id = request.cycle_id();
        if policy.action.fails_closed() {
            warn!(
                "Cycle {}: failing closed for {}: {}",
                cycle_id, request.function_identity, error
            );
            let verdict = Verdict::invalid(None, format!("verification incomplete: {}", error));
            return self.conclude(request, policy, verdict).await;
        }

        warn!(
            "Cycle {}: dropping verification of {}: {}",
            cycle_id, request.function_identity, error
        );
        Ok(CycleReport::Dropped {
            function: request.function_identity.clone(),
            reason: error.to_string(),
        })
    }

    fn signature_store(&self, policy: &TrustPolicy) -> Result<Arc<dyn ObjectStore>> {
        if let Some(store) = &self.signatures {
            return Ok(Arc::clone(store));
        }
        if let Some(bucket) = &policy.signature_bucket {
            return Ok(Arc::new(HttpObjectStore::for_bucket(bucket, &policy.region)?));
        }
        // Package URLs are absolute, so the default package store has no place
        // to look up `<digest>.sig` keys.
        self.package_store.clone().ok_or_else(|| {
            EngineError::InvalidConfig(
                "no signature bucket configured for code package signatures".into(),
            )
        })
    }

    async fn strategy(&self, policy: &TrustPolicy) -> Result<Strategy> {
        match &policy.trust {
            TrustMode::Keyed { key } => Ok(Strategy::keyed(key.clone())),
            TrustMode::Keyless { constraints } => {
                let roots = self.trust_roots_for(constraints).await?;
                let log: Arc<dyn TransparencyLog> = match &self.transparency_log {
                    Some(log) => Arc::clone(log),
                    None => Arc::new(RekorClient::new(constraints.rekor_url.as_str())?),
                };
                Ok(Strategy::keyless(constraints.clone(), roots, log))
            }
        }
    }

    async fn trust_roots_for(&self, constraints: &IdentityConstraints) -> Result<TrustRoots> {
        if let Some(roots) = &self.trust_roots {
            return Ok(roots.clone());
        }

        let key = (
            constraints.fulcio_root_pem.clone(),
            constraints.rekor_public_key_pem.clone(),
        );
        if let Some((cached_key, roots)) = self.trust_cache.lock().await.as_ref() {
            if *cached_key == key {
                return Ok(roots.clone());
            }
        }

        // Resolved without holding the cache lock; racing cycles may both fetch.
        let roots = TrustRoots::resolve(constraints).await?;
        *self.trust_cache.lock().await = Some((key, roots.clone()));
        Ok(roots)
    }
}
