use std::time::Duration;
use thiserror::Error;

pub mod bundle;
pub mod config;
pub mod digest;
pub mod enforce;
pub mod engine;
pub mod event;
pub mod fetch;
pub mod model;
pub mod publish;
pub mod registry;
pub mod retry;
pub mod sources;
pub mod store;
pub mod verifiers;

// Re-export commonly used types
pub use config::{ConfigSource, EnforcementAction, TrustMode, TrustPolicy};
pub use digest::ArtifactDigest;
pub use enforce::{FunctionControl, PolicyEnforcer, ResultTag};
pub use engine::{CycleReport, Engine, EngineBuilder};
pub use model::{
    ArtifactKind, ArtifactLocator, EnforcementRecord, FunctionIdentity, VerificationOutcome,
    VerificationRequest, VerificationStatus,
};
pub use publish::{Notifier, ResultMessage};
pub use sources::{AttachedSignature, SignatureSource};
pub use verifiers::{Strategy, Verifier};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Artifact unavailable: {0}")]
    ArtifactUnavailable(String),

    #[error("Verification timed out after {0:?}")]
    VerificationTimedOut(Duration),

    #[error("Timed out waiting for {0}")]
    ConditionTimedOut(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Verification material error: {0}")]
    Verification(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("cycle {cycle_id} for {function}: {source}")]
    Cycle {
        function: String,
        cycle_id: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Transient faults worth another attempt under bounded backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::ArtifactUnavailable(_)
            | EngineError::VerificationTimedOut(_)
            | EngineError::Provider(_)
            | EngineError::Publish(_)
            | EngineError::Http(_) => true,
            EngineError::Cycle { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// The innermost error, looking through cycle context.
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::Cycle { source, .. } => source.root(),
            other => other,
        }
    }

    /// Attach the cycle context operators use to correlate failures.
    pub fn in_cycle(self, function: &FunctionIdentity, cycle_id: &str) -> Self {
        match self {
            already @ EngineError::Cycle { .. } => already,
            other => EngineError::Cycle {
                function: function.to_string(),
                cycle_id: cycle_id.to_string(),
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

// ===== Convenience entry points =====

/// Verify a code package held in memory against a trust strategy.
///
/// Signatures are looked up in `signatures` under the package digest, the same
/// layout the engine uses for deployed functions.
pub async fn verify_code_package(
    package: &[u8],
    signatures: &dyn SignatureSource,
    strategy: &Strategy,
) -> Result<VerificationStatus> {
    let digest = ArtifactDigest::of_bytes(package);
    let attached = match signatures
        .fetch_signatures(&sources::ArtifactRef::code_package(digest.clone()))
        .await
    {
        Ok(attached) => attached,
        Err(EngineError::Verification(_)) => return Ok(VerificationStatus::SignatureInvalid),
        Err(e) => return Err(e),
    };
    let verdict = strategy.verify(&digest, &attached).await?;
    Ok(verdict.status)
}

/// Handle one raw deployment event (or queue envelope) with a ready engine.
pub async fn handle_event(
    engine: &std::sync::Arc<Engine>,
    payload: &serde_json::Value,
) -> Vec<Result<CycleReport>> {
    engine.handle_payload(payload).await
}
