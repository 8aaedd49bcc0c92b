//! Enforcement of verification outcomes on the monitored function.

use crate::config::EnforcementAction;
use crate::model::{
    ConcurrencyChange, EnforcementRecord, FunctionIdentity, VerificationOutcome,
    VerificationStatus,
};
use crate::retry::{Clock, RetryPolicy, with_backoff};
use crate::{EngineError, Result};
use async_trait::async_trait;
use log::info;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

pub const RESULT_TAG_KEY: &str = "FunctionVerifyResult";

/// The fixed result-tag vocabulary, shared by the enforcement writer and readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultTag {
    SignedAndVerified,
    NotSigned,
    SignatureInvalid,
}

impl ResultTag {
    pub const KEY: &'static str = RESULT_TAG_KEY;

    pub const ALL: [ResultTag; 3] = [
        ResultTag::SignedAndVerified,
        ResultTag::NotSigned,
        ResultTag::SignatureInvalid,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResultTag::SignedAndVerified => "Function signed and verified",
            ResultTag::NotSigned => "Function not signed",
            ResultTag::SignatureInvalid => "Function signature invalid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

impl fmt::Display for ResultTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageType {
    Zip,
    Image,
}

/// What the compute platform reports about a deployed function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDescriptor {
    pub identity: FunctionIdentity,
    pub package_type: PackageType,
    /// Where the deployed package can be downloaded (zip functions).
    pub code_location: Option<String>,
    /// Platform-reported SHA-256 of the package, base64 (zip functions).
    pub code_sha256: Option<String>,
    /// Image URI as deployed (image functions).
    pub image_uri: Option<String>,
    /// Image URI pinned to a digest by the platform, when known.
    pub resolved_image_uri: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// Narrow capability over the compute platform's function management API.
#[async_trait]
pub trait FunctionControl: Send + Sync {
    async fn describe(&self, function: &FunctionIdentity) -> Result<FunctionDescriptor>;

    /// Overwrite one tag on the function.
    async fn put_tag(&self, function: &FunctionIdentity, key: &str, value: &str) -> Result<()>;

    /// Overwrite the reserved concurrency limit.
    async fn put_reserved_concurrency(&self, function: &FunctionIdentity, limit: u32)
    -> Result<()>;

    /// `None` means unrestricted.
    async fn reserved_concurrency(&self, function: &FunctionIdentity) -> Result<Option<u32>>;

    async fn tags(&self, function: &FunctionIdentity) -> Result<BTreeMap<String, String>>;
}

/// Applies exactly one [`EnforcementRecord`] per outcome.
pub struct PolicyEnforcer<'a> {
    functions: &'a dyn FunctionControl,
    retry: &'a RetryPolicy,
    clock: &'a dyn Clock,
}

impl<'a> PolicyEnforcer<'a> {
    pub fn new(functions: &'a dyn FunctionControl, retry: &'a RetryPolicy, clock: &'a dyn Clock) -> Self {
        Self {
            functions,
            retry,
            clock,
        }
    }

    /// The record an outcome maps to under `action`, without side effects.
    pub fn plan(outcome: &VerificationOutcome, action: EnforcementAction) -> EnforcementRecord {
        let concurrency = match (outcome.status, action) {
            (VerificationStatus::Signed, _) => ConcurrencyChange::Untouched,
            (_, EnforcementAction::Block) => ConcurrencyChange::Blocked,
            (_, EnforcementAction::Alert | EnforcementAction::Allow) => {
                ConcurrencyChange::Untouched
            }
        };
        EnforcementRecord {
            concurrency,
            result_tag: outcome.status.result_tag(),
        }
    }

    /// Apply the planned record. Each write is a full overwrite, so re-running
    /// converges to the same state; the concurrency write goes first so a tag never
    /// reports a block that was not applied.
    pub async fn enforce(
        &self,
        outcome: &VerificationOutcome,
        action: EnforcementAction,
    ) -> Result<EnforcementRecord> {
        let record = Self::plan(outcome, action);
        let function = &outcome.function_identity;

        if record.concurrency == ConcurrencyChange::Blocked {
            with_backoff(self.retry, self.clock, "set reserved concurrency", || {
                self.functions.put_reserved_concurrency(function, 0)
            })
            .await?;
            info!("Blocked invocations of {} (reserved concurrency 0)", function);
        }

        with_backoff(self.retry, self.clock, "tag function", || {
            self.functions
                .put_tag(function, RESULT_TAG_KEY, record.result_tag.as_str())
        })
        .await?;
        info!(
            "Tagged {} with {}={}",
            function, RESULT_TAG_KEY, record.result_tag
        );

        Ok(record)
    }
}

/// Read the current result tag, if any.
pub async fn current_result(
    functions: &dyn FunctionControl,
    function: &FunctionIdentity,
) -> Result<Option<ResultTag>> {
    let tags = functions.tags(function).await?;
    Ok(tags.get(RESULT_TAG_KEY).and_then(|v| ResultTag::parse(v)))
}

#[derive(Debug, Clone)]
struct FunctionState {
    descriptor: FunctionDescriptor,
    reserved_concurrency: Option<u32>,
}

/// In-process function registry for local runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryFunctions {
    inner: Arc<Mutex<HashMap<FunctionIdentity, FunctionState>>>,
}

impl MemoryFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a deployed function.
    pub fn deploy(&self, descriptor: FunctionDescriptor) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let reserved_concurrency = inner
            .get(&descriptor.identity)
            .and_then(|s| s.reserved_concurrency);
        inner.insert(
            descriptor.identity.clone(),
            FunctionState {
                descriptor,
                reserved_concurrency,
            },
        );
    }

    pub fn remove(&self, function: &FunctionIdentity) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.remove(function);
    }

    fn with_state<T>(
        &self,
        function: &FunctionIdentity,
        f: impl FnOnce(&mut FunctionState) -> T,
    ) -> Result<T> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .get_mut(function)
            .map(f)
            .ok_or_else(|| EngineError::ArtifactNotFound(format!("no such function: {}", function)))
    }
}

#[async_trait]
impl FunctionControl for MemoryFunctions {
    async fn describe(&self, function: &FunctionIdentity) -> Result<FunctionDescriptor> {
        self.with_state(function, |s| s.descriptor.clone())
    }

    async fn put_tag(&self, function: &FunctionIdentity, key: &str, value: &str) -> Result<()> {
        self.with_state(function, |s| {
            s.descriptor.tags.insert(key.to_string(), value.to_string());
        })
    }

    async fn put_reserved_concurrency(
        &self,
        function: &FunctionIdentity,
        limit: u32,
    ) -> Result<()> {
        self.with_state(function, |s| s.reserved_concurrency = Some(limit))
    }

    async fn reserved_concurrency(&self, function: &FunctionIdentity) -> Result<Option<u32>> {
        self.with_state(function, |s| s.reserved_concurrency)
    }

    async fn tags(&self, function: &FunctionIdentity) -> Result<BTreeMap<String, String>> {
        self.with_state(function, |s| s.descriptor.tags.clone())
    }
}
