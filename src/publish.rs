//! Audit notifications for completed verification cycles.

use crate::config::{EnforcementAction, TrustPolicy};
use crate::model::{
    ConcurrencyChange, EnforcementRecord, FunctionIdentity, VerificationOutcome,
    VerificationRequest, VerificationStatus,
};
use crate::store::USER_AGENT_VALUE;
use crate::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const CHANNEL_HEADER: &str = "X-Notification-Channel";

/// One message per verification cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub function_identity: FunctionIdentity,
    pub function_name: String,
    pub status: VerificationStatus,
    /// Result tag value applied to the function.
    pub result: String,
    pub action: EnforcementAction,
    pub blocked: bool,
    pub digest: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub cycle_id: String,
    pub region: String,
    pub channel: Option<String>,
    pub reason: Option<String>,
}

impl ResultMessage {
    pub fn new(
        request: &VerificationRequest,
        outcome: &VerificationOutcome,
        record: &EnforcementRecord,
        policy: &TrustPolicy,
    ) -> Self {
        Self {
            function_identity: outcome.function_identity.clone(),
            function_name: outcome.function_identity.name().to_string(),
            status: outcome.status,
            result: record.result_tag.as_str().to_string(),
            action: policy.action,
            blocked: record.concurrency == ConcurrencyChange::Blocked,
            digest: outcome.evidence.digest.as_ref().map(|d| d.to_string()),
            observed_at: outcome.observed_at,
            cycle_id: request.cycle_id(),
            region: policy.region.clone(),
            channel: policy.notification_channel.clone(),
            reason: outcome.evidence.reason.clone(),
        }
    }

    /// Consumers needing exactly-once semantics deduplicate on this key.
    pub fn dedup_key(&self) -> (&FunctionIdentity, DateTime<Utc>) {
        (&self.function_identity, self.observed_at)
    }
}

/// Where result messages are delivered. Delivery is at-least-once.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, channel: Option<&str>, message: &ResultMessage) -> Result<()>;

    /// Get the notifier type name for logging
    fn notifier_type(&self) -> &'static str;
}

/// POSTs each message as JSON to an HTTP endpoint (e.g. a topic's HTTPS
/// ingestion URL or a webhook relay).
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn publish(&self, channel: Option<&str>, message: &ResultMessage) -> Result<()> {
        let mut request = self.client.post(&self.url).json(message);
        if let Some(channel) = channel {
            request = request.header(CHANNEL_HEADER, channel);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Publish(format!("{}: {}", self.url, e)))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EngineError::Publish(format!(
                "notification endpoint returned {}: {}",
                status, body
            )));
        }
        debug!("Published result for {}", message.function_identity);
        Ok(())
    }

    fn notifier_type(&self) -> &'static str {
        "webhook"
    }
}

/// Collects messages in memory; can be told to fail.
#[derive(Debug, Clone, Default)]
pub struct MemoryNotifier {
    messages: Arc<Mutex<Vec<(Option<String>, ResultMessage)>>>,
    failing: Arc<AtomicBool>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<ResultMessage> {
        let messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
        messages.iter().map(|(_, m)| m.clone()).collect()
    }

    /// Messages delivered to `channel`.
    pub fn messages_on(&self, channel: &str) -> Vec<ResultMessage> {
        let messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
        messages
            .iter()
            .filter(|(c, _)| c.as_deref() == Some(channel))
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn publish(&self, channel: Option<&str>, message: &ResultMessage) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::Publish("notification channel unavailable".into()));
        }
        let mut messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
        messages.push((channel.map(str::to_string), message.clone()));
        Ok(())
    }

    fn notifier_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforce::ResultTag;
    use crate::model::{ArtifactLocator, Evidence};

    fn message() -> ResultMessage {
        ResultMessage {
            function_identity: FunctionIdentity::new("arn:aws:lambda:us-east-1:1:function:f"),
            function_name: "f".into(),
            status: VerificationStatus::NotSigned,
            result: ResultTag::NotSigned.as_str().into(),
            action: EnforcementAction::Block,
            blocked: true,
            digest: None,
            observed_at: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            cycle_id: "c".into(),
            region: "us-east-1".into(),
            channel: Some("topic".into()),
            reason: None,
        }
    }

    #[test]
    fn serializes_with_camel_case_fields() {
        let json = serde_json::to_value(message()).unwrap();
        assert_eq!(json["functionIdentity"], "arn:aws:lambda:us-east-1:1:function:f");
        assert_eq!(json["status"], "NotSigned");
        assert_eq!(json["result"], "Function not signed");
        assert_eq!(json["action"], "block");
        assert_eq!(json["blocked"], true);
    }

    #[test]
    fn dedup_key_ignores_cycle_specific_fields() {
        let a = message();
        let b = ResultMessage {
            cycle_id: "other".into(),
            ..message()
        };
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn new_copies_request_and_record() {
        let request = VerificationRequest {
            function_identity: FunctionIdentity::new("f"),
            artifact_locator: ArtifactLocator::CodePackage {
                location: "k".into(),
                reported_sha256: None,
            },
            observed_at: Utc::now(),
            event_id: None,
        };
        let outcome = VerificationOutcome {
            status: VerificationStatus::Signed,
            evidence: Evidence::default(),
            function_identity: request.function_identity.clone(),
            observed_at: request.observed_at,
        };
        let record = EnforcementRecord {
            concurrency: ConcurrencyChange::Untouched,
            result_tag: ResultTag::SignedAndVerified,
        };
        let policy = crate::config::EngineConfig {
            region: "eu-west-1".into(),
            action: EnforcementAction::Block,
            public_key: test_key_pem(),
            sns_topic_arn: "topic".into(),
            ..Default::default()
        }
        .into_policy()
        .unwrap();

        let msg = ResultMessage::new(&request, &outcome, &record, &policy);
        assert_eq!(msg.result, "Function signed and verified");
        assert!(!msg.blocked);
        assert_eq!(msg.region, "eu-west-1");
        assert_eq!(msg.channel.as_deref(), Some("topic"));
        assert_eq!(msg.cycle_id, request.cycle_id());
    }

    fn test_key_pem() -> String {
        use p256::ecdsa::SigningKey;
        use p256::pkcs8::{EncodePublicKey, LineEnding};
        SigningKey::from_slice(&[9u8; 32])
            .unwrap()
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap()
    }

    #[tokio::test]
    async fn memory_notifier_can_fail() {
        let notifier = MemoryNotifier::new();
        notifier.publish(Some("topic"), &message()).await.unwrap();
        notifier.set_failing(true);
        assert!(notifier.publish(Some("topic"), &message()).await.is_err());
        assert_eq!(notifier.messages_on("topic").len(), 1);
    }
}
