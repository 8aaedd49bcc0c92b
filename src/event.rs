//! Deployment-event intake.
//!
//! Accepts the provider's change notification (a CloudTrail-style record of a
//! function create or code update), optionally wrapped in a queue envelope, and
//! turns it into a [`VerificationRequest`] for functions inside the policy scope.

use crate::config::TrustPolicy;
use crate::enforce::{FunctionControl, FunctionDescriptor, PackageType};
use crate::model::{ArtifactLocator, FunctionIdentity, ImageReference, VerificationRequest};
use crate::{EngineError, Result};
use chrono::{DateTime, Utc};
use log::{debug, trace};
use serde_json::Value;

const DEPLOYMENT_EVENT_PREFIXES: &[&str] = &["CreateFunction", "UpdateFunctionCode"];

/// The fields of a deployment notification the engine relies on.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentEvent {
    pub event_id: Option<String>,
    pub event_name: String,
    pub function: FunctionIdentity,
    pub observed_at: DateTime<Utc>,
    /// Image URI named by the request itself, if any.
    pub image_uri: Option<String>,
}

/// Split a payload into individual events, unwrapping queue envelopes.
///
/// Each record parses on its own; a malformed record yields an error in its
/// slot without affecting the others.
pub fn unwrap_envelope(payload: &Value) -> Vec<Result<Value>> {
    let Some(records) = payload.get("Records").and_then(|r| r.as_array()) else {
        return vec![Ok(payload.clone())];
    };
    records.iter().map(unwrap_record).collect()
}

fn unwrap_record(record: &Value) -> Result<Value> {
    let body = record
        .get("body")
        .and_then(|b| b.as_str())
        .ok_or_else(|| EngineError::MalformedEvent("queue record without body".into()))?;
    let event = serde_json::from_str(body)
        .map_err(|e| EngineError::MalformedEvent(format!("queue body is not JSON: {}", e)))?;
    trace!("Unwrapped queue record of {} bytes", body.len());
    Ok(event)
}

/// Parse one event. `Ok(None)` for well-formed events that are not deployments.
pub fn parse_event(event: &Value) -> Result<Option<DeploymentEvent>> {
    let detail = event.get("detail").unwrap_or(event);

    let event_name = str_at(detail, &["eventName"]).unwrap_or_default();
    if !DEPLOYMENT_EVENT_PREFIXES
        .iter()
        .any(|p| event_name.starts_with(p))
    {
        debug!("Ignoring non-deployment event '{}'", event_name);
        return Ok(None);
    }

    let function = str_at(detail, &["responseElements", "functionArn"])
        .or_else(|| str_at(detail, &["requestParameters", "functionName"]))
        .or_else(|| str_at(detail, &["responseElements", "functionName"]))
        .filter(|s| !s.is_empty())
        .map(FunctionIdentity::new)
        .ok_or_else(|| {
            EngineError::MalformedEvent(format!("{} event has no function identity", event_name))
        })?;

    let observed_at = str_at(detail, &["eventTime"])
        .or_else(|| str_at(event, &["time"]))
        .map(|t| {
            DateTime::parse_from_rfc3339(&t)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| EngineError::MalformedEvent(format!("bad event time '{}': {}", t, e)))
        })
        .transpose()?
        .ok_or_else(|| {
            EngineError::MalformedEvent(format!("{} event has no event time", event_name))
        })?;

    let image_uri = str_at(detail, &["requestParameters", "code", "imageUri"])
        .or_else(|| str_at(detail, &["requestParameters", "imageUri"]));

    let event_id = str_at(event, &["id"]).or_else(|| str_at(detail, &["eventID"]));

    Ok(Some(DeploymentEvent {
        event_id,
        event_name,
        function,
        observed_at,
        image_uri,
    }))
}

fn str_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    current.as_str().map(str::to_string)
}

/// Normalizes events into verification requests under a policy snapshot.
pub struct EventIntake<'a> {
    functions: &'a dyn FunctionControl,
}

impl<'a> EventIntake<'a> {
    pub fn new(functions: &'a dyn FunctionControl) -> Self {
        Self { functions }
    }

    /// Build a request, or `Ok(None)` when the event is out of scope.
    pub async fn intake(
        &self,
        event: &DeploymentEvent,
        policy: &TrustPolicy,
    ) -> Result<Option<VerificationRequest>> {
        let descriptor = self.functions.describe(&event.function).await?;

        if !policy.scope.includes(&descriptor.tags) {
            debug!("{} is outside the monitored scope", event.function);
            return Ok(None);
        }

        let artifact_locator = locate_artifact(&descriptor, event)?;
        Ok(Some(VerificationRequest {
            function_identity: event.function.clone(),
            artifact_locator,
            observed_at: event.observed_at,
            event_id: event.event_id.clone(),
        }))
    }
}

/// Where the deployed artifact lives, preferring platform-pinned references.
fn locate_artifact(
    descriptor: &FunctionDescriptor,
    event: &DeploymentEvent,
) -> Result<ArtifactLocator> {
    match descriptor.package_type {
        PackageType::Zip => {
            let location = descriptor.code_location.clone().ok_or_else(|| {
                EngineError::MalformedEvent(format!(
                    "{} has no resolvable code package location",
                    event.function
                ))
            })?;
            Ok(ArtifactLocator::CodePackage {
                location,
                reported_sha256: descriptor.code_sha256.clone(),
            })
        }
        PackageType::Image => {
            let uri = descriptor
                .resolved_image_uri
                .as_deref()
                .or(descriptor.image_uri.as_deref())
                .or(event.image_uri.as_deref())
                .ok_or_else(|| {
                    EngineError::MalformedEvent(format!(
                        "{} has no resolvable image reference",
                        event.function
                    ))
                })?;
            Ok(ArtifactLocator::ContainerImage(ImageReference::parse(uri)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn create_event() -> Value {
        json!({
            "id": "evt-1",
            "detail-type": "AWS API Call via CloudTrail",
            "source": "aws.lambda",
            "time": "2024-05-01T10:00:05Z",
            "detail": {
                "eventName": "CreateFunction20150331",
                "eventTime": "2024-05-01T10:00:00Z",
                "requestParameters": {
                    "functionName": "e2eTestImage",
                    "code": { "imageUri": "1.dkr.ecr.us-east-1.amazonaws.com/helloworld:v1" }
                },
                "responseElements": {
                    "functionArn": "arn:aws:lambda:us-east-1:1:function:e2eTestImage"
                }
            }
        })
    }

    #[test]
    fn parses_create_function_event() {
        let event = parse_event(&create_event()).unwrap().unwrap();
        assert_eq!(
            event.function.as_str(),
            "arn:aws:lambda:us-east-1:1:function:e2eTestImage"
        );
        assert_eq!(event.event_id.as_deref(), Some("evt-1"));
        assert_eq!(event.observed_at.to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert_eq!(
            event.image_uri.as_deref(),
            Some("1.dkr.ecr.us-east-1.amazonaws.com/helloworld:v1")
        );
    }

    #[test]
    fn falls_back_to_function_name() {
        let event = json!({
            "detail": {
                "eventName": "UpdateFunctionCode20150331v2",
                "eventTime": "2024-05-01T10:00:00Z",
                "requestParameters": { "functionName": "fn" }
            }
        });
        let event = parse_event(&event).unwrap().unwrap();
        assert_eq!(event.function.as_str(), "fn");
    }

    #[test]
    fn redelivered_event_keeps_its_time() {
        let first = parse_event(&create_event()).unwrap().unwrap();
        let again = parse_event(&create_event()).unwrap().unwrap();
        assert_eq!(first, again);

        let mut untimed = create_event();
        untimed.as_object_mut().unwrap().remove("time");
        untimed["detail"].as_object_mut().unwrap().remove("eventTime");
        assert!(matches!(parse_event(&untimed), Err(EngineError::MalformedEvent(_))));
    }

    #[test]
    fn missing_identity_is_malformed() {
        let event = json!({ "detail": { "eventName": "CreateFunction20150331" } });
        assert!(matches!(parse_event(&event), Err(EngineError::MalformedEvent(_))));
    }

    #[test]
    fn non_deployment_events_are_ignored() {
        let event = json!({ "detail": { "eventName": "TagResource20170331v2" } });
        assert_eq!(parse_event(&event).unwrap(), None);
    }

    #[test]
    fn unwraps_queue_envelope() {
        let body = serde_json::to_string(&create_event()).unwrap();
        let envelope = json!({ "Records": [ { "body": body }, { "body": body } ] });
        let events = unwrap_envelope(&envelope);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.is_ok()));
        assert_eq!(unwrap_envelope(&create_event()).len(), 1);
    }

    #[test]
    fn malformed_record_stays_in_its_slot() {
        let body = serde_json::to_string(&create_event()).unwrap();
        let envelope = json!({ "Records": [ { "body": "{not json" }, { "body": body }, {} ] });
        let events = unwrap_envelope(&envelope);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], Err(EngineError::MalformedEvent(_))));
        assert_eq!(events[1].as_ref().unwrap(), &create_event());
        assert!(matches!(events[2], Err(EngineError::MalformedEvent(_))));
    }
}
