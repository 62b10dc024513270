//! CloudTrail event model
//!
//! A thin wrapper over the raw event JSON with typed accessors, plus the
//! mapping from an event to the resources it touched. Each resource kind
//! declares `(event-name pattern, path)` mappers; the first matching mapper
//! per kind wins, and the path expression extracts resource ids from the
//! event payload.

use super::{Resource, ResourceKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use tracing::debug;

/// One CloudTrail event, kept as raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloudTrailEvent(Value);

impl CloudTrailEvent {
    pub fn new(payload: Value) -> Self {
        Self(payload)
    }

    pub fn payload(&self) -> &Value {
        &self.0
    }

    fn str_field(&self, path: &str) -> Option<&str> {
        extract_path(&self.0, path)
            .into_iter()
            .next()
            .and_then(|v| v.as_str())
    }

    pub fn event_name(&self) -> Option<&str> {
        self.0.get("eventName").and_then(|v| v.as_str())
    }

    /// The provider's error code; a present code means the operation failed
    /// and the event describes nothing that exists.
    pub fn error_code(&self) -> Option<&str> {
        self.0.get("errorCode").and_then(|v| v.as_str())
    }

    pub fn event_id(&self) -> Option<&str> {
        self.0.get("eventID").and_then(|v| v.as_str())
    }

    pub fn event_time(&self) -> Option<&str> {
        self.0.get("eventTime").and_then(|v| v.as_str())
    }

    pub fn aws_region(&self) -> Option<&str> {
        self.0.get("awsRegion").and_then(|v| v.as_str())
    }

    pub fn recipient_account_id(&self) -> Option<&str> {
        self.0.get("recipientAccountId").and_then(|v| v.as_str())
    }

    pub fn user_identity_arn(&self) -> Option<&str> {
        self.str_field("userIdentity.arn")
    }

    /// Attach enrichment fields (account name, processing timestamp) before
    /// the event is shipped to the sink.
    pub fn stamp(&mut self, key: &str, value: Value) {
        if let Value::Object(map) = &mut self.0 {
            map.insert(key.to_string(), value);
        }
    }
}

/// Extract values at a dot-separated path, with `name[*]` descending into
/// every element of an array field.
///
/// Missing segments yield an empty result, never an error.
pub(crate) fn extract_path<'a>(value: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![value];
    for segment in path.split('.') {
        let mut next = Vec::new();
        if let Some(field) = segment.strip_suffix("[*]") {
            for v in current {
                if let Some(Value::Array(items)) = v.get(field) {
                    next.extend(items.iter());
                }
            }
        } else {
            for v in current {
                if let Some(child) = v.get(segment) {
                    next.push(child);
                }
            }
        }
        current = next;
        if current.is_empty() {
            break;
        }
    }
    current
}

/// Event-name patterns, compiled once and cached.
fn pattern_matches(pattern: &'static str, name: &str) -> bool {
    static CACHE: OnceLock<Mutex<HashMap<&'static str, Option<&'static Regex>>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let regex = cache
        .entry(pattern)
        .or_insert_with(|| Regex::new(pattern).ok().map(|r| &*Box::leak(Box::new(r))));
    match regex {
        Some(r) => r.is_match(name),
        // Mapper patterns are static; an uncompilable one degrades to equality
        None => *pattern == *name,
    }
}

/// Map an event to the resources it touched.
///
/// Events that record a failed operation (`errorCode` present) map to
/// nothing. Every kind's mappers are consulted, so one event can yield
/// resources of several kinds; within a kind, the first mapper whose
/// pattern matches the event name wins.
pub fn resources_from_event(event: &CloudTrailEvent) -> Vec<Resource> {
    if let Some(code) = event.error_code() {
        debug!(event = ?event.event_name(), error_code = %code, "Skipping failed-operation event");
        return Vec::new();
    }
    let Some(name) = event.event_name() else {
        return Vec::new();
    };

    let mut resources = Vec::new();
    for kind in ResourceKind::ALL {
        for (pattern, path) in kind.event_mappers() {
            if !pattern_matches(pattern, name) {
                continue;
            }
            for id in extract_path(event.payload(), path) {
                if let Some(id) = id.as_str() {
                    let mut resource = Resource::from_id(*kind, id);
                    resource.set_origin_event(event.clone());
                    resources.push(resource);
                }
            }
            break;
        }
    }
    resources
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_path_simple() {
        let value = json!({"responseElements": {"volumeId": "vol-1"}});
        let found = extract_path(&value, "responseElements.volumeId");
        assert_eq!(found, [&json!("vol-1")]);
    }

    #[test]
    fn test_extract_path_wildcard() {
        let value = json!({
            "requestParameters": {
                "resourcesSet": {
                    "items": [{"resourceId": "i-1"}, {"resourceId": "vol-2"}]
                }
            }
        });
        let found = extract_path(&value, "requestParameters.resourcesSet.items[*].resourceId");
        assert_eq!(found, [&json!("i-1"), &json!("vol-2")]);
    }

    #[test]
    fn test_extract_path_missing_is_empty() {
        let value = json!({"a": {"b": 1}});
        assert!(extract_path(&value, "a.c.d").is_empty());
        assert!(extract_path(&value, "x[*].y").is_empty());
    }

    #[test]
    fn test_create_subnet_maps_to_subnet() {
        let event = CloudTrailEvent::new(json!({
            "eventName": "CreateSubnet",
            "responseElements": {"subnet": {"subnetId": "subnet-123"}}
        }));
        let resources = resources_from_event(&event);
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].id(), "subnet-123");
        assert_eq!(resources[0].kind(), ResourceKind::Subnet);
        assert!(resources[0].origin_event().is_some());
    }

    #[test]
    fn test_create_tags_maps_every_listed_resource() {
        let event = CloudTrailEvent::new(json!({
            "eventName": "CreateTags",
            "requestParameters": {
                "resourcesSet": {
                    "items": [{"resourceId": "i-1"}, {"resourceId": "vol-2"}]
                }
            }
        }));
        let resources = resources_from_event(&event);
        let ids: Vec<&str> = resources.iter().map(|r| r.id()).collect();
        assert_eq!(ids, ["i-1", "vol-2"]);
        assert!(resources.iter().all(|r| r.kind() == ResourceKind::Ec2Resource));
    }

    #[test]
    fn test_put_bucket_pattern_matches_variants() {
        for name in ["PutBucketAcl", "PutBucketPolicy", "CreateBucket"] {
            let event = CloudTrailEvent::new(json!({
                "eventName": name,
                "requestParameters": {"bucketName": "my-bucket"}
            }));
            let resources = resources_from_event(&event);
            assert_eq!(resources.len(), 1, "event {}", name);
            assert_eq!(resources[0].kind(), ResourceKind::S3Bucket);
        }
    }

    #[test]
    fn test_failed_operation_maps_to_nothing() {
        let event = CloudTrailEvent::new(json!({
            "eventName": "CreateVolume",
            "errorCode": "Client.UnauthorizedOperation",
            "responseElements": {"volumeId": "vol-1"}
        }));
        assert!(resources_from_event(&event).is_empty());
    }

    #[test]
    fn test_unmapped_event_maps_to_nothing() {
        let event = CloudTrailEvent::new(json!({
            "eventName": "DescribeInstances"
        }));
        assert!(resources_from_event(&event).is_empty());
    }

    #[test]
    fn test_stamp_and_accessors() {
        let mut event = CloudTrailEvent::new(json!({
            "eventName": "CreateVolume",
            "eventID": "abc-123",
            "eventTime": "2024-05-01T12:00:00Z",
            "awsRegion": "eu-west-1",
            "recipientAccountId": "111122223333",
            "userIdentity": {"arn": "arn:aws:iam::111122223333:user/dev"}
        }));
        assert_eq!(event.event_id(), Some("abc-123"));
        assert_eq!(event.aws_region(), Some("eu-west-1"));
        assert_eq!(
            event.user_identity_arn(),
            Some("arn:aws:iam::111122223333:user/dev")
        );

        event.stamp("accountName", json!("prod"));
        assert_eq!(event.payload()["accountName"], json!("prod"));
    }
}
