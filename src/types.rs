//! Core data types for the eventstream system
//!
//! Wire names follow the established event and audit-log JSON schema.
//! Empty, zero and false fields are omitted so messages stay compact.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Free-form JSON map used for payloads, additional fields and diffs
pub type Fields = HashMap<String, serde_json::Value>;

/// Default event schema version
pub const DEFAULT_VERSION: i32 = 1;

/// A structured event as carried on the wire
///
/// `partition`, `offset` and `key` are broker annotations: they are never
/// serialized and are only filled in on the consume path, right before the
/// subscriber callback sees the event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(rename = "name", skip_serializing_if = "String::is_empty")]
    pub event_name: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    #[serde(rename = "parentNamespace", skip_serializing_if = "String::is_empty")]
    pub parent_namespace: String,

    /// Parent namespace for multi-tenant studio setups
    #[serde(rename = "unionNamespace", skip_serializing_if = "String::is_empty")]
    pub union_namespace: String,

    #[serde(rename = "clientId", skip_serializing_if = "String::is_empty")]
    pub client_id: String,

    #[serde(rename = "traceId", skip_serializing_if = "String::is_empty")]
    pub trace_id: String,

    #[serde(rename = "spanContext", skip_serializing_if = "String::is_empty")]
    pub span_context: String,

    #[serde(rename = "userId", skip_serializing_if = "String::is_empty")]
    pub user_id: String,

    #[serde(rename = "sessionId", skip_serializing_if = "String::is_empty")]
    pub session_id: String,

    /// RFC 3339 UTC timestamp stamped at build time
    #[serde(skip_serializing_if = "String::is_empty")]
    pub timestamp: String,

    #[serde(skip_serializing_if = "is_zero")]
    pub version: i32,

    #[serde(rename = "event_id", skip_serializing_if = "is_zero")]
    pub event_id: i32,

    #[serde(rename = "event_type", skip_serializing_if = "is_zero")]
    pub event_type: i32,

    #[serde(rename = "event_level", skip_serializing_if = "is_zero")]
    pub event_level: i32,

    #[serde(rename = "service", skip_serializing_if = "String::is_empty")]
    pub service_name: String,

    #[serde(rename = "client_ids", skip_serializing_if = "Vec::is_empty")]
    pub client_ids: Vec<String>,

    #[serde(rename = "target_user_ids", skip_serializing_if = "Vec::is_empty")]
    pub target_user_ids: Vec<String>,

    #[serde(rename = "target_namespace", skip_serializing_if = "String::is_empty")]
    pub target_namespace: String,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub privacy: bool,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub topic: String,

    #[serde(rename = "additional_fields", skip_serializing_if = "HashMap::is_empty")]
    pub additional_fields: Fields,

    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub payload: Fields,

    #[serde(skip)]
    pub partition: i32,

    #[serde(skip)]
    pub offset: i64,

    #[serde(skip)]
    pub key: String,
}

impl Event {
    /// Stamp broker metadata from the message this event was decoded from
    pub(crate) fn annotate(&mut self, msg: &ConsumedMessage) {
        self.partition = msg.partition;
        self.offset = msg.offset;
        self.key = String::from_utf8_lossy(&msg.key).into_owned();
    }
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

/// Who performed an audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActorType {
    User,
    Client,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "USER",
            ActorType::Client => "CLIENT",
        }
    }
}

/// An audit-log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    #[serde(rename = "_id")]
    pub id: String,

    pub category: String,

    #[serde(rename = "actionName")]
    pub action_name: String,

    /// Unix timestamp in milliseconds
    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,

    pub actor: String,

    /// `None` only before validation; a published record always carries one
    #[serde(rename = "actorType")]
    pub actor_type: Option<ActorType>,

    #[serde(rename = "clientId")]
    pub client_id: String,

    #[serde(rename = "actorNamespace")]
    pub actor_namespace: String,

    #[serde(rename = "objectId", default, skip_serializing_if = "String::is_empty")]
    pub object_id: String,

    #[serde(rename = "objectType", default, skip_serializing_if = "String::is_empty")]
    pub object_type: String,

    /// Use the publisher namespace when the resource has none
    #[serde(rename = "objectNamespace")]
    pub object_namespace: String,

    #[serde(rename = "targetUserId", default, skip_serializing_if = "String::is_empty")]
    pub target_user_id: String,

    #[serde(rename = "deviceId", default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,

    pub payload: AuditLogPayload,
}

/// Audit-log body: free-form content plus an optional before/after diff
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditLogPayload {
    #[serde(default)]
    pub content: Fields,

    #[serde(default)]
    pub diff: AuditLogDiff,
}

/// State of the audited object before and after the action
///
/// When a diff is supplied at all, both sides must be present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditLogDiff {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Fields>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Fields>,
}

impl AuditLogDiff {
    pub fn new(before: Fields, after: Fields) -> Self {
        Self {
            before: Some(before),
            after: Some(after),
        }
    }

    /// Whether the caller supplied any side of the diff
    pub fn is_supplied(&self) -> bool {
        self.before.is_some() || self.after.is_some()
    }
}

/// A wire-ready record: partition key plus serialized value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub key: Bytes,
    pub value: Bytes,
}

/// A record handed out by a consumer, with its broker position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Bytes,
    pub value: Bytes,
}

impl ConsumedMessage {
    /// Same key and value, routed to another topic
    pub fn forward_to(&self, topic: impl Into<String>) -> Message {
        Message {
            topic: topic.into(),
            key: self.key.clone(),
            value: self.value.clone(),
        }
    }
}

/// Broker acknowledgement of a published message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub partition: i32,
    pub offset: i64,
}

/// Topic information returned by `get_metadata`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub topic: String,
    pub partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub id: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
}

/// Where a consumer group with no committed offset starts reading
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StartOffset {
    Earliest,
    /// Only messages published after the subscription starts
    #[default]
    Latest,
}

impl StartOffset {
    /// librdkafka `auto.offset.reset` value
    pub fn reset_policy(&self) -> &'static str {
        match self {
            StartOffset::Earliest => "earliest",
            StartOffset::Latest => "latest",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_event_serializes_to_empty_object() {
        let json = serde_json::to_string(&Event::default()).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn test_event_wire_names() {
        let event = Event {
            id: "abc".into(),
            event_name: "userCreated".into(),
            parent_namespace: "studio".into(),
            client_id: "c1".into(),
            event_id: 7,
            service_name: "iam".into(),
            target_user_ids: vec!["u1".into()],
            privacy: true,
            ..Default::default()
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["id"], "abc");
        assert_eq!(value["name"], "userCreated");
        assert_eq!(value["parentNamespace"], "studio");
        assert_eq!(value["clientId"], "c1");
        assert_eq!(value["event_id"], 7);
        assert_eq!(value["service"], "iam");
        assert_eq!(value["target_user_ids"], json!(["u1"]));
        assert_eq!(value["privacy"], true);
        assert!(value.get("version").is_none());
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn test_broker_metadata_never_serialized() {
        let event = Event {
            event_name: "x".into(),
            partition: 3,
            offset: 42,
            key: "k".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"name":"x"}"#);

        let parsed: Event = serde_json::from_str(r#"{"name":"x","partition":9}"#).unwrap();
        assert_eq!(parsed.partition, 0);
    }

    #[test]
    fn test_annotate_sets_consume_metadata() {
        let mut event = Event::default();
        let msg = ConsumedMessage {
            topic: "orders".into(),
            partition: 2,
            offset: 10,
            key: Bytes::from_static(b"order-1"),
            value: Bytes::new(),
        };
        event.annotate(&msg);
        assert_eq!(event.partition, 2);
        assert_eq!(event.offset, 10);
        assert_eq!(event.key, "order-1");
    }

    #[test]
    fn test_actor_type_wire_values() {
        assert_eq!(serde_json::to_string(&ActorType::User).unwrap(), "\"USER\"");
        assert_eq!(serde_json::to_string(&ActorType::Client).unwrap(), "\"CLIENT\"");
        assert_eq!(ActorType::Client.as_str(), "CLIENT");
    }

    #[test]
    fn test_audit_diff_omits_missing_sides() {
        let payload = AuditLogPayload::default();
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"content":{},"diff":{}}"#);
        assert!(!payload.diff.is_supplied());
    }

    #[test]
    fn test_forward_to_keeps_key_and_value() {
        let msg = ConsumedMessage {
            topic: "orders".into(),
            partition: 0,
            offset: 1,
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"{}"),
        };
        let fwd = msg.forward_to("orders-dlq");
        assert_eq!(fwd.topic, "orders-dlq");
        assert_eq!(fwd.key, msg.key);
        assert_eq!(fwd.value, msg.value);
    }

    #[test]
    fn test_start_offset_reset_policy() {
        assert_eq!(StartOffset::default(), StartOffset::Latest);
        assert_eq!(StartOffset::Earliest.reset_policy(), "earliest");
    }
}
