//! Outgoing event builder
//!
//! ```rust
//! use eventstream::PublishBuilder;
//!
//! let message = PublishBuilder::new()
//!     .topic("orders")
//!     .event_name("created")
//!     .namespace("shop")
//!     .key("order-42")
//!     .payload([("total".to_string(), serde_json::json!(99))].into())
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(message.topic, "orders");
//! assert_eq!(&message.key[..], b"order-42");
//! ```

use crate::error::{EventError, Result};
use crate::id::{IdGenerator, UuidGenerator};
use crate::types::{Event, Fields, Message, DEFAULT_VERSION};
use crate::validation::validate_event;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Receives messages that could not be delivered by a fire-and-forget publish
pub type PublishErrorCallback = Arc<dyn Fn(Bytes, Arc<EventError>) + Send + Sync>;

/// Accumulates the fields of one outgoing event
///
/// Setters take and return the builder by value; `build` (or handing the
/// builder to a client) consumes it.
#[derive(Clone)]
pub struct PublishBuilder {
    event: Event,
    key: String,
    timeout: Option<Duration>,
    error_callback: Option<PublishErrorCallback>,
}

impl Default for PublishBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PublishBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishBuilder")
            .field("event", &self.event)
            .field("key", &self.key)
            .field("timeout", &self.timeout)
            .field("error_callback", &self.error_callback.is_some())
            .finish()
    }
}

impl PublishBuilder {
    pub fn new() -> Self {
        Self {
            event: Event {
                version: DEFAULT_VERSION,
                ..Default::default()
            },
            key: String::new(),
            timeout: None,
            error_callback: None,
        }
    }

    /// Topic the event is published to (before the client prefix)
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.event.topic = topic.into();
        self
    }

    pub fn event_name(mut self, event_name: impl Into<String>) -> Self {
        self.event.event_name = event_name.into();
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.event.namespace = namespace.into();
        self
    }

    pub fn parent_namespace(mut self, parent_namespace: impl Into<String>) -> Self {
        self.event.parent_namespace = parent_namespace.into();
        self
    }

    pub fn union_namespace(mut self, union_namespace: impl Into<String>) -> Self {
        self.event.union_namespace = union_namespace.into();
        self
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.event.client_id = client_id.into();
        self
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.event.trace_id = trace_id.into();
        self
    }

    pub fn span_context(mut self, span_context: impl Into<String>) -> Self {
        self.event.span_context = span_context.into();
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.event.session_id = session_id.into();
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.event.user_id = user_id.into();
        self
    }

    /// Event schema version, 1 unless set
    pub fn version(mut self, version: i32) -> Self {
        self.event.version = version;
        self
    }

    pub fn event_id(mut self, event_id: i32) -> Self {
        self.event.event_id = event_id;
        self
    }

    pub fn event_type(mut self, event_type: i32) -> Self {
        self.event.event_type = event_type;
        self
    }

    pub fn event_level(mut self, event_level: i32) -> Self {
        self.event.event_level = event_level;
        self
    }

    pub fn service_name(mut self, service_name: impl Into<String>) -> Self {
        self.event.service_name = service_name.into();
        self
    }

    pub fn client_ids(mut self, client_ids: Vec<String>) -> Self {
        self.event.client_ids = client_ids;
        self
    }

    pub fn target_user_ids(mut self, target_user_ids: Vec<String>) -> Self {
        self.event.target_user_ids = target_user_ids;
        self
    }

    pub fn target_namespace(mut self, target_namespace: impl Into<String>) -> Self {
        self.event.target_namespace = target_namespace.into();
        self
    }

    pub fn privacy(mut self, privacy: bool) -> Self {
        self.event.privacy = privacy;
        self
    }

    pub fn additional_fields(mut self, additional_fields: Fields) -> Self {
        self.event.additional_fields = additional_fields;
        self
    }

    /// Explicit event ID; one is generated at build time otherwise
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.event.id = id.into();
        self
    }

    /// Partition key. Events sharing a key keep their relative order.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn payload(mut self, payload: Fields) -> Self {
        self.event.payload = payload;
        self
    }

    /// Upper bound on reporting success or failure for this publish.
    ///
    /// Deprecated: only honoured by the first publish issued through a
    /// client. Configure `BrokerConfig::publish_timeout` instead.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Called off the caller's stack when a fire-and-forget publish fails
    pub fn error_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(Bytes, Arc<EventError>) + Send + Sync + 'static,
    {
        self.error_callback = Some(Arc::new(callback));
        self
    }

    pub(crate) fn timeout_override(&self) -> Option<Duration> {
        self.timeout.filter(|t| !t.is_zero())
    }

    pub(crate) fn take_error_callback(&mut self) -> Option<PublishErrorCallback> {
        self.error_callback.take()
    }

    /// Assemble, validate and serialize the event with a generated ID
    pub fn build(self) -> Result<Message> {
        self.build_with(&UuidGenerator, false)
    }

    /// Same as `build` with an injected ID source and validation mode
    pub fn build_with(self, ids: &dyn IdGenerator, strict: bool) -> Result<Message> {
        let mut event = self.event;
        if event.id.is_empty() {
            event.id = ids.generate();
        }
        event.timestamp = now_rfc3339();

        validate_event(&event, strict)?;

        let value = serde_json::to_vec(&event).map_err(|e| {
            tracing::error!(
                topic = %event.topic,
                event = %event.event_name,
                error = %e,
                "Unable to marshal event"
            );
            EventError::Decode(e)
        })?;

        Ok(Message {
            topic: event.topic,
            key: Bytes::from(self.key),
            value: Bytes::from(value),
        })
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
