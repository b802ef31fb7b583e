//! Subscription builder and callback types

use crate::error::{EventError, Result};
use crate::metrics;
use crate::types::{Event, StartOffset};
use crate::validation::{validate_event_name, validate_topic};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Error type returned by subscriber callbacks
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of one callback invocation; `Err` marks the message as failed
pub type CallbackResult = std::result::Result<(), CallbackError>;

/// Receives decoded events, or the decode error when the body is not an event
pub type EventCallback =
    Arc<dyn Fn(CancellationToken, Result<Event>) -> BoxFuture<'static, CallbackResult> + Send + Sync>;

/// Receives the undecoded message value
pub type RawCallback =
    Arc<dyn Fn(CancellationToken, Bytes) -> BoxFuture<'static, CallbackResult> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Handler {
    Decoded(EventCallback),
    Raw(RawCallback),
}

/// Accumulates the settings of one subscription
#[derive(Clone, Default)]
pub struct SubscribeBuilder {
    pub(crate) topic: String,
    pub(crate) group_id: String,
    pub(crate) group_instance_id: String,
    pub(crate) event_name: String,
    pub(crate) start_offset: StartOffset,
    pub(crate) handler: Option<Handler>,
    pub(crate) send_error_dlq: bool,
    pub(crate) async_commit_message: bool,
}

impl std::fmt::Debug for SubscribeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handler = match &self.handler {
            Some(Handler::Decoded(_)) => "decoded",
            Some(Handler::Raw(_)) => "raw",
            None => "none",
        };
        f.debug_struct("SubscribeBuilder")
            .field("topic", &self.topic)
            .field("group_id", &self.group_id)
            .field("group_instance_id", &self.group_instance_id)
            .field("event_name", &self.event_name)
            .field("start_offset", &self.start_offset)
            .field("handler", &handler)
            .field("send_error_dlq", &self.send_error_dlq)
            .field("async_commit_message", &self.async_commit_message)
            .finish()
    }
}

impl SubscribeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Consumer group. A random group is generated at registration if unset.
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = group_id.into();
        self
    }

    /// Static group membership ID
    pub fn group_instance_id(mut self, group_instance_id: impl Into<String>) -> Self {
        self.group_instance_id = group_instance_id.into();
        self
    }

    /// Only forward events with this name; others are committed and skipped
    pub fn event_name(mut self, event_name: impl Into<String>) -> Self {
        self.event_name = event_name.into();
        self
    }

    /// Where a group without committed offsets starts; defaults to the log end
    pub fn start_offset(mut self, start_offset: StartOffset) -> Self {
        self.start_offset = start_offset;
        self
    }

    /// Handle decoded events
    pub fn callback<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(CancellationToken, Result<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        let callback: EventCallback = Arc::new(
            move |ctx: CancellationToken, event: Result<Event>| -> BoxFuture<'static, CallbackResult> {
                Box::pin(callback(ctx, event))
            },
        );
        self.handler = Some(Handler::Decoded(callback));
        self
    }

    /// Handle undecoded message values; replaces any decoded callback
    pub fn callback_raw<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(CancellationToken, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        let callback: RawCallback = Arc::new(
            move |ctx: CancellationToken, value: Bytes| -> BoxFuture<'static, CallbackResult> {
                Box::pin(callback(ctx, value))
            },
        );
        self.handler = Some(Handler::Raw(callback));
        self
    }

    /// Republish messages whose callback failed to `<topic>-dlq`
    pub fn send_error_dlq(mut self, dlq: bool) -> Self {
        self.send_error_dlq = dlq;
        self
    }

    /// Do not wait for periodic offset flushes to complete.
    /// Per-message commits (auto-commit disabled) always wait.
    pub fn async_commit_message(mut self, is_async: bool) -> Self {
        self.async_commit_message = is_async;
        self
    }

    /// Identifier of this subscription: `<topic>.<eventName>.<groupID>`
    pub fn slug(&self) -> String {
        metrics::slug(&self.topic, &self.event_name, &self.group_id)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_topic(&self.topic)?;
        if !self.event_name.is_empty() {
            validate_event_name(&self.event_name)?;
        }
        if self.handler.is_none() {
            return Err(EventError::validation("callback", "required"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(builder: SubscribeBuilder) -> SubscribeBuilder {
        builder.callback(|_ctx, _event| async { Ok(()) })
    }

    #[test]
    fn test_slug() {
        let builder = SubscribeBuilder::new()
            .topic("orders")
            .event_name("created")
            .group_id("g1");
        assert_eq!(builder.slug(), "orders.created.g1");
    }

    #[test]
    fn test_validate_requires_topic_and_callback() {
        let err = noop(SubscribeBuilder::new()).validate().unwrap_err();
        assert!(matches!(err, EventError::Validation { ref field, .. } if field == "topic"));

        let err = SubscribeBuilder::new().topic("orders").validate().unwrap_err();
        assert!(matches!(err, EventError::Validation { ref field, .. } if field == "callback"));

        assert!(noop(SubscribeBuilder::new().topic("orders")).validate().is_ok());
    }

    #[test]
    fn test_validate_event_name_shape() {
        let builder = noop(SubscribeBuilder::new().topic("orders").event_name("bad name"));
        assert!(builder.validate().is_err());
    }

    #[test]
    fn test_raw_callback_replaces_decoded() {
        let builder = noop(SubscribeBuilder::new())
            .callback_raw(|_ctx, _value| async { Ok(()) });
        assert!(matches!(builder.handler, Some(Handler::Raw(_))));
        assert!(format!("{:?}", builder).contains("raw"));
    }

    #[tokio::test]
    async fn test_callback_receives_event() {
        let builder = SubscribeBuilder::new().callback(|_ctx, event: Result<Event>| async move {
            let event = event?;
            if event.event_name == "fail" {
                return Err("boom".into());
            }
            Ok(())
        });
        let Some(Handler::Decoded(cb)) = builder.handler else {
            panic!("expected decoded handler");
        };

        let ok = Event {
            event_name: "ok".into(),
            ..Default::default()
        };
        let fail = Event {
            event_name: "fail".into(),
            ..Default::default()
        };
        assert!(cb(CancellationToken::new(), Ok(ok)).await.is_ok());
        assert!(cb(CancellationToken::new(), Ok(fail)).await.is_err());
    }
}
