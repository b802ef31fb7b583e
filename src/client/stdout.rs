//! Stdout client — prints every published event, consumes nothing
//!
//! Useful for local development: events and audit logs are validated and
//! serialized exactly as the broker client would, then written to standard
//! output as pretty JSON. Subscriptions register but never receive.

use super::Client;
use crate::audit::AuditLogBuilder;
use crate::error::Result;
use crate::id::UuidGenerator;
use crate::publish::PublishBuilder;
use crate::subscribe::SubscribeBuilder;
use crate::subscriber::SubscriptionHandle;
use crate::types::{Message, Metadata};
use crate::validation::AuditLogValidator;
use async_trait::async_trait;
use std::io::Write;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct StdoutClient {
    prefix: String,
}

impl StdoutClient {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn topic(&self, topic: &str) -> String {
        if self.prefix.is_empty() {
            topic.to_string()
        } else {
            format!("{}.{}", self.prefix, topic)
        }
    }

    /// Render a message as `<topic>: <pretty json>`
    fn render(&self, message: &Message) -> Result<String> {
        let value: serde_json::Value = serde_json::from_slice(&message.value)?;
        Ok(format!(
            "{}: {}",
            self.topic(&message.topic),
            serde_json::to_string_pretty(&value)?
        ))
    }

    fn print(&self, message: &Message) -> Result<()> {
        let line = self.render(message)?;
        let mut out = std::io::stdout().lock();
        if let Err(e) = writeln!(out, "{}", line) {
            tracing::warn!(error = %e, "Failed to write event to stdout");
        }
        Ok(())
    }
}

#[async_trait]
impl Client for StdoutClient {
    async fn publish(&self, builder: PublishBuilder) -> Result<()> {
        self.print(&builder.build()?)
    }

    async fn publish_sync(&self, builder: PublishBuilder, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(crate::error::EventError::Cancelled);
        }
        self.print(&builder.build()?)
    }

    async fn register(
        &self,
        builder: SubscribeBuilder,
        cancel: CancellationToken,
    ) -> Result<SubscriptionHandle> {
        builder.validate()?;
        tracing::debug!(slug = %builder.slug(), "Stdout client ignores subscriptions");
        Ok(SubscriptionHandle::idle(builder.slug(), cancel))
    }

    async fn publish_audit_log(
        &self,
        builder: AuditLogBuilder,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.print(&builder.build_with(&UuidGenerator, &AuditLogValidator)?)
    }

    async fn get_metadata(&self, topic: &str, _timeout: Duration) -> Result<Metadata> {
        Ok(Metadata {
            topic: self.topic(topic),
            partitions: Vec::new(),
        })
    }

    fn name(&self) -> &str {
        "stdout"
    }
}
