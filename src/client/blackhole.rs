//! No-op client — accepts everything, delivers nothing

use super::Client;
use crate::audit::AuditLogBuilder;
use crate::error::Result;
use crate::publish::PublishBuilder;
use crate::subscribe::SubscribeBuilder;
use crate::subscriber::SubscriptionHandle;
use crate::types::Metadata;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default)]
pub struct BlackholeClient;

impl BlackholeClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Client for BlackholeClient {
    async fn publish(&self, _builder: PublishBuilder) -> Result<()> {
        Ok(())
    }

    async fn publish_sync(&self, _builder: PublishBuilder, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn register(
        &self,
        builder: SubscribeBuilder,
        cancel: CancellationToken,
    ) -> Result<SubscriptionHandle> {
        Ok(SubscriptionHandle::idle(builder.slug(), cancel))
    }

    async fn publish_audit_log(
        &self,
        _builder: AuditLogBuilder,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(())
    }

    async fn get_metadata(&self, topic: &str, _timeout: Duration) -> Result<Metadata> {
        Ok(Metadata {
            topic: topic.to_string(),
            partitions: Vec::new(),
        })
    }

    fn name(&self) -> &str {
        "none"
    }
}
