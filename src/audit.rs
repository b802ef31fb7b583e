//! Audit-log builder
//!
//! Builds an `AuditLog`, runs it through a `Validator` and serializes it.
//! Invalid records never produce a message.

use crate::error::{EventError, Result};
use crate::id::{IdGenerator, UuidGenerator};
use crate::types::{ActorType, AuditLog, AuditLogDiff, AuditLogPayload, Fields, Message};
use crate::validation::{AuditLogValidator, Validator};
use bytes::Bytes;

/// Topic audit logs are published to (before the client prefix)
pub const AUDIT_LOG_TOPIC: &str = "auditLog";

/// Accumulates the fields of one audit-log record
#[derive(Debug, Clone, Default)]
pub struct AuditLogBuilder {
    category: String,
    action_name: String,
    ip: String,
    actor: String,
    actor_type: Option<ActorType>,
    client_id: String,
    actor_namespace: String,
    object_id: String,
    object_type: String,
    object_namespace: String,
    target_user_id: String,
    device_id: String,
    content: Option<Fields>,
    diff: Option<AuditLogDiff>,
    key: String,
}

impl AuditLogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn action_name(mut self, action_name: impl Into<String>) -> Self {
        self.action_name = action_name.into();
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = ip.into();
        self
    }

    /// Acting user or client ID (UUID v4 without hyphens)
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = Some(actor_type);
        self
    }

    /// `true` for USER, `false` for CLIENT
    pub fn is_actor_type_user(self, is_user: bool) -> Self {
        self.actor_type(if is_user {
            ActorType::User
        } else {
            ActorType::Client
        })
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn actor_namespace(mut self, actor_namespace: impl Into<String>) -> Self {
        self.actor_namespace = actor_namespace.into();
        self
    }

    pub fn object_id(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = object_id.into();
        self
    }

    pub fn object_type(mut self, object_type: impl Into<String>) -> Self {
        self.object_type = object_type.into();
        self
    }

    pub fn object_namespace(mut self, object_namespace: impl Into<String>) -> Self {
        self.object_namespace = object_namespace.into();
        self
    }

    pub fn target_user_id(mut self, target_user_id: impl Into<String>) -> Self {
        self.target_user_id = target_user_id.into();
        self
    }

    pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    pub fn content(mut self, content: Fields) -> Self {
        self.content = Some(content);
        self
    }

    /// Before/after state; both sides must be set
    pub fn diff(mut self, diff: AuditLogDiff) -> Self {
        self.diff = Some(diff);
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Build with the default ID source and validator
    pub fn build(self) -> Result<Message> {
        self.build_with(&UuidGenerator, &AuditLogValidator)
    }

    /// Assemble, validate and serialize the record
    pub fn build_with(self, ids: &dyn IdGenerator, validator: &dyn Validator) -> Result<Message> {
        let audit_log = AuditLog {
            id: ids.generate(),
            category: self.category,
            action_name: self.action_name,
            timestamp: chrono::Utc::now().timestamp_millis(),
            ip: self.ip,
            actor: self.actor,
            actor_type: self.actor_type,
            client_id: self.client_id,
            actor_namespace: self.actor_namespace,
            object_id: self.object_id,
            object_type: self.object_type,
            object_namespace: self.object_namespace,
            target_user_id: self.target_user_id,
            device_id: self.device_id,
            payload: AuditLogPayload {
                content: self.content.unwrap_or_default(),
                diff: self.diff.unwrap_or_default(),
            },
        };

        if let Err(e) = validator.validate_audit_log(&audit_log) {
            tracing::error!(
                action = %audit_log.action_name,
                error = %e,
                "Unable to validate audit log"
            );
            return Err(e);
        }

        let value = serde_json::to_vec(&audit_log).map_err(|e| {
            tracing::error!(action = %audit_log.action_name, error = %e, "Unable to marshal audit log");
            EventError::Decode(e)
        })?;

        Ok(Message {
            topic: AUDIT_LOG_TOPIC.to_string(),
            key: Bytes::from(self.key),
            value: Bytes::from(value),
        })
    }
}
