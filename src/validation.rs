//! Field validation for outgoing events, audit logs and subscriptions
//!
//! Audit-log validation sits behind the `Validator` trait so applications
//! can swap in their own rules; `AuditLogValidator` implements the standard
//! required / enum / format / conditional-required checks.

use crate::error::{EventError, Result};
use crate::types::{AuditLog, Event};
use regex::Regex;
use std::sync::OnceLock;

/// Structural validation of an assembled audit log
pub trait Validator: Send + Sync {
    /// Ok if the record may be published, otherwise the first failing field
    fn validate_audit_log(&self, log: &AuditLog) -> Result<()>;
}

/// Default audit-log rules
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditLogValidator;

impl Validator for AuditLogValidator {
    fn validate_audit_log(&self, log: &AuditLog) -> Result<()> {
        required("_id", &log.id)?;
        required("category", &log.category)?;
        required("actionName", &log.action_name)?;
        if log.timestamp <= 0 {
            return Err(EventError::validation("timestamp", "required"));
        }

        required("actor", &log.actor)?;
        uuid4("actor", &log.actor)?;
        if log.actor_type.is_none() {
            return Err(EventError::validation(
                "actorType",
                "required; actorType values: USER CLIENT",
            ));
        }
        required("clientId", &log.client_id)?;
        uuid4("clientId", &log.client_id)?;
        required("actorNamespace", &log.actor_namespace)?;
        if log.object_namespace.is_empty() {
            return Err(EventError::validation(
                "objectNamespace",
                "required; use publisher namespace if resource has no namespace",
            ));
        }
        if !log.target_user_id.is_empty() {
            uuid4("targetUserId", &log.target_user_id)?;
        }

        let diff = &log.payload.diff;
        if diff.is_supplied() && (diff.before.is_none() || diff.after.is_none()) {
            return Err(EventError::validation(
                "payload.diff",
                "before and after must both be set when a diff is supplied",
            ));
        }

        Ok(())
    }
}

fn required(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(EventError::validation(field, "required"));
    }
    Ok(())
}

fn uuid4(field: &str, value: &str) -> Result<()> {
    if !is_uuid4_without_hyphens(value) {
        return Err(EventError::validation(
            field,
            "must be a UUID v4 without hyphens",
        ));
    }
    Ok(())
}

fn uuid4_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-f]{8}[0-9a-f]{4}4[0-9a-f]{3}[89ab][0-9a-f]{3}[0-9a-f]{12}$")
            .expect("valid uuid regex")
    })
}

fn name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9]+(['_.\-][a-zA-Z0-9]+)*$").expect("valid name regex")
    })
}

fn namespace_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9]+(-[a-zA-Z0-9]+)*$").expect("valid namespace regex")
    })
}

/// Lowercase 32-char UUID v4 (version nibble 4, variant 8/9/a/b)
pub fn is_uuid4_without_hyphens(value: &str) -> bool {
    uuid4_regex().is_match(value)
}

/// Topic names: alphanumeric segments joined by single `'`, `_`, `.` or `-`
pub fn validate_topic(topic: &str) -> Result<()> {
    required("topic", topic)?;
    if !name_regex().is_match(topic) {
        return Err(EventError::validation("topic", format!("invalid topic name '{}'", topic)));
    }
    Ok(())
}

/// Event names follow the same shape as topic names
pub fn validate_event_name(name: &str) -> Result<()> {
    required("name", name)?;
    if !name_regex().is_match(name) {
        return Err(EventError::validation("name", format!("invalid event name '{}'", name)));
    }
    Ok(())
}

/// Checks applied to every outgoing event before it is serialized
///
/// Strict mode additionally enforces ID formats and namespace shape.
pub fn validate_event(event: &Event, strict: bool) -> Result<()> {
    validate_topic(&event.topic)?;
    validate_event_name(&event.event_name)?;

    if strict {
        if !event.user_id.is_empty() {
            uuid4("userId", &event.user_id)?;
        }
        if !event.client_id.is_empty() {
            uuid4("clientId", &event.client_id)?;
        }
        if !event.namespace.is_empty() && !namespace_regex().is_match(&event.namespace) {
            return Err(EventError::validation(
                "namespace",
                format!("invalid namespace '{}'", event.namespace),
            ));
        }
    }

    Ok(())
}
