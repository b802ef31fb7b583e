//! Broker client configuration
//!
//! Zero durations are replaced by defaults when the client is built.
//! `base_config` carries raw transport properties and overrides
//! everything derived from the typed fields.

use crate::error::{EventError, Result};
use crate::metrics::MetricsSink;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Default interval between auto-commit flushes
pub const DEFAULT_AUTO_COMMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Default upper bound on delivering one message, retries included
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(60);

/// Authentication type that enables SASL/PLAIN over TLS
pub const AUTH_TYPE_SASL: &str = "SASL";

/// Custom configuration for the message broker
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    // -- consumer --
    /// Commit every message individually instead of buffering offsets
    /// for the periodic auto-commit flush.
    pub disable_auto_commit: bool,

    /// Flush interval for buffered offsets; only used with auto-commit
    pub auto_commit_interval: Duration,

    /// Commit right after the poll, before the callback runs
    pub commit_before_processing: bool,

    // -- publisher --
    pub publish_timeout: Duration,

    // -- general --
    /// Raw transport properties (librdkafka names), highest precedence
    pub base_config: HashMap<String, serde_json::Value>,

    /// Enforce ID and namespace formats on published events
    pub strict_validation: bool,

    pub ca_cert_file: Option<String>,

    pub dial_timeout: Option<Duration>,

    pub security_config: Option<SecurityConfig>,

    #[serde(skip)]
    pub metrics: Option<Arc<dyn MetricsSink>>,
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("disable_auto_commit", &self.disable_auto_commit)
            .field("auto_commit_interval", &self.auto_commit_interval)
            .field("commit_before_processing", &self.commit_before_processing)
            .field("publish_timeout", &self.publish_timeout)
            .field("base_config", &self.base_config)
            .field("strict_validation", &self.strict_validation)
            .field("ca_cert_file", &self.ca_cert_file)
            .field("dial_timeout", &self.dial_timeout)
            .field("security_config", &self.security_config)
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

/// Credentials for an authenticated broker connection
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub authentication_type: String,
    pub sasl_username: String,
    pub sasl_password: String,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("authentication_type", &self.authentication_type)
            .field("sasl_username", &self.sasl_username)
            .field("sasl_password", &"<redacted>")
            .finish()
    }
}

impl BrokerConfig {
    /// Fill zero-valued durations with their defaults
    pub fn normalized(mut self) -> Self {
        if self.auto_commit_interval.is_zero() {
            self.auto_commit_interval = DEFAULT_AUTO_COMMIT_INTERVAL;
        }
        if self.publish_timeout.is_zero() {
            self.publish_timeout = DEFAULT_PUBLISH_TIMEOUT;
        }
        self
    }

    /// Check settings that would make the transport unusable
    pub fn validate(&self) -> Result<()> {
        if let Some(security) = &self.security_config {
            match security.authentication_type.as_str() {
                "" => {}
                t if t.eq_ignore_ascii_case(AUTH_TYPE_SASL) => {
                    if security.sasl_username.is_empty() || security.sasl_password.is_empty() {
                        return Err(EventError::Config(
                            "SASL authentication requires a username and password".to_string(),
                        ));
                    }
                }
                other => {
                    return Err(EventError::Config(format!(
                        "unsupported authentication type '{}'",
                        other
                    )));
                }
            }
        }
        Ok(())
    }

    /// Transport properties in librdkafka naming
    ///
    /// Offsets are committed by the subscriber engine, so the transport's
    /// own auto-commit is always switched off.
    pub fn transport_properties(&self, brokers: &[String]) -> Result<BTreeMap<String, String>> {
        self.validate()?;

        let mut props = BTreeMap::new();
        props.insert("bootstrap.servers".to_string(), brokers.join(","));
        props.insert("enable.auto.commit".to_string(), "false".to_string());
        props.insert("enable.auto.offset.store".to_string(), "false".to_string());

        let publish_timeout = if self.publish_timeout.is_zero() {
            DEFAULT_PUBLISH_TIMEOUT
        } else {
            self.publish_timeout
        };
        props.insert(
            "message.timeout.ms".to_string(),
            publish_timeout.as_millis().to_string(),
        );

        if let Some(dial) = self.dial_timeout {
            props.insert(
                "socket.connection.setup.timeout.ms".to_string(),
                dial.as_millis().to_string(),
            );
        }

        if let Some(ca) = &self.ca_cert_file {
            props.insert("security.protocol".to_string(), "ssl".to_string());
            props.insert("ssl.ca.location".to_string(), ca.clone());
        }

        if let Some(security) = &self.security_config {
            if security.authentication_type.eq_ignore_ascii_case(AUTH_TYPE_SASL) {
                props.insert("security.protocol".to_string(), "sasl_ssl".to_string());
                props.insert("sasl.mechanism".to_string(), "PLAIN".to_string());
                props.insert("sasl.username".to_string(), security.sasl_username.clone());
                props.insert("sasl.password".to_string(), security.sasl_password.clone());
            }
        }

        for (key, value) in &self.base_config {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            props.insert(key.clone(), value);
        }

        Ok(props)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brokers() -> Vec<String> {
        vec!["localhost:9092".to_string(), "localhost:9093".to_string()]
    }

    #[test]
    fn test_normalized_defaults() {
        let config = BrokerConfig::default().normalized();
        assert_eq!(config.auto_commit_interval, Duration::from_secs(1));
        assert_eq!(config.publish_timeout, Duration::from_secs(60));
        assert!(!config.disable_auto_commit);
        assert!(!config.commit_before_processing);
    }

    #[test]
    fn test_normalized_keeps_explicit_values() {
        let config = BrokerConfig {
            auto_commit_interval: Duration::from_millis(250),
            publish_timeout: Duration::from_secs(5),
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.auto_commit_interval, Duration::from_millis(250));
        assert_eq!(config.publish_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_transport_properties_basics() {
        let config = BrokerConfig {
            publish_timeout: Duration::from_secs(10),
            dial_timeout: Some(Duration::from_secs(3)),
            ca_cert_file: Some("/etc/ca.pem".into()),
            ..Default::default()
        };
        let props = config.transport_properties(&brokers()).unwrap();
        assert_eq!(props["bootstrap.servers"], "localhost:9092,localhost:9093");
        assert_eq!(props["enable.auto.commit"], "false");
        assert_eq!(props["message.timeout.ms"], "10000");
        assert_eq!(props["socket.connection.setup.timeout.ms"], "3000");
        assert_eq!(props["ssl.ca.location"], "/etc/ca.pem");
        assert_eq!(props["security.protocol"], "ssl");
    }

    #[test]
    fn test_transport_properties_sasl() {
        let config = BrokerConfig {
            security_config: Some(SecurityConfig {
                authentication_type: "SASL".into(),
                sasl_username: "svc".into(),
                sasl_password: "secret".into(),
            }),
            ..Default::default()
        };
        let props = config.transport_properties(&brokers()).unwrap();
        assert_eq!(props["security.protocol"], "sasl_ssl");
        assert_eq!(props["sasl.mechanism"], "PLAIN");
        assert_eq!(props["sasl.username"], "svc");
    }

    #[test]
    fn test_base_config_has_highest_precedence() {
        let mut base = HashMap::new();
        base.insert("message.timeout.ms".to_string(), serde_json::json!(1234));
        base.insert("security.protocol".to_string(), serde_json::json!("plaintext"));
        let config = BrokerConfig {
            ca_cert_file: Some("/etc/ca.pem".into()),
            base_config: base,
            ..Default::default()
        };
        let props = config.transport_properties(&brokers()).unwrap();
        assert_eq!(props["message.timeout.ms"], "1234");
        assert_eq!(props["security.protocol"], "plaintext");
    }

    #[test]
    fn test_malformed_security_config() {
        let missing_password = BrokerConfig {
            security_config: Some(SecurityConfig {
                authentication_type: "SASL".into(),
                sasl_username: "svc".into(),
                sasl_password: String::new(),
            }),
            ..Default::default()
        };
        assert!(matches!(missing_password.validate(), Err(EventError::Config(_))));

        let unknown = BrokerConfig {
            security_config: Some(SecurityConfig {
                authentication_type: "kerberos".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            unknown.transport_properties(&brokers()),
            Err(EventError::Config(_))
        ));
    }

    #[test]
    fn test_security_config_debug_redacts_password() {
        let security = SecurityConfig {
            authentication_type: "SASL".into(),
            sasl_username: "svc".into(),
            sasl_password: "hunter2".into(),
        };
        assert!(!format!("{:?}", security).contains("hunter2"));
    }
}
