//! Kafka consumer configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Security protocol used to reach the brokers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    /// Plaintext connection (no encryption).
    #[default]
    Plaintext,
    /// SSL/TLS encryption.
    Ssl,
    /// SASL authentication over plaintext.
    SaslPlaintext,
    /// SASL authentication over SSL/TLS.
    SaslSsl,
}

impl SecurityProtocol {
    /// Convert to rdkafka string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "PLAINTEXT",
            SecurityProtocol::Ssl => "SSL",
            SecurityProtocol::SaslPlaintext => "SASL_PLAINTEXT",
            SecurityProtocol::SaslSsl => "SASL_SSL",
        }
    }
}

/// Settings shared by every partition consumer the connector opens.
///
/// The topic and partition come from the checkpoint scope, not from here.
///
/// # Examples
///
/// ```rust
/// use viewsync_processor::kafka::KafkaSourceConfig;
///
/// let config = KafkaSourceConfig {
///     bootstrap_servers: vec!["localhost:9092".to_string()],
///     group_id: "viewsync".to_string(),
///     ..Default::default()
/// };
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaSourceConfig {
    /// Kafka broker addresses (host:port).
    pub bootstrap_servers: Vec<String>,

    /// Consumer group ID, reported to the brokers for monitoring.
    pub group_id: String,

    /// Client identifier.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Session timeout.
    #[serde(default = "default_session_timeout", with = "duration_millis")]
    pub session_timeout: Duration,

    /// Security protocol.
    #[serde(default)]
    pub security_protocol: SecurityProtocol,

    /// Additional librdkafka properties, applied last.
    #[serde(default)]
    pub extra_config: HashMap<String, String>,
}

fn default_client_id() -> String {
    "viewsync".to_string()
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for KafkaSourceConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: vec!["localhost:9092".to_string()],
            group_id: "viewsync".to_string(),
            client_id: default_client_id(),
            session_timeout: default_session_timeout(),
            security_protocol: SecurityProtocol::default(),
            extra_config: HashMap::new(),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl KafkaSourceConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.bootstrap_servers.is_empty() {
            return Err("bootstrap_servers cannot be empty".to_string());
        }

        if self.group_id.is_empty() {
            return Err("group_id cannot be empty".to_string());
        }

        if self.extra_config.contains_key("enable.auto.commit") {
            return Err("enable.auto.commit is managed by the consumer and cannot be set".to_string());
        }

        Ok(())
    }

    /// Comma separated broker list.
    pub fn brokers(&self) -> String {
        self.bootstrap_servers.join(",")
    }

    /// librdkafka properties for a partition consumer.
    ///
    /// Broker-side commits are disabled; checkpoints live in the checkpoint
    /// store.
    pub fn to_rdkafka_config(&self) -> HashMap<String, String> {
        let mut config = HashMap::new();

        config.insert("bootstrap.servers".to_string(), self.brokers());
        config.insert("group.id".to_string(), self.group_id.clone());
        config.insert("client.id".to_string(), self.client_id.clone());
        config.insert(
            "session.timeout.ms".to_string(),
            self.session_timeout.as_millis().to_string(),
        );
        config.insert(
            "security.protocol".to_string(),
            self.security_protocol.as_str().to_string(),
        );

        for (key, value) in &self.extra_config {
            config.insert(key.clone(), value.clone());
        }

        config.insert("enable.auto.commit".to_string(), "false".to_string());
        config.insert("enable.auto.offset.store".to_string(), "false".to_string());
        config.insert("enable.partition.eof".to_string(), "false".to_string());

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rdkafka_config_disables_broker_commits() {
        let mut config = KafkaSourceConfig {
            bootstrap_servers: vec!["k1:9092".to_string(), "k2:9092".to_string()],
            ..Default::default()
        };
        config
            .extra_config
            .insert("fetch.min.bytes".to_string(), "1024".to_string());

        let rd = config.to_rdkafka_config();
        assert_eq!(rd.get("bootstrap.servers").unwrap(), "k1:9092,k2:9092");
        assert_eq!(rd.get("enable.auto.commit").unwrap(), "false");
        assert_eq!(rd.get("fetch.min.bytes").unwrap(), "1024");
        assert_eq!(rd.get("session.timeout.ms").unwrap(), "30000");
    }

    #[test]
    fn test_validation() {
        assert!(KafkaSourceConfig::default().validate().is_ok());

        let empty = KafkaSourceConfig {
            bootstrap_servers: vec![],
            ..Default::default()
        };
        assert!(empty.validate().is_err());

        let mut auto_commit = KafkaSourceConfig::default();
        auto_commit
            .extra_config
            .insert("enable.auto.commit".to_string(), "true".to_string());
        assert!(auto_commit.validate().is_err());
    }
}
