//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DrainError, Result};

/// A broker connection target.
///
/// Shared by the connection factory registry, the transfer pipeline and
/// the recovery modules; immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Broker URL (e.g. `mem://source`).
    pub url: String,

    /// Username, if the broker requires authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password, if the broker requires authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Broker name used to scope management-interface queries.
    /// Drivers that address management objects per-endpoint may ignore it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_name: Option<String>,
}

impl EndpointConfig {
    /// Create an endpoint with no credentials.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            broker_name: None,
        }
    }

    /// Attach credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Transaction-recovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Directory for the commit-decision log.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// Seconds between background recovery sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl RecoveryConfig {
    /// Sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("drain-recovery")
}

fn default_sweep_interval() -> u64 {
    5
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainConfig {
    /// Source broker (drained).
    pub source: EndpointConfig,

    /// Target broker (receives the messages).
    pub target: EndpointConfig,

    /// Whether durable-subscription migration runs after queue migration.
    #[serde(default)]
    pub migrate_subscriptions: bool,

    /// Transaction-recovery settings.
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl DrainConfig {
    /// Build a configuration programmatically.
    pub fn new(source: EndpointConfig, target: EndpointConfig) -> Self {
        Self {
            source,
            target,
            migrate_subscriptions: false,
            recovery: RecoveryConfig::default(),
        }
    }

    /// Enable durable-subscription migration.
    pub fn with_subscriptions(mut self, enabled: bool) -> Self {
        self.migrate_subscriptions = enabled;
        self
    }

    /// Override the recovery store directory.
    pub fn with_recovery_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.recovery.store_dir = dir.into();
        self
    }

    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: DrainConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.source.url.trim().is_empty() {
            return Err(DrainError::Config("source.url must not be empty".into()));
        }
        if self.target.url.trim().is_empty() {
            return Err(DrainError::Config("target.url must not be empty".into()));
        }
        if self.source.url == self.target.url {
            return Err(DrainError::Config(
                "source and target brokers must differ".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml_minimal() {
        let config = DrainConfig::from_yaml(
            "source:\n  url: mem://a\ntarget:\n  url: mem://b\n",
        )
        .unwrap();
        assert_eq!(config.source.url, "mem://a");
        assert!(!config.migrate_subscriptions);
        assert_eq!(config.recovery.sweep_interval_secs, 5);
    }

    #[test]
    fn test_from_yaml_full() {
        let yaml = r#"
source:
  url: mem://a
  username: admin
  password: secret
  broker_name: amq
target:
  url: mem://b
migrate_subscriptions: true
recovery:
  store_dir: /tmp/drain
  sweep_interval_secs: 1
"#;
        let config = DrainConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.source.username.as_deref(), Some("admin"));
        assert!(config.migrate_subscriptions);
        assert_eq!(config.recovery.store_dir, PathBuf::from("/tmp/drain"));
    }

    #[test]
    fn test_same_url_rejected() {
        let err = DrainConfig::from_yaml("source:\n  url: mem://a\ntarget:\n  url: mem://a\n")
            .unwrap_err();
        assert!(matches!(err, DrainError::Config(_)));
    }

    #[test]
    fn test_empty_url_rejected() {
        let err =
            DrainConfig::from_yaml("source:\n  url: \"\"\ntarget:\n  url: mem://b\n").unwrap_err();
        assert!(matches!(err, DrainError::Config(_)));
    }
}
