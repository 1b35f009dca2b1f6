//! Configuration management for a registry node
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (schemalog.toml)
//! - Environment variables (SCHEMALOG__*)
//!
//! ## Example config file (schemalog.toml):
//! ```toml
//! [node]
//! node_id = "sr-1"
//! host = "registry-1.internal"
//! port = 8081
//! master_eligibility = true
//!
//! [election]
//! strategy = "lowest"
//!
//! [registry]
//! default_compatibility = "BACKWARD"
//! topic = "_schemas"
//! catch_up_timeout_ms = 5000
//!
//! [compatibility]
//! strict = false
//! ```

use std::path::Path;
use std::time::Duration;

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::compatibility::{CompatibilityChecker, CompatibilityMode};
use crate::coordination::{ElectionStrategy, GroupCoordinator, NodeIdentity};
use crate::store::ReaderSettings;

/// Main configuration for a registry node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub election: ElectionConfig,

    #[serde(default)]
    pub registry: StoreConfig,

    #[serde(default)]
    pub compatibility: CheckerConfig,
}

/// Identity this node advertises to the group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Whether this node may become the writer
    #[serde(default = "default_true")]
    pub master_eligibility: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElectionConfig {
    #[serde(default)]
    pub strategy: ElectionStrategy,
}

/// Log, replay and write-path settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Mode used when neither the subject nor the global setting is set
    #[serde(default)]
    pub default_compatibility: CompatibilityMode,

    /// Name of the schema log topic
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Upper bound on the append and on the wait for it to be applied
    #[serde(default = "default_catch_up_timeout_ms")]
    pub catch_up_timeout_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckerConfig {
    /// Treat lints (protobuf fields removed without reservation) as breaking
    #[serde(default)]
    pub strict: bool,
}

fn default_node_id() -> String {
    "sr-1".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8081
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_true() -> bool {
    true
}

fn default_topic() -> String {
    "_schemas".to_string()
}

fn default_catch_up_timeout_ms() -> u64 {
    5_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_batch_size() -> usize {
    500
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            host: default_host(),
            port: default_port(),
            scheme: default_scheme(),
            master_eligibility: true,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_compatibility: CompatibilityMode::default(),
            topic: default_topic(),
            catch_up_timeout_ms: default_catch_up_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
        }
    }
}

impl RegistryConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration, with `config_path` layered over the default locations
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        for location in ["schemalog.toml", ".schemalog.toml", "config/schemalog.toml"] {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        if let Some(dirs) = directories::ProjectDirs::from("dev", "schemalog", "schemalog") {
            let xdg_config = dirs.config_dir().join("schemalog.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("SCHEMALOG")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the node cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.node_id.trim().is_empty() {
            return Err(ConfigError::Message("node.node_id must not be empty".into()));
        }
        if self.registry.topic.trim().is_empty() {
            return Err(ConfigError::Message("registry.topic must not be empty".into()));
        }
        if self.registry.batch_size == 0 {
            return Err(ConfigError::Message("registry.batch_size must be at least 1".into()));
        }
        if self.registry.poll_interval_ms == 0 || self.registry.catch_up_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "registry.poll_interval_ms and registry.catch_up_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let content = self
            .to_toml()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    pub fn node_identity(&self) -> NodeIdentity {
        NodeIdentity {
            node_id: self.node.node_id.clone(),
            host: self.node.host.clone(),
            port: self.node.port,
            scheme: self.node.scheme.clone(),
        }
    }

    pub fn catch_up_timeout(&self) -> Duration {
        Duration::from_millis(self.registry.catch_up_timeout_ms)
    }

    pub fn reader_settings(&self) -> ReaderSettings {
        ReaderSettings {
            poll_interval: Duration::from_millis(self.registry.poll_interval_ms),
            batch_size: self.registry.batch_size,
        }
    }

    /// Coordinator electing among eligible members with the configured strategy
    pub fn coordinator(&self) -> GroupCoordinator {
        GroupCoordinator::new(self.election.strategy)
    }

    pub fn checker(&self) -> CompatibilityChecker {
        CompatibilityChecker::new().with_strict(self.compatibility.strict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RegistryConfig::default();
        assert_eq!(config.node.node_id, "sr-1");
        assert_eq!(config.node.port, 8081);
        assert!(config.node.master_eligibility);
        assert_eq!(config.election.strategy, ElectionStrategy::Lowest);
        assert_eq!(config.registry.default_compatibility, CompatibilityMode::Backward);
        assert_eq!(config.registry.topic, "_schemas");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_config() {
        let toml_str = RegistryConfig::default().to_toml().unwrap();
        assert!(toml_str.contains("[node]"));
        assert!(toml_str.contains("[registry]"));
        assert!(toml_str.contains("default_compatibility = \"BACKWARD\""));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[node]
node_id = "sr-2"
port = 9081
master_eligibility = false

[election]
strategy = "highest"

[registry]
default_compatibility = "FULL_TRANSITIVE"
catch_up_timeout_ms = 250

[compatibility]
strict = true
"#
        )
        .unwrap();

        let config = RegistryConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.node_identity().url(), "http://127.0.0.1:9081");
        assert!(!config.node.master_eligibility);
        assert_eq!(config.election.strategy, ElectionStrategy::Highest);
        assert_eq!(config.registry.default_compatibility, CompatibilityMode::FullTransitive);
        assert_eq!(config.catch_up_timeout(), Duration::from_millis(250));
        assert_eq!(config.registry.batch_size, 500);
        assert!(config.compatibility.strict);
    }

    #[test]
    fn test_coordinator_uses_configured_strategy() {
        use crate::coordination::LeadershipProvider;

        let mut config = RegistryConfig::default();
        config.election.strategy = ElectionStrategy::Highest;
        let group = config.coordinator();
        group.join(NodeIdentity::new("a", "registry-a", 8081), true);
        group.join(NodeIdentity::new("b", "registry-b", 8081), true);
        group.join(NodeIdentity::new("c", "registry-c", 8081), false);
        assert_eq!(group.leader().map(|n| n.node_id), Some("b".to_string()));
    }

    #[test]
    fn test_save_round_trip_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schemalog.toml");
        let mut config = RegistryConfig::default();
        config.registry.topic = "_schemas_test".into();
        config.save(&path).unwrap();

        let loaded = RegistryConfig::load_from(Some(&path)).unwrap();
        assert_eq!(loaded.registry.topic, "_schemas_test");

        config.registry.batch_size = 0;
        assert!(config.validate().is_err());
    }
}
