//! Configuration model for deploying the controller and agent
//!
//! Configuration files are YAML and decoded strictly: unknown fields are
//! rejected so that typos fail at startup rather than silently doing nothing.

use std::time::Duration;

use serde::Deserialize;

use crate::Filter;

/// PEM-encoded certificates and keys for one party in mTLS
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MtlsConfig {
    /// CA certificate used to validate the other party
    pub ca: String,
    /// Private key of this party
    pub key: String,
    /// Certificate of this party
    pub cert: String,
}

/// All relevant configuration for deploying an agent
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct AgentConfig {
    /// Controller endpoint that the agent should connect to, as `host:port`
    /// or an RFC 3986 authority
    pub endpoint: String,
    /// mTLS configuration for the agent
    #[serde(rename = "mTLSConfig")]
    pub mtls_config: MtlsConfig,
    /// Slurm interaction configuration
    pub slurm_config: SlurmConfig,
}

/// Slurm-specific agent configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SlurmConfig {
    /// Account that batch jobs are billed to
    pub account: String,
    /// Partition that batch jobs are submitted into
    pub partition: String,
    /// Filter limiting the exposed nodes and jobs
    #[serde(default)]
    pub filter: Filter,
}

/// All relevant configuration for deploying a controller
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Port that the controller endpoint binds to
    pub port: u16,
    /// mTLS configuration for the controller
    #[serde(rename = "mTLSConfig")]
    pub mtls_config: MtlsConfig,
    /// Reconciliation configuration
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

/// Reconciliation loop intervals
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ReconcileConfig {
    /// Node reconciliation interval in seconds
    #[serde(default = "default_node_interval")]
    pub node_interval_seconds: u64,
    /// Workload reconciliation interval in seconds
    #[serde(default = "default_workload_interval")]
    pub workload_interval_seconds: u64,
}

fn default_node_interval() -> u64 {
    30
}

fn default_workload_interval() -> u64 {
    10
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            node_interval_seconds: default_node_interval(),
            workload_interval_seconds: default_workload_interval(),
        }
    }
}

impl ReconcileConfig {
    /// Node reconciliation interval
    pub fn node_interval(&self) -> Duration {
        Duration::from_secs(self.node_interval_seconds)
    }

    /// Workload reconciliation interval
    pub fn workload_interval(&self) -> Duration {
        Duration::from_secs(self.workload_interval_seconds)
    }
}

/// Decode a configuration struct from the given YAML bytes
pub fn decode<T: serde::de::DeserializeOwned>(input: &[u8]) -> crate::Result<T> {
    serde_yaml::from_slice(input)
        .map_err(|e| crate::Error::config(format!("decoding configuration failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGENT_YAML: &str = r#"
endpoint: controller.example.com:40404
mTLSConfig:
  ca: ca-pem
  key: key-pem
  cert: cert-pem
slurmConfig:
  account: project_123456789
  partition: standard
  filter:
    partition: ^standard$
"#;

    #[test]
    fn test_decode_agent_config() {
        let config: AgentConfig = decode(AGENT_YAML.as_bytes()).unwrap();
        assert_eq!(config.endpoint, "controller.example.com:40404");
        assert_eq!(config.mtls_config.ca, "ca-pem");
        assert_eq!(config.slurm_config.account, "project_123456789");
        assert!(config.slurm_config.filter.partition("standard"));
        assert!(!config.slurm_config.filter.partition("gpu"));
    }

    #[test]
    fn test_decode_controller_config_with_defaults() {
        let yaml = r#"
port: 40404
mTLSConfig:
  ca: ca-pem
  key: key-pem
  cert: cert-pem
"#;
        let config: ControllerConfig = decode(yaml.as_bytes()).unwrap();
        assert_eq!(config.port, 40404);
        assert_eq!(config.reconcile.node_interval(), Duration::from_secs(30));
        assert_eq!(
            config.reconcile.workload_interval(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let yaml = format!("{AGENT_YAML}\nbogus: true");
        assert!(decode::<AgentConfig>(yaml.as_bytes()).is_err());
    }
}
