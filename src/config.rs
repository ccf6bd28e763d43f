//! Configuration loading and validation for the node process.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::ManagerError;

/// Root configuration for a node, matching the recognized options in the
/// external-interfaces table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Capacity of the warm VM pool.
    #[serde(default = "default_pool_size")]
    pub machine_pool_size: usize,
    /// Skip CNI state reset on startup.
    #[serde(default)]
    pub preserve_network: bool,
    /// Workload types this node accepts.
    pub workload_types: Vec<String>,
    /// Issuer allow-list for signed workload claims.
    #[serde(default)]
    pub valid_issuers: Vec<String>,
    /// Free-form node tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Host the guest agent should dial to reach the node.
    #[serde(default = "default_internal_host")]
    pub internal_node_host: String,
    /// Port the guest agent should dial to reach the node.
    #[serde(default = "default_internal_port")]
    pub internal_node_port: u16,

    /// Handshake deadline. A config hook was claimed by the original source but
    /// never wired up; here it genuinely is.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Deploy request timeout.
    #[serde(default = "default_deploy_timeout_ms")]
    pub deploy_timeout_ms: u64,
    /// Undeploy request timeout.
    #[serde(default = "default_undeploy_timeout_ms")]
    pub undeploy_timeout_ms: u64,
    /// Trigger request timeout.
    #[serde(default = "default_trigger_timeout_ms")]
    pub trigger_timeout_ms: u64,
    /// If true, a failed first handshake always aborts the node, even in tests
    /// that intentionally simulate flakiness.
    #[serde(default = "default_strict_first_handshake")]
    pub strict_first_handshake: bool,

    /// OTLP collector endpoint; when absent, spans are created but not exported.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
    /// Internal (host<->guest) bus connection string.
    #[serde(default = "default_internal_bus_url")]
    pub internal_bus_url: String,
    /// External (control plane) bus connection string.
    #[serde(default = "default_external_bus_url")]
    pub external_bus_url: String,
    /// CNI state directory, cleared on start unless `preserve_network`.
    #[serde(default = "default_cni_state_dir")]
    pub cni_state_dir: String,
    /// Directory Firecracker control sockets are created under.
    #[serde(default)]
    pub firecracker_socket_dir: Option<String>,
}

fn default_pool_size() -> usize {
    4
}
fn default_internal_host() -> String {
    "127.0.0.1".to_string()
}
fn default_internal_port() -> u16 {
    9901
}
fn default_handshake_timeout_ms() -> u64 {
    5_000
}
fn default_deploy_timeout_ms() -> u64 {
    1_000
}
fn default_undeploy_timeout_ms() -> u64 {
    500
}
fn default_trigger_timeout_ms() -> u64 {
    10_000
}
fn default_strict_first_handshake() -> bool {
    true
}
fn default_internal_bus_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}
fn default_external_bus_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}
fn default_cni_state_dir() -> String {
    "/var/lib/cni".to_string()
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_str(&content)?;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (does not validate).
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse TOML configuration")
    }

    /// Build a minimal config suitable for tests.
    pub fn minimal(workload_types: &[&str]) -> Self {
        Self {
            machine_pool_size: default_pool_size(),
            preserve_network: false,
            workload_types: workload_types.iter().map(|s| s.to_string()).collect(),
            valid_issuers: Vec::new(),
            tags: Vec::new(),
            internal_node_host: default_internal_host(),
            internal_node_port: default_internal_port(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            deploy_timeout_ms: default_deploy_timeout_ms(),
            undeploy_timeout_ms: default_undeploy_timeout_ms(),
            trigger_timeout_ms: default_trigger_timeout_ms(),
            strict_first_handshake: default_strict_first_handshake(),
            otlp_endpoint: None,
            internal_bus_url: default_internal_bus_url(),
            external_bus_url: default_external_bus_url(),
            cni_state_dir: default_cni_state_dir(),
            firecracker_socket_dir: None,
        }
    }

    /// Validate the configuration. The manager refuses to start on failure.
    pub fn validate(&self) -> Result<(), ManagerError> {
        if self.machine_pool_size == 0 {
            return Err(ManagerError::ConfigInvalid(
                "machine_pool_size must be greater than zero".to_string(),
            ));
        }
        if self.workload_types.is_empty() {
            return Err(ManagerError::ConfigInvalid(
                "workload_types must not be empty".to_string(),
            ));
        }
        let unique: HashSet<&String> = self.workload_types.iter().collect();
        if unique.len() != self.workload_types.len() {
            return Err(ManagerError::ConfigInvalid(
                "workload_types must not contain duplicates".to_string(),
            ));
        }
        if self.internal_node_host.trim().is_empty() {
            return Err(ManagerError::ConfigInvalid(
                "internal_node_host must not be empty".to_string(),
            ));
        }
        if self.internal_node_port == 0 {
            return Err(ManagerError::ConfigInvalid(
                "internal_node_port must not be zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a workload type supports trigger subjects. All supported types do
    /// today; kept as its own predicate so the rule has one place to change.
    pub fn supports_triggers(&self, workload_type: &str) -> bool {
        self.workload_types.iter().any(|t| t == workload_type)
    }
}
