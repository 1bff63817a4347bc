//! Node definitions loaded from TOML
//!
//! ```toml
//! [[node]]
//! name = "builder"
//! kind = "ssh"
//! host = "10.0.0.5"
//! user = "deploy"
//! ssh_key = "/home/deploy/.ssh/id_ed25519"
//!
//! [[node]]
//! name = "self"
//! kind = "local"
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ExecError;
use crate::keys::KeySource;
use crate::local::LocalNode;
use crate::node::Node;
use crate::options::ConnectionInfo;
use crate::ssh::SshNode;

/// Backend used for a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Ssh,
    Local,
}

/// Configuration for a single node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique name
    pub name: String,
    /// Backend
    pub kind: NodeKind,
    /// Host for SSH nodes
    pub host: Option<String>,
    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,
    /// SSH user (defaults to root)
    #[serde(default = "default_user")]
    pub user: String,
    /// Path to SSH private key
    pub ssh_key: Option<String>,
    /// Environment variable holding a base64 private key
    pub ssh_key_env: Option<String>,
}

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

impl NodeConfig {
    /// Check the entry is usable for its kind
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` describing the first problem found
    pub fn validate(&self) -> Result<(), ExecError> {
        if self.name.trim().is_empty() {
            return Err(ExecError::ConfigError("node name is empty".to_string()));
        }
        if self.kind == NodeKind::Ssh {
            if self.host.as_deref().is_none_or(str::is_empty) {
                return Err(ExecError::ConfigError(format!(
                    "node {}: ssh nodes need a host",
                    self.name
                )));
            }
            if self.ssh_key.is_some() == self.ssh_key_env.is_some() {
                return Err(ExecError::ConfigError(format!(
                    "node {}: set exactly one of ssh_key and ssh_key_env",
                    self.name
                )));
            }
        }
        Ok(())
    }

    fn key_source(&self) -> Option<KeySource> {
        match (&self.ssh_key, &self.ssh_key_env) {
            (Some(path), _) => Some(KeySource::Path(path.into())),
            (None, Some(var)) => Some(KeySource::Env(var.clone())),
            (None, None) => None,
        }
    }

    /// Construct the node; it still has to be connected
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` for invalid entries and
    /// `ExecError::SshKeyError` when the key can't be resolved
    pub fn build(&self) -> Result<Box<dyn Node>, ExecError> {
        self.validate()?;
        match self.kind {
            NodeKind::Local => Ok(Box::new(LocalNode::new())),
            NodeKind::Ssh => {
                let host = self.host.clone().unwrap_or_default();
                let mut info = ConnectionInfo::new(host, self.user.clone()).with_port(self.port);
                info.ssh_key = self.ssh_key.clone();
                let key_source = self.key_source().ok_or_else(|| {
                    ExecError::ConfigError(format!("node {}: no SSH key", self.name))
                })?;
                Ok(Box::new(SshNode::new(info, &key_source)?))
            }
        }
    }
}

/// Top-level node file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodesConfig {
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeConfig>,
}

impl NodesConfig {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read, parsed or validated
    pub fn load(path: &Path) -> Result<Self, ExecError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ExecError::ConfigError(format!("{}: {e}", path.display())))?;
        let config = Self::parse(&content)?;
        debug!(path = %path.display(), nodes = config.nodes.len(), "loaded node config");
        Ok(config)
    }

    /// Parse and validate TOML text
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` for syntax errors, invalid entries and
    /// duplicate names
    pub fn parse(content: &str) -> Result<Self, ExecError> {
        let config: NodesConfig =
            toml::from_str(content).map_err(|e| ExecError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ExecError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            node.validate()?;
            if !seen.insert(node.name.as_str()) {
                return Err(ExecError::ConfigError(format!(
                    "duplicate node name: {}",
                    node.name
                )));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|node| node.name == name)
    }
}
