//! Option types passed to nodes

use serde::{Deserialize, Serialize};

/// How a single `execute` call should behave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOptions {
    /// Directory to change into before running the script
    pub within: Option<String>,
    /// Return the handle immediately instead of waiting for completion
    pub asynchronous: bool,
    /// Surface an unsuccessful outcome as an error (synchronous mode only)
    pub error_on_failure: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            within: None,
            asynchronous: true,
            error_on_failure: false,
        }
    }
}

impl ExecOptions {
    /// Asynchronous execution, the default
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous execution that reports failure as an error
    #[must_use]
    pub fn checked() -> Self {
        Self::new().synchronous().error_on_failure()
    }

    /// Run the script inside `dir`
    #[must_use]
    pub fn within(mut self, dir: impl Into<String>) -> Self {
        self.within = Some(dir.into());
        self
    }

    /// Wait for the command before returning
    #[must_use]
    pub fn synchronous(mut self) -> Self {
        self.asynchronous = false;
        self
    }

    /// Turn a failed outcome into an error
    #[must_use]
    pub fn error_on_failure(mut self) -> Self {
        self.error_on_failure = true;
        self
    }
}

/// Options forwarded to a node's bulk-copy capability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOptions {
    /// Copy directory trees
    #[serde(default)]
    pub recursive: bool,
    /// Keep permission bits of the source
    #[serde(default)]
    pub preserve: bool,
}

impl TransferOptions {
    /// Enable recursive copies
    #[must_use]
    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    /// Preserve permission bits
    #[must_use]
    pub fn preserve(mut self) -> Self {
        self.preserve = true;
        self
    }
}

/// Connection information for SSH
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Host address
    pub host: String,
    /// Port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username
    pub user: String,
    /// Optional SSH key path
    pub ssh_key: Option<String>,
}

fn default_port() -> u16 {
    22
}

impl ConnectionInfo {
    /// Create new connection info
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            ssh_key: None,
        }
    }

    /// Set SSH key path
    #[must_use]
    pub fn with_ssh_key(mut self, path: impl Into<String>) -> Self {
        self.ssh_key = Some(path.into());
        self
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// `user@host:port`, used in logs
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}
