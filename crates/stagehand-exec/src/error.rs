//! Error types for stagehand-exec

use thiserror::Error;

/// Errors that can occur while driving commands on a node
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// Operation attempted while the node is disconnected
    #[error("not connected")]
    NotConnected,

    /// Incompatible combination of execution options
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Remote side refused to start the process
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Process ran but finished unsuccessfully
    #[error("{}", describe_failure(script, signal.as_deref(), *status))]
    CommandFailed {
        /// Script that was run
        script: String,
        /// Terminating signal name, if signaled
        signal: Option<String>,
        /// Exit status, if exited
        status: Option<i32>,
    },

    /// Backend does not provide this capability
    #[error("operation not supported by this node: {0}")]
    NotSupported(&'static str),

    /// Failed to connect to remote host
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// SSH key error
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// Process spawn error
    #[error("failed to spawn process: {0}")]
    SpawnError(String),

    /// I/O error during execution
    #[error("I/O error: {0}")]
    IoError(String),

    /// Bulk copy failed
    #[error("transfer failed: {0}")]
    TransferError(String),

    /// Transport finished the channel without reporting how the process ended
    #[error("channel closed before the command reported its exit")]
    ChannelClosed,

    /// Background task driving the command panicked
    #[error("command task panicked: {0}")]
    TaskPanicked(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

impl ExecError {
    /// Check if error is retryable
    ///
    /// Nothing in this crate retries; the flag is for callers that do.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed(_) | ExecError::ChannelClosed
        )
    }
}

impl From<std::io::Error> for ExecError {
    fn from(error: std::io::Error) -> Self {
        ExecError::IoError(error.to_string())
    }
}

fn describe_failure(script: &str, signal: Option<&str>, status: Option<i32>) -> String {
    let mut fields = Vec::new();
    if let Some(signal) = signal {
        fields.push(format!("signal={signal}"));
    }
    if let Some(status) = status {
        fields.push(format!("status={status}"));
    }
    format!("command failed ({}): {script:?}", fields.join(" "))
}
