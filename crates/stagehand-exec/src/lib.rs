//! stagehand-exec: command execution on local and remote nodes
//!
//! A [`Node`] runs shell scripts and returns a [`CommandHandle`] that tracks
//! the command's output and completion. [`SshNode`] drives an SSH exec
//! channel; [`LocalNode`] runs `sh -c` on this machine.

pub mod command;
pub mod config;
pub mod error;
pub mod keys;
pub mod local;
pub mod node;
pub mod options;
pub mod ssh;

pub use command::{CommandHandle, Outcome, Stream};
pub use config::{NodeConfig, NodeKind, NodesConfig};
pub use error::ExecError;
pub use keys::{KeyError, KeySource};
pub use local::LocalNode;
pub use node::{Node, compose_script, spawn_driver};
pub use options::{ConnectionInfo, ExecOptions, TransferOptions};
pub use ssh::{SshNode, SshNodeBuilder};
