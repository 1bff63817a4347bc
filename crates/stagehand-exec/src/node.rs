//! Node trait shared by every execution backend

use std::future::Future;
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::command::CommandHandle;
use crate::error::ExecError;
use crate::options::{ExecOptions, TransferOptions};

/// A machine that can run scripts and transfer files
///
/// Backends implement the connection, transfer and [`start`](Node::start)
/// methods; `execute`, `read` and `write` are built on top of them.
#[async_trait]
pub trait Node: Send + Sync {
    /// Short backend name, used in logs
    fn node_type(&self) -> &'static str;

    /// Establish the connection, replacing an existing one
    async fn connect(&self) -> Result<(), ExecError>;

    /// Release the connection
    ///
    /// # Errors
    /// Returns `ExecError::NotConnected` when there is nothing to release.
    async fn disconnect(&self) -> Result<(), ExecError>;

    fn is_connected(&self) -> bool;

    /// Copy a local file (or tree) to the node
    async fn upload(
        &self,
        local: &Path,
        remote: &Path,
        options: &TransferOptions,
    ) -> Result<(), ExecError>;

    /// Copy a file (or tree) from the node to the local machine
    async fn download(
        &self,
        remote: &Path,
        local: &Path,
        options: &TransferOptions,
    ) -> Result<(), ExecError>;

    /// Start driving `command` on a background task
    ///
    /// Implementations install the command's send and eof handlers before
    /// returning and hand their run future to [`spawn_driver`].
    fn start(&self, command: CommandHandle);

    /// Run `script` on this node
    ///
    /// # Errors
    /// `InvalidArgument` for `error_on_failure` in asynchronous mode,
    /// `NotConnected` when disconnected, and in synchronous mode with
    /// `error_on_failure` whatever [`CommandHandle::value`] reports.
    async fn execute(
        &self,
        script: &str,
        options: ExecOptions,
    ) -> Result<CommandHandle, ExecError> {
        if options.error_on_failure && options.asynchronous {
            return Err(ExecError::InvalidArgument(
                "can't surface failure in async mode".to_string(),
            ));
        }
        if !self.is_connected() {
            return Err(ExecError::NotConnected);
        }

        let command = CommandHandle::new(compose_script(script, options.within.as_deref()));
        debug!(node = self.node_type(), script = %command.script(), "dispatching command");
        self.start(command.clone());

        if !options.asynchronous {
            command.wait().await;
            if options.error_on_failure {
                command.value().await?;
            }
        }
        Ok(command)
    }

    /// Contents of the file at `path`
    async fn read(&self, path: &str) -> Result<String, ExecError> {
        let command = self
            .execute(&format!("cat {}", escape(path)), ExecOptions::checked())
            .await?;
        Ok(command.stdout())
    }

    /// Replace the file at `path` with `data`
    ///
    /// With `mode`, the file is created and chmod-ed first. In synchronous
    /// mode the returned handle is complete and a failure is an error.
    async fn write(
        &self,
        data: &str,
        path: &str,
        mode: Option<&str>,
        asynchronous: bool,
    ) -> Result<CommandHandle, ExecError> {
        let path = escape(path);
        if let Some(mode) = mode {
            self.execute(
                &format!("touch {path} && chmod {} {path}", escape(mode)),
                ExecOptions::checked(),
            )
            .await?;
        }

        let command = self
            .execute(&format!("cat > {path}"), ExecOptions::new())
            .await?;
        command.send([data]);
        command.signal_eof();

        if !asynchronous {
            command.value().await?;
        }
        Ok(command)
    }
}

/// Drive `run` for `command` on a background tokio task
///
/// Errors and panics inside `run` complete the command as `Errored`, unless
/// it already reached a terminal state. A run that ends without completing
/// the command completes it with `ExecError::ChannelClosed`.
pub fn spawn_driver<F>(command: CommandHandle, run: F)
where
    F: Future<Output = Result<(), ExecError>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = match tokio::spawn(run).await {
            Ok(result) => result,
            Err(join_err) => {
                error!(script = %command.script(), error = %join_err, "command task panicked");
                Err(ExecError::TaskPanicked(join_err.to_string()))
            }
        };

        match result {
            Err(err) => {
                if command.complete_with_error(err.clone()) {
                    warn!(script = %command.script(), error = %err, "command errored");
                }
            }
            Ok(()) => {
                if command.complete_with_error(ExecError::ChannelClosed) {
                    warn!(script = %command.script(), "run ended without an exit status");
                }
            }
        }
    });
}

/// Prefix `script` with a change into `within`
#[must_use]
pub fn compose_script(script: &str, within: Option<&str>) -> String {
    match within {
        Some(dir) => format!("cd {}\n{script}\n", escape(dir)),
        None => format!("{script}\n"),
    }
}

pub(crate) fn escape(value: &str) -> String {
    shell_escape::unix::escape(value.into()).into_owned()
}
