//! Local command execution using `tokio::process`

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use crate::command::{CommandHandle, Outcome, OutputDecoder, Stream};
use crate::error::ExecError;
use crate::node::{Node, spawn_driver};
use crate::options::TransferOptions;

const BUFF_SIZE: usize = 4096;

#[derive(Debug)]
enum ProcessInput {
    Data(Vec<u8>),
    Eof,
}

/// Node for the machine this process runs on
///
/// Scripts run through `sh -c`. Connecting only flips a flag; commands run
/// concurrently.
#[derive(Debug, Clone, Default)]
pub struct LocalNode {
    connected: Arc<AtomicBool>,
}

impl LocalNode {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Node for LocalNode {
    fn node_type(&self) -> &'static str {
        "local"
    }

    async fn connect(&self) -> Result<(), ExecError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ExecError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Err(ExecError::NotConnected);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[instrument(skip(self), level = "debug")]
    async fn upload(
        &self,
        local: &Path,
        remote: &Path,
        options: &TransferOptions,
    ) -> Result<(), ExecError> {
        if !self.is_connected() {
            return Err(ExecError::NotConnected);
        }
        copy_tree(local, remote, options).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn download(
        &self,
        remote: &Path,
        local: &Path,
        options: &TransferOptions,
    ) -> Result<(), ExecError> {
        if !self.is_connected() {
            return Err(ExecError::NotConnected);
        }
        copy_tree(remote, local, options).await
    }

    fn start(&self, command: CommandHandle) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let data_tx = input_tx.clone();
        command.set_send_handler(move |data| {
            let _ = data_tx.send(ProcessInput::Data(data.as_bytes().to_vec()));
        });
        command.set_eof_handler(move || {
            let _ = input_tx.send(ProcessInput::Eof);
        });

        spawn_driver(command.clone(), run_process(command, input_rx));
    }
}

#[instrument(skip_all, level = "debug")]
async fn run_process(
    command: CommandHandle,
    input_rx: mpsc::UnboundedReceiver<ProcessInput>,
) -> Result<(), ExecError> {
    debug!(command = %command.script(), "executing local command");

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command.script())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ExecError::SpawnError(e.to_string()))?;

    let stdin = child.stdin.take();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::SpawnError("stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExecError::SpawnError("stderr not captured".to_string()))?;

    let feeder = tokio::spawn(feed_stdin(stdin, input_rx));
    let (out, err) = tokio::join!(
        pump(stdout, &command, Stream::Stdout),
        pump(stderr, &command, Stream::Stderr)
    );
    out?;
    err?;

    let status = child
        .wait()
        .await
        .map_err(|e| ExecError::IoError(e.to_string()))?;
    feeder.abort();

    let outcome = outcome_of(status);
    if !matches!(outcome, Outcome::Exited(0)) {
        info!(command = %command.script(), outcome = ?outcome, "command failed");
    }
    command.complete(outcome);
    Ok(())
}

async fn pump<R>(mut reader: R, command: &CommandHandle, stream: Stream) -> Result<(), ExecError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = [0; BUFF_SIZE];
    let mut decoder = OutputDecoder::new(stream);
    loop {
        let size = reader.read(&mut buffer).await?;
        if size == 0 {
            decoder.flush(command);
            return Ok(());
        }
        decoder.feed(command, &buffer[..size]);
    }
}

// Input is queued until the process reads it; a process that never reads
// stdin leaves the feeder to be aborted once it exits.
async fn feed_stdin(
    mut stdin: Option<ChildStdin>,
    mut input_rx: mpsc::UnboundedReceiver<ProcessInput>,
) {
    while let Some(input) = input_rx.recv().await {
        match input {
            ProcessInput::Data(bytes) => {
                let Some(pipe) = stdin.as_mut() else {
                    continue;
                };
                if let Err(e) = pipe.write_all(&bytes).await {
                    debug!(error = %e, "stdin closed by process");
                    stdin = None;
                }
            }
            ProcessInput::Eof => {
                stdin = None;
            }
        }
    }
}

fn outcome_of(status: ExitStatus) -> Outcome {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => Outcome::Exited(code),
        (None, Some(signal)) => Outcome::Signaled(signal_name(signal)),
        (None, None) => Outcome::Errored(ExecError::IoError(format!(
            "unrecognized exit status: {status}"
        ))),
    }
}

/// Conventional name of a POSIX signal, without the `SIG` prefix
fn signal_name(signal: i32) -> String {
    let name = match signal {
        1 => "HUP",
        2 => "INT",
        3 => "QUIT",
        4 => "ILL",
        6 => "ABRT",
        8 => "FPE",
        9 => "KILL",
        10 => "USR1",
        11 => "SEGV",
        12 => "USR2",
        13 => "PIPE",
        14 => "ALRM",
        15 => "TERM",
        other => return format!("SIG{other}"),
    };
    name.to_string()
}

async fn copy_tree(from: &Path, to: &Path, options: &TransferOptions) -> Result<(), ExecError> {
    let mut pending: Vec<(PathBuf, PathBuf)> = vec![(from.to_path_buf(), to.to_path_buf())];

    while let Some((from, to)) = pending.pop() {
        let metadata = tokio::fs::metadata(&from).await?;
        if metadata.is_dir() {
            if !options.recursive {
                return Err(ExecError::TransferError(format!(
                    "{} is a directory (use recursive)",
                    from.display()
                )));
            }
            tokio::fs::create_dir_all(&to).await?;
            let mut entries = tokio::fs::read_dir(&from).await?;
            while let Some(entry) = entries.next_entry().await? {
                pending.push((entry.path(), to.join(entry.file_name())));
            }
        } else {
            debug!(from = %from.display(), to = %to.display(), "copying file");
            tokio::fs::copy(&from, &to).await?;
        }

        if options.preserve {
            tokio::fs::set_permissions(&to, metadata.permissions()).await?;
        }
    }

    info!(from = %from.display(), to = %to.display(), "transfer complete");
    Ok(())
}
