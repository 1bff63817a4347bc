//! SSH node using the russh crate
//!
//! One connection per node. Everything that talks to the connection
//! (connect, disconnect, transfers, and the channel loop of each command)
//! holds the same lock for its whole duration, so commands on one node are
//! driven one at a time.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh::{ChannelMsg, Disconnect, Sig, client};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::FileAttributes;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, instrument, trace, warn};

use crate::command::{CommandHandle, Outcome, OutputDecoder, Stream};
use crate::error::ExecError;
use crate::keys::{KeySource, ResolvedKey};
use crate::node::{Node, spawn_driver};
use crate::options::{ConnectionInfo, TransferOptions};

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all server keys (like StrictHostKeyChecking=no)
        Ok(true)
    }
}

type Session = client::Handle<SshClientHandler>;

/// Input queued by a command's send/eof handlers for the channel loop
#[derive(Debug)]
enum ChannelInput {
    Data(Vec<u8>),
    Eof,
}

/// Node reached over SSH
///
/// Cloning shares the underlying connection.
#[derive(Clone)]
pub struct SshNode {
    conn_info: Arc<ConnectionInfo>,
    key: Arc<ResolvedKey>,
    session: Arc<Mutex<Option<Session>>>,
    connected: Arc<AtomicBool>,
}

impl std::fmt::Debug for SshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshNode")
            .field("conn_info", &self.conn_info)
            .field("key", &self.key)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SshNode {
    /// Create a new SSH node; nothing is connected until [`Node::connect`]
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if key resolution fails
    pub fn new(conn_info: ConnectionInfo, key_source: &KeySource) -> Result<Self, ExecError> {
        let key = key_source
            .resolve()
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;

        Ok(Self {
            conn_info: Arc::new(conn_info),
            key: Arc::new(key),
            session: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.conn_info
    }

    async fn open_session(&self) -> Result<Session, ExecError> {
        info!(
            host = %self.conn_info.host,
            port = self.conn_info.port,
            user = %self.conn_info.user,
            "connecting to SSH"
        );

        let config = Arc::new(client::Config::default());
        let mut session = client::connect(
            config,
            (&self.conn_info.host[..], self.conn_info.port),
            SshClientHandler,
        )
        .await
        .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

        let key_pair = load_secret_key(self.key.path(), None)
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;
        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let auth_res = session
            .authenticate_publickey(
                &self.conn_info.user,
                PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
            )
            .await
            .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

        if !auth_res.success() {
            return Err(ExecError::AuthenticationFailed(
                "Public key authentication failed".to_string(),
            ));
        }

        info!(host = %self.conn_info.host, "SSH connected and authenticated");
        Ok(session)
    }
}

#[async_trait]
impl Node for SshNode {
    fn node_type(&self) -> &'static str {
        "ssh"
    }

    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn connect(&self) -> Result<(), ExecError> {
        let mut session_lock = self.session.lock().await;

        if let Some(old) = session_lock.take() {
            self.connected.store(false, Ordering::SeqCst);
            debug!("replacing existing SSH session");
            if let Err(e) = old.disconnect(Disconnect::ByApplication, "", "English").await {
                warn!(error = %e, "failed to close previous SSH session");
            }
        }

        *session_lock = Some(self.open_session().await?);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn disconnect(&self) -> Result<(), ExecError> {
        if !self.is_connected() {
            return Err(ExecError::NotConnected);
        }
        let mut session_lock = self.session.lock().await;
        let session = session_lock.take().ok_or(ExecError::NotConnected)?;
        self.connected.store(false, Ordering::SeqCst);

        session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
        info!(host = %self.conn_info.host, "SSH disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        // A running command holds the lock and notices a dropped connection
        // itself when its channel ends.
        let Ok(mut session_lock) = self.session.try_lock() else {
            return true;
        };
        match session_lock.as_ref() {
            Some(session) if !session.is_closed() => true,
            _ => {
                *session_lock = None;
                self.connected.store(false, Ordering::SeqCst);
                debug!(host = %self.conn_info.host, "SSH connection is gone");
                false
            }
        }
    }

    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn upload(
        &self,
        local: &Path,
        remote: &Path,
        options: &TransferOptions,
    ) -> Result<(), ExecError> {
        if !self.is_connected() {
            return Err(ExecError::NotConnected);
        }
        let session_lock = self.session.lock().await;
        let session = session_lock.as_ref().ok_or(ExecError::NotConnected)?;

        let sftp = open_sftp(session).await?;
        let result = upload_tree(&sftp, local, remote, options).await;
        close_sftp(sftp).await;
        result
    }

    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn download(
        &self,
        remote: &Path,
        local: &Path,
        options: &TransferOptions,
    ) -> Result<(), ExecError> {
        if !self.is_connected() {
            return Err(ExecError::NotConnected);
        }
        let session_lock = self.session.lock().await;
        let session = session_lock.as_ref().ok_or(ExecError::NotConnected)?;

        let sftp = open_sftp(session).await?;
        let result = download_tree(&sftp, remote, local, options).await;
        close_sftp(sftp).await;
        result
    }

    fn start(&self, command: CommandHandle) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let data_tx = input_tx.clone();
        command.set_send_handler(move |data| {
            let _ = data_tx.send(ChannelInput::Data(data.as_bytes().to_vec()));
        });
        command.set_eof_handler(move || {
            let _ = input_tx.send(ChannelInput::Eof);
        });

        let session = Arc::clone(&self.session);
        let connected = Arc::clone(&self.connected);
        let host = self.conn_info.host.clone();
        spawn_driver(
            command.clone(),
            run_channel(session, connected, host, command, input_rx),
        );
    }
}

/// Drive one exec channel until the remote side closes it
///
/// Holds the connection lock for the whole run.
#[instrument(skip_all, fields(host = %host))]
async fn run_channel(
    session: Arc<Mutex<Option<Session>>>,
    connected: Arc<AtomicBool>,
    host: String,
    command: CommandHandle,
    mut input_rx: mpsc::UnboundedReceiver<ChannelInput>,
) -> Result<(), ExecError> {
    let session_lock = session.lock().await;
    let handle = session_lock.as_ref().ok_or(ExecError::NotConnected)?;

    debug!(command = %command.script(), "executing remote command");

    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| ExecError::IoError(e.to_string()))?;
    channel
        .exec(true, command.script())
        .await
        .map_err(|e| ExecError::IoError(e.to_string()))?;

    let mut sink = ChannelSink::new(command.clone());
    let mut input_open = true;
    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(msg) => sink.apply(msg)?,
                None => break,
            },
            input = input_rx.recv(), if input_open => match input {
                Some(ChannelInput::Data(bytes)) => channel
                    .data(&bytes[..])
                    .await
                    .map_err(|e| ExecError::IoError(e.to_string()))?,
                Some(ChannelInput::Eof) => {
                    channel
                        .eof()
                        .await
                        .map_err(|e| ExecError::IoError(e.to_string()))?;
                    input_open = false;
                }
                None => input_open = false,
            },
        }
    }
    sink.flush();

    if handle.is_closed() {
        connected.store(false, Ordering::SeqCst);
        warn!("SSH connection closed by remote");
    }

    debug!(command = %command.script(), outcome = ?command.outcome(), "channel finished");
    Ok(())
}

/// Feeds the messages of one exec channel into its command
struct ChannelSink {
    command: CommandHandle,
    stdout: OutputDecoder,
    stderr: OutputDecoder,
}

impl ChannelSink {
    fn new(command: CommandHandle) -> Self {
        Self {
            command,
            stdout: OutputDecoder::new(Stream::Stdout),
            stderr: OutputDecoder::new(Stream::Stderr),
        }
    }

    /// Apply one channel message to the command
    ///
    /// # Errors
    /// Returns `ExecError::ExecutionFailed` when the server refuses the exec
    /// request.
    fn apply(&mut self, msg: ChannelMsg) -> Result<(), ExecError> {
        match msg {
            ChannelMsg::Success => trace!("exec accepted"),
            ChannelMsg::Failure => {
                return Err(ExecError::ExecutionFailed(format!(
                    "remote refused to run {:?}",
                    self.command.script()
                )));
            }
            ChannelMsg::Data { data } => self.stdout.feed(&self.command, &data),
            ChannelMsg::ExtendedData { data, ext } => {
                if ext != 1 {
                    trace!(ext, "extended data on a non-stderr stream");
                }
                self.stderr.feed(&self.command, &data);
            }
            ChannelMsg::ExitStatus { exit_status } => {
                self.finish(Outcome::Exited(exit_status.cast_signed()));
            }
            ChannelMsg::ExitSignal { signal_name, .. } => {
                self.finish(Outcome::Signaled(signal_label(&signal_name)));
            }
            other => trace!(msg = ?other, "ignored channel message"),
        }
        Ok(())
    }

    fn finish(&mut self, outcome: Outcome) {
        self.flush();
        if self.command.is_completed() {
            warn!(outcome = ?outcome, "second exit report ignored");
            return;
        }
        self.command.complete(outcome);
    }

    fn flush(&mut self) {
        self.stdout.flush(&self.command);
        self.stderr.flush(&self.command);
    }
}

/// Signal name as reported by the server, keeping only ASCII alphanumerics
fn signal_label(sig: &Sig) -> String {
    let raw = match sig {
        Sig::Custom(name) => name.clone(),
        other => format!("{other:?}"),
    };
    raw.chars().filter(char::is_ascii_alphanumeric).collect()
}

async fn open_sftp(session: &Session) -> Result<SftpSession, ExecError> {
    let channel = session
        .channel_open_session()
        .await
        .map_err(|e| ExecError::IoError(e.to_string()))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| ExecError::TransferError(e.to_string()))?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| ExecError::TransferError(e.to_string()))
}

async fn close_sftp(sftp: SftpSession) {
    if let Err(e) = sftp.close().await {
        warn!(error = %e, "failed to close SFTP session");
    }
}

fn remote_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn transfer_err(e: impl std::fmt::Display) -> ExecError {
    ExecError::TransferError(e.to_string())
}

async fn upload_tree(
    sftp: &SftpSession,
    local: &Path,
    remote: &Path,
    options: &TransferOptions,
) -> Result<(), ExecError> {
    let mut pending = vec![(local.to_path_buf(), remote.to_path_buf())];

    while let Some((local, remote)) = pending.pop() {
        let metadata = tokio::fs::metadata(&local).await?;

        if metadata.is_dir() {
            if !options.recursive {
                return Err(ExecError::TransferError(format!(
                    "{} is a directory (use recursive)",
                    local.display()
                )));
            }
            if !sftp.try_exists(remote_str(&remote)).await.map_err(transfer_err)? {
                sftp.create_dir(remote_str(&remote))
                    .await
                    .map_err(transfer_err)?;
            }
            let mut entries = tokio::fs::read_dir(&local).await?;
            while let Some(entry) = entries.next_entry().await? {
                pending.push((entry.path(), remote.join(entry.file_name())));
            }
        } else {
            debug!(local = %local.display(), remote = %remote.display(), "uploading file");
            let mut source = tokio::fs::File::open(&local).await?;
            let mut target = sftp.create(remote_str(&remote)).await.map_err(transfer_err)?;
            tokio::io::copy(&mut source, &mut target).await?;
            target.shutdown().await?;
        }

        if options.preserve {
            use std::os::unix::fs::PermissionsExt;

            let attrs = FileAttributes {
                permissions: Some(metadata.permissions().mode()),
                ..FileAttributes::default()
            };
            sftp.set_metadata(remote_str(&remote), attrs)
                .await
                .map_err(transfer_err)?;
        }
    }
    Ok(())
}

async fn download_tree(
    sftp: &SftpSession,
    remote: &Path,
    local: &Path,
    options: &TransferOptions,
) -> Result<(), ExecError> {
    let mut pending: Vec<(PathBuf, PathBuf)> = vec![(remote.to_path_buf(), local.to_path_buf())];

    while let Some((remote, local)) = pending.pop() {
        let attrs = sftp.metadata(remote_str(&remote)).await.map_err(transfer_err)?;

        if attrs.is_dir() {
            if !options.recursive {
                return Err(ExecError::TransferError(format!(
                    "{} is a directory (use recursive)",
                    remote.display()
                )));
            }
            tokio::fs::create_dir_all(&local).await?;
            for entry in sftp.read_dir(remote_str(&remote)).await.map_err(transfer_err)? {
                let name = entry.file_name();
                if name == "." || name == ".." {
                    continue;
                }
                pending.push((remote.join(&name), local.join(&name)));
            }
        } else {
            debug!(remote = %remote.display(), local = %local.display(), "downloading file");
            let mut source = sftp.open(remote_str(&remote)).await.map_err(transfer_err)?;
            let mut target = tokio::fs::File::create(&local).await?;
            tokio::io::copy(&mut source, &mut target).await?;
            target.flush().await?;
        }

        if options.preserve {
            if let Some(mode) = attrs.permissions {
                use std::os::unix::fs::PermissionsExt;

                tokio::fs::set_permissions(&local, std::fs::Permissions::from_mode(mode & 0o7777))
                    .await?;
            }
        }
    }
    Ok(())
}

/// Builder for `SshNode`
pub struct SshNodeBuilder {
    conn_info: ConnectionInfo,
    key_source: Option<KeySource>,
}

impl SshNodeBuilder {
    /// Create builder with required fields
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            conn_info: ConnectionInfo::new(host, user),
            key_source: None,
        }
    }

    /// Set SSH key path
    #[must_use]
    pub fn with_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        self.conn_info.ssh_key = Some(path.display().to_string());
        self.key_source = Some(KeySource::Path(path));
        self
    }

    /// Set key from environment variable (base64)
    #[must_use]
    pub fn with_env_key(mut self, var_name: impl Into<String>) -> Self {
        self.key_source = Some(KeySource::Env(var_name.into()));
        self
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.conn_info.port = port;
        self
    }

    /// Build the node
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` without a key source and
    /// `ExecError::SshKeyError` if key resolution fails
    pub fn build(self) -> Result<SshNode, ExecError> {
        let key_source = self.key_source.ok_or_else(|| {
            ExecError::ConfigError(format!(
                "no SSH key configured for {}",
                self.conn_info.address()
            ))
        })?;
        SshNode::new(self.conn_info, &key_source)
    }
}
