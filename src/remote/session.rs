//! Session manager: one SSH connection plus one SFTP channel.
//!
//! # State machine
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//!                                 |                  |
//!                                 +--err--> Disconnected <--disconnect()/link failure
//! ```
//!
//! A `connect` issued while another one is in flight supersedes it: every
//! connect and disconnect bumps a generation counter, and a finishing attempt
//! only installs its link if its generation is still current.
//!
//! # Serialization
//!
//! Blocking libssh2 work runs on tokio's blocking pool while holding the link
//! mutex, so at most one remote operation is in flight per session. State,
//! configuration and the generation counter sit behind a separate lock that
//! is never held across a remote call.
//!
//! # Link failures
//!
//! An I/O error or timeout from any operation closes the link and moves the
//! session to `Disconnected`. "No such file", refusals and non-zero exit
//! statuses leave it connected. After a lost link `read_file`, `stat` and
//! `read_dir` spawn a background `connect` with the last configuration and
//! return right away; callers must expect `Disconnected` or `Connecting`
//! immediately afterwards. `exec`, `fast_get` and `remove_remote` only drop
//! the link.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use super::commands::{parse_modify_line, remote_temp_base, stat_modify_command};
use super::transport::{
    ConnectError, ExecOutput, RemoteDirEntry, RemoteTransport, TransportConnector, TransportError,
};
use crate::config::{ConnectionConfig, Timeouts};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("remote host unavailable: {0}")]
    Unavailable(String),

    #[error("remote file not found: {0}")]
    NotFound(String),

    #[error("remote host refused: {0}")]
    Refused(String),

    #[error("remote command `{command}` failed: {reason}")]
    Exec { command: String, reason: String },

    #[error("transfer of {remote} failed: {reason}")]
    Transfer { remote: String, reason: String },

    #[error("{operation} timed out after {secs} seconds")]
    Timeout { operation: String, secs: u64 },
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotFound(path) => Self::NotFound(path),
            TransportError::Refused(reason) => Self::Refused(reason),
            err @ TransportError::Unsupported(_) => Self::Refused(err.to_string()),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

fn not_connected() -> SessionError {
    SessionError::Unavailable("not connected to remote host".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

/// An established transport and what was learned about the remote end.
struct Link {
    transport: Box<dyn RemoteTransport>,
    remote_home: String,
    /// Native stat failed once; use the shell fallback until reconnect.
    stat_fallback: bool,
    timeouts: Timeouts,
    /// Generation of the `connect` that opened it.
    generation: u64,
}

struct Status {
    state: SessionState,
    config: Option<ConnectionConfig>,
    /// Mirrors the installed link.
    remote_home: Option<String>,
    generation: u64,
    reconnect: Option<JoinHandle<Result<(), ConnectError>>>,
}

/// How a blocking operation failed.
enum OpError {
    /// The remote end answered; the link is still usable.
    Remote(SessionError),
    /// The link is gone.
    Link(SessionError),
}

impl OpError {
    fn new(cause: &TransportError, error: SessionError) -> Self {
        if cause.is_link_failure() {
            Self::Link(error)
        } else {
            Self::Remote(error)
        }
    }
}

impl From<TransportError> for OpError {
    fn from(err: TransportError) -> Self {
        let link = err.is_link_failure();
        let error = SessionError::from(err);
        if link {
            Self::Link(error)
        } else {
            Self::Remote(error)
        }
    }
}

impl From<SessionError> for OpError {
    fn from(err: SessionError) -> Self {
        Self::Remote(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnLinkLoss {
    Reconnect,
    Drop,
}

/// A link taken down by a failed operation.
struct LinkLoss {
    config: Option<ConnectionConfig>,
    generation: u64,
}

/// Shared handle to the single remote session.
#[derive(Clone)]
pub struct SessionManager {
    status: Arc<Mutex<Status>>,
    link: Arc<AsyncMutex<Option<Link>>>,
    connector: Arc<dyn TransportConnector>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            status: Arc::new(Mutex::new(Status {
                state: SessionState::Disconnected,
                config: None,
                remote_home: None,
                generation: 0,
                reconnect: None,
            })),
            link: Arc::new(AsyncMutex::new(None)),
            connector,
        }
    }

    pub fn state(&self) -> SessionState {
        self.status.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Configuration of the most recent `connect`.
    pub fn config(&self) -> Option<ConnectionConfig> {
        self.status.lock().config.clone()
    }

    pub fn remote_home(&self) -> Option<String> {
        self.status.lock().remote_home.clone()
    }

    /// `<remote home>/.ctagssh.temp`, the base of every scratch file.
    pub fn remote_temp_base(&self) -> Option<String> {
        self.remote_home().map(|home| remote_temp_base(&home))
    }

    /// Waits for any remote call in flight.
    pub async fn stat_fallback_active(&self) -> bool {
        self.link
            .lock()
            .await
            .as_ref()
            .is_some_and(|l| l.stat_fallback)
    }

    /// Handle of the last background reconnect, if one was scheduled.
    pub fn take_reconnect_task(&self) -> Option<JoinHandle<Result<(), ConnectError>>> {
        self.status.lock().reconnect.take()
    }

    /// Open transport and SFTP channel and resolve the remote home.
    ///
    /// Tears down any existing or in-flight session first.
    pub async fn connect(&self, config: ConnectionConfig) -> Result<(), ConnectError> {
        self.start_connect(config, None).await
    }

    async fn start_connect(
        &self,
        config: ConnectionConfig,
        expected_generation: Option<u64>,
    ) -> Result<(), ConnectError> {
        let generation = {
            let mut status = self.status.lock();
            if expected_generation.is_some_and(|g| g != status.generation) {
                return Err(ConnectError::Superseded);
            }
            status.generation += 1;
            status.state = SessionState::Connecting;
            status.config = Some(config.clone());
            status.remote_home = None;
            status.generation
        };
        let previous = self
            .link
            .lock()
            .await
            .take_if(|l| l.generation < generation);
        if let Some(link) = previous {
            close_link(link).await;
        }

        tracing::info!(
            host = %config.host,
            port = config.port,
            username = %config.username,
            "connecting to remote host"
        );

        let timeout = config.timeouts.connect;
        let connector = Arc::clone(&self.connector);
        let opening = tokio::task::spawn_blocking(move || {
            open_link(connector.as_ref(), &config, generation)
        });
        let opened = match tokio::time::timeout(timeout, opening).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ConnectError::Task(join.to_string())),
            Err(_) => Err(ConnectError::Timeout(timeout.as_secs())),
        };

        let mut slot = self.link.lock().await;
        let stale = {
            let mut status = self.status.lock();
            if status.generation != generation {
                opened.ok()
            } else {
                match opened {
                    Ok(link) => {
                        tracing::info!(remote_home = %link.remote_home, "connected to remote host");
                        status.state = SessionState::Connected;
                        status.remote_home = Some(link.remote_home.clone());
                        *slot = Some(link);
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "connection failed");
                        status.state = SessionState::Disconnected;
                        return Err(e);
                    }
                }
            }
        };
        drop(slot);

        if let Some(link) = stale {
            close_link(link).await;
        }
        tracing::debug!("connection attempt superseded");
        Err(ConnectError::Superseded)
    }

    /// Connect again with the last configuration.
    pub async fn reconnect(&self) -> Result<(), ConnectError> {
        let config = self
            .config()
            .ok_or_else(|| ConnectError::Task("no connection has been configured".to_string()))?;
        self.connect(config).await
    }

    /// Close channel and transport. Close failures are logged, never returned.
    ///
    /// A connect still in flight is superseded.
    pub async fn disconnect(&self) {
        let generation = {
            let mut status = self.status.lock();
            status.generation += 1;
            status.state = SessionState::Disconnected;
            status.remote_home = None;
            status.generation
        };
        let link = self
            .link
            .lock()
            .await
            .take_if(|l| l.generation < generation);
        if let Some(link) = link {
            close_link(link).await;
            tracing::info!("disconnected from remote host");
        }
    }

    /// Remote modify time in epoch seconds.
    ///
    /// Falls over to the shell `stat` strategy for the rest of the session the
    /// first time native stat is unsupported.
    pub async fn stat(&self, remote_path: &str) -> Result<i64, SessionError> {
        let path = remote_path.to_string();
        self.run_blocking("stat", OnLinkLoss::Reconnect, move |link| {
            if !link.stat_fallback {
                match link.transport.stat_mtime(&path) {
                    Ok(mtime) => return Ok(mtime),
                    Err(TransportError::Unsupported(reason)) => {
                        tracing::warn!(
                            remote_path = %path,
                            reason = %reason,
                            "native stat unsupported; using shell stat for this session"
                        );
                        link.stat_fallback = true;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            shell_stat(link, &path)
        })
        .await
    }

    pub async fn read_file(&self, remote_path: &str) -> Result<Vec<u8>, SessionError> {
        let path = remote_path.to_string();
        self.run_blocking("read", OnLinkLoss::Reconnect, move |link| {
            Ok(link.transport.read_file(&path)?)
        })
        .await
    }

    pub async fn read_dir(&self, remote_path: &str) -> Result<Vec<RemoteDirEntry>, SessionError> {
        let path = remote_path.to_string();
        self.run_blocking("readdir", OnLinkLoss::Reconnect, move |link| {
            Ok(link.transport.read_dir(&path)?)
        })
        .await
    }

    /// Run a command line built by [`super::commands`]; non-zero exit is an error.
    pub async fn exec(&self, command: &str) -> Result<ExecOutput, SessionError> {
        let command = command.to_string();
        self.run_blocking("exec", OnLinkLoss::Drop, move |link| {
            run_command(link, &command)
        })
        .await
    }

    /// Stream a remote file to `local`, returning the bytes copied.
    pub async fn fast_get(&self, remote_path: &str, local: PathBuf) -> Result<u64, SessionError> {
        let remote = remote_path.to_string();
        self.run_blocking("transfer", OnLinkLoss::Drop, move |link| {
            let timeout = link.timeouts.transfer;
            link.transport
                .fast_get(&remote, &local, timeout)
                .map_err(|e| {
                    let error = match &e {
                        TransportError::TimedOut(_) => SessionError::Timeout {
                            operation: format!("transfer of {}", remote),
                            secs: timeout.as_secs(),
                        },
                        other => SessionError::Transfer {
                            remote: remote.clone(),
                            reason: other.to_string(),
                        },
                    };
                    OpError::new(&e, error)
                })
        })
        .await
    }

    /// Remove one of this session's scratch files.
    pub async fn remove_remote(&self, remote_path: &str) -> Result<(), SessionError> {
        let path = remote_path.to_string();
        self.run_blocking("unlink", OnLinkLoss::Drop, move |link| {
            Ok(link.transport.remove_file(&path)?)
        })
        .await
    }

    /// Spawn a `connect` that only runs if nothing touched the session since
    /// `generation` was observed.
    fn schedule_reconnect(&self, config: ConnectionConfig, generation: u64) {
        let manager = self.clone();
        let handle = tokio::spawn(async move {
            let result = manager.start_connect(config, Some(generation)).await;
            match &result {
                Ok(()) => tracing::info!("reconnected after link failure"),
                Err(e) => tracing::warn!(error = %e, "reconnect failed"),
            }
            result
        });
        self.status.lock().reconnect = Some(handle);
    }

    async fn run_blocking<T, F>(
        &self,
        operation: &'static str,
        on_loss: OnLinkLoss,
        op: F,
    ) -> Result<T, SessionError>
    where
        F: FnOnce(&mut Link) -> Result<T, OpError> + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::clone(&self.link).lock_owned().await;
        let status = Arc::clone(&self.status);
        let (result, loss) = tokio::task::spawn_blocking(move || run_on_link(slot, &status, op))
            .await
            .map_err(|e| SessionError::Unavailable(format!("session task failed: {}", e)))?;

        if let (Err(error), Some(loss)) = (&result, loss) {
            let reconnect = on_loss == OnLinkLoss::Reconnect && loss.config.is_some();
            tracing::warn!(operation, error = %error, reconnect, "remote link lost");
            if reconnect && let Some(config) = loss.config {
                self.schedule_reconnect(config, loss.generation);
            }
        }
        result
    }
}

/// Run `op` on the current link; a link failure takes the link down.
fn run_on_link<T>(
    mut slot: OwnedMutexGuard<Option<Link>>,
    status: &Mutex<Status>,
    op: impl FnOnce(&mut Link) -> Result<T, OpError>,
) -> (Result<T, SessionError>, Option<LinkLoss>) {
    let current = status.lock().generation;
    let Some(link) = slot.as_mut().filter(|l| l.generation == current) else {
        return (Err(not_connected()), None);
    };
    let error = match op(link) {
        Ok(value) => return (Ok(value), None),
        Err(OpError::Remote(error)) => return (Err(error), None),
        Err(OpError::Link(error)) => error,
    };

    let loss = slot.take().and_then(|mut link| {
        if let Err(close_err) = link.transport.close() {
            tracing::debug!(error = %close_err, "closing broken link failed");
        }
        let mut status = status.lock();
        // A newer connect or disconnect owns the state now.
        if status.generation != link.generation {
            return None;
        }
        status.generation += 1;
        status.state = SessionState::Disconnected;
        status.remote_home = None;
        Some(LinkLoss {
            config: status.config.clone(),
            generation: status.generation,
        })
    });
    (Err(error), loss)
}

fn open_link(
    connector: &dyn TransportConnector,
    config: &ConnectionConfig,
    generation: u64,
) -> Result<Link, ConnectError> {
    let mut transport = connector.open(config)?;
    let remote_home = match transport.home_dir() {
        Ok(home) if !home.trim().is_empty() => home.trim().to_string(),
        Ok(_) => return Err(release_half_open(transport, "empty home directory".to_string())),
        Err(e) => return Err(release_half_open(transport, e.to_string())),
    };
    Ok(Link {
        transport,
        remote_home,
        stat_fallback: false,
        timeouts: config.timeouts,
        generation,
    })
}

fn release_half_open(mut transport: Box<dyn RemoteTransport>, reason: String) -> ConnectError {
    if let Err(close_err) = transport.close() {
        tracing::debug!(error = %close_err, "closing half-open transport failed");
    }
    ConnectError::HomeDir(reason)
}

async fn close_link(mut link: Link) {
    let closed = tokio::task::spawn_blocking(move || link.transport.close()).await;
    match closed {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "error while closing remote session"),
        Err(e) => tracing::warn!(error = %e, "close task failed"),
    }
}

fn run_command(link: &mut Link, command: &str) -> Result<ExecOutput, OpError> {
    let timeout = link.timeouts.exec;
    let output = link.transport.exec(command, timeout).map_err(|e| {
        let error = match &e {
            TransportError::TimedOut(_) => SessionError::Timeout {
                operation: format!("`{}`", command),
                secs: timeout.as_secs(),
            },
            other => SessionError::Exec {
                command: command.to_string(),
                reason: other.to_string(),
            },
        };
        OpError::new(&e, error)
    })?;
    if output.exit_status != 0 {
        return Err(OpError::Remote(SessionError::Exec {
            command: command.to_string(),
            reason: format!(
                "exit status {}: {}",
                output.exit_status,
                output.stderr.trim()
            ),
        }));
    }
    Ok(output)
}

/// `stat <path> | grep Modify` into the session temp file, then parse it.
fn shell_stat(link: &mut Link, path: &str) -> Result<i64, OpError> {
    let temp = remote_temp_base(&link.remote_home);
    let command = stat_modify_command(path, &temp);
    run_command(link, &command)?;
    let bytes = link.transport.read_file(&temp)?;
    let mtime = parse_modify_line(&String::from_utf8_lossy(&bytes)).ok_or_else(|| {
        SessionError::Exec {
            command,
            reason: "no parsable Modify line in stat output".to_string(),
        }
    })?;
    Ok(mtime)
}
