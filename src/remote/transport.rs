//! Transport seam between the session manager and the wire.
//!
//! [`TransportConnector`] opens a [`RemoteTransport`] that owns both the SSH
//! session and its SFTP channel; the session manager never sees a half-open
//! link. All calls are blocking and are run on tokio's blocking pool.

use std::fs::File;
use std::io::{BufWriter, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use ssh2::{ErrorCode, Session, Sftp};
use thiserror::Error;

use crate::config::{ConnectionConfig, Timeouts};

/// SFTP status codes from draft-ietf-secsh-filexfer.
const SSH_FX_NO_SUCH_FILE: i32 = 2;
const SSH_FX_OP_UNSUPPORTED: i32 = 8;

/// `LIBSSH2_ERROR_TIMEOUT`
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// Seam-level failure of a single remote call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no such file: {0}")]
    NotFound(String),

    #[error("operation not supported by server: {0}")]
    Unsupported(String),

    /// Any other SFTP status from the server. The link is still usable.
    #[error("{0}")]
    Refused(String),

    /// Local filesystem failure while writing a transfer.
    #[error("{0}")]
    Local(String),

    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("{0}")]
    Io(String),
}

impl TransportError {
    /// Whether the SSH link is unusable after this error.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, Self::TimedOut(_) | Self::Io(_))
    }
}

/// Why a connection could not be established.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("SSH connection to {host} failed: {reason}")]
    Transport { host: String, reason: String },

    #[error("SSH authentication as {user} failed: {reason}")]
    Auth { user: String, reason: String },

    #[error("SFTP channel could not be opened: {0}")]
    Sftp(String),

    #[error("failed to resolve remote home directory: {0}")]
    HomeDir(String),

    #[error("Connection timed out after {0} seconds")]
    Timeout(u64),

    #[error("connection attempt superseded by a newer one")]
    Superseded,

    #[error("connection task failed: {0}")]
    Task(String),
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDirEntry {
    pub filename: String,
    pub is_file: bool,
    pub size: u64,
    /// Modify time in epoch seconds (0 when the server omits it).
    pub mtime: i64,
}

/// Captured result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// An open SSH session plus SFTP channel.
pub trait RemoteTransport: Send {
    /// Absolute path of the login directory.
    fn home_dir(&mut self) -> Result<String, TransportError>;

    /// Native SFTP stat; `Unsupported` when the server cannot report mtime.
    fn stat_mtime(&mut self, path: &str) -> Result<i64, TransportError>;

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, TransportError>;

    fn read_dir(&mut self, path: &str) -> Result<Vec<RemoteDirEntry>, TransportError>;

    fn exec(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError>;

    /// Stream `remote` into `local`, returning the bytes copied.
    fn fast_get(
        &mut self,
        remote: &str,
        local: &Path,
        timeout: Duration,
    ) -> Result<u64, TransportError>;

    fn remove_file(&mut self, path: &str) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;
}

/// Factory for transports; swapped for an in-memory fake in tests.
pub trait TransportConnector: Send + Sync {
    fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn RemoteTransport>, ConnectError>;
}

/// libssh2-backed connector.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ssh2Connector;

impl TransportConnector for Ssh2Connector {
    fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn RemoteTransport>, ConnectError> {
        let transport_err = |reason: String| ConnectError::Transport {
            host: config.host.clone(),
            reason,
        };

        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| transport_err(e.to_string()))?
            .next()
            .ok_or_else(|| transport_err("host resolved to no addresses".to_string()))?;
        let tcp = TcpStream::connect_timeout(&addr, config.timeouts.connect)
            .map_err(|e| transport_err(e.to_string()))?;

        let mut session = Session::new().map_err(|e| transport_err(e.to_string()))?;
        session.set_timeout(millis(config.timeouts.connect));
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| transport_err(e.message().to_string()))?;

        let auth = match &config.identity_file {
            Some(key) => session.userauth_pubkey_file(
                &config.username,
                None,
                key,
                (!config.credential.is_empty()).then_some(config.credential.as_str()),
            ),
            None => session.userauth_password(&config.username, &config.credential),
        };
        auth.map_err(|e| ConnectError::Auth {
            user: config.username.clone(),
            reason: e.message().to_string(),
        })?;
        if !session.authenticated() {
            return Err(ConnectError::Auth {
                user: config.username.clone(),
                reason: "server rejected credentials".to_string(),
            });
        }

        let sftp = session
            .sftp()
            .map_err(|e| ConnectError::Sftp(e.message().to_string()))?;
        session.set_timeout(millis(config.timeouts.exec));

        tracing::debug!(host = %config.host, port = config.port, "ssh transport opened");
        Ok(Box::new(Ssh2Transport {
            session,
            sftp: Some(sftp),
            timeouts: config.timeouts,
        }))
    }
}

struct Ssh2Transport {
    session: Session,
    sftp: Option<Sftp>,
    timeouts: Timeouts,
}

impl Ssh2Transport {
    fn sftp(&self) -> Result<&Sftp, TransportError> {
        self.sftp
            .as_ref()
            .ok_or_else(|| TransportError::Io("SFTP channel closed".to_string()))
    }
}

impl RemoteTransport for Ssh2Transport {
    fn home_dir(&mut self) -> Result<String, TransportError> {
        let home = self
            .sftp()?
            .realpath(Path::new("."))
            .map_err(|e| map_ssh_error(".", e))?;
        Ok(home.to_string_lossy().into_owned())
    }

    fn stat_mtime(&mut self, path: &str) -> Result<i64, TransportError> {
        let stat = self
            .sftp()?
            .stat(Path::new(path))
            .map_err(|e| map_ssh_error(path, e))?;
        match stat.mtime {
            Some(mtime) => Ok(mtime as i64),
            None => Err(TransportError::Unsupported(format!(
                "server reported no modify time for {}",
                path
            ))),
        }
    }

    fn read_file(&mut self, path: &str) -> Result<Vec<u8>, TransportError> {
        let mut file = self
            .sftp()?
            .open(Path::new(path))
            .map_err(|e| map_ssh_error(path, e))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| map_io_error(path, e))?;
        Ok(buf)
    }

    fn read_dir(&mut self, path: &str) -> Result<Vec<RemoteDirEntry>, TransportError> {
        let entries = self
            .sftp()?
            .readdir(Path::new(path))
            .map_err(|e| map_ssh_error(path, e))?;
        Ok(entries
            .into_iter()
            .map(|(entry_path, stat)| RemoteDirEntry {
                filename: entry_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                is_file: stat.is_file(),
                size: stat.size.unwrap_or(0),
                mtime: stat.mtime.unwrap_or(0) as i64,
            })
            .collect())
    }

    fn exec(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput, TransportError> {
        self.session.set_timeout(millis(timeout));
        let result = (|| -> Result<ExecOutput, TransportError> {
            let mut channel = self
                .session
                .channel_session()
                .map_err(|e| map_ssh_error(command, e))?;
            channel.exec(command).map_err(|e| map_ssh_error(command, e))?;

            let mut stdout = String::new();
            channel
                .read_to_string(&mut stdout)
                .map_err(|e| map_io_error(command, e))?;
            let mut stderr = String::new();
            channel
                .stderr()
                .read_to_string(&mut stderr)
                .map_err(|e| map_io_error(command, e))?;
            channel.wait_close().map_err(|e| map_ssh_error(command, e))?;
            let exit_status = channel
                .exit_status()
                .map_err(|e| map_ssh_error(command, e))?;
            Ok(ExecOutput {
                exit_status,
                stdout,
                stderr,
            })
        })();
        self.session.set_timeout(millis(self.timeouts.exec));
        result
    }

    fn fast_get(
        &mut self,
        remote: &str,
        local: &Path,
        timeout: Duration,
    ) -> Result<u64, TransportError> {
        self.session.set_timeout(millis(timeout));
        let result = (|| -> Result<u64, TransportError> {
            let mut source = self
                .sftp()?
                .open(Path::new(remote))
                .map_err(|e| map_ssh_error(remote, e))?;
            let target = File::create(local).map_err(|e| {
                TransportError::Local(format!("cannot create {}: {}", local.display(), e))
            })?;
            let mut writer = BufWriter::new(target);
            let copied = std::io::copy(&mut source, &mut writer)
                .map_err(|e| map_io_error(remote, e))?;
            writer
                .into_inner()
                .map_err(|e| TransportError::Local(e.to_string()))?
                .sync_all()
                .map_err(|e| TransportError::Local(e.to_string()))?;
            Ok(copied)
        })();
        self.session.set_timeout(millis(self.timeouts.exec));
        result
    }

    fn remove_file(&mut self, path: &str) -> Result<(), TransportError> {
        self.sftp()?
            .unlink(Path::new(path))
            .map_err(|e| map_ssh_error(path, e))
    }

    fn close(&mut self) -> Result<(), TransportError> {
        // The SFTP channel must go before the session it rides on.
        self.sftp = None;
        self.session
            .disconnect(None, "ctagssh disconnect", None)
            .map_err(|e| TransportError::Io(e.message().to_string()))
    }
}

fn millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

fn map_ssh_error(subject: &str, err: ssh2::Error) -> TransportError {
    match err.code() {
        ErrorCode::SFTP(SSH_FX_NO_SUCH_FILE) => TransportError::NotFound(subject.to_string()),
        ErrorCode::SFTP(SSH_FX_OP_UNSUPPORTED) => {
            TransportError::Unsupported(format!("{}: {}", subject, err.message()))
        }
        ErrorCode::SFTP(_) => TransportError::Refused(format!("{}: {}", subject, err.message())),
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) => TransportError::TimedOut(subject.to_string()),
        _ => TransportError::Io(format!("{}: {}", subject, err.message())),
    }
}

fn map_io_error(subject: &str, err: std::io::Error) -> TransportError {
    match err.kind() {
        std::io::ErrorKind::NotFound => TransportError::NotFound(subject.to_string()),
        std::io::ErrorKind::TimedOut => TransportError::TimedOut(subject.to_string()),
        _ => TransportError::Io(format!("{}: {}", subject, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_secs(2)), 2000);
        assert_eq!(millis(Duration::from_secs(u64::MAX / 1000)), u32::MAX);
    }

    #[test]
    fn test_map_io_error() {
        let nf = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(
            map_io_error("/a", nf),
            TransportError::NotFound("/a".to_string())
        );
        let other = std::io::Error::other("reset by peer");
        assert!(matches!(map_io_error("/a", other), TransportError::Io(m) if m.contains("reset")));
    }

    #[test]
    fn test_map_ssh_error_separates_refusals_from_link_failures() {
        let denied = map_ssh_error("/a", ssh2::Error::new(ErrorCode::SFTP(3), "permission denied"));
        assert!(matches!(&denied, TransportError::Refused(m) if m.contains("permission denied")));
        assert!(!denied.is_link_failure());

        let missing = map_ssh_error("/a", ssh2::Error::new(ErrorCode::SFTP(SSH_FX_NO_SUCH_FILE), "x"));
        assert_eq!(missing, TransportError::NotFound("/a".to_string()));
        assert!(!missing.is_link_failure());

        let timeout = map_ssh_error(
            "`gzip`",
            ssh2::Error::new(ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT), "timed out"),
        );
        assert!(timeout.is_link_failure());
        assert!(map_ssh_error("/a", ssh2::Error::new(ErrorCode::Session(-7), "socket send")).is_link_failure());
    }

    #[test]
    fn test_connect_error_display() {
        assert_eq!(
            ConnectError::Timeout(10).to_string(),
            "Connection timed out after 10 seconds"
        );
        let err = ConnectError::Auth {
            user: "dev".into(),
            reason: "denied".into(),
        };
        assert_eq!(err.to_string(), "SSH authentication as dev failed: denied");
    }
}
