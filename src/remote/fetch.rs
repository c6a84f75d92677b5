//! Compressed bulk download of large remote files (tags files).
//!
//! The remote file is gzipped into a scratch file under the session's temp
//! base, streamed down with `fast_get`, decompressed next to the destination
//! and atomically renamed into place:
//!
//! ```text
//! Compress   gzip -c <remote> > <home>/.ctagssh.temp.<hex>.gz
//! Transfer   fast_get -> <dest dir>/.ctagssh-XXXX.gz
//! Decompress gunzip   -> <dest dir>/.ctagssh-XXXX
//! Install    rename   -> <dest file>
//! ```
//!
//! [`FetchPipeline::fetch`] installs as `<dest_dir>/<basename>`;
//! [`FetchPipeline::fetch_to`] installs onto an exact file. Only that file is
//! ever replaced. Scratch files are removed on every exit path; removal
//! failures are collected, never swallowed.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use flate2::read::GzDecoder;
use tempfile::NamedTempFile;
use thiserror::Error;

use super::commands::{gzip_command, remote_temp_base};
use super::session::{SessionError, SessionManager};
use crate::path_format::expand_remote_tilde;

const LOCAL_TEMP_PREFIX: &str = ".ctagssh-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStep {
    Compress,
    Transfer,
    Decompress,
    Install,
}

impl fmt::Display for FetchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compress => write!(f, "compress"),
            Self::Transfer => write!(f, "transfer"),
            Self::Decompress => write!(f, "decompress"),
            Self::Install => write!(f, "install"),
        }
    }
}

/// Primary failure of a step.
#[derive(Error, Debug)]
pub enum FetchCause {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A scratch file that could not be removed.
#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("failed to remove remote temp file {path}: {source}")]
    Remote {
        path: String,
        #[source]
        source: SessionError,
    },

    #[error("failed to remove local temp file {path}: {source}")]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("not connected to remote host")]
    NotConnected,

    #[error("invalid remote file path `{0}`")]
    InvalidRemotePath(String),

    #[error("failed to prepare destination {path}: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{step} step failed: {cause}{}", describe_cleanup(.cleanup))]
    Step {
        step: FetchStep,
        #[source]
        cause: FetchCause,
        cleanup: Vec<CleanupError>,
    },
}

impl FetchError {
    /// Cleanup failures that accompanied the primary error.
    pub fn cleanup_errors(&self) -> &[CleanupError] {
        match self {
            Self::Step { cleanup, .. } => cleanup,
            _ => &[],
        }
    }

    pub fn step(&self) -> Option<FetchStep> {
        match self {
            Self::Step { step, .. } => Some(*step),
            _ => None,
        }
    }
}

fn describe_cleanup(cleanup: &[CleanupError]) -> String {
    if cleanup.is_empty() {
        return String::new();
    }
    let joined: Vec<String> = cleanup.iter().map(|e| e.to_string()).collect();
    format!(" (cleanup also failed: {})", joined.join("; "))
}

/// Outcome of a successful fetch.
#[derive(Debug)]
pub struct FetchReport {
    /// Installed file.
    pub local_path: PathBuf,
    /// Bytes pulled over the wire.
    pub compressed_bytes: u64,
    /// Size of the installed file.
    pub installed_bytes: u64,
    /// Scratch files left behind despite success.
    pub cleanup_errors: Vec<CleanupError>,
    pub duration_ms: u64,
}

pub struct FetchPipeline {
    session: SessionManager,
}

impl FetchPipeline {
    pub fn new(session: SessionManager) -> Self {
        Self { session }
    }

    /// Download `remote_file` into `dest_dir` under its own name. `~` expands
    /// against the remote home.
    pub async fn fetch(&self, remote_file: &str, dest_dir: &Path) -> Result<FetchReport, FetchError> {
        let home = self.session.remote_home().ok_or(FetchError::NotConnected)?;
        let remote = expand_remote_tilde(remote_file, &home);
        let basename = remote_basename(&remote)
            .ok_or_else(|| FetchError::InvalidRemotePath(remote_file.to_string()))?;
        self.fetch_to(remote_file, &dest_dir.join(basename)).await
    }

    /// Download `remote_file` and install it as `dest_file`.
    pub async fn fetch_to(
        &self,
        remote_file: &str,
        dest_file: &Path,
    ) -> Result<FetchReport, FetchError> {
        let start = Instant::now();
        if !self.session.is_connected() {
            return Err(FetchError::NotConnected);
        }
        let home = self.session.remote_home().ok_or(FetchError::NotConnected)?;
        let remote = expand_remote_tilde(remote_file, &home);
        if remote_basename(&remote).is_none() {
            return Err(FetchError::InvalidRemotePath(remote_file.to_string()));
        }
        let dest_dir = match dest_file.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };

        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|source| FetchError::Destination {
                path: dest_dir.to_path_buf(),
                source,
            })?;

        let remote_temp = format!(
            "{}.{:016x}.gz",
            remote_temp_base(&home),
            rand::random::<u64>()
        );
        let mut cleanup = Vec::new();

        tracing::info!(remote_path = %remote, remote_temp = %remote_temp, "compressing remote file");
        if let Err(e) = self.session.exec(&gzip_command(&remote, &remote_temp)).await {
            self.remove_remote_temp(&remote_temp, &mut cleanup).await;
            return Err(step_failed(FetchStep::Compress, e, cleanup));
        }

        let compressed = match tempfile::Builder::new()
            .prefix(LOCAL_TEMP_PREFIX)
            .suffix(".gz")
            .tempfile_in(dest_dir)
        {
            Ok(file) => file,
            Err(e) => {
                self.remove_remote_temp(&remote_temp, &mut cleanup).await;
                return Err(step_failed(FetchStep::Transfer, e, cleanup));
            }
        };
        let transferred = self
            .session
            .fast_get(&remote_temp, compressed.path().to_path_buf())
            .await;
        self.remove_remote_temp(&remote_temp, &mut cleanup).await;
        let compressed_bytes = match transferred {
            Ok(bytes) => bytes,
            Err(e) => {
                close_local(compressed, &mut cleanup);
                return Err(step_failed(FetchStep::Transfer, e, cleanup));
            }
        };
        tracing::debug!(compressed_bytes, "transfer complete");

        let source = compressed.path().to_path_buf();
        let dir = dest_dir.to_path_buf();
        let decompressed =
            match tokio::task::spawn_blocking(move || decompress_to_temp(&source, &dir)).await {
                Ok(result) => result,
                Err(join) => Err(io::Error::other(join.to_string())),
            };
        close_local(compressed, &mut cleanup);
        let (installed, installed_bytes) = match decompressed {
            Ok(done) => done,
            Err(e) => return Err(step_failed(FetchStep::Decompress, e, cleanup)),
        };

        let local_path = dest_file.to_path_buf();
        if let Err(e) = installed.persist(&local_path) {
            close_local(e.file, &mut cleanup);
            return Err(step_failed(FetchStep::Install, e.error, cleanup));
        }

        let report = FetchReport {
            local_path,
            compressed_bytes,
            installed_bytes,
            cleanup_errors: cleanup,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        tracing::info!(
            local_path = %report.local_path.display(),
            compressed_bytes,
            installed_bytes,
            duration_ms = report.duration_ms,
            "remote file installed"
        );
        Ok(report)
    }

    async fn remove_remote_temp(&self, path: &str, cleanup: &mut Vec<CleanupError>) {
        match self.session.remove_remote(path).await {
            // Compression may have failed before creating it.
            Ok(()) | Err(SessionError::NotFound(_)) => {}
            Err(source) => {
                tracing::warn!(remote_path = %path, error = %source, "failed to remove remote temp file");
                cleanup.push(CleanupError::Remote {
                    path: path.to_string(),
                    source,
                });
            }
        }
    }
}

fn step_failed(
    step: FetchStep,
    cause: impl Into<FetchCause>,
    cleanup: Vec<CleanupError>,
) -> FetchError {
    let cause = cause.into();
    tracing::warn!(%step, error = %cause, cleanup_failures = cleanup.len(), "fetch failed");
    FetchError::Step {
        step,
        cause,
        cleanup,
    }
}

fn close_local(file: NamedTempFile, cleanup: &mut Vec<CleanupError>) {
    let path = file.path().to_path_buf();
    if let Err(source) = file.close() {
        tracing::warn!(path = %path.display(), error = %source, "failed to remove local temp file");
        cleanup.push(CleanupError::Local { path, source });
    }
}

/// Last path component, rejecting empty, `.` and `..`.
fn remote_basename(remote: &str) -> Option<&str> {
    let name = remote.trim_end_matches('/').rsplit('/').next()?;
    match name {
        "" | "." | ".." => None,
        name => Some(name),
    }
}

/// Gunzip `source` into a fresh temp file inside `dir`.
fn decompress_to_temp(source: &Path, dir: &Path) -> io::Result<(NamedTempFile, u64)> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(source)?));
    let out = tempfile::Builder::new()
        .prefix(LOCAL_TEMP_PREFIX)
        .tempfile_in(dir)?;
    let mut writer = BufWriter::new(out);
    let bytes = io::copy(&mut decoder, &mut writer)?;
    writer.flush()?;
    let out = writer.into_inner().map_err(|e| e.into_error())?;
    out.as_file().sync_all()?;
    Ok((out, bytes))
}
