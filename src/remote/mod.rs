//! Everything that talks to the remote host.
//!
//! - **transport**: the blocking SSH/SFTP seam and its `ssh2` implementation
//! - **session**: [`SessionManager`], connection state, stat fallback, reconnect
//! - **commands**: the remote shell command lines
//! - **cache**: [`RemoteFileCache`], mtime-validated file contents
//! - **fetch**: [`FetchPipeline`], compressed bulk download
//!
//! The session tracks a [`SessionState`]; the cache and pipeline only act
//! while it is `Connected`.

pub mod cache;
pub mod commands;
pub mod fetch;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CachedFile, RemoteFileCache};
pub use fetch::{CleanupError, FetchCause, FetchError, FetchPipeline, FetchReport, FetchStep};
pub use session::{SessionError, SessionManager, SessionState};
pub use transport::{
    ConnectError, ExecOutput, RemoteDirEntry, RemoteTransport, Ssh2Connector, TransportConnector,
    TransportError,
};
