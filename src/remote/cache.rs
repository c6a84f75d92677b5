//! mtime-validated cache of remote file contents.
//!
//! `preload` must succeed before `content` is asked for a path. A hit needs
//! the stored mtime to be at least the freshly observed one. When the remote
//! mtime cannot be determined it is taken as 0, so any cached entry counts as
//! fresh on servers without stat support. Losing the link during the mtime
//! check fails the preload instead.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use super::session::{SessionError, SessionManager};
use crate::path_format::VirtualPath;

/// One cached remote file.
#[derive(Debug, Clone)]
pub struct CachedFile {
    pub remote_path: String,
    /// Remote mtime observed when fetched (epoch seconds, 0 = unknown).
    pub mtime: i64,
    pub fetched_at: i64,
    pub last_access: i64,
    pub content: Arc<str>,
}

pub struct RemoteFileCache {
    session: SessionManager,
    entries: Mutex<HashMap<String, CachedFile>>,
}

impl RemoteFileCache {
    pub fn new(session: SessionManager) -> Self {
        Self {
            session,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Make `remote_path` available to [`content`](Self::content).
    ///
    /// Errors from the session are returned unchanged and leave no entry.
    pub async fn preload(&self, remote_path: &str) -> Result<(), SessionError> {
        if !self.session.is_connected() {
            return Err(SessionError::Unavailable(
                "not connected to remote host".to_string(),
            ));
        }

        let observed = match self.session.stat(remote_path).await {
            Ok(mtime) => mtime,
            Err(e @ SessionError::Unavailable(_)) => return Err(e),
            Err(e) => {
                tracing::warn!(remote_path, error = %e, "remote mtime unknown; treating as 0");
                0
            }
        };

        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(remote_path) {
                if entry.mtime >= observed {
                    entry.last_access = Utc::now().timestamp();
                    tracing::debug!(remote_path, mtime = entry.mtime, "cache hit");
                    return Ok(());
                }
                tracing::debug!(
                    remote_path,
                    cached = entry.mtime,
                    observed,
                    "cached file is stale"
                );
                entries.remove(remote_path);
            } else {
                tracing::debug!(remote_path, "cache miss");
            }
        }

        let bytes = self.session.read_file(remote_path).await?;
        let now = Utc::now().timestamp();
        let entry = CachedFile {
            remote_path: remote_path.to_string(),
            mtime: observed,
            fetched_at: now,
            last_access: now,
            content: Arc::from(String::from_utf8_lossy(&bytes).as_ref()),
        };
        self.entries.lock().insert(remote_path.to_string(), entry);
        Ok(())
    }

    /// Preload the remote file behind a virtual document path.
    pub async fn preload_virtual(&self, path: &VirtualPath) -> Result<(), SessionError> {
        self.preload(path.remote_path()).await
    }

    /// Text of a preloaded file; `None` means `preload` was skipped or failed.
    pub fn content(&self, remote_path: &str) -> Option<Arc<str>> {
        self.entries
            .lock()
            .get(remote_path)
            .map(|e| Arc::clone(&e.content))
    }

    pub fn entry(&self, remote_path: &str) -> Option<CachedFile> {
        self.entries.lock().get(remote_path).cloned()
    }

    pub fn contains(&self, remote_path: &str) -> bool {
        self.entries.lock().contains_key(remote_path)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop one entry; returns whether it was cached.
    pub fn invalidate(&self, remote_path: &str) -> bool {
        self.entries.lock().remove(remote_path).is_some()
    }

    pub fn flush(&self) {
        let mut entries = self.entries.lock();
        tracing::debug!(entries = entries.len(), "flushing remote file cache");
        entries.clear();
    }
}
