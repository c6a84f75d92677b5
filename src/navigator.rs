//! Go-to-definition over remote files.
//!
//! [`Navigator`] ties the pieces together: a symbol is looked up in the
//! [`TagIndex`], the tag's file is preloaded through the [`RemoteFileCache`]
//! and the [`resolve`]d line comes back as a [`Location`] on a fresh virtual
//! path. Every successful jump records where it came from so [`Navigator::back`]
//! can return there.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::config::CtagsshConfig;
use crate::path_format::{
    PathFormatError, VirtualPath, expand_remote_tilde, filter_by_extension, join_remote,
};
use crate::remote::{
    FetchError, FetchPipeline, FetchReport, RemoteDirEntry, RemoteFileCache, SessionError,
    SessionManager,
};
use crate::tags::{Tag, TagIndex, TagIndexError, resolve};

#[derive(Error, Debug)]
pub enum NavigateError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("`{tag}` not found in {remote_path}")]
    PatternNotFound { tag: String, remote_path: String },

    #[error("{0} was not preloaded")]
    NotPreloaded(String),

    #[error(transparent)]
    Path(#[from] PathFormatError),

    #[error("no remote tags directory configured (ctags_files_remote_path)")]
    NoTagsDirectory,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    TagIndex(#[from] TagIndexError),
}

/// Result of looking a symbol up, after extension filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Missing,
    Single(Tag),
    /// Caller picks one.
    Ambiguous(Vec<Tag>),
}

/// Where a jump landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// `ctagsshvf:<token>$<remote path>`
    pub uri: String,
    pub remote_path: String,
    /// 0-based.
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationHistoryEntry {
    pub origin_uri: String,
    pub origin_line: usize,
}

/// The parts of the configuration navigation depends on.
#[derive(Debug, Clone, Default)]
pub struct NavigatorSettings {
    /// Remote directory relative tag paths are joined onto.
    pub source_root: Option<String>,
    /// Remote directory holding downloadable tags files.
    pub ctags_files_remote_path: String,
    pub ctags_extensions: Vec<String>,
    pub show_extensions: Vec<String>,
}

impl NavigatorSettings {
    pub fn from_config(config: &CtagsshConfig) -> Self {
        Self {
            source_root: config
                .source_root
                .clone()
                .filter(|root| !root.trim().is_empty()),
            ctags_files_remote_path: config.ctags_files_remote_path.trim().to_string(),
            ctags_extensions: config.ctags_extension_list(),
            show_extensions: config.show_extension_list(),
        }
    }
}

pub struct Navigator {
    index: TagIndex,
    cache: RemoteFileCache,
    fetch: FetchPipeline,
    settings: NavigatorSettings,
    history: Vec<NavigationHistoryEntry>,
}

impl Navigator {
    pub fn new(index: TagIndex, session: SessionManager, settings: NavigatorSettings) -> Self {
        Self {
            index,
            cache: RemoteFileCache::new(session.clone()),
            fetch: FetchPipeline::new(session),
            settings,
            history: Vec::new(),
        }
    }

    pub fn index(&self) -> &TagIndex {
        &self.index
    }

    pub fn cache(&self) -> &RemoteFileCache {
        &self.cache
    }

    pub fn session(&self) -> &SessionManager {
        self.cache.session()
    }

    pub fn history(&self) -> &[NavigationHistoryEntry] {
        &self.history
    }

    /// Swap in a rebuilt index.
    pub fn replace_index(&mut self, index: TagIndex) {
        tracing::debug!(tags = index.len(), "replacing tag index");
        self.index = index;
    }

    pub fn candidates(&self, symbol: &str) -> Lookup {
        let tags: Vec<Tag> = self.index.lookup(symbol).into_iter().cloned().collect();
        let mut tags = filter_by_extension(tags, &self.settings.show_extensions, |t| {
            t.file_path.as_str()
        });
        match tags.len() {
            0 => Lookup::Missing,
            1 => Lookup::Single(tags.remove(0)),
            _ => Lookup::Ambiguous(tags),
        }
    }

    /// Remote path a tag's file lives at.
    pub fn remote_path_of(&self, tag: &Tag) -> String {
        match &self.settings.source_root {
            Some(root) => {
                let root = match self.session().remote_home() {
                    Some(home) => expand_remote_tilde(root, &home),
                    None => root.clone(),
                };
                join_remote(&root, &tag.file_path)
            }
            None => tag.file_path.clone(),
        }
    }

    /// Jump to `tag`, remembering `origin` on success.
    pub async fn open(
        &mut self,
        tag: &Tag,
        origin: Option<NavigationHistoryEntry>,
    ) -> Result<Location, NavigateError> {
        let path = VirtualPath::new(self.remote_path_of(tag));
        self.cache.preload_virtual(&path).await?;
        let content = self.content(path.remote_path())?;

        let line = resolve(&content, tag).ok_or_else(|| NavigateError::PatternNotFound {
            tag: tag.name.clone(),
            remote_path: path.remote_path().to_string(),
        })?;
        let text = content
            .split('\n')
            .nth(line)
            .unwrap_or_default()
            .trim_end_matches('\r')
            .to_string();

        if let Some(origin) = origin {
            self.history.push(origin);
        }
        tracing::info!(tag = %tag.name, remote_path = %path.remote_path(), line, "opened definition");
        Ok(Location {
            uri: path.to_uri(),
            remote_path: path.remote_path().to_string(),
            line,
            text,
        })
    }

    /// Pop the last origin; remote origins are preloaded again first.
    ///
    /// A failed preload leaves the entry on the stack.
    pub async fn back(&mut self) -> Result<Option<NavigationHistoryEntry>, NavigateError> {
        let Some(entry) = self.history.pop() else {
            return Ok(None);
        };
        if VirtualPath::is_virtual(&entry.origin_uri) {
            let reloaded = match VirtualPath::parse(&entry.origin_uri) {
                Ok(path) => self.cache.preload_virtual(&path).await.map_err(NavigateError::from),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = reloaded {
                self.history.push(entry);
                return Err(e);
            }
        }
        Ok(Some(entry))
    }

    /// Regular files in the remote tags directory, filtered by
    /// `ctags_extensions` and sorted by name.
    pub async fn list_remote_tag_files(&self) -> Result<Vec<RemoteDirEntry>, NavigateError> {
        let dir = self.remote_tags_dir()?;
        let entries = self.session().read_dir(&dir).await?;
        let files: Vec<RemoteDirEntry> = entries.into_iter().filter(|e| e.is_file).collect();
        let mut files = filter_by_extension(files, &self.settings.ctags_extensions, |e| {
            e.filename.as_str()
        });
        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(files)
    }

    /// Download `file_name` from the remote tags directory over
    /// `local_tags_path` and reindex from it.
    pub async fn refresh_tags(
        &mut self,
        file_name: &str,
        local_tags_path: &Path,
    ) -> Result<FetchReport, NavigateError> {
        let remote = join_remote(&self.remote_tags_dir()?, file_name);
        let report = self.fetch.fetch_to(&remote, local_tags_path).await?;

        let index = TagIndex::load(local_tags_path)?;
        self.replace_index(index);
        self.cache.flush();
        Ok(report)
    }

    fn remote_tags_dir(&self) -> Result<String, NavigateError> {
        let dir = &self.settings.ctags_files_remote_path;
        if dir.is_empty() {
            return Err(NavigateError::NoTagsDirectory);
        }
        Ok(match self.session().remote_home() {
            Some(home) => expand_remote_tilde(dir, &home),
            None => dir.clone(),
        })
    }

    fn content(&self, remote_path: &str) -> Result<Arc<str>, NavigateError> {
        self.cache
            .content(remote_path)
            .ok_or_else(|| NavigateError::NotPreloaded(remote_path.to_string()))
    }
}
