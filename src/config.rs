//! Configuration for ctagssh.
//!
//! Settings live in `~/.config/ctagssh/config.toml` (platform config dir):
//!
//! ```toml
//! host = "build-box"
//! port = 22
//! username = "dev"
//! credential = "secret"
//! tags_file = ".tags"
//! source_root = "/srv/project"
//! ctags_files_remote_path = "~/tags"
//! ctags_extensions = "tags, ctags"
//! show_extensions = "c h"
//! ```
//!
//! `CTAGSSH_*` environment variables override the file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::path_format::parse_extension_list;

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("config field `{0}` is required")]
    MissingField(&'static str),

    #[error("invalid value for `{field}`: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Bounds on blocking remote operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub exec: Duration,
    pub transfer: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            exec: Duration::from_secs(60),
            transfer: Duration::from_secs(300),
        }
    }
}

/// Everything needed to open one SSH session. Immutable once handed to `connect`.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: String,
    pub identity_file: Option<PathBuf>,
    pub timeouts: Timeouts,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            credential: String::new(),
            identity_file: None,
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = credential.into();
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("credential", &"<redacted>")
            .field("identity_file", &self.identity_file)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

/// On-disk configuration.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct CtagsshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: String,
    pub identity_file: Option<PathBuf>,
    /// Local tags file.
    pub tags_file: PathBuf,
    /// Remote directory that relative tag paths are joined onto.
    pub source_root: Option<String>,
    /// Remote directory holding downloadable tags files.
    pub ctags_files_remote_path: String,
    pub ctags_extensions: String,
    pub show_extensions: String,
    pub connect_timeout_secs: u64,
    pub exec_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
}

impl Default for CtagsshConfig {
    fn default() -> Self {
        let timeouts = Timeouts::default();
        Self {
            host: String::new(),
            port: DEFAULT_SSH_PORT,
            username: String::new(),
            credential: String::new(),
            identity_file: None,
            tags_file: PathBuf::from(".tags"),
            source_root: None,
            ctags_files_remote_path: String::new(),
            ctags_extensions: String::new(),
            show_extensions: String::new(),
            connect_timeout_secs: timeouts.connect.as_secs(),
            exec_timeout_secs: timeouts.exec.as_secs(),
            transfer_timeout_secs: timeouts.transfer.as_secs(),
        }
    }
}

impl CtagsshConfig {
    /// `<config dir>/ctagssh/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "ctagssh").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing default file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env_from(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `CTAGSSH_*` overrides looked up through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("CTAGSSH_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("CTAGSSH_PORT") {
            self.port = port.trim().parse().map_err(|_| ConfigError::InvalidValue {
                field: "port",
                value: port.clone(),
            })?;
        }
        if let Some(username) = lookup("CTAGSSH_USERNAME") {
            self.username = username;
        }
        if let Some(password) = lookup("CTAGSSH_PASSWORD") {
            self.credential = password;
        }
        if let Some(identity) = lookup("CTAGSSH_IDENTITY_FILE") {
            self.identity_file = Some(PathBuf::from(identity));
        }
        if let Some(tags) = lookup("CTAGSSH_TAGS_FILE") {
            self.tags_file = PathBuf::from(tags);
        }
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(self.connect_timeout_secs),
            exec: Duration::from_secs(self.exec_timeout_secs),
            transfer: Duration::from_secs(self.transfer_timeout_secs),
        }
    }

    /// Connection settings for the session manager.
    pub fn connection(&self) -> Result<ConnectionConfig, ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingField("host"));
        }
        if self.username.trim().is_empty() {
            return Err(ConfigError::MissingField("username"));
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port",
                value: "0".to_string(),
            });
        }
        let mut conn = ConnectionConfig::new(self.host.trim(), self.username.trim())
            .with_port(self.port)
            .with_credential(self.credential.clone())
            .with_timeouts(self.timeouts());
        if let Some(identity) = &self.identity_file {
            conn = conn.with_identity_file(identity.clone());
        }
        Ok(conn)
    }

    pub fn ctags_extension_list(&self) -> Vec<String> {
        parse_extension_list(&self.ctags_extensions)
    }

    pub fn show_extension_list(&self) -> Vec<String> {
        parse_extension_list(&self.show_extensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = CtagsshConfig::default();
        assert_eq!(config.port, 22);
        assert_eq!(config.tags_file, PathBuf::from(".tags"));
        assert_eq!(config.timeouts(), Timeouts::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = CtagsshConfig::from_toml(
            r#"
host = "box"
username = "dev"
show_extensions = "C; h"
"#,
        )
        .unwrap();
        assert_eq!(config.host, "box");
        assert_eq!(config.port, 22);
        assert_eq!(config.show_extension_list(), vec!["c", "h"]);
        assert!(config.ctags_extension_list().is_empty());
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = CtagsshConfig::from_file(&dir.path().join("none.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "port = \"not a number\"").unwrap();
        assert!(matches!(
            CtagsshConfig::from_file(&bad),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CTAGSSH_HOST", "other"),
            ("CTAGSSH_PORT", "2222"),
            ("CTAGSSH_PASSWORD", "pw"),
            ("CTAGSSH_TAGS_FILE", "/tmp/tags"),
        ]
        .into_iter()
        .collect();
        let mut config = CtagsshConfig::default();
        config
            .apply_env_from(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.host, "other");
        assert_eq!(config.port, 2222);
        assert_eq!(config.credential, "pw");
        assert_eq!(config.tags_file, PathBuf::from("/tmp/tags"));
    }

    #[test]
    fn test_env_bad_port() {
        let mut config = CtagsshConfig::default();
        let result = config.apply_env_from(|key| (key == "CTAGSSH_PORT").then(|| "ssh".to_string()));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { field: "port", .. })
        ));
    }

    #[test]
    fn test_connection_requires_host_and_user() {
        let mut config = CtagsshConfig::default();
        assert!(matches!(
            config.connection(),
            Err(ConfigError::MissingField("host"))
        ));
        config.host = "box".into();
        assert!(matches!(
            config.connection(),
            Err(ConfigError::MissingField("username"))
        ));
        config.username = "dev".into();
        config.credential = "pw".into();
        config.exec_timeout_secs = 5;
        let conn = config.connection().unwrap();
        assert_eq!(conn.host, "box");
        assert_eq!(conn.port, 22);
        assert_eq!(conn.timeouts.exec, Duration::from_secs(5));
    }

    #[test]
    fn test_connection_debug_redacts_credential() {
        let conn = ConnectionConfig::new("box", "dev").with_credential("hunter2");
        let rendered = format!("{:?}", conn);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
