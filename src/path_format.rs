//! Path and text helpers shared by the tag index and the remote layer.
//!
//! The main piece is [`VirtualPath`], the opaque identifier used to address a
//! remote file as a virtual document: `ctagsshvf:<token>$<remote path>`. The
//! token only disambiguates documents; every cache and session lookup uses the
//! recovered remote path.

use std::fmt;

use thiserror::Error;

/// URI scheme of virtual documents served from the remote cache.
pub const VIRTUAL_SCHEME: &str = "ctagsshvf";

/// Separator between the random token and the remote path.
pub const TOKEN_SEPARATOR: char = '$';

/// Characters that carry meaning in a regular expression.
const REGEX_META: &[char] = &[
    '-', '\\', '/', '^', '$', '*', '+', '?', '.', '(', ')', '|', '[', ']', '{', '}',
];

const ELLIPSIS: char = '…';

const BYTE_UNITS: [&str; 9] = ["B", "kB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathFormatError {
    #[error("unexpected scheme `{0}` (expected `{VIRTUAL_SCHEME}`)")]
    Scheme(String),

    #[error("virtual path `{0}` has no `{TOKEN_SEPARATOR}` separator")]
    MissingSeparator(String),

    #[error("virtual path `{0}` has an empty token")]
    EmptyToken(String),

    #[error("virtual path `{0}` has an empty remote path")]
    EmptyPath(String),
}

/// Which side of a long path gets replaced by an ellipsis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollapseMode {
    /// Keep the tail: `…/src/foo.c`
    Left,
    /// Keep both ends: `/home…/foo.c`
    Center,
    /// Keep the head: `/home/user/…`
    Right,
}

/// Shorten `path` to at most `max_len` characters.
pub fn collapse_path(path: &str, max_len: usize, mode: CollapseMode) -> String {
    let chars: Vec<char> = path.chars().collect();
    if chars.len() <= max_len {
        return path.to_string();
    }
    if max_len == 0 {
        return String::new();
    }

    let len = chars.len();
    let mut out = String::with_capacity(max_len * 4);
    match mode {
        CollapseMode::Left => {
            out.push(ELLIPSIS);
            out.extend(&chars[len - (max_len - 1)..]);
        }
        CollapseMode::Right => {
            out.extend(&chars[..max_len - 1]);
            out.push(ELLIPSIS);
        }
        CollapseMode::Center => {
            let head = (max_len - 1) / 2;
            let tail = max_len / 2;
            out.extend(&chars[..head]);
            out.push(ELLIPSIS);
            out.extend(&chars[len - tail..]);
        }
    }
    out
}

/// Human readable size with decimal units, e.g. `1.50 kB`.
pub fn format_bytes(bytes: u64) -> String {
    let mut unit = 0;
    let mut value = bytes as f64;
    while value >= 1000.0 && unit < BYTE_UNITS.len() - 1 {
        unit += 1;
        value /= 1000.0;
    }
    if unit == 0 {
        format!("{} {}", bytes, BYTE_UNITS[0])
    } else {
        format!("{:.2} {}", value, BYTE_UNITS[unit])
    }
}

/// Escape every regex metacharacter so `text` matches only itself.
pub fn escape_regex(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        if REGEX_META.contains(&ch) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Split a user supplied extension list (`"c, h;cpp  hpp"`) into lowercase entries.
pub fn parse_extension_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Lowercased extension of the last path component, without the dot.
pub fn file_extension(path: &str) -> Option<String> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

/// Keep the items whose extension is listed.
///
/// An empty filter, or a filter that matches nothing, returns every item.
pub fn filter_by_extension<T, F>(items: Vec<T>, extensions: &[String], path_of: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    if extensions.is_empty() {
        return items;
    }
    let matches = |item: &T| {
        file_extension(path_of(item)).is_some_and(|ext| extensions.iter().any(|e| *e == ext))
    };
    if !items.iter().any(matches) {
        return items;
    }
    items.into_iter().filter(|item| matches(item)).collect()
}

/// POSIX join of a remote root and a (possibly relative) path.
pub fn join_remote(root: &str, path: &str) -> String {
    if path.starts_with('/') || root.is_empty() {
        return path.to_string();
    }
    let root = root.trim_end_matches('/');
    let path = path.trim_start_matches("./");
    if root.is_empty() {
        format!("/{}", path)
    } else {
        format!("{}/{}", root, path)
    }
}

/// Expand `~` and `~/...` against the remote home directory.
///
/// `~user/...` is left as-is.
pub fn expand_remote_tilde(path: &str, remote_home: &str) -> String {
    if path == "~" {
        remote_home.to_string()
    } else if let Some(rest) = path.strip_prefix("~/") {
        format!("{}/{}", remote_home.trim_end_matches('/'), rest)
    } else {
        path.to_string()
    }
}

/// Addressable handle for a remote file opened as a virtual document.
///
/// Two handles for the same remote path differ in `token`, so an editor sees
/// two distinct documents while the cache keys on `remote_path` only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VirtualPath {
    token: String,
    remote_path: String,
}

impl VirtualPath {
    /// Create a handle with a fresh random token.
    pub fn new(remote_path: impl Into<String>) -> Self {
        let token = format!("{:x}", rand::random::<u8>());
        Self {
            token,
            remote_path: remote_path.into(),
        }
    }

    pub fn with_token(token: impl Into<String>, remote_path: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            remote_path: remote_path.into(),
        }
    }

    /// Parse either `ctagsshvf:<token>$<path>` or the scheme-less `<token>$<path>`.
    pub fn parse(raw: &str) -> Result<Self, PathFormatError> {
        let body = match raw.split_once(':') {
            Some((scheme, rest)) if !scheme.contains(TOKEN_SEPARATOR) && !scheme.contains('/') => {
                if scheme != VIRTUAL_SCHEME {
                    return Err(PathFormatError::Scheme(scheme.to_string()));
                }
                rest
            }
            _ => raw,
        };

        let (token, remote_path) = body
            .split_once(TOKEN_SEPARATOR)
            .ok_or_else(|| PathFormatError::MissingSeparator(raw.to_string()))?;
        if token.is_empty() {
            return Err(PathFormatError::EmptyToken(raw.to_string()));
        }
        if remote_path.is_empty() {
            return Err(PathFormatError::EmptyPath(raw.to_string()));
        }
        Ok(Self::with_token(token, remote_path))
    }

    /// Whether `uri` names a virtual document of this crate.
    pub fn is_virtual(uri: &str) -> bool {
        uri.strip_prefix(VIRTUAL_SCHEME)
            .is_some_and(|rest| rest.starts_with(':'))
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    pub fn to_uri(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}{}{}",
            VIRTUAL_SCHEME, self.token, TOKEN_SEPARATOR, self.remote_path
        )
    }
}
