//! In-memory index over a ctags file.
//!
//! A record is `name<TAB>file<TAB>address;"<TAB>kind<TAB>key:value...`. The
//! address is either a 1-based line number or a `/^...$/` search pattern;
//! search patterns are stored regex-escaped so later matching is literal.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::path_format::escape_regex;

/// Prefix of ctags pseudo-tags (`!_TAG_FILE_FORMAT` and friends).
pub const PSEUDO_TAG_PREFIX: &str = "!_";

/// Separates the ex command from the extension fields.
const EX_TERMINATOR: &str = ";\"";

#[derive(Error, Debug)]
pub enum TagIndexError {
    #[error("failed to read tags file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How [`Tag::pattern`] locates the definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// `pattern` is a 1-based line number.
    LineNumber,
    /// `pattern` is an escaped regular expression matched line by line.
    SearchPattern,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    /// Remote path, possibly relative to the tags root.
    pub file_path: String,
    pub pattern: String,
    pub pattern_kind: PatternKind,
    /// Single-letter (or long) kind from the extension fields, e.g. `f`.
    pub kind: Option<String>,
    /// Remaining `key:value` extension fields in file order.
    pub fields: Vec<(String, String)>,
}

impl Tag {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Parsed tags file. Rebuilt wholesale on reload, never mutated in place.
#[derive(Debug, Clone, Default)]
pub struct TagIndex {
    tags: Vec<Tag>,
    by_name: HashMap<String, Vec<usize>>,
}

impl TagIndex {
    pub fn build<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut index = Self::default();
        let mut skipped = 0usize;
        for line in lines {
            match parse_line(line.as_ref()) {
                Some(tag) => {
                    index
                        .by_name
                        .entry(tag.name.clone())
                        .or_default()
                        .push(index.tags.len());
                    index.tags.push(tag);
                }
                None => skipped += 1,
            }
        }
        tracing::debug!(tags = index.tags.len(), skipped, "built tag index");
        index
    }

    /// Read and index a local tags file.
    pub fn load(path: &Path) -> Result<Self, TagIndexError> {
        let io_err = |source| TagIndexError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let mut lines = Vec::new();
        for chunk in BufReader::new(file).split(b'\n') {
            let chunk = chunk.map_err(io_err)?;
            lines.push(String::from_utf8_lossy(&chunk).into_owned());
        }
        let index = Self::build(lines);
        tracing::info!(path = %path.display(), tags = index.len(), "loaded tags file");
        Ok(index)
    }

    /// All tags named `name`, in file order.
    pub fn lookup(&self, name: &str) -> Vec<&Tag> {
        self.by_name
            .get(name)
            .map(|ids| ids.iter().map(|&i| &self.tags[i]).collect())
            .unwrap_or_default()
    }

    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

/// Parse one tags-file record. Pseudo-tags and malformed lines yield `None`.
pub fn parse_line(line: &str) -> Option<Tag> {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut parts = line.splitn(3, '\t');
    let name = parts.next()?;
    let file_path = parts.next()?;
    let remainder = parts.next()?;

    if name.is_empty() || name.starts_with(PSEUDO_TAG_PREFIX) {
        return None;
    }

    let (address, trailer) = split_address(remainder);
    let span = if address.starts_with(['/', '?']) {
        address
    } else {
        &address[address.find("/^").unwrap_or(0)..]
    };

    let (pattern, pattern_kind) = if span.parse::<i64>().is_ok() {
        (span.to_string(), PatternKind::LineNumber)
    } else {
        (search_pattern(span), PatternKind::SearchPattern)
    };

    let (kind, fields) = parse_extension_fields(trailer);

    Some(Tag {
        name: name.to_string(),
        file_path: file_path.to_string(),
        pattern,
        pattern_kind,
        kind,
        fields,
    })
}

/// Split `address;"<TAB>fields` where the ex command ends.
///
/// A search pattern ends at its unescaped closing delimiter, so `;"` inside
/// the pattern or inside a later field is never taken for the terminator.
fn split_address(remainder: &str) -> (&str, &str) {
    let closing = match remainder.chars().next() {
        Some(delim @ ('/' | '?')) => closing_delimiter(remainder, delim),
        _ => None,
    };
    let (address, rest) = match closing {
        Some(end) => remainder.split_at(end + 1),
        None => match remainder.find(EX_TERMINATOR) {
            Some(pos) => remainder.split_at(pos),
            None => (remainder, ""),
        },
    };
    (address, rest.strip_prefix(EX_TERMINATOR).unwrap_or(rest))
}

/// Byte offset of the `delim` closing a pattern that opens at offset 0.
fn closing_delimiter(address: &str, delim: char) -> Option<usize> {
    let mut chars = address.char_indices().skip(1);
    while let Some((i, c)) = chars.next() {
        if c == '\\' {
            chars.next();
        } else if c == delim {
            return Some(i);
        }
    }
    None
}

/// Turn `/^void foo() {$/` into an escaped literal regex.
fn search_pattern(span: &str) -> String {
    let delim = match span.chars().next() {
        Some(c @ ('/' | '?')) => c,
        _ => return escape_regex(&unescape_ctags(span)),
    };
    let body = &span[1..];
    let body = body.strip_prefix('^').unwrap_or(body);
    let body = body.strip_suffix(delim).unwrap_or(body);
    let body = body.strip_suffix('$').unwrap_or(body);
    escape_regex(&unescape_ctags(body))
}

/// ctags writes a literal `/` as `\/` and `\` as `\\` inside patterns.
fn unescape_ctags(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\'
            && let Some(&next) = chars.peek()
            && matches!(next, '/' | '\\' | '?')
        {
            out.push(next);
            chars.next();
            continue;
        }
        out.push(c);
    }
    out
}

fn parse_extension_fields(trailer: &str) -> (Option<String>, Vec<(String, String)>) {
    let mut kind = None;
    let mut fields = Vec::new();
    for field in trailer.split('\t').filter(|f| !f.is_empty()) {
        match field.split_once(':') {
            Some(("kind", value)) => kind = Some(value.to_string()),
            Some((key, value)) => fields.push((key.to_string(), value.to_string())),
            None if kind.is_none() => kind = Some(field.to_string()),
            None => {}
        }
    }
    (kind, fields)
}
