//! Locate a tag's definition line inside file text.

use regex::Regex;

use super::index::{PatternKind, Tag};

/// 0-based line of `tag` inside `text`, or `None` when it cannot be found.
pub fn resolve(text: &str, tag: &Tag) -> Option<usize> {
    match tag.pattern_kind {
        PatternKind::LineNumber => line_from_number(&tag.pattern),
        PatternKind::SearchPattern => find_line(text, &tag.pattern),
    }
}

/// ctags line numbers are 1-based; `0` is kept as the first line.
pub fn line_from_number(raw: &str) -> Option<usize> {
    let n: i64 = raw.trim().parse().ok()?;
    match n {
        0 => Some(0),
        n if n > 0 => usize::try_from(n - 1).ok(),
        _ => None,
    }
}

/// Index of the first line of `text` matched by `pattern`.
pub fn find_line(text: &str, pattern: &str) -> Option<usize> {
    let re = match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => {
            tracing::debug!(pattern, error = %e, "tag pattern is not a valid regex");
            return None;
        }
    };
    text.split('\n').position(|line| re.is_match(line))
}
