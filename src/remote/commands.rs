//! Remote shell command lines.
//!
//! Every command the session runs on the remote host is built here. Paths may
//! come from a tags file, so each one is quoted with `shell_words::quote`
//! before interpolation; nothing else in the crate formats shell text.

use chrono::DateTime;
use shell_words::quote;

/// Base name of the session's remote scratch files, relative to the home dir.
pub const REMOTE_TEMP_NAME: &str = ".ctagssh.temp";

/// `<home>/.ctagssh.temp`
pub fn remote_temp_base(remote_home: &str) -> String {
    format!("{}/{}", remote_home.trim_end_matches('/'), REMOTE_TEMP_NAME)
}

/// Write the `Modify:` line of `stat <path>` into `output`.
pub fn stat_modify_command(path: &str, output: &str) -> String {
    format!("stat {} | grep Modify > {}", quote(path), quote(output))
}

/// Compress `source` into `output` without touching `source`.
pub fn gzip_command(source: &str, output: &str) -> String {
    format!("gzip -c {} > {}", quote(source), quote(output))
}

/// Parse GNU/BusyBox `stat` output (`Modify: 2024-03-01 10:22:33.123456789 +0200`)
/// into epoch seconds.
pub fn parse_modify_line(output: &str) -> Option<i64> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("Modify:"))?;
    let stamp = line.trim_start_matches("Modify:").trim();
    DateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S%.f %z")
        .ok()
        .map(|dt| dt.timestamp())
}
