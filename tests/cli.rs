use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use tempfile::TempDir;

const TAGS: &str = "!_TAG_FILE_FORMAT\t2\t/extended format/\n\
foo\tsrc/foo.c\t/^void foo() {$/;\"\tf\n\
foo\tinclude/foo.h\t/^void foo();$/;\"\tp\n\
BUFSZ\tsrc/foo.h\t42;\"\td\n";

/// A scratch directory holding `config.toml` and a tags file.
fn workspace(extra_config: &str) -> TempDir {
    let dir = TempDir::new().unwrap();
    let tags = dir.path().join("project.tags");
    fs::write(&tags, TAGS).unwrap();
    let config = format!(
        "tags_file = {:?}\n{}",
        tags.to_string_lossy(),
        extra_config
    );
    fs::write(dir.path().join("config.toml"), config).unwrap();
    dir
}

fn base_cmd(dir: &TempDir) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("ctagssh");
    cmd.current_dir(dir.path())
        .arg("--config")
        .arg(dir.path().join("config.toml"))
        .arg("--no-color")
        .env("RUST_LOG", "warn");
    for var in [
        "CTAGSSH_CONFIG",
        "CTAGSSH_HOST",
        "CTAGSSH_PORT",
        "CTAGSSH_USERNAME",
        "CTAGSSH_PASSWORD",
        "CTAGSSH_IDENTITY_FILE",
        "CTAGSSH_TAGS_FILE",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn help_lists_subcommands() {
    cargo_bin_cmd!("ctagssh")
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("lookup"))
        .stdout(contains("goto"))
        .stdout(contains("fetch-tags"));
}

#[test]
fn lookup_single_tag() {
    let dir = workspace("");
    base_cmd(&dir)
        .args(["lookup", "BUFSZ"])
        .assert()
        .success()
        .stdout(contains("src/foo.h"))
        .stdout(contains("line 42"));
}

#[test]
fn lookup_lists_every_definition() {
    let dir = workspace("");
    base_cmd(&dir)
        .args(["lookup", "foo"])
        .assert()
        .success()
        .stdout(contains("src/foo.c"))
        .stdout(contains("include/foo.h"));
}

#[test]
fn lookup_respects_show_extensions() {
    let dir = workspace("show_extensions = \"h\"\n");
    base_cmd(&dir)
        .args(["lookup", "foo"])
        .assert()
        .success()
        .stdout(contains("include/foo.h"))
        .stdout(contains("src/foo.c").not());
}

#[test]
fn lookup_json_output() {
    let dir = workspace("");
    let output = base_cmd(&dir)
        .args(["lookup", "foo", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: Value = serde_json::from_slice(&output.stdout).unwrap();
    let records = json.as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["file"], "src/foo.c");
    assert_eq!(records[0]["kind"], "f");
    assert_eq!(records[0]["line_number"], false);
}

#[test]
fn lookup_pseudo_tags_are_hidden() {
    let dir = workspace("");
    base_cmd(&dir)
        .args(["lookup", "!_TAG_FILE_FORMAT"])
        .assert()
        .failure()
        .stderr(contains("no tag named"));
}

#[test]
fn lookup_missing_tags_file_fails() {
    let dir = workspace("");
    base_cmd(&dir)
        .args(["lookup", "foo", "--tags-file"])
        .arg(dir.path().join("absent.tags"))
        .assert()
        .failure()
        .stderr(contains("absent.tags"));
}

#[test]
fn goto_requires_host() {
    let dir = workspace("");
    base_cmd(&dir)
        .args(["goto", "BUFSZ"])
        .assert()
        .failure()
        .stderr(contains("host"));
}

#[test]
fn explicit_missing_config_fails() {
    let dir = TempDir::new().unwrap();
    cargo_bin_cmd!("ctagssh")
        .current_dir(dir.path())
        .env_remove("CTAGSSH_CONFIG")
        .args(["--config"])
        .arg(dir.path().join("nope.toml"))
        .args(["lookup", "foo"])
        .assert()
        .failure()
        .stderr(contains("nope.toml"));
}
