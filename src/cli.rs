use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;

use crate::config::CtagsshConfig;
use crate::navigator::{Lookup, Navigator, NavigatorSettings};
use crate::path_format::{CollapseMode, collapse_path, format_bytes};
use crate::remote::{SessionManager, Ssh2Connector};
use crate::tags::{PatternKind, Tag, TagIndex};

/// Widest file column in tag listings.
const FILE_COLUMN: usize = 60;

#[derive(Parser, Debug)]
#[command(name = "ctagssh")]
#[command(about = "Jump to ctags definitions in files that live on a remote host over SSH")]
#[command(version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: <config dir>/ctagssh/config.toml)
    #[arg(long, global = true, env = "CTAGSSH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Local tags file, overriding the config
    #[arg(long, global = true)]
    pub tags_file: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the tags named SYMBOL in the local tags file
    Lookup(LookupArgs),

    /// Resolve SYMBOL on the remote host and print its definition line
    Goto(GotoArgs),

    /// Print a remote file through the cache
    Cat(CatArgs),

    /// List tags files in the remote tags directory
    ListTags,

    /// Download a tags file from the remote tags directory over the local one
    FetchTags(FetchTagsArgs),
}

#[derive(Args, Debug)]
pub struct LookupArgs {
    pub symbol: String,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct GotoArgs {
    pub symbol: String,

    /// Candidate to use when SYMBOL is ambiguous (1-based)
    #[arg(long)]
    pub pick: Option<usize>,
}

#[derive(Args, Debug)]
pub struct CatArgs {
    pub remote_path: String,
}

#[derive(Args, Debug)]
pub struct FetchTagsArgs {
    /// File name inside `ctags_files_remote_path`
    pub file_name: String,
}

#[derive(Serialize)]
struct TagRecord<'a> {
    name: &'a str,
    file: &'a str,
    kind: Option<&'a str>,
    pattern: &'a str,
    line_number: bool,
}

impl<'a> From<&'a Tag> for TagRecord<'a> {
    fn from(tag: &'a Tag) -> Self {
        Self {
            name: &tag.name,
            file: &tag.file_path,
            kind: tag.kind.as_deref(),
            pattern: &tag.pattern,
            line_number: tag.pattern_kind == PatternKind::LineNumber,
        }
    }
}

pub async fn execute(cli: Cli) -> Result<()> {
    if cli.no_color {
        colored::control::set_override(false);
    }
    let config = CtagsshConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let tags_path = cli
        .tags_file
        .clone()
        .unwrap_or_else(|| config.tags_file.clone());

    match cli.command {
        Commands::Lookup(args) => lookup(&config, &tags_path, &args),
        Commands::Goto(args) => goto(&config, &tags_path, &args).await,
        Commands::Cat(args) => cat(&config, &args).await,
        Commands::ListTags => list_tags(&config).await,
        Commands::FetchTags(args) => fetch_tags(&config, &tags_path, &args).await,
    }
}

fn offline_navigator(config: &CtagsshConfig, tags_path: &Path) -> Result<Navigator> {
    let index = TagIndex::load(tags_path).context("loading tags")?;
    Ok(Navigator::new(
        index,
        SessionManager::new(Arc::new(Ssh2Connector)),
        NavigatorSettings::from_config(config),
    ))
}

async fn connected_navigator(config: &CtagsshConfig, index: TagIndex) -> Result<Navigator> {
    let connection = config.connection()?;
    let session = SessionManager::new(Arc::new(Ssh2Connector));
    session
        .connect(connection)
        .await
        .with_context(|| format!("connecting to {}", config.host))?;
    Ok(Navigator::new(
        index,
        session,
        NavigatorSettings::from_config(config),
    ))
}

fn lookup(config: &CtagsshConfig, tags_path: &Path, args: &LookupArgs) -> Result<()> {
    let nav = offline_navigator(config, tags_path)?;
    let tags = match nav.candidates(&args.symbol) {
        Lookup::Missing => bail!("no tag named `{}`", args.symbol),
        Lookup::Single(tag) => vec![tag],
        Lookup::Ambiguous(tags) => tags,
    };

    if args.json {
        let records: Vec<TagRecord<'_>> = tags.iter().map(TagRecord::from).collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    print_tags(&tags);
    Ok(())
}

fn print_tags(tags: &[Tag]) {
    for (i, tag) in tags.iter().enumerate() {
        let address = match tag.pattern_kind {
            PatternKind::LineNumber => format!("line {}", tag.pattern),
            PatternKind::SearchPattern => tag.pattern.clone(),
        };
        println!(
            "{:>3}  {}  {}  {}  {}",
            (i + 1).to_string().dimmed(),
            tag.name.bold(),
            collapse_path(&tag.file_path, FILE_COLUMN, CollapseMode::Left),
            tag.kind.as_deref().unwrap_or("-").cyan(),
            address.dimmed(),
        );
    }
}

async fn goto(config: &CtagsshConfig, tags_path: &Path, args: &GotoArgs) -> Result<()> {
    let index = TagIndex::load(tags_path).context("loading tags")?;
    let mut nav = connected_navigator(config, index).await?;

    let tag = match nav.candidates(&args.symbol) {
        Lookup::Missing => bail!("no tag named `{}`", args.symbol),
        Lookup::Single(tag) => tag,
        Lookup::Ambiguous(tags) => match args.pick {
            Some(n) if (1..=tags.len()).contains(&n) => tags[n - 1].clone(),
            Some(n) => bail!("--pick {} is out of range (1-{})", n, tags.len()),
            None => {
                print_tags(&tags);
                bail!(
                    "`{}` has {} definitions; choose one with --pick N",
                    args.symbol,
                    tags.len()
                );
            }
        },
    };

    let result = nav.open(&tag, None).await;
    nav.session().disconnect().await;
    let location = result?;
    println!("{}:{}", location.uri.green(), location.line + 1);
    println!("{}", location.text);
    Ok(())
}

async fn cat(config: &CtagsshConfig, args: &CatArgs) -> Result<()> {
    let nav = connected_navigator(config, TagIndex::default()).await?;
    let cache = nav.cache();
    let result = cache.preload(&args.remote_path).await;
    let content = cache.content(&args.remote_path);
    nav.session().disconnect().await;

    result.with_context(|| format!("reading {}", args.remote_path))?;
    if let Some(content) = content {
        print!("{}", content);
    }
    Ok(())
}

async fn list_tags(config: &CtagsshConfig) -> Result<()> {
    let nav = connected_navigator(config, TagIndex::default()).await?;
    let result = nav.list_remote_tag_files().await;
    nav.session().disconnect().await;

    for entry in result? {
        let modified = chrono::DateTime::from_timestamp(entry.mtime, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<40}  {}  {:>10}",
            entry.filename.bold(),
            modified.dimmed(),
            format_bytes(entry.size)
        );
    }
    Ok(())
}

async fn fetch_tags(config: &CtagsshConfig, tags_path: &Path, args: &FetchTagsArgs) -> Result<()> {
    let mut nav = connected_navigator(config, TagIndex::default()).await?;
    let result = nav.refresh_tags(&args.file_name, tags_path).await;
    nav.session().disconnect().await;

    let report = result.with_context(|| format!("fetching {}", args.file_name))?;
    for cleanup in &report.cleanup_errors {
        eprintln!("{} {}", "warning:".yellow(), cleanup);
    }
    println!(
        "{} {} ({} transferred, {} tags, {} ms)",
        "installed".green(),
        report.local_path.display(),
        format_bytes(report.compressed_bytes),
        nav.index().len(),
        report.duration_ms
    );
    Ok(())
}
