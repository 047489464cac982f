use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::commands::bookmark::BookmarkAction;
use crate::commands::tar_stream::TarStreamOptions;
use crate::commands::tree_hash::TreeHashOptions;
use crate::commands::upload_dir::UploadDirOptions;
use crate::commands::upload_stdin::UploadStdinOptions;
use crate::commands::{self, CommandReport, UploadTarget};
use crate::env_loader;
use crate::logging::{self, Verbosity};
use crate::vault::config::{ConfigOverrides, StoreBackend};
use crate::vault::util::parse_byte_size;

#[derive(Debug, Parser)]
#[command(
    name = "vaultpipe",
    version,
    about = "Stream directories into cold-storage vaults as resumable multipart uploads"
)]
struct Cli {
    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Log debug detail
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct StoreArgs {
    /// Part size, 1 MiB times a power of two (e.g. 128MiB)
    #[arg(long, value_parser = parse_size)]
    part_size: Option<u64>,
    #[arg(long)]
    region: Option<String>,
    /// Override the store endpoint URL
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long, value_enum)]
    backend: Option<StoreBackend>,
    /// Root directory of the local store backend
    #[arg(long)]
    store_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct UploadArgs {
    /// Target vault name
    #[arg(long)]
    vault: String,
    /// Archive description
    #[arg(long = "desc")]
    description: Option<String>,
    /// Resume bookmark; reuse it to continue an interrupted upload
    #[arg(long)]
    bookmark: Option<String>,
    #[command(flatten)]
    store: StoreArgs,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Archive a directory as tar.gz on the fly and upload it
    UploadDir {
        dir: PathBuf,
        #[command(flatten)]
        upload: UploadArgs,
    },
    /// Upload standard input as-is
    UploadStdin {
        #[command(flatten)]
        upload: UploadArgs,
    },
    /// Write the tar.gz stream of a directory to stdout
    TarStream { dir: PathBuf },
    /// Print the SHA-256 tree hash of a file or stdin
    TreeHash { file: Option<PathBuf> },
    /// Inspect or remove resume bookmarks
    Bookmark {
        #[command(subcommand)]
        action: BookmarkCommand,
    },
    /// Print the effective configuration
    Config {
        #[command(flatten)]
        store: StoreArgs,
    },
}

#[derive(Debug, Subcommand)]
enum BookmarkCommand {
    List,
    Show { name: String },
    Discard { name: String },
}

fn parse_size(raw: &str) -> Result<u64, String> {
    parse_byte_size(raw).map_err(|err| err.to_string())
}

fn overrides(store: StoreArgs, quiet: bool) -> ConfigOverrides {
    ConfigOverrides {
        part_size: store.part_size,
        backend: store.backend,
        region: store.region,
        endpoint: store.endpoint,
        store_dir: store.store_dir,
        verbose: quiet.then_some(false),
    }
}

fn target(upload: UploadArgs, quiet: bool) -> UploadTarget {
    UploadTarget {
        vault: upload.vault,
        description: upload.description,
        bookmark: upload.bookmark,
        overrides: overrides(upload.store, quiet),
    }
}

fn render(report: &CommandReport, details_to_stderr: bool) {
    for line in &report.details {
        if details_to_stderr {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }
    for issue in &report.issues {
        eprintln!("issue: {issue}");
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init(Verbosity::from_flags(cli.quiet, cli.verbose));
    for key in env_loader::unknown_env_keys() {
        tracing::warn!(key = %key, "ignoring unknown VAULTPIPE_ variable");
    }

    let quiet = cli.quiet;
    let mut details_to_stderr = false;
    let report = match cli.command {
        Command::UploadDir { dir, upload } => commands::upload_dir::run(&UploadDirOptions {
            dir,
            target: target(upload, quiet),
        })?,
        Command::UploadStdin { upload } => commands::upload_stdin::run(&UploadStdinOptions {
            target: target(upload, quiet),
        })?,
        Command::TarStream { dir } => {
            details_to_stderr = true;
            commands::tar_stream::run(&TarStreamOptions {
                dir,
                verbose: !quiet,
            })?
        }
        Command::TreeHash { file } => commands::tree_hash::run(&TreeHashOptions { file })?,
        Command::Bookmark { action } => commands::bookmark::run(&match action {
            BookmarkCommand::List => BookmarkAction::List,
            BookmarkCommand::Show { name } => BookmarkAction::Show { name },
            BookmarkCommand::Discard { name } => BookmarkAction::Discard { name },
        })?,
        Command::Config { store } => commands::show_config::run(&overrides(store, quiet))?,
    };

    render(&report, details_to_stderr);
    if !report.ok {
        anyhow::bail!("{} reported {} issue(s)", report.command, report.issues.len());
    }
    Ok(())
}
