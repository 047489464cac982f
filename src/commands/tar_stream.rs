use anyhow::{Context, Result};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use crate::commands::CommandReport;
use crate::vault::producer::{ProducerOptions, write_archive};

#[derive(Debug, Clone)]
pub struct TarStreamOptions {
    pub dir: PathBuf,
    pub verbose: bool,
}

/// Writes the archive stream to stdout; the report goes to stderr.
pub fn run(opts: &TarStreamOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("tar-stream");
    if !opts.dir.is_dir() {
        report.issue(format!("{} is not a directory", opts.dir.display()));
        return Ok(report);
    }

    let stdout = BufWriter::new(io::stdout().lock());
    let (summary, mut stdout) = write_archive(
        &opts.dir,
        stdout,
        &ProducerOptions {
            verbose: opts.verbose,
        },
    )?;
    stdout.flush().context("failed to flush stdout")?;

    report.detail(format!(
        "entries={} files={} dirs={} skipped={} unreadable_dirs={}",
        summary.entries, summary.files, summary.dirs, summary.skipped, summary.unreadable_dirs
    ));
    Ok(report)
}
