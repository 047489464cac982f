use anyhow::{Context, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;

use crate::commands::CommandReport;
use crate::vault::treehash::tree_hash_reader;

#[derive(Debug, Clone)]
pub struct TreeHashOptions {
    pub file: Option<PathBuf>,
}

pub fn run(opts: &TreeHashOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("tree-hash");
    let (hash, bytes) = match &opts.file {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
            tree_hash_reader(file).with_context(|| format!("failed to read {}", path.display()))?
        }
        None => tree_hash_reader(io::stdin().lock()).context("failed to read stdin")?,
    };

    report.detail(format!("tree_hash={hash}"));
    report.detail(format!("bytes={bytes}"));
    Ok(report)
}
