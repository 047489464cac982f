use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::commands::{
    CommandReport, UploadTarget, bookmark_details, outcome_details, prepare_upload,
};
use crate::vault::pipeline::{PipelineOptions, upload_directory};
use crate::vault::util::now_rfc3339;

#[derive(Debug, Clone)]
pub struct UploadDirOptions {
    pub dir: PathBuf,
    pub target: UploadTarget,
}

fn encode_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~' | b'/') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

pub fn default_description(dir: &Path, timestamp: &str) -> String {
    let absolute = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    format!("Archive of {}, {timestamp}", encode_path(&absolute))
}

pub fn run(opts: &UploadDirOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("upload-dir");
    if !opts.dir.is_dir() {
        report.issue(format!("{} is not a directory", opts.dir.display()));
        return Ok(report);
    }

    let mut prepared = prepare_upload(&opts.target)?;
    let description = opts
        .target
        .description
        .clone()
        .unwrap_or_else(|| default_description(&opts.dir, &now_rfc3339()));
    let upload = &prepared.cfg.upload;
    let pipeline = PipelineOptions {
        part_size: upload.part_size as usize,
        block_size: upload.pipe_block_size,
        depth: upload.pipe_depth,
        verbose: upload.verbose,
    };

    tracing::info!(
        dir = %opts.dir.display(),
        vault = %opts.target.vault,
        part_size = upload.part_size,
        backend = prepared.cfg.store.backend.as_str(),
        "uploading directory"
    );
    let (outcome, summary) = upload_directory(
        prepared.store.as_ref(),
        &opts.dir,
        &opts.target.vault,
        &description,
        prepared.ledger.as_mut(),
        &pipeline,
    )
    .with_context(|| match &opts.target.bookmark {
        Some(name) => format!(
            "upload of {} failed; rerun with --bookmark {name} to resume",
            opts.dir.display()
        ),
        None => format!("upload of {} failed", opts.dir.display()),
    })?;

    report.detail(format!("description={description}"));
    bookmark_details(&mut report, prepared.ledger.as_ref());
    outcome_details(&mut report, &outcome);
    report.detail(format!(
        "entries={} files={} dirs={} skipped={} unreadable_dirs={}",
        summary.entries, summary.files, summary.dirs, summary.skipped, summary.unreadable_dirs
    ));
    if summary.unreadable_dirs > 0 {
        report.detail(format!(
            "warning: {} directories could not be listed and were archived empty",
            summary.unreadable_dirs
        ));
    }
    Ok(report)
}
