use anyhow::{Context, Result};
use std::io;

use crate::commands::{
    CommandReport, UploadTarget, bookmark_details, outcome_details, prepare_upload,
};
use crate::vault::coordinator::Coordinator;
use crate::vault::util::now_rfc3339;

#[derive(Debug, Clone)]
pub struct UploadStdinOptions {
    pub target: UploadTarget,
}

pub fn default_description(timestamp: &str) -> String {
    format!("Archive created on {timestamp}")
}

pub fn run(opts: &UploadStdinOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("upload-stdin");
    let mut prepared = prepare_upload(&opts.target)?;
    let description = opts
        .target
        .description
        .clone()
        .unwrap_or_else(|| default_description(&now_rfc3339()));

    tracing::info!(
        vault = %opts.target.vault,
        part_size = prepared.cfg.upload.part_size,
        backend = prepared.cfg.store.backend.as_str(),
        "uploading standard input"
    );
    let coordinator = Coordinator::new(
        prepared.store.as_ref(),
        prepared.cfg.upload.part_size as usize,
    );
    let outcome = coordinator
        .upload(
            io::stdin().lock(),
            &opts.target.vault,
            &description,
            prepared.ledger.as_mut(),
        )
        .with_context(|| match &opts.target.bookmark {
            Some(name) => {
                format!("upload from stdin failed; rerun with --bookmark {name} to resume")
            }
            None => "upload from stdin failed".to_string(),
        })?;

    report.detail(format!("description={description}"));
    bookmark_details(&mut report, prepared.ledger.as_ref());
    outcome_details(&mut report, &outcome);
    Ok(report)
}
