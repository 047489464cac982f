pub mod bookmark;
pub mod show_config;
pub mod tar_stream;
pub mod tree_hash;
pub mod upload_dir;
pub mod upload_stdin;

use anyhow::Result;
use serde::Serialize;

use crate::vault::config::{ConfigOverrides, VaultpipeConfig, load_config};
use crate::vault::coordinator::UploadOutcome;
use crate::vault::ledger::{LoadState, ResumeLedger};
use crate::vault::paths::{VaultpipePaths, resolve_paths};
use crate::vault::store::{ArchiveStore, open_store};
use crate::vault::util::format_gib;

#[derive(Debug, Clone, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub ok: bool,
    pub details: Vec<String>,
    pub issues: Vec<String>,
}

impl CommandReport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ok: true,
            details: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn detail(&mut self, text: impl Into<String>) {
        self.details.push(text.into());
    }

    pub fn issue(&mut self, text: impl Into<String>) {
        self.ok = false;
        self.issues.push(text.into());
    }
}

/// Options shared by the upload commands.
#[derive(Debug, Clone, Default)]
pub struct UploadTarget {
    pub vault: String,
    pub description: Option<String>,
    pub bookmark: Option<String>,
    pub overrides: ConfigOverrides,
}

pub(crate) struct PreparedUpload {
    pub cfg: VaultpipeConfig,
    pub store: Box<dyn ArchiveStore>,
    pub ledger: Option<ResumeLedger>,
}

pub(crate) fn prepare_upload(target: &UploadTarget) -> Result<PreparedUpload> {
    let paths: VaultpipePaths = resolve_paths()?;
    let cfg = load_config(&paths, &target.overrides)?;
    let ledger = match target.bookmark.as_deref() {
        Some(name) => Some(ResumeLedger::open(&paths.bookmarks_dir, name)?),
        None => None,
    };
    let store = open_store(&cfg.store)?;
    Ok(PreparedUpload { cfg, store, ledger })
}

pub(crate) fn outcome_details(report: &mut CommandReport, outcome: &UploadOutcome) {
    report.detail(format!("archive_id={}", outcome.archive_id));
    report.detail(format!("location={}", outcome.location));
    report.detail(format!("session_id={}", outcome.session_id));
    report.detail(format!("tree_hash={}", outcome.checksum));
    report.detail(format!(
        "total_bytes={} ({})",
        outcome.total_bytes,
        format_gib(outcome.total_bytes)
    ));
    report.detail(format!("parts_uploaded={}", outcome.parts_uploaded));
    report.detail(format!("parts_skipped={}", outcome.parts_skipped));
    report.detail(format!("resumed={}", outcome.resumed));
}

pub(crate) fn bookmark_details(report: &mut CommandReport, ledger: Option<&ResumeLedger>) {
    let Some(ledger) = ledger else {
        return;
    };
    let state = match ledger.load_state() {
        LoadState::Missing => "new".to_string(),
        LoadState::Loaded => "loaded".to_string(),
        LoadState::Discarded(reason) => format!("reset reason={reason}"),
    };
    report.detail(format!("bookmark={} state={state}", ledger.name()));
}
