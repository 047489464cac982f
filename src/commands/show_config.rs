use anyhow::Result;

use crate::commands::CommandReport;
use crate::vault::config::{ConfigOverrides, load_config};
use crate::vault::paths::resolve_paths;

pub fn run(overrides: &ConfigOverrides) -> Result<CommandReport> {
    let paths = resolve_paths()?;
    let mut report = CommandReport::new("config");

    report.detail(format!("home={}", paths.home.display()));
    report.detail(format!("bookmarks_dir={}", paths.bookmarks_dir.display()));
    report.detail(format!(
        "config_file={}{}",
        paths.config_file.display(),
        if paths.config_file.exists() {
            ""
        } else {
            " (absent)"
        }
    ));

    let cfg = match load_config(&paths, overrides) {
        Ok(cfg) => cfg,
        Err(err) => {
            report.issue(format!("{err:#}"));
            return Ok(report);
        }
    };

    report.detail(format!("upload.part_size={}", cfg.upload.part_size));
    report.detail(format!("upload.pipe_block_size={}", cfg.upload.pipe_block_size));
    report.detail(format!("upload.pipe_depth={}", cfg.upload.pipe_depth));
    report.detail(format!("upload.verbose={}", cfg.upload.verbose));
    report.detail(format!("store.backend={}", cfg.store.backend.as_str()));
    report.detail(format!("store.region={}", cfg.store.region));
    report.detail(format!(
        "store.endpoint={}",
        cfg.store.endpoint.as_deref().unwrap_or("-")
    ));
    report.detail(format!(
        "store.local_root={}",
        cfg.store
            .local_root
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string())
    ));
    report.detail(format!(
        "store.request_timeout_secs={}",
        cfg.store.request_timeout_secs
    ));
    report.detail(format!(
        "build=vaultpipe {} ({}, {})",
        env!("CARGO_PKG_VERSION"),
        env!("VAULTPIPE_BUILD_TARGET"),
        env!("VAULTPIPE_BUILD_PROFILE")
    ));
    Ok(report)
}
