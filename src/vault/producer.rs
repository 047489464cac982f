use crate::vault::transport::PipeWriter;
use crate::vault::warn::{self, WarnEvent};
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy)]
pub struct ProducerOptions {
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerSummary {
    pub entries: u64,
    pub files: u64,
    pub dirs: u64,
    pub skipped: u64,
    pub unreadable_dirs: u64,
    pub bytes: u64,
}

/// Name under which the root itself appears in the archive.
pub fn archive_root_name(root: &Path) -> PathBuf {
    root.canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(PathBuf::from))
        .or_else(|| root.file_name().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("archive"))
}

/// Child names of `dir` in byte order. A directory that cannot be listed
/// contributes no children.
fn sorted_children(dir: &Path, entry_name: &Path) -> Option<Vec<OsString>> {
    let listed = fs::read_dir(dir).and_then(|entries| {
        entries
            .map(|entry| entry.map(|e| e.file_name()))
            .collect::<io::Result<Vec<_>>>()
    });
    match listed {
        Ok(mut names) => {
            names.sort();
            Some(names)
        }
        Err(err) => {
            let entry = entry_name.to_string_lossy();
            warn::emit(WarnEvent {
                code: "DIR_UNREADABLE",
                stage: "archive",
                action: "list-dir",
                bookmark: "na",
                range: &entry,
                reason: "directory archived without its contents",
                err: &err.to_string(),
            });
            None
        }
    }
}

#[cfg(unix)]
fn is_socket(file_type: &fs::FileType) -> bool {
    use std::os::unix::fs::FileTypeExt;
    file_type.is_socket()
}

#[cfg(not(unix))]
fn is_socket(_file_type: &fs::FileType) -> bool {
    false
}

fn log_entry(opts: &ProducerOptions, name: &Path) {
    if opts.verbose {
        tracing::info!(entry = %name.display(), "archived");
    } else {
        tracing::debug!(entry = %name.display(), "archived");
    }
}

/// Writes `root` as a gzip-compressed tar stream into `out`, depth first
/// with parents before children and siblings in sorted order. Returns the
/// summary and the underlying writer once the gzip trailer is written.
pub fn write_archive<W: Write>(
    root: &Path,
    out: W,
    opts: &ProducerOptions,
) -> Result<(ProducerSummary, W)> {
    fs::symlink_metadata(root)
        .with_context(|| format!("failed to stat archive root {}", root.display()))?;

    let encoder = GzEncoder::new(out, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut summary = ProducerSummary::default();
    let mut pending = vec![(root.to_path_buf(), archive_root_name(root))];

    while let Some((path, name)) = pending.pop() {
        let meta = fs::symlink_metadata(&path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let file_type = meta.file_type();

        if is_socket(&file_type) {
            let entry = name.to_string_lossy();
            warn::emit(WarnEvent {
                code: "SOCKET_SKIPPED",
                stage: "archive",
                action: "skip-entry",
                bookmark: "na",
                range: &entry,
                reason: "sockets have no tar representation",
                err: "na",
            });
            summary.skipped += 1;
            continue;
        }

        builder
            .append_path_with_name(&path, &name)
            .with_context(|| format!("failed to archive {}", path.display()))?;
        summary.entries += 1;
        log_entry(opts, &name);

        if file_type.is_dir() {
            summary.dirs += 1;
            match sorted_children(&path, &name) {
                Some(children) => {
                    for child in children.into_iter().rev() {
                        pending.push((path.join(&child), name.join(&child)));
                    }
                }
                None => summary.unreadable_dirs += 1,
            }
        } else if file_type.is_file() {
            summary.files += 1;
        }
    }

    let encoder = builder
        .into_inner()
        .context("failed to finish tar stream")?;
    let out = encoder.finish().context("failed to finish gzip stream")?;
    Ok((summary, out))
}

/// Runs [`write_archive`] on a dedicated thread feeding `writer`. The pipe
/// is finished only when the whole archive was written; on error it is
/// dropped so the reading side sees an aborted stream.
pub fn spawn_producer(
    root: PathBuf,
    writer: PipeWriter,
    opts: ProducerOptions,
) -> io::Result<JoinHandle<Result<ProducerSummary>>> {
    thread::Builder::new()
        .name("archive-producer".to_string())
        .spawn(move || {
            let (mut summary, writer) = write_archive(&root, writer, &opts)?;
            summary.bytes = writer
                .finish()
                .context("failed to close archive transport")?;
            tracing::debug!(
                entries = summary.entries,
                bytes = summary.bytes,
                "archive producer finished"
            );
            Ok(summary)
        })
}
