use crate::error::VaultpipeError;
use crate::vault::chunk::ContentRange;
use crate::vault::treehash::TreeHash;
use crate::vault::util::{now_epoch_secs, sanitize_slug};
use crate::vault::warn::{self, WarnEvent};
use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

pub const LEDGER_SCHEMA_VERSION: u32 = 1;
const BOOKMARK_SUFFIX: &str = ".bookmark.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerRecord {
    pub schema_version: u32,
    pub vault: Option<String>,
    pub part_size: Option<u64>,
    pub session_id: Option<String>,
    pub confirmed: BTreeMap<String, String>,
    pub updated_at_epoch_secs: u64,
}

impl Default for LedgerRecord {
    fn default() -> Self {
        Self {
            schema_version: LEDGER_SCHEMA_VERSION,
            vault: None,
            part_size: None,
            session_id: None,
            confirmed: BTreeMap::new(),
            updated_at_epoch_secs: 0,
        }
    }
}

/// How the backing record looked when the ledger was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Missing,
    Loaded,
    Discarded(String),
}

/// Durable map from confirmed content ranges to their tree hashes, plus
/// the remote session id. Holds an exclusive lock on `<slug>.lock` for as
/// long as it is alive; the lock file is removed on drop once no record
/// is left behind.
#[derive(Debug)]
pub struct ResumeLedger {
    name: String,
    path: PathBuf,
    record: LedgerRecord,
    load_state: LoadState,
    lock_path: PathBuf,
    _lock: File,
}

pub fn bookmark_slug(name: &str) -> Result<String> {
    let slug = sanitize_slug(name);
    if slug.is_empty() {
        return Err(VaultpipeError::InvalidConfig(format!(
            "bookmark name `{name}` has no usable characters"
        ))
        .into());
    }
    Ok(slug)
}

pub fn bookmark_path(dir: &Path, name: &str) -> Result<PathBuf> {
    Ok(dir.join(format!("{}{BOOKMARK_SUFFIX}", bookmark_slug(name)?)))
}

fn emit_ledger_warning(code: &str, action: &str, bookmark: &str, reason: &str, err: &str) {
    warn::emit(WarnEvent {
        code,
        stage: "ledger",
        action,
        bookmark,
        range: "na",
        reason,
        err,
    });
}

fn read_record(path: &Path, name: &str) -> (LedgerRecord, LoadState) {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return (LedgerRecord::default(), LoadState::Missing);
        }
        Err(err) => {
            emit_ledger_warning(
                "LEDGER_CORRUPT",
                "read",
                name,
                "unreadable bookmark; starting over",
                &err.to_string(),
            );
            return (LedgerRecord::default(), LoadState::Discarded(err.to_string()));
        }
    };

    match serde_json::from_str::<LedgerRecord>(&raw) {
        Ok(record) if record.schema_version == LEDGER_SCHEMA_VERSION => {
            (record, LoadState::Loaded)
        }
        Ok(record) => {
            let reason = format!("unsupported schema_version {}", record.schema_version);
            emit_ledger_warning("LEDGER_CORRUPT", "parse", name, &reason, "na");
            (LedgerRecord::default(), LoadState::Discarded(reason))
        }
        Err(err) => {
            emit_ledger_warning(
                "LEDGER_CORRUPT",
                "parse",
                name,
                "unparseable bookmark; starting over",
                &err.to_string(),
            );
            (LedgerRecord::default(), LoadState::Discarded(err.to_string()))
        }
    }
}

fn is_lock_contended(err: &io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn acquire_lock(lock_path: &Path, name: &str) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(lock_path)
        .with_context(|| format!("failed to open {}", lock_path.display()))?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(err) if is_lock_contended(&err) => {
            Err(VaultpipeError::BookmarkLocked(name.to_string()).into())
        }
        Err(err) => Err(err).with_context(|| format!("failed to lock {}", lock_path.display())),
    }
}

impl ResumeLedger {
    /// Opens (or starts) the bookmark `name` under `dir`. A missing record
    /// is not an error; an unreadable one is reported and replaced.
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let slug = bookmark_slug(name)?;
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let lock_path = dir.join(format!("{slug}.lock"));
        let lock = acquire_lock(&lock_path, name)?;

        let path = dir.join(format!("{slug}{BOOKMARK_SUFFIX}"));
        let (record, load_state) = read_record(&path, name);
        tracing::debug!(
            bookmark = name,
            path = %path.display(),
            confirmed = record.confirmed.len(),
            "opened resume ledger"
        );

        Ok(Self {
            name: name.to_string(),
            path,
            record,
            load_state,
            lock_path,
            _lock: lock,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_state(&self) -> &LoadState {
        &self.load_state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.record.session_id.as_deref()
    }

    pub fn set_session_id(&mut self, id: &str) -> Result<()> {
        self.record.session_id = Some(id.to_string());
        self.save()
    }

    /// Ties the record to one vault and part size. A record written for a
    /// different target cannot be resumed, so it is reset.
    pub fn bind(&mut self, vault: &str, part_size: u64) {
        let vault_differs = self.record.vault.as_deref().is_some_and(|v| v != vault);
        let size_differs = self.record.part_size.is_some_and(|p| p != part_size);
        if vault_differs || size_differs {
            let reason = format!(
                "bookmark was for vault {} with part size {}",
                self.record.vault.as_deref().unwrap_or("-"),
                self.record.part_size.unwrap_or(0)
            );
            emit_ledger_warning("LEDGER_RESET", "bind", &self.name, &reason, "na");
            self.record = LedgerRecord::default();
        }
        self.record.vault = Some(vault.to_string());
        self.record.part_size = Some(part_size);
    }

    /// True only when `range` was confirmed with exactly `checksum`.
    pub fn previously_confirmed(&self, range: &ContentRange, checksum: &TreeHash) -> bool {
        let key = range.ledger_key();
        let Some(stored) = self.record.confirmed.get(&key) else {
            return false;
        };
        if stored.eq_ignore_ascii_case(&checksum.to_hex()) {
            return true;
        }

        warn::emit(WarnEvent {
            code: "LEDGER_CHECKSUM_MISMATCH",
            stage: "resume",
            action: "reupload",
            bookmark: &self.name,
            range: &key,
            reason: "stream content differs from the previous run",
            err: stored,
        });
        false
    }

    pub fn record_confirmed(&mut self, range: &ContentRange, checksum: &TreeHash) -> Result<()> {
        self.record
            .confirmed
            .insert(range.ledger_key(), checksum.to_hex());
        self.save()
    }

    pub fn confirmed_count(&self) -> usize {
        self.record.confirmed.len()
    }

    fn save(&mut self) -> Result<()> {
        self.record.updated_at_epoch_secs = now_epoch_secs()?;
        let data = serde_json::to_string_pretty(&self.record)?;
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to stage bookmark in {}", dir.display()))?;
        tmp.write_all(data.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|err| err.error)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    /// Removes the backing record. Discarding an absent record is a no-op.
    pub fn discard(&mut self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to remove {}", self.path.display()));
            }
        }
        self.record = LedgerRecord::default();
        Ok(())
    }
}

impl Drop for ResumeLedger {
    fn drop(&mut self) {
        if !self.path.exists() {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

#[derive(Debug, Clone)]
pub struct BookmarkSummary {
    pub name: String,
    pub record: Option<LedgerRecord>,
    pub error: Option<String>,
}

/// Enumerates bookmark records in `dir`, sorted by name. Unparseable
/// records are listed with their error instead of failing the listing.
pub fn list_bookmarks(dir: &Path) -> Result<Vec<BookmarkSummary>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", dir.display())),
    };

    let mut out = Vec::new();
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name
            .to_str()
            .and_then(|n| n.strip_suffix(BOOKMARK_SUFFIX))
        else {
            continue;
        };
        let parsed = fs::read_to_string(entry.path())
            .map_err(|err| err.to_string())
            .and_then(|raw| {
                serde_json::from_str::<LedgerRecord>(&raw).map_err(|err| err.to_string())
            });
        let (record, error) = match parsed {
            Ok(record) => (Some(record), None),
            Err(err) => (None, Some(err)),
        };
        out.push(BookmarkSummary {
            name: name.to_string(),
            record,
            error,
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// Reads a bookmark without locking it. `None` when it does not exist.
pub fn inspect_bookmark(dir: &Path, name: &str) -> Result<Option<LedgerRecord>> {
    let path = bookmark_path(dir, name)?;
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };
    let record = serde_json::from_str::<LedgerRecord>(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(record))
}
