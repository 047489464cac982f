//! Directory-backed archive store.
//!
//! Layout under the root:
//!
//! ```text
//! <vault>/uploads/<session>/session.json
//! <vault>/uploads/<session>/part-<start, zero padded>
//! <vault>/archives/<archive id>
//! <vault>/archives/<archive id>.json
//! ```

use crate::vault::chunk::ContentRange;
use crate::vault::store::{ArchiveStore, CompletedArchive, StoreError};
use crate::vault::treehash::{self, TreeHash};
use crate::vault::util::now_rfc3339;
use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const MIB: u64 = 1024 * 1024;
const PART_PREFIX: &str = "part-";

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    vault: String,
    description: String,
    part_size: u64,
    created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveSidecar {
    pub archive_id: String,
    pub description: String,
    pub size: u64,
    pub tree_hash: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct LocalVaultStore {
    root: PathBuf,
}

fn new_id(seed: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(process::id().to_le_bytes());
    hasher.update(ID_COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    hex::encode(hasher.finalize())
}

fn validate_name(kind: &str, raw: &str) -> Result<(), StoreError> {
    let valid = !raw.is_empty()
        && raw.len() <= 255
        && raw != "."
        && raw != ".."
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::Rejected(format!("invalid {kind} `{raw}`")))
    }
}

fn write_atomic(dir: &Path, dest: &Path, data: &[u8]) -> Result<(), StoreError> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|err| err.error)?;
    Ok(())
}

fn part_file_name(start: u64) -> String {
    format!("{PART_PREFIX}{start:020}")
}

impl LocalVaultStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).with_context(|| format!("failed to create {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn upload_dir(&self, vault: &str, session_id: &str) -> Result<PathBuf, StoreError> {
        validate_name("vault", vault)?;
        validate_name("session id", session_id)?;
        Ok(self.root.join(vault).join("uploads").join(session_id))
    }

    pub fn archive_path(&self, vault: &str, archive_id: &str) -> PathBuf {
        self.root.join(vault).join("archives").join(archive_id)
    }

    fn load_session(&self, dir: &Path) -> Result<SessionRecord, StoreError> {
        let path = dir.join("session.json");
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::Rejected(format!(
                    "no multipart upload at {}",
                    dir.display()
                )));
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_str(&raw)
            .map_err(|err| StoreError::Protocol(format!("{}: {err}", path.display())))
    }

    /// Stored parts as `(start, path)`, ordered by start offset.
    fn stored_parts(&self, dir: &Path) -> Result<Vec<(u64, PathBuf)>, StoreError> {
        let mut parts = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(start) = name
                .to_str()
                .and_then(|n| n.strip_prefix(PART_PREFIX))
                .and_then(|n| n.parse::<u64>().ok())
            else {
                continue;
            };
            parts.push((start, entry.path()));
        }
        parts.sort();
        Ok(parts)
    }
}

impl ArchiveStore for LocalVaultStore {
    fn initiate_multipart(
        &self,
        vault: &str,
        description: &str,
        part_size: u64,
    ) -> Result<String, StoreError> {
        validate_name("vault", vault)?;
        if part_size < MIB || part_size % MIB != 0 || !(part_size / MIB).is_power_of_two() {
            return Err(StoreError::Rejected(format!(
                "part size {part_size} is not 1 MiB times a power of two"
            )));
        }

        let session_id = new_id(&format!("{vault}/{description}"));
        let dir = self.upload_dir(vault, &session_id)?;
        fs::create_dir_all(&dir)?;
        let record = SessionRecord {
            vault: vault.to_string(),
            description: description.to_string(),
            part_size,
            created_at: now_rfc3339(),
        };
        let data = serde_json::to_vec_pretty(&record)
            .map_err(|err| StoreError::Protocol(err.to_string()))?;
        write_atomic(&dir, &dir.join("session.json"), &data)?;
        tracing::debug!(vault, session_id = %session_id, "local multipart upload initiated");
        Ok(session_id)
    }

    fn upload_part(
        &self,
        vault: &str,
        session_id: &str,
        range: &ContentRange,
        checksum: &TreeHash,
        body: Bytes,
    ) -> Result<TreeHash, StoreError> {
        let dir = self.upload_dir(vault, session_id)?;
        let session = self.load_session(&dir)?;

        if range.start % session.part_size != 0 {
            return Err(StoreError::Rejected(format!(
                "range {range} is not aligned to part size {}",
                session.part_size
            )));
        }
        if range.len() != body.len() as u64 || range.len() > session.part_size {
            return Err(StoreError::Rejected(format!(
                "range {range} does not match a body of {} bytes",
                body.len()
            )));
        }
        let actual = treehash::tree_hash(&body);
        if actual != *checksum {
            return Err(StoreError::ChecksumMismatch {
                expected: checksum.to_hex(),
                actual: actual.to_hex(),
            });
        }

        write_atomic(&dir, &dir.join(part_file_name(range.start)), &body)?;
        Ok(actual)
    }

    fn complete_multipart(
        &self,
        vault: &str,
        session_id: &str,
        checksum: &TreeHash,
        archive_size: u64,
    ) -> Result<CompletedArchive, StoreError> {
        let dir = self.upload_dir(vault, session_id)?;
        let session = self.load_session(&dir)?;
        let parts = self.stored_parts(&dir)?;

        let mut offset = 0u64;
        let mut digests = Vec::with_capacity(parts.len());
        for (index, (start, path)) in parts.iter().enumerate() {
            if *start != offset {
                return Err(StoreError::Rejected(format!(
                    "missing bytes {offset}-{} before part at {start}",
                    start.saturating_sub(1)
                )));
            }
            let (digest, len) = treehash::tree_hash_reader(File::open(path)?)?;
            let is_last = index + 1 == parts.len();
            if !is_last && len != session.part_size {
                return Err(StoreError::Rejected(format!(
                    "part at {start} has {len} bytes; only the last part may be short"
                )));
            }
            digests.push(digest);
            offset += len;
        }

        if offset != archive_size {
            return Err(StoreError::Rejected(format!(
                "archive size {archive_size} does not match {offset} uploaded bytes"
            )));
        }
        let actual = treehash::combine(&digests);
        if actual != *checksum {
            return Err(StoreError::ChecksumMismatch {
                expected: checksum.to_hex(),
                actual: actual.to_hex(),
            });
        }

        let archives = self.root.join(vault).join("archives");
        fs::create_dir_all(&archives)?;
        let archive_id = new_id(session_id);

        let mut assembled = tempfile::NamedTempFile::new_in(&archives)?;
        for (_, path) in &parts {
            io::copy(&mut File::open(path)?, &mut assembled)?;
        }
        assembled.as_file().sync_all()?;
        assembled
            .persist(self.archive_path(vault, &archive_id))
            .map_err(|err| err.error)?;

        let sidecar = ArchiveSidecar {
            archive_id: archive_id.clone(),
            description: session.description,
            size: archive_size,
            tree_hash: actual.to_hex(),
            created_at: now_rfc3339(),
        };
        let data = serde_json::to_vec_pretty(&sidecar)
            .map_err(|err| StoreError::Protocol(err.to_string()))?;
        write_atomic(
            &archives,
            &archives.join(format!("{archive_id}.json")),
            &data,
        )?;
        fs::remove_dir_all(&dir)?;

        Ok(CompletedArchive {
            location: format!("/{vault}/archives/{archive_id}"),
            archive_id,
        })
    }
}

/// Reads the sidecar written next to a completed archive.
#[cfg(test)]
pub fn read_sidecar(store_root: &Path, vault: &str, archive_id: &str) -> Result<ArchiveSidecar> {
    let path = store_root
        .join(vault)
        .join("archives")
        .join(format!("{archive_id}.json"));
    let raw =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}
