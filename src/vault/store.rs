use crate::vault::chunk::ContentRange;
use crate::vault::config::{StoreBackend, StoreConfig};
use crate::vault::glacier::GlacierStore;
use crate::vault::local_store::LocalVaultStore;
use crate::vault::treehash::TreeHash;
use anyhow::Result;
use bytes::Bytes;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("store refused the request: {0}")]
    Service(String),
    #[error("store credentials rejected: {0}")]
    Credentials(String),
    #[error("store did not answer within {0} seconds")]
    Timeout(u64),
    #[error("unexpected store response: {0}")]
    Protocol(String),
    #[error("store i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("checksum mismatch: expected {expected}, store computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("request rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedArchive {
    pub archive_id: String,
    pub location: String,
}

/// Remote side of a multipart archive upload.
pub trait ArchiveStore {
    fn initiate_multipart(
        &self,
        vault: &str,
        description: &str,
        part_size: u64,
    ) -> Result<String, StoreError>;

    /// Uploads one part and returns the tree hash the store computed for it.
    /// The body is handed over so backends can send it without copying.
    fn upload_part(
        &self,
        vault: &str,
        session_id: &str,
        range: &ContentRange,
        checksum: &TreeHash,
        body: Bytes,
    ) -> Result<TreeHash, StoreError>;

    fn complete_multipart(
        &self,
        vault: &str,
        session_id: &str,
        checksum: &TreeHash,
        archive_size: u64,
    ) -> Result<CompletedArchive, StoreError>;
}

pub fn open_store(cfg: &StoreConfig) -> Result<Box<dyn ArchiveStore>> {
    match cfg.backend {
        StoreBackend::Glacier => Ok(Box::new(GlacierStore::open(cfg)?)),
        StoreBackend::Local => {
            let Some(root) = cfg.local_root.as_deref() else {
                anyhow::bail!("local backend requires a store directory");
            };
            Ok(Box::new(LocalVaultStore::open(root)?))
        }
    }
}
