use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultpipeError {
    #[error("config invalid: {0}")]
    InvalidConfig(String),
    #[error("bookmark `{0}` is in use by another vaultpipe process")]
    BookmarkLocked(String),
    #[error("credentials missing: {0}")]
    MissingCredentials(String),
    #[error("archive producer failed: {0}")]
    ProducerFailed(String),
}
