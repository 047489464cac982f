use crate::error::VaultpipeError;
use crate::vault::chunk::ContentRange;
use crate::vault::config::StoreConfig;
use crate::vault::store::{ArchiveStore, CompletedArchive, StoreError};
use crate::vault::treehash::TreeHash;
use anyhow::{Context, Result};
use bytes::Bytes;
use rusoto_core::credential::{EnvironmentProvider, ProvideAwsCredentials, StaticProvider};
use rusoto_core::{HttpClient, Region, RusotoError};
use rusoto_glacier::{
    CompleteMultipartUploadInput, Glacier, GlacierClient, InitiateMultipartUploadInput,
    UploadMultipartPartInput,
};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

/// `-` selects the account that owns the signing credentials.
const ACCOUNT_ID: &str = "-";
const MAX_DESCRIPTION_LEN: usize = 1024;

/// Keeps printable ASCII and percent-encodes every other byte, since the
/// service only accepts ASCII 32-126 in archive descriptions.
pub fn encode_description(desc: &str) -> String {
    let mut out = String::with_capacity(desc.len());
    for byte in desc.bytes() {
        if (0x20..=0x7e).contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out.truncate(MAX_DESCRIPTION_LEN);
    out
}

fn validate_vault_name(vault: &str) -> Result<(), StoreError> {
    let valid = !vault.is_empty()
        && vault.len() <= 255
        && vault
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::Rejected(format!(
            "vault name `{vault}` must be 1-255 characters of [A-Za-z0-9_.-]"
        )))
    }
}

/// Region to sign for. A configured endpoint replaces the regional one.
fn resolve_region(cfg: &StoreConfig) -> Result<Region> {
    match cfg.endpoint.as_deref() {
        Some(endpoint) => Ok(Region::Custom {
            name: cfg.region.clone(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }),
        None => cfg
            .region
            .parse::<Region>()
            .with_context(|| format!("unknown region `{}`", cfg.region)),
    }
}

fn store_error<E: fmt::Display>(err: RusotoError<E>) -> StoreError {
    match err {
        RusotoError::Service(inner) => StoreError::Service(inner.to_string()),
        RusotoError::HttpDispatch(inner) => StoreError::Transport(inner.to_string()),
        RusotoError::Credentials(inner) => StoreError::Credentials(inner.to_string()),
        RusotoError::Validation(message) => StoreError::Rejected(message),
        RusotoError::ParseError(message) => StoreError::Protocol(message),
        RusotoError::Unknown(resp) => StoreError::Service(format!(
            "HTTP {}: {}",
            resp.status,
            String::from_utf8_lossy(&resp.body).trim()
        )),
        RusotoError::Blocking => StoreError::Transport("blocking call failed".to_string()),
    }
}

fn missing(field: &str) -> StoreError {
    StoreError::Protocol(format!("response is missing `{field}`"))
}

/// Glacier multipart uploads over the rusoto client. The store API is
/// blocking, so each call runs to completion on a private runtime.
pub struct GlacierStore {
    client: GlacierClient,
    runtime: Runtime,
    timeout: Duration,
}

impl GlacierStore {
    /// Signs with `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and, when
    /// set, `AWS_SESSION_TOKEN`.
    pub fn open(cfg: &StoreConfig) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start the glacier runtime")?;
        let credentials = runtime
            .block_on(EnvironmentProvider::default().credentials())
            .map_err(|err| VaultpipeError::MissingCredentials(err.to_string()))?;
        let provider = StaticProvider::new(
            credentials.aws_access_key_id().to_string(),
            credentials.aws_secret_access_key().to_string(),
            credentials.token().clone(),
            None,
        );
        Self::with_provider(cfg, runtime, provider)
    }

    fn with_provider(
        cfg: &StoreConfig,
        runtime: Runtime,
        provider: StaticProvider,
    ) -> Result<Self> {
        let region = resolve_region(cfg)?;
        let dispatcher = HttpClient::new().context("failed to build glacier http client")?;
        let client = {
            let _guard = runtime.enter();
            GlacierClient::new_with(dispatcher, provider, region)
        };
        Ok(Self {
            client,
            runtime,
            timeout: Duration::from_secs(cfg.request_timeout_secs),
        })
    }

    fn call<F, T, E>(&self, request: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, RusotoError<E>>>,
        E: fmt::Display,
    {
        let timeout = self.timeout;
        self.runtime
            .block_on(async move { tokio::time::timeout(timeout, request).await })
            .map_err(|_| StoreError::Timeout(timeout.as_secs()))?
            .map_err(store_error)
    }
}

impl ArchiveStore for GlacierStore {
    fn initiate_multipart(
        &self,
        vault: &str,
        description: &str,
        part_size: u64,
    ) -> Result<String, StoreError> {
        validate_vault_name(vault)?;
        let output = self.call(self.client.initiate_multipart_upload(
            InitiateMultipartUploadInput {
                account_id: ACCOUNT_ID.to_string(),
                archive_description: Some(encode_description(description)),
                part_size: Some(part_size.to_string()),
                vault_name: vault.to_string(),
            },
        ))?;
        tracing::debug!(vault, location = ?output.location, "glacier session created");
        output
            .upload_id
            .ok_or_else(|| missing("x-amz-multipart-upload-id"))
    }

    fn upload_part(
        &self,
        vault: &str,
        session_id: &str,
        range: &ContentRange,
        checksum: &TreeHash,
        body: Bytes,
    ) -> Result<TreeHash, StoreError> {
        validate_vault_name(vault)?;
        let output = self.call(self.client.upload_multipart_part(UploadMultipartPartInput {
            account_id: ACCOUNT_ID.to_string(),
            body: Some(body),
            checksum: Some(checksum.to_hex()),
            range: Some(range.header_value()),
            upload_id: session_id.to_string(),
            vault_name: vault.to_string(),
        }))?;
        let echoed = output
            .checksum
            .ok_or_else(|| missing("x-amz-sha256-tree-hash"))?;
        TreeHash::from_hex(&echoed)
            .map_err(|err| StoreError::Protocol(format!("bad tree hash `{echoed}`: {err}")))
    }

    fn complete_multipart(
        &self,
        vault: &str,
        session_id: &str,
        checksum: &TreeHash,
        archive_size: u64,
    ) -> Result<CompletedArchive, StoreError> {
        validate_vault_name(vault)?;
        let output = self.call(self.client.complete_multipart_upload(
            CompleteMultipartUploadInput {
                account_id: ACCOUNT_ID.to_string(),
                archive_size: Some(archive_size.to_string()),
                checksum: Some(checksum.to_hex()),
                upload_id: session_id.to_string(),
                vault_name: vault.to_string(),
            },
        ))?;
        if let Some(echoed) = output.checksum.as_deref()
            && echoed != checksum.to_hex()
        {
            return Err(StoreError::ChecksumMismatch {
                expected: checksum.to_hex(),
                actual: echoed.to_string(),
            });
        }
        Ok(CompletedArchive {
            archive_id: output.archive_id.ok_or_else(|| missing("x-amz-archive-id"))?,
            location: output.location.ok_or_else(|| missing("location"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusoto_glacier::InitiateMultipartUploadError;

    fn local_cfg(endpoint: &str) -> StoreConfig {
        StoreConfig {
            endpoint: Some(endpoint.to_string()),
            request_timeout_secs: 5,
            ..StoreConfig::default()
        }
    }

    fn runtime() -> Runtime {
        Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime")
    }

    #[test]
    fn description_is_printable_ascii() {
        assert_eq!(encode_description("Archive of /data"), "Archive of /data");
        assert_eq!(encode_description("caf\u{e9}\n"), "caf%C3%A9%0A");
        assert_eq!(encode_description(&"x".repeat(2000)).len(), 1024);
    }

    #[test]
    fn vault_names_are_restricted() {
        assert!(validate_vault_name("photos-2012_v1.0").is_ok());
        assert!(validate_vault_name("").is_err());
        assert!(validate_vault_name("a/b").is_err());
        assert!(validate_vault_name(&"v".repeat(256)).is_err());
    }

    #[test]
    fn endpoint_overrides_the_regional_host() {
        let regional = resolve_region(&StoreConfig::default()).expect("region");
        assert_eq!(regional, Region::UsEast1);

        let custom = resolve_region(&local_cfg("http://127.0.0.1:9000/")).expect("region");
        assert_eq!(
            custom,
            Region::Custom {
                name: "us-east-1".to_string(),
                endpoint: "http://127.0.0.1:9000".to_string(),
            }
        );

        let bogus = StoreConfig {
            region: "mars-north-9".to_string(),
            ..StoreConfig::default()
        };
        assert!(resolve_region(&bogus).is_err());
    }

    #[test]
    fn service_errors_keep_the_message() {
        let err = store_error(RusotoError::Service(
            InitiateMultipartUploadError::ResourceNotFound("Vault not found".to_string()),
        ));
        assert!(matches!(err, StoreError::Service(ref m) if m == "Vault not found"));

        let err = store_error::<InitiateMultipartUploadError>(RusotoError::Validation(
            "bad range".to_string(),
        ));
        assert!(matches!(err, StoreError::Rejected(ref m) if m == "bad range"));
    }

    #[test]
    fn unreachable_endpoint_is_a_transport_failure() {
        let store = GlacierStore::with_provider(
            &local_cfg("http://127.0.0.1:1"),
            runtime(),
            StaticProvider::new_minimal("AKID".to_string(), "secret".to_string()),
        )
        .expect("store");

        let err = store
            .initiate_multipart("photos", "nightly", 1024 * 1024)
            .expect_err("nothing listens on port 1");
        assert!(
            matches!(err, StoreError::Transport(_) | StoreError::Timeout(_)),
            "{err:?}"
        );
        assert!(matches!(
            store.initiate_multipart("a/b", "", 1024 * 1024),
            Err(StoreError::Rejected(_))
        ));
    }
}
