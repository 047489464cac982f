use crate::error::VaultpipeError;
use crate::vault::coordinator::{Coordinator, UploadOutcome};
use crate::vault::ledger::ResumeLedger;
use crate::vault::producer::{ProducerOptions, ProducerSummary, spawn_producer};
use crate::vault::store::ArchiveStore;
use crate::vault::transport;
use anyhow::{Context, Result};
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub part_size: usize,
    pub block_size: usize,
    pub depth: usize,
    pub verbose: bool,
}

fn is_broken_pipe(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .is_some_and(|io_err| io_err.kind() == io::ErrorKind::BrokenPipe)
    })
}

/// Picks the error to report once both sides have stopped. A producer
/// failure explains a broken stream, unless the producer only failed
/// because the uploader had already gone away.
fn settle(
    produced: Result<ProducerSummary>,
    uploaded: Result<UploadOutcome>,
) -> Result<(UploadOutcome, ProducerSummary)> {
    match (produced, uploaded) {
        (Ok(summary), Ok(outcome)) => Ok((outcome, summary)),
        (Err(producer_err), _) if !is_broken_pipe(&producer_err) => {
            Err(producer_err.context("archive producer failed"))
        }
        (_, Err(upload_err)) => Err(upload_err),
        (Err(producer_err), Ok(_)) => Err(producer_err.context("archive producer failed")),
    }
}

/// Streams `root` as tar.gz through the bounded transport into the
/// coordinator. Both sides are joined before returning.
pub fn upload_directory(
    store: &dyn ArchiveStore,
    root: &Path,
    vault: &str,
    description: &str,
    ledger: Option<&mut ResumeLedger>,
    opts: &PipelineOptions,
) -> Result<(UploadOutcome, ProducerSummary)> {
    let (writer, reader) = transport::pipe(opts.block_size, opts.depth);
    let producer = spawn_producer(
        root.to_path_buf(),
        writer,
        ProducerOptions {
            verbose: opts.verbose,
        },
    )
    .context("failed to start archive producer")?;

    let uploaded =
        Coordinator::new(store, opts.part_size).upload(reader, vault, description, ledger);
    let produced = producer.join().unwrap_or_else(|_| {
        Err(VaultpipeError::ProducerFailed("archive producer panicked".to_string()).into())
    });
    settle(produced, uploaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::chunk::ContentRange;
    use crate::vault::local_store::{LocalVaultStore, read_sidecar};
    use crate::vault::producer::write_archive;
    use crate::vault::store::{CompletedArchive, StoreError};
    use crate::vault::treehash::{self, TreeHash, tree_hash};
    use bytes::Bytes;
    use flate2::read::GzDecoder;
    use std::cell::Cell;
    use std::fs;
    use std::io::Read;
    use std::path::PathBuf;
    use tempfile::tempdir;

    const MIB: usize = 1024 * 1024;

    fn noise(len: usize, mut seed: u64) -> Vec<u8> {
        (0..len)
            .map(|_| {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (seed >> 33) as u8
            })
            .collect()
    }

    fn opts() -> PipelineOptions {
        PipelineOptions {
            part_size: MIB,
            block_size: 64 * 1024,
            depth: 4,
            verbose: false,
        }
    }

    fn tree(base: &Path) -> PathBuf {
        let root = base.join("site");
        fs::create_dir_all(root.join("img")).expect("mkdir");
        fs::write(root.join("index.html"), b"<html></html>").expect("write");
        fs::write(root.join("img/big.bin"), noise(2 * MIB + MIB / 2, 7)).expect("write");
        root
    }

    #[test]
    fn directory_lands_in_the_store_as_one_archive() {
        let src = tempdir().expect("src");
        let vault_root = tempdir().expect("vault");
        let ledger_dir = tempdir().expect("ledger");
        let root = tree(src.path());
        let store = LocalVaultStore::open(vault_root.path()).expect("store");
        let mut ledger = ResumeLedger::open(ledger_dir.path(), "site").expect("ledger");

        let (outcome, summary) = upload_directory(
            &store,
            &root,
            "backups",
            "site backup",
            Some(&mut ledger),
            &opts(),
        )
        .expect("upload");

        assert_eq!(summary.files, 2);
        assert_eq!(summary.bytes, outcome.total_bytes);
        assert!(outcome.parts_uploaded >= 3);
        assert!(!ledger.path().exists());

        let stored = fs::read(store.archive_path("backups", &outcome.archive_id)).expect("archive");
        assert_eq!(tree_hash(&stored), outcome.checksum);
        let sidecar =
            read_sidecar(vault_root.path(), "backups", &outcome.archive_id).expect("sidecar");
        assert_eq!(sidecar.description, "site backup");

        let mut archive = tar::Archive::new(GzDecoder::new(stored.as_slice()));
        let mut big = Vec::new();
        for entry in archive.entries().expect("entries") {
            let mut entry = entry.expect("entry");
            if entry.path().expect("path").ends_with("img/big.bin") {
                entry.read_to_end(&mut big).expect("read");
            }
        }
        assert_eq!(big, noise(2 * MIB + MIB / 2, 7));
    }

    #[test]
    fn missing_root_reports_the_producer_error() {
        let src = tempdir().expect("src");
        let vault_root = tempdir().expect("vault");
        let store = LocalVaultStore::open(vault_root.path()).expect("store");

        let err = upload_directory(
            &store,
            &src.path().join("absent"),
            "backups",
            "x",
            None,
            &opts(),
        )
        .expect_err("missing root");
        let rendered = format!("{err:#}");
        assert!(rendered.contains("archive producer failed"), "{rendered}");
        assert!(rendered.contains("failed to stat archive root"), "{rendered}");
    }

    /// Local store that drops the connection once, on the part starting at
    /// `fail_at`.
    struct DroppingStore<'a> {
        inner: &'a LocalVaultStore,
        fail_at: Cell<Option<u64>>,
        uploads: Cell<u64>,
    }

    impl ArchiveStore for DroppingStore<'_> {
        fn initiate_multipart(
            &self,
            vault: &str,
            description: &str,
            part_size: u64,
        ) -> Result<String, StoreError> {
            self.inner.initiate_multipart(vault, description, part_size)
        }

        fn upload_part(
            &self,
            vault: &str,
            session_id: &str,
            range: &ContentRange,
            checksum: &TreeHash,
            body: Bytes,
        ) -> Result<TreeHash, StoreError> {
            if self.fail_at.get() == Some(range.start) {
                self.fail_at.set(None);
                return Err(StoreError::Transport("connection reset by peer".into()));
            }
            self.uploads.set(self.uploads.get() + 1);
            self.inner.upload_part(vault, session_id, range, checksum, body)
        }

        fn complete_multipart(
            &self,
            vault: &str,
            session_id: &str,
            checksum: &TreeHash,
            archive_size: u64,
        ) -> Result<CompletedArchive, StoreError> {
            self.inner.complete_multipart(vault, session_id, checksum, archive_size)
        }
    }

    #[test]
    fn interrupted_directory_upload_resumes_from_the_bookmark() {
        let src = tempdir().expect("src");
        let vault_root = tempdir().expect("vault");
        let ledger_dir = tempdir().expect("ledger");
        let root = tree(src.path());
        let local = LocalVaultStore::open(vault_root.path()).expect("store");
        let store = DroppingStore {
            inner: &local,
            fail_at: Cell::new(Some(MIB as u64)),
            uploads: Cell::new(0),
        };

        let mut ledger = ResumeLedger::open(ledger_dir.path(), "site").expect("ledger");
        let err = upload_directory(&store, &root, "backups", "site", Some(&mut ledger), &opts())
            .expect_err("second part fails");
        assert!(format!("{err:#}").contains("connection reset"), "{err:#}");
        assert_eq!(ledger.confirmed_count(), 1);
        let first_session = ledger.session_id().map(str::to_string).expect("session kept");
        drop(ledger);

        store.uploads.set(0);
        let mut ledger = ResumeLedger::open(ledger_dir.path(), "site").expect("reopen");
        let (outcome, _) =
            upload_directory(&store, &root, "backups", "site", Some(&mut ledger), &opts())
                .expect("resumed upload");

        let (_, expected) =
            write_archive(&root, Vec::new(), &ProducerOptions { verbose: false }).expect("tar");
        let parts = (expected.len() as u64).div_ceil(MIB as u64);
        assert!(parts >= 3, "{parts}");
        assert!(outcome.resumed);
        assert_eq!(outcome.session_id, first_session);
        assert_eq!(outcome.parts_skipped, 1);
        assert_eq!(outcome.parts_uploaded, parts - 1);
        assert_eq!(store.uploads.get(), parts - 1);
        assert!(!ledger.path().exists());

        let stored = fs::read(local.archive_path("backups", &outcome.archive_id)).expect("archive");
        assert_eq!(stored, expected);
        assert_eq!(tree_hash(&stored), outcome.checksum);
    }

    fn sample_outcome() -> UploadOutcome {
        UploadOutcome {
            archive_id: "a".into(),
            location: "/l".into(),
            session_id: "s".into(),
            checksum: treehash::empty(),
            total_bytes: 0,
            parts_uploaded: 0,
            parts_skipped: 0,
            resumed: false,
        }
    }

    #[test]
    fn broken_pipe_in_producer_defers_to_the_uploader() {
        let producer_err = anyhow::Error::new(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
            .context("failed to archive x");
        let err = settle(Err(producer_err), Err(anyhow::anyhow!("store said no")))
            .expect_err("failure");
        assert_eq!(format!("{err:#}"), "store said no");
    }

    #[test]
    fn real_producer_failure_wins() {
        let producer_err = anyhow::Error::new(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let err = settle(
            Err(producer_err),
            Err(anyhow::anyhow!("archive stream closed")),
        )
        .expect_err("failure");
        assert!(format!("{err:#}").starts_with("archive producer failed"));

        let ok = settle(Ok(ProducerSummary::default()), Ok(sample_outcome())).expect("ok");
        assert_eq!(ok.0.archive_id, "a");
    }
}
