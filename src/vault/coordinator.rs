use crate::vault::chunk::ContentRange;
use crate::vault::ledger::ResumeLedger;
use crate::vault::store::{ArchiveStore, StoreError};
use crate::vault::treehash::{self, TreeHash};
use anyhow::{Context, Result};
use bytes::Bytes;
use std::io::Read;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub archive_id: String,
    pub location: String,
    pub session_id: String,
    pub checksum: TreeHash,
    pub total_bytes: u64,
    pub parts_uploaded: u64,
    pub parts_skipped: u64,
    pub resumed: bool,
}

/// Splits a byte stream into fixed-size parts and drives one multipart
/// session for it, skipping parts the ledger has already confirmed.
pub struct Coordinator<'a> {
    store: &'a dyn ArchiveStore,
    part_size: usize,
}

impl<'a> Coordinator<'a> {
    pub fn new(store: &'a dyn ArchiveStore, part_size: usize) -> Self {
        Self {
            store,
            part_size: part_size.max(1),
        }
    }

    /// Uploads `stream` as one archive. The stream is consumed and dropped
    /// before this returns, on success and on error alike.
    pub fn upload<R: Read>(
        &self,
        mut stream: R,
        vault: &str,
        description: &str,
        mut ledger: Option<&mut ResumeLedger>,
    ) -> Result<UploadOutcome> {
        let part_size = self.part_size as u64;
        if let Some(ledger) = ledger.as_deref_mut() {
            ledger.bind(vault, part_size);
        }

        let existing = ledger
            .as_deref()
            .and_then(|l| l.session_id())
            .map(str::to_string);
        let resumed = existing.is_some();
        let session_id = match existing {
            Some(id) => {
                tracing::info!(
                    session_id = %id,
                    confirmed = ledger.as_deref().map_or(0, |l| l.confirmed_count()),
                    "resuming multipart upload"
                );
                id
            }
            None => {
                let id = self
                    .store
                    .initiate_multipart(vault, description, part_size)
                    .with_context(|| format!("failed to initiate multipart upload to {vault}"))?;
                if let Some(ledger) = ledger.as_deref_mut() {
                    ledger.set_session_id(&id)?;
                }
                tracing::info!(session_id = %id, vault, part_size, "initiated multipart upload");
                id
            }
        };

        let mut offset = 0u64;
        let mut digests = Vec::new();
        let mut parts_uploaded = 0u64;
        let mut parts_skipped = 0u64;

        loop {
            let mut part = Vec::with_capacity(self.part_size);
            stream
                .by_ref()
                .take(self.part_size as u64)
                .read_to_end(&mut part)
                .context("failed to read archive stream")?;
            let n = part.len();
            let Some(range) = ContentRange::for_chunk(offset, n) else {
                break;
            };
            let body = Bytes::from(part);
            let checksum = treehash::tree_hash(&body);

            let confirmed = ledger
                .as_deref()
                .is_some_and(|l| l.previously_confirmed(&range, &checksum));
            if confirmed {
                parts_skipped += 1;
                tracing::info!(range = %range, "part already uploaded; skipping");
            } else {
                let echoed = self
                    .store
                    .upload_part(vault, &session_id, &range, &checksum, body)
                    .with_context(|| format!("failed to upload part {range}"))?;
                if echoed != checksum {
                    return Err(StoreError::ChecksumMismatch {
                        expected: checksum.to_hex(),
                        actual: echoed.to_hex(),
                    })
                    .with_context(|| format!("store rejected the checksum of part {range}"));
                }
                if let Some(ledger) = ledger.as_deref_mut() {
                    ledger.record_confirmed(&range, &checksum)?;
                }
                parts_uploaded += 1;
                tracing::info!(range = %range, checksum = %checksum, "uploaded part");
            }

            digests.push(checksum);
            offset += n as u64;
            if n < self.part_size {
                break;
            }
        }
        drop(stream);

        let checksum = treehash::combine(&digests);
        let completed = self
            .store
            .complete_multipart(vault, &session_id, &checksum, offset)
            .with_context(|| format!("failed to complete multipart upload {session_id}"))?;

        if let Some(ledger) = ledger
            && let Err(err) = ledger.discard()
        {
            tracing::warn!(
                bookmark = ledger.name(),
                "archive completed but bookmark was not removed: {err:#}"
            );
        }

        Ok(UploadOutcome {
            archive_id: completed.archive_id,
            location: completed.location,
            session_id,
            checksum,
            total_bytes: offset,
            parts_uploaded,
            parts_skipped,
            resumed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::store::CompletedArchive;
    use crate::vault::treehash::tree_hash;
    use std::cell::{Cell, RefCell};
    use std::io;
    use tempfile::tempdir;

    const MIB: usize = 1024 * 1024;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Initiate { description: String, part_size: u64 },
        Upload { session: String, range: ContentRange, checksum: TreeHash },
        Complete { session: String, checksum: TreeHash, size: u64 },
    }

    #[derive(Default)]
    struct RecordingStore {
        calls: RefCell<Vec<Call>>,
        sessions: Cell<u32>,
        fail_upload_at: Cell<Option<u64>>,
        fail_complete: Cell<bool>,
        corrupt_echo: Cell<bool>,
    }

    impl RecordingStore {
        fn uploads(&self) -> Vec<ContentRange> {
            self.calls
                .borrow()
                .iter()
                .filter_map(|c| match c {
                    Call::Upload { range, .. } => Some(*range),
                    _ => None,
                })
                .collect()
        }

        fn initiations(&self) -> usize {
            self.calls
                .borrow()
                .iter()
                .filter(|c| matches!(c, Call::Initiate { .. }))
                .count()
        }

        fn last_complete(&self) -> Option<Call> {
            self.calls
                .borrow()
                .iter()
                .rev()
                .find(|c| matches!(c, Call::Complete { .. }))
                .cloned()
        }

        fn reset(&self) {
            self.calls.borrow_mut().clear();
            self.fail_upload_at.set(None);
            self.fail_complete.set(false);
            self.corrupt_echo.set(false);
        }
    }

    impl ArchiveStore for RecordingStore {
        fn initiate_multipart(
            &self,
            _vault: &str,
            description: &str,
            part_size: u64,
        ) -> Result<String, StoreError> {
            self.calls.borrow_mut().push(Call::Initiate {
                description: description.to_string(),
                part_size,
            });
            self.sessions.set(self.sessions.get() + 1);
            Ok(format!("session-{}", self.sessions.get()))
        }

        fn upload_part(
            &self,
            _vault: &str,
            session_id: &str,
            range: &ContentRange,
            checksum: &TreeHash,
            body: Bytes,
        ) -> Result<TreeHash, StoreError> {
            assert_eq!(range.len(), body.len() as u64);
            self.calls.borrow_mut().push(Call::Upload {
                session: session_id.to_string(),
                range: *range,
                checksum: *checksum,
            });
            if self.fail_upload_at.get() == Some(range.start) {
                return Err(StoreError::Service("InternalFailure: injected".into()));
            }
            if self.corrupt_echo.get() {
                return Ok(tree_hash(b"not the body"));
            }
            Ok(tree_hash(&body))
        }

        fn complete_multipart(
            &self,
            _vault: &str,
            session_id: &str,
            checksum: &TreeHash,
            archive_size: u64,
        ) -> Result<CompletedArchive, StoreError> {
            self.calls.borrow_mut().push(Call::Complete {
                session: session_id.to_string(),
                checksum: *checksum,
                size: archive_size,
            });
            if self.fail_complete.get() {
                return Err(StoreError::Protocol("injected".into()));
            }
            Ok(CompletedArchive {
                archive_id: format!("archive-for-{session_id}"),
                location: format!("/vaults/v/archives/archive-for-{session_id}"),
            })
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 253) as u8).collect()
    }

    fn range(start: usize, len: usize) -> ContentRange {
        ContentRange::for_chunk(start as u64, len).expect("range")
    }

    #[test]
    fn two_and_a_half_parts_make_three_chunks() {
        let dir = tempdir().expect("tempdir");
        let store = RecordingStore::default();
        store.fail_complete.set(true);
        let data = payload(2 * MIB + MIB / 2);
        let mut ledger = ResumeLedger::open(dir.path(), "nightly").expect("ledger");

        let coordinator = Coordinator::new(&store, MIB);
        let err = coordinator
            .upload(data.as_slice(), "v", "desc", Some(&mut ledger))
            .expect_err("complete fails");
        assert!(format!("{err:#}").contains("complete"));

        assert_eq!(
            store.uploads(),
            vec![range(0, MIB), range(MIB, MIB), range(2 * MIB, MIB / 2)]
        );
        assert_eq!(ledger.confirmed_count(), 3);

        let expected = treehash::combine(&[
            tree_hash(&data[..MIB]),
            tree_hash(&data[MIB..2 * MIB]),
            tree_hash(&data[2 * MIB..]),
        ]);
        assert_eq!(expected, tree_hash(&data));
        assert_eq!(
            store.last_complete(),
            Some(Call::Complete {
                session: "session-1".into(),
                checksum: expected,
                size: data.len() as u64,
            })
        );
    }

    #[test]
    fn exact_multiple_has_no_trailing_chunk() {
        let store = RecordingStore::default();
        let data = payload(2 * MIB);
        let outcome = Coordinator::new(&store, MIB)
            .upload(data.as_slice(), "v", "desc", None)
            .expect("upload");

        assert_eq!(store.uploads(), vec![range(0, MIB), range(MIB, MIB)]);
        assert_eq!(outcome.parts_uploaded, 2);
        assert_eq!(outcome.total_bytes, data.len() as u64);
        assert_eq!(outcome.checksum, tree_hash(&data));
        assert_eq!(outcome.archive_id, "archive-for-session-1");
        assert!(!outcome.resumed);
    }

    #[test]
    fn empty_stream_finalizes_with_empty_checksum() {
        let store = RecordingStore::default();
        let outcome = Coordinator::new(&store, MIB)
            .upload(io::empty(), "v", "nothing", None)
            .expect("upload");

        assert!(store.uploads().is_empty());
        assert_eq!(outcome.total_bytes, 0);
        assert_eq!(
            outcome.checksum.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            store.last_complete(),
            Some(Call::Complete {
                session: "session-1".into(),
                checksum: treehash::empty(),
                size: 0,
            })
        );
        assert_eq!(
            store.calls.borrow()[0],
            Call::Initiate {
                description: "nothing".into(),
                part_size: MIB as u64,
            }
        );
    }

    #[test]
    fn rerun_after_failed_part_resumes_the_session() {
        let dir = tempdir().expect("tempdir");
        let store = RecordingStore::default();
        let data = payload(2 * MIB + 123);

        store.fail_upload_at.set(Some(MIB as u64));
        {
            let mut ledger = ResumeLedger::open(dir.path(), "docs").expect("ledger");
            Coordinator::new(&store, MIB)
                .upload(data.as_slice(), "v", "desc", Some(&mut ledger))
                .expect_err("second part fails");
            assert_eq!(ledger.confirmed_count(), 1);
            assert_eq!(ledger.session_id(), Some("session-1"));
        }

        store.reset();
        let mut ledger = ResumeLedger::open(dir.path(), "docs").expect("ledger");
        let outcome = Coordinator::new(&store, MIB)
            .upload(data.as_slice(), "v", "desc", Some(&mut ledger))
            .expect("resumed upload");

        assert_eq!(store.initiations(), 0);
        assert_eq!(store.uploads(), vec![range(MIB, MIB), range(2 * MIB, 123)]);
        assert!(store.calls.borrow().iter().all(|c| match c {
            Call::Upload { session, .. } | Call::Complete { session, .. } => session == "session-1",
            Call::Initiate { .. } => false,
        }));
        assert!(outcome.resumed);
        assert_eq!(outcome.parts_skipped, 1);
        assert_eq!(outcome.parts_uploaded, 2);
        assert_eq!(outcome.checksum, tree_hash(&data));
        assert!(!ledger.path().exists());
    }

    #[test]
    fn rerun_after_failed_complete_is_all_skips() {
        let dir = tempdir().expect("tempdir");
        let store = RecordingStore::default();
        let data = payload(3 * MIB);

        store.fail_complete.set(true);
        {
            let mut ledger = ResumeLedger::open(dir.path(), "docs").expect("ledger");
            Coordinator::new(&store, MIB)
                .upload(data.as_slice(), "v", "desc", Some(&mut ledger))
                .expect_err("complete fails");
        }

        store.reset();
        let mut ledger = ResumeLedger::open(dir.path(), "docs").expect("ledger");
        let outcome = Coordinator::new(&store, MIB)
            .upload(data.as_slice(), "v", "desc", Some(&mut ledger))
            .expect("upload");

        assert!(store.uploads().is_empty());
        assert_eq!(outcome.parts_skipped, 3);
        assert_eq!(outcome.parts_uploaded, 0);
        assert_eq!(outcome.session_id, "session-1");
        assert!(!ledger.path().exists());
    }

    #[test]
    fn changed_content_is_reuploaded_and_overwritten() {
        let dir = tempdir().expect("tempdir");
        let store = RecordingStore::default();
        let data = payload(MIB + 10);

        let mut ledger = ResumeLedger::open(dir.path(), "docs").expect("ledger");
        ledger.bind("v", MIB as u64);
        ledger.set_session_id("session-9").expect("session");
        ledger
            .record_confirmed(&range(0, MIB), &tree_hash(b"stale"))
            .expect("record");

        store.fail_complete.set(true);
        Coordinator::new(&store, MIB)
            .upload(data.as_slice(), "v", "desc", Some(&mut ledger))
            .expect_err("complete fails");

        assert_eq!(store.uploads(), vec![range(0, MIB), range(MIB, 10)]);
        assert!(ledger.previously_confirmed(&range(0, MIB), &tree_hash(&data[..MIB])));
        assert_eq!(ledger.confirmed_count(), 2);
    }

    struct Trickle<'a> {
        data: &'a [u8],
        pos: usize,
        interrupt_next: bool,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.interrupt_next = !self.interrupt_next;
            if self.interrupt_next {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "signal"));
            }
            let n = (self.data.len() - self.pos).min(buf.len()).min(4093);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn short_reads_still_fill_whole_parts() {
        let store = RecordingStore::default();
        let data = payload(MIB + MIB / 3);
        let outcome = Coordinator::new(&store, MIB)
            .upload(
                Trickle {
                    data: &data,
                    pos: 0,
                    interrupt_next: false,
                },
                "v",
                "desc",
                None,
            )
            .expect("upload");

        assert_eq!(store.uploads(), vec![range(0, MIB), range(MIB, MIB / 3)]);
        assert_eq!(outcome.checksum, tree_hash(&data));
    }

    #[test]
    fn disagreeing_store_checksum_fails_the_run() {
        let dir = tempdir().expect("tempdir");
        let store = RecordingStore::default();
        store.corrupt_echo.set(true);
        let mut ledger = ResumeLedger::open(dir.path(), "docs").expect("ledger");

        let err = Coordinator::new(&store, MIB)
            .upload(payload(100).as_slice(), "v", "desc", Some(&mut ledger))
            .expect_err("mismatch");
        assert!(err.chain().any(|cause| matches!(
            cause.downcast_ref::<StoreError>(),
            Some(StoreError::ChecksumMismatch { .. })
        )));
        assert_eq!(ledger.confirmed_count(), 0);
        assert!(store.last_complete().is_none());
    }

    #[test]
    fn broken_stream_fails_before_finalize() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::UnexpectedEof, "producer died"))
            }
        }

        let store = RecordingStore::default();
        let err = Coordinator::new(&store, MIB)
            .upload(Broken, "v", "desc", None)
            .expect_err("stream error");
        assert!(format!("{err:#}").contains("failed to read archive stream"));
        assert!(store.last_complete().is_none());
    }
}
