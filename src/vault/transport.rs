//! Bounded in-memory byte pipe between the archive producer and the upload
//! coordinator.
//!
//! Bytes are moved in blocks of `block_size` over a `sync_channel` holding
//! at most `depth` blocks, so a writer that outruns the reader blocks
//! instead of growing memory. The writer must call [`PipeWriter::finish`]
//! to signal a clean end of stream; dropping it without finishing makes the
//! reader fail with `UnexpectedEof`. Dropping the reader makes further
//! writes fail with `BrokenPipe`.

use std::io::{self, Read, Write};
use std::mem;
use std::sync::mpsc::{self, Receiver, SyncSender};

pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_DEPTH: usize = 8;

enum Frame {
    Data(Vec<u8>),
    End,
}

/// Creates a connected writer/reader pair.
pub fn pipe(block_size: usize, depth: usize) -> (PipeWriter, PipeReader) {
    let block_size = block_size.max(1);
    let (tx, rx) = mpsc::sync_channel(depth.max(1));
    (
        PipeWriter {
            tx: Some(tx),
            buf: Vec::with_capacity(block_size),
            block_size,
            written: 0,
        },
        PipeReader {
            rx,
            current: Vec::new(),
            pos: 0,
            finished: false,
        },
    )
}

pub struct PipeWriter {
    tx: Option<SyncSender<Frame>>,
    buf: Vec<u8>,
    block_size: usize,
    written: u64,
}

impl PipeWriter {
    fn send(&mut self, frame: Frame) -> io::Result<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "archive transport already finished",
            ));
        };
        tx.send(frame).map_err(|_| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                "archive transport reader has gone away",
            )
        })
    }

    fn flush_block(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let block = mem::replace(&mut self.buf, Vec::with_capacity(self.block_size));
        self.send(Frame::Data(block))
    }

    /// Flushes buffered bytes and marks the end of the stream.
    pub fn finish(mut self) -> io::Result<u64> {
        self.flush_block()?;
        self.send(Frame::End)?;
        self.tx = None;
        Ok(self.written)
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if self.buf.len() >= self.block_size {
            self.flush_block()?;
        }
        let take = (self.block_size - self.buf.len()).min(data.len());
        self.buf.extend_from_slice(&data[..take]);
        self.written += take as u64;
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_block()
    }
}

pub struct PipeReader {
    rx: Receiver<Frame>,
    current: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        while self.pos == self.current.len() {
            if self.finished {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(Frame::Data(block)) => {
                    self.current = block;
                    self.pos = 0;
                }
                Ok(Frame::End) => self.finished = true,
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "archive stream closed before its end-of-stream marker",
                    ));
                }
            }
        }

        let n = (self.current.len() - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::pipe;
    use std::io::{ErrorKind, Read, Write};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn bytes_arrive_in_order_across_threads() {
        let (mut writer, mut reader) = pipe(7, 2);
        let payload = (0..10_000u32).map(|i| (i % 256) as u8).collect::<Vec<_>>();
        let expected = payload.clone();

        let producer = thread::spawn(move || {
            for piece in payload.chunks(33) {
                writer.write_all(piece).expect("write");
            }
            writer.finish().expect("finish")
        });

        let mut received = Vec::new();
        reader.read_to_end(&mut received).expect("read");
        assert_eq!(producer.join().expect("join"), expected.len() as u64);
        assert_eq!(received, expected);
    }

    #[test]
    fn reads_after_finish_keep_returning_eof() {
        let (mut writer, mut reader) = pipe(4, 1);
        writer.write_all(b"ab").expect("write");
        thread::spawn(move || writer.finish().expect("finish"));

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).expect("read"), 2);
        assert_eq!(reader.read(&mut buf).expect("eof"), 0);
        assert_eq!(reader.read(&mut buf).expect("eof again"), 0);
    }

    #[test]
    fn writer_dropped_without_finish_is_an_error_for_the_reader() {
        let (mut writer, mut reader) = pipe(4, 4);
        writer.write_all(b"partial").expect("write");
        drop(writer);

        let mut received = Vec::new();
        let err = reader.read_to_end(&mut received).expect_err("abort must surface");
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn reader_gone_breaks_the_writer() {
        let (mut writer, reader) = pipe(2, 1);
        drop(reader);
        let err = writer.write_all(b"abcdef").expect_err("reader is gone");
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
    }

    #[test]
    fn full_pipe_blocks_the_writer() {
        let (mut writer, mut reader) = pipe(4, 1);
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);

        let producer = thread::spawn(move || {
            for _ in 0..6 {
                writer.write_all(b"wxyz").expect("write");
                counter.fetch_add(1, Ordering::SeqCst);
            }
            writer.finish().expect("finish");
        });

        thread::sleep(Duration::from_millis(150));
        // one block buffered in the writer, one queued in the channel
        assert!(accepted.load(Ordering::SeqCst) <= 2);

        let mut received = Vec::new();
        reader.read_to_end(&mut received).expect("drain");
        producer.join().expect("join");
        assert_eq!(received.len(), 24);
    }
}
