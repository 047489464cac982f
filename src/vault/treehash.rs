use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};

/// Leaf block size of the tree hash: 1 MiB.
pub const LEAF_SIZE: usize = 1024 * 1024;

/// A SHA-256 tree hash root (or a single leaf / chunk digest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeHash([u8; 32]);

impl TreeHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(raw: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(raw.trim(), &mut out)?;
        Ok(Self(out))
    }
}

impl fmt::Display for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn finalize(hasher: Sha256) -> TreeHash {
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    TreeHash(out)
}

/// Checksum of zero bytes of input: SHA-256 of the empty string.
pub fn empty() -> TreeHash {
    finalize(Sha256::new())
}

/// Combines digests pairwise up a binary tree. An odd trailing node is
/// carried to the next level unchanged. Order-sensitive.
pub fn combine(digests: &[TreeHash]) -> TreeHash {
    if digests.is_empty() {
        return empty();
    }

    let mut level = digests.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => {
                    let mut hasher = Sha256::new();
                    hasher.update(left.as_bytes());
                    hasher.update(right.as_bytes());
                    finalize(hasher)
                }
                _ => pair[0],
            })
            .collect();
    }
    level[0]
}

/// Incremental tree hasher: SHA-256 per 1 MiB leaf, then [`combine`].
#[derive(Default)]
pub struct TreeHasher {
    leaves: Vec<TreeHash>,
    current: Sha256,
    current_len: usize,
    total: u64,
}

impl TreeHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (LEAF_SIZE - self.current_len).min(data.len());
            self.current.update(&data[..take]);
            self.current_len += take;
            self.total += take as u64;
            data = &data[take..];
            if self.current_len == LEAF_SIZE {
                self.flush_leaf();
            }
        }
    }

    fn flush_leaf(&mut self) {
        let hasher = std::mem::take(&mut self.current);
        self.leaves.push(finalize(hasher));
        self.current_len = 0;
    }

    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn finish(mut self) -> TreeHash {
        if self.current_len > 0 || self.leaves.is_empty() {
            self.flush_leaf();
        }
        combine(&self.leaves)
    }
}

pub fn tree_hash(data: &[u8]) -> TreeHash {
    let mut hasher = TreeHasher::new();
    hasher.update(data);
    hasher.finish()
}

/// Tree hash of everything `reader` yields, plus the byte count.
pub fn tree_hash_reader<R: Read>(mut reader: R) -> io::Result<(TreeHash, u64)> {
    let mut hasher = TreeHasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buf[..n]);
    }
    let total = hasher.total_bytes();
    Ok((hasher.finish(), total))
}
