use std::fmt;

/// Inclusive byte interval a chunk occupies within the archive stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
}

impl ContentRange {
    /// Range covering `len` bytes starting at `start`; `None` for an empty chunk.
    pub fn for_chunk(start: u64, len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        Some(Self {
            start,
            end: start + len as u64 - 1,
        })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` header form: `bytes <start>-<end>/*`.
    pub fn header_value(&self) -> String {
        format!("bytes {}-{}/*", self.start, self.end)
    }

    /// Key under which the resume ledger stores this range.
    pub fn ledger_key(&self) -> String {
        canonical_range_key(&self.header_value())
    }

    pub fn parse_ledger_key(raw: &str) -> Option<Self> {
        let (start, end) = raw.trim().split_once('-')?;
        let start = start.parse::<u64>().ok()?;
        let end = end.parse::<u64>().ok()?;
        if end < start {
            return None;
        }
        Some(Self { start, end })
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.header_value())
    }
}

/// Drops the unit prefix, whitespace and the `/*` length marker from a
/// content-range string, leaving `<start>-<end>`.
pub fn canonical_range_key(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_unit = trimmed.strip_prefix("bytes").unwrap_or(trimmed);
    let without_len = match without_unit.split_once('/') {
        Some((range, _)) => range,
        None => without_unit,
    };
    without_len
        .chars()
        .filter(|ch| ch.is_ascii_digit() || *ch == '-')
        .collect()
}
