use serde::{Deserialize, Serialize};

/// Half-open byte range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    fn overlaps_or_touches(&self, other: &ByteRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Sorted, non-overlapping, coalesced set of byte ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = ByteRange>) -> Self {
        let mut set = Self::new();
        for r in ranges {
            set.insert(r);
        }
        set
    }

    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of bytes covered.
    pub fn covered(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    /// Highest covered offset (exclusive), `0` when empty.
    pub fn high_water(&self) -> u64 {
        self.ranges.last().map_or(0, |r| r.end)
    }

    pub fn insert(&mut self, range: ByteRange) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;
        for r in self.ranges.drain(..) {
            if r.overlaps_or_touches(&merged) {
                merged.start = merged.start.min(r.start);
                merged.end = merged.end.max(r.end);
            } else if r.end < merged.start {
                out.push(r);
            } else {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(r);
            }
        }
        if !placed {
            out.push(merged);
        }
        self.ranges = out;
    }

    pub fn remove(&mut self, range: ByteRange) {
        if range.is_empty() {
            return;
        }
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        for r in self.ranges.drain(..) {
            if r.end <= range.start || r.start >= range.end {
                out.push(r);
                continue;
            }
            if r.start < range.start {
                out.push(ByteRange::new(r.start, range.start));
            }
            if r.end > range.end {
                out.push(ByteRange::new(range.end, r.end));
            }
        }
        self.ranges = out;
    }

    pub fn contains(&self, range: ByteRange) -> bool {
        self.ranges
            .iter()
            .any(|r| r.start <= range.start && range.end <= r.end)
    }

    pub fn intersects(&self, range: ByteRange) -> bool {
        self.ranges
            .iter()
            .any(|r| r.start < range.end && range.start < r.end)
    }

    /// Gaps of `[0, size)` not covered by this set.
    pub fn gaps(&self, size: u64) -> Vec<ByteRange> {
        let mut out = Vec::new();
        let mut cursor = 0u64;
        for r in &self.ranges {
            if r.start >= size {
                break;
            }
            if r.start > cursor {
                out.push(ByteRange::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
        }
        if cursor < size {
            out.push(ByteRange::new(cursor, size));
        }
        out
    }

    pub fn is_complete(&self, size: u64) -> bool {
        size == 0 || self.contains(ByteRange::new(0, size))
    }
}

/// Pick the first block of at most `block_size` bytes in `[0, size)` that is neither acquired
/// nor reserved.
pub fn next_free_block(
    acquired: &RangeSet,
    reserved: &RangeSet,
    size: u64,
    block_size: u64,
) -> Option<ByteRange> {
    let mut taken = acquired.clone();
    for r in reserved.ranges() {
        taken.insert(*r);
    }
    let gap = taken.gaps(size).into_iter().next()?;
    let end = gap.start.saturating_add(block_size.max(1)).min(gap.end);
    Some(ByteRange::new(gap.start, end))
}
