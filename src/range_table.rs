use std::collections::BTreeMap;

use tokio::sync::Mutex;

/// A half-open span `[start, end)` of the remote resource, with `current`
/// marking the next unwritten offset. Invariant: `start <= current <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ByteRange {
    pub(crate) start: u64,
    pub(crate) end: u64,
    pub(crate) current: u64,
}

impl ByteRange {
    fn remaining(&self) -> u64 {
        self.end - self.current
    }
}

/// Registry of the byte ranges currently owned by live workers.
///
/// Active ranges never overlap, and together with the spans already removed
/// they cover `[0, total)` exactly once. Every mutation goes through the one
/// mutex so steals are atomic with respect to progress updates.
#[derive(Debug)]
pub(crate) struct RangeTable {
    ranges: Mutex<BTreeMap<u64, ByteRange>>,
    min_steal: u64,
}

impl RangeTable {
    pub(crate) fn new(min_steal: u64) -> Self {
        Self {
            ranges: Mutex::new(BTreeMap::new()),
            min_steal,
        }
    }

    /// Registers a fresh range with `current = start`. Ranges are keyed by
    /// their origin start, which the owning worker keeps for later calls;
    /// inserting the same start twice is a caller bug.
    pub(crate) async fn add_range(&self, start: u64, end: u64) {
        let mut ranges = self.ranges.lock().await;
        let prev = ranges.insert(
            start,
            ByteRange {
                start,
                end,
                current: start,
            },
        );
        debug_assert!(prev.is_none(), "range starting at {start} added twice");
    }

    /// Persists the owner's progress and returns the authoritative `end`,
    /// which a concurrent steal may have pulled in since the owner last
    /// looked. Stored progress is clamped to that end so the range invariant
    /// survives a shrink that raced the owner's in-flight read.
    pub(crate) async fn update_range(&self, start: u64, current: u64) -> u64 {
        let mut ranges = self.ranges.lock().await;
        match ranges.get_mut(&start) {
            Some(range) => {
                range.current = current.min(range.end);
                range.end
            }
            None => {
                debug_assert!(false, "update for unknown range starting at {start}");
                current
            }
        }
    }

    /// Drops a range once its owning task is done with it, either because it
    /// reached `end` or because the remainder was handed to a stealer.
    pub(crate) async fn remove_range(&self, start: u64) {
        let mut ranges = self.ranges.lock().await;
        ranges.remove(&start);
    }

    /// Splits the straggler with the most bytes left and returns the tail
    /// half `[mid, end)` for the caller to own. Declines when even the best
    /// donor could not yield a piece of at least `min_steal` bytes while
    /// keeping as much itself; tiny steals cost a request round-trip for no
    /// real gain.
    ///
    /// The max-scan, the shrink of the donor, and the insert of the stolen
    /// range happen under one lock acquisition.
    pub(crate) async fn pick_largest_undownloaded(&self) -> Option<(u64, u64)> {
        let mut ranges = self.ranges.lock().await;
        let donor_start = ranges
            .values()
            .max_by_key(|r| r.remaining())
            .map(|r| r.start)?;

        let donor = ranges.get_mut(&donor_start)?;
        if donor.remaining() < self.min_steal.saturating_mul(2) {
            return None;
        }

        let mid = donor.current + donor.remaining() / 2;
        let end = donor.end;
        donor.end = mid;
        ranges.insert(
            mid,
            ByteRange {
                start: mid,
                end,
                current: mid,
            },
        );
        Some((mid, end))
    }

    #[cfg(test)]
    pub(crate) async fn snapshot(&self) -> Vec<ByteRange> {
        self.ranges.lock().await.values().copied().collect()
    }
}
