//! # Packet and stream buffers
//!
//! Three building blocks for the data path:
//!
//! - [`PacketBuf`]: an owned, length-bounded buffer for one serialized
//!   packet. The packet assembler writes into the spare capacity and
//!   finalizes with [`PacketBuf::set_len`].
//! - [`ChunkQueue`]: an ordered queue of byte chunks with independent
//!   *sent* and *consumed* cursors. Backs both per-stream outbound data
//!   and the per-level crypto send buffers: bytes advance the sent cursor
//!   when serialized, and are freed only when the covering range is
//!   acknowledged.
//! - [`RangeSet`]: a merged set of `[start, end)` ranges used for packet
//!   number tracking and ack/receive accounting.

use std::collections::VecDeque;

use bytes::Bytes;
use smallvec::SmallVec;

// ============================================================================
// PacketBuf
// ============================================================================

/// An owned outbound packet buffer, bounded at creation time.
///
/// The diagnostic label shows up in trace output to differentiate send
/// operations; it must be a static string.
#[derive(Debug)]
pub struct PacketBuf {
    data: Vec<u8>,
    len: usize,
    label: &'static str,
}

impl PacketBuf {
    pub fn new(capacity: usize, label: &'static str) -> Self {
        Self {
            data: vec![0u8; capacity],
            len: 0,
            label,
        }
    }

    /// Full writable region (up to the bound chosen at creation).
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Set the final serialized length. Clamped to the capacity bound.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl AsRef<[u8]> for PacketBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

// ============================================================================
// ChunkQueue
// ============================================================================

/// An ordered outbound byte queue with absolute offsets.
///
/// Three cursors partition the stream of pushed bytes:
///
/// ```text
///   0 ....... base ........ sent ........ end
///   |consumed |  unacked    |   unsent    |
/// ```
///
/// `seek` advances `sent` as bytes are serialized into packets; `consume`
/// advances `base` as acknowledgments arrive, freeing chunks. Data in
/// `[base, sent)` stays readable for retransmission via [`read_at`].
///
/// [`read_at`]: ChunkQueue::read_at
#[derive(Debug, Default)]
pub struct ChunkQueue {
    chunks: VecDeque<Bytes>,
    base: u64,
    sent: u64,
    end: u64,
    ended: bool,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Pushing after [`end`](ChunkQueue::end) is a
    /// caller bug and the chunk is dropped.
    pub fn push(&mut self, data: Bytes) {
        if self.ended || data.is_empty() {
            return;
        }
        self.end += data.len() as u64;
        self.chunks.push_back(data);
    }

    /// Mark the queue finished: no further bytes will be pushed (FIN).
    pub fn end(&mut self) {
        self.ended = true;
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Unconsumed bytes (unacked + unsent).
    pub fn len(&self) -> u64 {
        self.end - self.base
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unsent bytes.
    pub fn remaining(&self) -> u64 {
        self.end - self.sent
    }

    /// Absolute offset of the next unsent byte.
    pub fn sent_offset(&self) -> u64 {
        self.sent
    }

    /// Absolute offset of the first unconsumed byte.
    pub fn base_offset(&self) -> u64 {
        self.base
    }

    /// Absolute end offset (total bytes ever pushed).
    pub fn end_offset(&self) -> u64 {
        self.end
    }

    /// Advance the sent cursor by `amount` bytes.
    pub fn seek(&mut self, amount: u64) {
        self.sent = (self.sent + amount).min(self.end);
    }

    /// Free `amount` acknowledged bytes from the front. The consumed
    /// cursor never passes the sent cursor.
    pub fn consume(&mut self, amount: u64) -> u64 {
        let amount = amount.min(self.sent - self.base);
        let mut left = amount;
        self.base += amount;
        while left > 0 {
            let front = match self.chunks.front_mut() {
                Some(c) => c,
                None => break,
            };
            let n = (front.len() as u64).min(left);
            if n == front.len() as u64 {
                self.chunks.pop_front();
            } else {
                front.advance_start(n as usize);
            }
            left -= n;
        }
        amount
    }

    /// Gather up to `max` bytes starting at absolute `offset` into `out`.
    /// `offset` must be at or past the consumed base; reads past `end`
    /// return fewer bytes. Returns the number of bytes gathered.
    pub fn read_at(&self, offset: u64, max: usize, out: &mut SmallVec<[Bytes; 4]>) -> usize {
        if offset < self.base || offset >= self.end {
            return 0;
        }
        let mut skip = offset - self.base;
        let mut want = max;
        let mut gathered = 0usize;
        for chunk in &self.chunks {
            if want == 0 {
                break;
            }
            let clen = chunk.len() as u64;
            if skip >= clen {
                skip -= clen;
                continue;
            }
            let start = skip as usize;
            let take = (chunk.len() - start).min(want);
            out.push(chunk.slice(start..start + take));
            gathered += take;
            want -= take;
            skip = 0;
        }
        gathered
    }

    /// Drop all buffered bytes, reporting the unconsumed length.
    pub fn cancel(&mut self) -> u64 {
        let remaining = self.len();
        self.chunks.clear();
        self.base = self.end;
        self.sent = self.end;
        remaining
    }
}

/// `Bytes` lacks an in-place front trim with that name; tiny extension.
trait AdvanceStart {
    fn advance_start(&mut self, n: usize);
}

impl AdvanceStart for Bytes {
    fn advance_start(&mut self, n: usize) {
        *self = self.slice(n..);
    }
}

// ============================================================================
// RangeSet
// ============================================================================

/// A set of `[start, end)` ranges kept sorted and merged.
///
/// Used for received packet numbers (ACK generation), acknowledged byte
/// spans (buffer consumption), and receive-side reassembly accounting.
#[derive(Debug, Clone, Default)]
pub struct RangeSet {
    ranges: Vec<(u64, u64)>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `[start, end)`, merging with adjacent or overlapping ranges.
    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut merged = (start, end);
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;
        for &(s, e) in &self.ranges {
            if e < merged.0 || s > merged.1 {
                if s > merged.1 && !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push((s, e));
            } else {
                merged.0 = merged.0.min(s);
                merged.1 = merged.1.max(e);
            }
        }
        if !placed {
            out.push(merged);
        }
        self.ranges = out;
    }

    /// Insert a single value.
    pub fn insert_point(&mut self, value: u64) {
        self.insert(value, value + 1);
    }

    pub fn contains(&self, value: u64) -> bool {
        self.ranges.iter().any(|&(s, e)| s <= value && value < e)
    }

    /// Largest contained value, if any.
    pub fn max(&self) -> Option<u64> {
        self.ranges.last().map(|&(_, e)| e - 1)
    }

    /// Advance a contiguity watermark: if a range starts at or before
    /// `base`, returns its end; otherwise returns `base` unchanged.
    pub fn advance(&self, base: u64) -> u64 {
        for &(s, e) in &self.ranges {
            if s <= base && base < e {
                return e;
            }
        }
        base
    }

    /// Ranges in descending order (ACK frame layout).
    pub fn iter_descending(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().rev().copied()
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Drop all ranges entirely below `floor` and clamp the rest.
    pub fn prune_below(&mut self, floor: u64) {
        self.ranges.retain_mut(|r| {
            if r.1 <= floor {
                return false;
            }
            if r.0 < floor {
                r.0 = floor;
            }
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod chunk_queue {
        use super::*;

        #[test]
        fn push_seek_consume_accounting() {
            let mut q = ChunkQueue::new();
            q.push(Bytes::from_static(b"hello"));
            q.push(Bytes::from_static(b"world"));
            assert_eq!(q.len(), 10);
            assert_eq!(q.remaining(), 10);

            q.seek(7);
            assert_eq!(q.remaining(), 3);
            assert_eq!(q.sent_offset(), 7);
            assert_eq!(q.len(), 10);

            // Consume never passes the sent cursor.
            assert_eq!(q.consume(9), 7);
            assert_eq!(q.len(), 3);
            assert_eq!(q.base_offset(), 7);
        }

        #[test]
        fn read_at_spans_chunks() {
            let mut q = ChunkQueue::new();
            q.push(Bytes::from_static(b"abc"));
            q.push(Bytes::from_static(b"defg"));

            let mut out = SmallVec::new();
            let n = q.read_at(2, 3, &mut out);
            assert_eq!(n, 3);
            let flat: Vec<u8> = out.iter().flat_map(|b| b.iter().copied()).collect();
            assert_eq!(flat, b"cde");
        }

        #[test]
        fn read_at_after_partial_consume() {
            let mut q = ChunkQueue::new();
            q.push(Bytes::from_static(b"0123456789"));
            q.seek(10);
            q.consume(4);

            let mut out = SmallVec::new();
            assert_eq!(q.read_at(2, 4, &mut out), 0, "below base is gone");
            assert_eq!(q.read_at(4, 4, &mut out), 4);
            let flat: Vec<u8> = out.iter().flat_map(|b| b.iter().copied()).collect();
            assert_eq!(flat, b"4567");
        }

        #[test]
        fn cancel_reports_unconsumed() {
            let mut q = ChunkQueue::new();
            q.push(Bytes::from_static(b"abcdef"));
            q.seek(6);
            q.consume(2);
            assert_eq!(q.cancel(), 4);
            assert!(q.is_empty());
        }

        #[test]
        fn push_after_end_is_dropped() {
            let mut q = ChunkQueue::new();
            q.push(Bytes::from_static(b"ab"));
            q.end();
            q.push(Bytes::from_static(b"cd"));
            assert_eq!(q.len(), 2);
            assert!(q.is_ended());
        }
    }

    mod range_set {
        use super::*;

        #[test]
        fn insert_merges_overlaps() {
            let mut set = RangeSet::new();
            set.insert(0, 3);
            set.insert(5, 8);
            set.insert(2, 6);
            assert_eq!(set.range_count(), 1);
            assert_eq!(set.max(), Some(7));
            assert!(set.contains(4));
            assert!(!set.contains(8));
        }

        #[test]
        fn advance_watermark() {
            let mut set = RangeSet::new();
            set.insert(0, 4);
            set.insert(6, 9);
            assert_eq!(set.advance(0), 4);
            assert_eq!(set.advance(4), 4); // gap at 4..6
            set.insert(4, 6);
            assert_eq!(set.advance(4), 9);
        }

        #[test]
        fn descending_iteration_for_acks() {
            let mut set = RangeSet::new();
            set.insert_point(1);
            set.insert_point(5);
            set.insert_point(6);
            let ranges: Vec<_> = set.iter_descending().collect();
            assert_eq!(ranges, vec![(5, 7), (1, 2)]);
        }

        #[test]
        fn prune_below_floor() {
            let mut set = RangeSet::new();
            set.insert(0, 10);
            set.insert(20, 30);
            set.prune_below(25);
            assert_eq!(set.range_count(), 1);
            assert!(set.contains(25));
            assert!(!set.contains(24));
        }
    }
}
