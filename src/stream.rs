//! # Streams and the per-session stream table (RFC 9000 Sections 2, 3)
//!
//! A [`Stream`] owns its outbound chunk queue and receive-side
//! reassembly state; delivery to the application happens through session
//! events, in offset order. The [`StreamTable`] keeps insertion order
//! (the send loop walks streams oldest-first; a future priority policy
//! slots in here).

use std::collections::{BTreeMap, HashMap, HashSet};

use bytes::Bytes;

use crate::buffer::{ChunkQueue, RangeSet};
use crate::error::{Error, Result};
use crate::types::{stream_id, Side, StreamDirection};

// ============================================================================
// Stream flags
// ============================================================================

/// Stream state flags, combinable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamFlags(u32);

impl StreamFlags {
    /// The writable side existed at some point.
    pub const WAS_EVER_WRITABLE: u32 = 0x01;
    /// FIN has been serialized; no further STREAM frame with payload.
    pub const HAS_SENT_FIN: u32 = 0x02;
    /// RESET_STREAM was sent for this stream.
    pub const RESET_SENT: u32 = 0x04;
    /// RESET_STREAM was received from the peer.
    pub const RESET_RECEIVED: u32 = 0x08;
    /// Readable side is done (FIN delivered or reset).
    pub const READABLE_CLOSED: u32 = 0x10;
    /// Writable side is done (FIN acknowledged, reset, or shut down).
    pub const WRITABLE_CLOSED: u32 = 0x20;

    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }

    pub fn is_set(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }
}

// ============================================================================
// Stream
// ============================================================================

/// A logical byte stream within a session.
#[derive(Debug)]
pub struct Stream {
    id: u64,
    origin: Side,
    direction: StreamDirection,
    flags: StreamFlags,

    /// Outbound data; bytes freed only as acknowledged.
    pub outbound: ChunkQueue,
    /// Peer's flow-control limit for our sending.
    pub max_send_data: u64,
    /// Acknowledged spans of sent data.
    acked: RangeSet,
    acked_watermark: u64,
    fin_acked: bool,

    /// Next offset to deliver to the application.
    recv_next: u64,
    recv_ooo: BTreeMap<u64, Bytes>,
    fin_offset: Option<u64>,
    fin_delivered: bool,
    /// Our advertised receive limit and delivery progress.
    pub max_recv_data: u64,
    pub recv_delivered: u64,
}

impl Stream {
    /// A locally opened stream. Unidirectional local streams never have
    /// a readable side.
    pub fn new_local(id: u64, local_side: Side, max_send: u64, max_recv: u64) -> Self {
        let direction = stream_id::direction(id);
        let mut stream = Self::new(id, local_side, direction, max_send, max_recv);
        stream.flags.set(StreamFlags::WAS_EVER_WRITABLE);
        if direction == StreamDirection::Unidirectional {
            stream.flags.set(StreamFlags::READABLE_CLOSED);
        }
        stream
    }

    /// A peer-opened stream, created on its first non-empty STREAM frame.
    pub fn new_remote(id: u64, local_side: Side, max_send: u64, max_recv: u64) -> Self {
        let direction = stream_id::direction(id);
        let mut stream = Self::new(
            id,
            local_side.opposite(),
            direction,
            max_send,
            max_recv,
        );
        if direction == StreamDirection::Bidirectional {
            stream.flags.set(StreamFlags::WAS_EVER_WRITABLE);
        } else {
            // Peer-initiated uni: receive only.
            stream.flags.set(StreamFlags::WRITABLE_CLOSED);
        }
        stream
    }

    fn new(
        id: u64,
        origin: Side,
        direction: StreamDirection,
        max_send: u64,
        max_recv: u64,
    ) -> Self {
        Self {
            id,
            origin,
            direction,
            flags: StreamFlags::default(),
            outbound: ChunkQueue::new(),
            max_send_data: max_send,
            acked: RangeSet::new(),
            acked_watermark: 0,
            fin_acked: false,
            recv_next: 0,
            recv_ooo: BTreeMap::new(),
            fin_offset: None,
            fin_delivered: false,
            max_recv_data: max_recv,
            recv_delivered: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn origin(&self) -> Side {
        self.origin
    }

    pub fn direction(&self) -> StreamDirection {
        self.direction
    }

    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags.set(flag);
    }

    // ------------------------------------------------------------------
    // Send side
    // ------------------------------------------------------------------

    /// Whether the application may still queue data.
    pub fn is_writable(&self) -> bool {
        self.flags.is_set(StreamFlags::WAS_EVER_WRITABLE)
            && !self.flags.is_set(
                StreamFlags::HAS_SENT_FIN
                    | StreamFlags::RESET_SENT
                    | StreamFlags::WRITABLE_CLOSED,
            )
    }

    /// Queue outbound bytes; `fin` ends the stream after them.
    pub fn write(&mut self, data: Bytes, fin: bool) -> Result<()> {
        if !self.is_writable() {
            return Err(Error::InvalidState("stream not writable"));
        }
        self.outbound.push(data);
        if fin {
            self.outbound.end();
        }
        Ok(())
    }

    /// Bytes sent but not yet acknowledged, plus unsent bytes.
    pub fn unacked_len(&self) -> u64 {
        self.outbound.len()
    }

    /// Record an acknowledged `[offset, offset+len)` span (and FIN).
    pub fn on_ack(&mut self, offset: u64, len: u64, fin: bool) {
        if len > 0 {
            self.acked.insert(offset, offset + len);
        }
        if fin {
            self.fin_acked = true;
        }
        let new_mark = self.acked.advance(self.acked_watermark);
        if new_mark > self.acked_watermark {
            let delta = new_mark - self.acked_watermark;
            self.acked_watermark = new_mark;
            self.outbound.consume(delta);
        }
        if self.all_sent_and_acked() {
            self.flags.set(StreamFlags::WRITABLE_CLOSED);
        }
    }

    /// All queued data acknowledged and, when FIN was sent, FIN too.
    pub fn all_sent_and_acked(&self) -> bool {
        self.outbound.is_empty()
            && self.outbound.remaining() == 0
            && (!self.flags.is_set(StreamFlags::HAS_SENT_FIN) || self.fin_acked)
            && self.outbound.is_ended() == self.flags.is_set(StreamFlags::HAS_SENT_FIN)
    }

    // ------------------------------------------------------------------
    // Receive side
    // ------------------------------------------------------------------

    /// Ingest a STREAM frame; returns in-order deliveries unlocked by it.
    /// Duplicate and overlapping spans are deduplicated.
    pub fn recv_push(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<Vec<(Bytes, bool)>> {
        if self.flags.is_set(StreamFlags::READABLE_CLOSED) {
            return Ok(Vec::new());
        }
        let end = offset + data.len() as u64;
        if fin {
            match self.fin_offset {
                Some(existing) if existing != end => {
                    return Err(Error::Transport(crate::error::codes::FINAL_SIZE_ERROR))
                }
                _ => self.fin_offset = Some(end),
            }
        }
        if let Some(final_size) = self.fin_offset {
            if end > final_size {
                return Err(Error::Transport(crate::error::codes::FINAL_SIZE_ERROR));
            }
        }
        if end > self.max_recv_data {
            return Err(Error::Transport(crate::error::codes::FLOW_CONTROL_ERROR));
        }

        if !data.is_empty() && end > self.recv_next {
            // Trim the already-delivered prefix and stash; the delivery
            // loop trims any residual overlap against `recv_next`.
            let skip = self.recv_next.saturating_sub(offset).min(data.len() as u64);
            let effective_offset = offset + skip;
            self.recv_ooo
                .entry(effective_offset)
                .or_insert_with(|| data.slice(skip as usize..));
        }

        let mut out = Vec::new();
        loop {
            let (at, chunk) = match self.recv_ooo.first_key_value() {
                Some((&at, _)) if at <= self.recv_next => {
                    let chunk = self.recv_ooo.remove(&at).unwrap_or_default();
                    (at, chunk)
                }
                _ => break,
            };
            let skip = (self.recv_next - at) as usize;
            if skip >= chunk.len() {
                continue;
            }
            let piece = chunk.slice(skip..);
            self.recv_next += piece.len() as u64;
            self.recv_delivered += piece.len() as u64;
            let at_fin = self.fin_offset == Some(self.recv_next);
            if at_fin {
                self.fin_delivered = true;
                self.flags.set(StreamFlags::READABLE_CLOSED);
            }
            out.push((piece, at_fin));
        }
        // A FIN at the current offset with no data still ends the stream.
        if out.is_empty() && !self.fin_delivered && self.fin_offset == Some(self.recv_next) {
            self.fin_delivered = true;
            self.flags.set(StreamFlags::READABLE_CLOSED);
            out.push((Bytes::new(), true));
        }
        Ok(out)
    }

    /// Peer reset: the readable side closes abruptly.
    pub fn on_reset_received(&mut self) {
        self.flags.set(StreamFlags::RESET_RECEIVED);
        self.flags.set(StreamFlags::READABLE_CLOSED);
        self.recv_ooo.clear();
    }

    /// Local reset: drop buffered outbound data.
    pub fn on_reset_sent(&mut self) {
        self.flags.set(StreamFlags::RESET_SENT);
        self.flags.set(StreamFlags::WRITABLE_CLOSED);
        self.outbound.cancel();
    }

    /// Both directions finished; the stream object can be dropped.
    pub fn is_closed(&self) -> bool {
        self.flags.is_set(StreamFlags::READABLE_CLOSED)
            && (self.flags.is_set(StreamFlags::WRITABLE_CLOSED) || self.all_sent_and_acked())
    }
}

// ============================================================================
// Stream table
// ============================================================================

/// Per-session stream map, iterated in insertion order.
///
/// Removed IDs are remembered so a stream object exists at most once
/// per ID across the session's lifetime: late retransmissions for a
/// completed stream must not recreate it.
#[derive(Debug, Default)]
pub struct StreamTable {
    streams: HashMap<u64, Stream>,
    order: Vec<u64>,
    retired: HashSet<u64>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream. Re-inserting a live or retired ID is a caller
    /// bug; the table keeps its state (at-most-once stream creation).
    pub fn insert(&mut self, stream: Stream) {
        let id = stream.id();
        if self.streams.contains_key(&id) || self.retired.contains(&id) {
            return;
        }
        self.order.push(id);
        self.streams.insert(id, stream);
    }

    pub fn get(&self, id: u64) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn remove(&mut self, id: u64) -> Option<Stream> {
        self.order.retain(|&o| o != id);
        let removed = self.streams.remove(&id);
        if removed.is_some() {
            self.retired.insert(id);
        }
        removed
    }

    /// Whether `id` belonged to a stream that has since been removed.
    pub fn is_retired(&self, id: u64) -> bool {
        self.retired.contains(&id)
    }

    /// Stream IDs in insertion order (the send-loop order).
    pub fn ids_in_order(&self) -> Vec<u64> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Drop all streams (session destruction).
    pub fn clear(&mut self) -> Vec<u64> {
        let ids = std::mem::take(&mut self.order);
        self.streams.clear();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bidi_local() -> Stream {
        Stream::new_local(0, Side::Client, 1 << 20, 1 << 20)
    }

    #[test]
    fn local_uni_stream_has_no_readable_side() {
        let s = Stream::new_local(2, Side::Client, 1024, 1024);
        assert!(s.flags().is_set(StreamFlags::READABLE_CLOSED));
        assert!(s.is_writable());
    }

    #[test]
    fn remote_uni_stream_is_read_only() {
        let s = Stream::new_remote(3, Side::Client, 1024, 1024);
        assert_eq!(s.origin(), Side::Server);
        assert!(!s.is_writable());
    }

    #[test]
    fn in_order_delivery_and_fin() {
        let mut s = Stream::new_remote(1, Side::Client, 1024, 1024);
        let out = s.recv_push(0, Bytes::from_static(b"pi"), false).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].0[..], b"pi");
        assert!(!out[0].1);

        let out = s.recv_push(2, Bytes::from_static(b"ng"), true).unwrap();
        assert_eq!(&out[0].0[..], b"ng");
        assert!(out[0].1);
        assert!(s.flags().is_set(StreamFlags::READABLE_CLOSED));
    }

    #[test]
    fn out_of_order_reassembly() {
        let mut s = Stream::new_remote(1, Side::Client, 1024, 1024);
        assert!(s.recv_push(4, Bytes::from_static(b"der"), false).unwrap().is_empty());
        let out = s.recv_push(0, Bytes::from_static(b"reor"), false).unwrap();
        let flat: Vec<u8> = out.iter().flat_map(|(b, _)| b.iter().copied()).collect();
        assert_eq!(flat, b"reorder");
    }

    #[test]
    fn duplicate_data_not_redelivered() {
        let mut s = Stream::new_remote(1, Side::Client, 1024, 1024);
        s.recv_push(0, Bytes::from_static(b"abcd"), false).unwrap();
        let out = s.recv_push(0, Bytes::from_static(b"abcd"), false).unwrap();
        assert!(out.is_empty());
        // Overlap past the delivered prefix yields only new bytes.
        let out = s.recv_push(2, Bytes::from_static(b"cdef"), false).unwrap();
        let flat: Vec<u8> = out.iter().flat_map(|(b, _)| b.iter().copied()).collect();
        assert_eq!(flat, b"ef");
    }

    #[test]
    fn conflicting_final_size_rejected() {
        let mut s = Stream::new_remote(1, Side::Client, 1024, 1024);
        s.recv_push(0, Bytes::from_static(b"abc"), true).unwrap();
        assert!(s.recv_push(0, Bytes::from_static(b"abcdef"), true).is_err());
    }

    #[test]
    fn stream_flow_control_enforced() {
        let mut s = Stream::new_remote(1, Side::Client, 1024, 4);
        assert!(s.recv_push(0, Bytes::from_static(b"12345"), false).is_err());
    }

    #[test]
    fn ack_frees_outbound_in_order() {
        let mut s = bidi_local();
        s.write(Bytes::from_static(b"hello world"), true).unwrap();
        s.outbound.seek(11);
        s.set_flag(StreamFlags::HAS_SENT_FIN);

        s.on_ack(6, 5, true);
        assert_eq!(s.unacked_len(), 11, "gap at front, nothing freed");
        s.on_ack(0, 6, false);
        assert_eq!(s.unacked_len(), 0);
        assert!(s.all_sent_and_acked());
        assert!(s.is_closed() || !s.flags().is_set(StreamFlags::READABLE_CLOSED));
    }

    #[test]
    fn table_keeps_insertion_order() {
        let mut table = StreamTable::new();
        for id in [4u64, 0, 8] {
            table.insert(Stream::new_local(id, Side::Client, 1, 1));
        }
        assert_eq!(table.ids_in_order(), vec![4, 0, 8]);
        table.remove(0);
        assert_eq!(table.ids_in_order(), vec![4, 8]);
    }

    #[test]
    fn table_insert_is_at_most_once() {
        let mut table = StreamTable::new();
        let mut first = Stream::new_local(0, Side::Client, 1, 1);
        first.write(Bytes::from_static(b"x"), false).unwrap();
        table.insert(first);
        table.insert(Stream::new_local(0, Side::Client, 1, 1));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(0).unwrap().unacked_len(), 1, "original kept");
    }

    #[test]
    fn removed_ids_stay_retired() {
        let mut table = StreamTable::new();
        table.insert(Stream::new_remote(3, Side::Client, 1024, 1024));
        assert!(!table.is_retired(3));
        assert!(table.remove(3).is_some());
        assert!(table.is_retired(3));

        // A late duplicate must not resurrect the stream.
        table.insert(Stream::new_remote(3, Side::Client, 1024, 1024));
        assert!(table.is_empty());
        assert!(table.get(3).is_none());
        // IDs never seen are not retired.
        assert!(!table.is_retired(7));
    }
}
