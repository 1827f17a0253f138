//! # Packet headers and frames (RFC 9000 Sections 12, 17, 19)
//!
//! Wire serialization for the packet pipeline: long and short headers,
//! Version Negotiation and Retry packets, and frame parse/encode. Frame
//! payload references are zero-copy slices of the decrypted packet body.
//!
//! Packet numbers are carried in a fixed 4-byte truncated encoding
//! (`pn_len = 4`); [`decode_packet_number`] reconstructs the full 62-bit
//! value against the largest received number.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::types::{ConnectionId, VarIntCodec, MAX_CID_LEN, QUIC_VERSION};

/// Fixed on-wire packet number length.
pub const PN_LEN: usize = 4;

// ============================================================================
// Header
// ============================================================================

/// Packet type, covering both header forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Initial,
    Handshake,
    Retry,
    VersionNegotiation,
    /// Short header (1-RTT).
    Short,
}

/// A parsed packet, borrowing the datagram.
#[derive(Debug)]
pub struct ParsedPacket<'a> {
    pub ty: PacketType,
    pub version: u32,
    pub dcid: ConnectionId,
    pub scid: Option<ConnectionId>,
    /// Initial packets: the address-validation token.
    pub token: &'a [u8],
    /// Truncated packet number (Initial/Handshake/Short).
    pub pn_trunc: u32,
    /// Key phase bit (short header only).
    pub key_phase: bool,
    /// Header bytes, bound as associated data by packet protection.
    pub header: &'a [u8],
    /// Protected payload.
    pub payload: &'a [u8],
    /// Total bytes consumed from the datagram (coalescing advances by
    /// this much).
    pub consumed: usize,
}

fn read_cid(buf: &[u8], pos: &mut usize) -> Result<ConnectionId> {
    let len = *buf.get(*pos).ok_or(Error::InvalidPacket)? as usize;
    *pos += 1;
    if len > MAX_CID_LEN || buf.len() < *pos + len {
        return Err(Error::InvalidPacket);
    }
    let cid = ConnectionId::from_slice(&buf[*pos..*pos + len]).ok_or(Error::InvalidPacket)?;
    *pos += len;
    Ok(cid)
}

fn read_varint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let (value, n) = VarIntCodec::decode(&buf[*pos..]).ok_or(Error::InvalidPacket)?;
    *pos += n;
    Ok(value)
}

/// Parse one packet from the front of `buf`. Short headers need the
/// local CID length, which the wire does not carry.
pub fn parse_packet<'a>(buf: &'a [u8], short_dcid_len: usize) -> Result<ParsedPacket<'a>> {
    let first = *buf.first().ok_or(Error::InvalidPacket)?;

    if first & 0x80 == 0 {
        // Short header: flags | dcid | pn(4) | payload. Consumes the
        // rest of the datagram (short packets are never coalesced after).
        let mut pos = 1usize;
        if buf.len() < pos + short_dcid_len + PN_LEN {
            return Err(Error::InvalidPacket);
        }
        let dcid = ConnectionId::from_slice(&buf[pos..pos + short_dcid_len])
            .ok_or(Error::InvalidPacket)?;
        pos += short_dcid_len;
        let pn_trunc = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
        let header_end = pos + PN_LEN;
        return Ok(ParsedPacket {
            ty: PacketType::Short,
            version: QUIC_VERSION,
            dcid,
            scid: None,
            token: &[],
            pn_trunc,
            key_phase: first & 0x04 != 0,
            header: &buf[..header_end],
            payload: &buf[header_end..],
            consumed: buf.len(),
        });
    }

    // Long header.
    if buf.len() < 7 {
        return Err(Error::InvalidPacket);
    }
    let version = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    let mut pos = 5usize;
    let dcid = read_cid(buf, &mut pos)?;
    let scid = read_cid(buf, &mut pos)?;

    if version == 0 {
        // Version Negotiation: remainder is a list of supported versions.
        return Ok(ParsedPacket {
            ty: PacketType::VersionNegotiation,
            version,
            dcid,
            scid: Some(scid),
            token: &[],
            pn_trunc: 0,
            key_phase: false,
            header: &buf[..pos],
            payload: &buf[pos..],
            consumed: buf.len(),
        });
    }

    let ty = match (first >> 4) & 0x03 {
        0b00 => PacketType::Initial,
        0b10 => PacketType::Handshake,
        0b11 => PacketType::Retry,
        _ => return Err(Error::InvalidPacket), // 0-RTT unsupported
    };

    if ty == PacketType::Retry {
        // Retry: token runs to the 16-byte integrity tag.
        if buf.len() < pos + RETRY_TAG_LEN {
            return Err(Error::InvalidPacket);
        }
        return Ok(ParsedPacket {
            ty,
            version,
            dcid,
            scid: Some(scid),
            token: &buf[pos..buf.len() - RETRY_TAG_LEN],
            pn_trunc: 0,
            key_phase: false,
            header: &buf[..pos],
            payload: &buf[buf.len() - RETRY_TAG_LEN..],
            consumed: buf.len(),
        });
    }

    let token = if ty == PacketType::Initial {
        let token_len = read_varint(buf, &mut pos)? as usize;
        if buf.len() < pos + token_len {
            return Err(Error::InvalidPacket);
        }
        let token = &buf[pos..pos + token_len];
        pos += token_len;
        token
    } else {
        &[]
    };

    let length = read_varint(buf, &mut pos)? as usize;
    if length < PN_LEN || buf.len() < pos + length {
        return Err(Error::InvalidPacket);
    }
    let pn_trunc = u32::from_be_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]);
    let header_end = pos + PN_LEN;
    let payload_end = pos + length;
    Ok(ParsedPacket {
        ty,
        version,
        dcid,
        scid: Some(scid),
        token,
        pn_trunc,
        key_phase: false,
        header: &buf[..header_end],
        payload: &buf[header_end..payload_end],
        consumed: payload_end,
    })
}

/// Reconstruct a full packet number from its 32-bit truncation
/// (RFC 9000 Appendix A.3, fixed 4-byte window).
pub fn decode_packet_number(truncated: u32, largest: Option<u64>) -> u64 {
    let expected = largest.map_or(0, |l| l + 1);
    let win = 1u64 << 32;
    let hwin = win / 2;
    let candidate = (expected & !(win - 1)) | u64::from(truncated);
    if candidate + hwin <= expected && candidate + win < (1u64 << 62) {
        candidate + win
    } else if candidate > expected + hwin && candidate >= win {
        candidate - win
    } else {
        candidate
    }
}

/// Append a long header plus packet number and pre-sealed payload.
pub fn encode_long_packet(
    out: &mut Vec<u8>,
    ty: PacketType,
    version: u32,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    token: &[u8],
    pn: u64,
    sealed: &[u8],
) {
    let type_bits: u8 = match ty {
        PacketType::Initial => 0b00,
        PacketType::Handshake => 0b10,
        _ => 0b00,
    };
    out.push(0x80 | 0x40 | (type_bits << 4) | (PN_LEN as u8 - 1));
    out.extend_from_slice(&version.to_be_bytes());
    out.push(dcid.len() as u8);
    out.extend_from_slice(dcid.as_bytes());
    out.push(scid.len() as u8);
    out.extend_from_slice(scid.as_bytes());
    if ty == PacketType::Initial {
        let mut tmp = [0u8; 8];
        let n = VarIntCodec::encode(token.len() as u64, &mut tmp).unwrap_or(1);
        out.extend_from_slice(&tmp[..n]);
        out.extend_from_slice(token);
    }
    let mut tmp = [0u8; 8];
    let n = VarIntCodec::encode((PN_LEN + sealed.len()) as u64, &mut tmp).unwrap_or(1);
    out.extend_from_slice(&tmp[..n]);
    out.extend_from_slice(&(pn as u32).to_be_bytes());
    out.extend_from_slice(sealed);
}

/// Header prefix of a long packet, as bound by packet protection.
/// Everything up to and including the packet number, for a payload of
/// known sealed length.
pub fn long_header_bytes(
    ty: PacketType,
    version: u32,
    dcid: &ConnectionId,
    scid: &ConnectionId,
    token: &[u8],
    pn: u64,
    sealed_len: usize,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    let type_bits: u8 = match ty {
        PacketType::Initial => 0b00,
        PacketType::Handshake => 0b10,
        _ => 0b00,
    };
    out.push(0x80 | 0x40 | (type_bits << 4) | (PN_LEN as u8 - 1));
    out.extend_from_slice(&version.to_be_bytes());
    out.push(dcid.len() as u8);
    out.extend_from_slice(dcid.as_bytes());
    out.push(scid.len() as u8);
    out.extend_from_slice(scid.as_bytes());
    if ty == PacketType::Initial {
        let mut tmp = [0u8; 8];
        let n = VarIntCodec::encode(token.len() as u64, &mut tmp).unwrap_or(1);
        out.extend_from_slice(&tmp[..n]);
        out.extend_from_slice(token);
    }
    let mut tmp = [0u8; 8];
    let n = VarIntCodec::encode((PN_LEN + sealed_len) as u64, &mut tmp).unwrap_or(1);
    out.extend_from_slice(&tmp[..n]);
    out.extend_from_slice(&(pn as u32).to_be_bytes());
    out
}

/// Short header bytes (flags, DCID, packet number).
pub fn short_header_bytes(dcid: &ConnectionId, key_phase: bool, pn: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + dcid.len() + PN_LEN);
    let mut flags = 0x40 | (PN_LEN as u8 - 1);
    if key_phase {
        flags |= 0x04;
    }
    out.push(flags);
    out.extend_from_slice(dcid.as_bytes());
    out.extend_from_slice(&(pn as u32).to_be_bytes());
    out
}

// ============================================================================
// Version Negotiation and Retry
// ============================================================================

/// Length of the Retry integrity tag.
pub const RETRY_TAG_LEN: usize = 16;

/// Build a Version Negotiation packet (RFC 9000 Section 17.2.1). The
/// CIDs echo the triggering packet with roles swapped.
pub fn build_version_negotiation(
    dcid: &ConnectionId,
    scid: &ConnectionId,
    versions: &[u32],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + versions.len() * 4);
    out.push(0x80 | (rand::random::<u8>() & 0x3f));
    out.extend_from_slice(&0u32.to_be_bytes());
    out.push(dcid.len() as u8);
    out.extend_from_slice(dcid.as_bytes());
    out.push(scid.len() as u8);
    out.extend_from_slice(scid.as_bytes());
    for version in versions {
        out.extend_from_slice(&version.to_be_bytes());
    }
    out
}

/// Parse the version list out of a Version Negotiation payload.
pub fn parse_version_list(payload: &[u8]) -> Vec<u32> {
    payload
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Retry integrity pseudo-tag: binds the original DCID and the retry
/// packet contents under the version-wide constant (stands in for the
/// AES-GCM construction of RFC 9001 Section 5.8).
pub fn retry_tag(odcid: &ConnectionId, retry_without_tag: &[u8]) -> [u8; RETRY_TAG_LEN] {
    let digest = crate::crypto::kdf(&[b"retry", odcid.as_bytes(), retry_without_tag]);
    let mut tag = [0u8; RETRY_TAG_LEN];
    tag.copy_from_slice(&digest[..RETRY_TAG_LEN]);
    tag
}

/// Build a Retry packet carrying `token`. `dcid` is the client's source
/// CID, `scid` the server-chosen CID the client must adopt, and `odcid`
/// the client's original destination CID bound into the integrity tag.
pub fn build_retry(
    dcid: &ConnectionId,
    scid: &ConnectionId,
    odcid: &ConnectionId,
    token: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + token.len());
    out.push(0x80 | 0x40 | (0b11 << 4));
    out.extend_from_slice(&QUIC_VERSION.to_be_bytes());
    out.push(dcid.len() as u8);
    out.extend_from_slice(dcid.as_bytes());
    out.push(scid.len() as u8);
    out.extend_from_slice(scid.as_bytes());
    out.extend_from_slice(token);
    let tag = retry_tag(odcid, &out);
    out.extend_from_slice(&tag);
    out
}

/// Verify a received Retry packet against the original DCID.
pub fn verify_retry(odcid: &ConnectionId, packet: &[u8]) -> bool {
    if packet.len() < RETRY_TAG_LEN {
        return false;
    }
    let (body, tag) = packet.split_at(packet.len() - RETRY_TAG_LEN);
    retry_tag(odcid, body) == tag
}

// ============================================================================
// Frames (RFC 9000 Section 19)
// ============================================================================

/// A single QUIC frame. `Bytes` fields are zero-copy slices of the
/// decrypted packet payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding,
    Ping,
    Ack {
        largest: u64,
        delay_ms: u64,
        /// `(start, end)` half-open ranges, descending.
        ranges: Vec<(u64, u64)>,
    },
    ResetStream {
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: u64,
        error_code: u64,
    },
    Crypto {
        offset: u64,
        data: Bytes,
    },
    NewToken {
        token: Bytes,
    },
    Stream {
        stream_id: u64,
        offset: u64,
        data: Bytes,
        fin: bool,
    },
    MaxData(u64),
    MaxStreamData {
        stream_id: u64,
        maximum: u64,
    },
    MaxStreams {
        bidi: bool,
        maximum: u64,
    },
    DataBlocked(u64),
    StreamDataBlocked {
        stream_id: u64,
        limit: u64,
    },
    NewConnectionId {
        sequence: u64,
        retire_prior_to: u64,
        cid: ConnectionId,
        reset_token: [u8; 16],
    },
    RetireConnectionId {
        sequence: u64,
    },
    PathChallenge([u8; 8]),
    PathResponse([u8; 8]),
    ConnectionClose {
        /// Application close (0x1d) vs transport close (0x1c).
        application: bool,
        error_code: u64,
        frame_type: u64,
        reason: Bytes,
    },
    HandshakeDone,
}

impl Frame {
    /// Whether the frame elicits an acknowledgment (RFC 9002 Section 2).
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Ack { .. } | Frame::Padding | Frame::ConnectionClose { .. }
        )
    }

    fn push_varint(out: &mut Vec<u8>, value: u64) {
        let mut tmp = [0u8; 8];
        let n = VarIntCodec::encode(value, &mut tmp).unwrap_or(1);
        out.extend_from_slice(&tmp[..n]);
    }

    /// Append the wire encoding to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Frame::Padding => out.push(0x00),
            Frame::Ping => out.push(0x01),
            Frame::Ack {
                largest,
                delay_ms,
                ranges,
            } => {
                out.push(0x02);
                Self::push_varint(out, *largest);
                Self::push_varint(out, *delay_ms);
                let count = ranges.len().saturating_sub(1) as u64;
                Self::push_varint(out, count);
                let mut iter = ranges.iter();
                let mut prev_start = match iter.next() {
                    Some(&(start, end)) => {
                        Self::push_varint(out, end - 1 - start);
                        start
                    }
                    None => {
                        Self::push_varint(out, 0);
                        *largest
                    }
                };
                for &(start, end) in iter {
                    // gap: packets between this range's end and the
                    // previous range's start, minus two.
                    Self::push_varint(out, prev_start - end - 1);
                    Self::push_varint(out, end - 1 - start);
                    prev_start = start;
                }
            }
            Frame::ResetStream {
                stream_id,
                error_code,
                final_size,
            } => {
                out.push(0x04);
                Self::push_varint(out, *stream_id);
                Self::push_varint(out, *error_code);
                Self::push_varint(out, *final_size);
            }
            Frame::StopSending {
                stream_id,
                error_code,
            } => {
                out.push(0x05);
                Self::push_varint(out, *stream_id);
                Self::push_varint(out, *error_code);
            }
            Frame::Crypto { offset, data } => {
                out.push(0x06);
                Self::push_varint(out, *offset);
                Self::push_varint(out, data.len() as u64);
                out.extend_from_slice(data);
            }
            Frame::NewToken { token } => {
                out.push(0x07);
                Self::push_varint(out, token.len() as u64);
                out.extend_from_slice(token);
            }
            Frame::Stream {
                stream_id,
                offset,
                data,
                fin,
            } => {
                // Always encoded with OFF and LEN bits set.
                let mut ty = 0x08 | 0x04 | 0x02;
                if *fin {
                    ty |= 0x01;
                }
                out.push(ty);
                Self::push_varint(out, *stream_id);
                Self::push_varint(out, *offset);
                Self::push_varint(out, data.len() as u64);
                out.extend_from_slice(data);
            }
            Frame::MaxData(maximum) => {
                out.push(0x10);
                Self::push_varint(out, *maximum);
            }
            Frame::MaxStreamData { stream_id, maximum } => {
                out.push(0x11);
                Self::push_varint(out, *stream_id);
                Self::push_varint(out, *maximum);
            }
            Frame::MaxStreams { bidi, maximum } => {
                out.push(if *bidi { 0x12 } else { 0x13 });
                Self::push_varint(out, *maximum);
            }
            Frame::DataBlocked(limit) => {
                out.push(0x14);
                Self::push_varint(out, *limit);
            }
            Frame::StreamDataBlocked { stream_id, limit } => {
                out.push(0x15);
                Self::push_varint(out, *stream_id);
                Self::push_varint(out, *limit);
            }
            Frame::NewConnectionId {
                sequence,
                retire_prior_to,
                cid,
                reset_token,
            } => {
                out.push(0x18);
                Self::push_varint(out, *sequence);
                Self::push_varint(out, *retire_prior_to);
                out.push(cid.len() as u8);
                out.extend_from_slice(cid.as_bytes());
                out.extend_from_slice(reset_token);
            }
            Frame::RetireConnectionId { sequence } => {
                out.push(0x19);
                Self::push_varint(out, *sequence);
            }
            Frame::PathChallenge(data) => {
                out.push(0x1a);
                out.extend_from_slice(data);
            }
            Frame::PathResponse(data) => {
                out.push(0x1b);
                out.extend_from_slice(data);
            }
            Frame::ConnectionClose {
                application,
                error_code,
                frame_type,
                reason,
            } => {
                out.push(if *application { 0x1d } else { 0x1c });
                Self::push_varint(out, *error_code);
                if !application {
                    Self::push_varint(out, *frame_type);
                }
                Self::push_varint(out, reason.len() as u64);
                out.extend_from_slice(reason);
            }
            Frame::HandshakeDone => out.push(0x1e),
        }
    }
}

/// Iterator-style frame parser over a decrypted payload.
pub struct FrameParser {
    payload: Bytes,
    pos: usize,
}

impl FrameParser {
    pub fn new(payload: Bytes) -> Self {
        Self { payload, pos: 0 }
    }

    fn varint(&mut self) -> Result<u64> {
        let (value, n) =
            VarIntCodec::decode(&self.payload[self.pos..]).ok_or(Error::InvalidPacket)?;
        self.pos += n;
        Ok(value)
    }

    fn take(&mut self, len: usize) -> Result<Bytes> {
        if self.payload.len() < self.pos + len {
            return Err(Error::InvalidPacket);
        }
        let data = self.payload.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(data)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let data = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&data);
        Ok(out)
    }

    /// Parse the next frame; `Ok(None)` at end of payload.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.pos >= self.payload.len() {
            return Ok(None);
        }
        let ty = self.varint()?;
        let frame = match ty {
            0x00 => {
                // Collapse padding runs.
                while self.payload.get(self.pos) == Some(&0x00) {
                    self.pos += 1;
                }
                Frame::Padding
            }
            0x01 => Frame::Ping,
            0x02 | 0x03 => {
                let largest = self.varint()?;
                let delay_ms = self.varint()?;
                let count = self.varint()?;
                let first = self.varint()?;
                if first > largest {
                    return Err(Error::InvalidPacket);
                }
                let mut ranges = vec![(largest - first, largest + 1)];
                let mut smallest = largest - first;
                for _ in 0..count {
                    let gap = self.varint()?;
                    let len = self.varint()?;
                    let end = smallest
                        .checked_sub(gap + 1)
                        .ok_or(Error::InvalidPacket)?;
                    let start = end
                        .checked_sub(1)
                        .and_then(|e| e.checked_sub(len))
                        .ok_or(Error::InvalidPacket)?;
                    ranges.push((start, end));
                    smallest = start;
                }
                if ty == 0x03 {
                    // ECN counts: parse and ignore.
                    for _ in 0..3 {
                        self.varint()?;
                    }
                }
                Frame::Ack {
                    largest,
                    delay_ms,
                    ranges,
                }
            }
            0x04 => Frame::ResetStream {
                stream_id: self.varint()?,
                error_code: self.varint()?,
                final_size: self.varint()?,
            },
            0x05 => Frame::StopSending {
                stream_id: self.varint()?,
                error_code: self.varint()?,
            },
            0x06 => {
                let offset = self.varint()?;
                let len = self.varint()? as usize;
                Frame::Crypto {
                    offset,
                    data: self.take(len)?,
                }
            }
            0x07 => {
                let len = self.varint()? as usize;
                Frame::NewToken {
                    token: self.take(len)?,
                }
            }
            0x08..=0x0f => {
                let stream_id = self.varint()?;
                let offset = if ty & 0x04 != 0 { self.varint()? } else { 0 };
                let len = if ty & 0x02 != 0 {
                    self.varint()? as usize
                } else {
                    self.payload.len() - self.pos
                };
                Frame::Stream {
                    stream_id,
                    offset,
                    data: self.take(len)?,
                    fin: ty & 0x01 != 0,
                }
            }
            0x10 => Frame::MaxData(self.varint()?),
            0x11 => Frame::MaxStreamData {
                stream_id: self.varint()?,
                maximum: self.varint()?,
            },
            0x12 | 0x13 => Frame::MaxStreams {
                bidi: ty == 0x12,
                maximum: self.varint()?,
            },
            0x14 => Frame::DataBlocked(self.varint()?),
            0x15 => Frame::StreamDataBlocked {
                stream_id: self.varint()?,
                limit: self.varint()?,
            },
            0x16 | 0x17 => {
                // STREAMS_BLOCKED: note the limit and move on.
                self.varint()?;
                Frame::Padding
            }
            0x18 => {
                let sequence = self.varint()?;
                let retire_prior_to = self.varint()?;
                let cid_len = self.take(1)?[0] as usize;
                if cid_len > MAX_CID_LEN {
                    return Err(Error::InvalidPacket);
                }
                let cid_bytes = self.take(cid_len)?;
                let cid = ConnectionId::from_slice(&cid_bytes).ok_or(Error::InvalidPacket)?;
                Frame::NewConnectionId {
                    sequence,
                    retire_prior_to,
                    cid,
                    reset_token: self.take_array::<16>()?,
                }
            }
            0x19 => Frame::RetireConnectionId {
                sequence: self.varint()?,
            },
            0x1a => Frame::PathChallenge(self.take_array::<8>()?),
            0x1b => Frame::PathResponse(self.take_array::<8>()?),
            0x1c | 0x1d => {
                let error_code = self.varint()?;
                let frame_type = if ty == 0x1c { self.varint()? } else { 0 };
                let len = self.varint()? as usize;
                Frame::ConnectionClose {
                    application: ty == 0x1d,
                    error_code,
                    frame_type,
                    reason: self.take(len)?,
                }
            }
            0x1e => Frame::HandshakeDone,
            _ => return Err(Error::InvalidPacket),
        };
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) -> Frame {
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        let mut parser = FrameParser::new(Bytes::from(buf));
        let parsed = parser.next_frame().unwrap().unwrap();
        assert!(parser.next_frame().unwrap().is_none());
        parsed
    }

    #[test]
    fn stream_frame_round_trip() {
        let frame = Frame::Stream {
            stream_id: 4,
            offset: 1200,
            data: Bytes::from_static(b"ping"),
            fin: true,
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn ack_frame_round_trip_with_gaps() {
        let frame = Frame::Ack {
            largest: 20,
            delay_ms: 3,
            ranges: vec![(18, 21), (10, 15), (2, 3)],
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn connection_close_variants() {
        let transport = Frame::ConnectionClose {
            application: false,
            error_code: 0x0a,
            frame_type: 0x06,
            reason: Bytes::from_static(b"bad"),
        };
        assert_eq!(round_trip(transport.clone()), transport);

        let app = Frame::ConnectionClose {
            application: true,
            error_code: 42,
            frame_type: 0,
            reason: Bytes::new(),
        };
        assert_eq!(round_trip(app.clone()), app);
    }

    #[test]
    fn long_header_parse() {
        let dcid = ConnectionId::from_slice(&[1u8; 18]).unwrap();
        let scid = ConnectionId::from_slice(&[2u8; 18]).unwrap();
        let mut out = Vec::new();
        encode_long_packet(
            &mut out,
            PacketType::Initial,
            QUIC_VERSION,
            &dcid,
            &scid,
            b"tok",
            77,
            b"sealed-payload-bytes",
        );
        let parsed = parse_packet(&out, 18).unwrap();
        assert_eq!(parsed.ty, PacketType::Initial);
        assert_eq!(parsed.dcid, dcid);
        assert_eq!(parsed.scid, Some(scid));
        assert_eq!(parsed.token, b"tok");
        assert_eq!(parsed.pn_trunc, 77);
        assert_eq!(parsed.payload, b"sealed-payload-bytes");
        assert_eq!(parsed.consumed, out.len());
    }

    #[test]
    fn coalesced_packets_consume_exactly() {
        let dcid = ConnectionId::from_slice(&[1u8; 8]).unwrap();
        let scid = ConnectionId::from_slice(&[2u8; 8]).unwrap();
        let mut out = Vec::new();
        encode_long_packet(&mut out, PacketType::Initial, QUIC_VERSION, &dcid, &scid, &[], 0, b"aaaa");
        let first_len = out.len();
        encode_long_packet(&mut out, PacketType::Handshake, QUIC_VERSION, &dcid, &scid, &[], 1, b"bb");

        let first = parse_packet(&out, 8).unwrap();
        assert_eq!(first.consumed, first_len);
        let second = parse_packet(&out[first.consumed..], 8).unwrap();
        assert_eq!(second.ty, PacketType::Handshake);
        assert_eq!(second.payload, b"bb");
    }

    #[test]
    fn short_header_parse() {
        let dcid = ConnectionId::from_slice(&[9u8; 18]).unwrap();
        let mut out = short_header_bytes(&dcid, true, 0x01020304);
        out.extend_from_slice(b"payload");
        let parsed = parse_packet(&out, 18).unwrap();
        assert_eq!(parsed.ty, PacketType::Short);
        assert!(parsed.key_phase);
        assert_eq!(parsed.pn_trunc, 0x01020304);
        assert_eq!(parsed.payload, b"payload");
    }

    #[test]
    fn version_negotiation_round_trip() {
        let dcid = ConnectionId::from_slice(&[3u8; 4]).unwrap();
        let scid = ConnectionId::from_slice(&[4u8; 18]).unwrap();
        let vn = build_version_negotiation(&dcid, &scid, &[QUIC_VERSION]);
        let parsed = parse_packet(&vn, 18).unwrap();
        assert_eq!(parsed.ty, PacketType::VersionNegotiation);
        assert_eq!(parse_version_list(parsed.payload), vec![QUIC_VERSION]);
    }

    #[test]
    fn retry_round_trip_and_tag() {
        let dcid = ConnectionId::from_slice(&[5u8; 8]).unwrap();
        let scid = ConnectionId::from_slice(&[6u8; 18]).unwrap();
        let odcid = ConnectionId::from_slice(&[7u8; 18]).unwrap();
        let retry = build_retry(&dcid, &scid, &odcid, b"retry-token");
        let parsed = parse_packet(&retry, 18).unwrap();
        assert_eq!(parsed.ty, PacketType::Retry);
        assert_eq!(parsed.token, b"retry-token");
        assert!(verify_retry(&odcid, &retry));

        let wrong = ConnectionId::from_slice(&[8u8; 18]).unwrap();
        assert!(!verify_retry(&wrong, &retry));
    }

    #[test]
    fn packet_number_decode_window() {
        // RFC 9000 Appendix A example adapted to the 32-bit window.
        assert_eq!(decode_packet_number(0, None), 0);
        assert_eq!(decode_packet_number(2, Some(1)), 2);
        // Wrap forward across the window boundary.
        let largest = (1u64 << 32) + 5;
        assert_eq!(decode_packet_number(7, Some(largest)), (1u64 << 32) + 7);
    }

    #[test]
    fn truncated_packets_rejected() {
        assert!(parse_packet(&[], 8).is_err());
        assert!(parse_packet(&[0x80, 0, 0], 8).is_err());
        let dcid = ConnectionId::from_slice(&[1u8; 8]).unwrap();
        let mut short = short_header_bytes(&dcid, false, 1);
        short.truncate(4);
        assert!(parse_packet(&short, 8).is_err());
    }
}
