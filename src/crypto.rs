//! # Crypto levels, buffers, and the TLS provider seam (RFC 9001)
//!
//! The transport does not implement TLS. It drives an abstract
//! [`TlsProvider`] that consumes CRYPTO stream bytes and calls back into
//! the session through [`HandshakeEvents`]: secrets are installed per
//! level, outbound handshake bytes land in the per-level
//! [`CryptoBuffers`], and ClientHello/certificate processing may suspend
//! cooperatively until the application resumes it.
//!
//! Packet protection is likewise a seam: [`PacketProtection`] seals and
//! opens packet payloads from provider-supplied secrets. The built-in
//! [`SipProtection`] is a deterministic SipHash-keyed transform with a
//! 16-byte integrity tag; a production provider feeds the same secrets
//! to a real AEAD behind this trait.

use std::hash::Hasher;

use bytes::Bytes;
use siphasher::sip::SipHasher13;

use crate::buffer::ChunkQueue;
use crate::error::{codes, Error, Result};
use crate::transport::TransportParams;
use crate::types::Side;

// ============================================================================
// Crypto levels
// ============================================================================

/// Encryption level (RFC 9001 Section 2.1). Each level carries its own
/// keying material and packet number space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Initial = 0,
    Handshake = 1,
    Application = 2,
}

impl Level {
    pub const COUNT: usize = 3;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Level> {
        match index {
            0 => Some(Level::Initial),
            1 => Some(Level::Handshake),
            2 => Some(Level::Application),
            _ => None,
        }
    }
}

// ============================================================================
// Outbound crypto buffers
// ============================================================================

/// Three-level outbound CRYPTO byte queues.
///
/// Bytes submitted at level L are freed only when an ACK covering that
/// byte range arrives at level L; until then they remain readable for
/// retransmission. Cumulative submit/ack counters are kept so the
/// buffered length is always `submitted - acked`.
#[derive(Debug, Default)]
pub struct CryptoBuffers {
    levels: [ChunkQueue; Level::COUNT],
    submitted: [u64; Level::COUNT],
    acked: [u64; Level::COUNT],
    limit: u64,
}

impl CryptoBuffers {
    pub fn new(limit: u64) -> Self {
        Self {
            limit: limit.max(crate::types::MIN_MAX_CRYPTO_BUFFER),
            ..Self::default()
        }
    }

    /// Queue outbound crypto bytes at `level`.
    pub fn submit(&mut self, level: Level, data: Bytes) -> Result<()> {
        let queue = &mut self.levels[level.index()];
        if queue.len() + data.len() as u64 > self.limit {
            return Err(Error::Transport(codes::CRYPTO_BUFFER_EXCEEDED));
        }
        self.submitted[level.index()] += data.len() as u64;
        queue.push(data);
        Ok(())
    }

    /// Acknowledge `amount` contiguous bytes at `level`, freeing them.
    pub fn ack(&mut self, level: Level, amount: u64) {
        let freed = self.levels[level.index()].consume(amount);
        self.acked[level.index()] += freed;
    }

    /// Currently buffered (unacked) length at `level`.
    pub fn buffered(&self, level: Level) -> u64 {
        self.levels[level.index()].len()
    }

    /// Total unacked bytes across all levels; reported on destroy.
    pub fn remaining_total(&self) -> u64 {
        self.levels.iter().map(ChunkQueue::len).sum()
    }

    pub fn submitted(&self, level: Level) -> u64 {
        self.submitted[level.index()]
    }

    pub fn acked(&self, level: Level) -> u64 {
        self.acked[level.index()]
    }

    /// Access the underlying queue (packet assembly and retransmission).
    pub fn queue(&self, level: Level) -> &ChunkQueue {
        &self.levels[level.index()]
    }

    pub fn queue_mut(&mut self, level: Level) -> &mut ChunkQueue {
        &mut self.levels[level.index()]
    }
}

// ============================================================================
// Packet protection
// ============================================================================

/// Seals and opens packet payloads for one direction at one level.
pub trait PacketProtection: Send + std::fmt::Debug {
    /// Authentication tag length appended by `seal`.
    fn tag_len(&self) -> usize;

    /// Protect `payload`, binding `header` and `pn`. Output is
    /// `payload.len() + tag_len()` bytes.
    fn seal(&self, pn: u64, header: &[u8], payload: &[u8]) -> Vec<u8>;

    /// Reverse `seal`. Returns `None` when the tag does not verify.
    fn open(&self, pn: u64, header: &[u8], sealed: &[u8]) -> Option<Vec<u8>>;
}

/// Tag length of the built-in protection (mirrors the 16-byte AEAD tag).
pub const PROTECTION_TAG_LEN: usize = 16;

const INITIAL_SALT: &[u8] = b"quicport initial salt v1";

/// Built-in SipHash-1-3 keyed transform.
///
/// Payload bytes are XORed with a keystream generated from the secret
/// and packet number, and a 16-byte tag binds header, packet number, and
/// plaintext. Deterministic and dependency-free; not a substitute for a
/// provider-backed AEAD.
#[derive(Debug, Clone)]
pub struct SipProtection {
    k0: u64,
    k1: u64,
}

impl SipProtection {
    /// Derive protection from a handshake secret.
    pub fn from_secret(secret: &[u8]) -> Self {
        let digest = kdf(&[b"pp", secret]);
        let mut k0b = [0u8; 8];
        let mut k1b = [0u8; 8];
        k0b.copy_from_slice(&digest[0..8]);
        k1b.copy_from_slice(&digest[8..16]);
        Self {
            k0: u64::from_le_bytes(k0b),
            k1: u64::from_le_bytes(k1b),
        }
    }

    /// Initial-level secrets are derived from the client's destination
    /// CID and a fixed salt (RFC 9001 Section 5.2), so both endpoints
    /// can protect Initial packets before any handshake output exists.
    /// `write_side` selects the direction label.
    pub fn initial(dcid: &[u8], write_side: Side) -> Self {
        Self::from_secret(&initial_secret(dcid, write_side))
    }

    fn keystream_block(&self, pn: u64, counter: u64) -> [u8; 8] {
        let mut hasher = SipHasher13::new_with_keys(self.k0, self.k1);
        hasher.write_u64(pn);
        hasher.write_u64(counter);
        hasher.finish().to_le_bytes()
    }

    fn tag(&self, pn: u64, header: &[u8], plaintext: &[u8]) -> [u8; PROTECTION_TAG_LEN] {
        let mut tag = [0u8; PROTECTION_TAG_LEN];
        for round in 0u64..2 {
            let mut hasher = SipHasher13::new_with_keys(self.k0 ^ (round + 1), self.k1);
            hasher.write_u64(pn);
            hasher.write(header);
            hasher.write(plaintext);
            let half = hasher.finish().to_le_bytes();
            tag[round as usize * 8..round as usize * 8 + 8].copy_from_slice(&half);
        }
        tag
    }

    fn apply_keystream(&self, pn: u64, data: &mut [u8]) {
        for (i, chunk) in data.chunks_mut(8).enumerate() {
            let block = self.keystream_block(pn, i as u64);
            for (b, k) in chunk.iter_mut().zip(block.iter()) {
                *b ^= k;
            }
        }
    }
}

impl PacketProtection for SipProtection {
    fn tag_len(&self) -> usize {
        PROTECTION_TAG_LEN
    }

    fn seal(&self, pn: u64, header: &[u8], payload: &[u8]) -> Vec<u8> {
        let tag = self.tag(pn, header, payload);
        let mut out = Vec::with_capacity(payload.len() + PROTECTION_TAG_LEN);
        out.extend_from_slice(payload);
        self.apply_keystream(pn, &mut out);
        out.extend_from_slice(&tag);
        out
    }

    fn open(&self, pn: u64, header: &[u8], sealed: &[u8]) -> Option<Vec<u8>> {
        if sealed.len() < PROTECTION_TAG_LEN {
            return None;
        }
        let (body, tag) = sealed.split_at(sealed.len() - PROTECTION_TAG_LEN);
        let mut plain = body.to_vec();
        self.apply_keystream(pn, &mut plain);
        if self.tag(pn, header, &plain) != tag {
            return None;
        }
        Some(plain)
    }
}

/// Per-direction Initial secret for `dcid`.
pub fn initial_secret(dcid: &[u8], write_side: Side) -> [u8; 32] {
    let label: &[u8] = match write_side {
        Side::Client => b"client in",
        Side::Server => b"server in",
    };
    kdf(&[INITIAL_SALT, dcid, label])
}

/// Next-epoch application secret for a key update (RFC 9001 Section 6).
pub fn update_secret(secret: &[u8]) -> [u8; 32] {
    kdf(&[b"quic ku", secret])
}

/// Small keyed-chain KDF over the input parts: four SipHash-1-3 rounds,
/// each folding in the previous state, producing 32 bytes.
pub fn kdf(parts: &[&[u8]]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let mut state = 0u64;
    for round in 0u64..4 {
        let mut hasher = SipHasher13::new_with_keys(0x6b64_6621 ^ round, state);
        for part in parts {
            hasher.write(part);
            hasher.write_u8(0x1f);
        }
        state = hasher.finish();
        out[round as usize * 8..round as usize * 8 + 8].copy_from_slice(&state.to_le_bytes());
    }
    out
}

// ============================================================================
// TLS provider interface
// ============================================================================

/// Benign outcomes of driving the provider. Anything else is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveStatus {
    Ok,
    /// Certificate lookup parked; resume with
    /// [`TlsProvider::on_cert_done`].
    WantX509Lookup,
    /// ClientHello processing parked; resume with
    /// [`TlsProvider::on_client_hello_done`].
    WantClientHello,
}

/// Application decision for a suspendable handshake callout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFlow {
    Proceed,
    Suspend,
}

/// ClientHello details surfaced to a server session.
#[derive(Debug, Clone)]
pub struct ClientHello {
    pub alpn: Vec<Bytes>,
    pub server_name: Option<String>,
    pub cipher_list: Vec<String>,
}

/// Handshake-completion summary. Verification results are surfaced here
/// rather than failing the transport; the application decides whether to
/// close (RFC 9001 Section 4.4 leaves enforcement to the profile).
#[derive(Debug, Clone)]
pub struct HandshakeSummary {
    pub alpn: Option<Bytes>,
    pub cipher: Option<String>,
    pub cipher_version: Option<String>,
    pub server_name: Option<String>,
    /// 0 on success, else a verification failure code.
    pub verify_code: u64,
    /// Reason string for a verification failure.
    pub verify_reason: Option<String>,
}

/// Session-side callbacks the provider drives while processing crypto
/// data. A suspended provider MUST NOT deliver secrets or produce
/// outbound crypto bytes until resumed.
pub trait HandshakeEvents {
    /// Install both directions of level keys. Must succeed before the
    /// provider continues past the level.
    fn on_secrets(&mut self, level: Level, rx_secret: &[u8], tx_secret: &[u8]) -> Result<()>;

    /// Append outbound crypto bytes at `level`.
    fn write_handshake(&mut self, level: Level, data: &[u8]);

    /// Peer transport parameters extracted from the handshake.
    fn on_transport_params(&mut self, params: TransportParams);

    /// Server side: a ClientHello arrived. Returning
    /// [`HandshakeFlow::Suspend`] parks the handshake.
    fn on_client_hello(&mut self, hello: &ClientHello) -> HandshakeFlow;

    /// Server side: certificate selection. Suspend to fetch OCSP.
    fn on_cert_request(&mut self, server_name: Option<&str>) -> HandshakeFlow;

    /// A TLS keylog line (only when keylog is enabled).
    fn on_keylog(&mut self, line: &[u8]);

    /// The handshake finished (successfully at the TLS layer).
    fn on_handshake_complete(&mut self, summary: HandshakeSummary);

    /// A session ticket usable for resumption.
    fn on_session_ticket(&mut self, ticket: &[u8]);
}

/// Handshake configuration handed to [`TlsProvider::init`].
#[derive(Debug, Clone, Default)]
pub struct HandshakeConfig {
    /// Offered protocols (client) or acceptable protocols (server).
    pub alpn: Vec<Bytes>,
    /// SNI (client).
    pub server_name: Option<String>,
    /// Resumption ticket from a previous connection (client).
    pub session_ticket: Option<Bytes>,
    /// Local transport parameters to carry in the handshake.
    pub transport_params: TransportParams,
    /// Ask the peer for stapled OCSP (client).
    pub request_ocsp: bool,
}

/// The abstract TLS 1.3 handshake driver.
///
/// The session owns the provider; the provider holds no reference back
/// (the session passes itself per call as `&mut dyn HandshakeEvents`).
pub trait TlsProvider: Send + std::fmt::Debug {
    fn init(&mut self, side: Side, config: HandshakeConfig) -> Result<()>;

    /// Produce the first flight (client) after `init`.
    fn start(&mut self, events: &mut dyn HandshakeEvents) -> Result<DriveStatus>;

    /// Feed inbound crypto bytes at `level` and let the provider produce
    /// output. An empty `data` re-drives a provider after resumption.
    fn read_write_crypto_data(
        &mut self,
        level: Level,
        data: &[u8],
        events: &mut dyn HandshakeEvents,
    ) -> Result<DriveStatus>;

    /// Resume after a [`DriveStatus::WantClientHello`] suspension.
    fn on_client_hello_done(&mut self, events: &mut dyn HandshakeEvents) -> Result<DriveStatus>;

    /// Resume after a [`DriveStatus::WantX509Lookup`] suspension,
    /// optionally supplying a stapled OCSP response.
    fn on_cert_done(
        &mut self,
        ocsp_response: Option<Bytes>,
        events: &mut dyn HandshakeEvents,
    ) -> Result<DriveStatus>;

    /// 0 when the peer certificate chain verified.
    fn verify_peer_certificate(&self) -> u64;

    /// 0 when `hostname` matches the peer certificate identity.
    fn verify_hostname(&self, hostname: &str) -> u64;

    fn cipher(&self) -> Option<String>;
    fn cipher_version(&self) -> Option<String>;
    fn alpn(&self) -> Option<Bytes>;
    fn servername(&self) -> Option<String>;

    /// Export a resumption ticket, if one is available.
    fn session_ticket(&self) -> Option<Bytes>;

    /// Import a resumption ticket before `init`.
    fn set_session(&mut self, ticket: &[u8]) -> Result<()>;

    fn set_keylog_enabled(&mut self, enabled: bool);

    fn is_handshake_complete(&self) -> bool;
}

/// Creates providers for accepted server sessions; the listening
/// endpoint holds one (the secure-context role).
pub trait TlsContext: Send {
    fn new_provider(&self) -> Box<dyn TlsProvider>;
}

#[cfg(test)]
mod tests {
    use super::*;

    mod buffers {
        use super::*;

        #[test]
        fn accounting_invariant() {
            let mut bufs = CryptoBuffers::new(1 << 20);
            bufs.submit(Level::Initial, Bytes::from_static(b"hello")).unwrap();
            bufs.submit(Level::Initial, Bytes::from_static(b"world")).unwrap();
            bufs.submit(Level::Handshake, Bytes::from_static(b"fin")).unwrap();

            assert_eq!(bufs.buffered(Level::Initial), 10);
            assert_eq!(
                bufs.submitted(Level::Initial) - bufs.acked(Level::Initial),
                bufs.buffered(Level::Initial)
            );

            // Acks free only after the bytes were serialized.
            bufs.queue_mut(Level::Initial).seek(10);
            bufs.ack(Level::Initial, 7);
            assert_eq!(bufs.buffered(Level::Initial), 3);
            assert_eq!(
                bufs.submitted(Level::Initial) - bufs.acked(Level::Initial),
                bufs.buffered(Level::Initial)
            );
            assert_eq!(bufs.remaining_total(), 6);
        }

        #[test]
        fn limit_is_enforced_with_floor() {
            let mut bufs = CryptoBuffers::new(1); // clamped up to the floor
            let big = Bytes::from(vec![0u8; crate::types::MIN_MAX_CRYPTO_BUFFER as usize]);
            assert!(bufs.submit(Level::Initial, big).is_ok());
            assert_eq!(
                bufs.submit(Level::Initial, Bytes::from_static(b"x")),
                Err(Error::Transport(codes::CRYPTO_BUFFER_EXCEEDED))
            );
        }
    }

    mod protection {
        use super::*;

        #[test]
        fn seal_open_round_trip() {
            let p = SipProtection::from_secret(b"secret");
            let header = b"hdr";
            let sealed = p.seal(7, header, b"payload");
            assert_eq!(sealed.len(), 7 + PROTECTION_TAG_LEN);
            assert_eq!(p.open(7, header, &sealed).as_deref(), Some(&b"payload"[..]));
        }

        #[test]
        fn open_rejects_wrong_pn_header_or_key() {
            let p = SipProtection::from_secret(b"secret");
            let sealed = p.seal(7, b"hdr", b"payload");
            assert!(p.open(8, b"hdr", &sealed).is_none());
            assert!(p.open(7, b"xdr", &sealed).is_none());
            let other = SipProtection::from_secret(b"other");
            assert!(other.open(7, b"hdr", &sealed).is_none());
            assert!(p.open(7, b"hdr", &sealed[..8]).is_none());
        }

        #[test]
        fn initial_keys_pair_across_sides() {
            // The client's write keys must be the server's read keys.
            let dcid = b"initial-dcid";
            let client_tx = SipProtection::initial(dcid, Side::Client);
            let server_rx = SipProtection::initial(dcid, Side::Client);
            let sealed = client_tx.seal(0, b"h", b"crypto");
            assert!(server_rx.open(0, b"h", &sealed).is_some());

            let server_tx = SipProtection::initial(dcid, Side::Server);
            assert!(server_tx.open(0, b"h", &sealed).is_none());
        }

        #[test]
        fn update_secret_changes_keys() {
            let s0 = kdf(&[b"app secret"]);
            let s1 = update_secret(&s0);
            assert_ne!(s0, s1);
            let p0 = SipProtection::from_secret(&s0);
            let p1 = SipProtection::from_secret(&s1);
            let sealed = p1.seal(3, b"h", b"data");
            assert!(p0.open(3, b"h", &sealed).is_none());
            assert!(p1.open(3, b"h", &sealed).is_some());
        }
    }
}
