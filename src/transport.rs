//! # Per-connection transport machine (RFC 9000, RFC 9002)
//!
//! The packet-level state machine a session drives: packet number
//! spaces, ack and loss bookkeeping, congestion and flow-control gates,
//! packet assembly, and expiry computation. It is a pure state machine:
//! datagrams and timestamps in, packets and sink callbacks out. All
//! socket, timer, and lifecycle concerns live in the session and
//! endpoint layers.
//!
//! Inbound crypto/stream payloads and ack notifications are delivered
//! through [`TransportEvents`]; every sink method only records state, so
//! the machine never reenters itself.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;

use bytes::Bytes;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::buffer::{PacketBuf, RangeSet};
use crate::crypto::{update_secret, CryptoBuffers, Level, PacketProtection, SipProtection};
use crate::error::{codes, Error, QuicError, Result};
use crate::packet::{
    self, decode_packet_number, Frame, FrameParser, PacketType, ParsedPacket, PN_LEN,
};
use crate::stream::{Stream, StreamTable};
use crate::types::{
    stream_id, ConnectionId, Side, StatelessResetToken, StreamDirection, Timestamp, VarIntCodec,
    DEFAULT_ACTIVE_CID_LIMIT, DEFAULT_MAX_ACK_DELAY_MS, MIN_INITIAL_SIZE, QUIC_VERSION,
};

/// Highest packet number the 62-bit space can protect.
const MAX_PACKET_NUMBER: u64 = (1u64 << 62) - 1;

/// Reordering threshold for packet-based loss detection (RFC 9002).
const LOSS_REORDER_THRESHOLD: u64 = 3;

/// Initial congestion window: 10 full-size datagrams.
const INITIAL_CWND: u64 = 10 * 1200;

/// Minimum congestion window after loss.
const MIN_CWND: u64 = 2 * 1200;

// ============================================================================
// Transport parameters (RFC 9000 Section 18)
// ============================================================================

/// Server preferred address advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferredAddress {
    pub addr: SocketAddr,
    pub cid: ConnectionId,
    pub reset_token: StatelessResetToken,
}

/// Transport parameters carried through the TLS handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    pub max_idle_timeout_ms: u64,
    /// Inbound datagram size limit.
    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub max_ack_delay_ms: u64,
    pub active_connection_id_limit: u64,
    /// Reset token bound to the sender's handshake CID (server only).
    pub stateless_reset_token: Option<StatelessResetToken>,
    pub preferred_address: Option<PreferredAddress>,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            max_idle_timeout_ms: 30_000,
            max_udp_payload_size: 65_527,
            initial_max_data: 15 * 1024 * 1024,
            initial_max_stream_data_bidi_local: 6 * 1024 * 1024,
            initial_max_stream_data_bidi_remote: 6 * 1024 * 1024,
            initial_max_stream_data_uni: 6 * 1024 * 1024,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            max_ack_delay_ms: DEFAULT_MAX_ACK_DELAY_MS,
            active_connection_id_limit: DEFAULT_ACTIVE_CID_LIMIT,
            stateless_reset_token: None,
            preferred_address: None,
        }
    }
}

impl TransportParams {
    /// Serialize for the handshake blob: `id`/`value` varint pairs, with
    /// byte-valued parameters length-prefixed.
    pub fn encode(&self) -> Vec<u8> {
        fn put(out: &mut Vec<u8>, id: u64, value: u64) {
            let mut tmp = [0u8; 8];
            for v in [id, value] {
                let n = VarIntCodec::encode(v, &mut tmp).unwrap_or(1);
                out.extend_from_slice(&tmp[..n]);
            }
        }
        let mut out = Vec::with_capacity(96);
        put(&mut out, 0x01, self.max_idle_timeout_ms);
        put(&mut out, 0x03, self.max_udp_payload_size);
        put(&mut out, 0x04, self.initial_max_data);
        put(&mut out, 0x05, self.initial_max_stream_data_bidi_local);
        put(&mut out, 0x06, self.initial_max_stream_data_bidi_remote);
        put(&mut out, 0x07, self.initial_max_stream_data_uni);
        put(&mut out, 0x08, self.initial_max_streams_bidi);
        put(&mut out, 0x09, self.initial_max_streams_uni);
        put(&mut out, 0x0b, self.max_ack_delay_ms);
        put(&mut out, 0x0e, self.active_connection_id_limit);
        if let Some(token) = &self.stateless_reset_token {
            put(&mut out, 0x02, token.len() as u64);
            out.extend_from_slice(token);
        }
        if let Some(pref) = &self.preferred_address {
            let mut body = Vec::with_capacity(64);
            match pref.addr {
                SocketAddr::V4(v4) => {
                    body.push(4);
                    body.extend_from_slice(&v4.ip().octets());
                    body.extend_from_slice(&v4.port().to_be_bytes());
                }
                SocketAddr::V6(v6) => {
                    body.push(6);
                    body.extend_from_slice(&v6.ip().octets());
                    body.extend_from_slice(&v6.port().to_be_bytes());
                }
            }
            body.push(pref.cid.len() as u8);
            body.extend_from_slice(pref.cid.as_bytes());
            body.extend_from_slice(&pref.reset_token);
            put(&mut out, 0x0d, body.len() as u64);
            out.extend_from_slice(&body);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        let mut params = Self::default();
        let mut pos = 0usize;
        while pos < buf.len() {
            let (id, n) = VarIntCodec::decode(&buf[pos..])?;
            pos += n;
            let (value, n) = VarIntCodec::decode(&buf[pos..])?;
            pos += n;
            match id {
                0x01 => params.max_idle_timeout_ms = value,
                0x03 => params.max_udp_payload_size = value,
                0x04 => params.initial_max_data = value,
                0x05 => params.initial_max_stream_data_bidi_local = value,
                0x06 => params.initial_max_stream_data_bidi_remote = value,
                0x07 => params.initial_max_stream_data_uni = value,
                0x08 => params.initial_max_streams_bidi = value,
                0x09 => params.initial_max_streams_uni = value,
                0x0b => params.max_ack_delay_ms = value,
                0x0e => params.active_connection_id_limit = value,
                0x02 => {
                    let len = value as usize;
                    if len != 16 || buf.len() < pos + len {
                        return None;
                    }
                    let mut token = [0u8; 16];
                    token.copy_from_slice(&buf[pos..pos + 16]);
                    params.stateless_reset_token = Some(token);
                    pos += len;
                }
                0x0d => {
                    let len = value as usize;
                    if buf.len() < pos + len {
                        return None;
                    }
                    params.preferred_address = decode_preferred(&buf[pos..pos + len]);
                    pos += len;
                }
                _ => {
                    // Unknown byte-valued parameters are not used; ignore.
                }
            }
        }
        Some(params)
    }
}

fn decode_preferred(body: &[u8]) -> Option<PreferredAddress> {
    let (&family, rest) = body.split_first()?;
    let (addr, rest) = match family {
        4 => {
            if rest.len() < 6 {
                return None;
            }
            let ip: [u8; 4] = rest[..4].try_into().ok()?;
            let port = u16::from_be_bytes([rest[4], rest[5]]);
            (SocketAddr::from((ip, port)), &rest[6..])
        }
        6 => {
            if rest.len() < 18 {
                return None;
            }
            let ip: [u8; 16] = rest[..16].try_into().ok()?;
            let port = u16::from_be_bytes([rest[16], rest[17]]);
            (SocketAddr::from((ip, port)), &rest[18..])
        }
        _ => return None,
    };
    let (&cid_len, rest) = rest.split_first()?;
    let cid_len = cid_len as usize;
    if rest.len() < cid_len + 16 {
        return None;
    }
    let cid = ConnectionId::from_slice(&rest[..cid_len])?;
    let mut token = [0u8; 16];
    token.copy_from_slice(&rest[cid_len..cid_len + 16]);
    Some(PreferredAddress {
        addr,
        cid,
        reset_token: token,
    })
}

// ============================================================================
// Events sink
// ============================================================================

/// Callbacks the machine raises while consuming a datagram or an ack.
/// Implementations only record state (the session queues events); no
/// sink method may call back into the machine.
pub trait TransportEvents {
    /// In-order crypto bytes at `level`.
    fn on_crypto_data(&mut self, level: Level, data: Bytes);

    /// The contiguous acked prefix at `level` grew by `amount` bytes.
    fn on_crypto_acked(&mut self, level: Level, amount: u64);

    fn on_stream_frame(&mut self, id: u64, offset: u64, data: Bytes, fin: bool);

    fn on_stream_acked(&mut self, id: u64, offset: u64, len: u64, fin: bool);

    fn on_reset_stream(&mut self, id: u64, error_code: u64, final_size: u64);

    fn on_stop_sending(&mut self, id: u64, error_code: u64);

    fn on_max_stream_data(&mut self, id: u64, maximum: u64);

    /// Peer CONNECTION_CLOSE; the session enters draining.
    fn on_connection_close(&mut self, error: QuicError, reason: Bytes);

    /// HANDSHAKE_DONE from the server (client side).
    fn on_handshake_done(&mut self);

    /// Peer issued an additional CID with its reset token.
    fn on_new_connection_id(&mut self, sequence: u64, cid: ConnectionId, token: StatelessResetToken);

    /// Peer retired one of our advertised CIDs.
    fn on_retire_connection_id(&mut self, sequence: u64);

    /// NEW_TOKEN for a future connection.
    fn on_new_token(&mut self, token: Bytes);

    /// A path validation round resolved.
    fn on_path_validation(&mut self, success: bool);
}

/// Datagram-level processing outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Normal,
    /// A peer CONNECTION_CLOSE was processed.
    Draining,
    /// A Version Negotiation packet; the listed versions are the peer's.
    VersionNegotiation(Vec<u32>),
    /// A valid Retry was absorbed; the Initial flight must be resent.
    Retry,
    /// Nothing in the datagram could be read. For short-header packets
    /// this is the stateless-reset candidate path.
    Undecryptable,
}

/// Outcome of serializing one packet of stream data.
#[derive(Debug)]
pub enum StreamWrite {
    /// A packet was produced; `consumed` bytes advanced, `fin` included.
    Packet {
        buf: PacketBuf,
        consumed: u64,
        fin: bool,
    },
    /// Congestion window exhausted; stop for now.
    CongestionLimited,
    /// Stream or connection flow control; stop for now.
    DataBlocked,
    /// Nothing (left) to send for this stream.
    Nothing,
}

/// What a retransmit-timer expiry turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Loss detection: `packets` were marked lost for retransmission.
    Loss { packets: u64 },
    /// Ack-delay: a pending delayed ACK is due.
    AckDelay,
    /// Nothing was pending.
    Idle,
}

// ============================================================================
// Internal per-level state
// ============================================================================

#[derive(Debug, Clone)]
enum SentFrame {
    Crypto { offset: u64, len: u64 },
    Stream { id: u64, offset: u64, len: u64, fin: bool },
    Control(Frame),
}

#[derive(Debug)]
struct SentPacket {
    size: u64,
    time: Timestamp,
    ack_eliciting: bool,
    frames: SmallVec<[SentFrame; 4]>,
}

#[derive(Debug, Default)]
struct LevelSpace {
    rx: Option<SipProtection>,
    tx: Option<SipProtection>,
    next_pn: u64,
    largest_acked: Option<u64>,
    sent: BTreeMap<u64, SentPacket>,
    recv: RangeSet,
    largest_recv: Option<u64>,
    largest_recv_time: Timestamp,
    /// Ack-eliciting packets received since the last ACK we sent.
    ack_pending: bool,
    crypto_tx_next: u64,
    crypto_rx_next: u64,
    crypto_rx_ooo: BTreeMap<u64, Bytes>,
    crypto_acked: RangeSet,
    crypto_ack_watermark: u64,
    discarded: bool,
}

impl LevelSpace {
    fn keys_ready(&self) -> bool {
        self.tx.is_some() && !self.discarded
    }
}

#[derive(Debug, Default)]
struct RttEstimator {
    latest_ms: u64,
    smoothed_ms: u64,
    rttvar_ms: u64,
    min_ms: u64,
}

impl RttEstimator {
    fn sample(&mut self, rtt_ms: u64, ack_delay_ms: u64) {
        self.latest_ms = rtt_ms;
        if self.smoothed_ms == 0 {
            self.smoothed_ms = rtt_ms;
            self.rttvar_ms = rtt_ms / 2;
            self.min_ms = rtt_ms;
            return;
        }
        self.min_ms = self.min_ms.min(rtt_ms);
        let adjusted = rtt_ms.saturating_sub(ack_delay_ms).max(self.min_ms);
        let delta = self.smoothed_ms.abs_diff(adjusted);
        self.rttvar_ms = (3 * self.rttvar_ms + delta) / 4;
        self.smoothed_ms = (7 * self.smoothed_ms + adjusted) / 8;
    }

    /// Probe timeout (RFC 9002 Section 6.2.1).
    fn pto_ms(&self, max_ack_delay_ms: u64) -> u64 {
        let base = if self.smoothed_ms == 0 {
            333 // initial RTT assumption / 3 smoothing not yet available
        } else {
            self.smoothed_ms
        };
        (base + (4 * self.rttvar_ms).max(1) + max_ack_delay_ms).max(1)
    }
}

// ============================================================================
// The machine
// ============================================================================

#[derive(Debug)]
pub struct Transport {
    side: Side,
    version: u32,
    scid: ConnectionId,
    dcid: ConnectionId,
    /// The client's original destination CID: Initial keys derive from it.
    odcid: ConnectionId,
    /// Retry token to echo in Initial packets (client).
    token: Bytes,
    retry_seen: bool,

    levels: [LevelSpace; Level::COUNT],
    app_rx_secret: Vec<u8>,
    app_tx_secret: Vec<u8>,
    key_phase: bool,
    key_updates: u64,

    params_local: TransportParams,
    params_peer: Option<TransportParams>,
    handshake_complete: bool,
    handshake_confirmed: bool,

    // Congestion and RTT.
    cwnd: u64,
    bytes_in_flight: u64,
    ssthresh: u64,
    rtt: RttEstimator,

    // Connection-level flow control.
    max_data_peer: u64,
    tx_data: u64,
    max_data_local: u64,
    rx_data: u64,
    rx_delivered: u64,
    /// Per-stream receive high-water marks backing `rx_data`.
    rx_stream_high: std::collections::HashMap<u64, u64>,

    // Stream-count accounting.
    max_streams_bidi_peer: u64,
    max_streams_uni_peer: u64,
    opened_bidi: u64,
    opened_uni: u64,
    max_streams_bidi_local: u64,
    max_streams_uni_local: u64,
    peer_opened_bidi: u64,
    peer_opened_uni: u64,
    next_stream_bidi: u64,
    next_stream_uni: u64,

    /// Pending application-level control frames.
    control: VecDeque<Frame>,
    /// Frames declared lost, awaiting re-serialization: `(level, frame)`.
    lost: VecDeque<(Level, SentFrame)>,
    /// Outstanding path challenge and its start time.
    challenge: Option<([u8; 8], Timestamp)>,
    ping_pending: bool,

    mtu: usize,
    last_activity: Timestamp,
    /// Bytes the peer's version of us allocated; exposed for memory
    /// introspection on the endpoint.
    allocated: u64,

    /// Packets received but dropped before frame processing.
    pub dropped_packets: u64,
    /// Lost packet count accumulated for statistics.
    pub lost_packets: u64,
    /// Peak bytes in flight.
    pub max_bytes_in_flight: u64,
    /// Times sending was flow-control blocked.
    pub block_count: u64,
}

impl Transport {
    pub fn new(
        side: Side,
        scid: ConnectionId,
        dcid: ConnectionId,
        params_local: TransportParams,
        mtu: usize,
        now: Timestamp,
    ) -> Self {
        let mut machine = Self {
            side,
            version: QUIC_VERSION,
            scid,
            dcid,
            odcid: dcid,
            token: Bytes::new(),
            retry_seen: false,
            levels: Default::default(),
            app_rx_secret: Vec::new(),
            app_tx_secret: Vec::new(),
            key_phase: false,
            key_updates: 0,
            max_data_peer: 0,
            tx_data: 0,
            max_data_local: params_local.initial_max_data,
            rx_data: 0,
            rx_delivered: 0,
            rx_stream_high: std::collections::HashMap::new(),
            max_streams_bidi_peer: 0,
            max_streams_uni_peer: 0,
            opened_bidi: 0,
            opened_uni: 0,
            max_streams_bidi_local: params_local.initial_max_streams_bidi,
            max_streams_uni_local: params_local.initial_max_streams_uni,
            peer_opened_bidi: 0,
            peer_opened_uni: 0,
            next_stream_bidi: stream_id::first(side, StreamDirection::Bidirectional),
            next_stream_uni: stream_id::first(side, StreamDirection::Unidirectional),
            params_local,
            params_peer: None,
            handshake_complete: false,
            handshake_confirmed: false,
            cwnd: INITIAL_CWND,
            bytes_in_flight: 0,
            ssthresh: u64::MAX,
            rtt: RttEstimator::default(),
            control: VecDeque::new(),
            lost: VecDeque::new(),
            challenge: None,
            ping_pending: false,
            mtu,
            last_activity: now,
            allocated: 0,
            dropped_packets: 0,
            lost_packets: 0,
            max_bytes_in_flight: 0,
            block_count: 0,
        };
        machine.install_initial_keys();
        machine
    }

    /// Server-side constructor: `dcid` is the client's source CID and
    /// `odcid` the client-chosen destination CID that Initial keys
    /// derive from.
    pub fn new_server(
        scid: ConnectionId,
        dcid: ConnectionId,
        odcid: ConnectionId,
        params_local: TransportParams,
        mtu: usize,
        now: Timestamp,
    ) -> Self {
        let mut machine = Self::new(Side::Server, scid, dcid, params_local, mtu, now);
        machine.odcid = odcid;
        machine.install_initial_keys();
        machine
    }

    /// Override the offered QUIC version (client; diagnostics and
    /// version-negotiation testing).
    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    fn install_initial_keys(&mut self) {
        let (tx_label, rx_label) = match self.side {
            Side::Client => (Side::Client, Side::Server),
            Side::Server => (Side::Server, Side::Client),
        };
        let space = &mut self.levels[Level::Initial.index()];
        space.tx = Some(SipProtection::initial(self.odcid.as_bytes(), tx_label));
        space.rx = Some(SipProtection::initial(self.odcid.as_bytes(), rx_label));
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn scid(&self) -> &ConnectionId {
        &self.scid
    }

    pub fn dcid(&self) -> &ConnectionId {
        &self.dcid
    }

    pub fn original_dcid(&self) -> &ConnectionId {
        &self.odcid
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn is_handshake_confirmed(&self) -> bool {
        self.handshake_confirmed
    }

    pub fn key_update_count(&self) -> u64 {
        self.key_updates
    }

    pub fn smoothed_rtt_ms(&self) -> u64 {
        self.rtt.smoothed_ms
    }

    pub fn latest_rtt_ms(&self) -> u64 {
        self.rtt.latest_ms
    }

    pub fn min_rtt_ms(&self) -> u64 {
        self.rtt.min_ms
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    /// Connection-level send budget still available.
    pub fn max_data_left(&self) -> u64 {
        self.max_data_peer.saturating_sub(self.tx_data)
    }

    pub fn peer_params(&self) -> Option<&TransportParams> {
        self.params_peer.as_ref()
    }

    pub fn local_params(&self) -> &TransportParams {
        &self.params_local
    }

    /// Heap bytes attributed to this connection's transport state.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated
    }

    /// Retry token for the next connection attempt, if the server sent
    /// NEW_TOKEN.
    pub fn set_retry_token(&mut self, token: Bytes) {
        self.token = token;
    }

    #[cfg(test)]
    pub(crate) fn force_next_packet_number(&mut self, level: Level, pn: u64) {
        self.levels[level.index()].next_pn = pn;
    }

    // ------------------------------------------------------------------
    // Handshake plumbing
    // ------------------------------------------------------------------

    /// Install both directions of level keys. Application-level secrets
    /// are retained for key updates; re-installing a handshake level is
    /// rejected (install-once).
    pub fn install_secrets(&mut self, level: Level, rx_secret: &[u8], tx_secret: &[u8]) -> Result<()> {
        let space = &mut self.levels[level.index()];
        if space.rx.is_some() && level != Level::Initial && level != Level::Application {
            return Err(Error::InvalidState("level keys already installed"));
        }
        if level == Level::Application && !self.app_rx_secret.is_empty() {
            return Err(Error::InvalidState("application keys already installed"));
        }
        space.rx = Some(SipProtection::from_secret(rx_secret));
        space.tx = Some(SipProtection::from_secret(tx_secret));
        if level == Level::Application {
            self.app_rx_secret = rx_secret.to_vec();
            self.app_tx_secret = tx_secret.to_vec();
        }
        self.allocated += (rx_secret.len() + tx_secret.len()) as u64;
        Ok(())
    }

    /// Apply peer transport parameters once the handshake surfaced them.
    pub fn apply_peer_params(&mut self, params: TransportParams) {
        self.max_data_peer = params.initial_max_data;
        self.max_streams_bidi_peer = params.initial_max_streams_bidi;
        self.max_streams_uni_peer = params.initial_max_streams_uni;
        self.params_peer = Some(params);
    }

    /// Effective idle timeout: the minimum of both non-zero advertisements.
    pub fn idle_timeout_ms(&self) -> u64 {
        let local = self.params_local.max_idle_timeout_ms;
        let peer = self
            .params_peer
            .as_ref()
            .map(|p| p.max_idle_timeout_ms)
            .unwrap_or(0);
        match (local, peer) {
            (0, 0) => 0,
            (0, p) => p,
            (l, 0) => l,
            (l, p) => l.min(p),
        }
    }

    /// Mark the TLS handshake complete. Servers queue HANDSHAKE_DONE.
    pub fn on_handshake_complete(&mut self) {
        self.handshake_complete = true;
        if self.side.is_server() {
            self.handshake_confirmed = true;
            self.control.push_back(Frame::HandshakeDone);
        }
    }

    /// Initiate a key update (RFC 9001 Section 6). Returns `false` when
    /// application keys are not yet installed.
    pub fn initiate_key_update(&mut self) -> bool {
        if !self.handshake_complete || self.app_tx_secret.is_empty() {
            return false;
        }
        self.app_rx_secret = update_secret(&self.app_rx_secret).to_vec();
        self.app_tx_secret = update_secret(&self.app_tx_secret).to_vec();
        let space = &mut self.levels[Level::Application.index()];
        space.rx = Some(SipProtection::from_secret(&self.app_rx_secret));
        space.tx = Some(SipProtection::from_secret(&self.app_tx_secret));
        self.key_phase = !self.key_phase;
        self.key_updates += 1;
        debug!(phase = self.key_phase, "initiated key update");
        true
    }

    // ------------------------------------------------------------------
    // Stream id allocation and admission
    // ------------------------------------------------------------------

    /// Allocate the next local stream ID, enforcing the peer's stream
    /// limits.
    pub fn alloc_stream_id(&mut self, dir: StreamDirection) -> Result<u64> {
        match dir {
            StreamDirection::Bidirectional => {
                if self.opened_bidi >= self.max_streams_bidi_peer {
                    return Err(Error::Transport(codes::STREAM_LIMIT_ERROR));
                }
                let id = self.next_stream_bidi;
                self.next_stream_bidi += 4;
                self.opened_bidi += 1;
                Ok(id)
            }
            StreamDirection::Unidirectional => {
                if self.opened_uni >= self.max_streams_uni_peer {
                    return Err(Error::Transport(codes::STREAM_LIMIT_ERROR));
                }
                let id = self.next_stream_uni;
                self.next_stream_uni += 4;
                self.opened_uni += 1;
                Ok(id)
            }
        }
    }

    /// Admit a peer-opened stream ID, enforcing our stream limits.
    pub fn admit_remote_stream(&mut self, id: u64) -> Result<()> {
        if stream_id::is_bidirectional(id) {
            self.peer_opened_bidi += 1;
            if self.peer_opened_bidi > self.max_streams_bidi_local {
                return Err(Error::Transport(codes::STREAM_LIMIT_ERROR));
            }
        } else {
            self.peer_opened_uni += 1;
            if self.peer_opened_uni > self.max_streams_uni_local {
                return Err(Error::Transport(codes::STREAM_LIMIT_ERROR));
            }
        }
        Ok(())
    }

    /// Flow-control limits for a newly created stream, from the peer's
    /// view (`max_send`) and ours (`max_recv`).
    pub fn stream_limits(&self, id: u64, locally_opened: bool) -> (u64, u64) {
        let peer = self.params_peer.clone().unwrap_or_default();
        let local = &self.params_local;
        if !stream_id::is_bidirectional(id) {
            if locally_opened {
                (peer.initial_max_stream_data_uni, 0)
            } else {
                (0, local.initial_max_stream_data_uni)
            }
        } else if locally_opened {
            (
                peer.initial_max_stream_data_bidi_remote,
                local.initial_max_stream_data_bidi_local,
            )
        } else {
            (
                peer.initial_max_stream_data_bidi_local,
                local.initial_max_stream_data_bidi_remote,
            )
        }
    }

    // ------------------------------------------------------------------
    // Control frame queuing
    // ------------------------------------------------------------------

    pub fn queue_control(&mut self, frame: Frame) {
        self.control.push_back(frame);
    }

    pub fn queue_ping(&mut self) {
        self.ping_pending = true;
    }

    /// Account application-consumed stream bytes and advertise a larger
    /// connection window once half the current one is used.
    pub fn on_data_consumed(&mut self, amount: u64) {
        self.rx_delivered += amount;
        let window = self.params_local.initial_max_data;
        if self.max_data_local - self.rx_delivered < window / 2 {
            self.max_data_local = self.rx_delivered + window;
            self.control.push_back(Frame::MaxData(self.max_data_local));
        }
    }

    /// Begin path validation toward the (possibly migrated) peer.
    pub fn start_path_validation(&mut self, now: Timestamp) {
        let data: [u8; 8] = rand::random();
        self.challenge = Some((data, now));
        self.control.push_back(Frame::PathChallenge(data));
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Consume one UDP datagram (possibly holding coalesced packets).
    pub fn read_datagram(
        &mut self,
        now: Timestamp,
        data: &[u8],
        sink: &mut dyn TransportEvents,
    ) -> Result<ReadOutcome> {
        if data.len() > self.params_local.max_udp_payload_size as usize {
            self.dropped_packets += 1;
            return Ok(ReadOutcome::Undecryptable);
        }
        let mut offset = 0usize;
        let mut outcome = ReadOutcome::Undecryptable;
        let mut read_any = false;
        while offset < data.len() {
            let parsed = match packet::parse_packet(&data[offset..], self.scid.len()) {
                Ok(p) => p,
                Err(_) => break,
            };
            let consumed = parsed.consumed;
            match self.read_packet(now, &parsed, sink)? {
                ReadOutcome::Normal => {
                    read_any = true;
                }
                ReadOutcome::Undecryptable => {}
                other => {
                    // Close/VN/Retry outcomes stop coalesced processing.
                    return Ok(other);
                }
            }
            offset += consumed;
        }
        if read_any {
            self.last_activity = now;
            outcome = ReadOutcome::Normal;
        }
        Ok(outcome)
    }

    fn read_packet(
        &mut self,
        now: Timestamp,
        parsed: &ParsedPacket<'_>,
        sink: &mut dyn TransportEvents,
    ) -> Result<ReadOutcome> {
        match parsed.ty {
            PacketType::VersionNegotiation => {
                // Only meaningful before any successful packet exchange.
                if self.handshake_complete || self.levels[Level::Initial.index()].largest_recv.is_some()
                {
                    return Ok(ReadOutcome::Undecryptable);
                }
                return Ok(ReadOutcome::VersionNegotiation(packet::parse_version_list(
                    parsed.payload,
                )));
            }
            PacketType::Retry => return self.read_retry(parsed),
            _ => {}
        }
        if parsed.ty != PacketType::Short && parsed.version != self.version {
            self.dropped_packets += 1;
            return Ok(ReadOutcome::Undecryptable);
        }

        let level = match parsed.ty {
            PacketType::Initial => Level::Initial,
            PacketType::Handshake => Level::Handshake,
            PacketType::Short => Level::Application,
            _ => return Ok(ReadOutcome::Undecryptable),
        };

        // Key-phase handling: a flipped bit means the peer initiated a
        // key update; trial-decrypt under next-epoch keys and commit on
        // success (RFC 9001 Section 6.2).
        let mut trial_update = false;
        let (rx, discarded, largest_recv) = {
            let space = &self.levels[level.index()];
            (space.rx.clone(), space.discarded, space.largest_recv)
        };
        let rx = match rx {
            Some(rx) if !discarded => rx,
            _ => {
                self.dropped_packets += 1;
                return Ok(ReadOutcome::Undecryptable);
            }
        };
        let pn = decode_packet_number(parsed.pn_trunc, largest_recv);
        let plain = if level == Level::Application && parsed.key_phase != self.key_phase {
            let next = SipProtection::from_secret(&update_secret(&self.app_rx_secret));
            match next.open(pn, parsed.header, parsed.payload) {
                Some(p) => {
                    trial_update = true;
                    p
                }
                None => {
                    self.dropped_packets += 1;
                    return Ok(ReadOutcome::Undecryptable);
                }
            }
        } else {
            match rx.open(pn, parsed.header, parsed.payload) {
                Some(p) => p,
                None => {
                    self.dropped_packets += 1;
                    return Ok(ReadOutcome::Undecryptable);
                }
            }
        };

        if trial_update {
            // The peer moved first; advance both directions.
            self.app_rx_secret = update_secret(&self.app_rx_secret).to_vec();
            self.app_tx_secret = update_secret(&self.app_tx_secret).to_vec();
            let space = &mut self.levels[Level::Application.index()];
            space.rx = Some(SipProtection::from_secret(&self.app_rx_secret));
            space.tx = Some(SipProtection::from_secret(&self.app_tx_secret));
            self.key_phase = !self.key_phase;
        }

        let space = &mut self.levels[level.index()];
        if space.recv.contains(pn) {
            // Duplicate; already processed.
            return Ok(ReadOutcome::Normal);
        }
        space.recv.insert_point(pn);
        if space.largest_recv.map_or(true, |l| pn > l) {
            space.largest_recv = Some(pn);
            space.largest_recv_time = now;
        }

        // Each side learns the peer's chosen source CID from the first
        // Initial it reads and adopts it as the destination from then on.
        if level == Level::Initial {
            if let Some(scid) = parsed.scid {
                if !scid.is_empty() {
                    self.dcid = scid;
                }
            }
        }

        self.process_frames(now, level, Bytes::from(plain), sink)
    }

    fn read_retry(&mut self, parsed: &ParsedPacket<'_>) -> Result<ReadOutcome> {
        // Retry is only valid at the client, before any server packet
        // arrived, and at most once (RFC 9000 Section 17.2.5).
        if self.side.is_server()
            || self.retry_seen
            || self.levels[Level::Initial.index()].largest_recv.is_some()
            || parsed.token.is_empty()
        {
            return Ok(ReadOutcome::Undecryptable);
        }
        let full: &[u8] = parsed.header; // header runs to token start
        let mut whole = Vec::with_capacity(full.len() + parsed.token.len() + parsed.payload.len());
        whole.extend_from_slice(full);
        whole.extend_from_slice(parsed.token);
        whole.extend_from_slice(parsed.payload);
        if !packet::verify_retry(&self.odcid, &whole) {
            self.dropped_packets += 1;
            return Ok(ReadOutcome::Undecryptable);
        }
        let new_dcid = match parsed.scid {
            Some(scid) if !scid.is_empty() => scid,
            _ => return Ok(ReadOutcome::Undecryptable),
        };
        self.retry_seen = true;
        self.token = Bytes::copy_from_slice(parsed.token);
        self.dcid = new_dcid;
        self.odcid = new_dcid;
        self.install_initial_keys();

        // The original Initial flight is implicitly lost: rewind the
        // crypto cursor and forget in-flight Initial packets.
        let forgotten = std::mem::take(&mut self.levels[Level::Initial.index()].sent);
        for sent in forgotten.values() {
            if sent.ack_eliciting {
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(sent.size);
            }
        }
        let space = &mut self.levels[Level::Initial.index()];
        space.crypto_tx_next = 0;
        space.next_pn = 0;
        debug!(dcid = %self.dcid, "absorbed retry; resending initial flight");
        Ok(ReadOutcome::Retry)
    }

    fn process_frames(
        &mut self,
        now: Timestamp,
        level: Level,
        payload: Bytes,
        sink: &mut dyn TransportEvents,
    ) -> Result<ReadOutcome> {
        let mut parser = FrameParser::new(payload);
        let mut outcome = ReadOutcome::Normal;
        let mut ack_eliciting = false;
        while let Some(frame) = parser.next_frame()? {
            ack_eliciting |= frame.is_ack_eliciting();
            match frame {
                Frame::Padding | Frame::Ping => {}
                Frame::Ack {
                    largest,
                    delay_ms,
                    ranges,
                } => self.on_ack_received(now, level, largest, delay_ms, &ranges, sink)?,
                Frame::Crypto { offset, data } => {
                    self.on_crypto_frame(level, offset, data, sink)?
                }
                Frame::Stream {
                    stream_id,
                    offset,
                    data,
                    fin,
                } => {
                    if level != Level::Application {
                        return Err(Error::Transport(codes::PROTOCOL_VIOLATION));
                    }
                    // Connection-level receive window: the sum of
                    // per-stream high-water marks must stay inside
                    // max_data (RFC 9000 Section 4.1).
                    let end = offset + data.len() as u64;
                    let high = self.rx_stream_high.entry(stream_id).or_insert(0);
                    if end > *high {
                        self.rx_data += end - *high;
                        *high = end;
                        if self.rx_data > self.max_data_local {
                            return Err(Error::Transport(codes::FLOW_CONTROL_ERROR));
                        }
                    }
                    sink.on_stream_frame(stream_id, offset, data, fin);
                }
                Frame::ResetStream {
                    stream_id,
                    error_code,
                    final_size,
                } => sink.on_reset_stream(stream_id, error_code, final_size),
                Frame::StopSending {
                    stream_id,
                    error_code,
                } => sink.on_stop_sending(stream_id, error_code),
                Frame::MaxData(maximum) => {
                    self.max_data_peer = self.max_data_peer.max(maximum);
                }
                Frame::MaxStreamData { stream_id, maximum } => {
                    sink.on_max_stream_data(stream_id, maximum)
                }
                Frame::MaxStreams { bidi, maximum } => {
                    if bidi {
                        self.max_streams_bidi_peer = self.max_streams_bidi_peer.max(maximum);
                    } else {
                        self.max_streams_uni_peer = self.max_streams_uni_peer.max(maximum);
                    }
                }
                Frame::DataBlocked(_) | Frame::StreamDataBlocked { .. } => {
                    // Peer is blocked on our windows; window advance is
                    // driven by consumption, nothing to do here.
                }
                Frame::NewConnectionId {
                    sequence,
                    cid,
                    reset_token,
                    ..
                } => sink.on_new_connection_id(sequence, cid, reset_token),
                Frame::RetireConnectionId { sequence } => {
                    sink.on_retire_connection_id(sequence)
                }
                Frame::NewToken { token } => sink.on_new_token(token),
                Frame::PathChallenge(data) => {
                    self.control.push_back(Frame::PathResponse(data));
                }
                Frame::PathResponse(data) => {
                    if let Some((expected, _)) = self.challenge {
                        let success = expected == data;
                        self.challenge = None;
                        sink.on_path_validation(success);
                    }
                }
                Frame::ConnectionClose {
                    application,
                    error_code,
                    reason,
                    ..
                } => {
                    sink.on_connection_close(
                        QuicError::from_wire(error_code, application),
                        reason,
                    );
                    outcome = ReadOutcome::Draining;
                }
                Frame::HandshakeDone => {
                    if self.side.is_server() {
                        return Err(Error::Transport(codes::PROTOCOL_VIOLATION));
                    }
                    self.handshake_confirmed = true;
                    sink.on_handshake_done();
                }
            }
            if outcome == ReadOutcome::Draining {
                break;
            }
        }
        if ack_eliciting {
            self.levels[level.index()].ack_pending = true;
        }
        Ok(outcome)
    }

    fn on_crypto_frame(
        &mut self,
        level: Level,
        offset: u64,
        data: Bytes,
        sink: &mut dyn TransportEvents,
    ) -> Result<()> {
        let space = &mut self.levels[level.index()];
        let end = offset + data.len() as u64;
        if end > space.crypto_rx_next {
            let skip = space.crypto_rx_next.saturating_sub(offset).min(data.len() as u64);
            space
                .crypto_rx_ooo
                .entry(offset + skip)
                .or_insert_with(|| data.slice(skip as usize..));
        }
        loop {
            let (at, chunk) = match space.crypto_rx_ooo.first_key_value() {
                Some((&at, _)) if at <= space.crypto_rx_next => {
                    let chunk = space.crypto_rx_ooo.remove(&at).unwrap_or_default();
                    (at, chunk)
                }
                _ => break,
            };
            let skip = (space.crypto_rx_next - at) as usize;
            if skip >= chunk.len() {
                continue;
            }
            let piece = chunk.slice(skip..);
            space.crypto_rx_next += piece.len() as u64;
            sink.on_crypto_data(level, piece);
        }
        Ok(())
    }

    fn on_ack_received(
        &mut self,
        now: Timestamp,
        level: Level,
        largest: u64,
        delay_ms: u64,
        ranges: &[(u64, u64)],
        sink: &mut dyn TransportEvents,
    ) -> Result<()> {
        let space = &mut self.levels[level.index()];
        if space.largest_acked.map_or(true, |l| largest > l) {
            space.largest_acked = Some(largest);
        }

        let mut newly_acked: Vec<(u64, SentPacket)> = Vec::new();
        for &(start, end) in ranges {
            let pns: Vec<u64> = space
                .sent
                .range(start..end)
                .map(|(&pn, _)| pn)
                .collect();
            for pn in pns {
                if let Some(sent) = space.sent.remove(&pn) {
                    newly_acked.push((pn, sent));
                }
            }
        }
        if newly_acked.is_empty() {
            return Ok(());
        }

        // RTT sample from the largest newly acked packet.
        if let Some((pn, sent)) = newly_acked.iter().max_by_key(|(pn, _)| *pn) {
            if *pn == largest && sent.ack_eliciting {
                let rtt = now.millis_since(sent.time).max(1);
                self.rtt.sample(rtt, delay_ms);
            }
        }

        for (_, sent) in &newly_acked {
            if sent.ack_eliciting {
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(sent.size);
                // Slow start growth, clamped at the slow-start threshold.
                if self.cwnd < self.ssthresh {
                    self.cwnd += sent.size;
                }
            }
        }

        // Frame-level acknowledgment effects.
        let space = &mut self.levels[level.index()];
        let mut crypto_advance = 0u64;
        let mut stream_acks: Vec<(u64, u64, u64, bool)> = Vec::new();
        for (_, sent) in &newly_acked {
            for frame in &sent.frames {
                match frame {
                    SentFrame::Crypto { offset, len } => {
                        space.crypto_acked.insert(*offset, offset + len);
                    }
                    SentFrame::Stream { id, offset, len, fin } => {
                        stream_acks.push((*id, *offset, *len, *fin));
                    }
                    SentFrame::Control(_) => {}
                }
            }
        }
        let new_mark = space.crypto_acked.advance(space.crypto_ack_watermark);
        if new_mark > space.crypto_ack_watermark {
            crypto_advance = new_mark - space.crypto_ack_watermark;
            space.crypto_ack_watermark = new_mark;
        }
        if crypto_advance > 0 {
            sink.on_crypto_acked(level, crypto_advance);
        }
        for (id, offset, len, fin) in stream_acks {
            sink.on_stream_acked(id, offset, len, fin);
        }

        // Packet-threshold loss: anything more than the reorder window
        // below the largest acked packet is lost.
        self.detect_lost(level, now);
        Ok(())
    }

    fn detect_lost(&mut self, level: Level, now: Timestamp) {
        let loss_delay = (self.rtt.smoothed_ms.max(self.rtt.latest_ms) * 9 / 8).max(1);
        let removed = {
            let space = &mut self.levels[level.index()];
            let largest_acked = match space.largest_acked {
                Some(l) => l,
                None => return,
            };
            let lost_pns: Vec<u64> = space
                .sent
                .iter()
                .filter(|(&pn, sent)| {
                    pn + LOSS_REORDER_THRESHOLD <= largest_acked
                        || (pn <= largest_acked && now.millis_since(sent.time) >= loss_delay)
                })
                .map(|(&pn, _)| pn)
                .collect();
            let mut removed = Vec::with_capacity(lost_pns.len());
            for pn in lost_pns {
                if let Some(sent) = space.sent.remove(&pn) {
                    removed.push(sent);
                }
            }
            removed
        };
        if removed.is_empty() {
            return;
        }
        let mut lost_bytes = 0u64;
        let count = removed.len();
        for sent in removed {
            if sent.ack_eliciting {
                lost_bytes += sent.size;
            }
            for frame in sent.frames {
                self.lost.push_back((level, frame));
            }
            self.lost_packets += 1;
        }
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(lost_bytes);
        if lost_bytes > 0 {
            // Multiplicative decrease, once per loss batch.
            self.ssthresh = (self.cwnd / 2).max(MIN_CWND);
            self.cwnd = self.ssthresh;
        }
        trace!(level = ?level, lost = count, "marked packets lost");
    }

    fn peer_max_ack_delay(&self) -> u64 {
        self.params_peer
            .as_ref()
            .map(|p| p.max_ack_delay_ms)
            .unwrap_or(DEFAULT_MAX_ACK_DELAY_MS)
    }

    // ------------------------------------------------------------------
    // Expiries
    // ------------------------------------------------------------------

    /// Absolute idle deadline; `None` when idle timeout is disabled.
    pub fn idle_expiry(&self) -> Option<Timestamp> {
        let timeout = self.idle_timeout_ms();
        if timeout == 0 {
            return None;
        }
        Some(self.last_activity.saturating_add_millis(timeout))
    }

    /// Earliest loss-detection or ack-delay deadline.
    pub fn retransmit_expiry(&self) -> Option<Timestamp> {
        let pto = self.rtt.pto_ms(self.peer_max_ack_delay());
        let mut expiry: Option<Timestamp> = None;
        let mut fold = |candidate: Timestamp| {
            expiry = Some(match expiry {
                Some(e) => e.min(candidate),
                None => candidate,
            });
        };
        for space in &self.levels {
            if space.discarded {
                continue;
            }
            if let Some(oldest) = space.sent.values().map(|s| s.time).min() {
                fold(oldest.saturating_add_millis(pto));
            }
            if space.ack_pending {
                fold(
                    space
                        .largest_recv_time
                        .saturating_add_millis(self.params_local.max_ack_delay_ms),
                );
            }
        }
        if let Some((_, started)) = self.challenge {
            fold(started.saturating_add_millis(3 * pto));
        }
        expiry
    }

    /// Closing/draining period length (RFC 9000 Section 10.2: 3 PTO).
    pub fn drain_period_ms(&self) -> u64 {
        3 * self.rtt.pto_ms(self.peer_max_ack_delay())
    }

    /// Resolve a retransmit-timer expiry: declare timed-out packets
    /// lost, or surface an ack-delay flush.
    pub fn handle_retransmit_timeout(
        &mut self,
        now: Timestamp,
        sink: &mut dyn TransportEvents,
    ) -> TimeoutKind {
        let pto = self.rtt.pto_ms(self.peer_max_ack_delay());

        if let Some((_, started)) = self.challenge {
            if now.millis_since(started) >= 3 * pto {
                self.challenge = None;
                sink.on_path_validation(false);
            }
        }

        let mut lost_total = 0u64;
        for idx in 0..Level::COUNT {
            let level = match Level::from_index(idx) {
                Some(l) => l,
                None => continue,
            };
            let removed = {
                let space = &mut self.levels[idx];
                let expired: Vec<u64> = space
                    .sent
                    .iter()
                    .filter(|(_, sent)| now.millis_since(sent.time) >= pto)
                    .map(|(&pn, _)| pn)
                    .collect();
                let mut removed = Vec::with_capacity(expired.len());
                for pn in expired {
                    if let Some(sent) = space.sent.remove(&pn) {
                        removed.push(sent);
                    }
                }
                removed
            };
            let mut lost_bytes = 0u64;
            for sent in removed {
                if sent.ack_eliciting {
                    lost_bytes += sent.size;
                }
                for frame in sent.frames {
                    self.lost.push_back((level, frame));
                }
                lost_total += 1;
                self.lost_packets += 1;
            }
            self.bytes_in_flight = self.bytes_in_flight.saturating_sub(lost_bytes);
        }

        if lost_total > 0 {
            self.ssthresh = (self.cwnd / 2).max(MIN_CWND);
            self.cwnd = self.ssthresh;
            return TimeoutKind::Loss {
                packets: lost_total,
            };
        }
        if self.levels.iter().any(|s| s.ack_pending) {
            return TimeoutKind::AckDelay;
        }
        TimeoutKind::Idle
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    fn long_overhead(&self, level: Level) -> usize {
        // flags + version + cid lengths + cids + length varint + pn.
        let token_len = if level == Level::Initial && self.side.is_client() {
            VarIntCodec::size(self.token.len() as u64) + self.token.len()
        } else {
            1
        };
        1 + 4 + 1 + self.dcid.len() + 1 + self.scid.len() + token_len + 2 + PN_LEN
    }

    fn payload_budget(&self, level: Level) -> usize {
        let overhead = match level {
            Level::Application => 1 + self.dcid.len() + PN_LEN,
            _ => self.long_overhead(level),
        };
        self.mtu
            .saturating_sub(overhead)
            .saturating_sub(crate::crypto::PROTECTION_TAG_LEN)
    }

    fn congestion_room(&self) -> u64 {
        self.cwnd.saturating_sub(self.bytes_in_flight)
    }

    /// Serialize one packet of stream data (plus any pending ACK at the
    /// application level). The session loops this per stream.
    pub fn write_stream(&mut self, now: Timestamp, stream: &mut Stream) -> Result<StreamWrite> {
        if self.levels[Level::Application.index()].next_pn > MAX_PACKET_NUMBER {
            return Err(Error::PktNumExhausted);
        }
        if !self.levels[Level::Application.index()].keys_ready() {
            return Ok(StreamWrite::Nothing);
        }

        let queue = &stream.outbound;
        let pending_fin = queue.is_ended()
            && !stream.flags().is_set(crate::stream::StreamFlags::HAS_SENT_FIN);
        if queue.remaining() == 0 && !pending_fin {
            return Ok(StreamWrite::Nothing);
        }

        // Gates: congestion, connection flow control, stream flow control.
        if self.congestion_room() < 64 {
            return Ok(StreamWrite::CongestionLimited);
        }
        let budget = self.payload_budget(Level::Application);
        let frame_overhead = 1 + 8 + 8 + 4; // type + id + offset + len varints
        let mut max_len = budget.saturating_sub(frame_overhead) as u64;
        max_len = max_len.min(self.congestion_room());

        let conn_room = self.max_data_left();
        let stream_room = stream.max_send_data.saturating_sub(queue.sent_offset());
        let sendable = queue.remaining().min(max_len);
        let allowed = sendable.min(conn_room).min(stream_room);
        if allowed == 0 && queue.remaining() > 0 {
            self.block_count += 1;
            if conn_room == 0 {
                self.control.push_back(Frame::DataBlocked(self.max_data_peer));
            } else {
                self.control.push_back(Frame::StreamDataBlocked {
                    stream_id: stream.id(),
                    limit: stream.max_send_data,
                });
            }
            return Ok(StreamWrite::DataBlocked);
        }

        let offset = queue.sent_offset();
        let mut gathered: SmallVec<[Bytes; 4]> = SmallVec::new();
        let n = queue.read_at(offset, allowed as usize, &mut gathered) as u64;
        let fin = pending_fin && n == queue.remaining();
        if n == 0 && !fin {
            return Ok(StreamWrite::Nothing);
        }

        let mut data = Vec::with_capacity(n as usize);
        for chunk in gathered {
            data.extend_from_slice(&chunk);
        }

        let mut frames = Vec::with_capacity(2);
        if self.levels[Level::Application.index()].ack_pending {
            if let Some(ack) = self.build_ack_frame(Level::Application, now) {
                frames.push(ack);
            }
        }
        frames.push(Frame::Stream {
            stream_id: stream.id(),
            offset,
            data: Bytes::from(data),
            fin,
        });

        let buf = self.seal_packet(Level::Application, &frames, now, "stream-data")?;
        stream.outbound.seek(n);
        self.tx_data += n;
        Ok(StreamWrite::Packet {
            buf,
            consumed: n,
            fin,
        })
    }

    /// Serialize pending ACKs, crypto data, lost-frame retransmissions,
    /// and control frames, level by level, until nothing remains or the
    /// congestion window closes.
    pub fn write_packets(
        &mut self,
        now: Timestamp,
        crypto: &CryptoBuffers,
        streams: &mut StreamTable,
    ) -> Result<Vec<PacketBuf>> {
        let mut out = Vec::new();
        for idx in 0..Level::COUNT {
            let level = match Level::from_index(idx) {
                Some(l) => l,
                None => continue,
            };
            if !self.levels[idx].keys_ready() {
                continue;
            }
            loop {
                if self.levels[idx].next_pn > MAX_PACKET_NUMBER {
                    return Err(Error::PktNumExhausted);
                }
                let mut frames: Vec<Frame> = Vec::new();
                let mut budget = self.payload_budget(level);
                let mut ack_only = true;

                if self.levels[idx].ack_pending {
                    if let Some(ack) = self.build_ack_frame(level, now) {
                        let mut probe = Vec::new();
                        ack.encode(&mut probe);
                        budget = budget.saturating_sub(probe.len());
                        frames.push(ack);
                    }
                }

                let congestion_open = self.congestion_room() >= 64;

                // Crypto data for this level.
                if congestion_open {
                    let queue = crypto.queue(level);
                    let next = self.levels[idx].crypto_tx_next;
                    if next < queue.end_offset() && budget > 24 {
                        let want = (queue.end_offset() - next).min((budget - 24) as u64);
                        let mut gathered: SmallVec<[Bytes; 4]> = SmallVec::new();
                        let n = queue.read_at(next, want as usize, &mut gathered) as u64;
                        if n > 0 {
                            let mut data = Vec::with_capacity(n as usize);
                            for chunk in gathered {
                                data.extend_from_slice(&chunk);
                            }
                            frames.push(Frame::Crypto {
                                offset: next,
                                data: Bytes::from(data),
                            });
                            self.levels[idx].crypto_tx_next += n;
                            budget = budget.saturating_sub(n as usize + 24);
                            ack_only = false;
                        }
                    }
                }

                // Lost-frame retransmissions for this level.
                if congestion_open {
                    let mut requeue: VecDeque<(Level, SentFrame)> = VecDeque::new();
                    while let Some((lvl, frame)) = self.lost.pop_front() {
                        if lvl != level {
                            requeue.push_back((lvl, frame));
                            continue;
                        }
                        if budget < 48 {
                            requeue.push_back((lvl, frame));
                            break;
                        }
                        if let Some(rebuilt) =
                            self.rebuild_lost_frame(level, &frame, crypto, streams)
                        {
                            let mut probe = Vec::new();
                            rebuilt.encode(&mut probe);
                            if probe.len() > budget {
                                requeue.push_back((lvl, frame));
                                break;
                            }
                            budget -= probe.len();
                            frames.push(rebuilt);
                            ack_only = false;
                        }
                    }
                    for item in requeue.into_iter().rev() {
                        self.lost.push_front(item);
                    }
                }

                // Control frames ride the application level.
                if level == Level::Application && congestion_open {
                    if self.ping_pending {
                        frames.push(Frame::Ping);
                        self.ping_pending = false;
                        ack_only = false;
                    }
                    while let Some(frame) = self.control.pop_front() {
                        let mut probe = Vec::new();
                        frame.encode(&mut probe);
                        if probe.len() > budget {
                            self.control.push_front(frame);
                            break;
                        }
                        budget -= probe.len();
                        frames.push(frame);
                        ack_only = false;
                    }
                }

                if frames.is_empty() {
                    break;
                }
                let label = if ack_only { "ack" } else { "control" };
                out.push(self.seal_packet(level, &frames, now, label)?);
                if ack_only {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn rebuild_lost_frame(
        &self,
        level: Level,
        frame: &SentFrame,
        crypto: &CryptoBuffers,
        streams: &mut StreamTable,
    ) -> Option<Frame> {
        match frame {
            SentFrame::Crypto { offset, len } => {
                let queue = crypto.queue(level);
                if *offset < queue.base_offset() {
                    return None; // already acknowledged
                }
                let mut gathered: SmallVec<[Bytes; 4]> = SmallVec::new();
                let n = queue.read_at(*offset, *len as usize, &mut gathered);
                if n == 0 {
                    return None;
                }
                let mut data = Vec::with_capacity(n);
                for chunk in gathered {
                    data.extend_from_slice(&chunk);
                }
                Some(Frame::Crypto {
                    offset: *offset,
                    data: Bytes::from(data),
                })
            }
            SentFrame::Stream { id, offset, len, fin } => {
                let stream = streams.get(*id)?;
                let queue = &stream.outbound;
                if *offset < queue.base_offset() && *len > 0 {
                    return None;
                }
                let mut gathered: SmallVec<[Bytes; 4]> = SmallVec::new();
                let n = queue.read_at(*offset, *len as usize, &mut gathered);
                if n == 0 && !*fin {
                    return None;
                }
                let mut data = Vec::with_capacity(n);
                for chunk in gathered {
                    data.extend_from_slice(&chunk);
                }
                Some(Frame::Stream {
                    stream_id: *id,
                    offset: *offset,
                    data: Bytes::from(data),
                    fin: *fin,
                })
            }
            SentFrame::Control(frame) => Some(frame.clone()),
        }
    }

    fn build_ack_frame(&mut self, level: Level, now: Timestamp) -> Option<Frame> {
        let space = &mut self.levels[level.index()];
        let largest = space.largest_recv?;
        let ranges: Vec<(u64, u64)> = space.recv.iter_descending().collect();
        if ranges.is_empty() {
            return None;
        }
        space.ack_pending = false;
        Some(Frame::Ack {
            largest,
            delay_ms: now.millis_since(space.largest_recv_time),
            ranges,
        })
    }

    /// Build a CONNECTION_CLOSE packet at the best available level.
    pub fn build_close_packet(
        &mut self,
        now: Timestamp,
        error: QuicError,
        reason: &[u8],
    ) -> Result<PacketBuf> {
        let level = if self.levels[Level::Application.index()].keys_ready() {
            Level::Application
        } else if self.levels[Level::Handshake.index()].keys_ready() {
            Level::Handshake
        } else {
            Level::Initial
        };
        let frame = Frame::ConnectionClose {
            application: matches!(error.family, crate::error::ErrorFamily::Application),
            error_code: error.wire_code(),
            frame_type: 0,
            reason: Bytes::copy_from_slice(reason),
        };
        self.seal_packet(level, &[frame], now, "connection-close")
    }

    fn seal_packet(
        &mut self,
        level: Level,
        frames: &[Frame],
        now: Timestamp,
        label: &'static str,
    ) -> Result<PacketBuf> {
        let tx = self.levels[level.index()]
            .tx
            .clone()
            .ok_or(Error::InvalidState("no tx keys"))?;
        let pn = self.levels[level.index()].next_pn;
        if pn > MAX_PACKET_NUMBER {
            return Err(Error::PktNumExhausted);
        }

        let mut payload = Vec::with_capacity(self.mtu);
        let mut ack_eliciting = false;
        let mut sent_frames: SmallVec<[SentFrame; 4]> = SmallVec::new();
        for frame in frames {
            ack_eliciting |= frame.is_ack_eliciting();
            frame.encode(&mut payload);
            match frame {
                Frame::Crypto { offset, data } => sent_frames.push(SentFrame::Crypto {
                    offset: *offset,
                    len: data.len() as u64,
                }),
                Frame::Stream {
                    stream_id,
                    offset,
                    data,
                    fin,
                } => sent_frames.push(SentFrame::Stream {
                    id: *stream_id,
                    offset: *offset,
                    len: data.len() as u64,
                    fin: *fin,
                }),
                Frame::Ack { .. } | Frame::Padding | Frame::ConnectionClose { .. } => {}
                other => sent_frames.push(SentFrame::Control(other.clone())),
            }
        }

        // Long-header datagrams are padded to the minimum Initial size so
        // anti-amplification floors hold on every handshake datagram.
        if level != Level::Application {
            let overhead = self.long_overhead(level) + crate::crypto::PROTECTION_TAG_LEN;
            let want = MIN_INITIAL_SIZE.saturating_sub(overhead);
            while payload.len() < want {
                payload.push(0x00);
            }
        }

        let header = match level {
            Level::Initial => packet::long_header_bytes(
                PacketType::Initial,
                self.version,
                &self.dcid,
                &self.scid,
                if self.side.is_client() { &self.token } else { &[] },
                pn,
                payload.len() + crate::crypto::PROTECTION_TAG_LEN,
            ),
            Level::Handshake => packet::long_header_bytes(
                PacketType::Handshake,
                self.version,
                &self.dcid,
                &self.scid,
                &[],
                pn,
                payload.len() + crate::crypto::PROTECTION_TAG_LEN,
            ),
            Level::Application => packet::short_header_bytes(&self.dcid, self.key_phase, pn),
        };
        let sealed = tx.seal(pn, &header, &payload);

        let total = header.len() + sealed.len();
        let mut buf = PacketBuf::new(total, label);
        buf.space()[..header.len()].copy_from_slice(&header);
        buf.space()[header.len()..total].copy_from_slice(&sealed);
        buf.set_len(total);

        let space = &mut self.levels[level.index()];
        space.next_pn += 1;
        space.sent.insert(
            pn,
            SentPacket {
                size: total as u64,
                time: now,
                ack_eliciting,
                frames: sent_frames,
            },
        );
        if ack_eliciting {
            self.bytes_in_flight += total as u64;
            self.max_bytes_in_flight = self.max_bytes_in_flight.max(self.bytes_in_flight);
        }
        self.last_activity = now;
        trace!(level = ?level, pn, size = total, label, "sealed packet");
        Ok(buf)
    }
}

#[cfg(test)]
mod tests;
