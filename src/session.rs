//! # Session: per-connection lifecycle engine
//!
//! A session owns one connection end to end: it feeds datagrams into the
//! transport machine, drives the TLS provider with inbound crypto data,
//! walks streams on the send path, runs the closing/draining protocol,
//! and accounts statistics. Lifecycle is a flag set:
//!
//! ```text
//! initial -> handshaking -> established -> graceful_closing?
//!         -> closing -> draining -> destroyed
//! ```
//!
//! Application-visible activity is queued as [`SessionEvent`]s; the
//! endpoint drains them after every operation. Operations that would
//! reenter the transport machine from inside one of its callbacks are
//! deferred via the in-callback guard.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::buffer::PacketBuf;
use crate::crypto::{
    ClientHello, CryptoBuffers, DriveStatus, HandshakeConfig, HandshakeEvents, HandshakeFlow,
    HandshakeSummary, Level, TlsProvider,
};
use crate::error::{codes, Error, QuicError, Result};
use crate::packet::Frame;
use crate::stream::{Stream, StreamFlags, StreamTable};
use crate::timer::TimerKind;
use crate::transport::{
    ReadOutcome, StreamWrite, TimeoutKind, Transport, TransportEvents, TransportParams,
};
use crate::types::{
    stream_id, ConnectionId, Side, StatelessResetToken, StreamDirection, Timestamp, QUIC_VERSION,
};

// ============================================================================
// Flags
// ============================================================================

/// Session lifecycle flags (non-exclusive combinations occur).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionFlags(u32);

impl SessionFlags {
    pub const INITIAL: u32 = 0x01;
    pub const HANDSHAKING: u32 = 0x02;
    pub const ESTABLISHED: u32 = 0x04;
    pub const GRACEFUL_CLOSING: u32 = 0x08;
    pub const CLOSING: u32 = 0x10;
    pub const DRAINING: u32 = 0x20;
    pub const DESTROYED: u32 = 0x40;
    pub const SILENT_CLOSE: u32 = 0x80;
    pub const STATELESS_RESET: u32 = 0x100;
    pub const IDLE_TIMEOUT: u32 = 0x200;

    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }

    pub fn clear(&mut self, flag: u32) {
        self.0 &= !flag;
    }

    pub fn is_set(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }
}

// ============================================================================
// Configuration, statistics, events
// ============================================================================

/// Per-session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Offered protocols (client) or acceptable protocols (server).
    pub alpn: Vec<Bytes>,
    /// SNI sent by clients.
    pub server_name: Option<String>,
    pub transport_params: TransportParams,
    /// Cap on buffered outbound crypto bytes (floored at the minimum).
    pub max_crypto_buffer: u64,
    /// Verify the peer certificate identity against the hostname
    /// (client; on by default, disable only for debugging).
    pub verify_hostname_identity: bool,
    /// Request stapled OCSP from the server (client).
    pub request_ocsp: bool,
    /// Resumption ticket from an earlier connection (client).
    pub session_ticket: Option<Bytes>,
    /// Surface TLS keylog lines as events.
    pub keylog: bool,
    /// Surface ClientHello as a suspending event (server).
    pub client_hello_events: bool,
    /// Surface certificate requests as a suspending event (server).
    pub cert_request_events: bool,
    /// QUIC version to offer (clients; diagnostics only).
    pub quic_version: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            alpn: Vec::new(),
            server_name: None,
            transport_params: TransportParams::default(),
            max_crypto_buffer: 256 * 1024,
            verify_hostname_identity: true,
            request_ocsp: false,
            session_ticket: None,
            keylog: false,
            client_hello_events: false,
            cert_request_events: false,
            quic_version: QUIC_VERSION,
        }
    }
}

/// Fixed-layout session statistics. Timestamps are milliseconds on the
/// endpoint clock; [`SessionStats::as_array`] exposes the counters in a
/// stable order for flat export.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub created_at: u64,
    pub handshake_start_at: u64,
    pub handshake_send_at: u64,
    pub handshake_continue_at: u64,
    pub handshake_completed_at: u64,
    pub handshake_confirmed_at: u64,
    pub handshake_acked_at: u64,
    pub sent_at: u64,
    pub received_at: u64,
    pub closing_at: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub bidi_stream_count: u64,
    pub uni_stream_count: u64,
    pub streams_in_count: u64,
    pub streams_out_count: u64,
    pub keyupdate_count: u64,
    pub retry_count: u64,
    pub loss_retransmit_count: u64,
    pub ack_delay_retransmit_count: u64,
    pub path_validation_success_count: u64,
    pub path_validation_failure_count: u64,
    pub max_bytes_in_flight: u64,
    pub block_count: u64,
    pub min_rtt: u64,
    pub latest_rtt: u64,
    pub smoothed_rtt: u64,
}

impl SessionStats {
    pub const COUNT: usize = 27;

    pub fn as_array(&self) -> [u64; Self::COUNT] {
        [
            self.created_at,
            self.handshake_start_at,
            self.handshake_send_at,
            self.handshake_continue_at,
            self.handshake_completed_at,
            self.handshake_confirmed_at,
            self.handshake_acked_at,
            self.sent_at,
            self.received_at,
            self.closing_at,
            self.bytes_received,
            self.bytes_sent,
            self.bidi_stream_count,
            self.uni_stream_count,
            self.streams_in_count,
            self.streams_out_count,
            self.keyupdate_count,
            self.retry_count,
            self.loss_retransmit_count,
            self.ack_delay_retransmit_count,
            self.path_validation_success_count,
            self.path_validation_failure_count,
            self.max_bytes_in_flight,
            self.block_count,
            self.min_rtt,
            self.latest_rtt,
            self.smoothed_rtt,
        ]
    }
}

/// Application-visible session events, drained through the endpoint.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Server: a ClientHello arrived and processing is parked until
    /// `on_client_hello_done`.
    ClientHello {
        alpn: Vec<Bytes>,
        server_name: Option<String>,
        cipher_list: Vec<String>,
    },
    /// Server: certificate selection parked until `on_cert_done`.
    CertRequest { server_name: Option<String> },
    /// TLS handshake finished; verification results included.
    Handshake {
        alpn: Option<Bytes>,
        cipher: Option<String>,
        cipher_version: Option<String>,
        server_name: Option<String>,
        verify_code: u64,
        verify_reason: Option<String>,
    },
    Keylog(Bytes),
    PathValidation {
        success: bool,
        remote: SocketAddr,
    },
    /// Tear-down with no frame on the wire.
    SilentClose { stateless_reset: bool },
    /// Connection closed (local fatal, app close, or peer close).
    SessionClose { error: QuicError, reason: Bytes },
    SessionTicket(Bytes),
    VersionNegotiation {
        offered: Vec<u32>,
        supported: Vec<u32>,
    },
    /// A peer-initiated stream came into existence.
    StreamReady {
        id: u64,
        origin: Side,
        direction: StreamDirection,
    },
    StreamData {
        id: u64,
        data: Bytes,
        fin: bool,
    },
    StreamClose { id: u64 },
    StreamReset {
        id: u64,
        error_code: u64,
        final_size: u64,
    },
}

// ============================================================================
// Transport sink
// ============================================================================

/// Buffered effects of one `read_datagram`/timeout pass. Sink callbacks
/// only record; the session applies them after the machine returns,
/// which is what keeps the reentrancy rules trivially true.
#[derive(Default)]
struct SinkBuffer {
    crypto: Vec<(Level, Bytes)>,
    crypto_acked: Vec<(Level, u64)>,
    stream_frames: Vec<(u64, u64, Bytes, bool)>,
    stream_acked: Vec<(u64, u64, u64, bool)>,
    resets: Vec<(u64, u64, u64)>,
    stop_sending: Vec<(u64, u64)>,
    max_stream_data: Vec<(u64, u64)>,
    close: Option<(QuicError, Bytes)>,
    handshake_done: bool,
    new_peer_cids: Vec<(u64, ConnectionId, StatelessResetToken)>,
    retired_cids: Vec<u64>,
    new_tokens: Vec<Bytes>,
    path_results: Vec<bool>,
}

impl TransportEvents for SinkBuffer {
    fn on_crypto_data(&mut self, level: Level, data: Bytes) {
        self.crypto.push((level, data));
    }

    fn on_crypto_acked(&mut self, level: Level, amount: u64) {
        self.crypto_acked.push((level, amount));
    }

    fn on_stream_frame(&mut self, id: u64, offset: u64, data: Bytes, fin: bool) {
        self.stream_frames.push((id, offset, data, fin));
    }

    fn on_stream_acked(&mut self, id: u64, offset: u64, len: u64, fin: bool) {
        self.stream_acked.push((id, offset, len, fin));
    }

    fn on_reset_stream(&mut self, id: u64, error_code: u64, final_size: u64) {
        self.resets.push((id, error_code, final_size));
    }

    fn on_stop_sending(&mut self, id: u64, error_code: u64) {
        self.stop_sending.push((id, error_code));
    }

    fn on_max_stream_data(&mut self, id: u64, maximum: u64) {
        self.max_stream_data.push((id, maximum));
    }

    fn on_connection_close(&mut self, error: QuicError, reason: Bytes) {
        self.close = Some((error, reason));
    }

    fn on_handshake_done(&mut self) {
        self.handshake_done = true;
    }

    fn on_new_connection_id(&mut self, sequence: u64, cid: ConnectionId, token: StatelessResetToken) {
        self.new_peer_cids.push((sequence, cid, token));
    }

    fn on_retire_connection_id(&mut self, sequence: u64) {
        self.retired_cids.push(sequence);
    }

    fn on_new_token(&mut self, token: Bytes) {
        self.new_tokens.push(token);
    }

    fn on_path_validation(&mut self, success: bool) {
        self.path_results.push(success);
    }
}

/// Buffered effects of one TLS-provider drive.
#[derive(Default)]
struct HandshakeBuffer {
    secrets: Vec<(Level, Vec<u8>, Vec<u8>)>,
    out: Vec<(Level, Bytes)>,
    peer_params: Option<TransportParams>,
    client_hello: Option<ClientHello>,
    cert_request: Option<Option<String>>,
    keylog: Vec<Bytes>,
    complete: Option<HandshakeSummary>,
    tickets: Vec<Bytes>,
    client_hello_events: bool,
    cert_request_events: bool,
}

impl HandshakeEvents for HandshakeBuffer {
    fn on_secrets(&mut self, level: Level, rx_secret: &[u8], tx_secret: &[u8]) -> Result<()> {
        self.secrets
            .push((level, rx_secret.to_vec(), tx_secret.to_vec()));
        Ok(())
    }

    fn write_handshake(&mut self, level: Level, data: &[u8]) {
        self.out.push((level, Bytes::copy_from_slice(data)));
    }

    fn on_transport_params(&mut self, params: TransportParams) {
        self.peer_params = Some(params);
    }

    fn on_client_hello(&mut self, hello: &ClientHello) -> HandshakeFlow {
        if self.client_hello_events {
            self.client_hello = Some(hello.clone());
            HandshakeFlow::Suspend
        } else {
            HandshakeFlow::Proceed
        }
    }

    fn on_cert_request(&mut self, server_name: Option<&str>) -> HandshakeFlow {
        if self.cert_request_events {
            self.cert_request = Some(server_name.map(str::to_owned));
            HandshakeFlow::Suspend
        } else {
            HandshakeFlow::Proceed
        }
    }

    fn on_keylog(&mut self, line: &[u8]) {
        self.keylog.push(Bytes::copy_from_slice(line));
    }

    fn on_handshake_complete(&mut self, summary: HandshakeSummary) {
        self.complete = Some(summary);
    }

    fn on_session_ticket(&mut self, ticket: &[u8]) {
        self.tickets.push(Bytes::copy_from_slice(ticket));
    }
}

// ============================================================================
// Session
// ============================================================================

/// Exponential budget for retransmitting the cached close packet while
/// in the closing period: the 1st, 2nd, 4th, 8th, ... inbound datagram
/// each trigger one retransmission.
fn next_close_retransmit(current: u64) -> u64 {
    current.saturating_mul(2)
}

#[derive(Debug)]
pub struct Session {
    side: Side,
    flags: SessionFlags,
    config: SessionConfig,
    transport: Transport,
    tls: Box<dyn TlsProvider>,
    crypto: CryptoBuffers,
    streams: StreamTable,

    remote: SocketAddr,
    local: SocketAddr,

    events: VecDeque<SessionEvent>,
    tx_queue: VecDeque<PacketBuf>,

    stats: SessionStats,
    last_error: Option<QuicError>,

    close_packet: Option<Vec<u8>>,
    closing_recv_count: u64,
    closing_next_retransmit: u64,
    drain_deadline: Option<Timestamp>,

    in_callback: bool,
    deferred_send: bool,
    handshake_suspended: bool,

    /// Reset tokens the peer bound to its CIDs; the endpoint drains the
    /// tail it has not yet registered.
    peer_tokens: Vec<StatelessResetToken>,
    peer_tokens_taken: usize,
    /// Local CIDs (seq, cid) advertised to the peer.
    local_cids: Vec<(u64, ConnectionId)>,
    /// Local CIDs retired by the peer, pending endpoint dissociation.
    pending_retired_cids: Vec<ConnectionId>,
    next_cid_seq: u64,
    cid_pool_issued: bool,
    /// NEW_TOKEN payloads from the server, for future connections.
    resumption_tokens: Vec<Bytes>,
}

impl Session {
    pub fn new_client(
        config: SessionConfig,
        mut tls: Box<dyn TlsProvider>,
        scid: ConnectionId,
        dcid: ConnectionId,
        local: SocketAddr,
        remote: SocketAddr,
        now: Timestamp,
    ) -> Result<Self> {
        let mtu = mtu_for(&remote);
        let mut transport = Transport::new(
            Side::Client,
            scid,
            dcid,
            config.transport_params.clone(),
            mtu,
            now,
        );
        transport.set_version(config.quic_version);
        if let Some(ticket) = &config.session_ticket {
            tls.set_session(ticket)?;
        }
        tls.set_keylog_enabled(config.keylog);
        tls.init(
            Side::Client,
            HandshakeConfig {
                alpn: config.alpn.clone(),
                server_name: config.server_name.clone(),
                session_ticket: config.session_ticket.clone(),
                transport_params: config.transport_params.clone(),
                request_ocsp: config.request_ocsp,
            },
        )?;
        let mut session = Self::build(Side::Client, config, tls, transport, local, remote, now);
        session.flags.set(SessionFlags::INITIAL);
        Ok(session)
    }

    pub fn new_server(
        config: SessionConfig,
        mut tls: Box<dyn TlsProvider>,
        scid: ConnectionId,
        client_scid: ConnectionId,
        odcid: ConnectionId,
        local: SocketAddr,
        remote: SocketAddr,
        now: Timestamp,
    ) -> Result<Self> {
        let mtu = mtu_for(&remote);
        let transport = Transport::new_server(
            scid,
            client_scid,
            odcid,
            config.transport_params.clone(),
            mtu,
            now,
        );
        tls.set_keylog_enabled(config.keylog);
        tls.init(
            Side::Server,
            HandshakeConfig {
                alpn: config.alpn.clone(),
                server_name: None,
                session_ticket: None,
                transport_params: config.transport_params.clone(),
                request_ocsp: false,
            },
        )?;
        let mut session = Self::build(Side::Server, config, tls, transport, local, remote, now);
        session.flags.set(SessionFlags::INITIAL);
        Ok(session)
    }

    fn build(
        side: Side,
        config: SessionConfig,
        tls: Box<dyn TlsProvider>,
        transport: Transport,
        local: SocketAddr,
        remote: SocketAddr,
        now: Timestamp,
    ) -> Self {
        let crypto = CryptoBuffers::new(config.max_crypto_buffer);
        let mut stats = SessionStats::default();
        stats.created_at = now.as_millis();
        Self {
            side,
            flags: SessionFlags::default(),
            config,
            transport,
            tls,
            crypto,
            streams: StreamTable::new(),
            remote,
            local,
            events: VecDeque::new(),
            tx_queue: VecDeque::new(),
            stats,
            last_error: None,
            close_packet: None,
            closing_recv_count: 0,
            closing_next_retransmit: 1,
            drain_deadline: None,
            in_callback: false,
            deferred_send: false,
            handshake_suspended: false,
            peer_tokens: Vec::new(),
            peer_tokens_taken: 0,
            local_cids: Vec::new(),
            pending_retired_cids: Vec::new(),
            next_cid_seq: 1,
            cid_pool_issued: false,
            resumption_tokens: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    pub fn is_destroyed(&self) -> bool {
        self.flags.is_set(SessionFlags::DESTROYED)
    }

    pub fn is_closing_or_draining(&self) -> bool {
        self.flags
            .is_set(SessionFlags::CLOSING | SessionFlags::DRAINING)
    }

    pub fn is_established(&self) -> bool {
        self.flags.is_set(SessionFlags::ESTABLISHED)
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local
    }

    pub fn last_error(&self) -> Option<QuicError> {
        self.last_error
    }

    pub fn stats(&self) -> SessionStats {
        let mut stats = self.stats;
        stats.max_bytes_in_flight = self.transport.max_bytes_in_flight;
        stats.block_count = self.transport.block_count;
        stats.min_rtt = self.transport.min_rtt_ms();
        stats.latest_rtt = self.transport.latest_rtt_ms();
        stats.smoothed_rtt = self.transport.smoothed_rtt_ms();
        stats.keyupdate_count = self.transport.key_update_count();
        stats
    }

    pub fn scid(&self) -> ConnectionId {
        *self.transport.scid()
    }

    pub fn original_dcid(&self) -> ConnectionId {
        *self.transport.original_dcid()
    }

    pub fn alpn(&self) -> Option<Bytes> {
        self.tls.alpn()
    }

    pub fn peer_active_cid_limit(&self) -> u64 {
        self.transport
            .peer_params()
            .map(|p| p.active_connection_id_limit)
            .unwrap_or(crate::types::DEFAULT_ACTIVE_CID_LIMIT)
    }

    /// Exportable resumption ticket, once the provider has one.
    pub fn session_ticket(&self) -> Option<Bytes> {
        self.tls.session_ticket()
    }

    /// NEW_TOKEN values received from the server.
    pub fn resumption_tokens(&self) -> &[Bytes] {
        &self.resumption_tokens
    }

    /// Total heap bytes this session holds in buffers; feeds endpoint
    /// memory introspection.
    pub fn allocated_bytes(&self) -> u64 {
        let streams: u64 = self
            .streams
            .ids_in_order()
            .iter()
            .filter_map(|id| self.streams.get(*id))
            .map(|s| s.unacked_len())
            .sum();
        self.crypto.remaining_total() + streams + self.transport.allocated_bytes()
    }

    // ------------------------------------------------------------------
    // Endpoint plumbing
    // ------------------------------------------------------------------

    pub(crate) fn take_tx(&mut self) -> VecDeque<PacketBuf> {
        std::mem::take(&mut self.tx_queue)
    }

    pub(crate) fn take_events(&mut self) -> VecDeque<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn take_peer_tokens(&mut self) -> Vec<StatelessResetToken> {
        let new = self.peer_tokens[self.peer_tokens_taken..].to_vec();
        self.peer_tokens_taken = self.peer_tokens.len();
        new
    }

    pub(crate) fn take_retired_cids(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.pending_retired_cids)
    }

    pub(crate) fn local_cids(&self) -> Vec<ConnectionId> {
        self.local_cids.iter().map(|(_, cid)| *cid).collect()
    }

    /// Endpoint-issued pool CID: advertise it to the peer.
    pub(crate) fn add_local_cid(&mut self, cid: ConnectionId, token: StatelessResetToken) {
        let seq = self.next_cid_seq;
        self.next_cid_seq += 1;
        self.local_cids.push((seq, cid));
        self.transport.queue_control(Frame::NewConnectionId {
            sequence: seq,
            retire_prior_to: 0,
            cid,
            reset_token: token,
        });
    }

    pub(crate) fn cid_pool_issued(&self) -> bool {
        self.cid_pool_issued
    }

    pub(crate) fn mark_cid_pool_issued(&mut self) {
        self.cid_pool_issued = true;
    }

    /// Current timer deadlines, in [`TimerKind`] order
    /// (idle, retransmit, drain).
    pub(crate) fn timer_deadlines(&self) -> [Option<Timestamp>; 3] {
        if self.is_destroyed() {
            return [None, None, None];
        }
        if self.is_closing_or_draining() {
            return [None, None, self.drain_deadline];
        }
        [
            self.transport.idle_expiry(),
            self.transport.retransmit_expiry(),
            None,
        ]
    }

    // ------------------------------------------------------------------
    // Handshake driving
    // ------------------------------------------------------------------

    /// Kick off the client handshake: produce and send the first flight.
    pub fn start(&mut self, now: Timestamp) -> Result<()> {
        self.stats.handshake_start_at = now.as_millis();
        self.flags.clear(SessionFlags::INITIAL);
        self.flags.set(SessionFlags::HANDSHAKING);
        let mut hs = self.handshake_buffer();
        self.in_callback = true;
        let result = self.tls.start(&mut hs);
        self.in_callback = false;
        let status = result?;
        self.apply_handshake_buffer(hs, status, now)?;
        self.send_pending(now)
    }

    fn handshake_buffer(&self) -> HandshakeBuffer {
        HandshakeBuffer {
            client_hello_events: self.config.client_hello_events,
            cert_request_events: self.config.cert_request_events,
            ..HandshakeBuffer::default()
        }
    }

    fn process_crypto(&mut self, level: Level, data: Bytes, now: Timestamp) -> Result<()> {
        // While parked, the provider buffers input and emits nothing;
        // feeding it is still correct.
        if self.flags.is_set(SessionFlags::INITIAL) {
            self.stats.handshake_start_at = now.as_millis();
            self.flags.clear(SessionFlags::INITIAL);
            self.flags.set(SessionFlags::HANDSHAKING);
        }
        let mut hs = self.handshake_buffer();
        self.in_callback = true;
        let result = self.tls.read_write_crypto_data(level, &data, &mut hs);
        self.in_callback = false;
        let status = result.map_err(|err| {
            // All provider failures map to the crypto family.
            match err {
                Error::Crypto(alert) => Error::Crypto(alert),
                _ => Error::Crypto(80), // internal_error alert
            }
        })?;
        self.apply_handshake_buffer(hs, status, now)
    }

    fn apply_handshake_buffer(
        &mut self,
        hs: HandshakeBuffer,
        status: DriveStatus,
        now: Timestamp,
    ) -> Result<()> {
        if let Some(params) = hs.peer_params {
            if let Some(token) = params.stateless_reset_token {
                self.peer_tokens.push(token);
            }
            self.transport.apply_peer_params(params);
        }
        for (level, rx, tx) in &hs.secrets {
            self.transport.install_secrets(*level, rx, tx)?;
        }
        for (level, data) in hs.out {
            self.crypto.submit(level, data)?;
        }
        for line in hs.keylog {
            if self.config.keylog {
                self.events.push_back(SessionEvent::Keylog(line));
            }
        }
        for ticket in hs.tickets {
            self.events.push_back(SessionEvent::SessionTicket(ticket));
        }
        match status {
            DriveStatus::Ok => {
                self.handshake_suspended = false;
            }
            DriveStatus::WantClientHello => {
                self.handshake_suspended = true;
                if let Some(hello) = hs.client_hello {
                    self.events.push_back(SessionEvent::ClientHello {
                        alpn: hello.alpn,
                        server_name: hello.server_name,
                        cipher_list: hello.cipher_list,
                    });
                }
            }
            DriveStatus::WantX509Lookup => {
                self.handshake_suspended = true;
                if let Some(server_name) = hs.cert_request {
                    self.events
                        .push_back(SessionEvent::CertRequest { server_name });
                }
            }
        }
        if let Some(summary) = hs.complete {
            self.on_handshake_complete(summary, now)?;
        }
        Ok(())
    }

    fn on_handshake_complete(&mut self, summary: HandshakeSummary, now: Timestamp) -> Result<()> {
        if self.flags.is_set(SessionFlags::ESTABLISHED) {
            return Ok(());
        }

        // The negotiated ALPN must be one the application accepts;
        // otherwise the session transitions to closing with a
        // protocol-level error (no_application_protocol).
        let alpn_ok = match &summary.alpn {
            Some(alpn) => self.config.alpn.iter().any(|a| a == alpn),
            None => false,
        };
        if !alpn_ok {
            warn!(side = ?self.side, "handshake completed with unacceptable ALPN");
            let error = QuicError::crypto(120); // no_application_protocol
            self.last_error = Some(error);
            self.immediate_close(now, error, b"alpn mismatch");
            return Ok(());
        }

        self.flags.clear(SessionFlags::HANDSHAKING);
        self.flags.set(SessionFlags::ESTABLISHED);
        self.stats.handshake_completed_at = now.as_millis();
        self.transport.on_handshake_complete();
        if self.side.is_server() {
            self.stats.handshake_confirmed_at = now.as_millis();
        }

        // Peer identity verification is surfaced, not enforced: the
        // application decides whether to close on failure.
        let mut verify_code = self.tls.verify_peer_certificate();
        let mut verify_reason = None;
        if verify_code != 0 {
            verify_reason = Some("certificate verification failed".to_string());
        } else if self.side.is_client() && self.config.verify_hostname_identity {
            if let Some(hostname) = self.config.server_name.clone() {
                verify_code = self.tls.verify_hostname(&hostname);
                if verify_code != 0 {
                    verify_reason = Some("hostname identity mismatch".to_string());
                }
            }
        }

        debug!(side = ?self.side, alpn = ?summary.alpn, verify_code, "handshake complete");
        self.events.push_back(SessionEvent::Handshake {
            alpn: summary.alpn,
            cipher: summary.cipher,
            cipher_version: summary.cipher_version,
            server_name: summary.server_name,
            verify_code,
            verify_reason,
        });
        Ok(())
    }

    /// Resume a handshake parked on the ClientHello callout.
    pub fn on_client_hello_done(&mut self, now: Timestamp) -> Result<()> {
        if self.in_callback {
            return Err(Error::Reentry);
        }
        if !self.handshake_suspended {
            return Err(Error::InvalidState("handshake not suspended"));
        }
        self.stats.handshake_continue_at = now.as_millis();
        let mut hs = self.handshake_buffer();
        self.in_callback = true;
        let result = self.tls.on_client_hello_done(&mut hs);
        self.in_callback = false;
        let status = result?;
        self.apply_handshake_buffer(hs, status, now)?;
        self.send_pending(now)
    }

    /// Resume a handshake parked on certificate processing.
    pub fn on_cert_done(&mut self, ocsp_response: Option<Bytes>, now: Timestamp) -> Result<()> {
        if self.in_callback {
            return Err(Error::Reentry);
        }
        if !self.handshake_suspended {
            return Err(Error::InvalidState("handshake not suspended"));
        }
        self.stats.handshake_continue_at = now.as_millis();
        let mut hs = self.handshake_buffer();
        self.in_callback = true;
        let result = self.tls.on_cert_done(ocsp_response, &mut hs);
        self.in_callback = false;
        let status = result?;
        self.apply_handshake_buffer(hs, status, now)?;
        self.send_pending(now)
    }

    // ------------------------------------------------------------------
    // Receive pipeline
    // ------------------------------------------------------------------

    /// Feed one inbound datagram.
    pub fn receive(&mut self, now: Timestamp, remote: SocketAddr, data: &[u8]) {
        // Draining and destroyed sessions discard silently.
        if self
            .flags
            .is_set(SessionFlags::DESTROYED | SessionFlags::DRAINING)
        {
            return;
        }

        // In the closing period, inbound datagrams only pace the
        // retransmission of the cached CONNECTION_CLOSE.
        if self.flags.is_set(SessionFlags::CLOSING) {
            self.closing_recv_count += 1;
            if self.closing_recv_count == self.closing_next_retransmit {
                self.closing_next_retransmit =
                    next_close_retransmit(self.closing_next_retransmit);
                if let Some(close) = &self.close_packet {
                    let mut buf = PacketBuf::new(close.len(), "close-retransmit");
                    buf.space().copy_from_slice(close);
                    buf.set_len(close.len());
                    self.push_tx(buf, now);
                }
            }
            return;
        }

        self.stats.received_at = now.as_millis();
        self.stats.bytes_received += data.len() as u64;

        // Peer address snapshot; a change on an established session
        // kicks off path validation.
        if remote != self.remote {
            if self.is_established() {
                debug!(old = %self.remote, new = %remote, "peer address changed");
                self.remote = remote;
                self.transport.start_path_validation(now);
            } else {
                self.remote = remote;
            }
        }

        let mut sink = SinkBuffer::default();
        self.in_callback = true;
        let outcome = self.transport.read_datagram(now, data, &mut sink);
        self.in_callback = false;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(Error::PktNumExhausted) => {
                self.silent_close(now, false);
                return;
            }
            Err(err) => {
                self.set_last_error(err.quic_error());
                self.handle_error(now);
                return;
            }
        };

        if let Err(err) = self.apply_sink(sink, now) {
            match err {
                Error::PktNumExhausted => self.silent_close(now, false),
                err => {
                    self.set_last_error(err.quic_error());
                    self.handle_error(now);
                }
            }
            return;
        }

        match outcome {
            ReadOutcome::Normal => {}
            ReadOutcome::Draining => {
                // apply_sink already transitioned to draining.
                return;
            }
            ReadOutcome::VersionNegotiation(supported) => {
                self.events.push_back(SessionEvent::VersionNegotiation {
                    offered: vec![self.transport.version()],
                    supported,
                });
                self.silent_close(now, false);
                return;
            }
            ReadOutcome::Retry => {
                self.stats.retry_count += 1;
            }
            ReadOutcome::Undecryptable => {
                // The routed-session arm of stateless reset detection:
                // an unreadable datagram ending in a token the peer
                // bound to one of its CIDs is a reset.
                if self.matches_peer_reset_token(data) {
                    debug!("stateless reset received");
                    self.silent_close(now, true);
                }
                return;
            }
        }

        if self.is_destroyed() || self.is_closing_or_draining() {
            return;
        }
        if let Err(err) = self.send_pending(now) {
            self.set_last_error(err.quic_error());
            self.handle_error(now);
        }
    }

    fn matches_peer_reset_token(&self, data: &[u8]) -> bool {
        if data.len() < 16 {
            return false;
        }
        let tail = &data[data.len() - 16..];
        self.peer_tokens.iter().any(|t| t == tail)
    }

    fn apply_sink(&mut self, sink: SinkBuffer, now: Timestamp) -> Result<()> {
        // Acknowledgment effects first: they free buffer space.
        for (level, amount) in sink.crypto_acked {
            self.crypto.ack(level, amount);
            self.stats.handshake_acked_at = now.as_millis();
        }
        for (id, offset, len, fin) in sink.stream_acked {
            let mut remove = false;
            if let Some(stream) = self.streams.get_mut(id) {
                stream.on_ack(offset, len, fin);
                remove = stream.is_closed();
            }
            if remove {
                self.remove_stream(id);
            }
        }

        // Crypto before stream data: handshake progression may install
        // the keys the stream data arrived under.
        for (level, data) in sink.crypto {
            self.process_crypto(level, data, now)?;
        }

        for (id, offset, data, fin) in sink.stream_frames {
            self.handle_stream_frame(id, offset, data, fin, now)?;
        }
        for (id, error_code, final_size) in sink.resets {
            self.handle_reset_stream(id, error_code, final_size);
        }
        for (id, error_code) in sink.stop_sending {
            // Peer no longer wants the data: reset our sending side.
            let _ = self.shutdown_stream_inner(id, error_code, now);
        }
        for (id, maximum) in sink.max_stream_data {
            if let Some(stream) = self.streams.get_mut(id) {
                stream.max_send_data = stream.max_send_data.max(maximum);
            }
        }
        for (_seq, _cid, token) in sink.new_peer_cids {
            self.peer_tokens.push(token);
        }
        for seq in sink.retired_cids {
            if let Some(pos) = self.local_cids.iter().position(|(s, _)| *s == seq) {
                let (_, cid) = self.local_cids.remove(pos);
                self.pending_retired_cids.push(cid);
            }
        }
        for token in sink.new_tokens {
            self.resumption_tokens.push(token);
        }
        for success in sink.path_results {
            if success {
                self.stats.path_validation_success_count += 1;
            } else {
                self.stats.path_validation_failure_count += 1;
            }
            self.events.push_back(SessionEvent::PathValidation {
                success,
                remote: self.remote,
            });
        }
        if sink.handshake_done {
            self.stats.handshake_confirmed_at = now.as_millis();
        }

        if let Some((error, reason)) = sink.close {
            self.enter_draining(now, error, reason);
        }
        Ok(())
    }

    fn handle_stream_frame(
        &mut self,
        id: u64,
        offset: u64,
        data: Bytes,
        fin: bool,
        now: Timestamp,
    ) -> Result<()> {
        if !self.streams.contains(id) {
            if stream_id::initiator(id) == self.side {
                // Data for a local stream that no longer exists; stale.
                return Ok(());
            }
            // At most one stream object per peer-initiated ID over the
            // session's lifetime: a retransmission arriving after the
            // stream was torn down must not recreate it (or charge the
            // peer's stream budget twice).
            if self.streams.is_retired(id) {
                trace!(id, "dropping frame for retired stream");
                return Ok(());
            }
            // Stream-commit DoS mitigation: an empty frame without FIN
            // for an unknown peer stream allocates nothing.
            if data.is_empty() && !fin {
                trace!(id, "dropping empty stream frame for unknown stream");
                return Ok(());
            }
            self.transport.admit_remote_stream(id)?;
            let (max_send, max_recv) = self.transport.stream_limits(id, false);
            let stream = Stream::new_remote(id, self.side, max_send, max_recv);
            let origin = stream.origin();
            let direction = stream.direction();
            self.streams.insert(stream);
            self.count_new_stream(direction, false);
            self.events.push_back(SessionEvent::StreamReady {
                id,
                origin,
                direction,
            });
        }

        let deliveries = match self.streams.get_mut(id) {
            Some(stream) => stream.recv_push(offset, data, fin)?,
            None => return Ok(()),
        };
        let mut delivered_bytes = 0u64;
        let mut saw_fin = false;
        for (data, fin) in deliveries {
            delivered_bytes += data.len() as u64;
            saw_fin |= fin;
            self.events
                .push_back(SessionEvent::StreamData { id, data, fin });
        }
        if delivered_bytes > 0 {
            self.transport.on_data_consumed(delivered_bytes);
            self.maybe_extend_stream_window(id);
        }
        if saw_fin {
            self.maybe_remove_closed_stream(id, now);
        }
        Ok(())
    }

    fn maybe_extend_stream_window(&mut self, id: u64) {
        let frame = match self.streams.get_mut(id) {
            Some(stream) => {
                let window = match stream.direction() {
                    StreamDirection::Bidirectional => {
                        self.config.transport_params.initial_max_stream_data_bidi_remote
                    }
                    StreamDirection::Unidirectional => {
                        self.config.transport_params.initial_max_stream_data_uni
                    }
                }
                .max(1024);
                if stream.max_recv_data.saturating_sub(stream.recv_delivered) < window / 2 {
                    stream.max_recv_data = stream.recv_delivered + window;
                    Some(Frame::MaxStreamData {
                        stream_id: id,
                        maximum: stream.max_recv_data,
                    })
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some(frame) = frame {
            self.transport.queue_control(frame);
        }
    }

    fn handle_reset_stream(&mut self, id: u64, error_code: u64, final_size: u64) {
        let destroy = match self.streams.get_mut(id) {
            Some(stream) => {
                stream.on_reset_received();
                self.events.push_back(SessionEvent::StreamReset {
                    id,
                    error_code,
                    final_size,
                });
                // If the writable side is already finished the stream
                // is gone; otherwise it lingers until sending completes.
                stream.flags().is_set(StreamFlags::WRITABLE_CLOSED)
                    || stream.all_sent_and_acked()
            }
            None => false,
        };
        if destroy {
            self.remove_stream(id);
        }
    }

    fn maybe_remove_closed_stream(&mut self, id: u64, now: Timestamp) {
        let closed = self.streams.get(id).map_or(false, Stream::is_closed);
        if closed {
            self.remove_stream(id);
        }
        self.maybe_finish_graceful_close_at(now);
    }

    fn remove_stream(&mut self, id: u64) {
        if self.streams.remove(id).is_some() {
            self.events.push_back(SessionEvent::StreamClose { id });
        }
    }

    fn count_new_stream(&mut self, direction: StreamDirection, local_origin: bool) {
        match direction {
            StreamDirection::Bidirectional => self.stats.bidi_stream_count += 1,
            StreamDirection::Unidirectional => self.stats.uni_stream_count += 1,
        }
        // Origin-gated: exactly one of the two counters per stream.
        if local_origin {
            self.stats.streams_out_count += 1;
        } else {
            self.stats.streams_in_count += 1;
        }
    }

    // ------------------------------------------------------------------
    // Send pipeline
    // ------------------------------------------------------------------

    /// Flush pending stream data, acks, control frames, and probes.
    pub fn send_pending(&mut self, now: Timestamp) -> Result<()> {
        if self.in_callback {
            // Deferred until the callback unwinds.
            self.deferred_send = true;
            return Ok(());
        }
        if self
            .flags
            .is_set(SessionFlags::DESTROYED | SessionFlags::DRAINING | SessionFlags::CLOSING)
        {
            return Ok(());
        }

        // Streams first, in insertion order.
        for id in self.streams.ids_in_order() {
            self.send_stream_data(id, now)?;
            if self.is_destroyed() {
                return Ok(());
            }
        }

        // Then acks, crypto, retransmissions, and control frames.
        let packets = self
            .transport
            .write_packets(now, &self.crypto, &mut self.streams)?;
        let handshaking = !self.is_established();
        for buf in packets {
            if handshaking {
                self.stats.handshake_send_at = now.as_millis();
            }
            self.push_tx(buf, now);
        }
        Ok(())
    }

    fn send_stream_data(&mut self, id: u64, now: Timestamp) -> Result<()> {
        loop {
            let stream = match self.streams.get_mut(id) {
                Some(stream) => stream,
                // Stream vanished mid-loop: stop, success.
                None => return Ok(()),
            };
            if stream.flags().is_set(StreamFlags::RESET_SENT) {
                return Ok(());
            }
            match self.transport.write_stream(now, stream) {
                Ok(StreamWrite::Packet { buf, consumed, fin }) => {
                    trace!(id, consumed, fin, "stream packet");
                    if fin {
                        if let Some(stream) = self.streams.get_mut(id) {
                            stream.set_flag(StreamFlags::HAS_SENT_FIN);
                        }
                    }
                    self.push_tx(buf, now);
                }
                // Congestion or flow control: stop, succeed.
                Ok(StreamWrite::CongestionLimited) | Ok(StreamWrite::DataBlocked) => return Ok(()),
                Ok(StreamWrite::Nothing) => return Ok(()),
                Err(Error::PktNumExhausted) => {
                    self.silent_close(now, false);
                    return Ok(());
                }
                Err(err) => {
                    self.set_last_error(err.quic_error());
                    self.handle_error(now);
                    return Err(err);
                }
            }
        }
    }

    fn push_tx(&mut self, buf: PacketBuf, now: Timestamp) {
        self.stats.bytes_sent += buf.len() as u64;
        self.stats.sent_at = now.as_millis();
        self.tx_queue.push_back(buf);
    }

    // ------------------------------------------------------------------
    // Application operations
    // ------------------------------------------------------------------

    /// Open a local stream. Closing/draining/graceful sessions refuse.
    pub fn open_stream(&mut self, direction: StreamDirection, _now: Timestamp) -> Result<u64> {
        if self.in_callback {
            return Err(Error::Reentry);
        }
        if self.flags.is_set(
            SessionFlags::GRACEFUL_CLOSING
                | SessionFlags::CLOSING
                | SessionFlags::DRAINING
                | SessionFlags::DESTROYED,
        ) {
            return Err(Error::InvalidState("session is closing"));
        }
        let id = self.transport.alloc_stream_id(direction)?;
        let (max_send, max_recv) = self.transport.stream_limits(id, true);
        let stream = Stream::new_local(id, self.side, max_send, max_recv);
        self.streams.insert(stream);
        self.count_new_stream(direction, true);
        Ok(id)
    }

    /// Queue application data on a stream and flush.
    pub fn stream_write(&mut self, id: u64, data: Bytes, fin: bool, now: Timestamp) -> Result<()> {
        if self.in_callback {
            return Err(Error::Reentry);
        }
        let stream = self
            .streams
            .get_mut(id)
            .ok_or(Error::UnknownStream(id))?;
        stream.write(data, fin)?;
        self.send_pending(now)
    }

    /// Abruptly terminate a stream: RESET_STREAM for our sending side
    /// and STOP_SENDING for the peer's.
    pub fn shutdown_stream(&mut self, id: u64, error_code: u64, now: Timestamp) -> Result<()> {
        self.shutdown_stream_inner(id, error_code, now)?;
        // Inside a callback the state change stands but the flush is
        // skipped; the deferred send picks it up on unwind.
        if self.in_callback {
            self.deferred_send = true;
            return Ok(());
        }
        self.send_pending(now)
    }

    fn shutdown_stream_inner(&mut self, id: u64, error_code: u64, _now: Timestamp) -> Result<()> {
        let stream = self
            .streams
            .get_mut(id)
            .ok_or(Error::UnknownStream(id))?;
        let final_size = stream.outbound.sent_offset();
        let was_writable = stream.flags().is_set(StreamFlags::WAS_EVER_WRITABLE)
            && !stream.flags().is_set(StreamFlags::RESET_SENT);
        let readable_open = !stream.flags().is_set(StreamFlags::READABLE_CLOSED);
        stream.on_reset_sent();
        if was_writable {
            self.transport.queue_control(Frame::ResetStream {
                stream_id: id,
                error_code,
                final_size,
            });
        }
        if readable_open {
            self.transport.queue_control(Frame::StopSending {
                stream_id: id,
                error_code,
            });
        }
        Ok(())
    }

    /// Queue a PING frame (keep-alive / RTT probe).
    pub fn ping(&mut self, now: Timestamp) -> Result<()> {
        if self.in_callback {
            return Err(Error::Reentry);
        }
        if self.is_closing_or_draining() || self.is_destroyed() {
            return Err(Error::InvalidState("session is closing"));
        }
        self.transport.queue_ping();
        self.send_pending(now)
    }

    /// Initiate an application-level key update.
    pub fn update_key(&mut self, now: Timestamp) -> bool {
        if self.in_callback || self.is_closing_or_draining() || self.is_destroyed() {
            return false;
        }
        if !self.transport.initiate_key_update() {
            return false;
        }
        self.stats.keyupdate_count += 1;
        let _ = self.send_pending(now);
        true
    }

    /// Begin a graceful close: no new streams; existing streams finish,
    /// then the session closes with NO_ERROR.
    pub fn close_gracefully(&mut self, now: Timestamp) {
        if self.is_closing_or_draining() || self.is_destroyed() {
            return;
        }
        self.flags.set(SessionFlags::GRACEFUL_CLOSING);
        self.maybe_finish_graceful_close_at(now);
    }

    fn maybe_finish_graceful_close_at(&mut self, now: Timestamp) {
        if self.flags.is_set(SessionFlags::GRACEFUL_CLOSING)
            && !self.is_closing_or_draining()
            && self.streams.is_empty()
        {
            self.immediate_close(now, QuicError::session(codes::NO_ERROR), b"");
        }
    }

    /// Application- or error-initiated immediate close.
    pub fn close(&mut self, error: QuicError, reason: &[u8], now: Timestamp) {
        self.set_last_error(error);
        self.immediate_close(now, error, reason);
    }

    // ------------------------------------------------------------------
    // Close protocol
    // ------------------------------------------------------------------

    fn set_last_error(&mut self, error: QuicError) {
        if self.last_error.is_none() {
            self.last_error = Some(error);
        }
    }

    /// Local fatal error path: one CONNECTION_CLOSE attempt, then the
    /// closing period. A failure to build the close falls back to
    /// silent cleanup with an internal error.
    fn handle_error(&mut self, now: Timestamp) {
        let error = self.last_error.unwrap_or_else(QuicError::internal);
        self.immediate_close(now, error, b"");
    }

    /// Build and send CONNECTION_CLOSE once, then enter closing. The
    /// closing guard makes reentry a no-op (close idempotence).
    fn immediate_close(&mut self, now: Timestamp, error: QuicError, reason: &[u8]) {
        if self
            .flags
            .is_set(SessionFlags::CLOSING | SessionFlags::DRAINING | SessionFlags::DESTROYED)
        {
            return;
        }
        debug!(side = ?self.side, %error, "immediate close");
        self.flags.set(SessionFlags::CLOSING);
        self.stats.closing_at = now.as_millis();
        self.set_last_error(error);

        match self.transport.build_close_packet(now, error, reason) {
            Ok(buf) => {
                self.close_packet = Some(buf.as_ref().to_vec());
                self.push_tx(buf, now);
                self.drain_deadline =
                    Some(now.saturating_add_millis(self.transport.drain_period_ms()));
                self.closing_recv_count = 0;
                self.closing_next_retransmit = 1;
                self.events.push_back(SessionEvent::SessionClose {
                    error,
                    reason: Bytes::copy_from_slice(reason),
                });
            }
            Err(_) => {
                // Could not even serialize the close: silent cleanup.
                self.set_last_error(QuicError::internal());
                self.destroy(now);
            }
        }
    }

    /// Peer closed: drain silently for the drain period.
    fn enter_draining(&mut self, now: Timestamp, error: QuicError, reason: Bytes) {
        if self
            .flags
            .is_set(SessionFlags::DRAINING | SessionFlags::DESTROYED)
        {
            return;
        }
        debug!(side = ?self.side, %error, "draining (peer close)");
        self.flags.set(SessionFlags::DRAINING);
        self.set_last_error(error);
        self.drain_deadline = Some(now.saturating_add_millis(self.transport.drain_period_ms()));
        self.events
            .push_back(SessionEvent::SessionClose { error, reason });
    }

    /// Tear down with nothing on the wire (idle timeout, stateless
    /// reset, packet-number exhaustion).
    pub(crate) fn silent_close(&mut self, now: Timestamp, stateless_reset: bool) {
        if self.is_destroyed() {
            return;
        }
        self.flags.set(SessionFlags::SILENT_CLOSE);
        if stateless_reset {
            self.flags.set(SessionFlags::STATELESS_RESET);
        }
        self.events.push_back(SessionEvent::SilentClose {
            stateless_reset,
        });
        self.destroy(now);
    }

    /// Deliver a stateless reset identified by the endpoint's reverse
    /// token map.
    pub(crate) fn on_stateless_reset(&mut self, now: Timestamp) {
        self.silent_close(now, true);
    }

    fn destroy(&mut self, _now: Timestamp) {
        if self.is_destroyed() {
            return;
        }
        let remaining = self.crypto.remaining_total();
        if remaining > 0 {
            debug!(remaining, "destroying session with unacked crypto bytes");
        }
        self.flags.set(SessionFlags::DESTROYED);
        for id in self.streams.clear() {
            self.events.push_back(SessionEvent::StreamClose { id });
        }
        // Buffered outbound packets are dropped; the best-effort close
        // (when there was one) has already been queued and flushed.
        if self.flags.is_set(SessionFlags::SILENT_CLOSE) {
            self.tx_queue.clear();
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Dispatch a fired timer.
    pub(crate) fn on_timer(&mut self, kind: TimerKind, now: Timestamp) {
        match kind {
            TimerKind::Idle => {
                if self.is_destroyed() || self.is_closing_or_draining() {
                    return;
                }
                debug!(side = ?self.side, "idle timeout");
                self.flags.set(SessionFlags::IDLE_TIMEOUT);
                self.silent_close(now, false);
            }
            TimerKind::Retransmit => {
                if self.is_destroyed() || self.is_closing_or_draining() {
                    return;
                }
                let mut sink = SinkBuffer::default();
                let kind = self.transport.handle_retransmit_timeout(now, &mut sink);
                match kind {
                    TimeoutKind::Loss { packets } => {
                        self.stats.loss_retransmit_count += 1;
                        trace!(packets, "loss retransmission timeout");
                    }
                    TimeoutKind::AckDelay => {
                        self.stats.ack_delay_retransmit_count += 1;
                    }
                    TimeoutKind::Idle => {}
                }
                if self.apply_sink(sink, now).is_err() {
                    self.handle_error(now);
                    return;
                }
                if let Err(err) = self.send_pending(now) {
                    self.set_last_error(err.quic_error());
                    self.handle_error(now);
                }
            }
            TimerKind::Drain => {
                // Closing or draining period ended.
                self.destroy(now);
            }
        }
    }

    /// Flush deferred work after a callback unwound.
    pub(crate) fn flush_deferred(&mut self, now: Timestamp) {
        if self.deferred_send && !self.in_callback {
            self.deferred_send = false;
            let _ = self.send_pending(now);
        }
        self.maybe_finish_graceful_close_at(now);
    }
}

fn mtu_for(remote: &SocketAddr) -> usize {
    match remote {
        SocketAddr::V4(_) => crate::types::MAX_PKTLEN_IPV4,
        SocketAddr::V6(_) => crate::types::MAX_PKTLEN_IPV6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestTlsProvider;
    use crate::types::LOCAL_CID_LEN;

    fn client_session() -> Session {
        let cid = |byte: u8| ConnectionId::from_slice(&[byte; LOCAL_CID_LEN]).unwrap();
        Session::new_client(
            SessionConfig::default(),
            Box::new(TestTlsProvider::new()),
            cid(1),
            cid(2),
            "127.0.0.1:5544".parse().unwrap(),
            "127.0.0.1:4433".parse().unwrap(),
            Timestamp::ZERO,
        )
        .unwrap()
    }

    /// Exactly one stream object may exist per peer-initiated ID over
    /// the session's lifetime: a frame retransmitted after the stream
    /// completed and was torn down must not recreate it, recount it, or
    /// replay its events.
    #[test]
    fn retired_peer_stream_is_not_recreated() {
        let mut session = client_session();
        let now = Timestamp::from_millis(1);
        // Server-initiated unidirectional stream: a FIN-bearing frame
        // opens, drains, and closes it in one step.
        let id = 3;

        session
            .handle_stream_frame(id, 0, Bytes::from_static(b"once"), true, now)
            .unwrap();
        let events: Vec<_> = session.take_events().into_iter().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::StreamReady { id: 3, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::StreamClose { id: 3 })));
        assert_eq!(session.stats().uni_stream_count, 1);
        assert_eq!(session.stats().streams_in_count, 1);
        assert!(session.streams.is_empty());

        // The same frame again (a late retransmission): dropped whole.
        session
            .handle_stream_frame(id, 0, Bytes::from_static(b"once"), true, now)
            .unwrap();
        assert!(session.take_events().is_empty());
        assert_eq!(session.stats().uni_stream_count, 1);
        assert_eq!(session.stats().streams_in_count, 1);
        assert!(session.streams.is_empty());
    }

    /// The retirement guard must not swallow frames for genuinely new
    /// peer streams.
    #[test]
    fn new_peer_streams_still_admitted_after_a_retirement() {
        let mut session = client_session();
        let now = Timestamp::from_millis(1);
        session
            .handle_stream_frame(3, 0, Bytes::from_static(b"first"), true, now)
            .unwrap();
        session.take_events();

        session
            .handle_stream_frame(7, 0, Bytes::from_static(b"second"), true, now)
            .unwrap();
        let events: Vec<_> = session.take_events().into_iter().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::StreamReady { id: 7, .. })));
        assert_eq!(session.stats().uni_stream_count, 2);
        assert_eq!(session.stats().streams_in_count, 2);
    }
}
