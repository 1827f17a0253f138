//! # Endpoint: datagram demux and connection admission
//!
//! The endpoint owns the sessions bound to one datagram transport. It
//! routes inbound datagrams by connection ID, recognizes stateless
//! resets through the reverse token map, and handles everything that
//! does not belong to an established session: version negotiation,
//! retry-based address validation, server-busy and connection-cap
//! refusals, and stateless reset emission.
//!
//! All state is mutated from a single task; the host pumps
//! [`Endpoint::receive`] with inbound datagrams and
//! [`Endpoint::handle_expiry`] with the clock.

use std::collections::VecDeque;
use std::hash::Hasher;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use rand::RngCore;
use siphasher::sip::SipHasher13;
use slab::Slab;
use tracing::{debug, info, trace, warn};

use crate::addr::AddressBook;
use crate::buffer::PacketBuf;
use crate::cid::{CidGenerator, CidTable};
use crate::crypto::{PacketProtection, SipProtection, TlsContext, TlsProvider};
use crate::error::{codes, Error, QuicError, Result};
use crate::packet::{self, Frame, PacketType};
use crate::session::{Session, SessionConfig, SessionEvent};
use crate::timer::{TimerHandle, TimerKey, TimerKind, TimerService};
use crate::types::{
    ConnectionId, Side, Timestamp, MIN_INITIAL_SIZE, LOCAL_CID_LEN, QUIC_VERSION,
};

/// Datagrams smaller than this never elicit a stateless reset, keeping
/// the endpoint out of reset-probe loops (a minimal reset itself stays
/// below the threshold).
const MIN_STATELESS_RESET_TARGET: usize = 22;

/// Floor on emitted reset length: masked byte + randomness + token.
const MIN_STATELESS_RESET_LEN: usize = 41;

/// Pool CIDs advertised per session after the handshake.
const CID_POOL_SIZE: u64 = 3;

// ============================================================================
// Seams
// ============================================================================

/// The one primitive the endpoint needs from the host: send a datagram.
/// Inbound traffic is pushed in by the host via [`Endpoint::receive`].
pub trait DatagramTransport: Send {
    fn send(&mut self, remote: SocketAddr, data: &[u8]) -> std::io::Result<()>;

    fn local_addr(&self) -> SocketAddr;
}

// ============================================================================
// Configuration and statistics
// ============================================================================

/// Endpoint-level configuration.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Require a RETRY round trip before allocating server sessions.
    pub validate_address: bool,
    /// With `validate_address`, skip retry for recently validated
    /// addresses.
    pub validate_address_lru: bool,
    pub max_connections: usize,
    pub max_connections_per_host: usize,
    pub max_stateless_resets_per_host: u64,
    /// Seconds a retry token stays valid.
    pub retry_token_expiration: u64,
    pub disable_stateless_reset: bool,
    /// Refuse new connections while set.
    pub server_busy: bool,
    /// Diagnostic inbound/outbound packet drop probabilities.
    pub rx_loss: f64,
    pub tx_loss: f64,
    /// Reset-token secret; random when not pinned (pin it to survive
    /// restarts, which is what makes stateless resets useful).
    pub reset_secret: Option<[u8; 32]>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            validate_address: false,
            validate_address_lru: false,
            max_connections: 10_000,
            max_connections_per_host: 100,
            max_stateless_resets_per_host: 10,
            retry_token_expiration: 10,
            disable_stateless_reset: false,
            server_busy: false,
            rx_loss: 0.0,
            tx_loss: 0.0,
            reset_secret: None,
        }
    }
}

/// Fixed-layout per-socket counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketStats {
    pub created_at: u64,
    pub listen_at: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub packets_ignored: u64,
    pub packets_sent: u64,
    pub server_sessions: u64,
    pub client_sessions: u64,
    pub stateless_reset_count: u64,
    pub server_busy_count: u64,
}

impl SocketStats {
    pub const COUNT: usize = 11;

    pub fn as_array(&self) -> [u64; Self::COUNT] {
        [
            self.created_at,
            self.listen_at,
            self.bytes_received,
            self.bytes_sent,
            self.packets_received,
            self.packets_ignored,
            self.packets_sent,
            self.server_sessions,
            self.client_sessions,
            self.stateless_reset_count,
            self.server_busy_count,
        ]
    }
}

/// Handle to a session owned by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub(crate) usize);

/// Endpoint-level events, including re-tagged session events.
#[derive(Debug)]
pub enum EndpointEvent {
    /// A server session was accepted and is ready.
    SessionReady(SessionHandle),
    /// An event surfaced by a session.
    Session(SessionHandle, SessionEvent),
    /// The server-busy switch was toggled.
    ServerBusy(bool),
}

struct ListenState {
    context: Arc<dyn TlsContext>,
    session_config: SessionConfig,
}

struct SessionEntry {
    session: Session,
    timers: [TimerHandle; 3],
    /// Address admission was counted against (server sessions).
    counted_addr: Option<SocketAddr>,
}

// ============================================================================
// Endpoint
// ============================================================================

pub struct Endpoint {
    config: EndpointConfig,
    io: Box<dyn DatagramTransport>,
    sessions: Slab<SessionEntry>,
    cids: CidTable,
    addrs: AddressBook,
    timers: TimerService,
    events: VecDeque<EndpointEvent>,
    stats: SocketStats,
    cid_gen: CidGenerator,
    /// Process-local key for retry-token MACs.
    token_key: [u8; 16],
    listen: Option<ListenState>,
    server_busy: bool,
    stateless_reset_disabled: bool,
}

impl Endpoint {
    pub fn new(config: EndpointConfig, io: Box<dyn DatagramTransport>, now: Timestamp) -> Self {
        let cid_gen = match config.reset_secret {
            Some(secret) => CidGenerator::new(secret),
            None => CidGenerator::random(),
        };
        let mut token_key = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut token_key);
        let mut stats = SocketStats::default();
        stats.created_at = now.as_millis();
        let server_busy = config.server_busy;
        let stateless_reset_disabled = config.disable_stateless_reset;
        Self {
            config,
            io,
            sessions: Slab::new(),
            cids: CidTable::new(),
            addrs: AddressBook::new(),
            timers: TimerService::new(),
            events: VecDeque::new(),
            stats,
            cid_gen,
            token_key,
            listen: None,
            server_busy,
            stateless_reset_disabled,
        }
    }

    /// Start accepting Initial packets.
    pub fn listen(
        &mut self,
        context: Arc<dyn TlsContext>,
        session_config: SessionConfig,
        now: Timestamp,
    ) {
        self.stats.listen_at = now.as_millis();
        info!(alpn = ?session_config.alpn, "listening");
        self.listen = Some(ListenState {
            context,
            session_config,
        });
    }

    pub fn is_listening(&self) -> bool {
        self.listen.is_some()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.io.local_addr()
    }

    pub fn stats(&self) -> SocketStats {
        self.stats
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Total buffered bytes across sessions, for memory introspection.
    pub fn allocated_bytes(&self) -> u64 {
        self.sessions
            .iter()
            .map(|(_, e)| e.session.allocated_bytes())
            .sum()
    }

    pub fn poll_event(&mut self) -> Option<EndpointEvent> {
        self.events.pop_front()
    }

    /// Refuse (or resume accepting) new connections.
    pub fn set_server_busy(&mut self, busy: bool) {
        self.server_busy = busy;
        self.events.push_back(EndpointEvent::ServerBusy(busy));
    }

    /// Toggle stateless-reset emission; returns the new enabled state.
    pub fn toggle_stateless_reset(&mut self) -> bool {
        self.stateless_reset_disabled = !self.stateless_reset_disabled;
        !self.stateless_reset_disabled
    }

    /// Diagnostic packet-loss injection.
    pub fn set_diagnostic_packet_loss(&mut self, rx: f64, tx: f64) {
        self.config.rx_loss = rx.clamp(0.0, 1.0);
        self.config.tx_loss = tx.clamp(0.0, 1.0);
    }

    /// Borrow a session for read-only inspection.
    pub fn session(&self, handle: SessionHandle) -> Option<&Session> {
        self.sessions.get(handle.0).map(|e| &e.session)
    }

    // ------------------------------------------------------------------
    // Client connect
    // ------------------------------------------------------------------

    /// Open a client session toward `remote`.
    pub fn connect(
        &mut self,
        remote: SocketAddr,
        config: SessionConfig,
        tls: Box<dyn TlsProvider>,
        now: Timestamp,
    ) -> Result<SessionHandle> {
        let scid = self.cid_gen.generate();
        let dcid = self.cid_gen.generate_len(LOCAL_CID_LEN);
        let mut session = Session::new_client(
            config,
            tls,
            scid,
            dcid,
            self.io.local_addr(),
            remote,
            now,
        )?;
        session.start(now)?;

        let handle = self.register(session, None);
        self.cids.associate(scid, handle.0);
        self.stats.client_sessions += 1;
        self.after_session_op(handle, now);
        Ok(handle)
    }

    // ------------------------------------------------------------------
    // Session operations (by handle)
    // ------------------------------------------------------------------

    fn with_session<T>(
        &mut self,
        handle: SessionHandle,
        now: Timestamp,
        op: impl FnOnce(&mut Session) -> T,
    ) -> Result<T> {
        let entry = self
            .sessions
            .get_mut(handle.0)
            .ok_or(Error::InvalidState("unknown session"))?;
        let out = op(&mut entry.session);
        self.after_session_op(handle, now);
        Ok(out)
    }

    pub fn open_stream(
        &mut self,
        handle: SessionHandle,
        direction: crate::types::StreamDirection,
        now: Timestamp,
    ) -> Result<u64> {
        self.with_session(handle, now, |s| s.open_stream(direction, now))?
    }

    pub fn stream_write(
        &mut self,
        handle: SessionHandle,
        stream: u64,
        data: Bytes,
        fin: bool,
        now: Timestamp,
    ) -> Result<()> {
        self.with_session(handle, now, |s| s.stream_write(stream, data, fin, now))?
    }

    pub fn shutdown_stream(
        &mut self,
        handle: SessionHandle,
        stream: u64,
        error_code: u64,
        now: Timestamp,
    ) -> Result<()> {
        self.with_session(handle, now, |s| s.shutdown_stream(stream, error_code, now))?
    }

    pub fn close_session(
        &mut self,
        handle: SessionHandle,
        error: QuicError,
        reason: &[u8],
        now: Timestamp,
    ) -> Result<()> {
        self.with_session(handle, now, |s| s.close(error, reason, now))
    }

    pub fn close_session_gracefully(
        &mut self,
        handle: SessionHandle,
        now: Timestamp,
    ) -> Result<()> {
        self.with_session(handle, now, |s| s.close_gracefully(now))
    }

    pub fn ping(&mut self, handle: SessionHandle, now: Timestamp) -> Result<()> {
        self.with_session(handle, now, |s| s.ping(now))?
    }

    pub fn update_key(&mut self, handle: SessionHandle, now: Timestamp) -> Result<bool> {
        self.with_session(handle, now, |s| s.update_key(now))
    }

    pub fn on_client_hello_done(&mut self, handle: SessionHandle, now: Timestamp) -> Result<()> {
        self.with_session(handle, now, |s| s.on_client_hello_done(now))?
    }

    pub fn on_cert_done(
        &mut self,
        handle: SessionHandle,
        ocsp_response: Option<Bytes>,
        now: Timestamp,
    ) -> Result<()> {
        self.with_session(handle, now, |s| s.on_cert_done(ocsp_response, now))?
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Earliest deadline across all session timers.
    pub fn next_expiry(&self) -> Option<Timestamp> {
        self.timers.next_expiry()
    }

    /// Fire due timers.
    pub fn handle_expiry(&mut self, now: Timestamp) {
        for key in self.timers.pop_expired(now) {
            if let Some(entry) = self.sessions.get_mut(key.session) {
                entry.session.on_timer(key.kind, now);
                self.after_session_op(SessionHandle(key.session), now);
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound demux
    // ------------------------------------------------------------------

    /// Feed one inbound datagram from the transport.
    pub fn receive(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        data: &[u8],
        now: Timestamp,
    ) {
        self.stats.packets_received += 1;
        self.stats.bytes_received += data.len() as u64;

        if self.config.rx_loss > 0.0 && rand::random::<f64>() < self.config.rx_loss {
            trace!("diagnostic rx loss");
            self.stats.packets_ignored += 1;
            return;
        }

        let parsed = match packet::parse_packet(data, LOCAL_CID_LEN) {
            Ok(parsed) => parsed,
            Err(_) => {
                // Unparseable: the reverse token map may still identify
                // a stateless reset.
                if let Some(slot) = self.cids.lookup_token(data) {
                    self.deliver_stateless_reset(SessionHandle(slot), now);
                } else {
                    self.stats.packets_ignored += 1;
                }
                return;
            }
        };

        // Undersized Initials are dropped outright (amplification
        // defense, RFC 9000 Section 14.1).
        if parsed.ty == PacketType::Initial && data.len() < MIN_INITIAL_SIZE {
            debug!(len = data.len(), from = %remote, "undersized initial dropped");
            self.stats.packets_ignored += 1;
            return;
        }

        let dcid = parsed.dcid;
        if let Some(slot) = self.cids.lookup(&dcid) {
            let handle = SessionHandle(slot);
            if let Some(entry) = self.sessions.get_mut(slot) {
                entry.session.receive(now, remote, data);
            }
            self.after_session_op(handle, now);
            return;
        }

        if let Some(slot) = self.cids.lookup_token(data) {
            self.deliver_stateless_reset(SessionHandle(slot), now);
            return;
        }

        if parsed.ty == PacketType::Initial && self.listen.is_some() {
            self.accept_initial(local, remote, &parsed, data, now);
            return;
        }

        // Unroutable short-header traffic earns a stateless reset so a
        // rebooted peer can learn the connection is gone.
        if parsed.ty == PacketType::Short {
            self.maybe_send_stateless_reset(&dcid, remote, data.len());
        }
        self.stats.packets_ignored += 1;
    }

    fn deliver_stateless_reset(&mut self, handle: SessionHandle, now: Timestamp) {
        debug!(slot = handle.0, "inbound datagram matched a reset token");
        if let Some(entry) = self.sessions.get_mut(handle.0) {
            entry.session.on_stateless_reset(now);
        }
        self.after_session_op(handle, now);
    }

    // ------------------------------------------------------------------
    // Connection admission
    // ------------------------------------------------------------------

    fn accept_initial(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        parsed: &packet::ParsedPacket<'_>,
        data: &[u8],
        now: Timestamp,
    ) {
        let client_scid = parsed.scid.unwrap_or_else(ConnectionId::empty);

        // Unsupported version: answer with Version Negotiation.
        if parsed.version != QUIC_VERSION {
            debug!(version = parsed.version, from = %remote,
                   "unsupported version; sending version negotiation");
            let vn = packet::build_version_negotiation(&client_scid, &parsed.dcid, &[QUIC_VERSION]);
            self.send_raw(remote, &vn);
            return;
        }

        if self.server_busy {
            self.stats.server_busy_count += 1;
            self.immediate_connection_close(
                remote,
                parsed,
                QuicError::session(codes::CONNECTION_REFUSED),
                b"server busy",
                now,
            );
            return;
        }

        if self.sessions.len() >= self.config.max_connections
            || self.addrs.session_count(&remote) >= self.config.max_connections_per_host
        {
            debug!(from = %remote, "connection caps exceeded");
            self.immediate_connection_close(
                remote,
                parsed,
                QuicError::session(codes::CONNECTION_REFUSED),
                b"connection limit",
                now,
            );
            return;
        }

        // Address validation (RFC 9000 Section 8.1).
        let mut scid: Option<ConnectionId> = None;
        if self.config.validate_address {
            if !parsed.token.is_empty() {
                match self.validate_retry_token(parsed.token, &remote, now) {
                    Ok(()) => {
                        self.addrs.set_validated(&remote, now);
                        // The DCID of this Initial is the CID we minted
                        // in the retry; keep it as the session's SCID.
                        scid = Some(parsed.dcid);
                    }
                    Err(_) => {
                        warn!(from = %remote, "invalid retry token");
                        self.immediate_connection_close(
                            remote,
                            parsed,
                            QuicError::session(codes::INVALID_TOKEN),
                            b"invalid retry token",
                            now,
                        );
                        return;
                    }
                }
            } else if !(self.config.validate_address_lru
                && self.addrs.is_validated(&remote, now))
            {
                self.send_retry(remote, parsed, now);
                return;
            }
        }

        let listen = match &self.listen {
            Some(listen) => listen,
            None => return,
        };
        let scid = scid.unwrap_or_else(|| self.cid_gen.generate());
        let tls = listen.context.new_provider();
        let mut session_config = listen.session_config.clone();
        // Bind a reset token to the handshake CID so the peer can
        // recognize a reset from a restarted endpoint sharing our
        // reset secret.
        session_config.transport_params.stateless_reset_token =
            Some(self.cid_gen.reset_token(&scid));
        // The preferred address advertises its own CID and token.
        if let Some(pref) = &mut session_config.transport_params.preferred_address {
            pref.cid = self.cid_gen.generate();
            pref.reset_token = self.cid_gen.reset_token(&pref.cid);
        }
        let preferred = session_config.transport_params.preferred_address.clone();
        let session = match Session::new_server(
            session_config,
            tls,
            scid,
            client_scid,
            parsed.dcid,
            local,
            remote,
            now,
        ) {
            Ok(session) => session,
            Err(err) => {
                warn!(%err, "failed to create server session");
                return;
            }
        };

        let handle = self.register(session, Some(remote));
        self.cids.associate(scid, handle.0);
        if parsed.dcid != scid {
            // Route follow-up Initials still addressed to the
            // client-chosen DCID.
            self.cids.associate(parsed.dcid, handle.0);
        }
        if let Some(pref) = &preferred {
            // Traffic migrating to the preferred address arrives under
            // its dedicated CID.
            self.cids.associate(pref.cid, handle.0);
        }
        self.addrs.increment_sessions(&remote);
        self.stats.server_sessions += 1;
        info!(from = %remote, scid = %scid, "server session accepted");
        self.events.push_back(EndpointEvent::SessionReady(handle));

        if let Some(entry) = self.sessions.get_mut(handle.0) {
            entry.session.receive(now, remote, data);
        }
        self.after_session_op(handle, now);
    }

    fn register(&mut self, session: Session, counted_addr: Option<SocketAddr>) -> SessionHandle {
        let entry = self.sessions.vacant_entry();
        let slot = entry.key();
        let timers = [
            TimerKind::Idle,
            TimerKind::Retransmit,
            TimerKind::Drain,
        ]
        .map(|kind| {
            self.timers.register(TimerKey {
                session: slot,
                kind,
            })
        });
        entry.insert(SessionEntry {
            session,
            timers,
            counted_addr,
        });
        SessionHandle(slot)
    }

    // ------------------------------------------------------------------
    // Retry tokens
    // ------------------------------------------------------------------

    /// Retry token layout: `ts_ms(8) | addr | mac(16)`, MAC'd with the
    /// process-local token key.
    fn mint_retry_token(&self, remote: &SocketAddr, now: Timestamp) -> Vec<u8> {
        let mut token = Vec::with_capacity(48);
        token.extend_from_slice(&now.as_millis().to_be_bytes());
        encode_addr(&mut token, remote);
        let mac = self.token_mac(&token);
        token.extend_from_slice(&mac);
        token
    }

    fn validate_retry_token(
        &self,
        token: &[u8],
        remote: &SocketAddr,
        now: Timestamp,
    ) -> Result<()> {
        if token.len() < 8 + 16 {
            return Err(Error::InvalidRetryToken);
        }
        let (body, mac) = token.split_at(token.len() - 16);
        if self.token_mac(body) != mac {
            return Err(Error::InvalidRetryToken);
        }
        let mut ts_bytes = [0u8; 8];
        ts_bytes.copy_from_slice(&body[..8]);
        let minted_at = u64::from_be_bytes(ts_bytes);
        let age_ms = now.as_millis().saturating_sub(minted_at);
        if age_ms > self.config.retry_token_expiration.max(1) * 1000 {
            return Err(Error::InvalidRetryToken);
        }
        let mut expected_addr = Vec::with_capacity(20);
        encode_addr(&mut expected_addr, remote);
        if body[8..] != expected_addr[..] {
            return Err(Error::InvalidRetryToken);
        }
        Ok(())
    }

    fn token_mac(&self, body: &[u8]) -> [u8; 16] {
        let mut k0b = [0u8; 8];
        let mut k1b = [0u8; 8];
        k0b.copy_from_slice(&self.token_key[0..8]);
        k1b.copy_from_slice(&self.token_key[8..16]);
        let (k0, k1) = (u64::from_le_bytes(k0b), u64::from_le_bytes(k1b));
        let mut mac = [0u8; 16];
        for round in 0u64..2 {
            let mut hasher = SipHasher13::new_with_keys(k0 ^ round, k1);
            hasher.write(body);
            mac[round as usize * 8..round as usize * 8 + 8]
                .copy_from_slice(&hasher.finish().to_le_bytes());
        }
        mac
    }

    fn send_retry(&mut self, remote: SocketAddr, parsed: &packet::ParsedPacket<'_>, now: Timestamp) {
        let client_scid = match parsed.scid {
            Some(scid) if !scid.is_empty() => scid,
            _ => return,
        };
        let new_scid = self.cid_gen.generate();
        let token = self.mint_retry_token(&remote, now);
        let retry = packet::build_retry(&client_scid, &new_scid, &parsed.dcid, &token);
        debug!(from = %remote, cid = %new_scid, "sending retry");
        self.send_raw(remote, &retry);
    }

    // ------------------------------------------------------------------
    // Stateless packets
    // ------------------------------------------------------------------

    /// One-shot CONNECTION_CLOSE for a connection that never got a
    /// session (busy, caps, invalid token).
    fn immediate_connection_close(
        &mut self,
        remote: SocketAddr,
        parsed: &packet::ParsedPacket<'_>,
        error: QuicError,
        reason: &[u8],
        now: Timestamp,
    ) {
        let _ = now;
        let client_scid = parsed.scid.unwrap_or_else(ConnectionId::empty);
        let frame = Frame::ConnectionClose {
            application: false,
            error_code: error.wire_code(),
            frame_type: 0,
            reason: Bytes::copy_from_slice(reason),
        };
        let mut payload = Vec::with_capacity(64);
        frame.encode(&mut payload);
        // Protected with the Initial keys the client derived from its
        // own DCID, so it can read the refusal.
        let protection = SipProtection::initial(parsed.dcid.as_bytes(), Side::Server);
        let header = packet::long_header_bytes(
            PacketType::Initial,
            QUIC_VERSION,
            &client_scid,
            &parsed.dcid,
            &[],
            0,
            payload.len() + crate::crypto::PROTECTION_TAG_LEN,
        );
        let sealed = protection.seal(0, &header, &payload);
        let mut out = Vec::with_capacity(header.len() + sealed.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&sealed);
        self.send_raw(remote, &out);
    }

    /// Emit a stateless reset for an unroutable short-header datagram.
    fn maybe_send_stateless_reset(
        &mut self,
        dcid: &ConnectionId,
        remote: SocketAddr,
        nread: usize,
    ) {
        if self.config.disable_stateless_reset || self.stateless_reset_disabled {
            return;
        }
        if nread < MIN_STATELESS_RESET_TARGET {
            return;
        }
        if self.addrs.reset_count(&remote) >= self.config.max_stateless_resets_per_host {
            trace!(to = %remote, "stateless reset rate cap reached");
            return;
        }
        self.addrs.increment_resets(&remote);

        // Random payload one byte shorter than what we received, first
        // byte masked to look like a short header, token in the tail
        // (RFC 9000 Section 10.3).
        let len = (nread - 1)
            .max(MIN_STATELESS_RESET_LEN)
            .min(crate::types::MAX_PKTLEN_IPV4);
        let mut payload = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut payload);
        payload[0] = (payload[0] & 0x3f) | 0x40;
        let token = self.cid_gen.reset_token(dcid);
        let tail = len - token.len();
        payload[tail..].copy_from_slice(&token);

        self.stats.stateless_reset_count += 1;
        debug!(to = %remote, len, "sending stateless reset");
        self.send_raw(remote, &payload);
    }

    // ------------------------------------------------------------------
    // Post-op bookkeeping
    // ------------------------------------------------------------------

    /// Drain a session's queues into the endpoint after any operation
    /// that may have touched it, then reconcile timers and lifecycle.
    fn after_session_op(&mut self, handle: SessionHandle, now: Timestamp) {
        let slot = handle.0;
        let Some(entry) = self.sessions.get_mut(slot) else {
            return;
        };

        entry.session.flush_deferred(now);

        // Outbound packets.
        let remote = entry.session.remote_address();
        let tx = entry.session.take_tx();
        let events = entry.session.take_events();
        let peer_tokens = entry.session.take_peer_tokens();
        let retired = entry.session.take_retired_cids();
        let destroyed = entry.session.is_destroyed();
        let deadlines = entry.session.timer_deadlines();
        let timers = entry.timers;

        for buf in tx {
            self.send_packet(remote, buf);
        }
        for token in peer_tokens {
            self.cids.associate_token(token, slot);
        }
        for cid in retired {
            self.cids.dissociate(&cid);
        }

        let mut handshake_completed = false;
        for event in events {
            if matches!(event, SessionEvent::Handshake { .. }) {
                handshake_completed = true;
            }
            self.events.push_back(EndpointEvent::Session(handle, event));
        }

        if handshake_completed {
            self.on_session_handshake(handle, now);
        }

        if destroyed {
            self.unregister(slot);
            return;
        }

        for (timer, deadline) in timers.iter().zip(deadlines) {
            self.timers.set(*timer, deadline);
        }
    }

    /// Post-handshake work: mark the address validated and advertise a
    /// pool of alternate CIDs for migration.
    fn on_session_handshake(&mut self, handle: SessionHandle, now: Timestamp) {
        let slot = handle.0;
        let Some(entry) = self.sessions.get_mut(slot) else {
            return;
        };
        let session = &mut entry.session;
        if session.is_destroyed() || session.cid_pool_issued() {
            return;
        }
        session.mark_cid_pool_issued();
        let remote = session.remote_address();
        let is_server = session.side().is_server();
        let pool = CID_POOL_SIZE.min(session.peer_active_cid_limit().saturating_sub(1));

        let mut issued = Vec::new();
        for _ in 0..pool {
            let cid = self.cid_gen.generate();
            let token = self.cid_gen.reset_token(&cid);
            issued.push((cid, token));
        }
        let Some(entry) = self.sessions.get_mut(slot) else {
            return;
        };
        for (cid, token) in &issued {
            entry.session.add_local_cid(*cid, *token);
        }
        for (cid, _) in issued {
            self.cids.associate(cid, slot);
        }
        if is_server {
            self.addrs.set_validated(&remote, now);
        }
        // Flush the NEW_CONNECTION_ID frames.
        if let Some(entry) = self.sessions.get_mut(slot) {
            let _ = entry.session.send_pending(now);
            let remote = entry.session.remote_address();
            let tx = entry.session.take_tx();
            for buf in tx {
                self.send_packet(remote, buf);
            }
        }
    }

    fn unregister(&mut self, slot: usize) {
        if !self.sessions.contains(slot) {
            return;
        }
        let entry = self.sessions.remove(slot);
        for timer in entry.timers {
            self.timers.remove(timer);
        }
        // A destroyed session holds no registered CIDs.
        self.cids.remove_slot(slot);
        if let Some(addr) = entry.counted_addr {
            self.addrs.decrement_sessions(&addr);
        }
        debug!(slot, "session unregistered");
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn send_packet(&mut self, remote: SocketAddr, buf: PacketBuf) {
        if self.config.tx_loss > 0.0 && rand::random::<f64>() < self.config.tx_loss {
            trace!(label = buf.label(), "diagnostic tx loss");
            return;
        }
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += buf.len() as u64;
        if let Err(err) = self.io.send(remote, buf.as_ref()) {
            warn!(%err, to = %remote, "datagram send failed");
        }
    }

    fn send_raw(&mut self, remote: SocketAddr, data: &[u8]) {
        if self.config.tx_loss > 0.0 && rand::random::<f64>() < self.config.tx_loss {
            return;
        }
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += data.len() as u64;
        if let Err(err) = self.io.send(remote, data) {
            warn!(%err, to = %remote, "datagram send failed");
        }
    }
}

fn encode_addr(out: &mut Vec<u8>, addr: &SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            out.push(4);
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
        }
        SocketAddr::V6(v6) => {
            out.push(6);
            out.extend_from_slice(&v6.ip().octets());
            out.extend_from_slice(&v6.port().to_be_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(config: EndpointConfig) -> Endpoint {
        struct NullTransport(SocketAddr);
        impl DatagramTransport for NullTransport {
            fn send(&mut self, _remote: SocketAddr, _data: &[u8]) -> std::io::Result<()> {
                Ok(())
            }
            fn local_addr(&self) -> SocketAddr {
                self.0
            }
        }
        Endpoint::new(
            config,
            Box::new(NullTransport("127.0.0.1:4433".parse().unwrap())),
            Timestamp::ZERO,
        )
    }

    #[test]
    fn retry_token_round_trip() {
        let ep = endpoint(EndpointConfig::default());
        let remote: SocketAddr = "192.0.2.7:5000".parse().unwrap();
        let token = ep.mint_retry_token(&remote, Timestamp::from_millis(1_000));
        assert!(ep
            .validate_retry_token(&token, &remote, Timestamp::from_millis(2_000))
            .is_ok());
    }

    #[test]
    fn retry_token_binds_address() {
        let ep = endpoint(EndpointConfig::default());
        let remote: SocketAddr = "192.0.2.7:5000".parse().unwrap();
        let other: SocketAddr = "192.0.2.8:5000".parse().unwrap();
        let token = ep.mint_retry_token(&remote, Timestamp::from_millis(0));
        assert!(ep
            .validate_retry_token(&token, &other, Timestamp::from_millis(1))
            .is_err());
    }

    #[test]
    fn retry_token_expires() {
        let mut config = EndpointConfig::default();
        config.retry_token_expiration = 2;
        let ep = endpoint(config);
        let remote: SocketAddr = "192.0.2.7:5000".parse().unwrap();
        let token = ep.mint_retry_token(&remote, Timestamp::from_millis(0));
        assert!(ep
            .validate_retry_token(&token, &remote, Timestamp::from_millis(1_999))
            .is_ok());
        assert!(ep
            .validate_retry_token(&token, &remote, Timestamp::from_millis(2_001))
            .is_err());
    }

    #[test]
    fn retry_token_rejects_tampering() {
        let ep = endpoint(EndpointConfig::default());
        let remote: SocketAddr = "192.0.2.7:5000".parse().unwrap();
        let mut token = ep.mint_retry_token(&remote, Timestamp::from_millis(0));
        let last = token.len() - 1;
        token[last] ^= 0x01;
        assert!(ep
            .validate_retry_token(&token, &remote, Timestamp::from_millis(1))
            .is_err());
        assert!(ep
            .validate_retry_token(&token[..10], &remote, Timestamp::from_millis(1))
            .is_err());
    }

    #[test]
    fn server_busy_toggle_emits_event() {
        let mut ep = endpoint(EndpointConfig::default());
        ep.set_server_busy(true);
        assert!(matches!(
            ep.poll_event(),
            Some(EndpointEvent::ServerBusy(true))
        ));
    }

    #[test]
    fn stateless_reset_toggle() {
        let mut ep = endpoint(EndpointConfig::default());
        assert!(!ep.toggle_stateless_reset(), "disabled after first toggle");
        assert!(ep.toggle_stateless_reset(), "re-enabled");
    }
}
