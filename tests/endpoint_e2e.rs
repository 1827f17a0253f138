//! End-to-end endpoint scenarios over the in-memory network: handshake
//! and stream echo, retry-based address validation, version
//! negotiation, stateless reset, idle timeout, key updates, and the
//! admission limits.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use quicport::testing::{TestLink, TestTlsContext, TestTlsProvider};
use quicport::{
    Endpoint, EndpointConfig, EndpointEvent, ErrorFamily, SessionConfig, SessionEvent,
    SessionHandle, StreamDirection, Timestamp, QUIC_VERSION,
};

const ALPN: &[u8] = b"h3-29";

fn ms(millis: u64) -> Timestamp {
    Timestamp::from_millis(millis)
}

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn session_config() -> SessionConfig {
    SessionConfig {
        alpn: vec![Bytes::from_static(ALPN)],
        ..SessionConfig::default()
    }
}

fn client_config() -> SessionConfig {
    SessionConfig {
        server_name: Some("localhost".to_string()),
        ..session_config()
    }
}

struct Pair {
    link: TestLink,
    server: Endpoint,
    client: Endpoint,
    server_addr: SocketAddr,
    client_addr: SocketAddr,
}

impl Pair {
    fn new(server_cfg: EndpointConfig, client_cfg: EndpointConfig, now: Timestamp) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let link = TestLink::new();
        let server_addr = addr(4433);
        let client_addr = addr(5544);
        let mut server = Endpoint::new(server_cfg, link.transport(server_addr), now);
        server.listen(Arc::new(TestTlsContext::new()), session_config(), now);
        let client = Endpoint::new(client_cfg, link.transport(client_addr), now);
        Self {
            link,
            server,
            client,
            server_addr,
            client_addr,
        }
    }

    fn defaults(now: Timestamp) -> Self {
        Self::new(EndpointConfig::default(), EndpointConfig::default(), now)
    }

    /// Shuttle datagrams until the link drains.
    fn pump(&mut self, now: Timestamp) {
        for _ in 0..64 {
            let batch = self.link.drain();
            if batch.is_empty() {
                return;
            }
            for datagram in batch {
                if datagram.to == self.server_addr {
                    self.server
                        .receive(datagram.to, datagram.from, &datagram.data, now);
                } else if datagram.to == self.client_addr {
                    self.client
                        .receive(datagram.to, datagram.from, &datagram.data, now);
                }
            }
        }
        panic!("link failed to drain; endpoints are looping");
    }

    fn connect(&mut self, config: SessionConfig, now: Timestamp) -> SessionHandle {
        self.client
            .connect(
                self.server_addr,
                config,
                Box::new(TestTlsProvider::new()),
                now,
            )
            .expect("connect")
    }
}

fn drain_events(endpoint: &mut Endpoint) -> Vec<EndpointEvent> {
    let mut events = Vec::new();
    while let Some(event) = endpoint.poll_event() {
        events.push(event);
    }
    events
}

fn server_handle(events: &[EndpointEvent]) -> SessionHandle {
    events
        .iter()
        .find_map(|event| match event {
            EndpointEvent::SessionReady(handle) => Some(*handle),
            _ => None,
        })
        .expect("server session ready")
}

fn has_handshake_event(events: &[EndpointEvent]) -> bool {
    events.iter().any(|event| {
        matches!(
            event,
            EndpointEvent::Session(_, SessionEvent::Handshake { .. })
        )
    })
}

/// Collect delivered stream payload (and whether FIN was seen) for one
/// stream id.
fn stream_data(events: &[EndpointEvent], stream: u64) -> (Vec<u8>, bool) {
    let mut bytes = Vec::new();
    let mut fin_seen = false;
    for event in events {
        if let EndpointEvent::Session(_, SessionEvent::StreamData { id, data, fin }) = event {
            if *id == stream {
                bytes.extend_from_slice(data);
                fin_seen |= fin;
            }
        }
    }
    (bytes, fin_seen)
}

// ============================================================================
// Handshake + echo
// ============================================================================

#[test]
fn handshake_and_bidi_echo() {
    let t0 = ms(0);
    let mut pair = Pair::defaults(t0);
    let ch = pair.connect(client_config(), t0);
    pair.pump(ms(10));

    let server_events = drain_events(&mut pair.server);
    let client_events = drain_events(&mut pair.client);
    let sh = server_handle(&server_events);
    assert!(has_handshake_event(&server_events), "server handshake event");
    assert!(has_handshake_event(&client_events), "client handshake event");

    // Client opens bidi stream 0 and sends "ping" with FIN.
    let stream = pair
        .client
        .open_stream(ch, StreamDirection::Bidirectional, ms(20))
        .unwrap();
    assert_eq!(stream, 0);
    pair.client
        .stream_write(ch, stream, Bytes::from_static(b"ping"), true, ms(21))
        .unwrap();
    pair.pump(ms(22));

    let server_events = drain_events(&mut pair.server);
    let (payload, fin) = stream_data(&server_events, 0);
    assert_eq!(payload, b"ping");
    assert!(fin);
    assert!(server_events.iter().any(|e| matches!(
        e,
        EndpointEvent::Session(_, SessionEvent::StreamReady { id: 0, .. })
    )));

    // Server answers "pong" with FIN on the same stream.
    pair.server
        .stream_write(sh, 0, Bytes::from_static(b"pong"), true, ms(30))
        .unwrap();
    pair.pump(ms(31));

    let client_events = drain_events(&mut pair.client);
    let (payload, fin) = stream_data(&client_events, 0);
    assert_eq!(payload, b"pong");
    assert!(fin);

    let client_stats = pair.client.session(ch).unwrap().stats();
    assert!(client_stats.handshake_completed_at > 0);
    assert_eq!(client_stats.bidi_stream_count, 1);
    let server_stats = pair.server.session(sh).unwrap().stats();
    assert!(server_stats.handshake_completed_at > 0);
    assert_eq!(server_stats.bidi_stream_count, 1);
}

#[test]
fn session_ticket_reaches_client() {
    let t0 = ms(0);
    let mut pair = Pair::defaults(t0);
    let _ch = pair.connect(client_config(), t0);
    pair.pump(ms(5));
    let client_events = drain_events(&mut pair.client);
    assert!(client_events.iter().any(|e| matches!(
        e,
        EndpointEvent::Session(_, SessionEvent::SessionTicket(_))
    )));
}

// ============================================================================
// Retry (address validation)
// ============================================================================

#[test]
fn retry_round_trip_validates_address() {
    let t0 = ms(0);
    let server_cfg = EndpointConfig {
        validate_address: true,
        ..EndpointConfig::default()
    };
    let mut pair = Pair::new(server_cfg, EndpointConfig::default(), t0);
    let ch = pair.connect(client_config(), t0);
    pair.pump(ms(10));

    let server_events = drain_events(&mut pair.server);
    let client_events = drain_events(&mut pair.client);
    let sh = server_handle(&server_events);
    assert!(has_handshake_event(&client_events), "established after retry");

    let client_stats = pair.client.session(ch).unwrap().stats();
    assert_eq!(client_stats.retry_count, 1);
    let server_stats = pair.server.session(sh).unwrap().stats();
    assert_eq!(server_stats.retry_count, 0);
}

#[test]
fn retry_gate_creates_no_session_for_tokenless_initial() {
    let t0 = ms(0);
    let server_cfg = EndpointConfig {
        validate_address: true,
        ..EndpointConfig::default()
    };
    let mut pair = Pair::new(server_cfg, EndpointConfig::default(), t0);
    let _ch = pair.connect(client_config(), t0);

    // Deliver only the client's first flight to the server.
    let first: Vec<_> = pair.link.drain();
    for datagram in first {
        if datagram.to == pair.server_addr {
            pair.server
                .receive(datagram.to, datagram.from, &datagram.data, ms(1));
        }
    }
    // The tokenless Initial produced a retry, not a session.
    assert_eq!(pair.server.session_count(), 0);
    assert_eq!(pair.server.stats().server_sessions, 0);
}

#[test]
fn validated_address_lru_skips_retry() {
    let t0 = ms(0);
    let server_cfg = EndpointConfig {
        validate_address: true,
        validate_address_lru: true,
        ..EndpointConfig::default()
    };
    let mut pair = Pair::new(server_cfg, EndpointConfig::default(), t0);

    let ch1 = pair.connect(client_config(), t0);
    pair.pump(ms(10));
    drain_events(&mut pair.server);
    let first_retries = pair.client.session(ch1).unwrap().stats().retry_count;
    assert_eq!(first_retries, 1);

    // Second connection from the validated address skips the retry.
    let ch2 = pair.connect(client_config(), ms(20));
    pair.pump(ms(30));
    let second_retries = pair.client.session(ch2).unwrap().stats().retry_count;
    assert_eq!(second_retries, 0);
}

// ============================================================================
// Version negotiation
// ============================================================================

#[test]
fn version_negotiation_round_trip() {
    let t0 = ms(0);
    let mut pair = Pair::defaults(t0);
    let config = SessionConfig {
        quic_version: 0xBABA_BABA,
        ..client_config()
    };
    let ch = pair.connect(config, t0);
    pair.pump(ms(5));

    // No server session came into existence.
    assert_eq!(pair.server.session_count(), 0);

    let client_events = drain_events(&mut pair.client);
    let vn = client_events.iter().find_map(|event| match event {
        EndpointEvent::Session(_, SessionEvent::VersionNegotiation { offered, supported }) => {
            Some((offered.clone(), supported.clone()))
        }
        _ => None,
    });
    let (offered, supported) = vn.expect("version negotiation event");
    assert_eq!(offered, vec![0xBABA_BABA]);
    assert_eq!(supported, vec![QUIC_VERSION]);
    // The client session went away silently.
    assert!(pair.client.session(ch).is_none());
}

// ============================================================================
// Stateless reset
// ============================================================================

#[test]
fn restarted_server_stateless_reset() {
    let t0 = ms(0);
    let reset_secret = [0x42u8; 32];
    let server_cfg = EndpointConfig {
        reset_secret: Some(reset_secret),
        ..EndpointConfig::default()
    };
    let mut pair = Pair::new(server_cfg, EndpointConfig::default(), t0);
    let ch = pair.connect(client_config(), t0);
    pair.pump(ms(10));
    drain_events(&mut pair.client);
    drain_events(&mut pair.server);

    // The server process dies and comes back with no session state but
    // the same reset secret.
    let restarted_cfg = EndpointConfig {
        reset_secret: Some(reset_secret),
        ..EndpointConfig::default()
    };
    let mut restarted = Endpoint::new(restarted_cfg, pair.link.transport(pair.server_addr), ms(50));

    // The client talks into the void; the restarted server answers with
    // a stateless reset bound to the CID.
    pair.client.ping(ch, ms(60)).unwrap();
    for _ in 0..8 {
        let batch = pair.link.drain();
        if batch.is_empty() {
            break;
        }
        for datagram in batch {
            if datagram.to == pair.server_addr {
                restarted.receive(datagram.to, datagram.from, &datagram.data, ms(61));
            } else if datagram.to == pair.client_addr {
                pair.client
                    .receive(datagram.to, datagram.from, &datagram.data, ms(62));
            }
        }
    }

    assert_eq!(restarted.stats().stateless_reset_count, 1);
    let client_events = drain_events(&mut pair.client);
    assert!(client_events.iter().any(|e| matches!(
        e,
        EndpointEvent::Session(_, SessionEvent::SilentClose { stateless_reset: true })
    )));
    assert!(pair.client.session(ch).is_none(), "session destroyed");
}

// ============================================================================
// Idle timeout
// ============================================================================

#[test]
fn idle_timeout_closes_both_sides() {
    let t0 = ms(0);
    let mut pair = Pair::defaults(t0);
    let mut config = client_config();
    config.transport_params.max_idle_timeout_ms = 200;
    // The server advertises its own idle timeout; the effective value
    // is the minimum of the two, so 200ms governs both directions.
    let ch = pair.connect(config, t0);
    pair.pump(ms(10));
    drain_events(&mut pair.client);
    let server_events = drain_events(&mut pair.server);
    let sh = server_handle(&server_events);

    // Silence. Both endpoints pass their idle deadlines.
    let late = ms(10 + 250);
    assert!(pair.client.next_expiry().is_some());
    pair.client.handle_expiry(late);
    pair.server.handle_expiry(late);

    let client_events = drain_events(&mut pair.client);
    assert!(client_events.iter().any(|e| matches!(
        e,
        EndpointEvent::Session(_, SessionEvent::SilentClose { stateless_reset: false })
    )));
    assert!(pair.client.session(ch).is_none());

    let server_events = drain_events(&mut pair.server);
    assert!(server_events.iter().any(|e| matches!(
        e,
        EndpointEvent::Session(_, SessionEvent::SilentClose { stateless_reset: false })
    )));
    assert!(pair.server.session(sh).is_none());
}

// ============================================================================
// Key update
// ============================================================================

#[test]
fn key_update_preserves_traffic() {
    let t0 = ms(0);
    let mut pair = Pair::defaults(t0);
    let ch = pair.connect(client_config(), t0);
    pair.pump(ms(10));
    let server_events = drain_events(&mut pair.server);
    let sh = server_handle(&server_events);
    drain_events(&mut pair.client);

    assert!(pair.client.update_key(ch, ms(20)).unwrap());
    pair.pump(ms(21));

    let stream = pair
        .client
        .open_stream(ch, StreamDirection::Bidirectional, ms(22))
        .unwrap();
    pair.client
        .stream_write(ch, stream, Bytes::from_static(b"fresh keys"), true, ms(23))
        .unwrap();
    pair.pump(ms(24));

    let server_events = drain_events(&mut pair.server);
    let (payload, fin) = stream_data(&server_events, stream);
    assert_eq!(payload, b"fresh keys");
    assert!(fin);

    let stats = pair.client.session(ch).unwrap().stats();
    assert_eq!(stats.keyupdate_count, 1);
    let server_stats = pair.server.session(sh).unwrap().stats();
    assert_eq!(server_stats.keyupdate_count, 0, "responder does not count");
}

// ============================================================================
// Admission limits
// ============================================================================

#[test]
fn per_host_connection_cap_refuses_excess() {
    let t0 = ms(0);
    let server_cfg = EndpointConfig {
        max_connections_per_host: 1,
        ..EndpointConfig::default()
    };
    let mut pair = Pair::new(server_cfg, EndpointConfig::default(), t0);
    let _ch1 = pair.connect(client_config(), t0);
    pair.pump(ms(5));
    assert_eq!(pair.server.stats().server_sessions, 1);

    let ch2 = pair.connect(client_config(), ms(10));
    pair.pump(ms(15));
    assert_eq!(pair.server.stats().server_sessions, 1, "cap enforced");

    let client_events = drain_events(&mut pair.client);
    let refused = client_events.iter().any(|event| {
        matches!(
            event,
            EndpointEvent::Session(handle, SessionEvent::SessionClose { error, .. })
                if *handle == ch2 && error.code == quicport::codes::CONNECTION_REFUSED
        )
    });
    assert!(refused, "second connection refused");
}

#[test]
fn server_busy_refuses_and_counts() {
    let t0 = ms(0);
    let server_cfg = EndpointConfig {
        server_busy: true,
        ..EndpointConfig::default()
    };
    let mut pair = Pair::new(server_cfg, EndpointConfig::default(), t0);
    let ch = pair.connect(client_config(), t0);
    pair.pump(ms(5));

    assert_eq!(pair.server.session_count(), 0);
    assert_eq!(pair.server.stats().server_busy_count, 1);
    let client_events = drain_events(&mut pair.client);
    assert!(client_events.iter().any(|event| matches!(
        event,
        EndpointEvent::Session(handle, SessionEvent::SessionClose { .. }) if *handle == ch
    )));
}

#[test]
fn stateless_reset_rate_is_capped() {
    let t0 = ms(0);
    let server_cfg = EndpointConfig {
        max_stateless_resets_per_host: 2,
        ..EndpointConfig::default()
    };
    let link = TestLink::new();
    let mut server = Endpoint::new(server_cfg, link.transport(addr(4433)), t0);
    server.listen(Arc::new(TestTlsContext::new()), session_config(), t0);

    // Unroutable short-header datagrams from one host.
    for i in 0..5u64 {
        let mut datagram = vec![0x40u8; 64];
        datagram[1] = i as u8; // vary the fake DCID
        server.receive(addr(4433), addr(7001), &datagram, ms(i));
    }
    assert_eq!(server.stats().stateless_reset_count, 2);
}

// ============================================================================
// ALPN mismatch
// ============================================================================

#[test]
fn rejected_alpn_closes_with_protocol_error() {
    let t0 = ms(0);
    let mut pair = Pair::defaults(t0);
    let config = SessionConfig {
        alpn: vec![Bytes::from_static(b"not-h3")],
        server_name: Some("localhost".to_string()),
        ..SessionConfig::default()
    };
    let ch = pair.connect(config, t0);
    pair.pump(ms(10));

    let client_events = drain_events(&mut pair.client);
    assert!(
        !has_handshake_event(&client_events),
        "no handshake event on ALPN rejection"
    );
    let close = client_events.iter().find_map(|event| match event {
        EndpointEvent::Session(handle, SessionEvent::SessionClose { error, .. })
            if *handle == ch =>
        {
            Some(*error)
        }
        _ => None,
    });
    let error = close.expect("session close event");
    assert_eq!(error.family, ErrorFamily::Crypto);
    assert_eq!(error.code & 0xff, 120, "no_application_protocol alert");
}

// ============================================================================
// Graceful close
// ============================================================================

#[test]
fn graceful_close_finishes_streams_first() {
    let t0 = ms(0);
    let mut pair = Pair::defaults(t0);
    let ch = pair.connect(client_config(), t0);
    pair.pump(ms(10));
    drain_events(&mut pair.client);
    let server_events = drain_events(&mut pair.server);
    let _sh = server_handle(&server_events);

    let stream = pair
        .client
        .open_stream(ch, StreamDirection::Bidirectional, ms(20))
        .unwrap();
    pair.client
        .stream_write(ch, stream, Bytes::from_static(b"last words"), true, ms(21))
        .unwrap();
    pair.client.close_session_gracefully(ch, ms(22)).unwrap();

    // Graceful close refuses new streams immediately.
    assert!(pair
        .client
        .open_stream(ch, StreamDirection::Bidirectional, ms(23))
        .is_err());

    pair.pump(ms(25));
    let server_events = drain_events(&mut pair.server);
    let (payload, fin) = stream_data(&server_events, stream);
    assert_eq!(payload, b"last words", "in-flight stream completed");
    assert!(fin);
}

// ============================================================================
// Stream reset
// ============================================================================

#[test]
fn shutdown_stream_resets_both_directions() {
    let t0 = ms(0);
    let mut pair = Pair::defaults(t0);
    let ch = pair.connect(client_config(), t0);
    pair.pump(ms(10));
    drain_events(&mut pair.client);
    let server_events = drain_events(&mut pair.server);
    let sh = server_handle(&server_events);

    let stream = pair
        .client
        .open_stream(ch, StreamDirection::Bidirectional, ms(20))
        .unwrap();
    pair.client
        .stream_write(ch, stream, Bytes::from_static(b"partial"), false, ms(21))
        .unwrap();
    pair.pump(ms(22));
    drain_events(&mut pair.server);

    // The server aborts the exchange.
    pair.server
        .shutdown_stream(sh, stream, 0x77, ms(30))
        .unwrap();
    pair.pump(ms(31));

    let client_events = drain_events(&mut pair.client);
    let reset = client_events.iter().find_map(|event| match event {
        EndpointEvent::Session(_, SessionEvent::StreamReset { id, error_code, .. })
            if *id == stream =>
        {
            Some(*error_code)
        }
        _ => None,
    });
    assert_eq!(reset, Some(0x77));
}

// ============================================================================
// Peer identity verification surfaced, not enforced
// ============================================================================

#[test]
fn failed_certificate_verification_is_surfaced() {
    let t0 = ms(0);
    let link = TestLink::new();
    let server_addr = addr(4433);
    let client_addr = addr(5544);
    let mut server = Endpoint::new(EndpointConfig::default(), link.transport(server_addr), t0);
    server.listen(Arc::new(TestTlsContext::new()), session_config(), t0);
    let mut client = Endpoint::new(EndpointConfig::default(), link.transport(client_addr), t0);

    let mut provider = TestTlsProvider::new();
    provider.fail_cert_verification = true;
    let ch = client
        .connect(server_addr, client_config(), Box::new(provider), t0)
        .unwrap();

    for _ in 0..16 {
        let batch = link.drain();
        if batch.is_empty() {
            break;
        }
        for datagram in batch {
            if datagram.to == server_addr {
                server.receive(datagram.to, datagram.from, &datagram.data, ms(1));
            } else {
                client.receive(datagram.to, datagram.from, &datagram.data, ms(1));
            }
        }
    }

    let mut verify_code = None;
    while let Some(event) = client.poll_event() {
        if let EndpointEvent::Session(_, SessionEvent::Handshake { verify_code: code, .. }) = event
        {
            verify_code = Some(code);
        }
    }
    // The transport stays up; the application decides what to do.
    assert_eq!(verify_code, Some(1));
    assert!(client.session(ch).is_some());
}
