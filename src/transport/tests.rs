//! Transport machine tests: packet round trips between two machines,
//! ack/loss bookkeeping, flow-control gates, and key updates.

use bytes::Bytes;

use super::*;
use crate::crypto::CryptoBuffers;
use crate::stream::Stream;
use crate::types::{ConnectionId, LOCAL_CID_LEN};

/// Sink that records everything for assertions.
#[derive(Default)]
struct RecordingSink {
    crypto: Vec<(Level, Bytes)>,
    crypto_acked: Vec<(Level, u64)>,
    streams: Vec<(u64, u64, Bytes, bool)>,
    stream_acked: Vec<(u64, u64, u64, bool)>,
    closes: Vec<(QuicError, Bytes)>,
    handshake_done: bool,
    path_results: Vec<bool>,
}

impl TransportEvents for RecordingSink {
    fn on_crypto_data(&mut self, level: Level, data: Bytes) {
        self.crypto.push((level, data));
    }

    fn on_crypto_acked(&mut self, level: Level, amount: u64) {
        self.crypto_acked.push((level, amount));
    }

    fn on_stream_frame(&mut self, id: u64, offset: u64, data: Bytes, fin: bool) {
        self.streams.push((id, offset, data, fin));
    }

    fn on_stream_acked(&mut self, id: u64, offset: u64, len: u64, fin: bool) {
        self.stream_acked.push((id, offset, len, fin));
    }

    fn on_reset_stream(&mut self, _id: u64, _error_code: u64, _final_size: u64) {}

    fn on_stop_sending(&mut self, _id: u64, _error_code: u64) {}

    fn on_max_stream_data(&mut self, _id: u64, _maximum: u64) {}

    fn on_connection_close(&mut self, error: QuicError, reason: Bytes) {
        self.closes.push((error, reason));
    }

    fn on_handshake_done(&mut self) {
        self.handshake_done = true;
    }

    fn on_new_connection_id(
        &mut self,
        _sequence: u64,
        _cid: ConnectionId,
        _token: crate::types::StatelessResetToken,
    ) {
    }

    fn on_retire_connection_id(&mut self, _sequence: u64) {}

    fn on_new_token(&mut self, _token: Bytes) {}

    fn on_path_validation(&mut self, success: bool) {
        self.path_results.push(success);
    }
}

fn cid(byte: u8) -> ConnectionId {
    ConnectionId::from_slice(&[byte; LOCAL_CID_LEN]).unwrap()
}

fn ms(millis: u64) -> Timestamp {
    Timestamp::from_millis(millis)
}

/// A connected client/server machine pair sharing Initial keys.
fn machine_pair() -> (Transport, Transport) {
    let client_scid = cid(1);
    let initial_dcid = cid(2);
    let server_scid = cid(3);
    let client = Transport::new(
        Side::Client,
        client_scid,
        initial_dcid,
        TransportParams::default(),
        crate::types::MAX_PKTLEN_IPV4,
        ms(0),
    );
    let server = Transport::new_server(
        server_scid,
        client_scid,
        initial_dcid,
        TransportParams::default(),
        crate::types::MAX_PKTLEN_IPV4,
        ms(0),
    );
    (client, server)
}

/// Install matching application secrets and peer params on both sides.
fn establish(client: &mut Transport, server: &mut Transport) {
    let c2s = crate::crypto::kdf(&[b"c2s"]);
    let s2c = crate::crypto::kdf(&[b"s2c"]);
    client.install_secrets(Level::Application, &s2c, &c2s).unwrap();
    server.install_secrets(Level::Application, &c2s, &s2c).unwrap();
    client.apply_peer_params(TransportParams::default());
    server.apply_peer_params(TransportParams::default());
    client.on_handshake_complete();
    server.on_handshake_complete();
    // The server adopts the client CID as DCID from the first Initial;
    // short-circuit that here since these tests start at 1-RTT.
}

mod crypto_exchange {
    use super::*;

    #[test]
    fn initial_crypto_round_trip() {
        let (mut client, mut server) = machine_pair();
        let mut crypto = CryptoBuffers::new(1 << 20);
        crypto
            .submit(Level::Initial, Bytes::from_static(b"client hello bytes"))
            .unwrap();

        let mut streams = crate::stream::StreamTable::new();
        let packets = client.write_packets(ms(1), &crypto, &mut streams).unwrap();
        assert_eq!(packets.len(), 1);
        // Long-header datagrams are padded to the anti-amplification floor.
        assert!(packets[0].len() >= crate::types::MIN_INITIAL_SIZE);

        let mut sink = RecordingSink::default();
        let outcome = server
            .read_datagram(ms(2), packets[0].as_ref(), &mut sink)
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Normal);
        assert_eq!(sink.crypto.len(), 1);
        assert_eq!(&sink.crypto[0].1[..], b"client hello bytes");
        // The server now addresses the client's source CID.
        assert_eq!(server.dcid(), client.scid());
    }

    #[test]
    fn crypto_acked_only_after_ack_frame() {
        let (mut client, mut server) = machine_pair();
        let mut crypto = CryptoBuffers::new(1 << 20);
        crypto
            .submit(Level::Initial, Bytes::from_static(b"chunk-one"))
            .unwrap();
        let mut streams = crate::stream::StreamTable::new();
        let packets = client.write_packets(ms(1), &crypto, &mut streams).unwrap();

        let mut sink = RecordingSink::default();
        server
            .read_datagram(ms(2), packets[0].as_ref(), &mut sink)
            .unwrap();

        // Server sends its ack back.
        let server_crypto = CryptoBuffers::new(1 << 20);
        let mut server_streams = crate::stream::StreamTable::new();
        let acks = server
            .write_packets(ms(3), &server_crypto, &mut server_streams)
            .unwrap();
        assert!(!acks.is_empty());

        let mut client_sink = RecordingSink::default();
        for ack in &acks {
            client
                .read_datagram(ms(4), ack.as_ref(), &mut client_sink)
                .unwrap();
        }
        let acked: u64 = client_sink
            .crypto_acked
            .iter()
            .filter(|(l, _)| *l == Level::Initial)
            .map(|(_, n)| n)
            .sum();
        assert_eq!(acked, 9);
    }
}

mod stream_data {
    use super::*;

    #[test]
    fn stream_packet_round_trip_with_fin() {
        let (mut client, mut server) = machine_pair();
        establish(&mut client, &mut server);
        // Map the server's routing to the client's scid for short headers.
        let mut stream = Stream::new_local(0, Side::Client, 1 << 20, 1 << 20);
        stream.write(Bytes::from_static(b"ping"), true).unwrap();

        let write = client.write_stream(ms(5), &mut stream).unwrap();
        let (buf, consumed, fin) = match write {
            StreamWrite::Packet { buf, consumed, fin } => (buf, consumed, fin),
            other => panic!("expected packet, got {other:?}"),
        };
        assert_eq!(consumed, 4);
        assert!(fin);

        let mut sink = RecordingSink::default();
        let outcome = server.read_datagram(ms(6), buf.as_ref(), &mut sink).unwrap();
        assert_eq!(outcome, ReadOutcome::Normal);
        assert_eq!(sink.streams.len(), 1);
        let (id, offset, data, fin) = &sink.streams[0];
        assert_eq!((*id, *offset, *fin), (0, 0, true));
        assert_eq!(&data[..], b"ping");
    }

    #[test]
    fn stream_flow_control_blocks() {
        let (mut client, mut server) = machine_pair();
        establish(&mut client, &mut server);
        let mut stream = Stream::new_local(0, Side::Client, 4, 1 << 20);
        stream
            .write(Bytes::from_static(b"exceeds-window"), false)
            .unwrap();

        // First write sends the 4 permitted bytes.
        match client.write_stream(ms(5), &mut stream).unwrap() {
            StreamWrite::Packet { consumed, .. } => assert_eq!(consumed, 4),
            other => panic!("expected packet, got {other:?}"),
        }
        // Second is blocked on MAX_STREAM_DATA.
        assert!(matches!(
            client.write_stream(ms(6), &mut stream).unwrap(),
            StreamWrite::DataBlocked
        ));
    }

    #[test]
    fn stream_frames_forbidden_before_one_rtt() {
        let (mut client, mut server) = machine_pair();
        // No app keys: write_stream has nothing to protect with.
        let mut stream = Stream::new_local(0, Side::Client, 1 << 20, 1 << 20);
        stream.write(Bytes::from_static(b"early"), false).unwrap();
        assert!(matches!(
            client.write_stream(ms(1), &mut stream).unwrap(),
            StreamWrite::Nothing
        ));
        let _ = &mut server;
    }
}

mod loss_and_timers {
    use super::*;

    #[test]
    fn pto_expiry_requeues_lost_crypto() {
        let (mut client, _server) = machine_pair();
        let mut crypto = CryptoBuffers::new(1 << 20);
        crypto
            .submit(Level::Initial, Bytes::from_static(b"lost flight"))
            .unwrap();
        let mut streams = crate::stream::StreamTable::new();
        let first = client.write_packets(ms(0), &crypto, &mut streams).unwrap();
        assert_eq!(first.len(), 1);

        // Well past the PTO with no ack: the flight is declared lost...
        let mut sink = RecordingSink::default();
        let kind = client.handle_retransmit_timeout(ms(5_000), &mut sink);
        assert!(matches!(kind, TimeoutKind::Loss { packets: 1 }));

        // ...and the retransmission carries the same crypto bytes.
        let again = client.write_packets(ms(5_001), &crypto, &mut streams).unwrap();
        assert_eq!(again.len(), 1);
        assert!(client.retransmit_expiry().is_some());
    }

    #[test]
    fn retransmit_expiry_tracks_oldest_unacked() {
        let (mut client, _server) = machine_pair();
        assert!(client.retransmit_expiry().is_none());
        let mut crypto = CryptoBuffers::new(1 << 20);
        crypto
            .submit(Level::Initial, Bytes::from_static(b"x"))
            .unwrap();
        let mut streams = crate::stream::StreamTable::new();
        client.write_packets(ms(100), &crypto, &mut streams).unwrap();
        let expiry = client.retransmit_expiry().unwrap();
        assert!(expiry > ms(100));
    }

    #[test]
    fn idle_expiry_follows_activity() {
        let (mut client, mut server) = machine_pair();
        establish(&mut client, &mut server);
        let idle = client.idle_timeout_ms();
        assert_eq!(idle, 30_000);
        let expiry = client.idle_expiry().unwrap();
        assert_eq!(expiry, ms(30_000));
    }
}

mod key_update {
    use super::*;

    #[test]
    fn key_update_round_trip() {
        let (mut client, mut server) = machine_pair();
        establish(&mut client, &mut server);

        assert!(client.initiate_key_update());
        assert_eq!(client.key_update_count(), 1);

        // Traffic continues: a packet sealed under the new epoch opens
        // on the peer, which follows the phase flip.
        let mut stream = Stream::new_local(0, Side::Client, 1 << 20, 1 << 20);
        stream.write(Bytes::from_static(b"post-update"), false).unwrap();
        let buf = match client.write_stream(ms(10), &mut stream).unwrap() {
            StreamWrite::Packet { buf, .. } => buf,
            other => panic!("expected packet, got {other:?}"),
        };
        let mut sink = RecordingSink::default();
        let outcome = server.read_datagram(ms(11), buf.as_ref(), &mut sink).unwrap();
        assert_eq!(outcome, ReadOutcome::Normal);
        assert_eq!(sink.streams.len(), 1);
    }

    #[test]
    fn key_update_requires_established_session() {
        let (mut client, _server) = machine_pair();
        assert!(!client.initiate_key_update());
        assert_eq!(client.key_update_count(), 0);
    }
}

mod exhaustion_and_limits {
    use super::*;

    #[test]
    fn packet_number_exhaustion_is_fatal() {
        let (mut client, mut server) = machine_pair();
        establish(&mut client, &mut server);
        client.force_next_packet_number(Level::Application, (1u64 << 62) - 1 + 1);
        let mut stream = Stream::new_local(0, Side::Client, 1 << 20, 1 << 20);
        stream.write(Bytes::from_static(b"x"), false).unwrap();
        assert!(matches!(
            client.write_stream(ms(1), &mut stream),
            Err(Error::PktNumExhausted)
        ));
    }

    #[test]
    fn stream_id_allocation_respects_peer_limits() {
        let (mut client, mut server) = machine_pair();
        let mut params = TransportParams::default();
        params.initial_max_streams_bidi = 2;
        client.apply_peer_params(params);
        let _ = &mut server;

        assert_eq!(client.alloc_stream_id(StreamDirection::Bidirectional).unwrap(), 0);
        assert_eq!(client.alloc_stream_id(StreamDirection::Bidirectional).unwrap(), 4);
        assert!(client
            .alloc_stream_id(StreamDirection::Bidirectional)
            .is_err());
    }

    #[test]
    fn remote_stream_admission_enforces_local_limits() {
        let (_, mut server) = machine_pair();
        // Local limit comes from our own params (default 100): admit the
        // first, then clamp a flood.
        for n in 0..100u64 {
            server.admit_remote_stream(n * 4).unwrap();
        }
        assert!(server.admit_remote_stream(400).is_err());
    }
}

mod params_codec {
    use super::*;

    #[test]
    fn transport_params_round_trip() {
        let mut params = TransportParams::default();
        params.max_idle_timeout_ms = 200;
        params.initial_max_data = 123_456;
        params.stateless_reset_token = Some([9u8; 16]);
        params.preferred_address = Some(PreferredAddress {
            addr: "10.0.0.1:4433".parse().unwrap(),
            cid: cid(9),
            reset_token: [7u8; 16],
        });
        let encoded = params.encode();
        let decoded = TransportParams::decode(&encoded).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn params_decode_rejects_garbage_token() {
        // Token parameter with a bogus length.
        let bad = [0x02, 0x03, 0xaa, 0xbb, 0xcc];
        assert!(TransportParams::decode(&bad).is_none());
    }
}
