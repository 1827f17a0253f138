//! # Test support
//!
//! Deterministic stand-ins for the two seams the core leaves abstract:
//! a [`TestTlsProvider`] that runs a scripted TLS-1.3-shaped handshake
//! (hello/finished blobs carrying ALPN and transport parameters, with
//! per-level secrets derived from the exchanged nonces), and a
//! [`TestLink`] in-memory datagram network. Both are used throughout
//! the unit and integration tests; neither is a security boundary.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::RngCore;

use crate::crypto::{
    kdf, ClientHello, DriveStatus, HandshakeConfig, HandshakeEvents, HandshakeFlow,
    HandshakeSummary, Level, TlsContext, TlsProvider,
};
use crate::endpoint::DatagramTransport;
use crate::error::{Error, Result};
use crate::transport::TransportParams;
use crate::types::Side;

// ============================================================================
// In-memory datagram network
// ============================================================================

/// A datagram captured in flight.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub data: Vec<u8>,
}

/// A shared queue standing in for the network between endpoints.
#[derive(Debug, Clone, Default)]
pub struct TestLink {
    queue: Arc<Mutex<VecDeque<Datagram>>>,
}

impl TestLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport bound to `local` that sends into this link.
    pub fn transport(&self, local: SocketAddr) -> Box<dyn DatagramTransport> {
        Box::new(LinkTransport {
            local,
            queue: Arc::clone(&self.queue),
        })
    }

    /// Take every in-flight datagram.
    pub fn drain(&self) -> Vec<Datagram> {
        match self.queue.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().map(|q| q.is_empty()).unwrap_or(true)
    }
}

struct LinkTransport {
    local: SocketAddr,
    queue: Arc<Mutex<VecDeque<Datagram>>>,
}

impl DatagramTransport for LinkTransport {
    fn send(&mut self, remote: SocketAddr, data: &[u8]) -> std::io::Result<()> {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push_back(Datagram {
                from: self.local,
                to: remote,
                data: data.to_vec(),
            });
        }
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

// ============================================================================
// Scripted TLS provider
// ============================================================================

const MSG_CLIENT_HELLO: u8 = 0x01;
const MSG_SERVER_HELLO: u8 = 0x02;
const MSG_SERVER_FINISHED: u8 = 0x03;
const MSG_CLIENT_FINISHED: u8 = 0x04;
const MSG_TICKET: u8 = 0x05;

const CIPHER_NAME: &str = "TLS_AES_128_GCM_SHA256";
const CIPHER_VERSION: &str = "TLSv1.3";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Idle,
    AwaitClientHelloDone,
    AwaitCertDone,
    HelloSent,
}

/// Deterministic handshake driver for tests.
#[derive(Debug)]
pub struct TestTlsProvider {
    side: Side,
    config: HandshakeConfig,
    /// Per-level inbound reassembly.
    inbox: [Vec<u8>; Level::COUNT],
    client_nonce: [u8; 32],
    server_nonce: [u8; 32],
    peer_hello: Option<ClientHello>,
    negotiated_alpn: Option<Bytes>,
    server_name: Option<String>,
    state: ServerState,
    complete: bool,
    ticket: Option<Bytes>,
    imported_ticket: Option<Bytes>,
    keylog: bool,
    /// Force verification failures (test hooks).
    pub fail_cert_verification: bool,
    pub fail_hostname_verification: bool,
}

impl Default for TestTlsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TestTlsProvider {
    pub fn new() -> Self {
        Self {
            side: Side::Client,
            config: HandshakeConfig::default(),
            inbox: Default::default(),
            client_nonce: [0u8; 32],
            server_nonce: [0u8; 32],
            peer_hello: None,
            negotiated_alpn: None,
            server_name: None,
            state: ServerState::Idle,
            complete: false,
            ticket: None,
            imported_ticket: None,
            keylog: false,
            fail_cert_verification: false,
            fail_hostname_verification: false,
        }
    }

    fn secrets(&self, label: &str) -> [u8; 32] {
        kdf(&[&self.client_nonce, &self.server_nonce, label.as_bytes()])
    }

    fn push_message(out: &mut Vec<u8>, tag: u8, body: &[u8]) {
        out.push(tag);
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body);
    }

    /// Pop one complete `tag | len | body` message from a level inbox.
    fn pop_message(&mut self, level: Level) -> Option<(u8, Vec<u8>)> {
        let buf = &mut self.inbox[level.index()];
        if buf.len() < 5 {
            return None;
        }
        let tag = buf[0];
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if buf.len() < 5 + len {
            return None;
        }
        let body = buf[5..5 + len].to_vec();
        buf.drain(..5 + len);
        Some((tag, body))
    }

    fn emit_keylog(&self, events: &mut dyn HandshakeEvents, label: &str) {
        if self.keylog {
            let mut line = Vec::new();
            line.extend_from_slice(label.as_bytes());
            line.push(b' ');
            for byte in self.client_nonce.iter().take(8) {
                line.extend_from_slice(format!("{byte:02x}").as_bytes());
            }
            line.push(b'\n');
            events.on_keylog(&line);
        }
    }

    fn encode_client_hello(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.client_nonce);
        body.push(self.config.alpn.len() as u8);
        for alpn in &self.config.alpn {
            body.push(alpn.len() as u8);
            body.extend_from_slice(alpn);
        }
        match &self.config.server_name {
            Some(name) => {
                body.push(name.len() as u8);
                body.extend_from_slice(name.as_bytes());
            }
            None => body.push(0),
        }
        let params = self.config.transport_params.encode();
        body.extend_from_slice(&(params.len() as u16).to_be_bytes());
        body.extend_from_slice(&params);
        body.push(u8::from(self.config.request_ocsp));
        let ticket = self.imported_ticket.as_deref().unwrap_or(&[]);
        body.extend_from_slice(&(ticket.len() as u16).to_be_bytes());
        body.extend_from_slice(ticket);
        body
    }

    fn parse_client_hello(&mut self, body: &[u8]) -> Result<(ClientHello, TransportParams)> {
        let mut pos = 0usize;
        let take = |pos: &mut usize, n: usize| -> Result<Vec<u8>> {
            if body.len() < *pos + n {
                return Err(Error::Crypto(50)); // decode_error
            }
            let out = body[*pos..*pos + n].to_vec();
            *pos += n;
            Ok(out)
        };
        self.client_nonce
            .copy_from_slice(&take(&mut pos, 32)?);
        let alpn_count = take(&mut pos, 1)?[0] as usize;
        let mut alpn = Vec::with_capacity(alpn_count);
        for _ in 0..alpn_count {
            let len = take(&mut pos, 1)?[0] as usize;
            alpn.push(Bytes::from(take(&mut pos, len)?));
        }
        let sni_len = take(&mut pos, 1)?[0] as usize;
        let server_name = if sni_len > 0 {
            Some(String::from_utf8_lossy(&take(&mut pos, sni_len)?).into_owned())
        } else {
            None
        };
        let params_len = {
            let bytes = take(&mut pos, 2)?;
            u16::from_be_bytes([bytes[0], bytes[1]]) as usize
        };
        let params =
            TransportParams::decode(&take(&mut pos, params_len)?).ok_or(Error::Crypto(50))?;
        let _request_ocsp = take(&mut pos, 1)?[0] != 0;
        let hello = ClientHello {
            alpn,
            server_name,
            cipher_list: vec![CIPHER_NAME.to_string()],
        };
        Ok((hello, params))
    }

    /// Server: emit ServerHello + Finished and install secrets.
    fn proceed_server_hello(&mut self, events: &mut dyn HandshakeEvents) -> Result<DriveStatus> {
        let hello = self
            .peer_hello
            .clone()
            .ok_or(Error::Crypto(10))?; // unexpected_message
        rand::thread_rng().fill_bytes(&mut self.server_nonce);

        // First client protocol we also accept wins.
        self.negotiated_alpn = hello
            .alpn
            .iter()
            .find(|offered| self.config.alpn.iter().any(|ours| ours == *offered))
            .cloned();
        self.server_name = hello.server_name.clone();

        let mut body = Vec::new();
        body.extend_from_slice(&self.server_nonce);
        match &self.negotiated_alpn {
            Some(alpn) => {
                body.push(alpn.len() as u8);
                body.extend_from_slice(alpn);
            }
            None => body.push(0),
        }
        let params = self.config.transport_params.encode();
        body.extend_from_slice(&(params.len() as u16).to_be_bytes());
        body.extend_from_slice(&params);

        let mut msg = Vec::new();
        Self::push_message(&mut msg, MSG_SERVER_HELLO, &body);
        events.write_handshake(Level::Initial, &msg);

        // Server reads client-direction secrets, writes server-direction.
        events.on_secrets(
            Level::Handshake,
            &self.secrets("hs client"),
            &self.secrets("hs server"),
        )?;
        self.emit_keylog(events, "SERVER_HANDSHAKE_TRAFFIC_SECRET");

        let fin = self.secrets("server fin");
        let mut msg = Vec::new();
        Self::push_message(&mut msg, MSG_SERVER_FINISHED, &fin);
        events.write_handshake(Level::Handshake, &msg);

        events.on_secrets(
            Level::Application,
            &self.secrets("app client"),
            &self.secrets("app server"),
        )?;
        self.emit_keylog(events, "SERVER_TRAFFIC_SECRET_0");

        self.state = ServerState::HelloSent;
        Ok(DriveStatus::Ok)
    }

    fn summary(&self) -> HandshakeSummary {
        HandshakeSummary {
            alpn: self.negotiated_alpn.clone(),
            cipher: Some(CIPHER_NAME.to_string()),
            cipher_version: Some(CIPHER_VERSION.to_string()),
            server_name: self.server_name.clone(),
            verify_code: 0,
            verify_reason: None,
        }
    }

    fn drive(&mut self, events: &mut dyn HandshakeEvents) -> Result<DriveStatus> {
        loop {
            let message = self
                .pop_message(Level::Initial)
                .or_else(|| self.pop_message(Level::Handshake))
                .or_else(|| self.pop_message(Level::Application));
            let (tag, body) = match message {
                Some(m) => m,
                None => return Ok(DriveStatus::Ok),
            };
            match (self.side, tag) {
                (Side::Server, MSG_CLIENT_HELLO) => {
                    let (hello, params) = self.parse_client_hello(&body)?;
                    events.on_transport_params(params);
                    self.peer_hello = Some(hello.clone());
                    match events.on_client_hello(&hello) {
                        HandshakeFlow::Suspend => {
                            self.state = ServerState::AwaitClientHelloDone;
                            return Ok(DriveStatus::WantClientHello);
                        }
                        HandshakeFlow::Proceed => match events.on_cert_request(
                            hello.server_name.as_deref(),
                        ) {
                            HandshakeFlow::Suspend => {
                                self.state = ServerState::AwaitCertDone;
                                return Ok(DriveStatus::WantX509Lookup);
                            }
                            HandshakeFlow::Proceed => {
                                self.proceed_server_hello(events)?;
                            }
                        },
                    }
                }
                (Side::Server, MSG_CLIENT_FINISHED) => {
                    if body != self.secrets("client fin") {
                        return Err(Error::Crypto(51)); // decrypt_error
                    }
                    self.complete = true;
                    events.on_handshake_complete(self.summary());
                    // Resumption ticket for the client's next connection.
                    let ticket = self.secrets("ticket");
                    let mut msg = Vec::new();
                    Self::push_message(&mut msg, MSG_TICKET, &ticket);
                    events.write_handshake(Level::Application, &msg);
                }
                (Side::Client, MSG_SERVER_HELLO) => {
                    if body.len() < 33 {
                        return Err(Error::Crypto(50));
                    }
                    self.server_nonce.copy_from_slice(&body[..32]);
                    let alpn_len = body[32] as usize;
                    if body.len() < 33 + alpn_len + 2 {
                        return Err(Error::Crypto(50));
                    }
                    self.negotiated_alpn = if alpn_len > 0 {
                        Some(Bytes::copy_from_slice(&body[33..33 + alpn_len]))
                    } else {
                        None
                    };
                    let mut pos = 33 + alpn_len;
                    let params_len =
                        u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
                    pos += 2;
                    if body.len() < pos + params_len {
                        return Err(Error::Crypto(50));
                    }
                    let params = TransportParams::decode(&body[pos..pos + params_len])
                        .ok_or(Error::Crypto(50))?;
                    events.on_transport_params(params);
                    events.on_secrets(
                        Level::Handshake,
                        &self.secrets("hs server"),
                        &self.secrets("hs client"),
                    )?;
                    self.emit_keylog(events, "CLIENT_HANDSHAKE_TRAFFIC_SECRET");
                }
                (Side::Client, MSG_SERVER_FINISHED) => {
                    if body != self.secrets("server fin") {
                        return Err(Error::Crypto(51));
                    }
                    events.on_secrets(
                        Level::Application,
                        &self.secrets("app server"),
                        &self.secrets("app client"),
                    )?;
                    self.emit_keylog(events, "CLIENT_TRAFFIC_SECRET_0");
                    let fin = self.secrets("client fin");
                    let mut msg = Vec::new();
                    Self::push_message(&mut msg, MSG_CLIENT_FINISHED, &fin);
                    events.write_handshake(Level::Handshake, &msg);
                    self.complete = true;
                    events.on_handshake_complete(self.summary());
                }
                (Side::Client, MSG_TICKET) => {
                    self.ticket = Some(Bytes::from(body.clone()));
                    events.on_session_ticket(&body);
                }
                _ => return Err(Error::Crypto(10)), // unexpected_message
            }
        }
    }
}

impl TlsProvider for TestTlsProvider {
    fn init(&mut self, side: Side, config: HandshakeConfig) -> Result<()> {
        self.side = side;
        self.server_name = config.server_name.clone();
        self.config = config;
        Ok(())
    }

    fn start(&mut self, events: &mut dyn HandshakeEvents) -> Result<DriveStatus> {
        if self.side.is_server() {
            return Ok(DriveStatus::Ok);
        }
        rand::thread_rng().fill_bytes(&mut self.client_nonce);
        let body = self.encode_client_hello();
        let mut msg = Vec::new();
        Self::push_message(&mut msg, MSG_CLIENT_HELLO, &body);
        events.write_handshake(Level::Initial, &msg);
        Ok(DriveStatus::Ok)
    }

    fn read_write_crypto_data(
        &mut self,
        level: Level,
        data: &[u8],
        events: &mut dyn HandshakeEvents,
    ) -> Result<DriveStatus> {
        self.inbox[level.index()].extend_from_slice(data);
        if matches!(
            self.state,
            ServerState::AwaitClientHelloDone | ServerState::AwaitCertDone
        ) {
            // Parked: buffer input, emit nothing until resumed.
            return Ok(match self.state {
                ServerState::AwaitCertDone => DriveStatus::WantX509Lookup,
                _ => DriveStatus::WantClientHello,
            });
        }
        self.drive(events)
    }

    fn on_client_hello_done(&mut self, events: &mut dyn HandshakeEvents) -> Result<DriveStatus> {
        if self.state != ServerState::AwaitClientHelloDone {
            return Err(Error::InvalidState("no client hello pending"));
        }
        let hello = self.peer_hello.clone().ok_or(Error::Crypto(10))?;
        match events.on_cert_request(hello.server_name.as_deref()) {
            HandshakeFlow::Suspend => {
                self.state = ServerState::AwaitCertDone;
                Ok(DriveStatus::WantX509Lookup)
            }
            HandshakeFlow::Proceed => {
                self.proceed_server_hello(events)?;
                self.drive(events)
            }
        }
    }

    fn on_cert_done(
        &mut self,
        _ocsp_response: Option<Bytes>,
        events: &mut dyn HandshakeEvents,
    ) -> Result<DriveStatus> {
        if self.state != ServerState::AwaitCertDone {
            return Err(Error::InvalidState("no certificate request pending"));
        }
        self.proceed_server_hello(events)?;
        self.drive(events)
    }

    fn verify_peer_certificate(&self) -> u64 {
        u64::from(self.fail_cert_verification)
    }

    fn verify_hostname(&self, _hostname: &str) -> u64 {
        u64::from(self.fail_hostname_verification)
    }

    fn cipher(&self) -> Option<String> {
        self.complete.then(|| CIPHER_NAME.to_string())
    }

    fn cipher_version(&self) -> Option<String> {
        self.complete.then(|| CIPHER_VERSION.to_string())
    }

    fn alpn(&self) -> Option<Bytes> {
        self.negotiated_alpn.clone()
    }

    fn servername(&self) -> Option<String> {
        self.server_name.clone()
    }

    fn session_ticket(&self) -> Option<Bytes> {
        self.ticket.clone()
    }

    fn set_session(&mut self, ticket: &[u8]) -> Result<()> {
        self.imported_ticket = Some(Bytes::copy_from_slice(ticket));
        Ok(())
    }

    fn set_keylog_enabled(&mut self, enabled: bool) {
        self.keylog = enabled;
    }

    fn is_handshake_complete(&self) -> bool {
        self.complete
    }
}

/// [`TlsContext`] over [`TestTlsProvider`], with optional per-provider
/// tweaks applied at creation.
pub struct TestTlsContext {
    tweak: Option<Box<dyn Fn(&mut TestTlsProvider) + Send + Sync>>,
}

impl TestTlsContext {
    pub fn new() -> Self {
        Self { tweak: None }
    }

    pub fn with_tweak(tweak: impl Fn(&mut TestTlsProvider) + Send + Sync + 'static) -> Self {
        Self {
            tweak: Some(Box::new(tweak)),
        }
    }
}

impl Default for TestTlsContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsContext for TestTlsContext {
    fn new_provider(&self) -> Box<dyn TlsProvider> {
        let mut provider = TestTlsProvider::new();
        if let Some(tweak) = &self.tweak {
            tweak(&mut provider);
        }
        Box::new(provider)
    }
}
