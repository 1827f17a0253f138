//! # quicport: QUIC v1 transport endpoint
//!
//! The connection state machine, packet pipeline, and lifecycle engine
//! that sits between a UDP datagram transport and application streams.
//! Server and client roles, the TLS 1.3 handshake driven through an
//! abstract provider, stream multiplexing with flow control, connection
//! identification, path validation, loss detection and retransmission,
//! key updates, and the closing/draining protocol (RFC 8999, RFC 9000,
//! RFC 9001, RFC 9002).
//!
//! ## Architecture
//!
//! ```text
//! quicport/
//! ├── types      - CIDs, reset tokens, varints, wire constants
//! ├── error      - error families (session/crypto/application) + codes
//! ├── buffer     - packet buffers, chunk queues, range accounting
//! ├── timer      - monotonic cancellable millisecond timers
//! ├── cid        - CID generation and the cid/token routing tables
//! ├── addr       - per-peer counters and the validated-address LRU
//! ├── crypto     - crypto levels, buffers, TLS provider seam
//! ├── stream     - stream objects and the per-session stream table
//! ├── packet     - header and frame wire codec
//! ├── transport  - per-connection machine (pn spaces, acks, congestion)
//! ├── session    - lifecycle engine (handshake, pipelines, close)
//! ├── endpoint   - datagram demux, admission, stateless packets
//! └── testing    - deterministic provider + in-memory network
//! ```
//!
//! ## Design
//!
//! 1. **Pure state machines.** No sockets, no clocks: the host feeds
//!    datagrams and timestamps in and carries packets out through the
//!    [`endpoint::DatagramTransport`] seam.
//!
//! 2. **Single-threaded cooperative.** An endpoint and its sessions are
//!    driven from one task; the only suspension is the cooperative
//!    handshake park (ClientHello / certificate callouts).
//!
//! 3. **Pluggable TLS.** The transport is not a TLS stack; it drives a
//!    [`crypto::TlsProvider`] and installs the secrets it yields.
//!
//! ## Usage sketch
//!
//! ```rust,ignore
//! let mut server = Endpoint::new(EndpointConfig::default(), io, now);
//! server.listen(tls_context, session_config, now);
//! // host loop:
//! server.receive(local, remote, &datagram, now);
//! while let Some(event) = server.poll_event() { /* dispatch */ }
//! if let Some(deadline) = server.next_expiry() { /* arm timer */ }
//! server.handle_expiry(now);
//! ```

#![forbid(unsafe_code)]

pub mod addr;
pub mod buffer;
pub mod cid;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod packet;
pub mod session;
pub mod stream;
pub mod testing;
pub mod timer;
pub mod transport;
pub mod types;

pub use crypto::{
    CryptoBuffers, DriveStatus, HandshakeConfig, HandshakeEvents, HandshakeFlow, Level,
    PacketProtection, TlsContext, TlsProvider,
};
pub use endpoint::{
    DatagramTransport, Endpoint, EndpointConfig, EndpointEvent, SessionHandle, SocketStats,
};
pub use error::{codes, Error, ErrorFamily, QuicError, Result};
pub use session::{Session, SessionConfig, SessionEvent, SessionFlags, SessionStats};
pub use stream::{Stream, StreamFlags, StreamTable};
pub use transport::{TransportParams, PreferredAddress};
pub use types::{
    ConnectionId, Side, StatelessResetToken, StreamDirection, Timestamp, QUIC_VERSION,
};
