//! # Error model
//!
//! Errors carry a **family** tag and a 62-bit code. The `session` family
//! holds QUIC transport error codes (RFC 9000 Section 20.1), `crypto`
//! holds TLS alerts (the alert number is the low byte of the wire code),
//! and `application` codes are opaque to the transport.

use thiserror::Error;

/// QUIC transport error codes (RFC 9000 Section 20.1).
pub mod codes {
    pub const NO_ERROR: u64 = 0x00;
    pub const INTERNAL_ERROR: u64 = 0x01;
    pub const CONNECTION_REFUSED: u64 = 0x02;
    pub const FLOW_CONTROL_ERROR: u64 = 0x03;
    pub const STREAM_LIMIT_ERROR: u64 = 0x04;
    pub const STREAM_STATE_ERROR: u64 = 0x05;
    pub const FINAL_SIZE_ERROR: u64 = 0x06;
    pub const FRAME_ENCODING_ERROR: u64 = 0x07;
    pub const TRANSPORT_PARAMETER_ERROR: u64 = 0x08;
    pub const CONNECTION_ID_LIMIT_ERROR: u64 = 0x09;
    pub const PROTOCOL_VIOLATION: u64 = 0x0a;
    pub const INVALID_TOKEN: u64 = 0x0b;
    pub const APPLICATION_ERROR: u64 = 0x0c;
    pub const CRYPTO_BUFFER_EXCEEDED: u64 = 0x0d;
    pub const KEY_UPDATE_ERROR: u64 = 0x0e;
    pub const AEAD_LIMIT_REACHED: u64 = 0x0f;
    pub const NO_VIABLE_PATH: u64 = 0x10;
    /// Base of the CRYPTO_ERROR range; the TLS alert is the low byte.
    pub const CRYPTO_ERROR: u64 = 0x0100;
}

/// Error family. Determines how the 62-bit code is interpreted and which
/// CONNECTION_CLOSE frame variant carries it on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFamily {
    /// Transport-level (RFC 9000 Section 20.1 codes).
    Session,
    /// TLS alert; the alert number is the low byte of the code.
    Crypto,
    /// Application-defined; opaque to the transport.
    Application,
}

impl ErrorFamily {
    pub fn name(self) -> &'static str {
        match self {
            ErrorFamily::Session => "session",
            ErrorFamily::Crypto => "crypto",
            ErrorFamily::Application => "application",
        }
    }
}

/// A family-tagged 62-bit error code, as surfaced to the application and
/// recorded as a session's `last_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuicError {
    pub family: ErrorFamily,
    pub code: u64,
}

impl QuicError {
    pub fn session(code: u64) -> Self {
        Self {
            family: ErrorFamily::Session,
            code,
        }
    }

    /// A crypto error from a TLS alert number.
    pub fn crypto(alert: u8) -> Self {
        Self {
            family: ErrorFamily::Crypto,
            code: codes::CRYPTO_ERROR | u64::from(alert),
        }
    }

    pub fn application(code: u64) -> Self {
        Self {
            family: ErrorFamily::Application,
            code,
        }
    }

    pub fn internal() -> Self {
        Self::session(codes::INTERNAL_ERROR)
    }

    /// The code as carried in a CONNECTION_CLOSE frame. Session and crypto
    /// families share the transport close frame (0x1c); application codes
    /// ride the application close frame (0x1d).
    pub fn wire_code(&self) -> u64 {
        self.code
    }

    /// Rebuild from a received CONNECTION_CLOSE frame.
    pub fn from_wire(code: u64, application: bool) -> Self {
        if application {
            Self::application(code)
        } else if (codes::CRYPTO_ERROR..codes::CRYPTO_ERROR + 0x100).contains(&code) {
            Self {
                family: ErrorFamily::Crypto,
                code,
            }
        } else {
            Self::session(code)
        }
    }
}

impl std::fmt::Display for QuicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error {:#x}", self.family.name(), self.code)
    }
}

/// Internal error type for fallible transport operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Fatal transport condition; closes the connection with the code.
    #[error("transport error {0:#x}")]
    Transport(u64),

    /// Fatal TLS condition, carrying the alert number.
    #[error("crypto error: TLS alert {0}")]
    Crypto(u8),

    /// 62-bit packet number space exhausted; the session must close
    /// silently (no further packet can be protected).
    #[error("packet number space exhausted")]
    PktNumExhausted,

    /// Datagram or packet that could not be parsed; dropped, not fatal.
    #[error("malformed packet")]
    InvalidPacket,

    /// Retry token missing, expired, or failing its MAC.
    #[error("invalid retry token")]
    InvalidRetryToken,

    /// Operation attempted from inside a transport callback.
    #[error("operation reentered from a transport callback")]
    Reentry,

    /// Operation invalid in the session's current lifecycle state.
    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    /// Referenced stream does not exist.
    #[error("unknown stream {0}")]
    UnknownStream(u64),

    /// Output buffer too small for the requested serialization.
    #[error("buffer too small")]
    BufferTooSmall,
}

impl Error {
    /// The family-tagged error to record as `last_error` when this error
    /// is fatal to a session.
    pub fn quic_error(&self) -> QuicError {
        match self {
            Error::Transport(code) => QuicError::session(*code),
            Error::Crypto(alert) => QuicError::crypto(*alert),
            Error::InvalidRetryToken => QuicError::session(codes::INVALID_TOKEN),
            _ => QuicError::internal(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_code_carries_alert_in_low_byte() {
        let err = QuicError::crypto(120); // no_application_protocol
        assert_eq!(err.code, 0x0178);
        assert_eq!(err.code & 0xff, 120);
        assert_eq!(err.family, ErrorFamily::Crypto);
    }

    #[test]
    fn wire_round_trip_preserves_family() {
        let e = QuicError::crypto(80);
        assert_eq!(QuicError::from_wire(e.wire_code(), false), e);

        let s = QuicError::session(codes::PROTOCOL_VIOLATION);
        assert_eq!(QuicError::from_wire(s.wire_code(), false), s);

        let a = QuicError::application(123);
        assert_eq!(QuicError::from_wire(a.wire_code(), true), a);
    }

    #[test]
    fn fatal_errors_map_to_families() {
        assert_eq!(
            Error::Transport(codes::FLOW_CONTROL_ERROR).quic_error(),
            QuicError::session(codes::FLOW_CONTROL_ERROR)
        );
        assert_eq!(Error::Crypto(40).quic_error(), QuicError::crypto(40));
        assert_eq!(Error::PktNumExhausted.quic_error(), QuicError::internal());
    }
}
