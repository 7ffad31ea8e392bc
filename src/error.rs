//! Error types for the WebSocket hub

use std::fmt;
use std::io;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying transport
    Io(io::Error),
    /// Malformed upgrade request; the connection is dropped without a 101
    Handshake(&'static str),
    /// The authenticate hook refused the connection
    HandshakeRejected,
    /// Unsupported Sec-WebSocket-Version; a 400 advertising version 13 is sent
    UnsupportedVersion(u16),
    /// Protocol violation; the connection closes with status 1002
    Protocol(&'static str),
    /// Invalid UTF-8 in a text message
    InvalidUtf8,
    /// Reassembled message exceeds the configured limit
    MessageTooLarge,
    /// Single frame payload exceeds the configured limit
    FrameTooLarge,
    /// The channel completed; reads and writes observe a closed connection
    ConnectionClosed,
    /// The per-connection egress queue is full; the target is marked closed
    SendQueueFull,
    /// Operation not valid for the hub's current state
    InvalidState(&'static str),
}

/// Close frame status code and reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// Invalid frame payload (bad UTF-8)
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if the close code may appear on the wire per RFC 6455
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Handshake(msg) => write!(f, "Handshake failed: {}", msg),
            Error::HandshakeRejected => write!(f, "Handshake rejected by authenticate hook"),
            Error::UnsupportedVersion(v) => write!(f, "Unsupported WebSocket version: {}", v),
            Error::Protocol(msg) => write!(f, "Protocol violation: {}", msg),
            Error::InvalidUtf8 => write!(f, "Invalid UTF-8 in text message"),
            Error::MessageTooLarge => write!(f, "Message too large"),
            Error::FrameTooLarge => write!(f, "Frame too large"),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::SendQueueFull => write!(f, "Egress queue full"),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}

impl Error {
    /// Close code this error maps to when failing the connection
    pub(crate) fn close_code(&self) -> u16 {
        match self {
            Error::Protocol(_) => CloseReason::PROTOCOL_ERROR,
            Error::InvalidUtf8 => CloseReason::INVALID_PAYLOAD,
            Error::MessageTooLarge | Error::FrameTooLarge => CloseReason::TOO_BIG,
            _ => CloseReason::INTERNAL,
        }
    }
}
