//! # Hubsock: WebSocket endpoint and broadcast hub
//!
//! A server-side WebSocket implementation (RFC 6455, with handshake
//! tolerance for drafts 4-8) built on a segmented byte-channel abstraction,
//! designed for fan-out workloads:
//!
//! - **SIMD masking**: AVX-512/AVX2/SSE2/NEON for payload unmasking
//! - **Zero-copy ingress**: frame payloads are detached from pooled read
//!   blocks and unmasked in place, never reassembled through intermediate
//!   copies
//! - **Streaming handshake**: the HTTP upgrade parser consumes the read
//!   stream segment by segment and leaves trailing bytes in the channel
//! - **Broadcast hub**: a concurrent connection registry with predicate
//!   fan-out, per-connection egress queues, and graceful shutdown
//!
//! ## Example
//!
//! ```ignore
//! use hubsock::{Config, ServerHub, WebSocketHandler, Connection, Message};
//! use std::sync::Arc;
//!
//! struct Chat;
//!
//! impl WebSocketHandler for Chat {
//!     async fn on_text(&self, conn: &Arc<Connection>, msg: Message) {
//!         conn.send_text(msg.text().unwrap_or_default()).await.ok();
//!     }
//! }
//!
//! let hub = ServerHub::new(Chat, Config::default());
//! hub.start(("0.0.0.0", 8080)).await?;
//! ```

#![allow(clippy::missing_safety_doc)]

pub mod buffer;
pub mod channel;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod http;
pub mod mask;
pub mod protocol;
pub mod server;
pub mod utf8;

pub use buffer::{Cursor, PreservedBuffer, ReadableBuffer};
pub use connection::{Connection, ConnectionId};
pub use error::{CloseReason, Error, Result};
pub use frame::{FrameHeader, OpCode};
pub use http::HttpRequest;
pub use protocol::{Message, Role};
pub use server::{ServerHub, WebSocketHandler};

/// WebSocket GUID appended to the client key when computing the accept token
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest payload encodable with a 1-byte length (2-byte header)
pub const SMALL_PAYLOAD_LIMIT: usize = 125;

/// Largest payload encodable with a 16-bit extended length (4-byte header)
pub const MEDIUM_PAYLOAD_LIMIT: usize = 65535;

/// Maximum wire header size (2 base + 8 extended length + 4 mask)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Size of a pooled read block on the channel input
pub const READ_BLOCK_SIZE: usize = 8 * 1024;

/// Initial capacity of an egress write buffer
pub const WRITE_BUFFER_SIZE: usize = 16 * 1024;

/// Configuration for the hub and its connections
///
/// # Example
///
/// ```
/// use hubsock::Config;
///
/// let config = Config::builder()
///     .buffer_fragments(false)
///     .max_message_size(16 * 1024 * 1024)
///     .send_queue_depth(128)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Reassemble fragmented messages before delivery (default: true).
    /// When false, each data frame is delivered as its own message carrying
    /// the fragmentation opcode and the frame's final flag.
    pub buffer_fragments: bool,
    /// Accept clients that omit the Connection/Upgrade headers but present
    /// a WebSocket key (default: false). Tolerates draft-era clients.
    pub allow_clients_missing_connection_headers: bool,
    /// Subprotocol echoed back when offered by the client (default: none)
    pub protocol: Option<String>,
    /// Maximum reassembled message size (default: 64MB)
    pub max_message_size: usize,
    /// Maximum single-frame payload size (default: 16MB)
    pub max_frame_size: usize,
    /// Bound of the per-connection egress queue, in frames (default: 64).
    /// A full queue fails the send and marks the connection closed.
    pub send_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_fragments: true,
            allow_clients_missing_connection_headers: false,
            protocol: None,
            max_message_size: 64 * 1024 * 1024,
            max_frame_size: 16 * 1024 * 1024,
            send_queue_depth: 64,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for hub configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Reassemble fragmented messages before delivery
    pub fn buffer_fragments(mut self, enabled: bool) -> Self {
        self.config.buffer_fragments = enabled;
        self
    }

    /// Accept clients that omit the Connection/Upgrade headers
    pub fn allow_clients_missing_connection_headers(mut self, enabled: bool) -> Self {
        self.config.allow_clients_missing_connection_headers = enabled;
        self
    }

    /// Subprotocol to echo when the client offers it
    pub fn protocol(mut self, name: impl Into<String>) -> Self {
        self.config.protocol = Some(name.into());
        self
    }

    /// Set maximum reassembled message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set maximum single-frame payload size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the per-connection egress queue bound
    pub fn send_queue_depth(mut self, frames: usize) -> Self {
        self.config.send_queue_depth = frames;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::connection::Connection;
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::frame::OpCode;
    pub use crate::protocol::Message;
    pub use crate::server::{ServerHub, WebSocketHandler};
}
