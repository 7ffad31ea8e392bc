//! WebSocket upgrade negotiation
//!
//! Classifies a parsed upgrade request, computes the RFC 6455 accept token,
//! and builds the 101 / 400 responses. Handshake tolerance covers drafts
//! 4-8 alongside RFC 6455 (version 13); with the lenient flag set, clients
//! that omit the Connection/Upgrade headers are still accepted when they
//! present a WebSocket key.

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};

use crate::Config;
use crate::WS_GUID;
use crate::error::{Error, Result};
use crate::http::HttpRequest;

/// Handshake versions accepted on the wire: drafts 4-8 plus RFC 6455
const ACCEPTED_VERSIONS: &[u16] = &[4, 5, 6, 7, 8, 13];

/// The version advertised back on rejection
pub const ADVERTISED_VERSION: u16 = 13;

/// Negotiated connection parameters extracted from a valid upgrade request
#[derive(Debug)]
pub struct Negotiated {
    /// Host header value
    pub host: String,
    /// Origin header value, when present
    pub origin: Option<String>,
    /// Subprotocol to echo, when configured and offered
    pub protocol: Option<String>,
    /// Sec-WebSocket-Accept value, when the client presented a key
    pub accept: Option<String>,
}

/// Compute `base64(sha1(key ∥ GUID))`
#[inline]
pub fn accept_token(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// True when a comma-separated header value contains `token`
/// (ASCII case-insensitive)
fn contains_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// Classify an upgrade request per the server role
///
/// Rejections map to the error table: a malformed request drops without a
/// response, an unsupported version gets the 400 advertising version 13.
pub fn validate(request: &HttpRequest, config: &Config) -> Result<Negotiated> {
    if !request.method().eq_ignore_ascii_case("GET") {
        return Err(Error::Handshake("method must be GET"));
    }

    let host = request
        .header_str("Host")
        .filter(|h| !h.is_empty())
        .ok_or(Error::Handshake("missing Host header"))?
        .to_string();

    let connection_upgrade = request
        .header_str("Connection")
        .map(|v| contains_token(v, "Upgrade"))
        .unwrap_or(false);
    let upgrade_websocket = request
        .header_str("Upgrade")
        .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    let key = request.header_str("Sec-WebSocket-Key").map(str::to_string);
    let version_header = request.header_str("Sec-WebSocket-Version");

    if !(connection_upgrade && upgrade_websocket) {
        // Draft-era clients sometimes omit the upgrade headers; accept them
        // only when configured to and when they still present key material
        let draft_keys = request.contains("Sec-WebSocket-Key1")
            && request.contains("Sec-WebSocket-Key2");
        let rfc_keys = version_header.is_some() && key.is_some();
        if !(config.allow_clients_missing_connection_headers && (rfc_keys || draft_keys)) {
            return Err(Error::Handshake("missing Connection/Upgrade headers"));
        }
    }

    if let Some(raw) = version_header {
        let version: u16 = raw
            .trim()
            .parse()
            .map_err(|_| Error::UnsupportedVersion(0))?;
        if !ACCEPTED_VERSIONS.contains(&version) {
            return Err(Error::UnsupportedVersion(version));
        }
    } else if key.is_some() {
        // A key without a version is not any handshake we know
        return Err(Error::UnsupportedVersion(0));
    }

    let origin = request.header_str("Origin").map(str::to_string);

    // Echo the configured subprotocol when the client offered it
    let protocol = match (&config.protocol, request.header_str("Sec-WebSocket-Protocol")) {
        (Some(ours), Some(offered)) if contains_token(offered, ours) => Some(ours.clone()),
        _ => None,
    };

    Ok(Negotiated {
        host,
        origin,
        protocol,
        accept: key.as_deref().map(accept_token),
    })
}

/// Build the `101 Switching Protocols` response
pub fn build_accept_response(negotiated: &Negotiated) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);

    buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");

    if let Some(accept) = &negotiated.accept {
        buf.put_slice(b"Sec-WebSocket-Accept: ");
        buf.put_slice(accept.as_bytes());
        buf.put_slice(b"\r\n");
    }

    if let Some(protocol) = &negotiated.protocol {
        buf.put_slice(b"Sec-WebSocket-Protocol: ");
        buf.put_slice(protocol.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Build the `400` rejection advertising the supported version
pub fn build_version_rejection() -> Bytes {
    let mut buf = BytesMut::with_capacity(128);
    buf.put_slice(b"HTTP/1.1 400 Bad Request\r\n");
    buf.put_slice(b"Sec-WebSocket-Version: ");
    buf.put_slice(ADVERTISED_VERSION.to_string().as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Content-Length: 0\r\n");
    buf.put_slice(b"\r\n");
    buf.freeze()
}
