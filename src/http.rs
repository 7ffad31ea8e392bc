//! Streaming HTTP/1.1 upgrade-request parser
//!
//! Consumes the channel's segmented read stream without copying: each
//! completed line is parsed straight out of the pooled blocks and the
//! channel is advanced past it so leading blocks recycle early. The parser
//! never advances past a partial line, and it stops exactly at the blank
//! CRLF; bytes after the header block stay in the channel for the frame
//! layer.
//!
//! Two states: request line, then headers. Header names are canonicalized
//! against a fixed table of common names; everything else keeps its raw
//! ASCII spelling.

use std::borrow::Cow;
use std::collections::HashMap;

use tokio::io::AsyncRead;

use crate::buffer::{PreservedBuffer, ReadableBuffer};
use crate::channel::ChannelReader;
use crate::error::{Error, Result};

/// Maximum size of the request head; nothing reasonable needs more
const MAX_HEADER_SIZE: usize = 8192;

/// Canonical casings for common request headers. A case-insensitive match
/// yields the table entry, so lookups by canonical name are exact.
const COMMON_HEADERS: &[&str] = &[
    "Host",
    "Connection",
    "Upgrade",
    "Origin",
    "Sec-WebSocket-Key",
    "Sec-WebSocket-Version",
    "Sec-WebSocket-Protocol",
    "Sec-WebSocket-Extensions",
    "Sec-WebSocket-Accept",
    "Sec-WebSocket-Key1",
    "Sec-WebSocket-Key2",
    "User-Agent",
    "Accept",
    "Accept-Encoding",
    "Accept-Language",
    "Cache-Control",
    "Pragma",
    "Cookie",
    "Authorization",
];

/// Canonicalize a header name: table casing for known names, raw ASCII
/// otherwise
pub(crate) fn canonical_name(raw: &ReadableBuffer<'_>) -> Cow<'static, str> {
    for &name in COMMON_HEADERS {
        if raw.eq_ignore_ascii_case(name.as_bytes()) {
            return Cow::Borrowed(name);
        }
    }
    Cow::Owned(raw.ascii_string())
}

/// A parsed upgrade request
///
/// All fields are preserved buffers: they stay valid after the channel has
/// recycled the blocks the request arrived in, and dropping the request
/// releases every one of them.
#[derive(Debug)]
pub struct HttpRequest {
    method: PreservedBuffer,
    path: PreservedBuffer,
    version: PreservedBuffer,
    request_line: PreservedBuffer,
    headers: HashMap<Cow<'static, str>, PreservedBuffer>,
}

impl HttpRequest {
    /// Request method (e.g. `GET`)
    pub fn method(&self) -> &str {
        preserved_ascii(&self.method)
    }

    /// Request path
    pub fn path(&self) -> &str {
        preserved_ascii(&self.path)
    }

    /// HTTP version token (e.g. `HTTP/1.1`)
    pub fn version(&self) -> &str {
        preserved_ascii(&self.version)
    }

    /// The full request line, without the CRLF
    pub fn request_line(&self) -> &str {
        preserved_ascii(&self.request_line)
    }

    /// Look up a header value. Known names match by canonical casing;
    /// custom names match case-insensitively.
    pub fn header(&self, name: &str) -> Option<&PreservedBuffer> {
        if let Some(value) = self.headers.get(name) {
            return Some(value);
        }
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Header value as ASCII text
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).map(preserved_ascii)
    }

    /// True when the header is present
    pub fn contains(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Number of headers
    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    /// Iterate (canonical name, value) pairs
    pub fn headers(&self) -> impl Iterator<Item = (&str, &PreservedBuffer)> {
        self.headers.iter().map(|(k, v)| (k.as_ref(), v))
    }
}

fn preserved_ascii(buf: &PreservedBuffer) -> &str {
    // Preserved header fields are single-segment ASCII by construction
    buf.as_contiguous()
        .and_then(|s| std::str::from_utf8(s).ok())
        .unwrap_or("")
}

enum HeaderStep {
    NeedMore,
    Line {
        name: Cow<'static, str>,
        value: PreservedBuffer,
        consume: usize,
    },
    EndOfBlock,
}

/// Parse the upgrade request from the channel
///
/// Loops `read_async` until the blank-line CRLF; on return the channel's
/// read pointer sits on the first byte after the header block.
pub async fn parse_request<R: AsyncRead + Unpin>(
    reader: &mut ChannelReader<R>,
) -> Result<HttpRequest> {
    let mut start_line: Option<StartLineParts> = None;
    let mut headers: HashMap<Cow<'static, str>, PreservedBuffer> = HashMap::new();
    let mut consumed = 0usize;

    loop {
        // Drain every complete line in the buffered window
        loop {
            if start_line.is_none() {
                let step = {
                    let view = reader.buffer();
                    match view.try_slice_to_pair(b'\r', b'\n') {
                        Some((line, cursor)) => Some((split_request_line(&line)?, cursor.skip(2))),
                        None => None,
                    }
                };
                match step {
                    Some((parts, cursor)) => {
                        start_line = Some(parts);
                        consumed += cursor.offset();
                        reader.advance(cursor);
                    }
                    None => break,
                }
                continue;
            }

            let step = {
                let view = reader.buffer();
                if view.byte_at(0) == Some(b'\r') {
                    match view.byte_at(1) {
                        Some(b'\n') => HeaderStep::EndOfBlock,
                        Some(_) => return Err(Error::Handshake("malformed header terminator")),
                        None => HeaderStep::NeedMore,
                    }
                } else {
                    match view.try_slice_to(b'\n') {
                        Some((line, cursor)) => {
                            let (name, value) = split_header_line(&line)?;
                            HeaderStep::Line {
                                name,
                                value,
                                consume: cursor.offset() + 1,
                            }
                        }
                        None => HeaderStep::NeedMore,
                    }
                }
            };

            match step {
                HeaderStep::EndOfBlock => {
                    reader.consume(2);
                    let (method, path, version, request_line) =
                        start_line.expect("start line parsed");
                    return Ok(HttpRequest {
                        method,
                        path,
                        version,
                        request_line,
                        headers,
                    });
                }
                HeaderStep::Line {
                    name,
                    value,
                    consume,
                } => {
                    // Duplicate names replace
                    headers.insert(name, value);
                    consumed += consume;
                    reader.consume(consume);
                }
                HeaderStep::NeedMore => break,
            }
        }

        if consumed + reader.buffered() > MAX_HEADER_SIZE {
            return Err(Error::Handshake("request head too large"));
        }
        if reader.is_completed() {
            return Err(Error::Handshake("connection closed during handshake"));
        }
        reader.read_async().await?;
    }
}

type StartLineParts = (
    PreservedBuffer,
    PreservedBuffer,
    PreservedBuffer,
    PreservedBuffer,
);

/// Split `METHOD SP PATH SP VERSION` on single spaces, preserving each part
fn split_request_line(line: &ReadableBuffer<'_>) -> Result<StartLineParts> {
    let (method, c1) = line
        .try_slice_to(b' ')
        .ok_or(Error::Handshake("malformed request line"))?;
    let rest = line.slice(c1.skip(1));
    let (path, c2) = rest
        .try_slice_to(b' ')
        .ok_or(Error::Handshake("malformed request line"))?;
    let version = rest.slice(c2.skip(1));

    if method.is_empty() || path.is_empty() || version.is_empty() {
        return Err(Error::Handshake("malformed request line"));
    }

    Ok((
        method.preserve(),
        path.preserve(),
        version.preserve(),
        line.preserve(),
    ))
}

/// Split `Name: value` at the first colon; trim, canonicalize, preserve
fn split_header_line(
    line: &ReadableBuffer<'_>,
) -> Result<(Cow<'static, str>, PreservedBuffer)> {
    let (raw_name, cursor) = line
        .try_slice_to(b':')
        .ok_or(Error::Handshake("header line without colon"))?;
    let name_view = raw_name.trim_start().trim_end();
    if name_view.is_empty() {
        return Err(Error::Handshake("empty header name"));
    }
    let value = line.slice(cursor.skip(1)).trim_start().trim_end();
    Ok((canonical_name(&name_view), value.preserve()))
}
