//! Per-connection lifecycle: handshake, frame ingress, serialized egress
//!
//! Each accepted transport runs through three phases in sequence:
//! handshake, streaming, closing. Closing is terminal. All outbound frames
//! funnel through a bounded queue drained by a single writer task, so wire
//! writes complete in submission order without a lock around the socket;
//! the queue's capacity waiters are the write lock. Teardown (registry
//! removal, channel completion) runs in a drop guard on every exit path,
//! including panics in user hooks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::Config;
use crate::buffer::PreservedBuffer;
use crate::channel::{self, ChannelReader, ChannelWriter};
use crate::error::{CloseReason, Error, Result};
use crate::frame::{self, FrameHeader, OpCode};
use crate::handshake;
use crate::http;
use crate::mask::unmask_segments;
use crate::protocol::{self, Message, MessageAssembler, Role};
use crate::server::{Registry, WebSocketHandler};

/// Stable identity of a connection, the registry key
pub type ConnectionId = u64;

/// Handle to a live WebSocket session
///
/// Cheap to share: the hub keeps one in the registry, the connection task
/// keeps another, user code may hold more. All sends race through the same
/// bounded egress queue.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    role: Role,
    host: String,
    origin: Option<String>,
    protocol: Option<String>,
    path: String,
    request_line: String,
    buffer_fragments: bool,
    closed: AtomicBool,
    sender: mpsc::Sender<Bytes>,
    shutdown: watch::Sender<bool>,
}

impl Connection {
    /// Registry identity
    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Endpoint role (always [`Role::Server`] for hub-accepted sessions)
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Host header from the upgrade request
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Origin header, when the client sent one
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Negotiated subprotocol, when one was echoed
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Request path of the upgrade
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Full request line of the upgrade
    pub fn request_line(&self) -> &str {
        &self.request_line
    }

    /// Whether fragmented messages are reassembled before delivery
    #[inline]
    pub fn buffer_fragments(&self) -> bool {
        self.buffer_fragments
    }

    /// True once the session is closed or closing
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Mark closed and wake the writer so it flushes its backlog and
    /// completes the channel output
    pub(crate) fn begin_shutdown(&self) {
        self.mark_closed();
        let _ = self.shutdown.send(true);
    }

    /// Send a text frame
    pub async fn send_text(&self, text: &str) -> Result<()> {
        let mut buf = BytesMut::new();
        frame::encode_frame(&mut buf, OpCode::Text, text.as_bytes(), true);
        self.send_frame(buf.freeze()).await
    }

    /// Send a binary frame
    pub async fn send_binary(&self, data: &[u8]) -> Result<()> {
        let mut buf = BytesMut::new();
        frame::encode_frame(&mut buf, OpCode::Binary, data, true);
        self.send_frame(buf.freeze()).await
    }

    /// Send a ping; the payload must fit a control frame
    pub async fn send_ping(&self, data: &[u8]) -> Result<()> {
        let mut buf = BytesMut::new();
        frame::encode_frame(&mut buf, OpCode::Ping, data, true);
        self.send_frame(buf.freeze()).await
    }

    /// Send a close frame and stop accepting further sends
    pub async fn close(&self, reason: Option<CloseReason>) -> Result<()> {
        let mut buf = BytesMut::new();
        match reason {
            Some(r) => frame::encode_close(&mut buf, r.code, &r.reason),
            None => frame::encode_frame(&mut buf, OpCode::Close, &[], true),
        }
        let sent = self.send_frame(buf.freeze()).await;
        self.mark_closed();
        sent
    }

    /// Enqueue a pre-encoded frame, waiting for queue capacity
    pub(crate) async fn send_frame(&self, frame: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.sender
            .send(frame)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Enqueue a pre-encoded frame without waiting. A full queue is the
    /// slow-peer signal: the connection is marked closed and shut down.
    pub(crate) fn try_send_frame(&self, frame: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        match self.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.begin_shutdown();
                Err(Error::SendQueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.mark_closed();
                Err(Error::ConnectionClosed)
            }
        }
    }
}

/// Removes the connection from the registry and completes its channel on
/// every exit path, panics included
struct TeardownGuard {
    registry: Arc<Registry>,
    conn: Arc<Connection>,
}

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        self.conn.begin_shutdown();
        self.registry.remove(self.conn.id());
    }
}

/// Run one accepted transport through its whole lifecycle
pub(crate) async fn serve_connection<S, H>(
    stream: S,
    id: ConnectionId,
    registry: Arc<Registry>,
    handler: Arc<H>,
    config: Config,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
    H: WebSocketHandler,
{
    let (mut reader, mut writer) = channel::split(stream);

    let request = match http::parse_request(&mut reader).await {
        Ok(request) => request,
        Err(e) => {
            debug!(connection = id, error = %e, "dropping connection: bad upgrade request");
            writer.complete().await;
            return;
        }
    };

    let negotiated = match handshake::validate(&request, &config) {
        Ok(negotiated) => negotiated,
        Err(Error::UnsupportedVersion(version)) => {
            debug!(connection = id, version, "rejecting unsupported version");
            let mut buf = writer.alloc();
            buf.append_slice(&handshake::build_version_rejection());
            let _ = writer.flush_async(buf).await;
            writer.complete().await;
            return;
        }
        Err(e) => {
            debug!(connection = id, error = %e, "dropping connection: handshake invalid");
            writer.complete().await;
            return;
        }
    };

    if !handler.authenticate(&request).await {
        debug!(connection = id, error = %Error::HandshakeRejected, "dropping connection");
        writer.complete().await;
        return;
    }

    let response = handshake::build_accept_response(&negotiated);
    {
        let mut buf = writer.alloc();
        buf.append_slice(&response);
        if writer.flush_async(buf).await.is_err() {
            writer.complete().await;
            return;
        }
    }

    let (sender, receiver) = mpsc::channel(config.send_queue_depth.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let conn = Arc::new(Connection {
        id,
        role: Role::Server,
        host: negotiated.host,
        origin: negotiated.origin,
        protocol: negotiated.protocol,
        path: request.path().to_string(),
        request_line: request.request_line().to_string(),
        buffer_fragments: config.buffer_fragments,
        closed: AtomicBool::new(false),
        sender,
        shutdown: shutdown_tx,
    });
    // The request's preserved buffers release here; the connection carries
    // only what it needs
    drop(request);

    let writer_task = tokio::spawn(run_writer(writer, receiver, shutdown_rx));

    handler.on_handshake_complete(&conn).await;
    registry.insert(conn.clone());
    let guard = TeardownGuard {
        registry,
        conn: conn.clone(),
    };

    let close_reason = match ingress_loop(&mut reader, &conn, &handler, &config).await {
        Ok(reason) => reason,
        Err(Error::ConnectionClosed) => None,
        Err(Error::Io(e)) => {
            debug!(connection = id, error = %e, "transport error");
            None
        }
        Err(fatal) => {
            debug!(connection = id, error = %fatal, "failing connection");
            let mut buf = BytesMut::new();
            frame::encode_close(&mut buf, fatal.close_code(), "");
            let _ = conn.try_send_frame(buf.freeze());
            None
        }
    };

    handler.on_close(&conn, close_reason).await;

    drop(guard);
    reader.complete();
    let _ = writer_task.await;
}

/// Serial frame loop: decode, detach, unmask once, dispatch
///
/// Returns the peer's close reason on a clean closing handshake, `None` on
/// end-of-stream.
async fn ingress_loop<R, H>(
    reader: &mut ChannelReader<R>,
    conn: &Arc<Connection>,
    handler: &Arc<H>,
    config: &Config,
) -> Result<Option<CloseReason>>
where
    R: AsyncRead + Unpin,
    H: WebSocketHandler,
{
    let expect_masked = conn.role().expect_masked_ingress();
    let mut assembler = MessageAssembler::new(config.buffer_fragments, config.max_message_size);

    loop {
        let decoded = FrameHeader::decode(&reader.buffer(), expect_masked, config.max_frame_size)?;
        let (header, header_len) = match decoded {
            Some(decoded) => decoded,
            None => {
                if reader.is_completed() {
                    // Clean close between frames; anything else is truncation
                    return if reader.buffered() == 0 {
                        Ok(None)
                    } else {
                        Err(Error::ConnectionClosed)
                    };
                }
                reader.read_async().await?;
                continue;
            }
        };

        let payload_len = header.payload_len as usize;
        if reader.buffered() < header_len + payload_len {
            if reader.is_completed() {
                return Err(Error::ConnectionClosed);
            }
            reader.read_async().await?;
            continue;
        }

        reader.consume(header_len);
        let payload = detach_unmasked(reader, payload_len, header.mask);

        if header.opcode.is_control() {
            match header.opcode {
                OpCode::Ping => {
                    let mut buf = BytesMut::new();
                    frame::encode_frame_spans(
                        &mut buf,
                        OpCode::Pong,
                        payload.spans(),
                        payload.len(),
                        true,
                    );
                    let _ = conn.send_frame(buf.freeze()).await;
                }
                OpCode::Pong => {
                    handler.on_pong(conn, payload).await;
                }
                OpCode::Close => {
                    let reason = protocol::parse_close(&payload)?;
                    let mut buf = BytesMut::new();
                    match &reason {
                        Some(r) => frame::encode_close(&mut buf, r.code, ""),
                        None => frame::encode_frame(&mut buf, OpCode::Close, &[], true),
                    }
                    let _ = conn.send_frame(buf.freeze()).await;
                    conn.mark_closed();
                    return Ok(reason);
                }
                _ => unreachable!("control opcodes are 8..=10"),
            }
        } else if let Some(message) = assembler.accept(header.opcode, payload, header.fin)? {
            dispatch(handler, conn, message).await;
        }
    }
}

/// Detach the payload from the channel and unmask it exactly once, in
/// place, threading the key rotation across the detached segments
fn detach_unmasked<R: AsyncRead + Unpin>(
    reader: &mut ChannelReader<R>,
    len: usize,
    mask: Option<[u8; 4]>,
) -> PreservedBuffer {
    let mut segments = reader.detach(len);
    if let Some(mask) = mask {
        unmask_segments(&mut segments, mask);
    }
    PreservedBuffer::from_segments(segments.into_iter().map(BytesMut::freeze).collect())
}

/// Deliver a message to the user hook; a panicking hook is logged and the
/// connection continues
async fn dispatch<H: WebSocketHandler>(handler: &Arc<H>, conn: &Arc<Connection>, message: Message) {
    let id = conn.id();
    let handler = handler.clone();
    let conn = conn.clone();
    let hook = tokio::spawn(async move {
        if message.is_text() {
            handler.on_text(&conn, message).await;
        } else {
            handler.on_binary(&conn, message).await;
        }
    });
    if let Err(e) = hook.await {
        warn!(connection = id, error = %e, "message hook failed");
    }
}

/// Single egress drain: frames flush in submission order until the queue
/// closes, the shutdown signal fires, or the transport fails
async fn run_writer<W: AsyncWrite + Unpin>(
    mut writer: ChannelWriter<W>,
    mut receiver: mpsc::Receiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe = receiver.recv() => match maybe {
                Some(frame) => {
                    let mut buf = writer.alloc();
                    buf.append_slice(&frame);
                    if writer.flush_async(buf).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown.changed() => {
                // Flush whatever was enqueued before the shutdown, then stop
                while let Ok(frame) = receiver.try_recv() {
                    let mut buf = writer.alloc();
                    buf.append_slice(&frame);
                    if writer.flush_async(buf).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    receiver.close();
    writer.complete().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::apply_mask;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

    const RFC_REQUEST: &[u8] = b"GET /chat HTTP/1.1\r\n\
        Host: x\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    const RFC_RESPONSE: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
        \r\n";

    #[derive(Debug, PartialEq)]
    enum Event {
        Text(String, bool),
        Binary(Vec<u8>, bool),
        Pong(Vec<u8>),
        Closed(Option<CloseReason>),
    }

    /// Echoes data frames and reports every delivery to the test
    struct Recorder {
        events: UnboundedSender<Event>,
        panic_on: Option<&'static str>,
    }

    impl crate::server::WebSocketHandler for Recorder {
        async fn on_text(&self, conn: &Arc<Connection>, message: Message) {
            let text = message.text().unwrap().to_owned();
            if Some(text.as_str()) == self.panic_on {
                panic!("handler exploded");
            }
            self.events
                .send(Event::Text(text.clone(), message.is_final()))
                .unwrap();
            conn.send_text(&text).await.ok();
        }

        async fn on_binary(&self, conn: &Arc<Connection>, message: Message) {
            let data = message.to_vec();
            self.events
                .send(Event::Binary(data.clone(), message.is_final()))
                .unwrap();
            conn.send_binary(&data).await.ok();
        }

        async fn on_pong(&self, _conn: &Arc<Connection>, payload: PreservedBuffer) {
            self.events.send(Event::Pong(payload.to_vec())).unwrap();
        }

        async fn on_close(&self, _conn: &Arc<Connection>, reason: Option<CloseReason>) {
            self.events.send(Event::Closed(reason)).unwrap();
        }
    }

    struct Session {
        client: DuplexStream,
        registry: Arc<Registry>,
        events: UnboundedReceiver<Event>,
    }

    fn session(config: Config) -> Session {
        session_with(config, None)
    }

    fn session_with(config: Config, panic_on: Option<&'static str>) -> Session {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (events_tx, events) = unbounded_channel();
        let registry = Arc::new(Registry::new());
        let handler = Arc::new(Recorder {
            events: events_tx,
            panic_on,
        });
        tokio::spawn(serve_connection(
            server,
            1,
            registry.clone(),
            handler,
            config,
        ));
        Session {
            client,
            registry,
            events,
        }
    }

    async fn read_http_head(client: &mut DuplexStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            client.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    async fn upgrade(client: &mut DuplexStream) {
        client.write_all(RFC_REQUEST).await.unwrap();
        let head = read_http_head(client).await;
        assert!(head.starts_with("HTTP/1.1 101"), "{head}");
    }

    async fn read_frame(client: &mut DuplexStream) -> (u8, Vec<u8>) {
        let mut head = [0u8; 2];
        client.read_exact(&mut head).await.unwrap();
        assert_eq!(head[1] & 0x80, 0, "server frames are unmasked");
        let mut payload = vec![0u8; (head[1] & 0x7F) as usize];
        client.read_exact(&mut payload).await.unwrap();
        (head[0], payload)
    }

    fn masked(first_byte: u8, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
        let mut out = vec![first_byte, 0x80 | payload.len() as u8];
        out.extend_from_slice(&mask);
        let mut body = payload.to_vec();
        apply_mask(&mut body, mask);
        out.extend_from_slice(&body);
        out
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn handshake_emits_rfc_response() {
        let mut s = session(Config::default());
        s.client.write_all(RFC_REQUEST).await.unwrap();

        let mut response = vec![0u8; RFC_RESPONSE.len()];
        s.client.read_exact(&mut response).await.unwrap();
        assert_eq!(response, RFC_RESPONSE);
        wait_until(|| s.registry.len() == 1).await;
    }

    #[tokio::test]
    async fn single_frame_binary_echo() {
        let mut s = session(Config::default());
        upgrade(&mut s.client).await;

        // Masked "Hello"
        s.client
            .write_all(&[0x82, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58])
            .await
            .unwrap();

        assert_eq!(
            s.events.recv().await.unwrap(),
            Event::Binary(b"Hello".to_vec(), true)
        );
        let (op, payload) = read_frame(&mut s.client).await;
        assert_eq!(op, 0x82);
        assert_eq!(payload, b"Hello");
    }

    #[tokio::test]
    async fn fragmented_text_reassembled() {
        let mut s = session(Config::default());
        upgrade(&mut s.client).await;

        let mask = [0x21, 0x43, 0x65, 0x87];
        s.client
            .write_all(&masked(0x01, b"Hel", mask))
            .await
            .unwrap();
        s.client
            .write_all(&masked(0x80, b"lo", mask))
            .await
            .unwrap();

        // One delivery, final, reassembled
        assert_eq!(
            s.events.recv().await.unwrap(),
            Event::Text("Hello".into(), true)
        );
        let (op, payload) = read_frame(&mut s.client).await;
        assert_eq!(op, 0x81);
        assert_eq!(payload, b"Hello");
    }

    #[tokio::test]
    async fn fragments_delivered_frame_by_frame() {
        let config = Config::builder().buffer_fragments(false).build();
        let mut s = session(config);
        upgrade(&mut s.client).await;

        let mask = [0x01, 0x02, 0x03, 0x04];
        s.client
            .write_all(&masked(0x01, b"Hel", mask))
            .await
            .unwrap();
        s.client
            .write_all(&masked(0x80, b"lo", mask))
            .await
            .unwrap();

        // Two deliveries, both text (the opener's opcode), finality tracking
        // the wire
        assert_eq!(
            s.events.recv().await.unwrap(),
            Event::Text("Hel".into(), false)
        );
        assert_eq!(
            s.events.recv().await.unwrap(),
            Event::Text("lo".into(), true)
        );
    }

    #[tokio::test]
    async fn ping_answered_without_hook() {
        let mut s = session(Config::default());
        upgrade(&mut s.client).await;

        s.client
            .write_all(&masked(0x89, b"a", [0x10, 0x20, 0x30, 0x40]))
            .await
            .unwrap();

        let (op, payload) = read_frame(&mut s.client).await;
        assert_eq!(op, 0x8A);
        assert_eq!(payload, b"a");
        // No user-facing delivery happened
        assert!(s.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn pong_reaches_hook() {
        let mut s = session(Config::default());
        upgrade(&mut s.client).await;

        s.client
            .write_all(&masked(0x8A, b"beat", [0x10, 0x20, 0x30, 0x40]))
            .await
            .unwrap();
        assert_eq!(s.events.recv().await.unwrap(), Event::Pong(b"beat".to_vec()));
    }

    #[tokio::test]
    async fn unmasked_frame_fails_with_1002() {
        let mut s = session(Config::default());
        upgrade(&mut s.client).await;

        // Unmasked binary "Hello"
        s.client
            .write_all(&[0x82, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f])
            .await
            .unwrap();

        let (op, payload) = read_frame(&mut s.client).await;
        assert_eq!(op, 0x88);
        assert_eq!(payload, &[0x03, 0xea]);

        // Connection is gone afterwards
        let mut rest = Vec::new();
        assert_eq!(s.client.read_to_end(&mut rest).await.unwrap(), 0);
        wait_until(|| s.registry.len() == 0).await;
        assert_eq!(s.events.recv().await.unwrap(), Event::Closed(None));
    }

    #[tokio::test]
    async fn unsupported_version_gets_400() {
        let mut s = session(Config::default());
        s.client
            .write_all(
                b"GET / HTTP/1.1\r\n\
                  Host: x\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: abc\r\n\
                  Sec-WebSocket-Version: 9\r\n\
                  \r\n",
            )
            .await
            .unwrap();

        let head = read_http_head(&mut s.client).await;
        assert!(head.starts_with("HTTP/1.1 400"), "{head}");
        assert!(head.contains("Sec-WebSocket-Version: 13\r\n"));
        assert_eq!(s.registry.len(), 0);
    }

    #[tokio::test]
    async fn close_echoes_peer_code() {
        let mut s = session(Config::default());
        upgrade(&mut s.client).await;

        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"done");
        s.client
            .write_all(&masked(0x88, &payload, [0x0a, 0x0b, 0x0c, 0x0d]))
            .await
            .unwrap();

        let (op, echoed) = read_frame(&mut s.client).await;
        assert_eq!(op, 0x88);
        assert_eq!(&echoed[..2], &1000u16.to_be_bytes());

        assert_eq!(
            s.events.recv().await.unwrap(),
            Event::Closed(Some(CloseReason::new(1000, "done")))
        );
        wait_until(|| s.registry.len() == 0).await;
    }

    #[tokio::test]
    async fn orphan_continuation_fails_connection() {
        let mut s = session(Config::default());
        upgrade(&mut s.client).await;

        s.client
            .write_all(&masked(0x80, b"xx", [0x01, 0x02, 0x03, 0x04]))
            .await
            .unwrap();

        let (op, payload) = read_frame(&mut s.client).await;
        assert_eq!(op, 0x88);
        assert_eq!(payload, &[0x03, 0xea]);
    }

    #[tokio::test]
    async fn hook_panic_keeps_connection_alive() {
        let mut s = session_with(Config::default(), Some("boom"));
        upgrade(&mut s.client).await;

        let mask = [0x31, 0x32, 0x33, 0x34];
        s.client.write_all(&masked(0x81, b"boom", mask)).await.unwrap();
        s.client.write_all(&masked(0x81, b"after", mask)).await.unwrap();

        // The panicking delivery is swallowed; the next message flows
        assert_eq!(
            s.events.recv().await.unwrap(),
            Event::Text("after".into(), true)
        );
        let (op, payload) = read_frame(&mut s.client).await;
        assert_eq!(op, 0x81);
        assert_eq!(payload, b"after");
    }

    #[tokio::test]
    async fn clean_disconnect_runs_teardown() {
        let mut s = session(Config::default());
        upgrade(&mut s.client).await;
        wait_until(|| s.registry.len() == 1).await;

        // Half-close from the client ends the session
        s.client.shutdown().await.unwrap();
        wait_until(|| s.registry.len() == 0).await;
        assert_eq!(s.events.recv().await.unwrap(), Event::Closed(None));
    }

    #[tokio::test]
    async fn frame_split_across_arbitrary_writes() {
        let mut s = session(Config::default());
        upgrade(&mut s.client).await;

        let frame = masked(0x82, b"chunked-payload", [0x55, 0x66, 0x77, 0x88]);
        for chunk in frame.chunks(3) {
            s.client.write_all(chunk).await.unwrap();
            s.client.flush().await.unwrap();
            tokio::task::yield_now().await;
        }

        assert_eq!(
            s.events.recv().await.unwrap(),
            Event::Binary(b"chunked-payload".to_vec(), true)
        );
    }

    #[tokio::test]
    async fn send_queue_overflow_marks_closed() {
        let config = Config::builder().send_queue_depth(1).build();
        let mut s = session(config);
        upgrade(&mut s.client).await;
        wait_until(|| s.registry.len() == 1).await;

        let conn = s.registry.snapshot().pop().unwrap();
        // Saturate the queue without the client draining; the writer may
        // flush some frames into the duplex buffer, so keep pushing until
        // the overflow policy trips.
        let big = vec![0x42u8; 16 * 1024];
        let mut overflowed = false;
        for _ in 0..64 {
            match conn.try_send_frame({
                let mut buf = BytesMut::new();
                frame::encode_frame(&mut buf, OpCode::Binary, &big, true);
                buf.freeze()
            }) {
                Ok(()) => continue,
                Err(Error::SendQueueFull) => {
                    overflowed = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(overflowed);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn registry_survives_mid_session_errors() {
        // A second connection keeps working while the first dies on a
        // protocol violation
        let registry = Arc::new(Registry::new());
        let (events_tx, mut events) = unbounded_channel();
        let handler = Arc::new(Recorder {
            events: events_tx,
            panic_on: None,
        });

        let mut clients = Vec::new();
        for id in 1..=2u64 {
            let (client, server) = tokio::io::duplex(64 * 1024);
            tokio::spawn(serve_connection(
                server,
                id,
                registry.clone(),
                handler.clone(),
                Config::default(),
            ));
            clients.push(client);
        }
        for client in &mut clients {
            upgrade(client).await;
        }
        wait_until(|| registry.len() == 2).await;

        // Violation on the first
        clients[0].write_all(&[0x82, 0x05, 0, 0, 0, 0, 0]).await.unwrap();
        wait_until(|| registry.len() == 1).await;

        // Second still echoes
        clients[1]
            .write_all(&masked(0x81, b"still-here", [0x01, 0x02, 0x03, 0x04]))
            .await
            .unwrap();
        loop {
            match events.recv().await.unwrap() {
                Event::Text(text, true) => {
                    assert_eq!(text, "still-here");
                    break;
                }
                Event::Closed(_) => continue,
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn connection_metadata_is_exposed() {
        let registry_probe: Arc<Mutex<Option<Arc<Connection>>>> = Arc::new(Mutex::new(None));

        struct Probe(Arc<Mutex<Option<Arc<Connection>>>>);
        impl crate::server::WebSocketHandler for Probe {
            async fn on_handshake_complete(&self, conn: &Arc<Connection>) {
                *self.0.lock() = Some(conn.clone());
            }
        }

        let (mut client, server) = tokio::io::duplex(16 * 1024);
        let registry = Arc::new(Registry::new());
        tokio::spawn(serve_connection(
            server,
            7,
            registry.clone(),
            Arc::new(Probe(registry_probe.clone())),
            Config::default(),
        ));

        client.write_all(RFC_REQUEST).await.unwrap();
        read_http_head(&mut client).await;
        wait_until(|| registry_probe.lock().is_some()).await;

        let conn = registry_probe.lock().clone().unwrap();
        assert_eq!(conn.id(), 7);
        assert_eq!(conn.role(), Role::Server);
        assert_eq!(conn.host(), "x");
        assert_eq!(conn.path(), "/chat");
        assert_eq!(conn.request_line(), "GET /chat HTTP/1.1");
        assert!(conn.buffer_fragments());
        assert!(!conn.is_closed());
    }
}
