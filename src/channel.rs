//! Byte-channel adapter over an async transport
//!
//! The protocol engine never touches sockets directly; it consumes this
//! channel contract. The read side accumulates pooled blocks and hands out
//! segmented [`ReadableBuffer`] views; `advance` recycles leading blocks and
//! `detach` removes payload bytes as exclusively-owned segments for in-place
//! unmasking. The write side batches an egress frame into a
//! [`WritableBuffer`] and flushes it in a single write.
//!
//! Any `AsyncRead + AsyncWrite` transport works: TCP streams in production,
//! `tokio::io::duplex` in tests.

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::buffer::{Cursor, PreservedBuffer, ReadableBuffer};
use crate::error::{Error, Result};
use crate::{READ_BLOCK_SIZE, WRITE_BUFFER_SIZE};

/// Minimum spare capacity worth reading into before opening a new block
const MIN_FILL_CAPACITY: usize = 512;

/// Split a duplex transport into the channel's input and output halves
pub fn split<S>(stream: S) -> (ChannelReader<ReadHalf<S>>, ChannelWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (r, w) = tokio::io::split(stream);
    (ChannelReader::new(r), ChannelWriter::new(w))
}

/// Input half: pooled read blocks with cursor-based consumption
pub struct ChannelReader<R> {
    io: R,
    blocks: VecDeque<BytesMut>,
    buffered: usize,
    completed: bool,
}

impl<R: AsyncRead + Unpin> ChannelReader<R> {
    /// Wrap the read half of a transport
    pub fn new(io: R) -> Self {
        Self {
            io,
            blocks: VecDeque::new(),
            buffered: 0,
            completed: false,
        }
    }

    /// Number of unconsumed bytes currently buffered
    #[inline]
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// True once the transport reported end-of-stream or the channel was
    /// completed locally
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// View of the unconsumed bytes, without touching the transport
    pub fn buffer(&self) -> ReadableBuffer<'_> {
        ReadableBuffer::from_spans(self.blocks.iter().map(|b| b.as_ref()).collect())
    }

    /// Await one transport read, then return the full unconsumed window
    /// and the completion flag
    ///
    /// Callers invoke this when the buffered window is not enough to make
    /// progress; an already-completed channel returns immediately with
    /// whatever remains buffered.
    pub async fn read_async(&mut self) -> Result<(ReadableBuffer<'_>, bool)> {
        if !self.completed {
            self.fill().await?;
        }
        Ok((
            ReadableBuffer::from_spans(self.blocks.iter().map(|b| b.as_ref()).collect()),
            self.completed,
        ))
    }

    async fn fill(&mut self) -> Result<()> {
        let needs_block = self
            .blocks
            .back()
            .map(|b| b.capacity() - b.len() < MIN_FILL_CAPACITY)
            .unwrap_or(true);
        if needs_block {
            self.blocks.push_back(BytesMut::with_capacity(READ_BLOCK_SIZE));
        }

        let block = self.blocks.back_mut().unwrap();
        let before = block.len();
        let n = self.io.read_buf(block).await?;
        debug_assert_eq!(block.len(), before + n);

        if n == 0 {
            self.completed = true;
            if self.blocks.back().map(|b| b.is_empty()).unwrap_or(false) {
                self.blocks.pop_back();
            }
        } else {
            self.buffered += n;
        }
        Ok(())
    }

    /// Release bytes up to the cursor so their pool blocks can be recycled
    pub fn advance(&mut self, cursor: Cursor) {
        self.consume(cursor.offset());
    }

    /// Release `n` leading bytes
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.buffered, "advance past buffered data");
        let mut remaining = n;
        while remaining > 0 {
            let front = self.blocks.front_mut().expect("buffered accounting");
            if remaining >= front.len() {
                remaining -= front.len();
                self.blocks.pop_front();
            } else {
                front.advance(remaining);
                remaining = 0;
            }
        }
        self.buffered -= n;
    }

    /// Remove the first `n` buffered bytes as exclusively-owned segments
    ///
    /// The segments are detached from the channel's pool blocks without
    /// copying; exclusive ownership is what makes the in-place unmask in
    /// [`crate::mask::unmask_segments`] sound.
    pub fn detach(&mut self, n: usize) -> Vec<BytesMut> {
        assert!(n <= self.buffered, "detach past buffered data");
        let mut out = Vec::new();
        let mut remaining = n;
        while remaining > 0 {
            let front = self.blocks.front_mut().expect("buffered accounting");
            if remaining >= front.len() {
                remaining -= front.len();
                out.push(self.blocks.pop_front().unwrap());
            } else {
                out.push(front.split_to(remaining));
                remaining = 0;
            }
        }
        self.buffered -= n;
        out
    }

    /// Detach and freeze the first `n` bytes into a preserved payload
    pub fn detach_preserved(&mut self, n: usize) -> PreservedBuffer {
        let segments = self.detach(n);
        PreservedBuffer::from_segments(segments.into_iter().map(BytesMut::freeze).collect())
    }

    /// Signal end-of-stream to subsequent reads
    pub fn complete(&mut self) {
        self.completed = true;
    }
}

/// Output half: allocate, append, flush
pub struct ChannelWriter<W> {
    io: W,
    completed: bool,
}

impl<W: AsyncWrite + Unpin> ChannelWriter<W> {
    /// Wrap the write half of a transport
    pub fn new(io: W) -> Self {
        Self {
            io,
            completed: false,
        }
    }

    /// True once the write side was completed
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Allocate a writable egress buffer
    pub fn alloc(&self) -> WritableBuffer {
        WritableBuffer {
            buf: BytesMut::with_capacity(WRITE_BUFFER_SIZE),
        }
    }

    /// Write the buffer to the transport and flush it
    pub async fn flush_async(&mut self, buf: WritableBuffer) -> Result<()> {
        if self.completed {
            return Err(Error::ConnectionClosed);
        }
        self.io.write_all(&buf.buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Close the write side; subsequent flushes fail
    pub async fn complete(&mut self) {
        if !self.completed {
            self.completed = true;
            let _ = self.io.shutdown().await;
        }
    }
}

/// An egress buffer under construction
pub struct WritableBuffer {
    buf: BytesMut,
}

impl WritableBuffer {
    /// Append raw bytes
    pub fn append_slice(&mut self, slice: &[u8]) {
        self.buf.extend_from_slice(slice);
    }

    /// Append every span of a preserved payload
    pub fn append(&mut self, payload: &PreservedBuffer) {
        for span in payload.spans() {
            self.buf.extend_from_slice(span);
        }
    }

    /// Bytes staged so far
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Direct access for the frame encoder
    pub(crate) fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}
