//! Segmented buffer views and preserved payload handles
//!
//! The channel input hands out [`ReadableBuffer`] views: an ordered list of
//! contiguous spans borrowed from the pooled read blocks. Views are cheap,
//! never copy, and support the cursor-based slicing the upgrade parser and
//! frame decoder need. [`PreservedBuffer`] decouples payload lifetime from
//! the channel's read pointer: it holds refcounted [`Bytes`] segments, so
//! cloning bumps a refcount and dropping the last handle releases the pool
//! memory.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Position within a [`ReadableBuffer`], counted from the start of the view
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Cursor(pub(crate) usize);

impl Cursor {
    /// Byte offset from the start of the view this cursor was taken from
    #[inline]
    pub fn offset(&self) -> usize {
        self.0
    }

    /// A cursor `n` bytes further along
    #[inline]
    pub fn skip(&self, n: usize) -> Cursor {
        Cursor(self.0 + n)
    }
}

/// A lazy, segmented view over unconsumed channel bytes
///
/// The view borrows the channel's pool blocks; it is invalidated by the next
/// `advance`/`detach` on the reader, which the borrow checker enforces.
#[derive(Debug, Clone)]
pub struct ReadableBuffer<'a> {
    spans: Vec<&'a [u8]>,
    len: usize,
}

impl<'a> ReadableBuffer<'a> {
    /// Build a view from ordered contiguous spans; empty spans are dropped
    pub fn from_spans(spans: Vec<&'a [u8]>) -> Self {
        let spans: Vec<&[u8]> = spans.into_iter().filter(|s| !s.is_empty()).collect();
        let len = spans.iter().map(|s| s.len()).sum();
        Self { spans, len }
    }

    /// Build a single-span view
    pub fn from_slice(slice: &'a [u8]) -> Self {
        Self::from_spans(vec![slice])
    }

    /// Total number of viewed bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First byte of the view, if any
    #[inline]
    pub fn peek(&self) -> Option<u8> {
        self.spans.first().map(|s| s[0])
    }

    /// Byte at `index`, if in range
    pub fn byte_at(&self, index: usize) -> Option<u8> {
        if index >= self.len {
            return None;
        }
        let mut remaining = index;
        for span in &self.spans {
            if remaining < span.len() {
                return Some(span[remaining]);
            }
            remaining -= span.len();
        }
        None
    }

    /// Iterate the contiguous spans in order
    pub fn spans(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        self.spans.iter().copied()
    }

    /// Iterate the viewed bytes
    pub fn bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.spans.iter().flat_map(|s| s.iter().copied())
    }

    /// Offset of the first occurrence of `needle`
    pub fn find(&self, needle: u8) -> Option<usize> {
        let mut base = 0;
        for span in &self.spans {
            if let Some(i) = span.iter().position(|&b| b == needle) {
                return Some(base + i);
            }
            base += span.len();
        }
        None
    }

    /// The prefix up to (not including) `delim`, plus a cursor sitting on
    /// the delimiter. `None` when the delimiter is not in view.
    pub fn try_slice_to(&self, delim: u8) -> Option<(ReadableBuffer<'a>, Cursor)> {
        let at = self.find(delim)?;
        Some((self.prefix(at), Cursor(at)))
    }

    /// Like [`try_slice_to`](Self::try_slice_to), but for a two-byte
    /// delimiter that may straddle a span boundary. The cursor sits on the
    /// first delimiter byte.
    pub fn try_slice_to_pair(&self, first: u8, second: u8) -> Option<(ReadableBuffer<'a>, Cursor)> {
        let mut from = 0;
        while let Some(rel) = self.suffix(from).find(first) {
            let at = from + rel;
            match self.byte_at(at + 1) {
                Some(b) if b == second => return Some((self.prefix(at), Cursor(at))),
                Some(_) => from = at + 1,
                None => return None,
            }
        }
        None
    }

    /// View of the first `n` bytes
    pub fn prefix(&self, n: usize) -> ReadableBuffer<'a> {
        let n = n.min(self.len);
        let mut spans = Vec::with_capacity(self.spans.len());
        let mut remaining = n;
        for span in &self.spans {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(span.len());
            spans.push(&span[..take]);
            remaining -= take;
        }
        ReadableBuffer { spans, len: n }
    }

    /// View of everything from `n` bytes in
    pub fn suffix(&self, n: usize) -> ReadableBuffer<'a> {
        let n = n.min(self.len);
        let mut spans = Vec::with_capacity(self.spans.len());
        let mut skip = n;
        for span in &self.spans {
            if skip >= span.len() {
                skip -= span.len();
                continue;
            }
            spans.push(&span[skip..]);
            skip = 0;
        }
        ReadableBuffer {
            spans,
            len: self.len - n,
        }
    }

    /// View of everything from the cursor on
    pub fn slice(&self, cursor: Cursor) -> ReadableBuffer<'a> {
        self.suffix(cursor.0)
    }

    /// View with leading ASCII whitespace removed
    pub fn trim_start(&self) -> ReadableBuffer<'a> {
        let skip = self
            .bytes()
            .take_while(|b| matches!(b, b' ' | b'\t'))
            .count();
        self.suffix(skip)
    }

    /// View with trailing ASCII whitespace (and a stray CR) removed
    pub fn trim_end(&self) -> ReadableBuffer<'a> {
        let mut end = self.len;
        while end > 0 {
            match self.byte_at(end - 1) {
                Some(b' ' | b'\t' | b'\r') => end -= 1,
                _ => break,
            }
        }
        self.prefix(end)
    }

    /// Copy the viewed bytes into a refcounted handle that outlives the
    /// channel's read pointer
    pub fn preserve(&self) -> PreservedBuffer {
        if self.is_empty() {
            return PreservedBuffer::default();
        }
        let mut out = Vec::with_capacity(self.len);
        for span in &self.spans {
            out.extend_from_slice(span);
        }
        PreservedBuffer::from_bytes(Bytes::from(out))
    }

    /// Copy the viewed bytes out
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for span in &self.spans {
            out.extend_from_slice(span);
        }
        out
    }

    /// The viewed bytes as an ASCII string (each byte one char)
    pub fn ascii_string(&self) -> String {
        self.bytes().map(|b| b as char).collect()
    }

    /// The viewed bytes as UTF-8
    pub fn utf8_string(&self) -> Result<String> {
        String::from_utf8(self.to_vec()).map_err(|_| Error::InvalidUtf8)
    }

    /// Case-insensitive ASCII comparison against `other`
    pub fn eq_ignore_ascii_case(&self, other: &[u8]) -> bool {
        self.len == other.len()
            && self
                .bytes()
                .zip(other.iter())
                .all(|(a, &b)| a.eq_ignore_ascii_case(&b))
    }
}

/// A refcounted handle over pool memory, independent of channel advance
///
/// Single-frame payloads hold one segment; fragmented messages accumulate
/// one or more segments per frame in wire order. Clone increments the
/// underlying refcounts; dropping the last handle is the release.
#[derive(Debug, Clone, Default)]
pub struct PreservedBuffer {
    segments: Vec<Bytes>,
    len: usize,
}

impl PreservedBuffer {
    /// Wrap a single contiguous segment
    pub fn from_bytes(bytes: Bytes) -> Self {
        let len = bytes.len();
        if len == 0 {
            return Self::default();
        }
        Self {
            segments: vec![bytes],
            len,
        }
    }

    /// Wrap ordered segments; empty segments are dropped
    pub fn from_segments(segments: Vec<Bytes>) -> Self {
        let segments: Vec<Bytes> = segments.into_iter().filter(|s| !s.is_empty()).collect();
        let len = segments.iter().map(|s| s.len()).sum();
        Self { segments, len }
    }

    /// Total payload length
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of underlying segments
    #[inline]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Iterate the contiguous spans in order
    pub fn spans(&self) -> impl Iterator<Item = &[u8]> {
        self.segments.iter().map(|s| s.as_ref())
    }

    /// The payload as one contiguous slice, when it has at most one segment
    pub fn as_contiguous(&self) -> Option<&[u8]> {
        match self.segments.len() {
            0 => Some(&[]),
            1 => Some(self.segments[0].as_ref()),
            _ => None,
        }
    }

    /// Append another preserved buffer's segments (fragment accumulation)
    pub fn append(&mut self, other: PreservedBuffer) {
        self.len += other.len;
        self.segments.extend(other.segments);
    }

    /// Copy the payload into a fresh vector
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for segment in &self.segments {
            out.extend_from_slice(segment);
        }
        out
    }

    /// The payload as a single [`Bytes`], zero-copy when already contiguous
    pub fn into_bytes(self) -> Bytes {
        match self.segments.len() {
            0 => Bytes::new(),
            1 => self.segments.into_iter().next().unwrap(),
            _ => {
                let mut out = Vec::with_capacity(self.len);
                for segment in &self.segments {
                    out.extend_from_slice(segment);
                }
                Bytes::from(out)
            }
        }
    }
}

impl From<Bytes> for PreservedBuffer {
    fn from(bytes: Bytes) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<Vec<u8>> for PreservedBuffer {
    fn from(v: Vec<u8>) -> Self {
        Self::from_bytes(Bytes::from(v))
    }
}
