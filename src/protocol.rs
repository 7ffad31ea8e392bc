//! Messages and fragment reassembly
//!
//! A logical message is one Text or Binary frame followed by zero or more
//! Continuation frames through the final one. The [`MessageAssembler`]
//! enforces the fragmentation rules; depending on configuration it either
//! reassembles fragments into a single [`Message`] or hands each data frame
//! through as its own message carrying the opener's opcode.

use std::sync::OnceLock;

use crate::buffer::PreservedBuffer;
use crate::error::{CloseReason, Error, Result};
use crate::frame::OpCode;
use crate::utf8::validate_utf8;

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Server: inbound frames must be masked, outbound frames never are
    Server,
    /// Client (not implemented by the hub; here for the codec's symmetry)
    Client,
}

impl Role {
    /// Whether inbound frames must carry a mask for this role
    #[inline]
    pub fn expect_masked_ingress(&self) -> bool {
        matches!(self, Role::Server)
    }
}

/// A delivered WebSocket message
///
/// The payload keeps its wire segmentation: one segment for a single-frame
/// message, one or more for a reassembled one. Text decoding is lazy and
/// cached, so [`text`](Self::text) is idempotent and cheap after the first
/// call.
#[derive(Debug)]
pub struct Message {
    kind: OpCode,
    payload: PreservedBuffer,
    is_final: bool,
    text: OnceLock<Option<String>>,
}

impl Message {
    /// Build a message from a delivered payload
    pub(crate) fn new(kind: OpCode, payload: PreservedBuffer, is_final: bool) -> Self {
        Self {
            kind,
            payload,
            is_final,
            text: OnceLock::new(),
        }
    }

    /// Opcode of the message's first frame (Text or Binary)
    #[inline]
    pub fn kind(&self) -> OpCode {
        self.kind
    }

    #[inline]
    pub fn is_text(&self) -> bool {
        self.kind == OpCode::Text
    }

    #[inline]
    pub fn is_binary(&self) -> bool {
        self.kind == OpCode::Binary
    }

    /// False only for per-frame delivery of an unfinished fragment train
    #[inline]
    pub fn is_final(&self) -> bool {
        self.is_final
    }

    /// Payload length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// The preserved payload
    #[inline]
    pub fn payload(&self) -> &PreservedBuffer {
        &self.payload
    }

    /// Copy the payload out
    pub fn to_vec(&self) -> Vec<u8> {
        self.payload.to_vec()
    }

    /// The payload as UTF-8 text
    ///
    /// Validation runs once; the decoded string is cached, so repeated
    /// calls return the identical bytes.
    pub fn text(&self) -> Result<&str> {
        let decoded = self.text.get_or_init(|| {
            let bytes = self.payload.to_vec();
            if validate_utf8(&bytes) {
                // SAFETY: validated just above
                Some(unsafe { String::from_utf8_unchecked(bytes) })
            } else {
                None
            }
        });
        decoded.as_deref().ok_or(Error::InvalidUtf8)
    }

    /// Take the payload out of the message
    pub fn into_payload(self) -> PreservedBuffer {
        self.payload
    }
}

/// Parse a close frame payload into code and reason
///
/// Returns `None` for an empty payload; a 1-byte or invalid-code payload is
/// a protocol violation per RFC 6455 §5.5.1.
pub fn parse_close(payload: &PreservedBuffer) -> Result<Option<CloseReason>> {
    if payload.is_empty() {
        return Ok(None);
    }
    let bytes = payload.to_vec();
    if bytes.len() < 2 {
        return Err(Error::Protocol("close payload shorter than status code"));
    }
    let code = u16::from_be_bytes([bytes[0], bytes[1]]);
    if !CloseReason::is_valid_code(code) {
        return Err(Error::Protocol("invalid close status code"));
    }
    let reason = String::from_utf8_lossy(&bytes[2..]).into_owned();
    Ok(Some(CloseReason::new(code, reason)))
}

/// Fragmentation state machine for one connection's ingress
pub struct MessageAssembler {
    buffer_fragments: bool,
    max_message_size: usize,
    /// Opcode of the open fragment train, when one is open
    opcode: Option<OpCode>,
    /// Accumulated fragments (buffered mode only)
    parts: PreservedBuffer,
}

impl MessageAssembler {
    /// Create an assembler; `buffer_fragments` selects reassembly versus
    /// per-frame delivery
    pub fn new(buffer_fragments: bool, max_message_size: usize) -> Self {
        Self {
            buffer_fragments,
            max_message_size,
            opcode: None,
            parts: PreservedBuffer::default(),
        }
    }

    /// True while a fragment train is open
    #[inline]
    pub fn is_open(&self) -> bool {
        self.opcode.is_some()
    }

    /// Feed one data frame; returns a message when one is deliverable
    pub fn accept(
        &mut self,
        opcode: OpCode,
        payload: PreservedBuffer,
        fin: bool,
    ) -> Result<Option<Message>> {
        match opcode {
            OpCode::Text | OpCode::Binary => {
                if self.opcode.is_some() {
                    return Err(Error::Protocol("expected continuation frame"));
                }
                if fin {
                    return Ok(Some(Message::new(opcode, payload, true)));
                }

                self.opcode = Some(opcode);
                if self.buffer_fragments {
                    self.check_size(payload.len())?;
                    self.parts = payload;
                    Ok(None)
                } else {
                    Ok(Some(Message::new(opcode, payload, false)))
                }
            }
            OpCode::Continuation => {
                let kind = self
                    .opcode
                    .ok_or(Error::Protocol("unexpected continuation frame"))?;

                if self.buffer_fragments {
                    self.check_size(self.parts.len() + payload.len())?;
                    self.parts.append(payload);
                    if fin {
                        self.opcode = None;
                        let assembled = std::mem::take(&mut self.parts);
                        Ok(Some(Message::new(kind, assembled, true)))
                    } else {
                        Ok(None)
                    }
                } else {
                    if fin {
                        self.opcode = None;
                    }
                    Ok(Some(Message::new(kind, payload, fin)))
                }
            }
            _ => Err(Error::Protocol("control opcode in data path")),
        }
    }

    fn check_size(&self, total: usize) -> Result<()> {
        if total > self.max_message_size {
            return Err(Error::MessageTooLarge);
        }
        Ok(())
    }
}
