//! Incoming frame classification.
//!
//! Everything the server sends after setup is a frame of at least 32 bytes.
//! The first byte says what it is:
//!
//! ```text
//! 0        error           32 bytes
//! 1        reply           32 + 4 * length bytes (length: u32 at offset 4)
//! 35       generic event   32 + 4 * length bytes (length: u32 at offset 4)
//! 2..=127  event           32 bytes
//! ```
//!
//! Bit 7 of an event code marks events generated by `SendEvent`.
//! Bytes 2..4 of every frame hold the low 16 bits of the sequence number of
//! the last request the server processed.
//!
//! The frame builders at the bottom produce byte-exact server frames; they
//! back the tests and any in-process fake server.

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{pad_len, ByteOrder};
use crate::error::WireError;

/// Size of the fixed part of every incoming frame.
pub const FRAME_SIZE: usize = 32;

/// First byte of an error frame.
pub const ERROR_CODE: u8 = 0;

/// First byte of a reply frame.
pub const REPLY_CODE: u8 = 1;

/// Event code of the generic (variable-length) event.
pub const GENERIC_EVENT_CODE: u8 = 35;

/// Set on events delivered through `SendEvent`.
pub const SEND_EVENT_FLAG: u8 = 0x80;

/// Payload bytes available to a fixed-size event after its 4-byte prefix.
pub const EVENT_BODY_SIZE: usize = FRAME_SIZE - 4;

/// What an incoming frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Error,
    Reply,
    Event,
    GenericEvent,
}

impl FrameKind {
    /// Classify a frame by its first byte.
    pub fn classify(first: u8) -> Self {
        match first {
            ERROR_CODE => FrameKind::Error,
            REPLY_CODE => FrameKind::Reply,
            c if c & !SEND_EVENT_FLAG == GENERIC_EVENT_CODE => FrameKind::GenericEvent,
            _ => FrameKind::Event,
        }
    }

    /// Whether frames of this kind declare extra length at offset 4.
    #[inline]
    pub fn is_variable(self) -> bool {
        matches!(self, FrameKind::Reply | FrameKind::GenericEvent)
    }
}

/// The fields shared by every incoming frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    /// First byte, unmodified (includes the send-event flag).
    pub code: u8,
    /// Second byte: reply data, error code, or event detail.
    pub detail: u8,
    /// Low 16 bits of the sequence number.
    pub sequence: u16,
    /// Extra length in 4-byte units (replies and generic events only).
    pub extra_length: u32,
}

impl FrameHeader {
    /// Decode the fixed header. Returns `None` if fewer than 32 bytes are given.
    pub fn decode(buf: &[u8], order: ByteOrder) -> Option<Self> {
        if buf.len() < FRAME_SIZE {
            return None;
        }
        let kind = FrameKind::classify(buf[0]);
        let sequence = match order {
            ByteOrder::Little => u16::from_le_bytes([buf[2], buf[3]]),
            ByteOrder::Big => u16::from_be_bytes([buf[2], buf[3]]),
        };
        let extra_length = if kind.is_variable() {
            let raw = [buf[4], buf[5], buf[6], buf[7]];
            match order {
                ByteOrder::Little => u32::from_le_bytes(raw),
                ByteOrder::Big => u32::from_be_bytes(raw),
            }
        } else {
            0
        };
        Some(Self {
            kind,
            code: buf[0],
            detail: buf[1],
            sequence,
            extra_length,
        })
    }

    /// Total frame length in bytes as declared by the header.
    ///
    /// Computed in 64 bits so a hostile length cannot overflow.
    #[inline]
    pub fn total_len(&self) -> u64 {
        FRAME_SIZE as u64 + u64::from(self.extra_length) * 4
    }
}

/// A complete incoming frame, header included.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub header: FrameHeader,
    bytes: Bytes,
    order: ByteOrder,
}

impl RawFrame {
    /// Wrap the bytes of one complete frame.
    ///
    /// Returns `None` if the bytes are shorter than a frame header or shorter
    /// than the header declares.
    pub fn new(bytes: Bytes, order: ByteOrder) -> Option<Self> {
        let header = FrameHeader::decode(&bytes, order)?;
        if (bytes.len() as u64) < header.total_len() {
            return None;
        }
        Some(Self {
            header,
            bytes,
            order,
        })
    }

    #[inline]
    pub fn kind(&self) -> FrameKind {
        self.header.kind
    }

    #[inline]
    pub fn sequence(&self) -> u16 {
        self.header.sequence
    }

    #[inline]
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// The whole frame.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Cheap clone of the frame bytes.
    #[inline]
    pub fn to_bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Event code with the send-event flag masked off.
    #[inline]
    pub fn event_code(&self) -> u8 {
        self.header.code & !SEND_EVENT_FLAG
    }

    /// Whether the event came from `SendEvent`.
    #[inline]
    pub fn is_send_event(&self) -> bool {
        self.header.kind != FrameKind::Error
            && self.header.kind != FrameKind::Reply
            && self.header.code & SEND_EVENT_FLAG != 0
    }

    /// Error code of an error frame.
    #[inline]
    pub fn error_code(&self) -> u8 {
        self.header.detail
    }

    /// Major opcode of the extension that sent a generic event.
    #[inline]
    pub fn generic_extension(&self) -> u8 {
        self.header.detail
    }

    /// Event type of a generic event (u16 at offset 8).
    pub fn generic_event_type(&self) -> u16 {
        let raw = [self.bytes[8], self.bytes[9]];
        match self.order {
            ByteOrder::Little => u16::from_le_bytes(raw),
            ByteOrder::Big => u16::from_be_bytes(raw),
        }
    }
}

fn put_u16(buf: &mut BytesMut, value: u16, order: ByteOrder) {
    match order {
        ByteOrder::Little => buf.put_u16_le(value),
        ByteOrder::Big => buf.put_u16(value),
    }
}

fn put_u32(buf: &mut BytesMut, value: u32, order: ByteOrder) {
    match order {
        ByteOrder::Little => buf.put_u32_le(value),
        ByteOrder::Big => buf.put_u32(value),
    }
}

/// Build a reply frame.
///
/// `body` starts at offset 8 (right after the length field). The frame is
/// zero-padded to at least 32 bytes and to a 4-byte boundary, and the length
/// field is filled in accordingly.
///
/// # Example
///
/// ```
/// use xwire::protocol::{encode_reply_frame, ByteOrder, RawFrame, FrameKind};
///
/// let bytes = encode_reply_frame(ByteOrder::Little, 0, 7, &[1, 2, 3, 4]);
/// assert_eq!(bytes.len(), 32);
/// let frame = RawFrame::new(bytes, ByteOrder::Little).unwrap();
/// assert_eq!(frame.kind(), FrameKind::Reply);
/// assert_eq!(frame.sequence(), 7);
/// ```
pub fn encode_reply_frame(order: ByteOrder, data: u8, sequence: u16, body: &[u8]) -> Bytes {
    let unpadded = 8 + body.len();
    let total = (unpadded + pad_len(unpadded, 4)).max(FRAME_SIZE);
    let extra = ((total - FRAME_SIZE) / 4) as u32;

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(REPLY_CODE);
    buf.put_u8(data);
    put_u16(&mut buf, sequence, order);
    put_u32(&mut buf, extra, order);
    buf.put_slice(body);
    buf.put_bytes(0, total - buf.len());
    buf.freeze()
}

/// Build a 32-byte error frame.
pub fn encode_error_frame(
    order: ByteOrder,
    code: u8,
    sequence: u16,
    bad_value: u32,
    minor_opcode: u16,
    major_opcode: u8,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_SIZE);
    buf.put_u8(ERROR_CODE);
    buf.put_u8(code);
    put_u16(&mut buf, sequence, order);
    put_u32(&mut buf, bad_value, order);
    put_u16(&mut buf, minor_opcode, order);
    buf.put_u8(major_opcode);
    buf.put_bytes(0, FRAME_SIZE - buf.len());
    buf.freeze()
}

/// Build a 32-byte event frame.
///
/// `body` follows the 4-byte prefix and may hold at most 28 bytes.
pub fn encode_event_frame(
    order: ByteOrder,
    code: u8,
    detail: u8,
    sequence: u16,
    body: &[u8],
) -> Result<Bytes, WireError> {
    if body.len() > EVENT_BODY_SIZE {
        return Err(WireError::InvalidValue {
            field: "event body length",
            value: body.len() as u64,
        });
    }
    let mut buf = BytesMut::with_capacity(FRAME_SIZE);
    buf.put_u8(code);
    buf.put_u8(detail);
    put_u16(&mut buf, sequence, order);
    buf.put_slice(body);
    buf.put_bytes(0, FRAME_SIZE - buf.len());
    Ok(buf.freeze())
}
