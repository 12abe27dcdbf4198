//! Message builder traits.
//!
//! Each request type declares its opcode and how to write its body; each
//! reply type declares its minimum length and how to read itself from a
//! complete reply frame. [`encode_request`] adds the header, padding and
//! length field, so builders only ever describe fields in order.
//!
//! # Example
//!
//! ```
//! use xwire::message::{encode_request, Request};
//! use xwire::protocol::{ByteOrder, WireWriter};
//! use xwire::WireError;
//!
//! struct Destroy {
//!     damage: u32,
//! }
//!
//! impl Request for Destroy {
//!     const OPCODE: u8 = 2;
//!     const NAME: &'static str = "DamageDestroy";
//!
//!     fn encode_body(&self, w: &mut WireWriter) -> Result<(), WireError> {
//!         w.u32(self.damage);
//!         Ok(())
//!     }
//! }
//!
//! let bytes = encode_request(&Destroy { damage: 7 }, Some(143), ByteOrder::Little, u16::MAX)
//!     .unwrap();
//! assert_eq!(&bytes[..], &[143, 2, 2, 0, 7, 0, 0, 0]);
//! ```

use bytes::Bytes;

use crate::error::WireError;
use crate::protocol::{
    ByteOrder, RequestHeader, WireReader, WireWriter, REPLY_CODE, REQUEST_ALIGN,
    REQUEST_HEADER_SIZE,
};

/// An outgoing request.
pub trait Request {
    /// Minor opcode for extension requests; the major opcode for core ones.
    const OPCODE: u8;
    /// Name used in logs.
    const NAME: &'static str;

    /// Byte 1 of a core request. Extension requests carry their minor
    /// opcode there instead and never call this.
    fn data_byte(&self) -> u8 {
        0
    }

    /// Write the fields after the 4-byte header, in wire order.
    fn encode_body(&self, w: &mut WireWriter) -> Result<(), WireError>;
}

/// A request the server answers with a reply.
pub trait ReplyRequest: Request {
    type Reply: Decode + Send + 'static;
}

/// A request that can be parsed back from its bytes.
pub trait DecodeRequest: Request + Sized {
    /// Read the fields after the 4-byte header. `data_byte` is byte 1 for
    /// core requests and the minor opcode for extension requests.
    fn decode_body(r: &mut WireReader<'_>, data_byte: u8) -> Result<Self, WireError>;
}

/// A structure decoded from a complete incoming frame.
pub trait Decode: Sized {
    /// Shortest frame that can hold this structure.
    const MIN_LEN: usize;

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError>;
}

/// Signature of the decoder a cookie captures when it is issued.
pub type ReplyDecoder<T> = fn(&[u8], ByteOrder) -> Result<T, WireError>;

/// Encode a complete request.
///
/// `major` is the extension's assigned major opcode, or `None` for core
/// requests. `max_units` is the server's maximum request length in 4-byte
/// units. Equal inputs always produce equal bytes.
pub fn encode_request<R: Request>(
    request: &R,
    major: Option<u8>,
    order: ByteOrder,
    max_units: u16,
) -> Result<Bytes, WireError> {
    let (first, second) = match major {
        Some(major) => (major, R::OPCODE),
        None => (R::OPCODE, request.data_byte()),
    };

    let mut w = WireWriter::new(order);
    w.u8(first);
    w.u8(second);
    w.u16(0);
    request.encode_body(&mut w)?;
    w.align(REQUEST_ALIGN);

    let units = w.len() / REQUEST_ALIGN;
    let length = u16::try_from(units)
        .ok()
        .filter(|&length| length <= max_units)
        .ok_or(WireError::RequestTooLarge {
            length: units,
            max: usize::from(max_units),
        })?;
    w.patch_u16(2, length);
    Ok(w.into_bytes())
}

/// Parse a complete request produced by [`encode_request`].
///
/// Checks the opcode and that the length field matches the buffer exactly.
pub fn decode_request<R: DecodeRequest>(
    bytes: &[u8],
    major: Option<u8>,
    order: ByteOrder,
) -> Result<R, WireError> {
    let header = RequestHeader::decode(bytes, order).ok_or(WireError::Truncated {
        needed: REQUEST_HEADER_SIZE,
        available: bytes.len(),
    })?;

    let (expected, opcode) = match major {
        Some(major) => (major, header.major_opcode),
        None => (R::OPCODE, header.major_opcode),
    };
    if opcode != expected || (major.is_some() && header.minor != R::OPCODE) {
        return Err(WireError::InvalidValue {
            field: "opcode",
            value: u64::from(header.major_opcode),
        });
    }
    if header.byte_len() > bytes.len() {
        return Err(WireError::Truncated {
            needed: header.byte_len(),
            available: bytes.len(),
        });
    }
    if header.byte_len() != bytes.len() {
        return Err(WireError::InvalidValue {
            field: "request length",
            value: u64::from(header.length),
        });
    }

    let mut r = WireReader::new(bytes, order);
    r.skip(REQUEST_HEADER_SIZE)?;
    R::decode_body(&mut r, header.minor)
}

/// Decode a structure from a complete frame, refusing short input up front.
pub fn decode_frame<T: Decode>(bytes: &[u8], order: ByteOrder) -> Result<T, WireError> {
    if bytes.len() < T::MIN_LEN {
        return Err(WireError::Truncated {
            needed: T::MIN_LEN,
            available: bytes.len(),
        });
    }
    let mut r = WireReader::new(bytes, order);
    T::decode(&mut r)
}

/// The 8-byte prefix of every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    /// Reply-specific byte 1.
    pub data: u8,
    pub sequence: u16,
    /// Extra length in 4-byte units.
    pub length: u32,
}

impl ReplyHeader {
    /// Read and check the reply prefix.
    pub fn read(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let code = r.u8()?;
        if code != REPLY_CODE {
            return Err(WireError::InvalidValue {
                field: "reply code",
                value: u64::from(code),
            });
        }
        let data = r.u8()?;
        let sequence = r.u16()?;
        let length = r.u32()?;
        Ok(Self {
            data,
            sequence,
            length,
        })
    }
}
