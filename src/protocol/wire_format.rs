//! Wire codec primitives.
//!
//! Fixed-width integers, padding and homogeneous lists, in an explicit byte
//! order. Every request encoder and reply/event/error decoder is written in
//! terms of these helpers or the [`WireWriter`]/[`WireReader`] cursors built
//! on them.
//!
//! Requests start with a 4-byte header:
//! ```text
//! ┌──────────┬────────────┬──────────────┐
//! │ Major    │ Minor/data │ Length       │
//! │ 1 byte   │ 1 byte     │ 2 bytes      │
//! │ uint8    │ uint8      │ uint16, in   │
//! │          │            │ 4-byte units │
//! └──────────┴────────────┴──────────────┘
//! ```
//!
//! The byte order of every multi-byte field is chosen by the client at
//! connection setup and applies in both directions.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// Size of a request header in bytes.
pub const REQUEST_HEADER_SIZE: usize = 4;

/// Requests and replies are padded to this boundary.
pub const REQUEST_ALIGN: usize = 4;

/// Byte order of multi-byte fields on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ByteOrder {
    /// Least significant byte first (`'l'` at setup).
    Little,
    /// Most significant byte first (`'B'` at setup).
    Big,
}

impl ByteOrder {
    /// Byte order of the host.
    pub const fn native() -> Self {
        if cfg!(target_endian = "little") {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        }
    }

    /// The byte sent first in the connection setup request.
    pub const fn setup_byte(self) -> u8 {
        match self {
            ByteOrder::Little => b'l',
            ByteOrder::Big => b'B',
        }
    }

    /// Parse a setup byte order marker.
    pub const fn from_setup_byte(byte: u8) -> Option<Self> {
        match byte {
            b'l' => Some(ByteOrder::Little),
            b'B' => Some(ByteOrder::Big),
            _ => None,
        }
    }
}

impl Default for ByteOrder {
    fn default() -> Self {
        Self::native()
    }
}

/// Width of an unsigned integer field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    U8,
    U16,
    U32,
    U64,
}

impl Width {
    /// Number of bytes occupied on the wire.
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            Width::U8 => 1,
            Width::U16 => 2,
            Width::U32 => 4,
            Width::U64 => 8,
        }
    }

    /// Largest value representable in this width.
    #[inline]
    pub const fn max_value(self) -> u64 {
        match self {
            Width::U8 => u8::MAX as u64,
            Width::U16 => u16::MAX as u64,
            Width::U32 => u32::MAX as u64,
            Width::U64 => u64::MAX,
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bytes() * 8)
    }
}

/// Number of zero bytes needed to bring `len` up to a multiple of `align`.
#[inline]
pub const fn pad_len(len: usize, align: usize) -> usize {
    (align - len % align) % align
}

/// Append `value` as a `width`-byte integer.
///
/// Fails if `value` does not fit; values are never truncated.
pub fn encode_uint<B: BufMut>(
    buf: &mut B,
    value: u64,
    width: Width,
    order: ByteOrder,
) -> Result<(), WireError> {
    if value > width.max_value() {
        return Err(WireError::ValueOutOfRange { value, width });
    }
    match (width, order) {
        (Width::U8, _) => buf.put_u8(value as u8),
        (Width::U16, ByteOrder::Little) => buf.put_u16_le(value as u16),
        (Width::U16, ByteOrder::Big) => buf.put_u16(value as u16),
        (Width::U32, ByteOrder::Little) => buf.put_u32_le(value as u32),
        (Width::U32, ByteOrder::Big) => buf.put_u32(value as u32),
        (Width::U64, ByteOrder::Little) => buf.put_u64_le(value),
        (Width::U64, ByteOrder::Big) => buf.put_u64(value),
    }
    Ok(())
}

/// Read a `width`-byte integer at `offset`.
///
/// Returns the value and the offset just past it.
pub fn decode_uint(
    buf: &[u8],
    offset: usize,
    width: Width,
    order: ByteOrder,
) -> Result<(u64, usize), WireError> {
    let n = width.bytes();
    let end = offset.checked_add(n).ok_or(WireError::Truncated {
        needed: n,
        available: 0,
    })?;
    let raw = buf.get(offset..end).ok_or(WireError::Truncated {
        needed: n,
        available: buf.len().saturating_sub(offset),
    })?;

    let value = match order {
        ByteOrder::Little => raw
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
        ByteOrder::Big => raw.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)),
    };
    Ok((value, end))
}

/// Append `payload`, then zero bytes until the buffer length is a multiple
/// of `pad_to`.
///
/// # Panics
///
/// Panics if `pad_to` is not a power of two.
pub fn encode_padded_bytes(buf: &mut BytesMut, payload: &[u8], pad_to: usize) {
    assert!(pad_to.is_power_of_two(), "pad_to must be a power of two");
    buf.put_slice(payload);
    buf.put_bytes(0, pad_len(buf.len(), pad_to));
}

/// Append each value as a `width`-byte integer.
pub fn pack_list<B: BufMut>(
    buf: &mut B,
    values: &[u64],
    width: Width,
    order: ByteOrder,
) -> Result<(), WireError> {
    for &value in values {
        encode_uint(buf, value, width, order)?;
    }
    Ok(())
}

/// Read exactly `count` integers of `width` starting at `offset`.
///
/// `count` must come from a previously decoded length field. The whole
/// range is bounds-checked before anything is allocated.
pub fn unpack_list(
    buf: &[u8],
    offset: usize,
    count: usize,
    width: Width,
    order: ByteOrder,
) -> Result<(Vec<u64>, usize), WireError> {
    let available = buf.len().saturating_sub(offset);
    let needed = count.checked_mul(width.bytes()).ok_or(WireError::Truncated {
        needed: usize::MAX,
        available,
    })?;
    if needed > available {
        return Err(WireError::Truncated { needed, available });
    }

    let mut values = Vec::with_capacity(count);
    let mut pos = offset;
    for _ in 0..count {
        let (value, next) = decode_uint(buf, pos, width, order)?;
        values.push(value);
        pos = next;
    }
    Ok((values, pos))
}

/// Header of an outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Major opcode: the core opcode, or the extension's assigned base.
    pub major_opcode: u8,
    /// Minor opcode for extensions, request-specific data for core requests.
    pub minor: u8,
    /// Total request length in 4-byte units, header included.
    pub length: u16,
}

impl RequestHeader {
    /// Create a new header.
    pub fn new(major_opcode: u8, minor: u8, length: u16) -> Self {
        Self {
            major_opcode,
            minor,
            length,
        }
    }

    /// Encode the header.
    ///
    /// # Example
    ///
    /// ```
    /// use xwire::protocol::{ByteOrder, RequestHeader};
    ///
    /// let header = RequestHeader::new(143, 2, 2);
    /// assert_eq!(header.encode(ByteOrder::Little), [143, 2, 2, 0]);
    /// assert_eq!(header.encode(ByteOrder::Big), [143, 2, 0, 2]);
    /// ```
    pub fn encode(&self, order: ByteOrder) -> [u8; REQUEST_HEADER_SIZE] {
        let length = match order {
            ByteOrder::Little => self.length.to_le_bytes(),
            ByteOrder::Big => self.length.to_be_bytes(),
        };
        [self.major_opcode, self.minor, length[0], length[1]]
    }

    /// Decode a header. Returns `None` if the buffer is too short.
    pub fn decode(buf: &[u8], order: ByteOrder) -> Option<Self> {
        if buf.len() < REQUEST_HEADER_SIZE {
            return None;
        }
        let length = match order {
            ByteOrder::Little => u16::from_le_bytes([buf[2], buf[3]]),
            ByteOrder::Big => u16::from_be_bytes([buf[2], buf[3]]),
        };
        Some(Self {
            major_opcode: buf[0],
            minor: buf[1],
            length,
        })
    }

    /// Request length in bytes.
    #[inline]
    pub fn byte_len(&self) -> usize {
        usize::from(self.length) * REQUEST_ALIGN
    }

    /// Validate the header against the server's maximum request length.
    ///
    /// A zero length is the BIG-REQUESTS form, which this crate never emits.
    pub fn validate(&self, max_units: u16) -> Result<(), WireError> {
        if self.length == 0 {
            return Err(WireError::InvalidValue {
                field: "length",
                value: 0,
            });
        }
        if self.length > max_units {
            return Err(WireError::RequestTooLarge {
                length: usize::from(self.length),
                max: usize::from(max_units),
            });
        }
        Ok(())
    }
}

/// Growable output buffer with typed, order-aware writers.
#[derive(Debug)]
pub struct WireWriter {
    buf: BytesMut,
    order: ByteOrder,
}

impl WireWriter {
    pub fn new(order: ByteOrder) -> Self {
        Self::with_capacity(order, 32)
    }

    pub fn with_capacity(order: ByteOrder, capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            order,
        }
    }

    #[inline]
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn u16(&mut self, value: u16) {
        match self.order {
            ByteOrder::Little => self.buf.put_u16_le(value),
            ByteOrder::Big => self.buf.put_u16(value),
        }
    }

    pub fn i16(&mut self, value: i16) {
        self.u16(value as u16);
    }

    pub fn u32(&mut self, value: u32) {
        match self.order {
            ByteOrder::Little => self.buf.put_u32_le(value),
            ByteOrder::Big => self.buf.put_u32(value),
        }
    }

    pub fn i32(&mut self, value: i32) {
        self.u32(value as u32);
    }

    /// Write `value` as a `width`-byte integer, rejecting out-of-range values.
    pub fn uint(&mut self, value: u64, width: Width) -> Result<(), WireError> {
        encode_uint(&mut self.buf, value, width, self.order)
    }

    /// Write `n` zero bytes.
    pub fn pad(&mut self, n: usize) {
        self.buf.put_bytes(0, n);
    }

    /// Zero-pad up to the next multiple of `align`.
    pub fn align(&mut self, align: usize) {
        self.pad(pad_len(self.buf.len(), align));
    }

    pub fn bytes(&mut self, payload: &[u8]) {
        self.buf.put_slice(payload);
    }

    /// Write `payload` then pad the whole buffer to `align`.
    pub fn padded_bytes(&mut self, payload: &[u8], align: usize) {
        encode_padded_bytes(&mut self.buf, payload, align);
    }

    pub fn u32_list(&mut self, values: &[u32]) {
        for &value in values {
            self.u32(value);
        }
    }

    /// Overwrite a previously written 16-bit field.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 2` is past the written data.
    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        let bytes = match self.order {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        self.buf[offset..offset + 2].copy_from_slice(&bytes);
    }

    /// Freeze the buffer.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Bounds-checked cursor over a received buffer.
///
/// Every accessor fails with [`WireError::Truncated`] instead of reading
/// past the end.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        Self { buf, pos: 0, order }
    }

    #[inline]
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// Fail unless at least `n` more bytes are available.
    pub fn require(&self, n: usize) -> Result<(), WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    pub fn uint(&mut self, width: Width) -> Result<u64, WireError> {
        let (value, next) = decode_uint(self.buf, self.pos, width, self.order)?;
        self.pos = next;
        Ok(value)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.uint(Width::U8)? as u8)
    }

    pub fn bool(&mut self) -> Result<bool, WireError> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        Ok(self.uint(Width::U16)? as u16)
    }

    pub fn i16(&mut self) -> Result<i16, WireError> {
        Ok(self.u16()? as i16)
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        Ok(self.uint(Width::U32)? as u32)
    }

    pub fn i32(&mut self) -> Result<i32, WireError> {
        Ok(self.u32()? as i32)
    }

    /// Skip `n` bytes of padding or unused fields.
    pub fn skip(&mut self, n: usize) -> Result<(), WireError> {
        self.require(n)?;
        self.pos += n;
        Ok(())
    }

    /// Skip to the next multiple of `align` relative to the buffer start.
    pub fn align(&mut self, align: usize) -> Result<(), WireError> {
        self.skip(pad_len(self.pos, align))
    }

    /// Borrow the next `n` bytes.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.require(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Read exactly `count` 32-bit values.
    pub fn u32_list(&mut self, count: usize) -> Result<Vec<u32>, WireError> {
        let (values, next) = unpack_list(self.buf, self.pos, count, Width::U32, self.order)?;
        self.pos = next;
        Ok(values.into_iter().map(|v| v as u32).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_uint_little_and_big() {
        let mut buf = BytesMut::new();
        encode_uint(&mut buf, 0x0102_0304, Width::U32, ByteOrder::Little).unwrap();
        encode_uint(&mut buf, 0x0102_0304, Width::U32, ByteOrder::Big).unwrap();
        assert_eq!(&buf[..], &[4, 3, 2, 1, 1, 2, 3, 4]);
    }

    #[test]
    fn test_encode_uint_rejects_out_of_range() {
        let mut buf = BytesMut::new();
        let err = encode_uint(&mut buf, 256, Width::U8, ByteOrder::Little).unwrap_err();
        assert_eq!(
            err,
            WireError::ValueOutOfRange {
                value: 256,
                width: Width::U8
            }
        );
        assert!(buf.is_empty(), "nothing written on failure");

        let err = encode_uint(&mut buf, 0x1_0000, Width::U16, ByteOrder::Big).unwrap_err();
        assert!(matches!(err, WireError::ValueOutOfRange { .. }));
    }

    #[test]
    fn test_encode_uint_width_limits() {
        let mut buf = BytesMut::new();
        encode_uint(&mut buf, u64::from(u8::MAX), Width::U8, ByteOrder::Little).unwrap();
        encode_uint(&mut buf, u64::from(u16::MAX), Width::U16, ByteOrder::Little).unwrap();
        encode_uint(&mut buf, u64::from(u32::MAX), Width::U32, ByteOrder::Little).unwrap();
        encode_uint(&mut buf, u64::MAX, Width::U64, ByteOrder::Little).unwrap();
        assert_eq!(buf.len(), 1 + 2 + 4 + 8);
    }

    #[test]
    fn test_decode_uint_offsets() {
        let buf = [0xAA, 0x34, 0x12, 0x12, 0x34];
        let (v, next) = decode_uint(&buf, 1, Width::U16, ByteOrder::Little).unwrap();
        assert_eq!(v, 0x1234);
        assert_eq!(next, 3);
        let (v, next) = decode_uint(&buf, next, Width::U16, ByteOrder::Big).unwrap();
        assert_eq!(v, 0x1234);
        assert_eq!(next, 5);
    }

    #[test]
    fn test_decode_uint_truncated() {
        let buf = [1, 2, 3];
        let err = decode_uint(&buf, 0, Width::U32, ByteOrder::Little).unwrap_err();
        assert_eq!(
            err,
            WireError::Truncated {
                needed: 4,
                available: 3
            }
        );

        let err = decode_uint(&buf, 10, Width::U8, ByteOrder::Little).unwrap_err();
        assert_eq!(
            err,
            WireError::Truncated {
                needed: 1,
                available: 0
            }
        );
    }

    #[test]
    fn test_pad_len() {
        assert_eq!(pad_len(0, 4), 0);
        assert_eq!(pad_len(1, 4), 3);
        assert_eq!(pad_len(4, 4), 0);
        assert_eq!(pad_len(6, 4), 2);
        assert_eq!(pad_len(7, 8), 1);
    }

    #[test]
    fn test_encode_padded_bytes() {
        let mut buf = BytesMut::new();
        encode_padded_bytes(&mut buf, b"DAMAGE", 4);
        assert_eq!(&buf[..], b"DAMAGE\0\0");

        let mut buf = BytesMut::new();
        encode_padded_bytes(&mut buf, b"XFIX", 4);
        assert_eq!(&buf[..], b"XFIX");
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_encode_padded_bytes_bad_alignment() {
        let mut buf = BytesMut::new();
        encode_padded_bytes(&mut buf, b"x", 3);
    }

    #[test]
    fn test_pack_and_unpack_list() {
        let mut buf = BytesMut::new();
        pack_list(&mut buf, &[1, 2, 0xFFFF], Width::U16, ByteOrder::Big).unwrap();
        assert_eq!(&buf[..], &[0, 1, 0, 2, 0xFF, 0xFF]);

        let (values, next) = unpack_list(&buf, 0, 3, Width::U16, ByteOrder::Big).unwrap();
        assert_eq!(values, vec![1, 2, 0xFFFF]);
        assert_eq!(next, 6);
    }

    #[test]
    fn test_unpack_list_uses_count_not_buffer_size() {
        let buf = [1u8, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0];
        let (values, next) = unpack_list(&buf, 0, 2, Width::U32, ByteOrder::Little).unwrap();
        assert_eq!(values, vec![1, 2]);
        assert_eq!(next, 8);
    }

    #[test]
    fn test_unpack_list_rejects_oversized_count() {
        let buf = [0u8; 8];
        let err = unpack_list(&buf, 0, 3, Width::U32, ByteOrder::Little).unwrap_err();
        assert_eq!(
            err,
            WireError::Truncated {
                needed: 12,
                available: 8
            }
        );

        let err = unpack_list(&buf, 0, usize::MAX, Width::U32, ByteOrder::Little).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn test_request_header_roundtrip() {
        let header = RequestHeader::new(98, 0, 5);
        for order in [ByteOrder::Little, ByteOrder::Big] {
            let bytes = header.encode(order);
            assert_eq!(RequestHeader::decode(&bytes, order), Some(header));
        }
        assert_eq!(header.byte_len(), 20);
    }

    #[test]
    fn test_request_header_decode_too_short() {
        assert!(RequestHeader::decode(&[1, 2, 3], ByteOrder::Little).is_none());
    }

    #[test]
    fn test_request_header_validate() {
        assert!(RequestHeader::new(1, 0, 1).validate(u16::MAX).is_ok());

        let err = RequestHeader::new(1, 0, 0).validate(u16::MAX).unwrap_err();
        assert!(matches!(err, WireError::InvalidValue { field: "length", .. }));

        let err = RequestHeader::new(1, 0, 10).validate(8).unwrap_err();
        assert_eq!(err, WireError::RequestTooLarge { length: 10, max: 8 });
    }

    #[test]
    fn test_setup_byte() {
        assert_eq!(ByteOrder::Little.setup_byte(), b'l');
        assert_eq!(ByteOrder::from_setup_byte(b'B'), Some(ByteOrder::Big));
        assert_eq!(ByteOrder::from_setup_byte(b'x'), None);
    }

    #[test]
    fn test_writer_and_reader() {
        let mut w = WireWriter::new(ByteOrder::Big);
        w.u8(7);
        w.pad(1);
        w.u16(0x0102);
        w.i16(-2);
        w.u32(0xDEAD_BEEF);
        w.padded_bytes(b"abc", 4);
        assert_eq!(w.len(), 16);

        let bytes = w.into_bytes();
        let mut r = WireReader::new(&bytes, ByteOrder::Big);
        assert_eq!(r.u8().unwrap(), 7);
        r.skip(1).unwrap();
        assert_eq!(r.u16().unwrap(), 0x0102);
        assert_eq!(r.i16().unwrap(), -2);
        assert_eq!(r.u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.bytes(3).unwrap(), b"abc");
        r.align(4).unwrap();
        assert_eq!(r.remaining(), 0);
        assert!(r.u8().is_err());
    }

    #[test]
    fn test_writer_patch_u16() {
        let mut w = WireWriter::new(ByteOrder::Little);
        w.u8(1);
        w.u8(0);
        w.u16(0);
        w.patch_u16(2, 0x0304);
        assert_eq!(w.as_slice(), &[1, 0, 4, 3]);
    }

    #[test]
    fn test_reader_list_truncated() {
        let bytes = [0u8; 6];
        let mut r = WireReader::new(&bytes, ByteOrder::Little);
        assert!(r.u32_list(2).is_err());
        assert_eq!(r.position(), 0, "failed read leaves the cursor in place");
        assert_eq!(r.u32_list(1).unwrap(), vec![0]);
    }
}
