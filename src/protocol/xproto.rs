//! The handful of core requests the connection itself needs.

use crate::error::WireError;
use crate::message::{Decode, DecodeRequest, ReplyHeader, ReplyRequest, Request};

use super::frame::FRAME_SIZE;
use super::wire_format::{Width, WireReader, WireWriter};

/// Core opcode of `GetInputFocus`, the cheapest round trip.
pub const GET_INPUT_FOCUS_OPCODE: u8 = 43;

/// Core opcode of `QueryExtension`.
pub const QUERY_EXTENSION_OPCODE: u8 = 98;

/// Ask the server whether an extension is present and where its opcode and
/// code ranges start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryExtension {
    pub name: Vec<u8>,
}

impl QueryExtension {
    pub fn new(name: impl Into<Vec<u8>>) -> Self {
        Self { name: name.into() }
    }
}

impl Request for QueryExtension {
    const OPCODE: u8 = QUERY_EXTENSION_OPCODE;
    const NAME: &'static str = "QueryExtension";

    fn encode_body(&self, w: &mut WireWriter) -> Result<(), WireError> {
        w.uint(self.name.len() as u64, Width::U16)?;
        w.pad(2);
        w.padded_bytes(&self.name, 4);
        Ok(())
    }
}

impl DecodeRequest for QueryExtension {
    fn decode_body(r: &mut WireReader<'_>, _data_byte: u8) -> Result<Self, WireError> {
        let len = usize::from(r.u16()?);
        r.skip(2)?;
        let name = r.bytes(len)?.to_vec();
        r.align(4)?;
        Ok(Self { name })
    }
}

impl ReplyRequest for QueryExtension {
    type Reply = QueryExtensionReply;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryExtensionReply {
    pub present: bool,
    pub major_opcode: u8,
    pub first_event: u8,
    pub first_error: u8,
}

impl Decode for QueryExtensionReply {
    const MIN_LEN: usize = FRAME_SIZE;

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        ReplyHeader::read(r)?;
        Ok(Self {
            present: r.bool()?,
            major_opcode: r.u8()?,
            first_event: r.u8()?,
            first_error: r.u8()?,
        })
    }
}

/// Used by [`Connection::sync`](crate::Connection::sync) as a round trip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetInputFocus;

impl Request for GetInputFocus {
    const OPCODE: u8 = GET_INPUT_FOCUS_OPCODE;
    const NAME: &'static str = "GetInputFocus";

    fn encode_body(&self, _w: &mut WireWriter) -> Result<(), WireError> {
        Ok(())
    }
}

impl ReplyRequest for GetInputFocus {
    type Reply = GetInputFocusReply;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetInputFocusReply {
    pub revert_to: u8,
    pub focus: u32,
}

impl Decode for GetInputFocusReply {
    const MIN_LEN: usize = FRAME_SIZE;

    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let header = ReplyHeader::read(r)?;
        Ok(Self {
            revert_to: header.data,
            focus: r.u32()?,
        })
    }
}

const CORE_ERROR_NAMES: [&str; 17] = [
    "Request",
    "Value",
    "Window",
    "Pixmap",
    "Atom",
    "Cursor",
    "Font",
    "Match",
    "Drawable",
    "Access",
    "Alloc",
    "Colormap",
    "GContext",
    "IDChoice",
    "Name",
    "Length",
    "Implementation",
];

/// Name of a core protocol error code, if it is one.
pub fn core_error_name(code: u8) -> Option<&'static str> {
    match code {
        1..=17 => Some(CORE_ERROR_NAMES[usize::from(code - 1)]),
        _ => None,
    }
}
