//! Protocol module - wire format, framing, and connection setup.
//!
//! This module implements the byte-level layer:
//! - Fixed-width integer and padding primitives
//! - Request headers and 32-byte incoming frames
//! - Frame buffer for accumulating partial reads
//! - Connection setup exchange
//! - The core requests the connection itself issues (`xproto`)

mod frame;
mod frame_buffer;
pub mod setup;
mod wire_format;
pub mod xproto;

pub use frame::{
    encode_error_frame, encode_event_frame, encode_reply_frame, FrameHeader, FrameKind, RawFrame,
    ERROR_CODE, EVENT_BODY_SIZE, FRAME_SIZE, GENERIC_EVENT_CODE, REPLY_CODE, SEND_EVENT_FLAG,
};
pub use frame_buffer::{FrameBuffer, DEFAULT_MAX_FRAME_SIZE};
pub use setup::{Setup, SetupRequest, SetupResponse};
pub use wire_format::{
    decode_uint, encode_padded_bytes, encode_uint, pack_list, pad_len, unpack_list, ByteOrder,
    RequestHeader, Width, WireReader, WireWriter, REQUEST_ALIGN, REQUEST_HEADER_SIZE,
};
