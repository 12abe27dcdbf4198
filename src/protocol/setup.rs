//! Connection setup handshake.
//!
//! Before any request, the client announces its byte order, protocol
//! version and authorization:
//!
//! ```text
//! ┌───────┬─────┬───────┬───────┬──────────┬──────────┬─────┬──────┬──────┐
//! │ order │ pad │ major │ minor │ name len │ data len │ pad │ name │ data │
//! │ 1     │ 1   │ 2     │ 2     │ 2        │ 2        │ 2   │ pad4 │ pad4 │
//! └───────┴─────┴───────┴───────┴──────────┴──────────┴─────┴──────┴──────┘
//! ```
//!
//! The server answers with an 8-byte prefix whose first byte is the status
//! (0 failed, 1 success, 2 authenticate) and whose `u16` at offset 6 counts
//! the 4-byte units that follow.

use bytes::Bytes;

use super::wire_format::{pad_len, ByteOrder, WireReader, WireWriter};
use crate::error::WireError;

/// Protocol major version spoken by this crate.
pub const PROTOCOL_MAJOR_VERSION: u16 = 11;

/// Protocol minor version spoken by this crate.
pub const PROTOCOL_MINOR_VERSION: u16 = 0;

/// Size of the response prefix that carries the response length.
pub const SETUP_PREFIX_SIZE: usize = 8;

const STATUS_FAILED: u8 = 0;
const STATUS_SUCCESS: u8 = 1;
const STATUS_AUTHENTICATE: u8 = 2;

/// The client's half of the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupRequest {
    pub order: ByteOrder,
    pub protocol_major_version: u16,
    pub protocol_minor_version: u16,
    pub authorization_protocol_name: Vec<u8>,
    pub authorization_protocol_data: Vec<u8>,
}

impl SetupRequest {
    /// Setup request for protocol 11.0 with optional authorization.
    pub fn new(order: ByteOrder, auth_name: Vec<u8>, auth_data: Vec<u8>) -> Self {
        Self {
            order,
            protocol_major_version: PROTOCOL_MAJOR_VERSION,
            protocol_minor_version: PROTOCOL_MINOR_VERSION,
            authorization_protocol_name: auth_name,
            authorization_protocol_data: auth_data,
        }
    }

    pub fn encode(&self) -> Result<Bytes, WireError> {
        let name_len = u16::try_from(self.authorization_protocol_name.len()).map_err(|_| {
            WireError::InvalidValue {
                field: "authorization name length",
                value: self.authorization_protocol_name.len() as u64,
            }
        })?;
        let data_len = u16::try_from(self.authorization_protocol_data.len()).map_err(|_| {
            WireError::InvalidValue {
                field: "authorization data length",
                value: self.authorization_protocol_data.len() as u64,
            }
        })?;

        let mut w = WireWriter::new(self.order);
        w.u8(self.order.setup_byte());
        w.pad(1);
        w.u16(self.protocol_major_version);
        w.u16(self.protocol_minor_version);
        w.u16(name_len);
        w.u16(data_len);
        w.pad(2);
        w.padded_bytes(&self.authorization_protocol_name, 4);
        w.padded_bytes(&self.authorization_protocol_data, 4);
        Ok(w.into_bytes())
    }

    /// Parse a setup request, as a server would.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let first = *buf.first().ok_or(WireError::Truncated {
            needed: 1,
            available: 0,
        })?;
        let order = ByteOrder::from_setup_byte(first).ok_or(WireError::InvalidValue {
            field: "byte order",
            value: u64::from(first),
        })?;

        let mut r = WireReader::new(buf, order);
        r.skip(2)?;
        let protocol_major_version = r.u16()?;
        let protocol_minor_version = r.u16()?;
        let name_len = usize::from(r.u16()?);
        let data_len = usize::from(r.u16()?);
        r.skip(2)?;
        let name = r.bytes(name_len)?.to_vec();
        r.align(4)?;
        let data = r.bytes(data_len)?.to_vec();
        r.align(4)?;

        Ok(Self {
            order,
            protocol_major_version,
            protocol_minor_version,
            authorization_protocol_name: name,
            authorization_protocol_data: data,
        })
    }
}

/// A pixmap format supported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Format {
    pub depth: u8,
    pub bits_per_pixel: u8,
    pub scanline_pad: u8,
}

/// A visual type available at some depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Visual {
    pub visual_id: u32,
    pub class: u8,
    pub bits_per_rgb_value: u8,
    pub colormap_entries: u16,
    pub red_mask: u32,
    pub green_mask: u32,
    pub blue_mask: u32,
}

/// A depth supported by a screen, with its visuals.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Depth {
    pub depth: u8,
    pub visuals: Vec<Visual>,
}

/// One root screen.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Screen {
    pub root: u32,
    pub default_colormap: u32,
    pub white_pixel: u32,
    pub black_pixel: u32,
    pub current_input_masks: u32,
    pub width_in_pixels: u16,
    pub height_in_pixels: u16,
    pub width_in_millimeters: u16,
    pub height_in_millimeters: u16,
    pub min_installed_maps: u16,
    pub max_installed_maps: u16,
    pub root_visual: u32,
    pub backing_stores: u8,
    pub save_unders: bool,
    pub root_depth: u8,
    pub allowed_depths: Vec<Depth>,
}

/// The server's description of itself after a successful handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Setup {
    pub protocol_major_version: u16,
    pub protocol_minor_version: u16,
    pub release_number: u32,
    pub resource_id_base: u32,
    pub resource_id_mask: u32,
    pub motion_buffer_size: u32,
    /// Maximum request length in 4-byte units.
    pub maximum_request_length: u16,
    pub image_byte_order: u8,
    pub bitmap_format_bit_order: u8,
    pub bitmap_format_scanline_unit: u8,
    pub bitmap_format_scanline_pad: u8,
    pub min_keycode: u8,
    pub max_keycode: u8,
    pub vendor: String,
    pub pixmap_formats: Vec<Format>,
    pub roots: Vec<Screen>,
}

/// Outcome of the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupResponse {
    Success(Setup),
    Failed {
        reason: String,
        protocol_major_version: u16,
        protocol_minor_version: u16,
    },
    Authenticate {
        reason: String,
    },
}

/// Total response length announced by the 8-byte prefix.
pub fn setup_response_len(prefix: &[u8], order: ByteOrder) -> Result<usize, WireError> {
    let mut r = WireReader::new(prefix, order);
    r.require(SETUP_PREFIX_SIZE)?;
    r.skip(6)?;
    let units = usize::from(r.u16()?);
    Ok(SETUP_PREFIX_SIZE + units * 4)
}

fn lossy_reason(raw: &[u8]) -> String {
    let end = raw.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

impl SetupResponse {
    /// Decode a complete setup response.
    pub fn decode(buf: &[u8], order: ByteOrder) -> Result<Self, WireError> {
        let mut r = WireReader::new(buf, order);
        let status = r.u8()?;
        match status {
            STATUS_FAILED => {
                let reason_len = usize::from(r.u8()?);
                let protocol_major_version = r.u16()?;
                let protocol_minor_version = r.u16()?;
                r.skip(2)?;
                let reason = String::from_utf8_lossy(r.bytes(reason_len)?).into_owned();
                Ok(SetupResponse::Failed {
                    reason,
                    protocol_major_version,
                    protocol_minor_version,
                })
            }
            STATUS_AUTHENTICATE => {
                r.skip(5)?;
                let units = usize::from(r.u16()?);
                let reason = lossy_reason(r.bytes(units * 4)?);
                Ok(SetupResponse::Authenticate { reason })
            }
            STATUS_SUCCESS => Setup::decode_body(&mut r).map(SetupResponse::Success),
            other => Err(WireError::InvalidValue {
                field: "setup status",
                value: u64::from(other),
            }),
        }
    }
}

impl Setup {
    fn decode_body(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.skip(1)?;
        let protocol_major_version = r.u16()?;
        let protocol_minor_version = r.u16()?;
        r.skip(2)?;
        let release_number = r.u32()?;
        let resource_id_base = r.u32()?;
        let resource_id_mask = r.u32()?;
        let motion_buffer_size = r.u32()?;
        let vendor_len = usize::from(r.u16()?);
        let maximum_request_length = r.u16()?;
        let roots_len = usize::from(r.u8()?);
        let formats_len = usize::from(r.u8()?);
        let image_byte_order = r.u8()?;
        let bitmap_format_bit_order = r.u8()?;
        let bitmap_format_scanline_unit = r.u8()?;
        let bitmap_format_scanline_pad = r.u8()?;
        let min_keycode = r.u8()?;
        let max_keycode = r.u8()?;
        r.skip(4)?;
        let vendor = String::from_utf8_lossy(r.bytes(vendor_len)?).into_owned();
        r.align(4)?;

        let mut pixmap_formats = Vec::with_capacity(formats_len);
        for _ in 0..formats_len {
            let depth = r.u8()?;
            let bits_per_pixel = r.u8()?;
            let scanline_pad = r.u8()?;
            r.skip(5)?;
            pixmap_formats.push(Format {
                depth,
                bits_per_pixel,
                scanline_pad,
            });
        }

        let mut roots = Vec::with_capacity(roots_len);
        for _ in 0..roots_len {
            roots.push(Screen::decode(r)?);
        }

        Ok(Setup {
            protocol_major_version,
            protocol_minor_version,
            release_number,
            resource_id_base,
            resource_id_mask,
            motion_buffer_size,
            maximum_request_length,
            image_byte_order,
            bitmap_format_bit_order,
            bitmap_format_scanline_unit,
            bitmap_format_scanline_pad,
            min_keycode,
            max_keycode,
            vendor,
            pixmap_formats,
            roots,
        })
    }

    /// Encode as a complete success response, as a server would send it.
    pub fn encode(&self, order: ByteOrder) -> Result<Bytes, WireError> {
        let too_many = |field: &'static str, n: usize| WireError::InvalidValue {
            field,
            value: n as u64,
        };
        let roots_len =
            u8::try_from(self.roots.len()).map_err(|_| too_many("roots", self.roots.len()))?;
        let formats_len = u8::try_from(self.pixmap_formats.len())
            .map_err(|_| too_many("pixmap formats", self.pixmap_formats.len()))?;
        let vendor_len = u16::try_from(self.vendor.len())
            .map_err(|_| too_many("vendor length", self.vendor.len()))?;

        let mut w = WireWriter::new(order);
        w.u8(STATUS_SUCCESS);
        w.pad(1);
        w.u16(self.protocol_major_version);
        w.u16(self.protocol_minor_version);
        w.u16(0); // patched below
        w.u32(self.release_number);
        w.u32(self.resource_id_base);
        w.u32(self.resource_id_mask);
        w.u32(self.motion_buffer_size);
        w.u16(vendor_len);
        w.u16(self.maximum_request_length);
        w.u8(roots_len);
        w.u8(formats_len);
        w.u8(self.image_byte_order);
        w.u8(self.bitmap_format_bit_order);
        w.u8(self.bitmap_format_scanline_unit);
        w.u8(self.bitmap_format_scanline_pad);
        w.u8(self.min_keycode);
        w.u8(self.max_keycode);
        w.pad(4);
        w.padded_bytes(self.vendor.as_bytes(), 4);

        for format in &self.pixmap_formats {
            w.u8(format.depth);
            w.u8(format.bits_per_pixel);
            w.u8(format.scanline_pad);
            w.pad(5);
        }
        for screen in &self.roots {
            screen.encode(&mut w)?;
        }

        let units = (w.len() - SETUP_PREFIX_SIZE) / 4;
        let units = u16::try_from(units).map_err(|_| too_many("setup length", units))?;
        w.patch_u16(6, units);
        Ok(w.into_bytes())
    }
}

impl Screen {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let root = r.u32()?;
        let default_colormap = r.u32()?;
        let white_pixel = r.u32()?;
        let black_pixel = r.u32()?;
        let current_input_masks = r.u32()?;
        let width_in_pixels = r.u16()?;
        let height_in_pixels = r.u16()?;
        let width_in_millimeters = r.u16()?;
        let height_in_millimeters = r.u16()?;
        let min_installed_maps = r.u16()?;
        let max_installed_maps = r.u16()?;
        let root_visual = r.u32()?;
        let backing_stores = r.u8()?;
        let save_unders = r.bool()?;
        let root_depth = r.u8()?;
        let depths_len = usize::from(r.u8()?);

        let mut allowed_depths = Vec::with_capacity(depths_len);
        for _ in 0..depths_len {
            let depth = r.u8()?;
            r.skip(1)?;
            let visuals_len = usize::from(r.u16()?);
            r.skip(4)?;
            // Each visual takes 24 bytes; refuse counts the buffer cannot hold.
            r.require(visuals_len * 24)?;
            let mut visuals = Vec::with_capacity(visuals_len);
            for _ in 0..visuals_len {
                let visual_id = r.u32()?;
                let class = r.u8()?;
                let bits_per_rgb_value = r.u8()?;
                let colormap_entries = r.u16()?;
                let red_mask = r.u32()?;
                let green_mask = r.u32()?;
                let blue_mask = r.u32()?;
                r.skip(4)?;
                visuals.push(Visual {
                    visual_id,
                    class,
                    bits_per_rgb_value,
                    colormap_entries,
                    red_mask,
                    green_mask,
                    blue_mask,
                });
            }
            allowed_depths.push(Depth { depth, visuals });
        }

        Ok(Screen {
            root,
            default_colormap,
            white_pixel,
            black_pixel,
            current_input_masks,
            width_in_pixels,
            height_in_pixels,
            width_in_millimeters,
            height_in_millimeters,
            min_installed_maps,
            max_installed_maps,
            root_visual,
            backing_stores,
            save_unders,
            root_depth,
            allowed_depths,
        })
    }

    fn encode(&self, w: &mut WireWriter) -> Result<(), WireError> {
        let depths_len =
            u8::try_from(self.allowed_depths.len()).map_err(|_| WireError::InvalidValue {
                field: "allowed depths",
                value: self.allowed_depths.len() as u64,
            })?;
        w.u32(self.root);
        w.u32(self.default_colormap);
        w.u32(self.white_pixel);
        w.u32(self.black_pixel);
        w.u32(self.current_input_masks);
        w.u16(self.width_in_pixels);
        w.u16(self.height_in_pixels);
        w.u16(self.width_in_millimeters);
        w.u16(self.height_in_millimeters);
        w.u16(self.min_installed_maps);
        w.u16(self.max_installed_maps);
        w.u32(self.root_visual);
        w.u8(self.backing_stores);
        w.bool(self.save_unders);
        w.u8(self.root_depth);
        w.u8(depths_len);
        for depth in &self.allowed_depths {
            let visuals_len =
                u16::try_from(depth.visuals.len()).map_err(|_| WireError::InvalidValue {
                    field: "visuals",
                    value: depth.visuals.len() as u64,
                })?;
            w.u8(depth.depth);
            w.pad(1);
            w.u16(visuals_len);
            w.pad(4);
            for visual in &depth.visuals {
                w.u32(visual.visual_id);
                w.u8(visual.class);
                w.u8(visual.bits_per_rgb_value);
                w.u16(visual.colormap_entries);
                w.u32(visual.red_mask);
                w.u32(visual.green_mask);
                w.u32(visual.blue_mask);
                w.pad(4);
            }
        }
        Ok(())
    }
}

/// Encode a refusal, as a server would send it.
pub fn encode_setup_failed(order: ByteOrder, reason: &str) -> Bytes {
    let reason = &reason.as_bytes()[..reason.len().min(usize::from(u8::MAX))];
    let units = (reason.len() + pad_len(reason.len(), 4)) / 4;

    let mut w = WireWriter::new(order);
    w.u8(STATUS_FAILED);
    w.u8(reason.len() as u8);
    w.u16(PROTOCOL_MAJOR_VERSION);
    w.u16(PROTOCOL_MINOR_VERSION);
    w.u16(units as u16);
    w.padded_bytes(reason, 4);
    w.into_bytes()
}
