//! DAMAGE extension, version 1.1.
//!
//! Reports regions of drawables that have been modified. A client creates
//! a damage object on a drawable; the server then sends `DamageNotify`
//! events at the chosen [`ReportLevel`].

use bytes::Bytes;

use crate::connection::Connection;
use crate::cookie::{Cookie, VoidCookie};
use crate::dispatch::{ErrorSpec, EventSpec, Extension, ExtensionInfo};
use crate::error::{Result, WireError};
use crate::event::RawError;
use crate::message::{Decode, DecodeRequest, ReplyHeader, ReplyRequest, Request};
use crate::protocol::{encode_event_frame, ByteOrder, WireReader, WireWriter, FRAME_SIZE};

pub const MAJOR_VERSION: u32 = 1;
pub const MINOR_VERSION: u32 = 1;

/// Event opcode of `DamageNotify`.
pub const NOTIFY_EVENT: u8 = 0;

/// Error opcode of `BadDamage`.
pub const BAD_DAMAGE_ERROR: u8 = 0;

const MORE_FLAG: u8 = 0x80;

/// How much detail the server reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ReportLevel {
    RawRectangles = 0,
    DeltaRectangles = 1,
    BoundingBox = 2,
    NonEmpty = 3,
}

impl TryFrom<u8> for ReportLevel {
    type Error = WireError;

    fn try_from(value: u8) -> std::result::Result<Self, WireError> {
        match value {
            0 => Ok(Self::RawRectangles),
            1 => Ok(Self::DeltaRectangles),
            2 => Ok(Self::BoundingBox),
            3 => Ok(Self::NonEmpty),
            other => Err(WireError::InvalidValue {
                field: "report level",
                value: u64::from(other),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Rectangle {
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
}

impl Rectangle {
    fn read(r: &mut WireReader<'_>) -> std::result::Result<Self, WireError> {
        Ok(Self {
            x: r.i16()?,
            y: r.i16()?,
            width: r.u16()?,
            height: r.u16()?,
        })
    }

    fn write(&self, w: &mut WireWriter) {
        w.i16(self.x);
        w.i16(self.y);
        w.u16(self.width);
        w.u16(self.height);
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryVersion {
    pub client_major_version: u32,
    pub client_minor_version: u32,
}

impl Request for QueryVersion {
    const OPCODE: u8 = 0;
    const NAME: &'static str = "DamageQueryVersion";

    fn encode_body(&self, w: &mut WireWriter) -> std::result::Result<(), WireError> {
        w.u32(self.client_major_version);
        w.u32(self.client_minor_version);
        Ok(())
    }
}

impl DecodeRequest for QueryVersion {
    fn decode_body(r: &mut WireReader<'_>, _data_byte: u8) -> std::result::Result<Self, WireError> {
        Ok(Self {
            client_major_version: r.u32()?,
            client_minor_version: r.u32()?,
        })
    }
}

impl ReplyRequest for QueryVersion {
    type Reply = QueryVersionReply;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QueryVersionReply {
    pub major_version: u32,
    pub minor_version: u32,
}

impl Decode for QueryVersionReply {
    const MIN_LEN: usize = FRAME_SIZE;

    fn decode(r: &mut WireReader<'_>) -> std::result::Result<Self, WireError> {
        ReplyHeader::read(r)?;
        Ok(Self {
            major_version: r.u32()?,
            minor_version: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Create {
    pub damage: u32,
    pub drawable: u32,
    pub level: ReportLevel,
}

impl Request for Create {
    const OPCODE: u8 = 1;
    const NAME: &'static str = "DamageCreate";

    fn encode_body(&self, w: &mut WireWriter) -> std::result::Result<(), WireError> {
        w.u32(self.damage);
        w.u32(self.drawable);
        w.u8(self.level as u8);
        w.pad(3);
        Ok(())
    }
}

impl DecodeRequest for Create {
    fn decode_body(r: &mut WireReader<'_>, _data_byte: u8) -> std::result::Result<Self, WireError> {
        let damage = r.u32()?;
        let drawable = r.u32()?;
        let level = ReportLevel::try_from(r.u8()?)?;
        r.skip(3)?;
        Ok(Self {
            damage,
            drawable,
            level,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destroy {
    pub damage: u32,
}

impl Request for Destroy {
    const OPCODE: u8 = 2;
    const NAME: &'static str = "DamageDestroy";

    fn encode_body(&self, w: &mut WireWriter) -> std::result::Result<(), WireError> {
        w.u32(self.damage);
        Ok(())
    }
}

impl DecodeRequest for Destroy {
    fn decode_body(r: &mut WireReader<'_>, _data_byte: u8) -> std::result::Result<Self, WireError> {
        Ok(Self { damage: r.u32()? })
    }
}

/// Take `repair` out of the damage, storing what was removed in `parts`.
/// A region id of 0 means "none".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subtract {
    pub damage: u32,
    pub repair: u32,
    pub parts: u32,
}

impl Request for Subtract {
    const OPCODE: u8 = 3;
    const NAME: &'static str = "DamageSubtract";

    fn encode_body(&self, w: &mut WireWriter) -> std::result::Result<(), WireError> {
        w.u32(self.damage);
        w.u32(self.repair);
        w.u32(self.parts);
        Ok(())
    }
}

impl DecodeRequest for Subtract {
    fn decode_body(r: &mut WireReader<'_>, _data_byte: u8) -> std::result::Result<Self, WireError> {
        Ok(Self {
            damage: r.u32()?,
            repair: r.u32()?,
            parts: r.u32()?,
        })
    }
}

/// Report `region` of `drawable` as damaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Add {
    pub drawable: u32,
    pub region: u32,
}

impl Request for Add {
    const OPCODE: u8 = 4;
    const NAME: &'static str = "DamageAdd";

    fn encode_body(&self, w: &mut WireWriter) -> std::result::Result<(), WireError> {
        w.u32(self.drawable);
        w.u32(self.region);
        Ok(())
    }
}

impl DecodeRequest for Add {
    fn decode_body(r: &mut WireReader<'_>, _data_byte: u8) -> std::result::Result<Self, WireError> {
        Ok(Self {
            drawable: r.u32()?,
            region: r.u32()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Events and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NotifyEvent {
    pub level: ReportLevel,
    /// More events for the same damage follow.
    pub more: bool,
    pub sequence: u16,
    pub drawable: u32,
    pub damage: u32,
    pub timestamp: u32,
    pub area: Rectangle,
    pub geometry: Rectangle,
}

impl Decode for NotifyEvent {
    const MIN_LEN: usize = FRAME_SIZE;

    fn decode(r: &mut WireReader<'_>) -> std::result::Result<Self, WireError> {
        r.skip(1)?;
        let level = r.u8()?;
        let sequence = r.u16()?;
        Ok(Self {
            level: ReportLevel::try_from(level & !MORE_FLAG)?,
            more: level & MORE_FLAG != 0,
            sequence,
            drawable: r.u32()?,
            damage: r.u32()?,
            timestamp: r.u32()?,
            area: Rectangle::read(r)?,
            geometry: Rectangle::read(r)?,
        })
    }
}

impl NotifyEvent {
    /// Encode as the server would, given the extension's first event code.
    pub fn encode(&self, order: ByteOrder, first_event: u8) -> std::result::Result<Bytes, WireError> {
        let mut w = WireWriter::with_capacity(order, 28);
        w.u32(self.drawable);
        w.u32(self.damage);
        w.u32(self.timestamp);
        self.area.write(&mut w);
        self.geometry.write(&mut w);

        let detail = self.level as u8 | if self.more { MORE_FLAG } else { 0 };
        encode_event_frame(
            order,
            first_event.wrapping_add(NOTIFY_EVENT),
            detail,
            self.sequence,
            w.as_slice(),
        )
    }
}

/// A damage id that does not name a damage object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadDamageError {
    pub damage: u32,
    pub minor_opcode: u16,
    pub major_opcode: u8,
}

impl Decode for BadDamageError {
    const MIN_LEN: usize = FRAME_SIZE;

    fn decode(r: &mut WireReader<'_>) -> std::result::Result<Self, WireError> {
        let raw = RawError::decode(r)?;
        Ok(Self {
            damage: raw.bad_value,
            minor_opcode: raw.minor_opcode,
            major_opcode: raw.major_opcode,
        })
    }
}

// ---------------------------------------------------------------------------
// Façade
// ---------------------------------------------------------------------------

/// DAMAGE requests on one connection.
#[derive(Clone)]
pub struct Damage {
    connection: Connection,
    info: ExtensionInfo,
}

impl Extension for Damage {
    const NAME: &'static str = "DAMAGE";
    const EVENTS: &'static [EventSpec] =
        &[EventSpec::new::<NotifyEvent>(NOTIFY_EVENT as u16, "DamageNotify")];
    const ERRORS: &'static [ErrorSpec] =
        &[ErrorSpec::new::<BadDamageError>(BAD_DAMAGE_ERROR, "BadDamage")];
}

impl Damage {
    /// # Errors
    ///
    /// [`XwireError::ExtensionNotRegistered`](crate::XwireError::ExtensionNotRegistered)
    /// unless the connection was built with this extension and the server
    /// has it.
    pub fn new(connection: &Connection) -> Result<Self> {
        let info = connection.extension::<Self>()?;
        Ok(Self {
            connection: connection.clone(),
            info,
        })
    }

    pub fn info(&self) -> &ExtensionInfo {
        &self.info
    }

    /// Negotiate the version. Servers ignore other DAMAGE requests from
    /// clients that never sent this.
    pub async fn query_version(
        &self,
        client_major_version: u32,
        client_minor_version: u32,
    ) -> Result<Cookie<QueryVersionReply>> {
        let request = QueryVersion {
            client_major_version,
            client_minor_version,
        };
        self.connection
            .send_with_reply(Some(&self.info), &request)
            .await
    }

    pub async fn create(
        &self,
        damage: u32,
        drawable: u32,
        level: ReportLevel,
    ) -> Result<VoidCookie> {
        let request = Create {
            damage,
            drawable,
            level,
        };
        self.connection.send_checked(Some(&self.info), &request).await
    }

    /// Like [`create`](Self::create); errors go to the error stream.
    pub async fn create_unchecked(
        &self,
        damage: u32,
        drawable: u32,
        level: ReportLevel,
    ) -> Result<u64> {
        let request = Create {
            damage,
            drawable,
            level,
        };
        self.connection
            .send_unchecked(Some(&self.info), &request)
            .await
    }

    pub async fn destroy(&self, damage: u32) -> Result<VoidCookie> {
        self.connection
            .send_checked(Some(&self.info), &Destroy { damage })
            .await
    }

    pub async fn destroy_unchecked(&self, damage: u32) -> Result<u64> {
        self.connection
            .send_unchecked(Some(&self.info), &Destroy { damage })
            .await
    }

    pub async fn subtract(&self, damage: u32, repair: u32, parts: u32) -> Result<VoidCookie> {
        let request = Subtract {
            damage,
            repair,
            parts,
        };
        self.connection.send_checked(Some(&self.info), &request).await
    }

    /// Like [`subtract`](Self::subtract); an error arrives through
    /// [`Connection::wait_for_error`].
    pub async fn subtract_unchecked(&self, damage: u32, repair: u32, parts: u32) -> Result<u64> {
        let request = Subtract {
            damage,
            repair,
            parts,
        };
        self.connection
            .send_unchecked(Some(&self.info), &request)
            .await
    }

    pub async fn add(&self, drawable: u32, region: u32) -> Result<VoidCookie> {
        self.connection
            .send_checked(Some(&self.info), &Add { drawable, region })
            .await
    }
}
