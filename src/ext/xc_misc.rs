//! XC-MISC extension, version 1.1.
//!
//! Lets a client that has used up its resource id range ask the server for
//! ids nobody holds any more. The connection uses [`GetXIDRange`] for this
//! on its own; the façade exposes the rest.

use crate::connection::Connection;
use crate::cookie::Cookie;
use crate::dispatch::{ErrorSpec, EventSpec, Extension, ExtensionInfo};
use crate::error::{Result, WireError};
use crate::message::{Decode, DecodeRequest, ReplyHeader, ReplyRequest, Request};
use crate::protocol::{WireReader, WireWriter, FRAME_SIZE};

pub const MAJOR_VERSION: u16 = 1;
pub const MINOR_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetVersion {
    pub client_major_version: u16,
    pub client_minor_version: u16,
}

impl Request for GetVersion {
    const OPCODE: u8 = 0;
    const NAME: &'static str = "XCMiscGetVersion";

    fn encode_body(&self, w: &mut WireWriter) -> std::result::Result<(), WireError> {
        w.u16(self.client_major_version);
        w.u16(self.client_minor_version);
        Ok(())
    }
}

impl DecodeRequest for GetVersion {
    fn decode_body(r: &mut WireReader<'_>, _data_byte: u8) -> std::result::Result<Self, WireError> {
        Ok(Self {
            client_major_version: r.u16()?,
            client_minor_version: r.u16()?,
        })
    }
}

impl ReplyRequest for GetVersion {
    type Reply = GetVersionReply;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GetVersionReply {
    pub server_major_version: u16,
    pub server_minor_version: u16,
}

impl Decode for GetVersionReply {
    const MIN_LEN: usize = FRAME_SIZE;

    fn decode(r: &mut WireReader<'_>) -> std::result::Result<Self, WireError> {
        ReplyHeader::read(r)?;
        Ok(Self {
            server_major_version: r.u16()?,
            server_minor_version: r.u16()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetXIDRange;

impl Request for GetXIDRange {
    const OPCODE: u8 = 1;
    const NAME: &'static str = "XCMiscGetXIDRange";

    fn encode_body(&self, _w: &mut WireWriter) -> std::result::Result<(), WireError> {
        Ok(())
    }
}

impl DecodeRequest for GetXIDRange {
    fn decode_body(_r: &mut WireReader<'_>, _data_byte: u8) -> std::result::Result<Self, WireError> {
        Ok(Self)
    }
}

impl ReplyRequest for GetXIDRange {
    type Reply = GetXIDRangeReply;
}

/// A run of `count` consecutive free ids starting at `start_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GetXIDRangeReply {
    pub start_id: u32,
    pub count: u32,
}

impl Decode for GetXIDRangeReply {
    const MIN_LEN: usize = FRAME_SIZE;

    fn decode(r: &mut WireReader<'_>) -> std::result::Result<Self, WireError> {
        ReplyHeader::read(r)?;
        Ok(Self {
            start_id: r.u32()?,
            count: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetXIDList {
    pub count: u32,
}

impl Request for GetXIDList {
    const OPCODE: u8 = 2;
    const NAME: &'static str = "XCMiscGetXIDList";

    fn encode_body(&self, w: &mut WireWriter) -> std::result::Result<(), WireError> {
        w.u32(self.count);
        Ok(())
    }
}

impl DecodeRequest for GetXIDList {
    fn decode_body(r: &mut WireReader<'_>, _data_byte: u8) -> std::result::Result<Self, WireError> {
        Ok(Self { count: r.u32()? })
    }
}

impl ReplyRequest for GetXIDList {
    type Reply = GetXIDListReply;
}

/// Free ids, not necessarily consecutive. May hold fewer than asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GetXIDListReply {
    pub ids: Vec<u32>,
}

impl Decode for GetXIDListReply {
    const MIN_LEN: usize = FRAME_SIZE;

    fn decode(r: &mut WireReader<'_>) -> std::result::Result<Self, WireError> {
        ReplyHeader::read(r)?;
        let ids_len = r.u32()? as usize;
        r.skip(20)?;
        Ok(Self {
            ids: r.u32_list(ids_len)?,
        })
    }
}

/// XC-MISC requests on one connection.
#[derive(Clone)]
pub struct XcMisc {
    connection: Connection,
    info: ExtensionInfo,
}

impl Extension for XcMisc {
    const NAME: &'static str = "XC-MISC";
    const EVENTS: &'static [EventSpec] = &[];
    const ERRORS: &'static [ErrorSpec] = &[];
}

impl XcMisc {
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

    pub async fn get_version(
        &self,
        client_major_version: u16,
        client_minor_version: u16,
    ) -> Result<Cookie<GetVersionReply>> {
        let request = GetVersion {
            client_major_version,
            client_minor_version,
        };
        self.connection
            .send_with_reply(Some(&self.info), &request)
            .await
    }

    pub async fn get_xid_range(&self) -> Result<Cookie<GetXIDRangeReply>> {
        self.connection
            .send_with_reply(Some(&self.info), &GetXIDRange)
            .await
    }

    pub async fn get_xid_list(&self, count: u32) -> Result<Cookie<GetXIDListReply>> {
        self.connection
            .send_with_reply(Some(&self.info), &GetXIDList { count })
            .await
    }
}
