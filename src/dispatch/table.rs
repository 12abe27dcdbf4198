//! Extension declarations and the merged dispatch table.
//!
//! Each extension declares its events and errors as static lists keyed by
//! extension-relative opcode. Once the server has assigned the extension its
//! code bases, [`DispatchTableBuilder::register`] rebases those lists into
//! wire codes and merges them with every other extension's.
//!
//! # Example
//!
//! ```
//! use xwire::dispatch::{DispatchTableBuilder, ExtensionInfo};
//! use xwire::ext::damage::Damage;
//!
//! let info = ExtensionInfo {
//!     name: "DAMAGE",
//!     major_opcode: 143,
//!     first_event: 91,
//!     first_error: 152,
//! };
//!
//! let mut builder = DispatchTableBuilder::new();
//! builder.register_extension::<Damage>(info).unwrap();
//! let table = builder.build();
//!
//! assert_eq!(table.event(91).map(|entry| entry.name), Some("DamageNotify"));
//! assert_eq!(table.error(152).map(|entry| entry.name), Some("BadDamage"));
//! ```

use std::collections::HashMap;
use std::fmt;

use crate::error::{Result, WireError, XwireError};
use crate::event::DecodedMessage;
use crate::message::{decode_frame, Decode};
use crate::protocol::ByteOrder;

/// Decoder stored in the tables: whole frame in, type-erased value out.
pub type MessageDecoder = fn(&[u8], ByteOrder) -> std::result::Result<Box<dyn DecodedMessage>, WireError>;

/// Highest code a core event frame can carry; bit 7 is the `SendEvent` flag.
const MAX_EVENT_CODE: u16 = 0x7f;

fn decode_boxed<T: Decode + DecodedMessage>(
    bytes: &[u8],
    order: ByteOrder,
) -> std::result::Result<Box<dyn DecodedMessage>, WireError> {
    decode_frame::<T>(bytes, order).map(|value| Box::new(value) as Box<dyn DecodedMessage>)
}

/// One event an extension can send.
///
/// For regular events `opcode` is added to the extension's first event
/// code; for generic events it is the 16-bit event type.
#[derive(Clone, Copy)]
pub struct EventSpec {
    pub opcode: u16,
    pub name: &'static str,
    pub decode: MessageDecoder,
}

impl EventSpec {
    pub const fn new<T: Decode + DecodedMessage>(opcode: u16, name: &'static str) -> Self {
        Self {
            opcode,
            name,
            decode: decode_boxed::<T>,
        }
    }
}

impl fmt::Debug for EventSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSpec")
            .field("opcode", &self.opcode)
            .field("name", &self.name)
            .finish()
    }
}

/// One error an extension can send; `opcode` is added to its first error code.
#[derive(Clone, Copy)]
pub struct ErrorSpec {
    pub opcode: u8,
    pub name: &'static str,
    pub decode: MessageDecoder,
}

impl ErrorSpec {
    pub const fn new<T: Decode + DecodedMessage>(opcode: u8, name: &'static str) -> Self {
        Self {
            opcode,
            name,
            decode: decode_boxed::<T>,
        }
    }
}

impl fmt::Debug for ErrorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorSpec")
            .field("opcode", &self.opcode)
            .field("name", &self.name)
            .finish()
    }
}

/// Static description of a protocol extension.
pub trait Extension {
    /// Name the server knows the extension by.
    const NAME: &'static str;
    const EVENTS: &'static [EventSpec];
    const ERRORS: &'static [ErrorSpec];
    const GENERIC_EVENTS: &'static [EventSpec] = &[];
}

/// What the server told us about an extension on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ExtensionInfo {
    pub name: &'static str,
    pub major_opcode: u8,
    pub first_event: u8,
    pub first_error: u8,
}

/// Non-generic view of an [`Extension`] implementation.
#[derive(Debug, Clone, Copy)]
pub struct ExtensionTables {
    pub name: &'static str,
    pub events: &'static [EventSpec],
    pub errors: &'static [ErrorSpec],
    pub generic_events: &'static [EventSpec],
}

impl ExtensionTables {
    pub fn of<E: Extension>() -> Self {
        Self {
            name: E::NAME,
            events: E::EVENTS,
            errors: E::ERRORS,
            generic_events: E::GENERIC_EVENTS,
        }
    }
}

/// A table entry after rebasing.
#[derive(Clone, Copy)]
pub struct Entry {
    pub extension: &'static str,
    pub name: &'static str,
    pub decode: MessageDecoder,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("extension", &self.extension)
            .field("name", &self.name)
            .finish()
    }
}

/// Accumulates extensions before the table is frozen.
#[derive(Debug, Default)]
pub struct DispatchTableBuilder {
    extensions: HashMap<&'static str, ExtensionInfo>,
    events: HashMap<u8, Entry>,
    errors: HashMap<u8, Entry>,
    generic_events: HashMap<(u8, u16), Entry>,
}

impl DispatchTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_extension<E: Extension>(&mut self, info: ExtensionInfo) -> Result<()> {
        self.register(info, ExtensionTables::of::<E>())
    }

    /// Merge one extension's tables.
    ///
    /// Registration is all-or-nothing: on error the builder is unchanged.
    /// Registering the same extension again with the same info is a no-op.
    ///
    /// # Errors
    ///
    /// [`XwireError::DispatchConflict`] if a wire code is already claimed by
    /// another extension, or the same name was registered with other codes.
    pub fn register(&mut self, info: ExtensionInfo, tables: ExtensionTables) -> Result<()> {
        if let Some(existing) = self.extensions.get(info.name) {
            if *existing == info {
                return Ok(());
            }
            return Err(XwireError::DispatchConflict {
                kind: "extension",
                code: u16::from(info.major_opcode),
                existing: existing.name,
                incoming: info.name,
            });
        }

        let mut events = Vec::with_capacity(tables.events.len());
        for spec in tables.events {
            let code = u16::from(info.first_event).saturating_add(spec.opcode);
            if code > MAX_EVENT_CODE {
                return Err(WireError::InvalidValue {
                    field: "event code",
                    value: u64::from(code),
                }
                .into());
            }
            let code = code as u8;
            check_free(&self.events, &code, "event", u16::from(code), info.name)?;
            events.push((code, entry(&info, spec.name, spec.decode)));
        }

        let mut errors = Vec::with_capacity(tables.errors.len());
        for spec in tables.errors {
            let code = info
                .first_error
                .checked_add(spec.opcode)
                .ok_or(WireError::InvalidValue {
                    field: "error code",
                    value: u64::from(info.first_error) + u64::from(spec.opcode),
                })?;
            check_free(&self.errors, &code, "error", u16::from(code), info.name)?;
            errors.push((code, entry(&info, spec.name, spec.decode)));
        }

        let mut generic_events = Vec::with_capacity(tables.generic_events.len());
        for spec in tables.generic_events {
            let key = (info.major_opcode, spec.opcode);
            check_free(&self.generic_events, &key, "generic event", spec.opcode, info.name)?;
            generic_events.push((key, entry(&info, spec.name, spec.decode)));
        }

        tracing::debug!(
            extension = info.name,
            major_opcode = info.major_opcode,
            first_event = info.first_event,
            first_error = info.first_error,
            "registered extension"
        );

        self.extensions.insert(info.name, info);
        self.events.extend(events);
        self.errors.extend(errors);
        self.generic_events.extend(generic_events);
        Ok(())
    }

    pub fn build(self) -> DispatchTable {
        DispatchTable {
            extensions: self.extensions,
            events: self.events,
            errors: self.errors,
            generic_events: self.generic_events,
        }
    }
}

fn entry(info: &ExtensionInfo, name: &'static str, decode: MessageDecoder) -> Entry {
    Entry {
        extension: info.name,
        name,
        decode,
    }
}

fn check_free<K: std::hash::Hash + Eq>(
    map: &HashMap<K, Entry>,
    key: &K,
    kind: &'static str,
    code: u16,
    incoming: &'static str,
) -> Result<()> {
    match map.get(key) {
        Some(existing) => Err(XwireError::DispatchConflict {
            kind,
            code,
            existing: existing.extension,
            incoming,
        }),
        None => Ok(()),
    }
}

/// Frozen routing tables, read by the read loop without locking.
#[derive(Debug, Default)]
pub struct DispatchTable {
    extensions: HashMap<&'static str, ExtensionInfo>,
    events: HashMap<u8, Entry>,
    errors: HashMap<u8, Entry>,
    generic_events: HashMap<(u8, u16), Entry>,
}

impl DispatchTable {
    pub fn extension(&self, name: &str) -> Option<&ExtensionInfo> {
        self.extensions.get(name)
    }

    pub fn extensions(&self) -> impl Iterator<Item = &ExtensionInfo> {
        self.extensions.values()
    }

    /// Entry for an event code, `SendEvent` bit already masked.
    pub fn event(&self, code: u8) -> Option<&Entry> {
        self.events.get(&code)
    }

    pub fn error(&self, code: u8) -> Option<&Entry> {
        self.errors.get(&code)
    }

    pub fn generic_event(&self, major_opcode: u8, event_type: u16) -> Option<&Entry> {
        self.generic_events.get(&(major_opcode, event_type))
    }
}
