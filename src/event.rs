//! Values delivered to the application: decoded events and protocol errors.

use std::any::Any;
use std::fmt;

use crate::error::WireError;
use crate::protocol::{RawFrame, WireReader};

/// A decoded event or error detail, type-erased for delivery.
///
/// Every `'static` type that is `Debug + Send + Sync` qualifies; callers get
/// the concrete value back through [`ExtensionEvent::downcast_ref`].
pub trait DecodedMessage: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + fmt::Debug + Send + Sync> DecodedMessage for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An event as the application receives it.
#[derive(Debug)]
pub enum Event {
    /// Decoded by a registered extension.
    Extension(ExtensionEvent),
    /// No registered decoder for this code.
    Unknown(RawEvent),
    /// A decoder is registered but rejected the bytes.
    Malformed { raw: RawEvent, error: WireError },
}

impl Event {
    /// The undecoded frame behind this event.
    pub fn raw(&self) -> &RawEvent {
        match self {
            Event::Extension(event) => &event.raw,
            Event::Unknown(raw) | Event::Malformed { raw, .. } => raw,
        }
    }

    /// Downcast an extension event to its concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Event::Extension(event) => event.downcast_ref(),
            _ => None,
        }
    }
}

/// An event decoded by an extension's table entry.
#[derive(Debug)]
pub struct ExtensionEvent {
    pub extension: &'static str,
    pub name: &'static str,
    pub raw: RawEvent,
    decoded: Box<dyn DecodedMessage>,
}

impl ExtensionEvent {
    pub fn new(
        extension: &'static str,
        name: &'static str,
        raw: RawEvent,
        decoded: Box<dyn DecodedMessage>,
    ) -> Self {
        Self {
            extension,
            name,
            raw,
            decoded,
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.decoded).as_any().downcast_ref()
    }

    pub fn decoded(&self) -> &dyn DecodedMessage {
        self.decoded.as_ref()
    }
}

/// An undecoded event frame.
#[derive(Debug, Clone)]
pub struct RawEvent {
    frame: RawFrame,
}

impl RawEvent {
    pub fn new(frame: RawFrame) -> Self {
        Self { frame }
    }

    /// Event code with the `SendEvent` bit masked off.
    pub fn code(&self) -> u8 {
        self.frame.event_code()
    }

    pub fn is_send_event(&self) -> bool {
        self.frame.is_send_event()
    }

    /// For generic events, the owning extension's major opcode and the
    /// 16-bit event type.
    pub fn generic(&self) -> Option<(u8, u16)> {
        self.frame
            .kind()
            .is_variable()
            .then(|| (self.frame.generic_extension(), self.frame.generic_event_type()))
    }

    pub fn sequence(&self) -> u16 {
        self.frame.sequence()
    }

    pub fn bytes(&self) -> &[u8] {
        self.frame.bytes()
    }

    pub fn frame(&self) -> &RawFrame {
        &self.frame
    }
}

/// The fixed part of every error frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawError {
    pub code: u8,
    pub sequence: u16,
    pub bad_value: u32,
    pub minor_opcode: u16,
    pub major_opcode: u8,
}

impl RawError {
    pub fn decode(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        r.require(crate::protocol::FRAME_SIZE)?;
        let first = r.u8()?;
        if first != crate::protocol::ERROR_CODE {
            return Err(WireError::InvalidValue {
                field: "error code",
                value: u64::from(first),
            });
        }
        let code = r.u8()?;
        let sequence = r.u16()?;
        let bad_value = r.u32()?;
        let minor_opcode = r.u16()?;
        let major_opcode = r.u8()?;
        Ok(Self {
            code,
            sequence,
            bad_value,
            minor_opcode,
            major_opcode,
        })
    }
}

/// An error frame the server sent for one of our requests.
#[derive(Debug)]
pub struct ProtocolError {
    /// Owning extension, or `None` for core errors and unknown codes.
    pub extension: Option<&'static str>,
    /// Error name, `"Unknown"` when no table claims the code.
    pub name: &'static str,
    pub code: u8,
    /// Full sequence of the failed request.
    pub sequence: u64,
    pub bad_value: u32,
    pub minor_opcode: u16,
    pub major_opcode: u8,
    /// Extension-specific decoding of the frame, when one is registered.
    pub detail: Option<Box<dyn DecodedMessage>>,
}

impl ProtocolError {
    pub fn from_raw(raw: RawError, sequence: u64) -> Self {
        Self {
            extension: None,
            name: "Unknown",
            code: raw.code,
            sequence,
            bad_value: raw.bad_value,
            minor_opcode: raw.minor_opcode,
            major_opcode: raw.major_opcode,
            detail: None,
        }
    }

    pub fn detail_ref<T: Any>(&self) -> Option<&T> {
        let detail: &dyn DecodedMessage = self.detail.as_deref()?;
        detail.as_any().downcast_ref()
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.extension {
            Some(extension) => write!(f, "{}::{}", extension, self.name)?,
            None => write!(f, "{}", self.name)?,
        }
        write!(
            f,
            " (code {}) for request {}.{} with sequence {}, bad value {:#x}",
            self.code, self.major_opcode, self.minor_opcode, self.sequence, self.bad_value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_error_frame, encode_event_frame, ByteOrder};

    #[derive(Debug, PartialEq)]
    struct Ping(u32);

    fn raw_event(code: u8) -> RawEvent {
        let bytes = encode_event_frame(ByteOrder::Little, code, 0, 3, &[]).unwrap();
        RawEvent::new(RawFrame::new(bytes, ByteOrder::Little).unwrap())
    }

    #[test]
    fn test_downcast_extension_event() {
        let event = Event::Extension(ExtensionEvent::new(
            "TEST",
            "Ping",
            raw_event(70),
            Box::new(Ping(9)),
        ));

        assert_eq!(event.downcast_ref::<Ping>(), Some(&Ping(9)));
        assert_eq!(event.downcast_ref::<u32>(), None);
        assert_eq!(event.raw().code(), 70);
    }

    #[test]
    fn test_send_event_flag_is_masked() {
        let raw = raw_event(70 | 0x80);
        assert_eq!(raw.code(), 70);
        assert!(raw.is_send_event());
        assert_eq!(raw.generic(), None);
    }

    #[test]
    fn test_raw_error_decode() {
        let bytes = encode_error_frame(ByteOrder::Big, 152, 7, 0xdead, 2, 143);
        let mut r = WireReader::new(&bytes, ByteOrder::Big);
        let raw = RawError::decode(&mut r).unwrap();
        assert_eq!(
            raw,
            RawError {
                code: 152,
                sequence: 7,
                bad_value: 0xdead,
                minor_opcode: 2,
                major_opcode: 143,
            }
        );

        let mut r = WireReader::new(&bytes[..20], ByteOrder::Big);
        assert!(matches!(
            RawError::decode(&mut r),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_protocol_error_display() {
        let raw = RawError {
            code: 152,
            sequence: 7,
            bad_value: 0x2a,
            minor_opcode: 2,
            major_opcode: 143,
        };
        let mut err = ProtocolError::from_raw(raw, 65543);
        assert_eq!(
            err.to_string(),
            "Unknown (code 152) for request 143.2 with sequence 65543, bad value 0x2a"
        );

        err.extension = Some("DAMAGE");
        err.name = "BadDamage";
        assert!(err.to_string().starts_with("DAMAGE::BadDamage (code 152)"));
    }
}
