//! Error types for xwire.

use thiserror::Error;

use crate::event::ProtocolError;
use crate::protocol::Width;

/// Errors raised by the codec primitives and message builders.
///
/// These are local to whoever encodes or decodes and never poison the
/// connection on their own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// A value does not fit the declared field width.
    #[error("value {value} does not fit in a {width} field")]
    ValueOutOfRange { value: u64, width: Width },

    /// Fewer bytes remain than the format requires.
    #[error("truncated buffer: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    /// A field holds a value the format does not allow.
    #[error("invalid value {value} for field `{field}`")]
    InvalidValue { field: &'static str, value: u64 },

    /// An encoded request exceeds what the server accepts.
    #[error("request of {length} units exceeds the maximum of {max}")]
    RequestTooLarge { length: usize, max: usize },
}

/// Main error type for all xwire operations.
#[derive(Debug, Error)]
pub enum XwireError {
    /// I/O error on the underlying socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding or decoding failed.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The server answered a request with an error frame.
    #[error("protocol error: {0}")]
    Protocol(ProtocolError),

    /// The server refused the connection setup.
    #[error("connection setup failed: {reason}")]
    SetupFailed { reason: String },

    /// The server wants further authentication, which is not supported.
    #[error("connection setup requires authentication: {reason}")]
    SetupAuthenticate { reason: String },

    /// The server does not implement a required extension.
    #[error("extension {0} is not present on the server")]
    ExtensionNotPresent(String),

    /// A façade was requested for an extension that was never registered.
    #[error("extension {0} was not registered on this connection")]
    ExtensionNotRegistered(&'static str),

    /// Two extensions claim the same event or error code.
    #[error("dispatch conflict: {kind} code {code} claimed by {existing} and {incoming}")]
    DispatchConflict {
        kind: &'static str,
        code: u16,
        existing: &'static str,
        incoming: &'static str,
    },

    /// The display name could not be parsed.
    #[error("invalid display name: {0}")]
    InvalidDisplay(String),

    /// A reply did not arrive within the requested time.
    #[error("timed out waiting for reply")]
    Timeout,

    /// Connection closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("backpressure timeout")]
    BackpressureTimeout,

    /// Too many requests were sent since the oldest pending cookie for the
    /// 16-bit wire sequence to stay unambiguous.
    #[error("sequence window exhausted: cookie {oldest} is still pending at {next}")]
    SequenceWindowExhausted { oldest: u64, next: u64 },

    /// A sequence number was issued while a cookie for it is still pending.
    #[error("sequence number {0} reused while still pending")]
    SequenceReuse(u64),

    /// A reply slot was completed twice.
    #[error("reply slot for sequence {sequence} resolved twice")]
    DoubleResolution { sequence: u64 },

    /// No resource ids are left and XC-MISC could not provide more.
    #[error("resource ids exhausted")]
    IdsExhausted,

    /// The incoming byte stream cannot be framed any more.
    #[error("framing error: {0}")]
    Framing(String),
}

impl From<ProtocolError> for XwireError {
    fn from(err: ProtocolError) -> Self {
        XwireError::Protocol(err)
    }
}

/// Result type alias using XwireError.
pub type Result<T> = std::result::Result<T, XwireError>;

impl XwireError {
    /// Whether this error means the connection can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            XwireError::Io(_)
                | XwireError::ConnectionClosed
                | XwireError::DoubleResolution { .. }
                | XwireError::Framing(_)
        )
    }
}
