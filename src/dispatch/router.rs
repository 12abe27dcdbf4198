//! Routes each incoming frame to a cookie, the event stream or the error
//! stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use super::pending::PendingReplies;
use super::table::{DispatchTable, Entry};
use crate::cookie::widen;
use crate::error::{Result, XwireError};
use crate::event::{Event, ExtensionEvent, ProtocolError, RawError, RawEvent};
use crate::protocol::xproto::core_error_name;
use crate::protocol::{ByteOrder, FrameKind, RawFrame, WireReader};

/// Requests that may be in flight at once. Beyond this the 16-bit wire
/// sequence no longer identifies a request.
pub const SEQUENCE_WINDOW: u64 = 1 << 16;

/// Core event whose bytes 2..4 are key bits rather than a sequence number.
const KEYMAP_NOTIFY: u8 = 11;

/// Receives what the dispatcher could not hand to a cookie.
pub trait Deliver: Send + Sync {
    fn deliver_event(&self, event: Event);

    /// An error for an unchecked request, or for no request we know of.
    fn deliver_error(&self, error: ProtocolError);
}

/// State shared between the send path and the read loop.
#[derive(Default)]
pub(crate) struct RoutingState {
    /// Set once, after every extension has been queried.
    pub tables: OnceLock<DispatchTable>,
    pub pending: PendingReplies,
    /// Full sequence of the last request handed to the writer.
    pub last_sent: AtomicU64,
    /// Newest request the server has been seen to process.
    pub last_answered: AtomicU64,
}

impl RoutingState {
    pub fn tables(&self) -> Option<&DispatchTable> {
        self.tables.get()
    }

    pub fn last_sent(&self) -> u64 {
        self.last_sent.load(Ordering::Acquire)
    }

    pub fn last_answered(&self) -> u64 {
        self.last_answered.load(Ordering::Acquire)
    }

    fn note_answered(&self, sequence: u64) {
        self.last_answered.fetch_max(sequence, Ordering::AcqRel);
    }

    /// Refuse `next` if some request the server has not answered yet shares
    /// its low 16 bits.
    pub fn check_window(&self, next: u64) -> Result<()> {
        let unanswered = self.last_answered() + 1;
        let oldest = self
            .pending
            .oldest()
            .map_or(unanswered, |pending| pending.min(unanswered));
        if next.saturating_sub(oldest) >= SEQUENCE_WINDOW {
            return Err(XwireError::SequenceWindowExhausted { oldest, next });
        }
        Ok(())
    }
}

/// Frame router owned by the read loop.
pub(crate) struct Dispatcher<'a, D> {
    order: ByteOrder,
    state: &'a RoutingState,
    sink: &'a D,
}

impl<'a, D: Deliver> Dispatcher<'a, D> {
    pub fn new(order: ByteOrder, state: &'a RoutingState, sink: &'a D) -> Self {
        Self { order, state, sink }
    }

    /// Route one complete frame.
    ///
    /// Decode failures are absorbed here. Only errors that leave the
    /// connection in an unknown state are returned.
    pub fn dispatch(&self, frame: RawFrame) -> Result<()> {
        match frame.kind() {
            FrameKind::Reply => self.dispatch_reply(frame),
            FrameKind::Error => self.dispatch_error(frame),
            FrameKind::Event | FrameKind::GenericEvent => self.dispatch_event(frame),
        }
    }

    fn widen(&self, wire: u16) -> Option<u64> {
        widen(wire, self.state.last_sent())
    }

    /// Everything before `sequence` has been processed by the server.
    fn retire_before(&self, sequence: u64) -> Result<()> {
        self.state.note_answered(sequence);
        for mut slot in self.state.pending.retire_before(sequence) {
            slot.retire()?;
        }
        Ok(())
    }

    fn dispatch_reply(&self, frame: RawFrame) -> Result<()> {
        let Some(sequence) = self.widen(frame.sequence()) else {
            tracing::warn!(
                wire_sequence = frame.sequence(),
                "discarding reply for a request never sent"
            );
            return Ok(());
        };
        self.retire_before(sequence)?;

        match self.state.pending.take(sequence) {
            Some(mut slot) => {
                tracing::trace!(sequence, len = frame.len(), "reply");
                slot.resolve(&frame)
            }
            None => {
                tracing::warn!(sequence, "discarding unmatched reply");
                Ok(())
            }
        }
    }

    fn dispatch_error(&self, frame: RawFrame) -> Result<()> {
        let raw = match RawError::decode(&mut WireReader::new(frame.bytes(), self.order)) {
            Ok(raw) => raw,
            Err(error) => {
                tracing::warn!(%error, "discarding malformed error frame");
                return Ok(());
            }
        };

        let sequence = self.widen(raw.sequence);
        let error = self.describe(raw, sequence.unwrap_or(u64::from(raw.sequence)), &frame);

        if let Some(sequence) = sequence {
            self.retire_before(sequence)?;
            if let Some(mut slot) = self.state.pending.take(sequence) {
                tracing::debug!(sequence, %error, "request failed");
                return slot.fail(XwireError::Protocol(error));
            }
        }

        tracing::debug!(%error, "delivering error out of band");
        self.sink.deliver_error(error);
        Ok(())
    }

    fn describe(&self, raw: RawError, sequence: u64, frame: &RawFrame) -> ProtocolError {
        let mut error = ProtocolError::from_raw(raw, sequence);

        if let Some(name) = core_error_name(raw.code) {
            error.name = name;
        } else if let Some(entry) = self.state.tables().and_then(|t| t.error(raw.code)) {
            error.extension = Some(entry.extension);
            error.name = entry.name;
            match (entry.decode)(frame.bytes(), self.order) {
                Ok(detail) => error.detail = Some(detail),
                Err(decode_error) => tracing::warn!(
                    extension = entry.extension,
                    name = entry.name,
                    error = %decode_error,
                    "error detail failed to decode"
                ),
            }
        }
        error
    }

    fn dispatch_event(&self, frame: RawFrame) -> Result<()> {
        if frame.event_code() != KEYMAP_NOTIFY {
            if let Some(sequence) = self.widen(frame.sequence()) {
                self.retire_before(sequence)?;
            }
        }

        let raw = RawEvent::new(frame);
        let event = match self.lookup(&raw) {
            None => {
                tracing::trace!(code = raw.code(), "no decoder for event");
                Event::Unknown(raw)
            }
            Some(entry) => match (entry.decode)(raw.bytes(), self.order) {
                Ok(decoded) => {
                    Event::Extension(ExtensionEvent::new(entry.extension, entry.name, raw, decoded))
                }
                Err(error) => {
                    tracing::warn!(
                        extension = entry.extension,
                        name = entry.name,
                        %error,
                        "event failed to decode"
                    );
                    Event::Malformed { raw, error }
                }
            },
        };

        self.sink.deliver_event(event);
        Ok(())
    }

    fn lookup(&self, raw: &RawEvent) -> Option<Entry> {
        let tables = self.state.tables()?;
        match raw.generic() {
            Some((major_opcode, event_type)) => tables.generic_event(major_opcode, event_type),
            None => tables.event(raw.code()),
        }
        .copied()
    }
}
