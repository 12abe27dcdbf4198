//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 32 bytes
//! - `WaitingForBody`: Header parsed, need the rest of the declared length
//!
//! Frames are cut strictly by their declared length, before anything looks
//! at the payload, so a payload that fails to decode never shifts the
//! stream position.
//!
//! # Example
//!
//! ```
//! use xwire::protocol::{encode_reply_frame, ByteOrder, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new(ByteOrder::Little);
//! let bytes = encode_reply_frame(ByteOrder::Little, 0, 1, &[]);
//!
//! assert!(buffer.push(&bytes[..10]).unwrap().is_empty());
//! let frames = buffer.push(&bytes[10..]).unwrap();
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].sequence(), 1);
//! ```

use bytes::BytesMut;

use super::frame::{FrameHeader, RawFrame};
use super::wire_format::ByteOrder;
use crate::error::{Result, XwireError};

/// Default maximum frame size (256 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u64 = 256 * 1024 * 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a complete 32-byte header.
    WaitingForHeader,
    /// Header parsed, waiting for `total` bytes in the buffer.
    WaitingForBody { total: usize },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Byte order negotiated at setup.
    order: ByteOrder,
    /// Maximum allowed frame size.
    max_frame_size: u64,
}

impl FrameBuffer {
    /// Create a new frame buffer with default settings.
    ///
    /// Default capacity: 64KB, max frame: 256MB.
    pub fn new(order: ByteOrder) -> Self {
        Self::with_max_frame_size(order, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with a custom max frame size.
    pub fn with_max_frame_size(order: ByteOrder, max_frame_size: u64) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            order,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns [`XwireError::Framing`] if a header declares a frame larger
    /// than the configured maximum. The stream cannot be resynchronised
    /// after that.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<RawFrame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<RawFrame>> {
        match self.state {
            State::WaitingForHeader => {
                let Some(header) = FrameHeader::decode(&self.buffer, self.order) else {
                    return Ok(None);
                };

                let total = header.total_len();
                if total > self.max_frame_size {
                    return Err(XwireError::Framing(format!(
                        "frame size {} exceeds maximum {}",
                        total, self.max_frame_size
                    )));
                }

                // Bounded by max_frame_size above.
                self.state = State::WaitingForBody {
                    total: total as usize,
                };
                self.try_extract_one()
            }

            State::WaitingForBody { total } => {
                if self.buffer.len() < total {
                    return Ok(None);
                }

                let bytes = self.buffer.split_to(total).freeze();
                self.state = State::WaitingForHeader;

                RawFrame::new(bytes, self.order)
                    .map(Some)
                    .ok_or_else(|| XwireError::Framing("frame shorter than its header".into()))
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}
