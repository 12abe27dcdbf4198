//! Reply futures ("cookies") correlated by sequence number.
//!
//! Sending a request hands back a cookie and leaves a slot in the
//! connection's pending map. The read loop resolves the slot when the
//! matching reply or error arrives; the cookie completes then.
//!
//! A cookie is consumed by [`Cookie::reply`], so its value can be asked for
//! exactly once. A slot can be completed exactly once; a second attempt
//! returns [`XwireError::DoubleResolution`].

use std::fmt;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::connection::Connection;
use crate::error::{Result, XwireError};
use crate::message::ReplyDecoder;
use crate::protocol::{ByteOrder, RawFrame};

/// Widen a 16-bit wire sequence to the largest full sequence that is not
/// after `last_sent` and has the same low 16 bits.
///
/// Returns `None` when no such sequence exists, i.e. the frame refers to a
/// request that was never sent.
pub fn widen(wire: u16, last_sent: u64) -> Option<u64> {
    let candidate = (last_sent & !0xffff) | u64::from(wire);
    if candidate <= last_sent {
        Some(candidate)
    } else {
        candidate.checked_sub(0x1_0000)
    }
}

/// The connection side of a pending request, as stored in the pending map.
pub(crate) trait Resolve: Send {
    fn sequence(&self) -> u64;

    /// Whether the server owes a reply for this request.
    fn expects_reply(&self) -> bool;

    /// Complete with a reply frame.
    fn resolve(&mut self, frame: &RawFrame) -> Result<()>;

    /// Complete with an error.
    fn fail(&mut self, error: XwireError) -> Result<()>;

    /// Complete a void request that later traffic proved successful.
    fn retire(&mut self) -> Result<()>;
}

/// Create a cookie and the slot that completes it.
pub(crate) fn issue<T: Send + 'static>(
    sequence: u64,
    order: ByteOrder,
    decoder: ReplyDecoder<T>,
    default_timeout: Option<Duration>,
) -> (Cookie<T>, ReplySlot<T>) {
    let (tx, rx) = oneshot::channel();
    (
        Cookie {
            sequence,
            rx,
            default_timeout,
            _connection: None,
        },
        ReplySlot {
            sequence,
            order,
            decoder,
            sender: Some(tx),
        },
    )
}

/// Create a void cookie and its slot.
pub(crate) fn issue_void(sequence: u64, connection: Connection) -> (VoidCookie, VoidSlot) {
    let (tx, rx) = oneshot::channel();
    (
        VoidCookie {
            sequence,
            rx,
            connection,
        },
        VoidSlot {
            sequence,
            sender: Some(tx),
        },
    )
}

/// A reply that has not arrived yet.
///
/// A cookie holds a handle on the connection that issued it, so the read
/// loop keeps running until the reply arrives even if every other
/// [`Connection`] clone is gone.
///
/// Dropping a cookie is fine; its reply is decoded and discarded when it
/// arrives.
#[must_use = "a cookie does nothing unless its reply is awaited or it is dropped on purpose"]
pub struct Cookie<T> {
    sequence: u64,
    rx: oneshot::Receiver<Result<T>>,
    default_timeout: Option<Duration>,
    _connection: Option<Connection>,
}

impl<T> Cookie<T> {
    pub(crate) fn with_connection(mut self, connection: Connection) -> Self {
        self._connection = Some(connection);
        self
    }

    /// Full sequence number of the request.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Wait for the reply, bounded by the connection's default reply
    /// timeout when one is configured.
    pub async fn reply(self) -> Result<T> {
        match self.default_timeout {
            Some(timeout) => self.reply_timeout(timeout).await,
            None => Self::wait(self.rx).await,
        }
    }

    /// Wait for the reply for at most `timeout`.
    ///
    /// # Errors
    ///
    /// [`XwireError::Timeout`] if nothing arrived in time; the reply is then
    /// discarded when it does arrive.
    pub async fn reply_timeout(self, timeout: Duration) -> Result<T> {
        tokio::time::timeout(timeout, Self::wait(self.rx))
            .await
            .map_err(|_| XwireError::Timeout)?
    }

    async fn wait(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        rx.await.unwrap_or(Err(XwireError::ConnectionClosed))
    }
}

impl<T> fmt::Debug for Cookie<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cookie")
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Completes a [`Cookie`].
pub(crate) struct ReplySlot<T> {
    sequence: u64,
    order: ByteOrder,
    decoder: ReplyDecoder<T>,
    sender: Option<oneshot::Sender<Result<T>>>,
}

impl<T> ReplySlot<T> {
    fn complete(&mut self, outcome: Result<T>) -> Result<()> {
        let Some(sender) = self.sender.take() else {
            tracing::error!(sequence = self.sequence, "pending request completed twice");
            return Err(XwireError::DoubleResolution {
                sequence: self.sequence,
            });
        };
        if sender.send(outcome).is_err() {
            tracing::trace!(sequence = self.sequence, "cookie dropped, discarding outcome");
        }
        Ok(())
    }
}

impl<T: Send + 'static> Resolve for ReplySlot<T> {
    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn expects_reply(&self) -> bool {
        true
    }

    fn resolve(&mut self, frame: &RawFrame) -> Result<()> {
        let outcome = (self.decoder)(frame.bytes(), self.order).map_err(|error| {
            tracing::warn!(sequence = self.sequence, %error, "reply failed to decode");
            XwireError::Wire(error)
        });
        self.complete(outcome)
    }

    fn fail(&mut self, error: XwireError) -> Result<()> {
        self.complete(Err(error))
    }

    fn retire(&mut self) -> Result<()> {
        self.complete(Err(XwireError::Framing(format!(
            "no reply for request {}",
            self.sequence
        ))))
    }
}

/// Outcome of a checked request that has no reply.
#[must_use = "a void cookie does nothing unless checked or dropped on purpose"]
pub struct VoidCookie {
    sequence: u64,
    rx: oneshot::Receiver<Result<()>>,
    connection: Connection,
}

impl VoidCookie {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Find out whether the request failed.
    ///
    /// Sends a round trip so that the server has answered everything up to
    /// and including this request, then reports its outcome.
    pub async fn check(self) -> Result<()> {
        let synced = self.connection.sync().await;
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => synced.and(Err(XwireError::ConnectionClosed)),
        }
    }
}

impl fmt::Debug for VoidCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoidCookie")
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Completes a [`VoidCookie`].
pub(crate) struct VoidSlot {
    sequence: u64,
    sender: Option<oneshot::Sender<Result<()>>>,
}

impl VoidSlot {
    fn complete(&mut self, outcome: Result<()>) -> Result<()> {
        let Some(sender) = self.sender.take() else {
            tracing::error!(sequence = self.sequence, "pending request completed twice");
            return Err(XwireError::DoubleResolution {
                sequence: self.sequence,
            });
        };
        if let Err(Err(error)) = sender.send(outcome) {
            tracing::debug!(
                sequence = self.sequence,
                %error,
                "void cookie dropped, discarding its error"
            );
        }
        Ok(())
    }
}

impl Resolve for VoidSlot {
    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn expects_reply(&self) -> bool {
        false
    }

    fn resolve(&mut self, _frame: &RawFrame) -> Result<()> {
        tracing::warn!(sequence = self.sequence, "reply for a request that has none");
        self.complete(Ok(()))
    }

    fn fail(&mut self, error: XwireError) -> Result<()> {
        self.complete(Err(error))
    }

    fn retire(&mut self) -> Result<()> {
        self.complete(Ok(()))
    }
}
