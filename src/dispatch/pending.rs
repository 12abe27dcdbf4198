//! Requests still waiting for the server, keyed by full sequence number.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::cookie::Resolve;
use crate::error::{Result, XwireError};

/// Pending map shared by the send path and the read loop.
///
/// Slots are taken out under the lock and completed after it is released.
#[derive(Default)]
pub(crate) struct PendingReplies {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    slots: BTreeMap<u64, Box<dyn Resolve>>,
    /// Set once the read loop has stopped; nothing can complete new slots.
    closed: bool,
}

impl PendingReplies {
    /// Store a slot.
    ///
    /// # Errors
    ///
    /// [`XwireError::SequenceReuse`] if the sequence is still pending,
    /// [`XwireError::ConnectionClosed`] after [`fail_all`](Self::fail_all).
    pub fn insert(&self, slot: Box<dyn Resolve>) -> Result<()> {
        let sequence = slot.sequence();
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(XwireError::ConnectionClosed);
        }
        if inner.slots.contains_key(&sequence) {
            return Err(XwireError::SequenceReuse(sequence));
        }
        inner.slots.insert(sequence, slot);
        Ok(())
    }

    pub fn take(&self, sequence: u64) -> Option<Box<dyn Resolve>> {
        self.inner.lock().slots.remove(&sequence)
    }

    /// Remove void slots older than `sequence`.
    ///
    /// The server answers in request order, so traffic for `sequence` proves
    /// every earlier request without a reply succeeded.
    pub fn retire_before(&self, sequence: u64) -> Vec<Box<dyn Resolve>> {
        let mut inner = self.inner.lock();
        let slots = &mut inner.slots;
        let retired: Vec<u64> = slots
            .range(..sequence)
            .filter(|(_, slot)| !slot.expects_reply())
            .map(|(&seq, _)| seq)
            .collect();
        retired
            .into_iter()
            .filter_map(|seq| slots.remove(&seq))
            .collect()
    }

    /// Oldest pending sequence.
    pub fn oldest(&self) -> Option<u64> {
        self.inner.lock().slots.keys().next().copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Fail every pending slot and refuse new ones. Used when the connection
    /// goes away.
    pub fn fail_all(&self) {
        let drained = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.slots)
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "failing pending requests");
        }
        for (_, mut slot) in drained {
            let _ = slot.fail(XwireError::ConnectionClosed);
        }
    }
}
