//! Resource id allocation.
//!
//! The server hands each client a base and a mask at setup. Ids are the
//! base combined with successive multiples of the mask's lowest set bit.
//! Once the mask's range is used up, further ranges come from XC-MISC.

use crate::error::{Result, XwireError};

#[derive(Debug, Clone)]
pub struct IdAllocator {
    base: u32,
    inc: u32,
    next: u32,
    remaining: u32,
}

impl IdAllocator {
    pub fn new(base: u32, mask: u32) -> Self {
        // Lowest set bit of the mask.
        let inc = mask & mask.wrapping_neg();
        let remaining = if inc == 0 { 0 } else { mask / inc };
        Self {
            base,
            inc,
            next: inc,
            remaining,
        }
    }

    /// Next id from the current range, or `None` when it is used up.
    pub fn next_id(&mut self) -> Option<u32> {
        if self.remaining == 0 {
            return None;
        }
        let id = self.next | self.base;
        self.next = self.next.wrapping_add(self.inc);
        self.remaining -= 1;
        Some(id)
    }

    /// Switch to a range returned by XC-MISC `GetXIDRange`.
    ///
    /// # Errors
    ///
    /// [`XwireError::IdsExhausted`] if the server has no ids left.
    pub fn refill(&mut self, start_id: u32, count: u32) -> Result<()> {
        if count == 0 || self.inc == 0 {
            return Err(XwireError::IdsExhausted);
        }

        tracing::debug!(start_id, count, "refilled resource id range");

        // Ids from the server already carry the base bits.
        self.base = 0;
        self.next = start_id;
        self.remaining = count;
        Ok(())
    }
}
