//! PDU reference allocation.
//!
//! References are 16-bit, increase monotonically, wrap around and never
//! take the value zero (zero marks unsolicited PDUs).

use std::sync::atomic::{AtomicU16, Ordering};

/// Lock-free source of PDU references.
#[derive(Debug, Default)]
pub struct ReferenceAllocator {
    last: AtomicU16,
}

impl ReferenceAllocator {
    /// Create an allocator whose first reference is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an allocator whose first reference follows `last`.
    pub fn starting_after(last: u16) -> Self {
        Self {
            last: AtomicU16::new(last),
        }
    }

    /// Allocate the next reference.
    pub fn next(&self) -> u16 {
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(successor(last))
            })
            .unwrap_or_else(|last| last);
        successor(previous)
    }

    /// The most recently allocated reference (0 before the first).
    pub fn last(&self) -> u16 {
        self.last.load(Ordering::Acquire)
    }
}

#[inline]
fn successor(last: u16) -> u16 {
    match last.wrapping_add(1) {
        0 => 1,
        next => next,
    }
}
