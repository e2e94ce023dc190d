//! MST time-slot allocation.
//!
//! A multi-stream link is divided into 64 time slots per transfer unit.
//! Slot 0 carries the MTP header, leaving slots `1..=63` for payload.  Each
//! stream receives one contiguous range; allocation is first-fit.

use serde::Serialize;
use thiserror::Error;

use super::stream::StreamId;

/// Number of payload slots available on one link.
pub const MST_PAYLOAD_SLOTS: u8 = 63;

/// A contiguous slot range owned by one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotAllocation {
    pub stream: StreamId,
    pub start_slot: u8,
    pub slot_count: u8,
}

impl SlotAllocation {
    fn end(&self) -> u8 {
        self.start_slot + self.slot_count
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("a slot count of zero cannot be allocated")]
    ZeroSlots,
    #[error("no contiguous range of {requested} slots is free")]
    Exhausted { requested: u8 },
    #[error("{0} already owns a slot range")]
    AlreadyAllocated(StreamId),
}

/// First-fit allocator over the payload slots of one link.
#[derive(Debug, Clone, Default)]
pub struct SlotAllocator {
    allocations: Vec<SlotAllocation>,
}

impl SlotAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `slot_count` contiguous slots for `stream`.
    ///
    /// # Errors
    ///
    /// Returns [`SlotError::Exhausted`] when no gap is large enough.
    pub fn allocate(&mut self, stream: StreamId, slot_count: u8) -> Result<SlotAllocation, SlotError> {
        if slot_count == 0 {
            return Err(SlotError::ZeroSlots);
        }
        if self.allocations.iter().any(|a| a.stream == stream) {
            return Err(SlotError::AlreadyAllocated(stream));
        }

        let mut candidate = 1u8;
        for existing in &self.allocations {
            if existing.start_slot.saturating_sub(candidate) >= slot_count {
                break;
            }
            candidate = existing.end();
        }

        let last_free = u16::from(MST_PAYLOAD_SLOTS) + 1;
        if u16::from(candidate) + u16::from(slot_count) > last_free {
            return Err(SlotError::Exhausted {
                requested: slot_count,
            });
        }

        let allocation = SlotAllocation {
            stream,
            start_slot: candidate,
            slot_count,
        };
        self.allocations.push(allocation);
        self.allocations.sort_by_key(|a| a.start_slot);
        Ok(allocation)
    }

    /// Frees the range owned by `stream`, returning it if there was one.
    pub fn release(&mut self, stream: StreamId) -> Option<SlotAllocation> {
        let index = self.allocations.iter().position(|a| a.stream == stream)?;
        Some(self.allocations.remove(index))
    }

    pub fn clear(&mut self) {
        self.allocations.clear();
    }

    pub fn free_slots(&self) -> u8 {
        let used: u8 = self.allocations.iter().map(|a| a.slot_count).sum();
        MST_PAYLOAD_SLOTS - used
    }

    pub fn allocations(&self) -> &[SlotAllocation] {
        &self.allocations
    }
}
