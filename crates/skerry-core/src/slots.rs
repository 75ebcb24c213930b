//! Exclusive allocation of network slot indices.

use crate::error::{CoreError, Result};
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
struct SlotState {
    in_use: HashSet<u32>,
    next: u32,
}

/// Pool of slot indices in `0..capacity`.
///
/// A slot handed out by [`acquire`](Self::acquire) or taken by
/// [`reserve`](Self::reserve) is never handed out again until released.
/// The lock is a plain mutex held for a few instructions, never across
/// an await.
#[derive(Debug)]
pub struct SlotPool {
    capacity: u32,
    state: Mutex<SlotState>,
}

impl SlotPool {
    /// Create an empty pool.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            state: Mutex::new(SlotState::default()),
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Take the next free slot, scanning round-robin from the last one handed out.
    pub fn acquire(&self) -> Result<u32> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.in_use.len() as u32 >= self.capacity {
            return Err(CoreError::ResourceExhausted(format!(
                "all {} network slots in use",
                self.capacity
            )));
        }

        let mut slot = state.next;
        for _ in 0..self.capacity {
            if slot >= self.capacity {
                slot = 0;
            }
            if state.in_use.insert(slot) {
                state.next = slot + 1;
                tracing::trace!(slot, "Slot acquired");
                return Ok(slot);
            }
            slot += 1;
        }

        Err(CoreError::ResourceExhausted(format!(
            "all {} network slots in use",
            self.capacity
        )))
    }

    /// Mark a specific slot as taken (used for slots held by orphans).
    ///
    /// Returns `false` if it was already taken.
    pub fn reserve(&self, slot: u32) -> Result<bool> {
        if slot >= self.capacity {
            return Err(CoreError::Validation(format!(
                "slot {slot} out of range 0..{}",
                self.capacity
            )));
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.in_use.insert(slot))
    }

    /// Return a slot to the pool. Releasing a free slot is a no-op.
    pub fn release(&self, slot: u32) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let released = state.in_use.remove(&slot);
        if released {
            tracing::trace!(slot, "Slot released");
        }
        released
    }

    /// Number of slots currently taken.
    pub fn in_use(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_use
            .len()
    }

    /// Release every slot.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_use.clear();
        state.next = 0;
    }
}
