//! Registry of live threads.
//!
//! An arena of thread references keyed by a stable slot index. Insertion and
//! removal hold a single short lock; enumeration copies the live entries out
//! so long-running operations over them never hold it.

use crate::errors::SpawnError;
use crate::thread::{ThreadId, ThreadRef};

extern crate alloc;
use alloc::vec::Vec;

struct Slots {
    entries: Vec<Option<ThreadRef>>,
    free: Vec<usize>,
    live: usize,
}

/// Arena of registered threads.
pub struct Registry {
    capacity: usize,
    slots: spin::Mutex<Slots>,
}

impl Registry {
    /// Create a registry holding at most `capacity` threads.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: spin::Mutex::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    /// Register `thread`, recording its slot in the control block.
    ///
    /// # Errors
    ///
    /// `SpawnError::TooManyThreads` when the registry is full.
    pub fn insert(&self, thread: &ThreadRef) -> Result<usize, SpawnError> {
        let mut slots = self.slots.lock();
        if slots.live >= self.capacity {
            return Err(SpawnError::TooManyThreads);
        }
        let slot = match slots.free.pop() {
            Some(slot) => {
                slots.entries[slot] = Some(thread.clone());
                slot
            }
            None => {
                slots.entries.push(Some(thread.clone()));
                slots.entries.len() - 1
            }
        };
        slots.live += 1;
        thread.set_slot(Some(slot));
        Ok(slot)
    }

    /// Unregister `thread`. Returns whether it was registered.
    pub fn remove(&self, thread: &ThreadRef) -> bool {
        let Some(slot) = thread.slot() else {
            return false;
        };
        let mut slots = self.slots.lock();
        let owned = slots
            .entries
            .get(slot)
            .and_then(Option::as_ref)
            .is_some_and(|t| alloc::sync::Arc::ptr_eq(t, thread));
        if !owned {
            return false;
        }
        slots.entries[slot] = None;
        slots.free.push(slot);
        slots.live -= 1;
        thread.set_slot(None);
        true
    }

    /// Thread registered at `slot`.
    pub fn get(&self, slot: usize) -> Option<ThreadRef> {
        self.slots.lock().entries.get(slot).cloned().flatten()
    }

    /// Look a thread up by identifier.
    pub fn find(&self, id: ThreadId) -> Option<ThreadRef> {
        self.slots
            .lock()
            .entries
            .iter()
            .flatten()
            .find(|t| t.id() == id)
            .cloned()
    }

    /// Copy of the live entries, in slot order.
    pub fn snapshot(&self) -> Vec<ThreadRef> {
        self.slots.lock().entries.iter().flatten().cloned().collect()
    }

    /// Number of registered threads.
    pub fn len(&self) -> usize {
        self.slots.lock().live
    }

    /// Whether no thread is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of registered threads.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
