use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

use crate::entry::LogEntry;
use crate::space::BufferBacking;

/// Per-thread circular log of fixed-size entries.
///
/// `end` is advanced only by the owning writer thread, `start` only by the
/// retirement/consumer role (recovery or a companion reclamation pass).
/// Observers read both with acquire loads and agree on fill state without a
/// lock; they must not assume anything beyond what the acquire/release
/// pairing guarantees.
#[derive(Debug)]
pub struct CbLog {
    size: u32,
    is_filled: AtomicU32,
    start: CachePadded<AtomicU32>,
    end: CachePadded<AtomicU32>,
    slots: *mut LogEntry,
}

// SAFETY: the slot array is written only through `try_append` by the single
// owning thread and read only at indices already published through a release
// store of `end`
unsafe impl Send for CbLog {}
unsafe impl Sync for CbLog {}

impl CbLog {
    pub fn new(backing: &BufferBacking) -> Self {
        assert!(backing.slots() >= 2, "circular buffer needs at least 2 slots");
        Self {
            size: backing.slots(),
            is_filled: AtomicU32::new(0),
            start: CachePadded::new(AtomicU32::new(0)),
            end: CachePadded::new(AtomicU32::new(0)),
            slots: backing.slot_ptr(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.size
    }

    pub fn is_full(&self) -> bool {
        (self.end.load(Ordering::Acquire) + 1) % self.size
            == self.start.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.start.load(Ordering::Acquire) == self.end.load(Ordering::Acquire)
    }

    pub fn is_filled(&self) -> bool {
        self.is_filled.load(Ordering::Acquire) != 0
    }

    pub(crate) fn reset_filled(&self) {
        self.is_filled.store(0, Ordering::Release);
    }

    /// Writer side: no more appends will land here, either because the
    /// buffer filled up or because the owning thread is done with it. Only a
    /// sealed buffer may become reusable once it drains to empty.
    pub fn seal(&self) {
        self.is_filled.store(1, Ordering::Release);
    }

    pub fn live_entries(&self) -> u32 {
        let start = self.start.load(Ordering::Acquire);
        let end = self.end.load(Ordering::Acquire);
        (end + self.size - start) % self.size
    }

    /// Appends one entry, owner thread only. Returns the written slot address
    /// so the caller can flush it, or `None` when the buffer is full and the
    /// writer has to rotate to another buffer.
    pub fn try_append(&self, entry: LogEntry) -> Option<*const LogEntry> {
        if self.is_full() {
            self.seal();
            return None;
        }
        // only the owner advances end, a relaxed load observes its own stores
        let end = self.end.load(Ordering::Relaxed);
        // SAFETY: the slot at `end` is not live (the buffer is not full) and
        // no other thread writes this buffer while we own it
        unsafe { ptr::write(self.slots.add(end as usize), entry) };
        // publish after the payload write so an observer of the new end also
        // observes the fully written entry
        self.end.store((end + 1) % self.size, Ordering::Release);
        Some(unsafe { self.slots.add(end as usize) as *const LogEntry })
    }

    /// Consumer role: observe and retire the oldest live entry. Legal
    /// concurrently with the writer's use of `end`.
    pub fn retire_one(&self) -> Option<LogEntry> {
        let start = self.start.load(Ordering::Relaxed);
        if start == self.end.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: the slot at `start` was published by a release store of
        // `end`, which the acquire load above synchronized with
        let entry = unsafe { ptr::read(self.slots.add(start as usize)) };
        self.start.store((start + 1) % self.size, Ordering::Release);
        Some(entry)
    }
}
