use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};

use crate::buffer::CbLog;
use crate::entry::LogEntry;
use crate::space::{BufferBacking, LogSpace, SpaceResult};

/// One buffer-list node: a circular buffer, the byte range of its backing
/// storage, the owning thread, and the availability flag that gates reuse.
///
/// Nodes are append-only and never freed while the list is alive; reclamation
/// of fully retired nodes is isolated behind the availability seam so an
/// epoch or hazard-pointer scheme can slot in later.
pub struct CbListNode {
    cb: CbLog,
    backing: BufferBacking,
    tid: AtomicU64,
    is_available: AtomicBool,
    next: AtomicPtr<CbListNode>,
}

impl CbListNode {
    fn new(backing: BufferBacking, tid: u64) -> Self {
        Self {
            cb: CbLog::new(&backing),
            backing,
            tid: AtomicU64::new(tid),
            is_available: AtomicBool::new(false),
            next: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    pub fn cb(&self) -> &CbLog {
        &self.cb
    }

    pub fn start_addr(&self) -> u64 {
        self.backing.start_addr()
    }

    pub fn end_addr(&self) -> u64 {
        self.backing.end_addr()
    }

    pub fn owner_tid(&self) -> u64 {
        self.tid.load(Ordering::Relaxed)
    }

    pub fn is_available(&self) -> bool {
        self.is_available.load(Ordering::Acquire)
    }

    /// Consumer side: a buffer becomes eligible for reuse by another thread
    /// only after its writer sealed it and every entry retired. A drained
    /// buffer whose writer is still appending must never be handed out, two
    /// owners would race on the same slot array.
    pub fn release_if_empty(&self) -> bool {
        if !self.cb.is_filled() || !self.cb.is_empty() {
            return false;
        }
        self.is_available.store(true, Ordering::Release);
        true
    }
}

/// Growable, thread-shared registry of circular buffers.
///
/// The only cross-thread mutations are claiming an available node and
/// appending a brand-new one, each a single compare-and-swap. No mutexes.
pub struct BufferList {
    head: AtomicPtr<CbListNode>,
    space: LogSpace,
    slots_per_buffer: u32,
}

// SAFETY: nodes behind the raw head pointer are only handed out as shared
// references and all their cross-thread state is atomic
unsafe impl Send for BufferList {}
unsafe impl Sync for BufferList {}

impl BufferList {
    pub fn new(space: LogSpace, slots_per_buffer: u32) -> Self {
        assert!(slots_per_buffer >= 2, "buffers need at least 2 slots");
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
            space,
            slots_per_buffer,
        }
    }

    pub fn buffer_bytes(&self) -> usize {
        self.slots_per_buffer as usize * mem::size_of::<LogEntry>()
    }

    /// Claims an empty, available buffer for `tid`, or maps a fresh one and
    /// inserts it. The bool is true when new backing storage was mapped.
    pub fn acquire_buffer(&self, tid: u64) -> SpaceResult<(&CbListNode, bool)> {
        let mut cur = self.head.load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: nodes are never freed while the list is alive
            let node = unsafe { &*cur };
            if node.is_available.load(Ordering::Acquire)
                && node
                    .is_available
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                // ownership transferred by the claim, losers keep scanning
                debug_assert!(node.cb.is_empty());
                node.cb.reset_filled();
                node.tid.store(tid, Ordering::Relaxed);
                log::debug!("thread {} reuses log buffer {:#x}", tid, node.start_addr());
                return Ok((node, false));
            }
            cur = node.next.load(Ordering::Acquire);
        }

        let backing = self.space.alloc(self.slots_per_buffer)?;
        let node = Box::into_raw(Box::new(CbListNode::new(backing, tid)));
        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: the node is not shared until the insert below succeeds
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        log::debug!("thread {} mapped a new log buffer", tid);
        // SAFETY: inserted nodes are never freed while the list is alive
        Ok((unsafe { &*node }, true))
    }

    pub fn iter(&self) -> CbListIter<'_> {
        CbListIter {
            cur: self.head.load(Ordering::Acquire),
            _list: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl Drop for BufferList {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            // SAFETY: exclusive access during drop, every node came from
            // Box::into_raw in acquire_buffer
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.load(Ordering::Relaxed);
        }
    }
}

pub struct CbListIter<'a> {
    cur: *mut CbListNode,
    _list: PhantomData<&'a BufferList>,
}

impl<'a> Iterator for CbListIter<'a> {
    type Item = &'a CbListNode;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_null() {
            return None;
        }
        // SAFETY: nodes live as long as the list borrowed by this iterator
        let node = unsafe { &*self.cur };
        self.cur = node.next.load(Ordering::Acquire);
        Some(node)
    }
}
