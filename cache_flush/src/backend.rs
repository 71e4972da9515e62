use std::cell::Cell;
use std::sync::{Arc, Mutex};

thread_local! {
    static NUM_FLUSHES: Cell<u64> = Cell::new(0);
}

/// Number of cache-line flushes issued so far by the calling thread.
pub fn flush_count() -> u64 {
    NUM_FLUSHES.with(|c| c.get())
}

fn count_flush() {
    NUM_FLUSHES.with(|c| c.set(c.get() + 1));
}

/// Seam between the flush engine and the fence/flush instructions, so tests
/// can assert on the emitted instruction stream instead of executing it.
pub trait FlushBackend {
    fn fence(&self);
    fn flush_line(&self, line_addr: u64);
}

/// Issues the real hardware instructions.
#[derive(Clone, Copy, Debug, Default)]
pub struct HwBackend;

impl FlushBackend for HwBackend {
    #[cfg(target_arch = "x86_64")]
    fn fence(&self) {
        // SAFETY: sfence has no memory safety preconditions
        unsafe { core::arch::x86_64::_mm_sfence() };
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn fence(&self) {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(target_arch = "x86_64")]
    fn flush_line(&self, line_addr: u64) {
        count_flush();
        // SAFETY: callers only pass line addresses inside mapped log space or
        // user data that is currently being written
        unsafe { core::arch::x86_64::_mm_clflush(line_addr as *const u8) };
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn flush_line(&self, _line_addr: u64) {
        count_flush();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushEvent {
    Fence,
    Line(u64),
}

/// Records the instruction stream instead of executing it.
#[derive(Clone, Default)]
pub struct Collect {
    events: Arc<Mutex<Vec<FlushEvent>>>,
}

impl Collect {
    pub fn events(&self) -> Vec<FlushEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn fences(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, FlushEvent::Fence))
            .count()
    }

    pub fn lines(&self) -> Vec<u64> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                FlushEvent::Line(addr) => Some(*addr),
                FlushEvent::Fence => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl FlushBackend for Collect {
    fn fence(&self) {
        self.events.lock().unwrap().push(FlushEvent::Fence);
    }

    fn flush_line(&self, line_addr: u64) {
        count_flush();
        self.events.lock().unwrap().push(FlushEvent::Line(line_addr));
    }
}
