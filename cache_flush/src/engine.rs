use crate::backend::FlushBackend;
use crate::region::RegionQuery;
use crate::{fail_program, CacheLineSet, CACHE_LINE_MASK, CACHE_LINE_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitMode {
    /// Only the owning thread writes into its regions, no region check.
    Local,
    /// A helper may flush into a user region that could have been closed
    /// concurrently, so every line is checked against the region query first.
    Global,
}

/// Turns a set of dirty cache lines into a correctly fenced flush sequence.
///
/// Collecting lines is separate from flushing them so that many small writes
/// inside one critical section coalesce into a single fenced flush instead of
/// paying one fence pair per write.
pub struct FlushEngine<B: FlushBackend, R: RegionQuery> {
    backend: B,
    region: R,
    mode: CommitMode,
}

impl<B: FlushBackend, R: RegionQuery> FlushEngine<B, R> {
    pub fn new(backend: B, region: R, mode: CommitMode) -> Self {
        Self {
            backend,
            region,
            mode,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn region(&self) -> &R {
        &self.region
    }

    pub fn mode(&self) -> CommitMode {
        self.mode
    }

    /// Fenced flush: one leading fence, one flush per line, one trailing
    /// fence, regardless of set size. This is the durability boundary used at
    /// critical section exit.
    pub fn flush_cache_lines(&self, cl_set: &CacheLineSet) {
        fail_program();
        self.backend.fence();
        for line_addr in cl_set.iter() {
            assert!(line_addr != 0, "flush of a null cache-line address");
            if self.mode == CommitMode::Global
                && !self.region.is_in_open_region(line_addr, 1)
            {
                // The region can still be closed between this check and the
                // flush itself, so this only prevents faulting on unmapped
                // memory. It is not a consistency guarantee.
                log::trace!("skipping flush of line {:#x} in a closed region", line_addr);
                continue;
            }
            self.backend.flush_line(line_addr);
        }
        self.backend.fence();
    }

    /// Flush only, no fences, no region check. For callers that already
    /// established the required ordering.
    pub fn flush_cache_lines_unconstrained(&self, cl_set: &CacheLineSet) {
        fail_program();
        for line_addr in cl_set.iter() {
            assert!(line_addr != 0, "flush of a null cache-line address");
            self.backend.flush_line(line_addr);
        }
    }

    /// Unconstrained flush of one byte range, walking its lines directly.
    /// No set is built, so this stays allocation-free on hot paths like
    /// making a just-appended log record durable.
    pub fn flush_range_unconstrained(&self, addr: u64, size: usize) {
        fail_program();
        if size == 0 {
            return;
        }
        assert!(addr != 0, "flush of a null address");
        let last_line_addr = (addr + size as u64 - 1) & CACHE_LINE_MASK;
        let mut line_addr = addr & CACHE_LINE_MASK;
        while line_addr <= last_line_addr {
            self.backend.flush_line(line_addr);
            line_addr += CACHE_LINE_SIZE as u64;
        }
    }
}
