pub mod backend;
pub mod engine;
pub mod region;

use std::collections::HashSet;

pub const CACHE_LINE_SIZE: usize = 64;
pub const CACHE_LINE_MASK: u64 = !(CACHE_LINE_SIZE as u64 - 1);

#[cfg(feature = "force_fail")]
pub(crate) fn fail_program() {
    std::process::abort();
}

#[cfg(not(feature = "force_fail"))]
pub(crate) fn fail_program() {}

/// Set of unique cache-line addresses touched by logged writes.
///
/// Built incrementally while a critical section runs, consumed by a single
/// flush call and cleared. Set semantics absorb overlapping ranges.
#[derive(Debug, Default)]
pub struct CacheLineSet {
    lines: HashSet<u64>,
}

impl CacheLineSet {
    pub fn new() -> Self {
        Self {
            lines: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn contains(&self, line_addr: u64) -> bool {
        self.lines.contains(&line_addr)
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.lines.iter().copied()
    }

    /// Inserts every cache line touched by `[addr, addr + size)`, stepping by
    /// the line size from the line of `addr` to the line of the last byte
    /// inclusive. No-op when `size` is zero.
    pub fn collect(&mut self, addr: u64, size: usize) {
        fail_program();
        if size == 0 {
            return;
        }
        assert!(addr != 0, "collecting cache lines of a null address");

        let last_addr = addr + size as u64 - 1;
        let last_line_addr = last_addr & CACHE_LINE_MASK;
        let mut line_addr = addr & CACHE_LINE_MASK;
        while line_addr <= last_line_addr {
            self.lines.insert(line_addr);
            line_addr += CACHE_LINE_SIZE as u64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheLineSet, CACHE_LINE_MASK, CACHE_LINE_SIZE};
    use rand::Rng;

    #[test]
    fn zero_size_collects_nothing() {
        let mut set = CacheLineSet::new();
        set.collect(0x1234, 0);
        assert!(set.is_empty());
    }

    #[test]
    fn single_byte_collects_one_line() {
        let mut set = CacheLineSet::new();
        set.collect(0x1001, 1);
        assert_eq!(set.len(), 1);
        assert!(set.contains(0x1000));
    }

    #[test]
    fn unaligned_range_spanning_lines() {
        let mut set = CacheLineSet::new();
        // last byte is 0x103f + 2 - 1 = 0x1040, so two lines
        set.collect(0x103f, 2);
        assert_eq!(set.len(), 2);
        assert!(set.contains(0x1000));
        assert!(set.contains(0x1040));
    }

    #[test]
    fn overlapping_ranges_dedupe() {
        let mut set = CacheLineSet::new();
        set.collect(0x1000, 64);
        set.collect(0x1010, 64);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn line_count_matches_formula() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let addr: u64 = rng.gen_range(1..1 << 40);
            let size: usize = rng.gen_range(1..4096);
            let mut set = CacheLineSet::new();
            set.collect(addr, size);

            let l = CACHE_LINE_SIZE as u64;
            let expected = (addr % l + size as u64 + l - 1) / l;
            assert_eq!(set.len() as u64, expected, "addr {addr:#x} size {size}");

            let first = addr & CACHE_LINE_MASK;
            let last = (addr + size as u64 - 1) & CACHE_LINE_MASK;
            for line in set.iter() {
                assert_eq!(line % l, 0);
                assert!(line >= first && line <= last);
            }
        }
    }
}
