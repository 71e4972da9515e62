use histogram::Histogram;

/// Per-thread counters. Read only by the owning thread until the handle is
/// dropped and the snapshot is handed to the runtime for printing.
pub struct Stats {
    pub critical_section_count: u64,
    pub nested_critical_section_count: u64,
    pub logged_store_count: u64,
    pub critical_logged_store_count: u64,
    pub unlogged_store_count: u64,
    pub unlogged_critical_store_count: u64,
    pub log_elision_fail_count: u64,
    pub log_mem_use: u64,
    pub num_log_flushes: u64,
    /// Cache-line flushes issued by the thread, captured at snapshot time
    /// from the flush backend's thread-local counter.
    pub num_flushes: u64,
    pub flush_duration_micros: Histogram,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            critical_section_count: 0,
            nested_critical_section_count: 0,
            logged_store_count: 0,
            critical_logged_store_count: 0,
            unlogged_store_count: 0,
            unlogged_critical_store_count: 0,
            log_elision_fail_count: 0,
            log_mem_use: 0,
            num_log_flushes: 0,
            num_flushes: 0,
            flush_duration_micros: Histogram::new(),
        }
    }

    /// Every critical section contributes an acquire and a release marker on
    /// top of the logged stores.
    pub fn log_entry_total(&self) -> u64 {
        self.critical_section_count * 2 + self.logged_store_count
    }

    /// Dumps the counters. The caller holds the runtime's print lock so dumps
    /// from different threads do not interleave.
    pub fn print(&self, thread_tag: u64) {
        println!("[nvmlog-stats] Begin thread {}", thread_tag);
        println!("\t# critical sections: {}", self.critical_section_count);
        println!(
            "\t# nested critical sections: {}",
            self.nested_critical_section_count
        );
        println!("\t# logged stores: {}", self.logged_store_count);
        println!(
            "\t# logged stores in critical sections: {}",
            self.critical_logged_store_count
        );
        println!("\t# unlogged stores: {}", self.unlogged_store_count);
        println!(
            "\t# unlogged stores in critical sections: {}",
            self.unlogged_critical_store_count
        );
        println!(
            "\t# log elision failures (outside critical sections): {}",
            self.log_elision_fail_count
        );
        println!("\tLog memory usage: {}", self.log_mem_use);
        println!("\t# log entries (total): {}", self.log_entry_total());
        println!("\t# log flushes: {}", self.num_log_flushes);
        println!("\t# flushes: {}", self.num_flushes);
        if self.flush_duration_micros.entries() > 0 {
            if let (Ok(p50), Ok(p99)) = (
                self.flush_duration_micros.percentile(50.0),
                self.flush_duration_micros.percentile(99.0),
            ) {
                println!("\tsection flush duration p50/p99 us: {}/{}", p50, p99);
            }
        }
        println!("[nvmlog-stats] End thread {}", thread_tag);
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}
