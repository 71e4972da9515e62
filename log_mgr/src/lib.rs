pub mod forward;
pub mod stats;

use std::mem;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use cache_flush::backend::{FlushBackend, HwBackend};
use cache_flush::engine::{CommitMode, FlushEngine};
use cache_flush::region::{AlwaysOpen, RegionQuery};
use cache_flush::CacheLineSet;
use cb_log::{
    BufferList, CbListNode, EntryKind, LogEntry, LogSpace, SpaceResult,
    DEFAULT_SLOTS_PER_BUFFER,
};

use crate::forward::{ChannelForwarder, FlushSink};
use crate::stats::Stats;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Every qualifying store or memop outside a critical section immediately
    /// flushes its own cache lines through the fenced path.
    Immediate,
    /// Dirty ranges are handed to the out-of-band flush forwarder instead.
    Deferred,
}

#[derive(Debug)]
pub struct Config {
    pub data_dir: Option<PathBuf>,
    pub slots_per_buffer: u32,
    pub commit_mode: CommitMode,
    pub flush_policy: FlushPolicy,
}

impl Config {
    pub fn new() -> Self {
        Self {
            data_dir: None,
            slots_per_buffer: DEFAULT_SLOTS_PER_BUFFER,
            commit_mode: CommitMode::Local,
            flush_policy: FlushPolicy::Immediate,
        }
    }

    /// Consulted once at startup; the policy stays fixed for the process
    /// lifetime.
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if std::env::var_os("NVMLOG_TABLE_FLUSH").is_some() {
            config.flush_policy = FlushPolicy::Deferred;
        }
        if std::env::var_os("NVMLOG_GLOBAL_COMMIT").is_some() {
            config.commit_mode = CommitMode::Global;
        }
        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime context of the durability engine: the buffer registry, the flush
/// engine, the flush policy, and the collected per-thread stats. Constructed
/// explicitly and usually shared behind an `Arc`; there are no ambient
/// globals besides the backend's thread-local flush counter.
pub struct LogMgr<B: FlushBackend, R: RegionQuery> {
    engine: FlushEngine<B, R>,
    buffers: BufferList,
    policy: FlushPolicy,
    sink: Option<Box<dyn FlushSink>>,
    // serializes the diagnostics dump
    print_lock: Mutex<()>,
    snapshots: Mutex<Vec<(u64, Stats)>>,
    next_thread_tag: AtomicU64,
}

impl LogMgr<HwBackend, AlwaysOpen> {
    /// Runtime wired to the real flush instructions. Under the deferred
    /// policy a channel-backed forwarder thread is spawned.
    pub fn new(config: Config) -> SpaceResult<Arc<Self>> {
        let sink: Option<Box<dyn FlushSink>> = match config.flush_policy {
            FlushPolicy::Immediate => None,
            FlushPolicy::Deferred => Some(Box::new(ChannelForwarder::spawn(FlushEngine::new(
                HwBackend,
                AlwaysOpen,
                config.commit_mode,
            )))),
        };
        Self::with_parts(config, HwBackend, AlwaysOpen, sink)
    }
}

impl<B: FlushBackend, R: RegionQuery> LogMgr<B, R> {
    pub fn with_parts(
        config: Config,
        backend: B,
        region: R,
        sink: Option<Box<dyn FlushSink>>,
    ) -> SpaceResult<Arc<Self>> {
        assert!(
            config.flush_policy == FlushPolicy::Immediate || sink.is_some(),
            "deferred flush policy needs a flush sink"
        );
        let space = match config.data_dir {
            Some(dir) => LogSpace::in_dir(dir)?,
            None => LogSpace::anonymous(),
        };
        Ok(Arc::new(Self {
            engine: FlushEngine::new(backend, region, config.commit_mode),
            buffers: BufferList::new(space, config.slots_per_buffer),
            policy: config.flush_policy,
            sink,
            print_lock: Mutex::new(()),
            snapshots: Mutex::new(Vec::new()),
            next_thread_tag: AtomicU64::new(1),
        }))
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }

    /// The shared buffer registry, exposed for the recovery consumer.
    pub fn buffer_list(&self) -> &BufferList {
        &self.buffers
    }

    pub fn engine(&self) -> &FlushEngine<B, R> {
        &self.engine
    }

    /// Registers the calling thread with the runtime. Instrumented code calls
    /// the hooks on the returned handle; dropping it publishes the thread's
    /// stats snapshot.
    pub fn register_thread(self: &Arc<Self>) -> ThreadHandle<B, R> {
        let tag = self.next_thread_tag.fetch_add(1, Ordering::Relaxed);
        ThreadHandle {
            mgr: Arc::clone(self),
            tag,
            depth: 0,
            cl_set: CacheLineSet::new(),
            cur: None,
            stats: Stats::new(),
        }
    }

    /// Drains the flush forwarder and prints every collected stats snapshot
    /// under the print lock.
    pub fn shutdown(&self) {
        if let Some(sink) = &self.sink {
            sink.drain();
        }
        let snapshots = self.snapshots.lock().unwrap();
        let _guard = self.print_lock.lock().unwrap();
        for (tag, stats) in snapshots.iter() {
            stats.print(*tag);
        }
    }

    fn forward(&self, addr: u64, size: usize) {
        let sink = self
            .sink
            .as_ref()
            .expect("async flush hook without a flush sink");
        sink.forward(addr, size);
    }

    // makes one just-appended log record durable
    fn flush_entry(&self, slot: *const LogEntry) {
        self.engine
            .flush_range_unconstrained(slot as u64, mem::size_of::<LogEntry>());
    }
}

/// Per-thread façade over the runtime. One handle per registered thread; the
/// instrumentation pass emits one hook call per instrumented site, always
/// with the target address first.
pub struct ThreadHandle<B: FlushBackend, R: RegionQuery> {
    mgr: Arc<LogMgr<B, R>>,
    tag: u64,
    depth: u32,
    cl_set: CacheLineSet,
    cur: Option<NonNull<CbListNode>>,
    stats: Stats,
}

impl<B: FlushBackend, R: RegionQuery> ThreadHandle<B, R> {
    pub fn thread_tag(&self) -> u64 {
        self.tag
    }

    pub fn in_critical_section(&self) -> bool {
        self.depth > 0
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Lock acquire hook: begins or nests a critical section.
    pub fn acquire(&mut self, lock_addr: u64) {
        self.depth += 1;
        self.stats.critical_section_count += 1;
        if self.depth == 1 {
            // fresh cache-line set for the section
            self.cl_set.clear();
        } else {
            self.stats.nested_critical_section_count += 1;
        }
        self.append_entry(EntryKind::Acquire, lock_addr, 0);
    }

    /// Lock release hook. On the outermost release the accumulated cache
    /// lines are flushed through the fenced path: this is the durability
    /// boundary, the section's effects are observable after a crash before
    /// control returns past this call.
    pub fn release(&mut self, lock_addr: u64) {
        assert!(self.depth > 0, "release without a matching acquire");
        self.append_entry(EntryKind::Release, lock_addr, 0);
        self.depth -= 1;
        if self.depth == 0 {
            let flush_start = Instant::now();
            self.mgr.engine.flush_cache_lines(&self.cl_set);
            self.cl_set.clear();
            let _ = self
                .stats
                .flush_duration_micros
                .increment((flush_start.elapsed().as_micros() as u64).max(1));
        }
    }

    /// Scalar store hook, `size_bits` up to 128. Widths above 64 bits split
    /// into two operations at `addr` and `addr + 8` because the log and flush
    /// paths are defined in 64-bit units. The instrumentation pass already
    /// filtered out stack-local stores.
    pub fn store(&mut self, addr: u64, size_bits: u64) {
        assert!(
            size_bits > 0 && size_bits <= 128 && size_bits % 8 == 0,
            "unsupported store width {} bits",
            size_bits
        );
        if size_bits > 64 {
            self.store_word(addr, 64);
            self.store_word(addr + 8, size_bits - 64);
        } else {
            self.store_word(addr, size_bits);
        }
    }

    fn store_word(&mut self, addr: u64, size_bits: u64) {
        let size_bytes = (size_bits / 8) as usize;
        // stores outside any open persistent region need no crash protection
        if !self.mgr.engine.region().is_in_open_region(addr, size_bytes) {
            if self.in_critical_section() {
                self.stats.unlogged_critical_store_count += 1;
            } else {
                self.stats.unlogged_store_count += 1;
            }
            return;
        }
        if self.in_critical_section() {
            self.stats.logged_store_count += 1;
            self.stats.critical_logged_store_count += 1;
            self.append_entry(EntryKind::Store, addr, size_bits);
            // batched into the single fenced flush at the outermost release
            self.cl_set.collect(addr, size_bytes);
        } else {
            self.elide_or_log(EntryKind::Store, addr, size_bits);
            self.flush_by_policy(addr, size_bytes);
        }
    }

    /// Bulk memory operation hooks: log the destination range.
    pub fn memcpy(&mut self, dest: u64, size: usize) {
        self.mem_op(EntryKind::Memcpy, dest, size);
    }

    pub fn memmove(&mut self, dest: u64, size: usize) {
        self.mem_op(EntryKind::Memmove, dest, size);
    }

    pub fn memset(&mut self, dest: u64, size: usize) {
        self.mem_op(EntryKind::Memset, dest, size);
    }

    /// String copy hook. `len` must come from [`string_len`] on `dest`,
    /// queried before the underlying libc call runs; the instrumentation pass
    /// guarantees that ordering by emission order.
    pub fn strcpy(&mut self, dest: u64, len: usize) {
        self.mem_op(EntryKind::Strcpy, dest, len);
    }

    /// String concat hook, same length-query precondition as [`strcpy`].
    ///
    /// [`strcpy`]: Self::strcpy
    pub fn strcat(&mut self, dest: u64, len: usize) {
        self.mem_op(EntryKind::Strcat, dest, len);
    }

    fn mem_op(&mut self, kind: EntryKind, dest: u64, size: usize) {
        if size == 0 {
            return;
        }
        if !self.mgr.engine.region().is_in_open_region(dest, size) {
            if self.in_critical_section() {
                self.stats.unlogged_critical_store_count += 1;
            } else {
                self.stats.unlogged_store_count += 1;
            }
            return;
        }
        if self.in_critical_section() {
            self.stats.logged_store_count += 1;
            self.stats.critical_logged_store_count += 1;
            self.append_entry(kind, dest, size as u64);
            self.cl_set.collect(dest, size);
        } else {
            self.elide_or_log(kind, dest, size as u64);
            self.flush_by_policy(dest, size);
        }
    }

    // Log elision outside critical sections: under the immediate policy the
    // store's own barrier makes it durable and the log record is elided.
    // Under the deferred policy the flush may lag, so elision fails and the
    // store is logged anyway.
    fn elide_or_log(&mut self, kind: EntryKind, addr: u64, size: u64) {
        match self.mgr.policy {
            FlushPolicy::Immediate => {
                self.stats.unlogged_store_count += 1;
            }
            FlushPolicy::Deferred => {
                self.stats.log_elision_fail_count += 1;
                self.stats.logged_store_count += 1;
                self.append_entry(kind, addr, size);
            }
        }
    }

    fn flush_by_policy(&mut self, addr: u64, size: usize) {
        match self.mgr.policy {
            FlushPolicy::Immediate => self.barrier_range(addr, size),
            FlushPolicy::Deferred => self.mgr.forward(addr, size),
        }
    }

    /// Barrier hook of the immediate policy: fence + flush of the line
    /// containing `addr`.
    pub fn barrier(&mut self, addr: u64) {
        self.barrier_range(addr, 1);
    }

    fn barrier_range(&mut self, addr: u64, size: usize) {
        let mut set = CacheLineSet::new();
        set.collect(addr, size);
        self.mgr.engine.flush_cache_lines(&set);
    }

    /// Async flush hook of the deferred policy: hand the line containing
    /// `addr` to the forwarder.
    pub fn async_flush(&mut self, addr: u64) {
        self.mgr.forward(addr, 1);
    }

    /// Async flush hook for memory operations under the deferred policy.
    pub fn async_mem_op_flush(&mut self, addr: u64, size: usize) {
        self.mgr.forward(addr, size);
    }

    fn append_entry(&mut self, kind: EntryKind, addr: u64, size: u64) {
        let entry = LogEntry::new(kind, addr, size);
        loop {
            let node = match self.cur {
                // SAFETY: nodes live as long as the runtime the handle holds
                Some(node) => unsafe { node.as_ref() },
                None => {
                    self.rotate_buffer();
                    continue;
                }
            };
            match node.cb().try_append(entry) {
                Some(slot) => {
                    // the log record itself has to be durable before the
                    // data it describes is flushed
                    self.mgr.flush_entry(slot);
                    self.stats.num_log_flushes += 1;
                    return;
                }
                None => {
                    log::debug!("thread {} filled its log buffer, rotating", self.tag);
                    self.rotate_buffer();
                }
            }
        }
    }

    fn rotate_buffer(&mut self) {
        let (node, fresh) = self
            .mgr
            .buffers
            .acquire_buffer(self.tag)
            .expect("failed to map log buffer storage");
        if fresh {
            self.stats.log_mem_use += self.mgr.buffers.buffer_bytes() as u64;
        }
        self.cur = Some(NonNull::from(node));
    }

    /// Dumps this thread's counters under the runtime's print lock.
    pub fn print_stats(&mut self) {
        self.stats.num_flushes = cache_flush::backend::flush_count();
        let _guard = self.mgr.print_lock.lock().unwrap();
        self.stats.print(self.tag);
    }
}

impl<B: FlushBackend, R: RegionQuery> Drop for ThreadHandle<B, R> {
    fn drop(&mut self) {
        if self.depth != 0 {
            log::warn!("thread {} dropped inside a critical section", self.tag);
        }
        let mut stats = mem::take(&mut self.stats);
        stats.num_flushes = cache_flush::backend::flush_count();
        self.mgr.snapshots.lock().unwrap().push((self.tag, stats));
        if let Some(node) = self.cur {
            // SAFETY: nodes live as long as the runtime the handle holds
            let node = unsafe { node.as_ref() };
            // no more appends from this thread; reusable once drained
            node.cb().seal();
            node.release_if_empty();
        }
    }
}

/// Length-query hook for the string operation hooks: byte length of the
/// NUL-terminated string at `dest`. Must be called before the underlying
/// string operation mutates `dest`; the hook contract relies on the
/// instrumentation pass emitting the calls in that order.
///
/// # Safety
/// `dest` must point to a valid NUL-terminated string.
pub unsafe fn string_len(dest: *const u8) -> usize {
    let mut len = 0usize;
    while *dest.add(len) != 0 {
        len += 1;
    }
    len
}
