use log_mgr::{string_len, Config, FlushPolicy, LogMgr};
use cache_flush::backend::FlushEvent;
use cache_flush::{CACHE_LINE_MASK, CACHE_LINE_SIZE};
use cb_log::EntryKind;
use test_utils::collecting_log_mgr;

// entries currently sitting in the runtime's buffers, oldest first
fn drain_entries<B, R>(mgr: &LogMgr<B, R>) -> Vec<cb_log::LogEntry>
where
    B: cache_flush::backend::FlushBackend,
    R: cache_flush::region::RegionQuery,
{
    let mut entries = vec![];
    for node in mgr.buffer_list().iter() {
        while let Some(entry) = node.cb().retire_one() {
            assert!(entry.checksum_ok());
            entries.push(entry);
        }
    }
    entries
}

#[test]
fn critical_section_batches_into_one_fenced_flush() {
    let (mgr, backend, _sink) = collecting_log_mgr(FlushPolicy::Immediate);
    let mut handle = mgr.register_thread();

    let data = vec![0u8; 256];
    let lock = 0usize;
    let lock_addr = &lock as *const _ as u64;
    let a = data.as_ptr() as u64;
    let b = a + 128;

    handle.acquire(lock_addr);
    backend.clear(); // entry flushes of the acquire marker are not under test
    handle.store(a, 32);
    handle.store(b, 128);
    assert_eq!(backend.fences(), 0, "in-section stores must not fence");
    handle.release(lock_addr);

    // exactly one leading and one trailing fence for the section flush
    let events = backend.events();
    let fences: Vec<usize> = events
        .iter()
        .enumerate()
        .filter_map(|(i, e)| matches!(e, FlushEvent::Fence).then_some(i))
        .collect();
    assert_eq!(fences.len(), 2);

    // the fenced set covers the lines of both stores
    let flushed: Vec<u64> = events[fences[0] + 1..fences[1]]
        .iter()
        .map(|e| match e {
            FlushEvent::Line(addr) => *addr,
            FlushEvent::Fence => unreachable!(),
        })
        .collect();
    let mut expected = cache_flush::CacheLineSet::new();
    expected.collect(a, 4);
    expected.collect(b, 16);
    assert_eq!(flushed.len(), expected.len());
    for line in &flushed {
        assert!(expected.contains(*line), "unexpected line {line:#x}");
    }

    // log trace: acquire, store(a,32), store(b,64), store(b+8,64), release
    let entries = drain_entries(&mgr);
    let kinds: Vec<_> = entries.iter().map(|e| e.kind().unwrap()).collect();
    assert_eq!(
        kinds,
        vec![
            EntryKind::Acquire,
            EntryKind::Store,
            EntryKind::Store,
            EntryKind::Store,
            EntryKind::Release,
        ]
    );
    assert_eq!((entries[1].addr, entries[1].size), (a, 32));
    assert_eq!((entries[2].addr, entries[2].size), (b, 64));
    assert_eq!((entries[3].addr, entries[3].size), (b + 8, 64));
}

#[test]
fn wide_store_sizes_sum_to_the_original_width() {
    let (mgr, _backend, _sink) = collecting_log_mgr(FlushPolicy::Immediate);
    let mut handle = mgr.register_thread();
    let data = vec![0u8; 64];
    let addr = data.as_ptr() as u64;

    handle.acquire(0x10);
    handle.store(addr, 96);
    handle.release(0x10);

    let entries = drain_entries(&mgr);
    let stores: Vec<_> = entries
        .iter()
        .filter(|e| e.kind() == Some(EntryKind::Store))
        .collect();
    assert_eq!(stores.len(), 2);
    assert_eq!(stores[0].addr, addr);
    assert_eq!(stores[1].addr, addr + 8);
    assert_eq!(stores[0].size + stores[1].size, 96);
}

#[test]
fn only_the_outermost_release_flushes() {
    let (mgr, backend, _sink) = collecting_log_mgr(FlushPolicy::Immediate);
    let mut handle = mgr.register_thread();
    let data = vec![0u8; 64];
    let addr = data.as_ptr() as u64;

    handle.acquire(0x10);
    handle.acquire(0x20);
    backend.clear();
    handle.store(addr, 64);
    handle.release(0x20);
    assert_eq!(backend.fences(), 0, "inner release must not flush");
    handle.release(0x10);
    assert_eq!(backend.fences(), 2);

    assert_eq!(handle.stats().critical_section_count, 2);
    assert_eq!(handle.stats().nested_critical_section_count, 1);
}

#[test]
fn immediate_policy_elides_logging_outside_sections() {
    let (mgr, backend, _sink) = collecting_log_mgr(FlushPolicy::Immediate);
    let mut handle = mgr.register_thread();
    let data = vec![0u8; 128];
    // line-aligned so the 8-byte store touches exactly one line
    let addr = (data.as_ptr() as u64 + 63) & CACHE_LINE_MASK;

    handle.store(addr, 64);

    // elided from the log but flushed through the fenced path
    assert!(drain_entries(&mgr).is_empty());
    assert_eq!(backend.fences(), 2);
    assert_eq!(backend.lines(), vec![addr]);
    assert_eq!(handle.stats().unlogged_store_count, 1);
    assert_eq!(handle.stats().logged_store_count, 0);
}

#[test]
fn deferred_policy_logs_and_forwards_outside_sections() {
    let (mgr, backend, sink) = collecting_log_mgr(FlushPolicy::Deferred);
    let mut handle = mgr.register_thread();
    let data = vec![0u8; 64];
    let addr = data.as_ptr() as u64;

    handle.store(addr, 64);

    assert_eq!(backend.fences(), 0, "deferred stores must not fence inline");
    assert_eq!(sink.ranges(), vec![(addr, 8)]);
    let entries = drain_entries(&mgr);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind(), Some(EntryKind::Store));
    assert_eq!(handle.stats().log_elision_fail_count, 1);
}

#[test]
fn async_hooks_forward_to_the_sink() {
    let (mgr, _backend, sink) = collecting_log_mgr(FlushPolicy::Deferred);
    let mut handle = mgr.register_thread();

    handle.async_flush(0x1000);
    handle.async_mem_op_flush(0x2000, 256);
    assert_eq!(sink.ranges(), vec![(0x1000, 1), (0x2000, 256)]);
}

#[test]
fn mem_ops_log_the_destination_range() {
    let (mgr, _backend, _sink) = collecting_log_mgr(FlushPolicy::Immediate);
    let mut handle = mgr.register_thread();
    let data = vec![0u8; 512];
    let dest = data.as_ptr() as u64;

    handle.acquire(0x10);
    handle.memcpy(dest, 200);
    handle.memset(dest + 256, 100);
    handle.release(0x10);

    let entries = drain_entries(&mgr);
    assert_eq!(entries[1].kind(), Some(EntryKind::Memcpy));
    assert_eq!((entries[1].addr, entries[1].size), (dest, 200));
    assert_eq!(entries[2].kind(), Some(EntryKind::Memset));
    assert_eq!((entries[2].addr, entries[2].size), (dest + 256, 100));
}

#[test]
fn memmove_and_strcpy_log_the_destination_range() {
    let (mgr, _backend, _sink) = collecting_log_mgr(FlushPolicy::Immediate);
    let mut handle = mgr.register_thread();
    let data = vec![0u8; 256];
    let dest = data.as_ptr() as u64;

    handle.acquire(0x10);
    handle.memmove(dest, 48);
    handle.strcpy(dest + 128, 12);
    handle.release(0x10);

    let entries = drain_entries(&mgr);
    assert_eq!(entries[1].kind(), Some(EntryKind::Memmove));
    assert_eq!((entries[1].addr, entries[1].size), (dest, 48));
    assert_eq!(entries[2].kind(), Some(EntryKind::Strcpy));
    assert_eq!((entries[2].addr, entries[2].size), (dest + 128, 12));
}

#[test]
fn strcat_logs_the_pre_concat_length() {
    let (mgr, _backend, _sink) = collecting_log_mgr(FlushPolicy::Immediate);
    let mut handle = mgr.register_thread();

    let mut dst = vec![0u8; 64];
    dst[..5].copy_from_slice(b"hello");
    let dst_addr = dst.as_ptr() as u64;

    handle.acquire(0x10);
    // emission order of the instrumentation pass: length query first,
    // then the log hook, then the concat itself
    let len = unsafe { string_len(dst.as_ptr()) };
    assert_eq!(len, 5);
    handle.strcat(dst_addr, len);
    dst[5..11].copy_from_slice(b"world\0");
    handle.release(0x10);

    let entries = drain_entries(&mgr);
    let strcat = entries
        .iter()
        .find(|e| e.kind() == Some(EntryKind::Strcat))
        .unwrap();
    // the logged length is the destination length before the concat ran
    assert_eq!(strcat.size, 5);
    assert_eq!(strcat.addr, dst_addr);
}

#[test]
fn buffer_rotation_keeps_appending_past_one_buffer() {
    let backend = cache_flush::backend::Collect::default();
    let mut config = Config::new();
    config.slots_per_buffer = 4; // 3 live entries per buffer
    let mgr = LogMgr::with_parts(
        config,
        backend,
        cache_flush::region::AlwaysOpen,
        None,
    )
    .unwrap();
    let mut handle = mgr.register_thread();
    let data = vec![0u8; 1024];
    let base = data.as_ptr() as u64;

    handle.acquire(0x10);
    for i in 0..20u64 {
        handle.store(base + i * 8, 64);
    }
    handle.release(0x10);

    assert!(mgr.buffer_list().len() > 1);
    let entries = drain_entries(&mgr);
    // acquire + 20 stores + release
    assert_eq!(entries.len(), 22);
    assert_eq!(handle.stats().log_entry_total(), 22);
    assert!(handle.stats().log_mem_use > 0);
}

#[test]
fn region_query_gates_logging_of_stores() {
    struct OpenBelow(u64);
    impl cache_flush::region::RegionQuery for OpenBelow {
        fn is_in_open_region(&self, addr: u64, _len: usize) -> bool {
            addr < self.0
        }
    }

    let backend = cache_flush::backend::Collect::default();
    let mgr = LogMgr::with_parts(Config::new(), backend, OpenBelow(0x10000), None).unwrap();
    let mut handle = mgr.register_thread();

    handle.acquire(0x10);
    handle.store(0x1000, 64); // in an open region, logged
    handle.store(0x20000, 64); // outside, unlogged
    handle.release(0x10);

    assert_eq!(handle.stats().critical_logged_store_count, 1);
    assert_eq!(handle.stats().unlogged_critical_store_count, 1);
}

#[test]
fn lines_are_cache_line_sized() {
    // keep the constant wired through the public surface
    assert_eq!(CACHE_LINE_SIZE, 64);
}
